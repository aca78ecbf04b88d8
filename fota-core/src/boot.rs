//! Boot selection: pick the newest slot whose image still verifies and hand its
//! vector table to the platform. When nothing verifies the caller falls back to
//! network recovery.

use tracing::{info, warn};

use crate::flash::{Flash, OtaMetadata, SlotError, SlotManager};

/// Offset of the reset vector inside an image's vector table.
pub const RESET_VECTOR_OFFSET: u32 = 0x4;

/// A verified slot ready to boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootTarget {
    pub slot: u8,
    /// Address of the image's vector table.
    pub address: u32,
    pub metadata: OtaMetadata,
}

impl BootTarget {
    /// Where the reset handler's address is stored.
    pub fn reset_vector(&self) -> u32 {
        self.address + RESET_VECTOR_OFFSET
    }
}

/// Platform hook that transfers control to an image.
pub trait ImageLauncher {
    /// Load the stack pointer from `vector_table` and branch to its reset vector.
    /// Only returns if the platform cannot jump.
    ///
    /// # Safety
    /// `vector_table` must point at the vector table of an image that passed verification.
    unsafe fn jump_to(&mut self, vector_table: u32) -> Result<(), BootError>;
}

/// Newest slot whose crc still matches. A slot that fails verification is marked
/// invalid by the verification itself, so the next-newest is tried.
pub fn select_boot_slot<F: Flash>(slots: &mut SlotManager<F>) -> Result<BootTarget, BootError> {
    let attempts = slots.layout().slot_count();
    for _ in 0..attempts {
        let Some(slot) = slots.find_newest()? else {
            break;
        };
        let verification = match slots.verify(slot) {
            Ok(v) => v,
            Err(e @ (SlotError::ImageTooLarge { .. } | SlotError::Empty(_))) => {
                warn!(slot, error = %e, "slot metadata unusable, trying the next one");
                slots.invalidate(slot)?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if verification.passed() {
            let address = slots.boot_address(slot)?;
            info!(slot, version = verification.metadata.version, "booting slot");
            return Ok(BootTarget {
                slot,
                address,
                metadata: verification.metadata,
            });
        }
        warn!(slot, "newest slot failed verification, trying the next one");
    }
    Err(BootError::NoBootableSlot)
}

/// Select a slot and jump to it.
pub fn boot<F: Flash, L: ImageLauncher>(
    slots: &mut SlotManager<F>,
    launcher: &mut L,
) -> Result<BootTarget, BootError> {
    let target = select_boot_slot(slots)?;
    // SAFETY: select_boot_slot only returns slots whose image crc was just recomputed and matched.
    unsafe { launcher.jump_to(target.address)? };
    Ok(target)
}

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("no slot holds a verified image")]
    NoBootableSlot,
    #[error("jump to {0:#010x} failed")]
    JumpFailed(u32),
    #[error(transparent)]
    Slot(#[from] SlotError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashGeometry, MemFlash, SlotLayout};

    fn manager() -> SlotManager<MemFlash> {
        let layout = SlotLayout {
            flash: FlashGeometry {
                base_address: 0x0800_0000,
                page_size: 512,
                page_count: 6,
            },
            slot_pages: 2,
            slot_first_pages: vec![0, 2, 4],
        };
        SlotManager::new(MemFlash::new(layout.flash), layout).unwrap()
    }

    fn deploy(mgr: &mut SlotManager<MemFlash>, slot: u8, version: u16) {
        let image: Vec<u8> = (0..300u32).map(|i| (i as u16 + version) as u8).collect();
        let m = OtaMetadata::for_image(&image, version, 1, true).unwrap();
        mgr.install(slot, &m, &image).unwrap();
    }

    #[derive(Default)]
    struct Recorder {
        jumped: Vec<u32>,
    }

    impl ImageLauncher for Recorder {
        unsafe fn jump_to(&mut self, vector_table: u32) -> Result<(), BootError> {
            self.jumped.push(vector_table);
            Ok(())
        }
    }

    #[test]
    fn boots_newest_verified_slot() {
        let mut mgr = manager();
        deploy(&mut mgr, 1, 1);
        deploy(&mut mgr, 3, 4);
        let mut launcher = Recorder::default();
        let target = boot(&mut mgr, &mut launcher).unwrap();
        assert_eq!(target.slot, 3);
        assert_eq!(target.address, 0x0800_0800 + 0x100);
        assert_eq!(target.reset_vector(), target.address + 4);
        assert_eq!(launcher.jumped, vec![target.address]);
    }

    #[test]
    fn corrupt_newest_falls_back() {
        let mut mgr = manager();
        deploy(&mut mgr, 1, 1);
        deploy(&mut mgr, 2, 9);
        let addr = mgr.boot_address(2).unwrap() + 100;
        mgr.flash_mut().poke(addr, &[0xEE, 0xEE]).unwrap();
        let target = select_boot_slot(&mut mgr).unwrap();
        assert_eq!(target.slot, 1);
    }

    #[test]
    fn unreadable_size_falls_back() {
        let mut mgr = manager();
        deploy(&mut mgr, 1, 1);
        deploy(&mut mgr, 2, 9);
        // crc and shadow still agree, but the size runs past the slot
        let size_field = mgr.layout().slot_address(2).unwrap() + 4;
        mgr.flash_mut()
            .poke(size_field, &0x00FF_0000u32.to_le_bytes())
            .unwrap();
        assert!(mgr.metadata_of(2).unwrap().is_valid());

        let target = select_boot_slot(&mut mgr).unwrap();
        assert_eq!(target.slot, 1);
        assert!(!mgr.metadata_of(2).unwrap().is_valid());
    }

    #[test]
    fn nothing_to_boot() {
        let mut mgr = manager();
        let mut launcher = Recorder::default();
        assert!(matches!(
            boot(&mut mgr, &mut launcher),
            Err(BootError::NoBootableSlot)
        ));
        assert!(launcher.jumped.is_empty());

        deploy(&mut mgr, 2, 3);
        let addr = mgr.boot_address(2).unwrap();
        mgr.flash_mut().poke(addr, &[0x00]).unwrap();
        assert!(matches!(
            select_boot_slot(&mut mgr),
            Err(BootError::NoBootableSlot)
        ));
    }
}
