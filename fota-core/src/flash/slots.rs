//! OTA slots: fixed flash regions, each holding a metadata record and one image.
//! Slots are numbered from 1; slot 0 stands for the golden image and is never touched.

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::metadata::{OtaMetadata, METADATA_LENGTH, OTA_METADATA_SPACE};
use super::{Flash, FlashError, FlashGeometry};
use crate::integrity::{self, ImageCrc};

/// Where the slots live. Loadable from TOML:
///
/// ```toml
/// slot_pages = 120
/// slot_first_pages = [8, 128]
///
/// [flash]
/// base_address = 0x08000000
/// page_size = 2048
/// page_count = 256
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotLayout {
    pub flash: FlashGeometry,
    /// Pages spanned by every slot.
    pub slot_pages: u32,
    /// First page of slot `n` is `slot_first_pages[n - 1]`.
    pub slot_first_pages: Vec<u32>,
}

impl SlotLayout {
    /// STM32F1 high-density part: 2 KiB pages, slots at 0x0800_4000 and 0x0804_0000.
    pub fn stm32f1() -> Self {
        Self {
            flash: FlashGeometry {
                base_address: 0x0800_0000,
                page_size: 2048,
                page_count: 256,
            },
            slot_pages: 120,
            slot_first_pages: vec![8, 128],
        }
    }

    pub fn slot_count(&self) -> u8 {
        // validate() bounds the table to u8::MAX entries
        self.slot_first_pages.len() as u8
    }

    pub fn slots(&self) -> impl Iterator<Item = u8> {
        1..=self.slot_count()
    }

    /// Bytes per slot, metadata region included.
    pub fn slot_size(&self) -> u32 {
        self.slot_pages * self.flash.page_size
    }

    /// Largest image a slot holds.
    pub fn image_capacity(&self) -> u32 {
        self.slot_size() - OTA_METADATA_SPACE
    }

    pub fn first_page(&self, slot: u8) -> Result<u32, SlotError> {
        if slot == 0 {
            return Err(self.invalid(slot));
        }
        self.slot_first_pages
            .get(usize::from(slot) - 1)
            .copied()
            .ok_or_else(|| self.invalid(slot))
    }

    /// Address of the slot's metadata record.
    pub fn slot_address(&self, slot: u8) -> Result<u32, SlotError> {
        Ok(self.flash.page_address(self.first_page(slot)?))
    }

    /// Address of the image's vector table.
    pub fn boot_address(&self, slot: u8) -> Result<u32, SlotError> {
        Ok(self.slot_address(slot)? + OTA_METADATA_SPACE)
    }

    fn invalid(&self, slot: u8) -> SlotError {
        SlotError::InvalidSlot {
            slot,
            count: self.slot_count(),
        }
    }

    /// Slots must fit in flash, not overlap, and leave room for an image.
    pub fn validate(&self) -> Result<(), SlotError> {
        let fail = |why: String| Err(SlotError::Layout(why));
        if self.slot_first_pages.is_empty() || self.slot_first_pages.len() > usize::from(u8::MAX) {
            return fail(format!("{} slots", self.slot_first_pages.len()));
        }
        if self.flash.page_size == 0 || (self.flash.page_size as usize) < METADATA_LENGTH {
            return fail(format!("page size {}", self.flash.page_size));
        }
        if u64::from(self.flash.base_address) + self.flash.size() > u64::from(u32::MAX) {
            return fail(format!(
                "{} bytes of flash at {:#010x} do not fit the address space",
                self.flash.size(),
                self.flash.base_address
            ));
        }
        if u64::from(self.slot_pages) * u64::from(self.flash.page_size)
            <= u64::from(OTA_METADATA_SPACE)
        {
            return fail(format!("{} pages per slot leave no room for an image", self.slot_pages));
        }
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for &first in &self.slot_first_pages {
            let end = first.checked_add(self.slot_pages).unwrap_or(u32::MAX);
            if end > self.flash.page_count {
                return fail(format!("slot at page {first} runs past the end of flash"));
            }
            if ranges.iter().any(|&(s, e)| first < e && s < end) {
                return fail(format!("slot at page {first} overlaps another slot"));
            }
            ranges.push((first, end));
        }
        Ok(())
    }
}

impl Default for SlotLayout {
    fn default() -> Self {
        Self::stm32f1()
    }
}

/// Outcome of recomputing a slot's image crc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    /// Metadata as persisted after the check (shadow updated).
    pub metadata: OtaMetadata,
    pub computed: u16,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.metadata.crc == self.computed
    }
}

/// Reads, verifies, selects, erases and programs slots on a `Flash`.
pub struct SlotManager<F> {
    flash: F,
    layout: SlotLayout,
}

impl<F: Flash> SlotManager<F> {
    pub fn new(flash: F, layout: SlotLayout) -> Result<Self, SlotError> {
        layout.validate()?;
        if layout.flash != flash.geometry() {
            return Err(SlotError::Layout(format!(
                "layout expects {:?}, flash is {:?}",
                layout.flash,
                flash.geometry()
            )));
        }
        Ok(Self { flash, layout })
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    pub fn metadata_of(&mut self, slot: u8) -> Result<OtaMetadata, SlotError> {
        let address = self.layout.slot_address(slot)?;
        let mut bytes = [0u8; METADATA_LENGTH];
        self.flash.read(address, &mut bytes)?;
        Ok(OtaMetadata::from_bytes(&bytes))
    }

    /// Every slot with its metadata, in slot order.
    pub fn list(&mut self) -> Result<Vec<(u8, OtaMetadata)>, SlotError> {
        let slots: Vec<u8> = self.layout.slots().collect();
        slots
            .into_iter()
            .map(|slot| Ok((slot, self.metadata_of(slot)?)))
            .collect()
    }

    /// Crc of the image described by `metadata`, read from flash a page at a time.
    pub fn recompute_crc(&mut self, slot: u8, metadata: &OtaMetadata) -> Result<u16, SlotError> {
        let covered = integrity::covered_len(metadata.size as usize);
        let capacity = self.layout.image_capacity();
        if covered > capacity as usize {
            return Err(SlotError::ImageTooLarge {
                slot,
                size: u64::from(metadata.size),
                capacity,
            });
        }
        let mut address = self.layout.boot_address(slot)?;
        let mut remaining = covered;
        let mut crc = ImageCrc::new();
        let mut buf = vec![0u8; self.layout.flash.page_size as usize];
        while remaining > 0 {
            let n = remaining.min(buf.len());
            self.flash.read(address, &mut buf[..n])?;
            crc.update(&buf[..n]);
            address += n as u32;
            remaining -= n;
        }
        Ok(crc.finalize())
    }

    /// Recompute the image crc and persist it as the shadow crc.
    pub fn verify(&mut self, slot: u8) -> Result<Verification, SlotError> {
        let mut metadata = self.metadata_of(slot)?;
        if metadata.is_erased() {
            return Err(SlotError::Empty(slot));
        }
        let computed = self.recompute_crc(slot, &metadata)?;
        if metadata.crc_shadow != computed {
            metadata.crc_shadow = computed;
            self.rewrite_metadata(slot, &metadata)?;
        }
        let verification = Verification { metadata, computed };
        if verification.passed() {
            info!(slot, crc = computed, "slot verified");
        } else {
            warn!(slot, stored = metadata.crc, computed, "slot crc mismatch");
        }
        Ok(verification)
    }

    /// Persist a shadow crc that cannot match, so the slot stops counting as valid.
    pub fn invalidate(&mut self, slot: u8) -> Result<(), SlotError> {
        let mut metadata = self.metadata_of(slot)?;
        if !metadata.is_valid() {
            return Ok(());
        }
        metadata.crc_shadow = !metadata.crc;
        warn!(slot, "slot invalidated");
        self.rewrite_metadata(slot, &metadata)
    }

    fn rewrite_metadata(&mut self, slot: u8, metadata: &OtaMetadata) -> Result<(), SlotError> {
        let page = self.layout.first_page(slot)?;
        let mut contents = vec![0u8; self.layout.flash.page_size as usize];
        self.flash
            .read(self.layout.flash.page_address(page), &mut contents)?;
        contents[..METADATA_LENGTH].copy_from_slice(&metadata.to_bytes());
        self.flash.write_page(page, &contents)?;
        Ok(())
    }

    fn valid_slots(&mut self) -> Result<Vec<(u8, OtaMetadata)>, SlotError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|(_, m)| m.is_valid())
            .collect())
    }

    /// Valid slot with the strictly greatest version; ties keep the lower slot.
    pub fn find_newest(&mut self) -> Result<Option<u8>, SlotError> {
        let mut newest: Option<(u8, u16)> = None;
        for (slot, m) in self.valid_slots()? {
            if newest.map_or(true, |(_, v)| m.version > v) {
                newest = Some((slot, m.version));
            }
        }
        debug!(?newest, "newest slot");
        Ok(newest.map(|(slot, _)| slot))
    }

    /// Valid slot with the smallest version; slot 1 when none is valid.
    pub fn find_oldest(&mut self) -> Result<u8, SlotError> {
        let mut oldest: Option<(u8, u16)> = None;
        for (slot, m) in self.valid_slots()? {
            if oldest.map_or(true, |(_, v)| m.version < v) {
                oldest = Some((slot, m.version));
            }
        }
        debug!(?oldest, "oldest slot");
        Ok(oldest.map_or(1, |(slot, _)| slot))
    }

    pub fn find_matching(&mut self, version: u16) -> Result<Option<u8>, SlotError> {
        Ok(self
            .valid_slots()?
            .into_iter()
            .find(|(_, m)| m.version == version)
            .map(|(slot, _)| slot))
    }

    /// First slot without a valid image, else the oldest one.
    pub fn find_empty_or_oldest(&mut self) -> Result<u8, SlotError> {
        for (slot, m) in self.list()? {
            if !m.is_valid() {
                return Ok(slot);
            }
        }
        self.find_oldest()
    }

    /// Erase every page of the slot. Irreversible.
    pub fn erase(&mut self, slot: u8) -> Result<(), SlotError> {
        let first = self.layout.first_page(slot)?;
        info!(
            slot,
            address = %format!("{:#010x}", self.layout.flash.page_address(first)),
            pages = self.layout.slot_pages,
            "erasing slot"
        );
        for page in first..first + self.layout.slot_pages {
            self.flash.erase_page(page)?;
        }
        Ok(())
    }

    pub fn boot_address(&self, slot: u8) -> Result<u32, SlotError> {
        self.layout.boot_address(slot)
    }

    /// Erase the slot, then program `bytes` (metadata region followed by the image)
    /// page by page. A failed page is reported as is; nothing is retried.
    pub fn write_slot_image(&mut self, slot: u8, bytes: &[u8]) -> Result<(), SlotError> {
        let first = self.layout.first_page(slot)?;
        let capacity = self.layout.slot_size();
        if bytes.len() as u64 > u64::from(capacity) {
            return Err(SlotError::ImageTooLarge {
                slot,
                size: bytes.len() as u64,
                capacity,
            });
        }
        self.erase(slot)?;
        for (i, piece) in bytes
            .chunks(self.layout.flash.page_size as usize)
            .enumerate()
        {
            self.flash.write_page(first + i as u32, piece)?;
        }
        info!(slot, len = bytes.len(), "slot programmed");
        Ok(())
    }

    /// Program `image` with its metadata record into `slot`.
    pub fn install(
        &mut self,
        slot: u8,
        metadata: &OtaMetadata,
        image: &[u8],
    ) -> Result<(), SlotError> {
        let mut bytes = metadata.to_blob();
        bytes.extend_from_slice(image);
        self.write_slot_image(slot, &bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("slot {slot} does not exist, valid slots are 1..={count}")]
    InvalidSlot { slot: u8, count: u8 },
    #[error("slot {0} is empty")]
    Empty(u8),
    #[error("{size} bytes do not fit slot {slot} ({capacity} bytes)")]
    ImageTooLarge { slot: u8, size: u64, capacity: u32 },
    #[error("bad slot layout: {0}")]
    Layout(String),
    #[error(transparent)]
    Flash(#[from] FlashError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;

    /// Four slots of two 256-byte pages.
    fn small_layout() -> SlotLayout {
        SlotLayout {
            flash: FlashGeometry {
                base_address: 0x2000_0000,
                page_size: 256,
                page_count: 8,
            },
            slot_pages: 2,
            slot_first_pages: vec![0, 2, 4, 6],
        }
    }

    fn manager() -> SlotManager<MemFlash> {
        let layout = small_layout();
        SlotManager::new(MemFlash::new(layout.flash), layout).unwrap()
    }

    fn image(version: u16) -> Vec<u8> {
        (0..200u32).map(|i| (i as u16 ^ version) as u8).collect()
    }

    fn deploy(mgr: &mut SlotManager<MemFlash>, slot: u8, version: u16) {
        let img = image(version);
        let m = OtaMetadata::for_image(&img, version, 0xABCD, true).unwrap();
        mgr.install(slot, &m, &img).unwrap();
    }

    #[test]
    fn newest_and_oldest_skip_erased() {
        let mut mgr = manager();
        deploy(&mut mgr, 2, 3);
        deploy(&mut mgr, 3, 7);
        deploy(&mut mgr, 4, 2);
        assert_eq!(mgr.find_newest().unwrap(), Some(3));
        assert_eq!(mgr.find_oldest().unwrap(), 4);
        assert_eq!(mgr.find_matching(3).unwrap(), Some(2));
        assert_eq!(mgr.find_matching(5).unwrap(), None);
        assert_eq!(mgr.find_empty_or_oldest().unwrap(), 1);
    }

    #[test]
    fn ties_keep_first_slot() {
        let mut mgr = manager();
        deploy(&mut mgr, 2, 5);
        deploy(&mut mgr, 4, 5);
        assert_eq!(mgr.find_newest().unwrap(), Some(2));
        assert_eq!(mgr.find_oldest().unwrap(), 2);
    }

    #[test]
    fn empty_flash_fallbacks() {
        let mut mgr = manager();
        assert_eq!(mgr.find_newest().unwrap(), None);
        assert_eq!(mgr.find_oldest().unwrap(), 1);
        assert_eq!(mgr.find_empty_or_oldest().unwrap(), 1);
        assert!(matches!(mgr.verify(1), Err(SlotError::Empty(1))));
    }

    #[test]
    fn full_flash_reuses_oldest() {
        let mut mgr = manager();
        for (slot, version) in [(1, 9), (2, 4), (3, 6), (4, 8)] {
            deploy(&mut mgr, slot, version);
        }
        assert_eq!(mgr.find_empty_or_oldest().unwrap(), 2);
    }

    #[test]
    fn verify_persists_shadow() {
        let mut mgr = manager();
        let img = image(1);
        let pending = OtaMetadata::for_image(&img, 1, 7, false).unwrap();
        mgr.install(1, &pending, &img).unwrap();
        assert!(!mgr.metadata_of(1).unwrap().is_valid());

        let v = mgr.verify(1).unwrap();
        assert!(v.passed());
        assert_eq!(v.computed, pending.crc);
        let stored = mgr.metadata_of(1).unwrap();
        assert!(stored.is_valid());
        // image bytes in the metadata page survive the rewrite
        let mut first = [0u8; 4];
        let boot = mgr.boot_address(1).unwrap();
        mgr.flash_mut().read(boot, &mut first).unwrap();
        assert_eq!(&first, &img[..4]);
        assert_eq!(mgr.find_newest().unwrap(), Some(1));
    }

    #[test]
    fn corruption_invalidates_slot() {
        let mut mgr = manager();
        deploy(&mut mgr, 1, 2);
        deploy(&mut mgr, 2, 5);
        let addr = mgr.boot_address(2).unwrap() + 17;
        mgr.flash_mut().poke(addr, &[0x00]).unwrap();
        let v = mgr.verify(2).unwrap();
        assert!(!v.passed());
        assert!(!mgr.metadata_of(2).unwrap().is_valid());
        assert_eq!(mgr.find_newest().unwrap(), Some(1));
    }

    #[test]
    fn flash_past_address_space_is_rejected() {
        let mut layout = SlotLayout::stm32f1();
        layout.flash.base_address = 0xFFFF_0000;
        assert!(matches!(layout.validate(), Err(SlotError::Layout(_))));
        layout.flash.base_address = 0;
        layout.flash.page_size = 0x0100_0000;
        assert!(matches!(layout.validate(), Err(SlotError::Layout(_))));
        assert!(SlotLayout::stm32f1().validate().is_ok());
    }

    #[test]
    fn oversized_image_in_metadata_fails_closed() {
        let mut mgr = manager();
        let bogus = OtaMetadata {
            crc: 1,
            crc_shadow: 1,
            size: 10_000,
            uuid: 0,
            version: 1,
            pad: u16::MAX,
        };
        mgr.install(1, &bogus, &[]).unwrap();
        assert!(matches!(
            mgr.verify(1),
            Err(SlotError::ImageTooLarge { slot: 1, .. })
        ));
    }

    #[test]
    fn erase_clears_slot() {
        let mut mgr = manager();
        deploy(&mut mgr, 3, 1);
        mgr.erase(3).unwrap();
        assert!(mgr.metadata_of(3).unwrap().is_erased());
        assert!(matches!(
            mgr.erase(0),
            Err(SlotError::InvalidSlot { slot: 0, count: 4 })
        ));
        assert!(matches!(mgr.erase(5), Err(SlotError::InvalidSlot { .. })));
    }

    #[test]
    fn write_failure_is_reported() {
        let mut mgr = manager();
        mgr.flash_mut().fail_writes_to(5);
        let img = vec![0x5A; 200];
        let m = OtaMetadata::for_image(&img, 1, 1, true).unwrap();
        assert!(matches!(
            mgr.install(3, &m, &img),
            Err(SlotError::Flash(FlashError::WriteFailed { page: 5 }))
        ));
    }

    #[test]
    fn image_must_fit() {
        let mut mgr = manager();
        assert!(matches!(
            mgr.write_slot_image(1, &[0u8; 513]),
            Err(SlotError::ImageTooLarge { .. })
        ));
    }

    #[test]
    fn stm32f1_addresses() {
        let layout = SlotLayout::stm32f1();
        layout.validate().unwrap();
        assert_eq!(layout.slot_address(1).unwrap(), 0x0800_4000);
        assert_eq!(layout.slot_address(2).unwrap(), 0x0804_0000);
        assert_eq!(layout.boot_address(1).unwrap(), 0x0800_4100);
        assert_eq!(layout.boot_address(2).unwrap(), 0x0804_0100);
    }

    #[test]
    fn bad_layouts_rejected() {
        let mut overlapping = small_layout();
        overlapping.slot_first_pages = vec![0, 1];
        assert!(matches!(overlapping.validate(), Err(SlotError::Layout(_))));
        let mut past_end = small_layout();
        past_end.slot_first_pages = vec![7];
        assert!(matches!(past_end.validate(), Err(SlotError::Layout(_))));
        let mismatch = SlotManager::new(MemFlash::new(SlotLayout::stm32f1().flash), small_layout());
        assert!(matches!(mismatch, Err(SlotError::Layout(_))));
    }

    #[test]
    fn layout_from_toml() {
        let layout: SlotLayout = toml::from_str(
            "slot_pages = 120\nslot_first_pages = [8, 128]\n\n[flash]\nbase_address = 0x08000000\npage_size = 2048\npage_count = 256\n",
        )
        .unwrap();
        assert_eq!(layout, SlotLayout::stm32f1());
    }
}
