// fota-boot: bootloader commands run against a flash image file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use fota_core::flash::{FileFlash, Flash};
use fota_core::{boot, BootError, ImageLauncher, SlotManager};
use fota_tools::{load_layout, open_flash, parse_slot, DEFAULT_FLASH_IMAGE};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: fota-boot [--flash <file>] [--layout <file.toml>] <command>
commands:
  lsimg                     list every slot's metadata
  get_metadata <slot>       print one slot's metadata
  verify <slot>             recompute the image crc
  get_newest                newest valid slot
  get_oldest                oldest valid slot
  erase <slot>              erase a slot
  jump <slot>               verify a slot and jump to it
  boot                      jump to the newest slot that verifies
  install <slot> <file>     program a slot image (metadata region + firmware)";

/// There is no image to run on the host: report the entry point instead.
/// Reads through its own handle on the flash image.
struct HostLauncher {
    flash: FileFlash,
}

impl HostLauncher {
    fn open(path: &Path, slots: &SlotManager<FileFlash>) -> anyhow::Result<Self> {
        let flash = FileFlash::open(path, slots.layout().flash)
            .with_context(|| format!("open flash image {}", path.display()))?;
        Ok(Self { flash })
    }
}

impl ImageLauncher for HostLauncher {
    unsafe fn jump_to(&mut self, vector_table: u32) -> Result<(), BootError> {
        let mut words = [0u8; 8];
        self.flash
            .read(vector_table, &mut words)
            .map_err(|_| BootError::JumpFailed(vector_table))?;
        let sp = u32::from_le_bytes([words[0], words[1], words[2], words[3]]);
        let reset = u32::from_le_bytes([words[4], words[5], words[6], words[7]]);
        println!("jump to {vector_table:#010x} (sp {sp:#010x}, reset {reset:#010x})");
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    fota_tools::init_tracing();

    let mut flash_path = PathBuf::from(DEFAULT_FLASH_IMAGE);
    let mut layout_path: Option<PathBuf> = None;
    let mut command = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fota-boot {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            "--flash" => flash_path = args.next().context("--flash needs a path")?.into(),
            "--layout" => layout_path = Some(args.next().context("--layout needs a path")?.into()),
            _ => command.push(arg),
        }
    }

    let layout = load_layout(layout_path.as_deref())?;
    let mut slots = open_flash(&flash_path, layout)?;
    let args: Vec<&str> = command.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["lsimg"] => {
            println!("Listing all internal firmwares...");
            for (slot, metadata) in slots.list()? {
                println!("Metadata slot {slot}:");
                println!("{metadata}");
            }
        }
        ["get_metadata", slot] => {
            let slot = parse_slot(slot)?;
            let metadata = slots.metadata_of(slot)?;
            println!("Metadata slot {slot}");
            println!("{metadata}");
        }
        ["verify", slot] => {
            let slot = parse_slot(slot)?;
            let v = slots.verify(slot)?;
            if !v.passed() {
                bail!(
                    "slot {slot} corrupt: stored crc {:#06x}, computed {:#06x}",
                    v.metadata.crc,
                    v.computed
                );
            }
            println!("Verified slot {slot}");
        }
        ["get_newest"] => match slots.find_newest()? {
            Some(slot) => println!("Newest slot: {slot}"),
            None => println!("No valid slot"),
        },
        ["get_oldest"] => println!("Oldest slot: {}", slots.find_oldest()?),
        ["erase", slot] => {
            let slot = parse_slot(slot)?;
            slots.erase(slot)?;
            println!("Erased slot {slot}");
        }
        ["jump", slot] => {
            let slot = parse_slot(slot)?;
            let v = slots.verify(slot)?;
            if !v.passed() {
                bail!("slot {slot} does not verify, refusing to jump");
            }
            let address = slots.boot_address(slot)?;
            let mut launcher = HostLauncher::open(&flash_path, &slots)?;
            // SAFETY: the slot's image crc was just recomputed and matched.
            unsafe { launcher.jump_to(address)? };
        }
        ["boot"] => {
            let mut launcher = HostLauncher::open(&flash_path, &slots)?;
            let target = boot(&mut slots, &mut launcher)?;
            println!("Booted slot {} (version {:#x})", target.slot, target.metadata.version);
        }
        ["install", slot, file] => {
            let slot = parse_slot(slot)?;
            let bytes = std::fs::read(file).with_context(|| format!("read {file}"))?;
            slots.write_slot_image(slot, &bytes)?;
            let v = slots.verify(slot)?;
            println!(
                "Installed {} bytes in slot {slot}, crc {}",
                bytes.len(),
                if v.passed() { "ok" } else { "MISMATCH" }
            );
        }
        _ => bail!("{USAGE}"),
    }
    Ok(())
}
