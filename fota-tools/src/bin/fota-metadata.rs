// fota-metadata: build the metadata region that precedes a firmware image in its slot.

use std::path::PathBuf;

use anyhow::{bail, Context};
use fota_core::OtaMetadata;
use fota_tools::{parse_hex_u16, parse_hex_u32};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: fota-metadata <firmware.bin> <version-hex> <uuid-hex> <preverified 0|1> \
[-o <metadata.bin>] [--slot-image <slot.bin>]";

const DEFAULT_OUTPUT: &str = "firmware-metadata.bin";

fn main() -> anyhow::Result<()> {
    fota_tools::init_tracing();

    let mut positional = Vec::new();
    let mut output = PathBuf::from(DEFAULT_OUTPUT);
    let mut slot_image: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fota-metadata {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            "-o" | "--output" => output = args.next().context("-o needs a path")?.into(),
            "--slot-image" => {
                slot_image = Some(args.next().context("--slot-image needs a path")?.into())
            }
            _ => positional.push(arg),
        }
    }
    let [firmware, version, uuid, preverified] = positional.as_slice() else {
        bail!("{USAGE}");
    };
    let version = parse_hex_u16(version)?;
    let uuid = parse_hex_u32(uuid)?;
    let preverified = match preverified.as_str() {
        "0" => false,
        "1" => true,
        other => bail!("preverified must be 0 or 1, got {other:?}"),
    };

    let image = std::fs::read(firmware).with_context(|| format!("read {firmware}"))?;
    let Some(metadata) = OtaMetadata::for_image(&image, version, uuid, preverified) else {
        bail!("{firmware} is too large ({} bytes)", image.len());
    };
    println!("{metadata}");

    let blob = metadata.to_blob();
    std::fs::write(&output, &blob).with_context(|| format!("write {}", output.display()))?;
    println!("Metadata written to {}", output.display());

    if let Some(path) = slot_image {
        let mut bytes = blob;
        bytes.extend_from_slice(&image);
        std::fs::write(&path, &bytes).with_context(|| format!("write {}", path.display()))?;
        println!("Slot image written to {}", path.display());
    }
    Ok(())
}
