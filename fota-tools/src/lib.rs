//! Pieces shared by the host tools: argument helpers, flash layout loading, and
//! the UDP driver for an artifact fetch.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use fota_core::flash::{Flash, FileFlash};
use fota_core::{ArtifactFetch, FetchAction, OtaMetadata, SlotLayout, SlotManager, DEFAULT_PORT};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::info;

/// Flash image file used when `--flash` is not given.
pub const DEFAULT_FLASH_IMAGE: &str = "flash.bin";

/// Wait for an answer this long before resending.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

const RECV_BUFFER_SIZE: usize = 1536;

/// Log to stderr; `RUST_LOG` overrides the default level.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Hex number with or without a `0x` prefix.
pub fn parse_hex_u32(s: &str) -> anyhow::Result<u32> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).with_context(|| format!("{s:?} is not a hex number"))
}

pub fn parse_hex_u16(s: &str) -> anyhow::Result<u16> {
    let v = parse_hex_u32(s)?;
    u16::try_from(v).with_context(|| format!("{s:?} does not fit in 16 bits"))
}

pub fn parse_slot(s: &str) -> anyhow::Result<u8> {
    s.parse::<u8>()
        .with_context(|| format!("{s:?} is not a slot number"))
}

/// `addr:port`, or a bare address on the default port.
pub fn parse_server_addr(s: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(a) = s.parse::<SocketAddr>() {
        return Ok(a);
    }
    let ip = s
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .with_context(|| format!("{s:?} is not an address"))?;
    Ok(SocketAddr::new(ip, DEFAULT_PORT))
}

/// Layout from a TOML file, or the STM32F1 layout.
pub fn load_layout(path: Option<&Path>) -> anyhow::Result<SlotLayout> {
    let Some(path) = path else {
        return Ok(SlotLayout::stm32f1());
    };
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read layout {}", path.display()))?;
    parse_layout(&s).with_context(|| format!("layout {}", path.display()))
}

pub fn parse_layout(s: &str) -> anyhow::Result<SlotLayout> {
    let layout: SlotLayout = toml::from_str(s)?;
    layout.validate()?;
    Ok(layout)
}

pub fn open_flash(path: &Path, layout: SlotLayout) -> anyhow::Result<SlotManager<FileFlash>> {
    let flash = FileFlash::open(path, layout.flash)
        .with_context(|| format!("open flash image {}", path.display()))?;
    Ok(SlotManager::new(flash, layout)?)
}

/// Install `image` into the first free slot (else the oldest) and verify it.
/// Returns the slot used.
pub fn install_image<F: Flash>(
    slots: &mut SlotManager<F>,
    image: &[u8],
    version: u16,
    uuid: u32,
) -> anyhow::Result<u8> {
    let Some(metadata) = OtaMetadata::for_image(image, version, uuid, false) else {
        bail!("image of {} bytes is too large", image.len());
    };
    let slot = slots.find_empty_or_oldest()?;
    slots.install(slot, &metadata, image)?;
    let verification = slots.verify(slot)?;
    if !verification.passed() {
        bail!(
            "slot {slot} failed verification after install (crc {:#06x}, read back {:#06x})",
            verification.metadata.crc,
            verification.computed
        );
    }
    info!(slot, version, len = image.len(), "image installed");
    Ok(slot)
}

/// Drive `fetch` over `socket` until the image is complete or the fetch fails.
/// The timer restarts only when a request goes out.
pub async fn run_fetch(
    socket: &UdpSocket,
    fetch: &mut ArtifactFetch,
    timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut action = fetch.start()?;
    let mut deadline = Instant::now() + timeout;
    loop {
        match action {
            FetchAction::Send(to, bytes) => {
                socket
                    .send_to(&bytes, to)
                    .await
                    .with_context(|| format!("send to {to}"))?;
                deadline = Instant::now() + timeout;
            }
            FetchAction::Wait => {}
            FetchAction::Complete {
                image,
                end_chunks: (to, bytes),
            } => {
                socket
                    .send_to(&bytes, to)
                    .await
                    .with_context(|| format!("send to {to}"))?;
                return Ok(image);
            }
        }
        action = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(received) => {
                let (n, from) = received?;
                fetch.on_datagram(from, &buf[..n])?
            }
            Err(_) => fetch.on_timeout()?,
        };
    }
}
