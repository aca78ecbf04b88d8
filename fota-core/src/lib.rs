//! Firmware OTA reference implementation.
//! Host-driven: no sockets; the host passes received datagrams and sends what comes back.
//! Flash is reached through the `flash::Flash` trait.

pub mod boot;
pub mod chunk;
pub mod client;
pub mod directory;
pub mod flash;
pub mod integrity;
pub mod protocol;
pub mod server;
pub mod session;
pub mod wire;

pub use boot::{boot, select_boot_slot, BootError, BootTarget, ImageLauncher};
pub use client::{ArtifactFetch, FetchAction, FetchError};
pub use directory::{ArtifactDirectory, DirectoryError};
pub use flash::{Flash, FlashError, OtaMetadata, SlotError, SlotLayout, SlotManager};
pub use protocol::{Command, Message, DEFAULT_PORT, MAX_REQUESTS, REQUEST_PACKET_SIZE};
pub use server::{ChunkServer, OutboundAction, ServerError, ServerOptions};
pub use session::{SessionRegistry, SessionState};
pub use wire::{decode, encode, DecodeError, EncodeError, Packet};
