//! Firmware OTA wire protocol: command tags, message shapes and packet sizes.

use std::net::Ipv6Addr;

/// Bytes of artifact data carried by one chunk.
pub const REQUEST_PACKET_SIZE: usize = 58;

/// Default UDP port for repository servers and nodes.
pub const DEFAULT_PORT: u16 = 8888;

/// Default number of sessions a server tracks at once.
pub const MAX_REQUESTS: usize = 20;

/// Longest artifact name on the wire (32-byte name buffers, NUL included).
pub const MAX_ARTIFACT_NAME: usize = 31;

const CHUNK_ID_SIZE: usize = 2;

/// Largest payload: one full chunk preceded by its chunk id.
pub const PAYLOAD_CAPACITY: usize = REQUEST_PACKET_SIZE + CHUNK_ID_SIZE;

/// Packet as laid out on the wire. Only used to derive the header size.
#[allow(dead_code)]
#[repr(C)]
struct RawPacket {
    crc: u16,
    cmd: u8,
    len: u8,
    data: [u8; PAYLOAD_CAPACITY],
}

/// Offset of the payload within a packet.
pub const HEADER_SIZE: usize = std::mem::offset_of!(RawPacket, data);

/// Largest datagram a well-formed peer sends.
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + PAYLOAD_CAPACITY;

/// Command tag carried in the `cmd` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    EndChunks = 2,
    GetArtifact = 3,
    GetChunk = 4,
    ResponseSummary = 5,
    ResponseChunk = 6,
    ResponseAckLookingForPacket = 7,
    GetRepoAddr = 8,
    ResponseRepoAddr = 9,
}

impl Command {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            2 => Command::EndChunks,
            3 => Command::GetArtifact,
            4 => Command::GetChunk,
            5 => Command::ResponseSummary,
            6 => Command::ResponseChunk,
            7 => Command::ResponseAckLookingForPacket,
            8 => Command::GetRepoAddr,
            9 => Command::ResponseRepoAddr,
            other => return Err(other),
        })
    }
}

/// All wire messages. Encoding is a fixed little-endian layout (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client finished a transfer; the server may retire the session.
    EndChunks,
    /// Client asks for an artifact by name.
    GetArtifact { artifact: String },
    /// Client asks for chunk `chunk_id` of session `session_id`.
    GetChunk { session_id: u16, chunk_id: u16 },
    /// Server announces the session and how many chunks the artifact has.
    /// Session id 0 means the artifact is unavailable.
    Summary { session_id: u16, nr_chunks: u16 },
    /// One chunk of artifact data, at most `REQUEST_PACKET_SIZE` bytes.
    Chunk { chunk_id: u16, data: Vec<u8> },
    /// Server is asking an upstream repository for the artifact.
    AckLookingForPacket,
    /// Ask which repository holds `artifact`; the answer goes to `requester`.
    GetRepoAddr {
        requester: Ipv6Addr,
        artifact: String,
    },
    /// The sender holds `artifact`.
    RepoAddr { artifact: String },
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::EndChunks => Command::EndChunks,
            Message::GetArtifact { .. } => Command::GetArtifact,
            Message::GetChunk { .. } => Command::GetChunk,
            Message::Summary { .. } => Command::ResponseSummary,
            Message::Chunk { .. } => Command::ResponseChunk,
            Message::AckLookingForPacket => Command::ResponseAckLookingForPacket,
            Message::GetRepoAddr { .. } => Command::GetRepoAddr,
            Message::RepoAddr { .. } => Command::ResponseRepoAddr,
        }
    }
}
