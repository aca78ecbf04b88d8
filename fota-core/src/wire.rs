//! Framing: `crc:u16 | cmd:u8 | len:u8 | payload[len]`, little-endian, one packet per datagram.
//! The crc covers the whole packet with the crc field zeroed.

use std::net::Ipv6Addr;

use crate::integrity;
use crate::protocol::{
    Command, Message, HEADER_SIZE, MAX_ARTIFACT_NAME, PAYLOAD_CAPACITY, REQUEST_PACKET_SIZE,
};

const IPV6_SIZE: usize = 16;

/// A validated packet: header fields plus the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    crc: u16,
    cmd: u8,
    data: Vec<u8>,
}

impl Packet {
    /// Build a packet around `data` and compute its crc.
    pub fn new(cmd: u8, data: Vec<u8>) -> Result<Self, EncodeError> {
        if data.len() > PAYLOAD_CAPACITY {
            return Err(EncodeError::PayloadTooLarge(data.len()));
        }
        let crc = compute_crc(cmd, &data);
        Ok(Self { crc, cmd, data })
    }

    /// Parse and crc-check a received datagram. Bytes past the declared length are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated);
        }
        let sent = u16::from_le_bytes([bytes[0], bytes[1]]);
        let cmd = bytes[2];
        let len = bytes[3];
        if usize::from(len) > PAYLOAD_CAPACITY {
            return Err(DecodeError::Oversized(len));
        }
        let end = HEADER_SIZE + usize::from(len);
        if bytes.len() < end {
            return Err(DecodeError::Truncated);
        }
        let data = bytes[HEADER_SIZE..end].to_vec();
        let computed = compute_crc(cmd, &data);
        if computed != sent {
            return Err(DecodeError::CrcMismatch { sent, computed });
        }
        Ok(Self {
            crc: sent,
            cmd,
            data,
        })
    }

    pub fn crc(&self) -> u16 {
        self.crc
    }

    pub fn cmd(&self) -> u8 {
        self.cmd
    }

    /// Declared payload length.
    pub fn len(&self) -> u8 {
        // new() and parse() both bound the payload by PAYLOAD_CAPACITY
        self.data.len() as u8
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Header plus payload: the number of bytes that go on the wire.
    pub fn total_len(&self) -> usize {
        HEADER_SIZE + usize::from(self.len())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        out.extend_from_slice(&self.crc.to_le_bytes());
        out.push(self.cmd);
        out.push(self.len());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn command(&self) -> Result<Command, DecodeError> {
        Command::try_from(self.cmd).map_err(DecodeError::UnknownMessageType)
    }

    /// Interpret the payload according to the command tag.
    pub fn message(&self) -> Result<Message, DecodeError> {
        let command = self.command()?;
        let data = self.data.as_slice();
        let malformed = || DecodeError::Malformed { command };
        let msg = match command {
            Command::EndChunks => Message::EndChunks,
            Command::ResponseAckLookingForPacket => Message::AckLookingForPacket,
            Command::GetArtifact => Message::GetArtifact {
                artifact: read_name(data).ok_or_else(malformed)?,
            },
            Command::ResponseRepoAddr => Message::RepoAddr {
                artifact: read_name(data).ok_or_else(malformed)?,
            },
            Command::GetChunk => {
                let (session_id, chunk_id) = read_pair(data).ok_or_else(malformed)?;
                Message::GetChunk {
                    session_id,
                    chunk_id,
                }
            }
            Command::ResponseSummary => {
                let (session_id, nr_chunks) = read_pair(data).ok_or_else(malformed)?;
                Message::Summary {
                    session_id,
                    nr_chunks,
                }
            }
            Command::ResponseChunk => {
                if data.len() < 2 {
                    return Err(malformed());
                }
                Message::Chunk {
                    chunk_id: u16::from_le_bytes([data[0], data[1]]),
                    data: data[2..].to_vec(),
                }
            }
            Command::GetRepoAddr => {
                if data.len() < IPV6_SIZE {
                    return Err(malformed());
                }
                let mut octets = [0u8; IPV6_SIZE];
                octets.copy_from_slice(&data[..IPV6_SIZE]);
                Message::GetRepoAddr {
                    requester: Ipv6Addr::from(octets),
                    artifact: read_name(&data[IPV6_SIZE..]).ok_or_else(malformed)?,
                }
            }
        };
        Ok(msg)
    }
}

fn compute_crc(cmd: u8, data: &[u8]) -> u16 {
    // crc field zeroed; len < 256 is checked by callers
    let mut bytes = Vec::with_capacity(HEADER_SIZE + data.len());
    bytes.extend_from_slice(&[0, 0, cmd, data.len() as u8]);
    bytes.extend_from_slice(data);
    integrity::packet_crc(&bytes)
}

/// NUL-terminated artifact name; anything after the terminator is ignored.
fn read_name(data: &[u8]) -> Option<String> {
    let nul = data.iter().position(|&b| b == 0)?;
    if nul == 0 || nul > MAX_ARTIFACT_NAME {
        return None;
    }
    String::from_utf8(data[..nul].to_vec()).ok()
}

fn read_pair(data: &[u8]) -> Option<(u16, u16)> {
    if data.len() != 4 {
        return None;
    }
    Some((
        u16::from_le_bytes([data[0], data[1]]),
        u16::from_le_bytes([data[2], data[3]]),
    ))
}

fn push_name(out: &mut Vec<u8>, name: &str) -> Result<(), EncodeError> {
    if name.is_empty() || name.len() > MAX_ARTIFACT_NAME || name.contains('\0') {
        return Err(EncodeError::InvalidName(name.to_string()));
    }
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    Ok(())
}

/// Payload bytes for a message.
fn encode_payload(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    match msg {
        Message::EndChunks | Message::AckLookingForPacket => {}
        Message::GetArtifact { artifact } | Message::RepoAddr { artifact } => {
            push_name(&mut out, artifact)?;
        }
        Message::GetChunk {
            session_id: a,
            chunk_id: b,
        }
        | Message::Summary {
            session_id: a,
            nr_chunks: b,
        } => {
            out.extend_from_slice(&a.to_le_bytes());
            out.extend_from_slice(&b.to_le_bytes());
        }
        Message::Chunk { chunk_id, data } => {
            if data.len() > REQUEST_PACKET_SIZE {
                return Err(EncodeError::ChunkTooLarge(data.len()));
            }
            out.extend_from_slice(&chunk_id.to_le_bytes());
            out.extend_from_slice(data);
        }
        Message::GetRepoAddr {
            requester,
            artifact,
        } => {
            out.extend_from_slice(&requester.octets());
            push_name(&mut out, artifact)?;
        }
    }
    Ok(out)
}

/// Build the packet for a message.
pub fn encode_packet(msg: &Message) -> Result<Packet, EncodeError> {
    Packet::new(msg.command().tag(), encode_payload(msg)?)
}

/// Encode a message into one datagram.
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    Ok(encode_packet(msg)?.to_bytes())
}

/// Decode one datagram: crc check first, then the command tag, then the payload.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    Packet::parse(bytes)?.message()
}

/// Error encoding a message (name or payload out of bounds).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("artifact name {0:?} must be 1..={MAX_ARTIFACT_NAME} bytes without NUL")]
    InvalidName(String),
    #[error("chunk of {0} bytes exceeds {REQUEST_PACKET_SIZE}")]
    ChunkTooLarge(usize),
    #[error("payload of {0} bytes exceeds {PAYLOAD_CAPACITY}")]
    PayloadTooLarge(usize),
}

/// Error decoding a datagram.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram shorter than its header or declared length")]
    Truncated,
    #[error("declared payload length {0} exceeds capacity")]
    Oversized(u8),
    #[error("crc mismatch: sent {sent:#06x}, computed {computed:#06x}")]
    CrcMismatch { sent: u16, computed: u16 },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("malformed {command:?} payload")]
    Malformed { command: Command },
}
