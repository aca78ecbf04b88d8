//! OTA metadata record stored at the base of every slot.
//!
//! Layout (little-endian, 4-byte aligned): `crc:u16 | crc_shadow:u16 | size:u32 |
//! uuid:u32 | version:u16 | pad:u16`. The image starts `OTA_METADATA_SPACE` bytes
//! after the record so its vector table stays aligned.

use std::fmt;

use super::ERASED_BYTE;
use crate::integrity;

/// Bytes the record occupies in flash, padding included.
pub const METADATA_LENGTH: usize = 16;

/// Space reserved for the record ahead of the image.
pub const OTA_METADATA_SPACE: u32 = 0x100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaMetadata {
    /// Authoritative image crc.
    pub crc: u16,
    /// Crc from the most recent verification.
    pub crc_shadow: u16,
    /// Image length in bytes.
    pub size: u32,
    pub uuid: u32,
    pub version: u16,
    /// Alignment padding, kept as read so an erased record is recognised byte for byte.
    pub pad: u16,
}

impl OtaMetadata {
    /// What an erased slot reads as.
    pub const ERASED: OtaMetadata = OtaMetadata {
        crc: u16::MAX,
        crc_shadow: u16::MAX,
        size: u32::MAX,
        uuid: u32::MAX,
        version: u16::MAX,
        pad: u16::MAX,
    };

    /// Metadata for `image`. The shadow crc only matches when the image is pre-verified.
    pub fn for_image(image: &[u8], version: u16, uuid: u32, preverified: bool) -> Option<Self> {
        let size = u32::try_from(image.len()).ok()?;
        let crc = integrity::image_crc(image);
        Some(Self {
            crc,
            crc_shadow: if preverified { crc } else { 0 },
            size,
            uuid,
            version,
            pad: u16::MAX,
        })
    }

    pub fn from_bytes(bytes: &[u8; METADATA_LENGTH]) -> Self {
        Self {
            crc: u16::from_le_bytes([bytes[0], bytes[1]]),
            crc_shadow: u16::from_le_bytes([bytes[2], bytes[3]]),
            size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            uuid: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            version: u16::from_le_bytes([bytes[12], bytes[13]]),
            pad: u16::from_le_bytes([bytes[14], bytes[15]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; METADATA_LENGTH] {
        let mut out = [0u8; METADATA_LENGTH];
        out[0..2].copy_from_slice(&self.crc.to_le_bytes());
        out[2..4].copy_from_slice(&self.crc_shadow.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.uuid.to_le_bytes());
        out[12..14].copy_from_slice(&self.version.to_le_bytes());
        out[14..16].copy_from_slice(&self.pad.to_le_bytes());
        out
    }

    /// The whole reserved region: record followed by erased bytes, ready to prepend to an image.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = vec![ERASED_BYTE; OTA_METADATA_SPACE as usize];
        blob[..METADATA_LENGTH].copy_from_slice(&self.to_bytes());
        blob
    }

    /// All 16 bytes, padding included, read as erased flash.
    pub fn is_erased(&self) -> bool {
        *self == Self::ERASED
    }

    /// Holds an image whose last verification matched its crc.
    pub fn is_valid(&self) -> bool {
        !self.is_erased() && self.crc == self.crc_shadow
    }
}

impl fmt::Display for OtaMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Firmware Size: {}", self.size)?;
        writeln!(f, "Firmware Version: {:#x}", self.version)?;
        writeln!(f, "Firmware UUID: {:#x}", self.uuid)?;
        writeln!(f, "Firmware CRC: {:#06x}", self.crc)?;
        write!(f, "Firmware CRC shadow: {:#06x}", self.crc_shadow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erased_record_is_never_valid() {
        let m = OtaMetadata::from_bytes(&[0xFF; METADATA_LENGTH]);
        assert!(m.is_erased());
        assert!(!m.is_valid());
        // crc == crc_shadow, but still erased
        assert_eq!(m.crc, m.crc_shadow);
    }

    #[test]
    fn programmed_padding_is_not_erased() {
        let mut bytes = [0xFF; METADATA_LENGTH];
        bytes[15] = 0x00;
        let m = OtaMetadata::from_bytes(&bytes);
        assert!(!m.is_erased());
        assert_eq!(m.to_bytes(), bytes);
    }

    #[test]
    fn validity_follows_shadow() {
        let image = [0x11u8; 64];
        let verified = OtaMetadata::for_image(&image, 3, 0xDEAD_BEEF, true).unwrap();
        assert!(verified.is_valid());
        let pending = OtaMetadata::for_image(&image, 3, 0xDEAD_BEEF, false).unwrap();
        assert_eq!(pending.crc_shadow, 0);
        assert!(!pending.is_valid());
    }

    #[test]
    fn byte_layout() {
        let m = OtaMetadata {
            crc: 0x1234,
            crc_shadow: 0x5678,
            size: 0x0001_0203,
            uuid: 0xCAFE_F00D,
            version: 0x0102,
            pad: 0xFFFF,
        };
        let bytes = m.to_bytes();
        assert_eq!(
            bytes,
            [
                0x34, 0x12, 0x78, 0x56, 0x03, 0x02, 0x01, 0x00, 0x0D, 0xF0, 0xFE, 0xCA, 0x02,
                0x01, 0xFF, 0xFF
            ]
        );
        assert_eq!(OtaMetadata::from_bytes(&bytes), m);
    }

    #[test]
    fn blob_fills_reserved_space() {
        let m = OtaMetadata::for_image(b"firmware", 1, 2, true).unwrap();
        let blob = m.to_blob();
        assert_eq!(blob.len(), 0x100);
        assert!(blob[METADATA_LENGTH..].iter().all(|&b| b == 0xFF));
        assert_eq!(m.size, 8);
    }
}
