//! Integrity: CRC16 over packets on the wire and over images stored in flash.

use crc::{Crc, Digest, CRC_16_SPI_FUJITSU, CRC_16_XMODEM};

/// CRC-16/AUG-CCITT: poly 0x1021, init 0x1D0F, no reflection.
static PACKET_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_SPI_FUJITSU);

/// Poly 0x1021 from zero, augmented with two zero bytes. Bit-identical to XMODEM.
static IMAGE_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Images are read from flash one word at a time.
pub const FLASH_WORD_SIZE: usize = 4;

const ERASED_WORD: [u8; FLASH_WORD_SIZE] = [0xFF; FLASH_WORD_SIZE];

/// CRC of a packet, computed by the caller with the crc field zeroed.
pub fn packet_crc(bytes: &[u8]) -> u16 {
    PACKET_CRC.checksum(bytes)
}

/// CRC of a whole image. A trailing partial word is padded with erased bytes.
pub fn image_crc(image: &[u8]) -> u16 {
    let mut crc = ImageCrc::new();
    crc.update(image);
    crc.finalize()
}

/// Number of bytes the image CRC covers for an image of `size` bytes.
pub fn covered_len(size: usize) -> usize {
    size.div_ceil(FLASH_WORD_SIZE) * FLASH_WORD_SIZE
}

/// Incremental image CRC, fed in arbitrary pieces (e.g. one flash page at a time).
pub struct ImageCrc {
    digest: Digest<'static, u16>,
    fed: usize,
}

impl ImageCrc {
    pub fn new() -> Self {
        Self {
            digest: IMAGE_CRC.digest(),
            fed: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
        self.fed += bytes.len();
    }

    pub fn finalize(mut self) -> u16 {
        let tail = self.fed % FLASH_WORD_SIZE;
        if tail != 0 {
            self.digest.update(&ERASED_WORD[..FLASH_WORD_SIZE - tail]);
        }
        self.digest.finalize()
    }
}

impl Default for ImageCrc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shift-register division as flashed devices run it: one word at a time,
    /// then two zero bytes to flush the register.
    fn augmented_crc16(image: &[u8]) -> u16 {
        fn step(mut crc: u16, byte: u8) -> u16 {
            for bit in (0..8).rev() {
                let msb = crc & 0x8000 != 0;
                crc = (crc << 1) | u16::from((byte >> bit) & 1);
                if msb {
                    crc ^= 0x1021;
                }
            }
            crc
        }
        let mut crc = 0u16;
        for word in image.chunks(FLASH_WORD_SIZE) {
            for &b in word {
                crc = step(crc, b);
            }
        }
        step(step(crc, 0), 0)
    }

    #[test]
    fn packet_crc_check_value() {
        assert_eq!(packet_crc(b"123456789"), 0xE5CC);
    }

    #[test]
    fn image_crc_matches_device_algorithm() {
        let image: Vec<u8> = (0..4096u32).map(|i| (i * 7 + 3) as u8).collect();
        assert_eq!(image_crc(&image), augmented_crc16(&image));
        assert_eq!(image_crc(&[]), augmented_crc16(&[]));
    }

    #[test]
    fn partial_word_is_padded_with_erased_bytes() {
        let image = [0x10, 0x20, 0x30, 0x40, 0x50];
        let padded = [0x10, 0x20, 0x30, 0x40, 0x50, 0xFF, 0xFF, 0xFF];
        assert_eq!(image_crc(&image), augmented_crc16(&padded));
        assert_eq!(covered_len(image.len()), padded.len());
    }

    #[test]
    fn streaming_matches_one_shot() {
        let image: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut crc = ImageCrc::new();
        for piece in image.chunks(97) {
            crc.update(piece);
        }
        assert_eq!(crc.finalize(), image_crc(&image));
    }
}
