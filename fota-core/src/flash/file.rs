//! Flash image kept in a file, so host tools can inspect and prepare device flash.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{Flash, FlashError, FlashGeometry, ERASED_BYTE};

pub struct FileFlash {
    geometry: FlashGeometry,
    file: File,
}

impl FileFlash {
    /// Open (or create) a flash image. A missing or short file is extended with erased bytes.
    pub fn open(path: impl AsRef<Path>, geometry: FlashGeometry) -> Result<Self, FlashError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let size = geometry.size();
        if len < size {
            file.seek(SeekFrom::Start(len))?;
            let pad = vec![ERASED_BYTE; (size - len) as usize];
            file.write_all(&pad)?;
            file.flush()?;
        }
        Ok(Self { geometry, file })
    }

    fn seek_to(&mut self, address: u32, len: usize) -> Result<(), FlashError> {
        let offset = self
            .geometry
            .offset_of(address, len)
            .ok_or(FlashError::OutOfBounds { address, len })?;
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

impl Flash for FileFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.seek_to(address, buf.len())?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&mut self, page: u32, data: &[u8]) -> Result<(), FlashError> {
        self.geometry.check_page_data(page, data)?;
        self.erase_page(page)?;
        let address = self.geometry.page_address(page);
        self.seek_to(address, data.len())?;
        self.file
            .write_all(data)
            .map_err(|_| FlashError::WriteFailed { page })?;
        self.file.flush()?;
        let mut check = vec![0u8; data.len()];
        self.read(address, &mut check)?;
        if check != data {
            return Err(FlashError::VerifyFailed { page });
        }
        Ok(())
    }

    fn erase_page(&mut self, page: u32) -> Result<(), FlashError> {
        self.geometry.check_page(page)?;
        let page_size = self.geometry.page_size as usize;
        self.seek_to(self.geometry.page_address(page), page_size)?;
        self.file.write_all(&vec![ERASED_BYTE; page_size])?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_flash_persists_pages() {
        let path = std::env::temp_dir().join(format!("fota-flash-{}.bin", uuid::Uuid::new_v4()));
        let geometry = FlashGeometry {
            base_address: 0x1000,
            page_size: 64,
            page_count: 4,
        };
        {
            let mut flash = FileFlash::open(&path, geometry).unwrap();
            flash.write_page(1, &[1, 2, 3]).unwrap();
            assert!(matches!(
                flash.write_page(4, &[0]),
                Err(FlashError::InvalidPage(4))
            ));
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 256);
        let mut flash = FileFlash::open(&path, geometry).unwrap();
        let mut buf = [0u8; 5];
        flash.read(0x1040, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 0xFF, 0xFF]);
        flash.erase_page(1).unwrap();
        flash.read(0x1040, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 5]);
        assert!(matches!(
            flash.read(0x10FE, &mut buf),
            Err(FlashError::OutOfBounds { .. })
        ));
        let _ = std::fs::remove_file(&path);
    }
}
