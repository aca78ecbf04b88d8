//! RAM-backed flash for tests and host-side tooling.

use super::{Flash, FlashError, FlashGeometry, ERASED_BYTE};

pub struct MemFlash {
    geometry: FlashGeometry,
    bytes: Vec<u8>,
    failing_page: Option<u32>,
}

impl MemFlash {
    /// Fully erased flash.
    pub fn new(geometry: FlashGeometry) -> Self {
        Self {
            geometry,
            bytes: vec![ERASED_BYTE; geometry.size() as usize],
            failing_page: None,
        }
    }

    /// Make every later program of `page` fail.
    pub fn fail_writes_to(&mut self, page: u32) {
        self.failing_page = Some(page);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Patch raw contents, bypassing page semantics. Used to simulate corruption.
    pub fn poke(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let offset = self.offset(address, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn offset(&self, address: u32, len: usize) -> Result<usize, FlashError> {
        self.geometry
            .offset_of(address, len)
            .map(|o| o as usize)
            .ok_or(FlashError::OutOfBounds { address, len })
    }

    fn page_range(&self, page: u32) -> std::ops::Range<usize> {
        let start = (page * self.geometry.page_size) as usize;
        start..start + self.geometry.page_size as usize
    }
}

impl Flash for MemFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let offset = self.offset(address, buf.len())?;
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_page(&mut self, page: u32, data: &[u8]) -> Result<(), FlashError> {
        self.geometry.check_page_data(page, data)?;
        self.erase_page(page)?;
        if self.failing_page == Some(page) {
            return Err(FlashError::WriteFailed { page });
        }
        let range = self.page_range(page);
        self.bytes[range.start..range.start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase_page(&mut self, page: u32) -> Result<(), FlashError> {
        self.geometry.check_page(page)?;
        let range = self.page_range(page);
        self.bytes[range].fill(ERASED_BYTE);
        Ok(())
    }
}
