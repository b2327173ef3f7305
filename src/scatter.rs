//! Page-list buffer holding one chunk of plaintext.
//!
//! The block layer hands us requests as ordered lists of physically
//! discontiguous segments, and the transform layer wants the logical
//! byte stream; this buffer sits in between. Each cache entry owns one
//! for the lifetime of the entry.

use crate::error::NexusError;

/// Size of one buffer page. Request segments never cross a page
/// boundary, so every segment fits a single page.
pub const PAGE_SIZE: usize = 4096;

pub struct ScatterBuffer {
    pages: Vec<Box<[u8]>>,
    chunksize: usize,
}

impl ScatterBuffer {
    /// Allocate `ceil(chunksize / PAGE_SIZE)` pages as a unit.
    pub fn new(chunksize: usize) -> Self {
        let count = (chunksize + PAGE_SIZE - 1) / PAGE_SIZE;
        let pages = (0..count)
            .map(|_| vec![0u8; PAGE_SIZE].into_boxed_slice())
            .collect();
        Self { pages, chunksize }
    }

    pub fn chunksize(&self) -> usize {
        self.chunksize
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), NexusError> {
        if offset.checked_add(len).map_or(true, |end| end > self.chunksize) {
            return Err(NexusError::BadInput(format!(
                "copy of {} bytes at offset {} crosses the chunk boundary ({})",
                len, offset, self.chunksize
            )));
        }
        Ok(())
    }

    /// Copy bytes into the buffer at a byte offset within the chunk.
    pub fn copy_in(&mut self, offset: usize, data: &[u8]) -> Result<(), NexusError> {
        self.check_range(offset, data.len())?;
        let mut pos = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let page = pos / PAGE_SIZE;
            let page_off = pos % PAGE_SIZE;
            let n = remaining.len().min(PAGE_SIZE - page_off);
            self.pages[page][page_off..page_off + n].copy_from_slice(&remaining[..n]);
            pos += n;
            remaining = &remaining[n..];
        }
        Ok(())
    }

    /// Copy bytes out of the buffer from a byte offset within the chunk.
    pub fn copy_out(&self, offset: usize, out: &mut [u8]) -> Result<(), NexusError> {
        self.check_range(offset, out.len())?;
        let mut pos = offset;
        let mut remaining = out;
        while !remaining.is_empty() {
            let page = pos / PAGE_SIZE;
            let page_off = pos % PAGE_SIZE;
            let n = remaining.len().min(PAGE_SIZE - page_off);
            remaining[..n].copy_from_slice(&self.pages[page][page_off..page_off + n]);
            pos += n;
            remaining = &mut remaining[n..];
        }
        Ok(())
    }

    /// Contiguous copy of the first `len` bytes, for the transforms.
    pub fn gather(&self, len: usize) -> Result<Vec<u8>, NexusError> {
        self.check_range(0, len)?;
        let mut out = vec![0u8; len];
        self.copy_out(0, &mut out)?;
        Ok(out)
    }

    /// Replace the buffer contents with `data`, zero-filling any tail.
    pub fn scatter(&mut self, data: &[u8]) -> Result<(), NexusError> {
        self.check_range(0, data.len())?;
        self.copy_in(0, data)?;
        if data.len() < self.chunksize {
            self.zero_range(data.len(), self.chunksize - data.len());
        }
        Ok(())
    }

    /// Zero the whole chunk.
    pub fn zero(&mut self) {
        self.zero_range(0, self.chunksize);
    }

    fn zero_range(&mut self, offset: usize, len: usize) {
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let page = pos / PAGE_SIZE;
            let page_off = pos % PAGE_SIZE;
            let n = (end - pos).min(PAGE_SIZE - page_off);
            for b in &mut self.pages[page][page_off..page_off + n] {
                *b = 0;
            }
            pos += n;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn copy_roundtrip_across_pages() {
        let mut buf = ScatterBuffer::new(3 * PAGE_SIZE);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        buf.copy_in(PAGE_SIZE - 17, &data).unwrap();
        let mut out = vec![0u8; data.len()];
        buf.copy_out(PAGE_SIZE - 17, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn rejects_chunk_boundary_crossing() {
        let mut buf = ScatterBuffer::new(PAGE_SIZE);
        assert!(buf.copy_in(PAGE_SIZE - 4, &[0u8; 8]).is_err());
        let mut out = [0u8; 8];
        assert!(buf.copy_out(PAGE_SIZE - 4, &mut out).is_err());
    }

    #[test]
    fn partial_page_tail() {
        // 128 KiB + 100 bytes still rounds up to a whole page
        let buf = ScatterBuffer::new(PAGE_SIZE + 100);
        assert_eq!(buf.page_count(), 2);
    }

    #[test]
    fn scatter_zero_fills_tail() {
        let mut buf = ScatterBuffer::new(2 * PAGE_SIZE);
        buf.copy_in(0, &vec![0xffu8; 2 * PAGE_SIZE]).unwrap();
        buf.scatter(&[1, 2, 3]).unwrap();
        let all = buf.gather(2 * PAGE_SIZE).unwrap();
        assert_eq!(&all[..3], &[1, 2, 3]);
        assert!(all[3..].iter().all(|&b| b == 0));
    }
}
