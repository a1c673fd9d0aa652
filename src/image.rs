//! Paged image access: byte sources and the page iterator.
//!
//! # Architecture
//!
//! ```text
//! PageSource (trait)          Image = source + PageLayout
//!   ├── FileImage (mmap)         |
//!   └── MemImage  (tests)        v
//!                             PageIter: seek_block / seek_raw / advance
//!                                |
//!                                v
//!                             read_page() -> SBuf (page + margin)
//! ```
//!
//! The iterator walks the image in `pagesize` steps. Each `read_page` copies
//! `pagesize + marginsize` bytes (clamped at end-of-image) into a fresh
//! [`SBuf`]; the margin lets scanners match across a page boundary without
//! the next page double-counting those bytes.
//!
//! Allocation failures from `read_page` are classified separately from I/O
//! failures so the driver can retry them (the machine may simply be under
//! pressure from in-flight pages).

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::failure::{ConfigError, PageReadError};
use crate::pos0::Pos0;
use crate::sbuf::SBuf;

// ============================================================================
// Sources
// ============================================================================

/// Random-access byte source behind an image.
pub trait PageSource: Send + Sync {
    /// Display name (file path, device, label).
    fn name(&self) -> &str;

    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Copy bytes starting at `offset` into `dst`. Returns the number of
    /// bytes copied; 0 only at end-of-source. Short copies are allowed.
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize, PageReadError>;
}

/// Memory-mapped file source.
pub struct FileImage {
    name: String,
    map: Mmap,
}

impl FileImage {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the map is read-only and lives as long as `self`; a
        // concurrently-truncated file is the caller's hazard, as with any
        // forensic source.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            name: path.display().to_string(),
            map,
        })
    }
}

impl PageSource for FileImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.map.len() as u64
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize, PageReadError> {
        let len = self.map.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = dst.len().min(self.map.len() - start);
        dst[..n].copy_from_slice(&self.map[start..start + n]);
        Ok(n)
    }
}

/// In-memory source for tests and synthetic runs.
pub struct MemImage {
    name: String,
    data: Vec<u8>,
}

impl MemImage {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

impl PageSource for MemImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize, PageReadError> {
        if offset >= self.data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = dst.len().min(self.data.len() - start);
        dst[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

// ============================================================================
// Layout + Image
// ============================================================================

/// Page geometry for a run.
#[derive(Clone, Copy, Debug)]
pub struct PageLayout {
    /// Logical page size; the image advances in these steps.
    pub pagesize: usize,
    /// Extra readable bytes past each page for boundary-spanning matches.
    pub marginsize: usize,
}

impl PageLayout {
    pub fn new(pagesize: usize, marginsize: usize) -> Result<Self, ConfigError> {
        if pagesize == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        Ok(Self {
            pagesize,
            marginsize,
        })
    }

    /// Bytes a full page buffer holds (page + margin).
    pub fn bufsize(&self) -> usize {
        self.pagesize.saturating_add(self.marginsize)
    }
}

impl Default for PageLayout {
    fn default() -> Self {
        // 16 MiB pages with a 4 MiB margin: large enough to amortize
        // per-page overhead on disk images, small enough to bound the
        // in-flight memory of a worker pool.
        Self {
            pagesize: 16 * 1024 * 1024,
            marginsize: 4 * 1024 * 1024,
        }
    }
}

/// A paged view over a byte source.
pub struct Image {
    source: Box<dyn PageSource>,
    layout: PageLayout,
}

impl Image {
    pub fn new(source: Box<dyn PageSource>, layout: PageLayout) -> Self {
        Self { source, layout }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn size(&self) -> u64 {
        self.source.size()
    }

    pub fn layout(&self) -> PageLayout {
        self.layout
    }

    /// Iterator positioned at the start of the image.
    pub fn pages(&self) -> PageIter<'_> {
        PageIter {
            source: self.source.as_ref(),
            layout: self.layout,
            raw_offset: 0,
            page_number: 0,
        }
    }
}

// ============================================================================
// PageIter
// ============================================================================

/// Forward iterator over an image's pages.
///
/// Advances in `pagesize` steps; supports block and raw seeks for sampling
/// and offset gates. Not an `Iterator` impl: `read_page` is fallible and
/// callers interleave seeks with reads.
pub struct PageIter<'a> {
    source: &'a dyn PageSource,
    layout: PageLayout,
    raw_offset: u64,
    page_number: u64,
}

impl<'a> PageIter<'a> {
    pub fn raw_offset(&self) -> u64 {
        self.raw_offset
    }

    pub fn page_number(&self) -> u64 {
        self.page_number
    }

    /// Position of the page currently under the cursor.
    pub fn pos0(&self) -> Pos0 {
        Pos0::at(self.raw_offset)
    }

    pub fn at_end(&self) -> bool {
        self.raw_offset >= self.source.size()
    }

    /// Total number of pages (the last may be short).
    pub fn max_blocks(&self) -> u64 {
        let pagesize = self.layout.pagesize as u64;
        self.source.size().div_ceil(pagesize)
    }

    /// Fraction of the image behind the cursor, in `[0, 1]`.
    pub fn fraction_done(&self) -> f64 {
        let size = self.source.size();
        if size == 0 {
            return 1.0;
        }
        (self.raw_offset.min(size)) as f64 / size as f64
    }

    /// Jump to page `block`.
    pub fn seek_block(&mut self, block: u64) {
        self.page_number = block;
        self.raw_offset = block.saturating_mul(self.layout.pagesize as u64);
    }

    /// Jump to a raw byte offset; the page number is derived from it.
    pub fn seek_raw(&mut self, offset: u64) {
        self.raw_offset = offset;
        self.page_number = offset / self.layout.pagesize as u64;
    }

    /// Step to the next page.
    pub fn advance(&mut self) {
        self.raw_offset = self
            .raw_offset
            .saturating_add(self.layout.pagesize as u64);
        self.page_number += 1;
    }

    /// Read the page under the cursor into a fresh buffer.
    ///
    /// The buffer holds up to `pagesize + marginsize` bytes; both page and
    /// margin are clamped at end-of-image. Allocation failure is returned
    /// as the retryable out-of-memory class.
    pub fn read_page(&mut self) -> Result<SBuf, PageReadError> {
        let size = self.source.size();
        let remaining = size.saturating_sub(self.raw_offset);
        if remaining == 0 {
            return Err(PageReadError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of image",
            )));
        }

        let want = (self.layout.bufsize() as u64).min(remaining) as usize;
        let pagesize = (self.layout.pagesize as u64).min(remaining) as usize;
        let mut sbuf = SBuf::try_alloc_root(self.pos0(), want, pagesize)?;

        let n = self.source.read_at(self.raw_offset, sbuf.fill())?;
        if n < want {
            sbuf.truncate(n);
        }
        Ok(sbuf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image(bytes: usize, pagesize: usize, margin: usize) -> Image {
        let data: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
        Image::new(
            Box::new(MemImage::new("test", data)),
            PageLayout::new(pagesize, margin).unwrap(),
        )
    }

    #[test]
    fn sequential_iteration_covers_every_byte_once() {
        let img = image(10 * 64, 64, 0);
        let mut it = img.pages();
        let mut pages = 0u64;
        let mut offset = 0u64;
        while !it.at_end() {
            assert_eq!(it.raw_offset(), offset);
            assert_eq!(it.page_number(), pages);
            let sbuf = it.read_page().unwrap();
            assert_eq!(sbuf.pagesize(), 64);
            assert_eq!(sbuf.pos0(), &Pos0::at(offset));
            pages += 1;
            offset += 64;
            it.advance();
        }
        assert_eq!(pages, 10);
        assert_eq!(it.max_blocks(), 10);
    }

    #[test]
    fn margin_overlaps_next_page() {
        let img = image(256, 64, 16);
        let mut it = img.pages();
        let first = it.read_page().unwrap();
        assert_eq!(first.pagesize(), 64);
        assert_eq!(first.bufsize(), 80);
        it.advance();
        let second = it.read_page().unwrap();
        // The margin of page 0 is the head of page 1.
        assert_eq!(first.margin(), &second.page()[..16]);
    }

    #[test]
    fn short_final_page_is_clamped() {
        let img = image(100, 64, 16);
        let mut it = img.pages();
        it.seek_block(1);
        let last = it.read_page().unwrap();
        assert_eq!(last.pagesize(), 36);
        assert_eq!(last.bufsize(), 36);
        assert_eq!(img.pages().max_blocks(), 2);
    }

    #[test]
    fn seeks_agree_on_page_numbering() {
        let img = image(1024, 64, 0);
        let mut it = img.pages();
        it.seek_block(7);
        assert_eq!(it.raw_offset(), 448);
        assert_eq!(it.page_number(), 7);

        let mut it = img.pages();
        it.seek_raw(448);
        assert_eq!(it.page_number(), 7);
    }

    #[test]
    fn fraction_done_tracks_cursor() {
        let img = image(1000, 100, 0);
        let mut it = img.pages();
        assert_eq!(it.fraction_done(), 0.0);
        it.seek_raw(500);
        assert_eq!(it.fraction_done(), 0.5);
        it.seek_raw(2000);
        assert_eq!(it.fraction_done(), 1.0);
    }

    #[test]
    fn read_past_end_is_an_io_error() {
        let img = image(64, 64, 0);
        let mut it = img.pages();
        it.advance();
        let err = it.read_page().unwrap_err();
        assert!(!err.is_out_of_memory());
    }

    #[test]
    fn file_image_round_trip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..200u16).map(|i| (i % 256) as u8).collect();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let src = FileImage::open(tmp.path()).unwrap();
        assert_eq!(src.size(), 200);
        let img = Image::new(Box::new(src), PageLayout::new(64, 8).unwrap());
        let mut it = img.pages();
        let page = it.read_page().unwrap();
        assert_eq!(page.page(), &data[..64]);
        assert_eq!(page.margin(), &data[64..72]);
    }

    #[test]
    fn zero_pagesize_rejected() {
        assert!(PageLayout::new(0, 0).is_err());
    }
}
