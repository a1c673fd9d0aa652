//! Page buffers (`SBuf`): owned byte spans with provenance.
//!
//! # Memory layout
//!
//! ```text
//! data: [ logical page | margin ]
//!       ^ pagesize     ^ bufsize - pagesize
//! ```
//!
//! The logical page is what the run counts (progress, hashing, coverage).
//! The margin past it may be *read* by scanners so matches spanning a page
//! boundary are not missed, but it is never counted: the same bytes are the
//! logical page of the next buffer.
//!
//! # Ownership
//!
//! An `SBuf` is created once (by the image iterator for leaf pages, by a
//! scanner for derived pages), moved into exactly one work unit, shared
//! read-only with every scanner on that unit, and dropped when the unit
//! completes. There is no mutation path after construction.
//!
//! # Fail-fast construction
//!
//! Invariants are validated at the construction site so a bad producer is
//! caught with a useful stack trace, not a confused scanner later.

use crate::failure::PageReadError;
use crate::pos0::Pos0;

/// An owned, read-only byte region with a position tag.
#[derive(Debug)]
pub struct SBuf {
    pos0: Pos0,
    data: Vec<u8>,
    pagesize: usize,
    /// For derived buffers: the position of the byte the decoder started at.
    parent: Option<Pos0>,
}

impl SBuf {
    /// Leaf page buffer produced by the image iterator.
    ///
    /// # Panics
    ///
    /// Panics if `pagesize` exceeds the buffer length.
    pub fn new_root(pos0: Pos0, data: Vec<u8>, pagesize: usize) -> Self {
        assert!(
            pagesize <= data.len(),
            "SBuf at {pos0}: pagesize ({pagesize}) > bufsize ({})",
            data.len()
        );
        Self {
            pos0,
            data,
            pagesize,
            parent: None,
        }
    }

    /// Derived buffer produced by a scanner. The whole buffer is logical
    /// page (decoded payloads carry no margin), and `origin` records where
    /// in the parent stream the decoder started.
    pub fn derived(pos0: Pos0, data: Vec<u8>, origin: Pos0) -> Self {
        let pagesize = data.len();
        Self {
            pos0,
            data,
            pagesize,
            parent: Some(origin),
        }
    }

    /// Allocate a zeroed leaf buffer, classifying allocation failure as the
    /// retryable out-of-memory error instead of aborting.
    pub fn try_alloc_root(pos0: Pos0, bufsize: usize, pagesize: usize) -> Result<Self, PageReadError> {
        let mut data = Vec::new();
        data.try_reserve_exact(bufsize)
            .map_err(|_| PageReadError::OutOfMemory { wanted: bufsize })?;
        data.resize(bufsize, 0);
        Ok(Self::new_root(pos0, data, pagesize))
    }

    pub fn pos0(&self) -> &Pos0 {
        &self.pos0
    }

    /// Full buffer including the margin.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The logical page only.
    pub fn page(&self) -> &[u8] {
        &self.data[..self.pagesize]
    }

    /// The readable-but-uncounted tail past the logical page.
    pub fn margin(&self) -> &[u8] {
        &self.data[self.pagesize..]
    }

    pub fn pagesize(&self) -> usize {
        self.pagesize
    }

    pub fn bufsize(&self) -> usize {
        self.data.len()
    }

    /// Origin position for derived buffers; `None` for leaf pages.
    pub fn parent(&self) -> Option<&Pos0> {
        self.parent.as_ref()
    }

    /// Decode ancestry depth (0 for leaf pages).
    pub fn depth(&self) -> usize {
        self.pos0.depth()
    }

    /// Shrink the buffer to the bytes actually read, clamping the page to
    /// the new end. Used by iterators after a short read at end-of-image.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.pagesize = self.pagesize.min(self.data.len());
    }

    /// Mutable view used only while the producer fills the buffer. Not
    /// reachable once the buffer has been handed to a work unit.
    pub(crate) fn fill(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_and_margin_split() {
        let sbuf = SBuf::new_root(Pos0::at(0), vec![1, 2, 3, 4, 5, 6], 4);
        assert_eq!(sbuf.page(), &[1, 2, 3, 4]);
        assert_eq!(sbuf.margin(), &[5, 6]);
        assert_eq!(sbuf.data().len(), 6);
        assert_eq!(sbuf.pagesize(), 4);
        assert_eq!(sbuf.bufsize(), 6);
    }

    #[test]
    #[should_panic(expected = "pagesize")]
    fn rejects_page_larger_than_buffer() {
        let _ = SBuf::new_root(Pos0::at(0), vec![0; 4], 8);
    }

    #[test]
    fn derived_buffers_are_all_page() {
        let origin = Pos0::at(100).shifted(7);
        let child = SBuf::derived(origin.child("GZIP"), vec![9; 32], origin.clone());
        assert_eq!(child.pagesize(), 32);
        assert!(child.margin().is_empty());
        assert_eq!(child.parent(), Some(&origin));
        assert_eq!(child.depth(), 1);
    }

    #[test]
    fn truncate_clamps_page() {
        let mut sbuf = SBuf::new_root(Pos0::at(0), vec![0; 16], 8);
        sbuf.truncate(5);
        assert_eq!(sbuf.bufsize(), 5);
        assert_eq!(sbuf.pagesize(), 5);
    }

    #[test]
    fn try_alloc_reports_wanted_size() {
        let sbuf = SBuf::try_alloc_root(Pos0::at(0), 64, 32).unwrap();
        assert_eq!(sbuf.bufsize(), 64);
        assert_eq!(sbuf.pagesize(), 32);
    }
}
