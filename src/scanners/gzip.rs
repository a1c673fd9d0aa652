//! GZIP scanner: find compressed streams and recurse into their payloads.
//!
//! Scans the page (margin included, so streams straddling a page boundary
//! are caught by the page that owns their first byte) for the RFC 1952
//! member header `1f 8b 08`, inflates from each hit with a hard cap on the
//! decoded size, and submits whatever inflated as a derived page tagged
//! `GZIP`.
//!
//! A truncated or corrupt stream that still produced output is submitted
//! anyway: partial plaintext is evidence, and the page may simply end
//! before the stream does.

use std::io::Read;

use flate2::read::GzDecoder;
use memchr::memmem;

use crate::sbuf::SBuf;
use crate::scanner::{ScanParams, Scanner};

/// gzip member header: magic plus the deflate compression method byte.
const GZIP_SIGNATURE: &[u8] = &[0x1f, 0x8b, 0x08];

/// Default cap on decoded bytes per stream.
pub const DEFAULT_MAX_DECODED: usize = 256 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Scanner recognizing embedded gzip streams.
pub struct GzipScanner {
    max_decoded: usize,
}

impl GzipScanner {
    pub fn new() -> Self {
        Self {
            max_decoded: DEFAULT_MAX_DECODED,
        }
    }

    /// Cap decoded output per stream (decompression-bomb guard).
    pub fn with_max_decoded(max_decoded: usize) -> Self {
        Self { max_decoded }
    }
}

impl Default for GzipScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner for GzipScanner {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn scan(&self, params: &ScanParams<'_>) {
        let sbuf = params.sbuf;
        let data = sbuf.data();
        for hit in memmem::find_iter(data, GZIP_SIGNATURE) {
            // Streams starting in the margin belong to the next page.
            if hit >= sbuf.pagesize() {
                break;
            }
            let decoded = inflate_bounded(&data[hit..], self.max_decoded);
            if decoded.is_empty() {
                continue;
            }
            let origin = sbuf.pos0().shifted(hit as u64);
            let child = SBuf::derived(origin.child("GZIP"), decoded, origin);
            params.recurse(child);
        }
    }
}

/// Inflate up to `cap` bytes from the head of `src`. Returns whatever
/// decoded, empty on immediate failure.
fn inflate_bounded(src: &[u8], cap: usize) -> Vec<u8> {
    let mut decoder = GzDecoder::new(src);
    let mut out = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let room = cap - out.len();
                let take = n.min(room);
                if out.try_reserve(take).is_err() {
                    break;
                }
                out.extend_from_slice(&chunk[..take]);
                if out.len() >= cap {
                    break;
                }
            }
            // Corrupt past this point; keep what inflated.
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureStore;
    use crate::pos0::Pos0;
    use crate::report::NullReport;
    use crate::scanner::ScannerSet;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    fn gzip_bytes(payload: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(payload).unwrap();
        enc.finish().unwrap()
    }

    /// Records every derived page's position and payload.
    struct DerivedLog {
        log: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    impl Scanner for DerivedLog {
        fn name(&self) -> &'static str {
            "derivedlog"
        }
        fn scan(&self, params: &ScanParams<'_>) {
            if !params.sbuf.pos0().is_leaf() {
                self.log
                    .lock()
                    .unwrap()
                    .push((params.sbuf.pos0().to_string(), params.sbuf.page().to_vec()));
            }
        }
    }

    fn scan_page(page: Vec<u8>, pagesize: usize) -> Vec<(String, Vec<u8>)> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = ScannerSet::new(
            Arc::new(NullReport),
            Arc::new(FeatureStore::in_memory()),
        );
        set.register(Box::new(GzipScanner::new()));
        set.register(Box::new(DerivedLog {
            log: Arc::clone(&log),
        }));
        let set = Arc::new(set);
        set.process_sbuf(SBuf::new_root(Pos0::at(0), page, pagesize));
        let got = log.lock().unwrap().clone();
        got
    }

    #[test]
    fn finds_and_inflates_embedded_stream() {
        let payload = b"the hidden plaintext".to_vec();
        let mut page = vec![0x11u8; 100];
        page.extend_from_slice(&gzip_bytes(&payload));
        page.extend_from_slice(&[0x22u8; 40]);
        let pagesize = page.len();

        let derived = scan_page(page, pagesize);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].0, "100-GZIP-0");
        assert_eq!(derived[0].1, payload);
    }

    #[test]
    fn ignores_streams_starting_in_margin() {
        let mut page = vec![0u8; 64];
        page.extend_from_slice(&gzip_bytes(b"margin data"));
        // pagesize 64: the stream lives entirely in the margin.
        let derived = scan_page(page, 64);
        assert!(derived.is_empty());
    }

    #[test]
    fn truncated_stream_yields_partial_payload() {
        // Incompressible payload so half the stream still inflates bytes.
        let mut lcg: u32 = 1;
        let payload: Vec<u8> = (0..4096)
            .map(|_| {
                lcg = lcg.wrapping_mul(1103515245).wrapping_add(12345);
                (lcg >> 16) as u8
            })
            .collect();
        let full = gzip_bytes(&payload);
        let mut page = full[..full.len() / 2].to_vec();
        page.extend_from_slice(&[0u8; 16]);
        let pagesize = page.len();

        let derived = scan_page(page, pagesize);
        assert_eq!(derived.len(), 1);
        let got = &derived[0].1;
        assert!(!got.is_empty());
        assert!(got.len() <= payload.len());
        assert_eq!(&payload[..got.len()], &got[..]);
    }

    #[test]
    fn decoded_size_is_capped() {
        let payload = vec![0u8; 1 << 20];
        let page = gzip_bytes(&payload);
        let pagesize = page.len();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = ScannerSet::new(
            Arc::new(NullReport),
            Arc::new(FeatureStore::in_memory()),
        );
        set.register(Box::new(GzipScanner::with_max_decoded(4096)));
        set.register(Box::new(DerivedLog {
            log: Arc::clone(&log),
        }));
        let set = Arc::new(set);
        set.process_sbuf(SBuf::new_root(Pos0::at(0), page, pagesize));

        let derived = log.lock().unwrap().clone();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].1.len(), 4096);
    }

    #[test]
    fn garbage_without_signature_is_quiet() {
        let derived = scan_page(vec![0xAB; 512], 512);
        assert!(derived.is_empty());
    }

    #[test]
    fn signature_without_valid_stream_is_quiet() {
        let mut page = vec![0u8; 32];
        page.extend_from_slice(GZIP_SIGNATURE);
        page.extend_from_slice(&[0xFF; 64]);
        let pagesize = page.len();
        // Header matches but inflate produces nothing.
        let derived = scan_page(page, pagesize);
        assert!(derived.is_empty());
    }
}
