//! Scanner set: the registry every page is run through.
//!
//! # Contract
//!
//! `process_sbuf` invokes each registered scanner in registration order
//! against one read-only page. A scanner that uncovers a decodable
//! substructure builds a derived [`SBuf`] (new position `parent + tag`, new
//! owned bytes) and hands it to [`ScanParams::recurse`], which enqueues a
//! fresh work unit on the attached pool. With no pool attached (tests,
//! synchronous use) recursion runs inline.
//!
//! # Failure isolation
//!
//! Scanners run concurrently on distinct pages and recursively on the same
//! thread, so they must be reentrant. A panicking scanner is caught per
//! invocation, logged through the report sink as a `debug:exception`, and
//! the remaining scanners still run; a scanner can never poison a worker.
//!
//! # Recursion safety
//!
//! Payload structure is attacker-controlled (a decompression bomb can nest
//! forever), so recursion is refused past a provenance-depth cap and the
//! refusal is logged.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::features::FeatureStore;
use crate::pool::{PoolHandle, WorkUnit};
use crate::report::ReportSink;
use crate::sbuf::SBuf;

/// Default cap on decoder tags in a position path.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 7;

/// A content recognizer invoked on each page.
pub trait Scanner: Send + Sync {
    /// Short lowercase name used in diagnostics and provenance tags.
    fn name(&self) -> &'static str;

    /// Examine one page. The buffer is shared and read-only; derived pages
    /// go through [`ScanParams::recurse`].
    fn scan(&self, params: &ScanParams<'_>);
}

/// Per-invocation view handed to a scanner.
pub struct ScanParams<'a> {
    /// The page under examination (logical page plus readable margin).
    pub sbuf: &'a SBuf,
    set: &'a Arc<ScannerSet>,
}

impl<'a> ScanParams<'a> {
    /// Submit a derived page back into the pool. Ownership of `child`
    /// transfers to the new work unit.
    pub fn recurse(&self, child: SBuf) {
        self.set.recurse(child);
    }

    /// The feature-file store scanners record into.
    pub fn features(&self) -> &FeatureStore {
        self.set.features()
    }
}

/// Registry of scanners plus the shared sinks they write to.
pub struct ScannerSet {
    scanners: Vec<Box<dyn Scanner>>,
    report: Arc<dyn ReportSink>,
    features: Arc<FeatureStore>,
    pool: Mutex<Option<PoolHandle>>,
    max_recursion_depth: usize,

    pages_processed: AtomicU64,
    pages_recursed: AtomicU64,
    scanner_panics: AtomicU64,
    depth_rejections: AtomicU64,
}

impl ScannerSet {
    pub fn new(report: Arc<dyn ReportSink>, features: Arc<FeatureStore>) -> Self {
        Self {
            scanners: Vec::new(),
            report,
            features,
            pool: Mutex::new(None),
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            pages_processed: AtomicU64::new(0),
            pages_recursed: AtomicU64::new(0),
            scanner_panics: AtomicU64::new(0),
            depth_rejections: AtomicU64::new(0),
        }
    }

    pub fn with_max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    /// Register a scanner. Registration order is invocation order.
    pub fn register(&mut self, scanner: Box<dyn Scanner>) {
        self.scanners.push(scanner);
    }

    pub fn len(&self) -> usize {
        self.scanners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scanners.is_empty()
    }

    pub fn report(&self) -> &dyn ReportSink {
        self.report.as_ref()
    }

    pub fn features(&self) -> &FeatureStore {
        self.features.as_ref()
    }

    /// Attach the pool recursion submits to. Called by the driver once the
    /// pool exists.
    pub fn attach_pool(&self, handle: PoolHandle) {
        *self.pool.lock().expect("scanner set pool mutex poisoned") = Some(handle);
    }

    /// Drop the pool handle so the pool's queue can disconnect. Recursion
    /// after this point runs inline.
    pub fn detach_pool(&self) {
        *self.pool.lock().expect("scanner set pool mutex poisoned") = None;
    }

    /// Run every scanner against one page, then release the page. The page
    /// buffer is destroyed here, exactly once, after all scanners finished.
    pub fn process_sbuf(self: &Arc<Self>, sbuf: SBuf) {
        let params = ScanParams {
            sbuf: &sbuf,
            set: self,
        };
        for scanner in &self.scanners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| scanner.scan(&params)));
            if let Err(payload) = outcome {
                self.scanner_panics.fetch_add(1, Ordering::Relaxed);
                let msg = panic_message(payload.as_ref());
                self.report.xmlout(
                    "debug:exception",
                    &msg,
                    &[
                        ("name", scanner.name()),
                        ("pos0", &sbuf.pos0().to_string()),
                    ],
                    true,
                );
            }
        }
        self.pages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Enqueue a derived page as a new work unit.
    pub fn recurse(self: &Arc<Self>, child: SBuf) {
        if child.depth() > self.max_recursion_depth {
            self.depth_rejections.fetch_add(1, Ordering::Relaxed);
            self.report.xmlout(
                "debug:exception",
                "recursion depth limit reached",
                &[("pos0", &child.pos0().to_string())],
                true,
            );
            return;
        }
        self.pages_recursed.fetch_add(1, Ordering::Relaxed);

        let unit = WorkUnit::new(child, Arc::clone(self));
        let handle = self
            .pool
            .lock()
            .expect("scanner set pool mutex poisoned")
            .clone();
        match handle {
            Some(h) => h.submit_from_scanner(unit),
            None => unit.process(),
        }
    }

    pub fn pages_processed(&self) -> u64 {
        self.pages_processed.load(Ordering::Relaxed)
    }

    pub fn pages_recursed(&self) -> u64 {
        self.pages_recursed.load(Ordering::Relaxed)
    }

    pub fn scanner_panics(&self) -> u64 {
        self.scanner_panics.load(Ordering::Relaxed)
    }

    pub fn depth_rejections(&self) -> u64 {
        self.depth_rejections.load(Ordering::Relaxed)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "scanner panicked".to_string()
    }
}
