//! Phase 1: the read-scan-recurse pass over an image.
//!
//! # Architecture
//!
//! ```text
//! Phase1::run
//!   ├── WorkerPool::new(num_threads)          queue capacity 2n
//!   ├── dispatch                              one producer loop
//!   │     sequential: seek_raw(offset_start), advance page by page
//!   │     sampling:   seek_block over the sorted plan, per pass
//!   │     per page: gates -> seen-set -> retrying acquire -> rolling
//!   │               SHA-1 -> submit (blocks when full) -> notify
//!   ├── drain(max_wait_time)                  timeout = warning, not fatal
//!   └── finalize                              source info, digest, feature
//!                                             stats, wait metrics
//! ```
//!
//! The driver owns everything mutable — iterator, sampling plan, seen-set,
//! hash state, counters — so the only cross-thread traffic is work units
//! through the queue and report entries through the sink. The rolling hash
//! in particular is updated on the producer before `submit` returns, which
//! makes "fed in submission order with no gaps" trivially true.
//!
//! Only two failures abort a run: invalid configuration and an exhausted
//! allocation-retry budget. Per-page read errors are recorded and skipped;
//! scanner failures never reach the driver.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use sha1::{Digest, Sha1};

use crate::failure::{
    AllocRetryPolicy, ConfigError, Phase1Error, RetryDecision,
};
use crate::image::{Image, PageIter};
use crate::pool::{DrainStatus, PoolStats, WorkUnit, WorkerPool, WorkerStats};
use crate::progress::Notifier;
use crate::report::ReportSink;
use crate::sampling::{SamplingParams, SamplingPlan};
use crate::sbuf::SBuf;
use crate::scanner::ScannerSet;

/// Namespace bound to the `debug:` report entries.
const DEBUG_NS: &str = "urn:bulkscan:debug";

// ============================================================================
// Configuration
// ============================================================================

/// Phase-1 run configuration.
#[derive(Clone, Debug)]
pub struct Phase1Config {
    /// Worker threads consuming pages.
    pub num_threads: usize,

    /// Allocation failures tolerated per position before the run aborts.
    pub max_bad_alloc_errors: u32,
    /// Sleep between allocation retries.
    pub retry_seconds: u64,

    /// Drain deadline in seconds; exceeding it is a warning, not an error.
    pub max_wait_time: u64,

    /// Skip pages before this raw byte offset.
    pub opt_offset_start: u64,
    /// Stop once a candidate page starts at or past this offset (0 = none).
    pub opt_offset_end: u64,
    /// Skip pages before this page number.
    pub opt_page_start: u64,

    /// Pages per progress line.
    pub opt_notify_rate: u32,
    /// Suppress stdout progress entirely.
    pub opt_quiet: bool,
    /// Echo per-page read errors to stderr as well as the report.
    pub opt_report_read_errors: bool,

    /// Maintain the rolling whole-image SHA-1.
    pub opt_hash_image: bool,

    /// Random sampling instead of a sequential pass.
    pub sampling: Option<SamplingParams>,
}

impl Default for Phase1Config {
    fn default() -> Self {
        Self {
            num_threads: 4,
            max_bad_alloc_errors: 60,
            retry_seconds: 60,
            max_wait_time: 3600,
            opt_offset_start: 0,
            opt_offset_end: 0,
            opt_page_start: 0,
            opt_notify_rate: 4,
            opt_quiet: false,
            opt_report_read_errors: true,
            opt_hash_image: true,
            sampling: None,
        }
    }
}

impl Phase1Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if let Some(sampling) = &self.sampling {
            sampling.validate()?;
        }
        Ok(())
    }
}

// ============================================================================
// Run results
// ============================================================================

/// Driver-side counters for one run.
#[derive(Clone, Debug, Default)]
pub struct Phase1Stats {
    /// Leaf pages handed to the pool.
    pub pages_submitted: u64,
    /// Sum of submitted logical page sizes.
    pub total_bytes: u64,
    /// Candidates skipped because their position was already submitted.
    pub pages_skipped_seen: u64,
    /// Per-page read failures recorded and skipped.
    pub read_errors: u64,
    /// Allocation retries performed (sleeps taken).
    pub bad_alloc_retries: u64,
    /// Whether the pool drained inside the deadline.
    pub drained: bool,
    /// Hex SHA-1 of the image, if the rolling hash survived the run.
    pub sha1: Option<String>,
}

/// Everything a finished run reports back to the caller.
#[derive(Debug)]
pub struct Phase1Report {
    pub stats: Phase1Stats,
    /// Per-worker activity in worker index order.
    pub workers: Vec<WorkerStats>,
    /// Time the producer spent blocked in `submit`.
    pub producer_wait: Duration,
}

// ============================================================================
// Rolling hash
// ============================================================================

/// Incremental SHA-1 over the gap-free prefix of the image.
///
/// Well-defined only while every submitted leaf page starts exactly at
/// `next_offset`; the driver discards it permanently on the first gap.
struct RollingHash {
    state: Sha1,
    next_offset: u64,
}

impl RollingHash {
    fn new() -> Self {
        Self {
            state: Sha1::new(),
            next_offset: 0,
        }
    }

    fn hex_digest(self) -> String {
        let digest = self.state.finalize();
        let mut out = String::with_capacity(40);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

// ============================================================================
// Driver
// ============================================================================

/// The phase-1 driver. One instance drives one run.
pub struct Phase1 {
    config: Phase1Config,
    seen: AHashSet<String>,
    hash: Option<RollingHash>,
    notifier: Notifier,
    stats: Phase1Stats,
}

impl Phase1 {
    pub fn new(config: Phase1Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let notifier = Notifier::new(config.opt_notify_rate.max(1));
        Ok(Self {
            config,
            seen: AHashSet::new(),
            hash: None,
            notifier,
            stats: Phase1Stats::default(),
        })
    }

    /// Run the full pass: dispatch, drain, finalize.
    pub fn run(
        mut self,
        image: &Image,
        scanners: &Arc<ScannerSet>,
        report: &dyn ReportSink,
    ) -> Result<Phase1Report, Phase1Error> {
        let pool = WorkerPool::new(self.config.num_threads).map_err(Phase1Error::Pool)?;
        scanners.attach_pool(pool.handle());
        if self.config.opt_hash_image {
            self.hash = Some(RollingHash::new());
        }

        report.push("runtime", &[("xmlns:debug", DEBUG_NS)]);
        let dispatch_result = self.dispatch(image, scanners, &pool, report);

        if !self.config.opt_quiet && dispatch_result.is_ok() {
            println!("All data are read; waiting for threads to finish...");
        }

        let status = pool.drain(Duration::from_secs(self.config.max_wait_time));
        if status == DrainStatus::TimedOut {
            let warning = format!(
                "phase 1 drain exceeded max_wait_time ({} sec); continuing with workers still busy",
                self.config.max_wait_time
            );
            eprintln!("{warning}");
            report.comment(&warning);
        }
        scanners.detach_pool();
        let pool_stats = pool.finish(status);
        report.pop(); // runtime

        // A fatal dispatch error aborts before the report is finalized; the
        // drain above still ran so no submitted page was lost.
        dispatch_result?;

        self.stats.drained = pool_stats.drained;
        self.finalize(image, scanners, report, &pool_stats);

        Ok(Phase1Report {
            stats: self.stats,
            workers: pool_stats.workers,
            producer_wait: pool_stats.producer_wait,
        })
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn dispatch(
        &mut self,
        image: &Image,
        scanners: &Arc<ScannerSet>,
        pool: &WorkerPool,
        report: &dyn ReportSink,
    ) -> Result<(), Phase1Error> {
        match self.config.sampling.clone() {
            Some(params) => self.dispatch_sampled(image, scanners, pool, report, &params),
            None => self.dispatch_sequential(image, scanners, pool, report),
        }
    }

    fn dispatch_sequential(
        &mut self,
        image: &Image,
        scanners: &Arc<ScannerSet>,
        pool: &WorkerPool,
        report: &dyn ReportSink,
    ) -> Result<(), Phase1Error> {
        let mut it = image.pages();
        if self.config.opt_offset_start > 0 {
            it.seek_raw(self.config.opt_offset_start);
        }
        while !it.at_end() {
            if self.past_offset_end(&it) {
                break;
            }
            self.consider(&mut it, scanners, pool, report, false)?;
            it.advance();
        }
        Ok(())
    }

    fn dispatch_sampled(
        &mut self,
        image: &Image,
        scanners: &Arc<ScannerSet>,
        pool: &WorkerPool,
        report: &dyn ReportSink,
        params: &SamplingParams,
    ) -> Result<(), Phase1Error> {
        let mut it = image.pages();
        let max_blocks = it.max_blocks();
        for _pass in 0..params.passes {
            // Rebuilt from the same seed each pass: the plan is identical,
            // so replays re-check every block and the seen-set absorbs
            // re-submissions.
            let plan = SamplingPlan::build(max_blocks, params.fraction, params.seed)?;
            for block in plan.iter() {
                it.seek_block(block);
                if self.past_offset_end(&it) {
                    break;
                }
                self.consider(&mut it, scanners, pool, report, true)?;
            }
        }
        Ok(())
    }

    fn past_offset_end(&self, it: &PageIter<'_>) -> bool {
        self.config.opt_offset_end != 0 && self.config.opt_offset_end <= it.raw_offset()
    }

    /// Examine the page under the cursor and submit it if it passes the
    /// gates. Per-page read failures are recorded here and skipped.
    fn consider(
        &mut self,
        it: &mut PageIter<'_>,
        scanners: &Arc<ScannerSet>,
        pool: &WorkerPool,
        report: &dyn ReportSink,
        sampling: bool,
    ) -> Result<(), Phase1Error> {
        // Gates skip without touching the seen-set, so a later pass with
        // wider gates can still visit these pages.
        if it.page_number() < self.config.opt_page_start
            || it.raw_offset() < self.config.opt_offset_start
        {
            return Ok(());
        }

        let key = it.pos0().to_string();
        if !self.seen.insert(key) {
            self.stats.pages_skipped_seen += 1;
            return Ok(());
        }

        let sbuf = match self.acquire_page(it, report)? {
            Some(sbuf) => sbuf,
            None => return Ok(()),
        };

        self.update_hash(&sbuf);
        self.stats.total_bytes += sbuf.pagesize() as u64;
        self.stats.pages_submitted += 1;

        let pos0 = sbuf.pos0().clone();
        let fraction = it.fraction_done();
        pool.submit(WorkUnit::new(sbuf, Arc::clone(scanners)));

        if !self.config.opt_quiet {
            self.notifier.page_submitted(&pos0, fraction, sampling);
        }
        Ok(())
    }

    /// Acquire the page buffer, retrying the out-of-memory class per the
    /// configured budget. `Ok(None)` means a non-retryable read failure was
    /// recorded and the caller should move on.
    fn acquire_page(
        &mut self,
        it: &mut PageIter<'_>,
        report: &dyn ReportSink,
    ) -> Result<Option<SBuf>, Phase1Error> {
        let policy = AllocRetryPolicy {
            max_bad_alloc_errors: self.config.max_bad_alloc_errors,
            retry_delay: Duration::from_secs(self.config.retry_seconds),
        };
        let mut failed: u32 = 0;
        loop {
            match it.read_page() {
                Ok(sbuf) => return Ok(Some(sbuf)),
                Err(err) if err.is_out_of_memory() => {
                    failed += 1;
                    eprintln!(
                        "low memory reading {}: {err} (retry_count={} of {})",
                        it.pos0(),
                        failed - 1,
                        self.config.max_bad_alloc_errors,
                    );
                    report.xmlout(
                        "debug:exception",
                        &err.to_string(),
                        &[
                            ("name", "bad_alloc"),
                            ("pos0", &it.pos0().to_string()),
                            ("retry_count", &(failed - 1).to_string()),
                        ],
                        true,
                    );
                    match policy.decide(failed) {
                        RetryDecision::Retry { delay } => {
                            self.stats.bad_alloc_retries += 1;
                            if !delay.is_zero() {
                                eprintln!(
                                    "will wait for {} seconds and try again...",
                                    delay.as_secs()
                                );
                                std::thread::sleep(delay);
                            }
                        }
                        RetryDecision::GiveUp => {
                            eprintln!(
                                "too many allocation failures in a row; diagnose and restart"
                            );
                            return Err(Phase1Error::AllocRetriesExhausted {
                                pos0: it.pos0(),
                                attempts: failed,
                            });
                        }
                    }
                }
                Err(err) => {
                    self.stats.read_errors += 1;
                    if self.config.opt_report_read_errors {
                        eprintln!("page read failed, skipping {}: {err}", it.pos0());
                    }
                    report.xmlout(
                        "debug:exception",
                        &err.to_string(),
                        &[("pos0", &it.pos0().to_string())],
                        true,
                    );
                    return Ok(None);
                }
            }
        }
    }

    /// Feed the page to the rolling hash if it extends the gap-free prefix;
    /// otherwise drop the hash for good.
    fn update_hash(&mut self, sbuf: &SBuf) {
        if let Some(hash) = self.hash.as_mut() {
            if sbuf.pos0().is_leaf() && sbuf.pos0().offset() == hash.next_offset {
                hash.state.update(sbuf.page());
                hash.next_offset += sbuf.pagesize() as u64;
            } else {
                self.hash = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    fn finalize(
        &mut self,
        image: &Image,
        scanners: &Arc<ScannerSet>,
        report: &dyn ReportSink,
        pool_stats: &PoolStats,
    ) {
        report.push("source", &[]);
        report.xmlout("image_filename", image.name(), &[], true);
        report.xmlout("image_size", &image.size().to_string(), &[], false);
        if let Some(hash) = self.hash.take() {
            let digest = hash.hex_digest();
            report.xmlout("hashdigest", &digest, &[("type", "SHA1")], false);
            self.stats.sha1 = Some(digest);
        }
        report.pop();

        scanners.features().flush();
        scanners.features().dump_stats(report);

        for (idx, worker) in pool_stats.workers.iter().enumerate() {
            report.xmlout(
                "thread_wait",
                &format!("{:.6}", worker.wait.as_secs_f64()),
                &[("thread", &idx.to_string())],
                false,
            );
        }
        report.xmlout(
            "producer_wait",
            &format!("{:.6}", pool_stats.producer_wait.as_secs_f64()),
            &[],
            false,
        );
        report.flush();

        if !self.config.opt_quiet {
            let workers = pool_stats.workers.len().max(1) as f64;
            let avg_wait: f64 = pool_stats
                .workers
                .iter()
                .map(|w| w.wait.as_secs_f64())
                .sum::<f64>()
                / workers;
            println!("Average consumer time spent waiting: {avg_wait:.3} sec.");
        }
    }
}
