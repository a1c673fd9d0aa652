//! Worker pool: bounded-queue fan-out of page scans.
//!
//! # Architecture
//!
//! ```text
//! Driver (producer)
//!   |  submit() — blocking send, the backpressure path
//!   v
//! bounded channel (capacity 2n)
//!   |                         recurse() from a worker:
//!   v                           try_send, run inline if full
//! worker-0 .. worker-n-1: recv -> process (all scanners) -> drop page
//! ```
//!
//! A single shared bounded channel distributes units; workers compete, so
//! fast workers naturally take more pages. The queue bound is the only
//! backpressure mechanism: `submit` blocks rather than drops, which caps
//! in-flight memory at `(capacity + workers) * bufsize` per recursion
//! level.
//!
//! # Self-submission
//!
//! A scanner may submit derived work from inside a worker while the queue
//! is full and every other worker is blocked the same way. Blocking there
//! would deadlock, so recursive submits use `try_send` and run the child
//! unit inline on the submitting worker when the queue is saturated
//! (reentrant drain). Worker threads are identified by a thread-local.
//!
//! # Drain
//!
//! An in-flight count (incremented before enqueue, decremented after
//! execution) backs `drain`: wait until zero or a deadline. On timeout the
//! workers are left running — there is no cancellation primitive — and the
//! caller proceeds; per-worker stats live in shared slots so they are
//! readable either way.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::sbuf::SBuf;
use crate::scanner::ScannerSet;

// ============================================================================
// Work units
// ============================================================================

/// One `(scanner set, page)` task. Owns its page buffer; execution runs
/// every scanner against the page and then drops it.
pub struct WorkUnit {
    sbuf: SBuf,
    set: Arc<ScannerSet>,
}

impl WorkUnit {
    pub fn new(sbuf: SBuf, set: Arc<ScannerSet>) -> Self {
        Self { sbuf, set }
    }

    /// Logical page size, for accounting.
    pub fn page_len(&self) -> usize {
        self.sbuf.pagesize()
    }

    /// Run all scanners on the page. Consumes the unit; the page buffer is
    /// released when this returns.
    pub fn process(self) {
        let Self { sbuf, set } = self;
        set.process_sbuf(sbuf);
    }
}

// ============================================================================
// Worker identity
// ============================================================================

thread_local! {
    static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Worker index of the current thread, if it is a pool worker.
pub fn current_worker() -> Option<usize> {
    WORKER_ID.with(|id| id.get())
}

fn set_current_worker(idx: usize) {
    WORKER_ID.with(|id| id.set(Some(idx)));
}

// ============================================================================
// In-flight accounting
// ============================================================================

struct Inflight {
    count: Mutex<u64>,
    idle: Condvar,
}

impl Inflight {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn inc(&self) {
        *self.count.lock().expect("inflight mutex poisoned") += 1;
    }

    fn dec(&self) {
        let mut n = self.count.lock().expect("inflight mutex poisoned");
        debug_assert!(*n > 0, "inflight underflow");
        *n -= 1;
        if *n == 0 {
            self.idle.notify_all();
        }
    }

    /// Wait until no unit is queued or running. Returns false on deadline.
    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut n = self.count.lock().expect("inflight mutex poisoned");
        while *n > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .idle
                .wait_timeout(n, deadline - now)
                .expect("inflight mutex poisoned");
            n = guard;
        }
        true
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Shared per-worker counters, updated by the worker and snapshot by the
/// driver (also after a timed-out drain, while the worker still runs).
struct WorkerSlot {
    units: AtomicU64,
    page_bytes: AtomicU64,
    wait_ns: AtomicU64,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            units: AtomicU64::new(0),
            page_bytes: AtomicU64::new(0),
            wait_ns: AtomicU64::new(0),
        }
    }
}

/// Snapshot of one worker's activity.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerStats {
    /// Units executed to completion.
    pub units: u64,
    /// Sum of logical page bytes across executed units.
    pub page_bytes: u64,
    /// Time spent blocked waiting for work.
    pub wait: Duration,
}

/// Outcome of draining the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainStatus {
    /// Every submitted unit finished.
    Drained,
    /// The deadline passed with units still in flight; workers keep
    /// running.
    TimedOut,
}

/// Final pool accounting.
#[derive(Debug)]
pub struct PoolStats {
    /// Per-worker snapshots in worker index order.
    pub workers: Vec<WorkerStats>,
    /// Time the producer spent blocked in `submit` (the backpressure path).
    pub producer_wait: Duration,
    pub drained: bool,
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable submission handle used for recursion from inside scanners.
#[derive(Clone)]
pub struct PoolHandle {
    tx: Sender<WorkUnit>,
    inflight: Arc<Inflight>,
}

impl PoolHandle {
    /// Submit a derived unit from scanner context.
    ///
    /// On a worker thread this never blocks: if the queue is full the unit
    /// runs inline on the calling worker, which is what makes
    /// self-submission deadlock-free. Off-worker callers block like the
    /// producer. Either way the unit executes exactly once.
    pub fn submit_from_scanner(&self, unit: WorkUnit) {
        self.inflight.inc();
        if current_worker().is_some() {
            match self.tx.try_send(unit) {
                Ok(()) => {}
                Err(TrySendError::Full(unit)) | Err(TrySendError::Disconnected(unit)) => {
                    unit.process();
                    self.inflight.dec();
                }
            }
        } else {
            match self.tx.send(unit) {
                Ok(()) => {}
                Err(err) => {
                    err.into_inner().process();
                    self.inflight.dec();
                }
            }
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Fixed-size worker pool over a bounded queue.
pub struct WorkerPool {
    tx: Option<Sender<WorkUnit>>,
    inflight: Arc<Inflight>,
    slots: Arc<Vec<WorkerSlot>>,
    handles: Vec<JoinHandle<()>>,
    producer_wait_ns: AtomicU64,
}

impl WorkerPool {
    /// Spawn `workers` threads with a queue of capacity `2 * workers`.
    pub fn new(workers: usize) -> io::Result<Self> {
        assert!(workers > 0, "workers must be > 0");
        let capacity = workers * 2;
        let (tx, rx) = bounded::<WorkUnit>(capacity);
        let inflight = Arc::new(Inflight::new());
        let slots: Arc<Vec<WorkerSlot>> =
            Arc::new((0..workers).map(|_| WorkerSlot::new()).collect());

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx = rx.clone();
            let inflight = Arc::clone(&inflight);
            let slots = Arc::clone(&slots);
            let handle = thread::Builder::new()
                .name(format!("scan-worker-{idx}"))
                .spawn(move || {
                    set_current_worker(idx);
                    worker_loop(idx, rx, inflight, slots);
                })?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            inflight,
            slots,
            handles,
            producer_wait_ns: AtomicU64::new(0),
        })
    }

    /// Submission handle for recursion.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            tx: self.tx.as_ref().expect("pool already shut down").clone(),
            inflight: Arc::clone(&self.inflight),
        }
    }

    /// Blocking enqueue. Returns once the unit is queued; blocking here is
    /// the intended flow control, not an error.
    pub fn submit(&self, unit: WorkUnit) {
        self.inflight.inc();
        let tx = self.tx.as_ref().expect("pool already shut down");
        let start = Instant::now();
        match tx.send(unit) {
            Ok(()) => {}
            Err(err) => {
                // All workers gone; keep the unit's execution guarantee.
                err.into_inner().process();
                self.inflight.dec();
            }
        }
        self.producer_wait_ns.fetch_add(
            start.elapsed().as_nanos() as u64,
            Ordering::Relaxed,
        );
    }

    /// Wait for every submitted unit to finish, up to `timeout`. Safe to
    /// call repeatedly; an already-idle pool returns immediately.
    pub fn drain(&self, timeout: Duration) -> DrainStatus {
        if self.inflight.wait_idle(timeout) {
            DrainStatus::Drained
        } else {
            DrainStatus::TimedOut
        }
    }

    /// Shut down: close the queue and collect stats. After a clean drain
    /// the worker threads are joined; after a timeout they are left to
    /// finish on their own and the stats are a live snapshot.
    ///
    /// Outstanding [`PoolHandle`] clones must be dropped first (the driver
    /// detaches the scanner set before calling this); workers only exit
    /// once every sender is gone.
    pub fn finish(mut self, status: DrainStatus) -> PoolStats {
        self.tx.take();
        let drained = status == DrainStatus::Drained;
        if drained {
            for handle in self.handles.drain(..) {
                let _ = handle.join();
            }
        } else {
            self.handles.clear();
        }

        let workers = self
            .slots
            .iter()
            .map(|slot| WorkerStats {
                units: slot.units.load(Ordering::Relaxed),
                page_bytes: slot.page_bytes.load(Ordering::Relaxed),
                wait: Duration::from_nanos(slot.wait_ns.load(Ordering::Relaxed)),
            })
            .collect();

        PoolStats {
            workers,
            producer_wait: Duration::from_nanos(self.producer_wait_ns.load(Ordering::Relaxed)),
            drained,
        }
    }
}

fn worker_loop(
    idx: usize,
    rx: Receiver<WorkUnit>,
    inflight: Arc<Inflight>,
    slots: Arc<Vec<WorkerSlot>>,
) {
    let slot = &slots[idx];
    loop {
        let wait_start = Instant::now();
        let unit = match rx.recv() {
            Ok(unit) => unit,
            Err(_) => break,
        };
        slot.wait_ns.fetch_add(
            wait_start.elapsed().as_nanos() as u64,
            Ordering::Relaxed,
        );

        let page_len = unit.page_len() as u64;
        unit.process();

        slot.units.fetch_add(1, Ordering::Relaxed);
        slot.page_bytes.fetch_add(page_len, Ordering::Relaxed);
        inflight.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureStore;
    use crate::pos0::Pos0;
    use crate::report::NullReport;
    use crate::scanner::{ScanParams, Scanner};

    struct CountScanner {
        count: Arc<AtomicU64>,
        delay: Duration,
    }

    impl Scanner for CountScanner {
        fn name(&self) -> &'static str {
            "count"
        }
        fn scan(&self, _params: &ScanParams<'_>) {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fans out `children` derived pages from every leaf page.
    struct FanOutScanner {
        children: usize,
    }

    impl Scanner for FanOutScanner {
        fn name(&self) -> &'static str {
            "fanout"
        }
        fn scan(&self, params: &ScanParams<'_>) {
            if !params.sbuf.pos0().is_leaf() {
                return;
            }
            let base = params.sbuf.pos0().child("FAN");
            for i in 0..self.children {
                let child = SBuf::derived(
                    base.shifted(i as u64 * 16),
                    vec![0u8; 16],
                    params.sbuf.pos0().clone(),
                );
                params.recurse(child);
            }
        }
    }

    fn counting_set(count: Arc<AtomicU64>, delay: Duration) -> Arc<ScannerSet> {
        let mut set = ScannerSet::new(
            Arc::new(NullReport),
            Arc::new(FeatureStore::in_memory()),
        );
        set.register(Box::new(CountScanner { count, delay }));
        Arc::new(set)
    }

    fn unit(set: &Arc<ScannerSet>, n: u64) -> WorkUnit {
        WorkUnit::new(
            SBuf::new_root(Pos0::at(n * 64), vec![0u8; 64], 64),
            Arc::clone(set),
        )
    }

    #[test]
    fn every_submitted_unit_executes_exactly_once() {
        let count = Arc::new(AtomicU64::new(0));
        let set = counting_set(Arc::clone(&count), Duration::ZERO);
        let pool = WorkerPool::new(4).unwrap();

        for n in 0..100 {
            pool.submit(unit(&set, n));
        }
        assert_eq!(pool.drain(Duration::from_secs(30)), DrainStatus::Drained);
        let stats = pool.finish(DrainStatus::Drained);

        assert_eq!(count.load(Ordering::Relaxed), 100);
        let total: u64 = stats.workers.iter().map(|w| w.units).sum();
        assert_eq!(total, 100);
        assert!(stats.drained);
    }

    #[test]
    fn backpressure_loses_nothing_with_slow_workers() {
        let count = Arc::new(AtomicU64::new(0));
        let set = counting_set(Arc::clone(&count), Duration::from_millis(2));
        // One worker, queue capacity 2: most submits block.
        let pool = WorkerPool::new(1).unwrap();

        for n in 0..40 {
            pool.submit(unit(&set, n));
        }
        assert_eq!(pool.drain(Duration::from_secs(30)), DrainStatus::Drained);
        pool.finish(DrainStatus::Drained);
        assert_eq!(count.load(Ordering::Relaxed), 40);
    }

    #[test]
    fn saturating_recursion_does_not_deadlock() {
        let count = Arc::new(AtomicU64::new(0));
        let mut set = ScannerSet::new(
            Arc::new(NullReport),
            Arc::new(FeatureStore::in_memory()),
        );
        // Fan out far beyond the queue capacity of a 1-worker pool.
        set.register(Box::new(FanOutScanner { children: 64 }));
        set.register(Box::new(CountScanner {
            count: Arc::clone(&count),
            delay: Duration::ZERO,
        }));
        let set = Arc::new(set);

        let pool = WorkerPool::new(1).unwrap();
        set.attach_pool(pool.handle());
        for n in 0..4 {
            pool.submit(unit(&set, n));
        }
        assert_eq!(pool.drain(Duration::from_secs(30)), DrainStatus::Drained);
        set.detach_pool();
        pool.finish(DrainStatus::Drained);

        // 4 leaves + 4 * 64 derived pages, every one scanned.
        assert_eq!(count.load(Ordering::Relaxed), 4 + 4 * 64);
    }

    #[test]
    fn drain_times_out_but_stats_remain_readable() {
        let count = Arc::new(AtomicU64::new(0));
        let set = counting_set(Arc::clone(&count), Duration::from_millis(200));
        let pool = WorkerPool::new(1).unwrap();
        pool.submit(unit(&set, 0));

        let status = pool.drain(Duration::from_millis(1));
        assert_eq!(status, DrainStatus::TimedOut);
        let stats = pool.finish(status);
        assert!(!stats.drained);
        assert_eq!(stats.workers.len(), 1);
    }

    #[test]
    fn drain_is_idempotent() {
        let count = Arc::new(AtomicU64::new(0));
        let set = counting_set(Arc::clone(&count), Duration::ZERO);
        let pool = WorkerPool::new(2).unwrap();
        pool.submit(unit(&set, 0));
        assert_eq!(pool.drain(Duration::from_secs(10)), DrainStatus::Drained);
        assert_eq!(pool.drain(Duration::from_secs(10)), DrainStatus::Drained);
        pool.finish(DrainStatus::Drained);
    }
}
