//! Forensic bulk-data scan scheduler.
//!
//! Ingests a large opaque byte source (disk image, raw device, file), splits
//! it into fixed-size pages, and runs a registry of content scanners over
//! every page on a worker pool, recursing into any decodable substructure a
//! scanner uncovers. Outputs are append-only feature files plus an XML
//! execution report.
//!
//! # Flow (one run)
//!
//! 1. [`Image`] wraps a byte source with a page/margin layout.
//! 2. [`Phase1`] iterates pages — sequentially or via a seeded random
//!    [`SamplingPlan`] — deduplicating by [`Pos0`], retrying transient
//!    allocation failures, and feeding a rolling SHA-1.
//! 3. Each page becomes a [`WorkUnit`] on the bounded-queue [`WorkerPool`];
//!    a full queue blocks the producer (backpressure).
//! 4. Workers run every registered [`Scanner`] on the page; a scanner that
//!    decodes something submits the payload back as a derived page with an
//!    extended provenance path.
//! 5. Drain with a deadline, then finalize the report: source info, digest,
//!    feature-file statistics, wait metrics.
//!
//! # Module map
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`pos0`] | Provenance paths (`12345-GZIP-0`) |
//! | [`sbuf`] | Owned page buffers with page/margin split |
//! | [`image`] | Byte sources and the page iterator |
//! | [`scanner`] | Scanner trait, registry, recursion contract |
//! | [`scanners`] | Bundled scanners (gzip) |
//! | [`pool`] | Worker pool with bounded queue and reentrant drain |
//! | [`sampling`] | Seeded random-sampling plans |
//! | [`phase1`] | The driver |
//! | [`failure`] | Error taxonomy and allocation retry policy |
//! | [`report`] | XML run-report sink |
//! | [`features`] | Append-only feature-file store |
//! | [`progress`] | ETA and progress lines |
//! | [`rng`] | Deterministic XorShift64 |

pub mod failure;
pub mod features;
pub mod image;
pub mod phase1;
pub mod pool;
pub mod pos0;
pub mod progress;
pub mod report;
pub mod rng;
pub mod sampling;
pub mod sbuf;
pub mod scanner;
pub mod scanners;

pub use failure::{AllocRetryPolicy, ConfigError, PageReadError, Phase1Error, RetryDecision};
pub use features::FeatureStore;
pub use image::{FileImage, Image, MemImage, PageIter, PageLayout, PageSource};
pub use phase1::{Phase1, Phase1Config, Phase1Report, Phase1Stats};
pub use pool::{DrainStatus, PoolHandle, PoolStats, WorkUnit, WorkerPool, WorkerStats};
pub use pos0::Pos0;
pub use progress::{minsec, EtaTimer, Notifier};
pub use report::{BufferReport, NullReport, ReportSink, XmlReport};
pub use rng::XorShift64;
pub use sampling::{SamplingParams, SamplingPlan};
pub use sbuf::SBuf;
pub use scanner::{ScanParams, Scanner, ScannerSet, DEFAULT_MAX_RECURSION_DEPTH};
pub use scanners::GzipScanner;
