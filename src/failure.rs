//! Failure taxonomy and the allocator-retry policy.
//!
//! # Classification
//!
//! ```text
//! startup        ConfigError            - sampling/gate misuse, fatal before dispatch
//! per-position   PageReadError
//!                ├── OutOfMemory        - transient; retried per AllocRetryPolicy
//!                └── Io                 - recorded per page, dispatch continues
//! per-unit       scanner panic          - captured by the scanner set, never fatal
//! shutdown       drain timeout          - warning only, finalization still runs
//! ```
//!
//! Only two things abort a run: a configuration error at startup and an
//! exhausted allocation-retry budget mid-dispatch. Everything else is
//! recorded and skipped.
//!
//! # Retry budget invariant
//!
//! With a budget of `max_bad_alloc_errors`, the dispatch loop never attempts
//! page allocation more than `max_bad_alloc_errors + 1` times at one
//! position.

use std::time::Duration;

use thiserror::Error;

use crate::pos0::Pos0;

/// Failure while acquiring a page buffer from the image.
#[derive(Debug, Error)]
pub enum PageReadError {
    /// The page buffer could not be allocated. Treated as transient: the
    /// machine may be under temporary memory pressure from in-flight work.
    #[error("page buffer allocation failed ({wanted} bytes)")]
    OutOfMemory {
        /// Bytes the failed allocation asked for.
        wanted: usize,
    },

    /// Any other read failure. Recorded for the page, never retried.
    #[error("image read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl PageReadError {
    /// True for the allocation class handled by [`AllocRetryPolicy`].
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, PageReadError::OutOfMemory { .. })
    }
}

/// Invalid run configuration. Always fatal at startup.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("num_threads must be >= 1")]
    NoThreads,

    #[error("sampling fraction {0} out of range: need 0 < f < 1")]
    SamplingFractionRange(f64),

    /// The rejection-on-collision sampler degrades quadratically above this
    /// density; denser sampling needs a different sampler and is refused.
    #[error("sampling fraction {0} too dense: need f < 0.2")]
    SamplingTooDense(f64),

    #[error("sampling passes must be >= 1")]
    SamplingPasses,

    #[error("malformed sampling parameters {0:?}: expected fraction[:passes]")]
    SamplingParse(String),

    #[error("pagesize must be > 0")]
    ZeroPageSize,
}

/// Fatal failure of a phase-1 run.
#[derive(Debug, Error)]
pub enum Phase1Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("worker pool could not be constructed: {0}")]
    Pool(std::io::Error),

    #[error("page allocation still failing at {pos0} after {attempts} attempts")]
    AllocRetriesExhausted { pos0: Pos0, attempts: u32 },
}

/// Decision after an allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep `delay`, then try the same position again.
    Retry { delay: Duration },
    /// Budget exhausted; the run must abort.
    GiveUp,
}

/// Retry policy for the out-of-memory class of page acquisition failures.
///
/// The budget counts *failures*, so `max_bad_alloc_errors = 3` permits four
/// attempts in total at one position.
#[derive(Debug, Clone, Copy)]
pub struct AllocRetryPolicy {
    /// Failed attempts tolerated before giving up.
    pub max_bad_alloc_errors: u32,
    /// Sleep between attempts.
    pub retry_delay: Duration,
}

impl AllocRetryPolicy {
    /// Decide after the `failed_attempts`-th consecutive failure (1-based).
    pub fn decide(&self, failed_attempts: u32) -> RetryDecision {
        if failed_attempts <= self.max_bad_alloc_errors {
            RetryDecision::Retry {
                delay: self.retry_delay,
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_is_the_only_retryable_class() {
        assert!(PageReadError::OutOfMemory { wanted: 4096 }.is_out_of_memory());
        let io = PageReadError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short read",
        ));
        assert!(!io.is_out_of_memory());
    }

    #[test]
    fn retry_budget_allows_budget_plus_one_attempts() {
        let policy = AllocRetryPolicy {
            max_bad_alloc_errors: 3,
            retry_delay: Duration::from_secs(0),
        };
        for failed in 1..=3 {
            assert!(matches!(
                policy.decide(failed),
                RetryDecision::Retry { .. }
            ));
        }
        assert_eq!(policy.decide(4), RetryDecision::GiveUp);
    }

    #[test]
    fn zero_budget_never_retries() {
        let policy = AllocRetryPolicy {
            max_bad_alloc_errors: 0,
            retry_delay: Duration::from_secs(0),
        };
        assert_eq!(policy.decide(1), RetryDecision::GiveUp);
    }

    #[test]
    fn config_errors_render_the_offending_value() {
        let e = ConfigError::SamplingTooDense(0.5);
        assert!(e.to_string().contains("0.5"));
    }
}
