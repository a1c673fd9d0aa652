//! Random-sampling plans for partial image scans.
//!
//! Instead of reading every page, a sampled run visits a uniform subset of
//! blocks in ascending order. The plan is a sorted set of block indices of
//! size `ceil(fraction * max_blocks)`, drawn with a seeded generator so the
//! same configuration visits the same blocks on every run.
//!
//! Fractions at or above 0.2 are refused: the draw-until-full strategy
//! absorbs collisions, and above that density the collision rate makes it
//! quadratic. Denser coverage should use a sequential run instead.

use std::collections::BTreeSet;

use crate::failure::ConfigError;
use crate::rng::XorShift64;

/// Parsed sampling options: `fraction[:passes]`.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingParams {
    /// Fraction of blocks to visit per pass, `0 < f < 0.2`.
    pub fraction: f64,
    /// Number of passes; the plan is rebuilt (same seed) and replayed each
    /// pass, with the driver's seen-set absorbing re-submissions.
    pub passes: u32,
    /// Seed for the plan generator.
    pub seed: u64,
}

impl SamplingParams {
    /// Parse `"0.1"` or `"0.1:3"`.
    pub fn parse(text: &str, seed: u64) -> Result<Self, ConfigError> {
        let mut parts = text.split(':');
        let frac_str = parts.next().unwrap_or("");
        let fraction: f64 = frac_str
            .parse()
            .map_err(|_| ConfigError::SamplingParse(text.to_string()))?;
        let passes = match parts.next() {
            None => 1,
            Some(p) => p
                .parse::<u32>()
                .map_err(|_| ConfigError::SamplingParse(text.to_string()))?,
        };
        if parts.next().is_some() {
            return Err(ConfigError::SamplingParse(text.to_string()));
        }
        let params = Self {
            fraction,
            passes,
            seed,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fraction > 0.0 && self.fraction < 1.0) {
            return Err(ConfigError::SamplingFractionRange(self.fraction));
        }
        if self.fraction >= 0.2 {
            return Err(ConfigError::SamplingTooDense(self.fraction));
        }
        if self.passes == 0 {
            return Err(ConfigError::SamplingPasses);
        }
        Ok(())
    }
}

/// Sorted set of block indices to visit in one sampling pass.
#[derive(Debug)]
pub struct SamplingPlan {
    blocks: BTreeSet<u64>,
}

impl SamplingPlan {
    /// Draw uniform blocks in `[0, max_blocks)` until the plan holds
    /// `ceil(fraction * max_blocks)` distinct indices.
    pub fn build(max_blocks: u64, fraction: f64, seed: u64) -> Result<Self, ConfigError> {
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::SamplingFractionRange(fraction));
        }
        if fraction >= 0.2 {
            return Err(ConfigError::SamplingTooDense(fraction));
        }

        let target = ((fraction * max_blocks as f64).ceil() as u64).min(max_blocks);
        let mut blocks = BTreeSet::new();
        let mut rng = XorShift64::new(seed);
        while (blocks.len() as u64) < target {
            // Duplicates are absorbed by the set.
            blocks.insert(rng.bounded(max_blocks));
        }
        Ok(Self { blocks })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block indices in ascending order (not draw order).
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.blocks.iter().copied()
    }
}
