//! Progress reporting for long scans.
//!
//! One line every `notify_rate` submitted pages:
//!
//! ```text
//! 14:03:27 301989888 (12.50%) Done in 3 min 41 sec at 14:07:08
//! ```
//!
//! Percentage and ETA come from the iterator's `fraction_done` and are
//! omitted in sampling mode, where fraction-of-cursor is meaningless.
//! Timestamps use the process's local time.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use chrono::Local;

use crate::pos0::Pos0;

/// Render a second count as `"N min M sec"`.
pub fn minsec(total_secs: u64) -> String {
    let mins = total_secs / 60;
    let secs = total_secs % 60;
    match (mins, secs) {
        (0, s) => format!("{s} sec"),
        (m, 0) => format!("{m} min"),
        (m, s) => format!("{m} min {s} sec"),
    }
}

/// Wall-clock timer projecting completion from a done-fraction.
pub struct EtaTimer {
    start: Instant,
}

impl EtaTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn remaining_secs(&self, fraction_done: f64) -> Option<u64> {
        if !(fraction_done > 0.0 && fraction_done <= 1.0) {
            return None;
        }
        let elapsed = self.start.elapsed().as_secs_f64();
        Some((elapsed * (1.0 - fraction_done) / fraction_done).round() as u64)
    }

    /// Remaining time as text, `"n/a"` before any progress.
    pub fn eta_text(&self, fraction_done: f64) -> String {
        match self.remaining_secs(fraction_done) {
            Some(secs) => minsec(secs),
            None => "n/a".to_string(),
        }
    }

    /// Projected local wall-clock finish time.
    pub fn eta_clock(&self, fraction_done: f64) -> String {
        match self.remaining_secs(fraction_done) {
            Some(secs) => (Local::now() + chrono::Duration::seconds(secs as i64))
                .format("%H:%M:%S")
                .to_string(),
            None => "n/a".to_string(),
        }
    }
}

impl Default for EtaTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate-limited progress printer. Producer-local, so no synchronization.
pub struct Notifier {
    rate: u32,
    ctr: u32,
    timer: EtaTimer,
}

impl Notifier {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            ctr: 0,
            timer: EtaTimer::new(),
        }
    }

    /// Called once per submitted page; prints every `rate` calls.
    pub fn page_submitted(&mut self, pos0: &Pos0, fraction_done: f64, sampling: bool) {
        self.ctr += 1;
        if self.ctr < self.rate {
            return;
        }
        self.ctr = 0;

        let stamp = Local::now().format("%H:%M:%S");
        if sampling {
            println!("{stamp} {pos0}");
        } else {
            println!(
                "{stamp} {pos0} ({:5.2}%) Done in {} at {}",
                fraction_done * 100.0,
                self.timer.eta_text(fraction_done),
                self.timer.eta_clock(fraction_done),
            );
        }
        io::stdout().flush().ok();
    }
}
