//! Network partition detection.
//!
//! Periodically checks how many blocks arrived in the last few hours
//! against a Poisson model of the expected rate. A count unlikely enough to
//! occur once in fifty years of normal running raises a user-visible
//! warning, at most once per day.

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::chain::Chain;

/// Observation window, seconds.
const SPAN_SECONDS: u64 = 4 * 60 * 60;
/// Minimum interval between warnings, seconds.
const ALERT_INTERVAL: u64 = 24 * 60 * 60;

/// ln(k!) by direct summation; k stays small (a few hundred at most).
fn ln_factorial(k: u64) -> f64 {
    (2..=k).map(|i| (i as f64).ln()).sum()
}

/// Poisson probability mass function, computed in log space.
fn poisson_pdf(lambda: f64, k: u64) -> f64 {
    if lambda <= 0.0 {
        return if k == 0 { 1.0 } else { 0.0 };
    }
    let ln_p = -lambda + (k as f64) * lambda.ln() - ln_factorial(k);
    ln_p.exp()
}

/// Outcome of a partition check, when noteworthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionWarning {
    TooFewBlocks { found: u64, expected: u64 },
    TooManyBlocks { found: u64, expected: u64 },
}

impl PartitionWarning {
    pub fn message(&self) -> String {
        match self {
            PartitionWarning::TooFewBlocks { found, expected } => format!(
                "WARNING: check your network connection, {} blocks received in the last 4 hours ({} expected)",
                found, expected
            ),
            PartitionWarning::TooManyBlocks { found, expected } => format!(
                "WARNING: abnormally high number of blocks generated, {} blocks received in the last 4 hours ({} expected)",
                found, expected
            ),
        }
    }
}

/// Rate-limited Poisson check over the recent header chain.
pub struct PartitionMonitor {
    last_alert_time: Mutex<u64>,
}

impl PartitionMonitor {
    pub fn new() -> Self {
        Self {
            last_alert_time: Mutex::new(0),
        }
    }

    /// Run one check. `None` when the chain looks healthy, the check is
    /// rate-limited, or we are still syncing.
    pub fn check(
        &self,
        chain: &Chain,
        now: u64,
        pow_target_spacing: u64,
        in_initial_download: bool,
    ) -> Option<PartitionWarning> {
        if in_initial_download || pow_target_spacing == 0 {
            return None;
        }
        let best = chain.best_header?;

        {
            let last = self.last_alert_time.lock();
            if *last > now.saturating_sub(ALERT_INTERVAL) {
                return None;
            }
        }

        let expected = SPAN_SECONDS / pow_target_spacing;
        let start_time = now.saturating_sub(SPAN_SECONDS);

        let mut blocks = 0u64;
        let mut cursor = Some(best);
        while let Some(id) = cursor {
            let entry = chain.index.entry(id);
            if (entry.header.time as u64) < start_time {
                break;
            }
            blocks += 1;
            match entry.parent {
                Some(parent) => cursor = Some(parent),
                // Ran out of chain inside the window: not fully synced.
                None => return None,
            }
        }

        let p = poisson_pdf(expected as f64, blocks);
        info!(blocks, expected, probability = p, "partition check");

        // One false positive per ~fifty years of windows.
        const FIFTY_YEARS: u64 = 50 * 365 * 24 * 60 * 60;
        let alert_threshold = 1.0 / (FIFTY_YEARS / SPAN_SECONDS) as f64;
        if p > alert_threshold {
            return None;
        }

        let warning = if blocks < expected {
            PartitionWarning::TooFewBlocks {
                found: blocks,
                expected,
            }
        } else if blocks > expected {
            PartitionWarning::TooManyBlocks {
                found: blocks,
                expected,
            }
        } else {
            return None;
        };

        warn!("{}", warning.message());
        *self.last_alert_time.lock() = now;
        Some(warning)
    }
}

impl Default for PartitionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
