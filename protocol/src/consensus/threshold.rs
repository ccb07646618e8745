//! Majority threshold arithmetic.
//!
//! `minimum = ceil(total * percent / 100)`, clamped to `[1, total]`. The
//! threshold is always evaluated against the acting suffrage of a round, not
//! the full validator set.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid threshold parameters. Fatal at construction time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThresholdError {
    #[error("invalid threshold: percent must be in (0, 100], got {0}")]
    InvalidPercent(u8),

    #[error("invalid threshold: total member count must be positive")]
    ZeroTotal,
}

/// A validated (total, percent) pair and its derived minimum vote count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    total: usize,
    percent: u8,
    minimum: usize,
}

impl Threshold {
    pub fn new(total: usize, percent: u8) -> Result<Self, ThresholdError> {
        let minimum = compute(total, percent)?;
        Ok(Self {
            total,
            percent,
            minimum,
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Votes a single hash needs for majority.
    pub fn minimum(&self) -> usize {
        self.minimum
    }
}

/// Compute the minimum vote count for majority among `total` members.
pub fn compute(total: usize, percent: u8) -> Result<usize, ThresholdError> {
    check_percent(percent)?;
    if total == 0 {
        return Err(ThresholdError::ZeroTotal);
    }

    // Integer ceiling; u128 keeps `total * percent` from overflowing.
    let numerator = total as u128 * percent as u128;
    let minimum = numerator.div_ceil(100) as usize;

    Ok(minimum.clamp(1, total))
}

/// Validate a percent value on its own, before any member count is known.
pub fn check_percent(percent: u8) -> Result<(), ThresholdError> {
    if percent == 0 || percent > 100 {
        return Err(ThresholdError::InvalidPercent(percent));
    }
    Ok(())
}
