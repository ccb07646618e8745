//! # Consensus Policy
//!
//! Runtime-tunable consensus parameters. Loaded from the node's JSON
//! configuration, validated once at startup. An invalid policy never
//! reaches the state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::threshold::{self, Threshold, ThresholdError};
use crate::config::{
    ACTING_ALL, DEFAULT_INTERVAL_BROADCASTING_ACCEPT, DEFAULT_INTERVAL_BROADCASTING_INIT,
    DEFAULT_INTERVAL_COMMIT_RETRY, DEFAULT_INTERVAL_SYNC_RETRY, DEFAULT_MAX_COMMIT_FAILURES,
    DEFAULT_MAX_HEIGHT_AHEAD,
    DEFAULT_THRESHOLD_PERCENT, DEFAULT_TIMEOUT_WAITING_BALLOT, DEFAULT_TIMEOUT_WAITING_PROPOSAL,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid threshold: {0}")]
    Threshold(#[from] ThresholdError),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("max_commit_failures must be at least 1")]
    ZeroCommitFailures,

    #[error("max_height_ahead must be at least 1")]
    ZeroHeightWindow,

    #[error("round timeout ({ballot_ms}ms) must not be shorter than the proposal wait ({proposal_ms}ms)")]
    TimeoutOrder { ballot_ms: u64, proposal_ms: u64 },

    #[error("policy json: {0}")]
    Json(String),
}

/// Tunable consensus parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Majority percentage, in `(0, 100]`.
    pub threshold_percent: u8,

    /// Acting suffrage size per round. 0 means the whole validator set.
    pub number_of_acting: usize,

    /// Wait for the designated proposal after INIT majority.
    pub timeout_waiting_proposal_ms: u64,

    /// Round timeout: no majority or draw within this window starts the
    /// next round.
    pub timeout_waiting_ballot_ms: u64,

    pub interval_broadcasting_init_ms: u64,

    pub interval_broadcasting_accept_ms: u64,

    pub interval_sync_retry_ms: u64,

    pub interval_commit_retry_ms: u64,

    /// Consecutive failed commits at one height before handing over to
    /// Syncing.
    pub max_commit_failures: u32,

    /// Seals for heights further than this above the working height are
    /// dropped. A node that falls further behind learns it from its block
    /// source instead.
    pub max_height_ahead: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
            number_of_acting: ACTING_ALL,
            timeout_waiting_proposal_ms: DEFAULT_TIMEOUT_WAITING_PROPOSAL.as_millis() as u64,
            timeout_waiting_ballot_ms: DEFAULT_TIMEOUT_WAITING_BALLOT.as_millis() as u64,
            interval_broadcasting_init_ms: DEFAULT_INTERVAL_BROADCASTING_INIT.as_millis() as u64,
            interval_broadcasting_accept_ms: DEFAULT_INTERVAL_BROADCASTING_ACCEPT.as_millis()
                as u64,
            interval_sync_retry_ms: DEFAULT_INTERVAL_SYNC_RETRY.as_millis() as u64,
            interval_commit_retry_ms: DEFAULT_INTERVAL_COMMIT_RETRY.as_millis() as u64,
            max_commit_failures: DEFAULT_MAX_COMMIT_FAILURES,
            max_height_ahead: DEFAULT_MAX_HEIGHT_AHEAD,
        }
    }
}

impl Policy {
    /// Check every field. Call before handing the policy to a controller.
    pub fn validate(&self) -> Result<(), PolicyError> {
        threshold::check_percent(self.threshold_percent)?;

        for (name, value) in [
            ("timeout_waiting_proposal_ms", self.timeout_waiting_proposal_ms),
            ("timeout_waiting_ballot_ms", self.timeout_waiting_ballot_ms),
            ("interval_broadcasting_init_ms", self.interval_broadcasting_init_ms),
            ("interval_broadcasting_accept_ms", self.interval_broadcasting_accept_ms),
            ("interval_sync_retry_ms", self.interval_sync_retry_ms),
            ("interval_commit_retry_ms", self.interval_commit_retry_ms),
        ] {
            if value == 0 {
                return Err(PolicyError::ZeroDuration(name));
            }
        }

        if self.max_commit_failures == 0 {
            return Err(PolicyError::ZeroCommitFailures);
        }
        if self.max_height_ahead == 0 {
            return Err(PolicyError::ZeroHeightWindow);
        }
        if self.timeout_waiting_ballot_ms < self.timeout_waiting_proposal_ms {
            return Err(PolicyError::TimeoutOrder {
                ballot_ms: self.timeout_waiting_ballot_ms,
                proposal_ms: self.timeout_waiting_proposal_ms,
            });
        }
        Ok(())
    }

    /// Threshold for an acting set of `acting` members.
    pub fn threshold(&self, acting: usize) -> Result<Threshold, ThresholdError> {
        Threshold::new(acting, self.threshold_percent)
    }

    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let policy: Policy =
            serde_json::from_str(json).map_err(|e| PolicyError::Json(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn timeout_waiting_proposal(&self) -> Duration {
        Duration::from_millis(self.timeout_waiting_proposal_ms)
    }

    pub fn timeout_waiting_ballot(&self) -> Duration {
        Duration::from_millis(self.timeout_waiting_ballot_ms)
    }

    pub fn interval_broadcasting_init(&self) -> Duration {
        Duration::from_millis(self.interval_broadcasting_init_ms)
    }

    pub fn interval_broadcasting_accept(&self) -> Duration {
        Duration::from_millis(self.interval_broadcasting_accept_ms)
    }

    pub fn interval_sync_retry(&self) -> Duration {
        Duration::from_millis(self.interval_sync_retry_ms)
    }

    pub fn interval_commit_retry(&self) -> Duration {
        Duration::from_millis(self.interval_commit_retry_ms)
    }
}
