//! Prometheus instrumentation for the consensus core.
//!
//! Metrics are registered into a caller-supplied [`Registry`] so several
//! validators in one process can each carry their own set (distinguished by
//! a const `node` label) and the node binary decides how to expose them.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use super::ballot::Stage;
use super::ballotbox::Verdict;
use super::home::NodeState;

#[derive(Debug, Clone)]
pub struct ConsensusMetrics {
    pub ballots_accepted: IntCounterVec,
    pub seals_rejected: IntCounterVec,
    pub verdicts: IntCounterVec,
    pub transitions: IntCounterVec,
    pub blocks_committed: IntCounter,
    pub commit_failures: IntCounter,
    pub round_changes: IntCounter,
    pub height: IntGauge,
    pub round: IntGauge,
}

impl ConsensusMetrics {
    /// Create and register every metric, labelled with `node`.
    pub fn register(registry: &Registry, node: &str) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace("isaac")
                .const_label("node", node)
        };

        let ballots_accepted = IntCounterVec::new(
            opts("ballots_accepted_total", "Ballots filed into the ballotbox"),
            &["stage"],
        )?;
        let seals_rejected = IntCounterVec::new(
            opts("seals_rejected_total", "Seals refused by the vote compiler"),
            &["reason"],
        )?;
        let verdicts = IntCounterVec::new(
            opts("verdicts_total", "Buckets concluded, by verdict"),
            &["stage", "verdict"],
        )?;
        let transitions = IntCounterVec::new(
            opts("state_transitions_total", "Handler swaps, by target state"),
            &["state"],
        )?;
        let blocks_committed = IntCounter::with_opts(opts(
            "blocks_committed_total",
            "Blocks committed to storage",
        ))?;
        let commit_failures = IntCounter::with_opts(opts(
            "commit_failures_total",
            "Failed block commits",
        ))?;
        let round_changes = IntCounter::with_opts(opts(
            "round_changes_total",
            "Rounds abandoned by draw or timeout",
        ))?;
        let height = IntGauge::with_opts(opts("height", "Working height"))?;
        let round = IntGauge::with_opts(opts("round", "Current round"))?;

        registry.register(Box::new(ballots_accepted.clone()))?;
        registry.register(Box::new(seals_rejected.clone()))?;
        registry.register(Box::new(verdicts.clone()))?;
        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(blocks_committed.clone()))?;
        registry.register(Box::new(commit_failures.clone()))?;
        registry.register(Box::new(round_changes.clone()))?;
        registry.register(Box::new(height.clone()))?;
        registry.register(Box::new(round.clone()))?;

        Ok(Self {
            ballots_accepted,
            seals_rejected,
            verdicts,
            transitions,
            blocks_committed,
            commit_failures,
            round_changes,
            height,
            round,
        })
    }

    pub fn ballot_accepted(&self, stage: Stage) {
        self.ballots_accepted
            .with_label_values(&[stage.as_str()])
            .inc();
    }

    pub fn seal_rejected(&self, reason: &str) {
        self.seals_rejected.with_label_values(&[reason]).inc();
    }

    pub fn verdict(&self, stage: Stage, verdict: &Verdict) {
        self.verdicts
            .with_label_values(&[stage.as_str(), verdict.as_str()])
            .inc();
    }

    pub fn transition(&self, state: NodeState) {
        self.transitions.with_label_values(&[state.as_str()]).inc();
    }

    pub fn position(&self, height: u64, round: u64) {
        self.height.set(height as i64);
        self.round.set(round as i64);
    }
}
