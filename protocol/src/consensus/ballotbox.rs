//! # Ballotbox
//!
//! Concurrent vote ledger. Ballots are filed into buckets keyed by
//! `(height, round, stage)`; each bucket has its own lock, so tallying one
//! round never waits on another.
//!
//! ## Rules
//!
//! - One effective vote per node per bucket. A later ballot from the same
//!   node overwrites the earlier one.
//! - Only acting members count. Ballots from other nodes are recorded for
//!   audit but excluded from the tally. The ballotbox does not know about
//!   suffrage: the caller passes the acting members and the minimum.
//! - A bucket concludes at the first Majority or Draw. The concluded result
//!   is frozen into a snapshot that is read without taking the bucket lock.
//!   Later ballots are still recorded but never change the verdict.
//!
//! ## Draw
//!
//! A bucket is a draw when no hash can reach `minimum` even if every acting
//! member that has not voted yet voted for it:
//!
//! ```text
//! draw  <=>  max(count[h]) + (acting - voted) < minimum
//! ```
//!
//! At the exact boundary (`max + remaining == minimum`) the bucket is still
//! NotYet.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ballot::{Ballot, BucketKey, Height, Round, Stage};
use crate::crypto::{Address, Hash};

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Conclusion of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    NotYet,
    Draw,
    Majority(Hash),
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::NotYet => "not-yet",
            Verdict::Draw => "draw",
            Verdict::Majority(_) => "majority",
        }
    }
}

/// Outcome of filing a ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResult {
    pub height: Height,
    pub round: Round,
    pub stage: Stage,
    pub verdict: Verdict,
    /// Acting members whose votes were counted for this verdict.
    pub voters: BTreeSet<Address>,
    /// Proposal hash carried by the majority ballots, if any.
    pub proposal: Option<Hash>,
    /// True only for the ballot that concluded the bucket. Handlers react to
    /// a bucket exactly once by checking this flag.
    pub concluded_now: bool,
}

impl VoteResult {
    pub fn key(&self) -> BucketKey {
        BucketKey::new(self.height, self.round, self.stage)
    }

    pub fn majority(&self) -> Option<Hash> {
        match self.verdict {
            Verdict::Majority(h) => Some(h),
            _ => None,
        }
    }

    pub fn is_concluded(&self) -> bool {
        self.verdict != Verdict::NotYet
    }
}

/// How to tally a bucket: who counts and how many votes a hash needs.
#[derive(Debug, Clone, Copy)]
pub struct TallyRule<'a> {
    pub minimum: usize,
    pub members: &'a [Address],
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Record {
    voting_hash: Hash,
    proposal: Option<Hash>,
}

#[derive(Debug, Default)]
struct Bucket {
    records: HashMap<Address, Record>,
}

#[derive(Debug, Default)]
struct BucketCell {
    state: Mutex<Bucket>,
    concluded: OnceLock<VoteResult>,
}

/// The vote ledger. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct Ballotbox {
    buckets: DashMap<BucketKey, Arc<BucketCell>>,
}

impl Ballotbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// File `ballot` and return the bucket's verdict.
    ///
    /// The ballot must already be verified. Ballots without a voting hash
    /// are recorded under the zero hash and never win a majority in
    /// practice because verified ballots always carry one.
    pub fn vote(&self, ballot: &Ballot, rule: TallyRule<'_>) -> VoteResult {
        let key = ballot.bucket();
        let cell = self.cell(key);

        let mut bucket = cell.state.lock();
        let previous = bucket.records.insert(
            ballot.node.clone(),
            Record {
                voting_hash: ballot.voting_hash().unwrap_or(Hash::ZERO),
                proposal: ballot.body.proposal,
            },
        );
        if previous.is_some() {
            debug!(bucket = %key, node = %ballot.node, "ballot overwrote earlier vote");
        }

        if let Some(done) = cell.concluded.get() {
            let mut snapshot = done.clone();
            snapshot.concluded_now = false;
            return snapshot;
        }

        let mut result = tally(key, &bucket, rule);
        if result.is_concluded() {
            // Set under the bucket lock, so no other vote can race past the
            // `concluded.get()` check above.
            let _ = cell.concluded.set(result.clone());
            result.concluded_now = true;
        }
        result
    }

    /// Concluded snapshot of a bucket, if it has concluded. Lock-free.
    pub fn concluded(&self, key: BucketKey) -> Option<VoteResult> {
        let cell = self.buckets.get(&key).map(|c| Arc::clone(c.value()))?;
        cell.concluded.get().cloned()
    }

    /// Concluded buckets at or above `height`, ordered by key.
    pub fn concluded_from(&self, height: Height) -> Vec<VoteResult> {
        let mut results: Vec<VoteResult> = self
            .buckets
            .iter()
            .filter(|entry| entry.key().height >= height)
            .filter_map(|entry| entry.value().concluded.get().cloned())
            .collect();
        results.sort_by_key(VoteResult::key);
        results
    }

    /// Every recorded vote in a bucket, acting or not, keyed by node.
    pub fn records(&self, key: BucketKey) -> BTreeMap<Address, Hash> {
        let Some(cell) = self.buckets.get(&key).map(|c| Arc::clone(c.value())) else {
            return BTreeMap::new();
        };
        let bucket = cell.state.lock();
        bucket
            .records
            .iter()
            .map(|(node, record)| (node.clone(), record.voting_hash))
            .collect()
    }

    /// Drop every bucket below `height`. Returns the number removed.
    pub fn prune_below(&self, height: Height) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|key, _| key.height >= height);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(below = height, removed, "pruned ballotbox buckets");
        }
        removed
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn cell(&self, key: BucketKey) -> Arc<BucketCell> {
        // Clone the Arc out so the map shard lock is released before the
        // bucket lock is taken.
        Arc::clone(self.buckets.entry(key).or_default().value())
    }
}

fn tally(key: BucketKey, bucket: &Bucket, rule: TallyRule<'_>) -> VoteResult {
    let mut counts: BTreeMap<Hash, usize> = BTreeMap::new();
    let mut voters = BTreeSet::new();
    for (node, record) in &bucket.records {
        if rule.members.contains(node) {
            *counts.entry(record.voting_hash).or_default() += 1;
            voters.insert(node.clone());
        }
    }

    // Highest count wins; ties go to the lowest hash so every node picks the
    // same leader. Only reachable with percent <= 50.
    let leader = counts
        .iter()
        .max_by(|(ha, ca), (hb, cb)| ca.cmp(cb).then_with(|| hb.cmp(ha)))
        .map(|(h, c)| (*h, *c));

    let remaining = rule.members.len().saturating_sub(voters.len());
    let verdict = match leader {
        Some((hash, count)) if count >= rule.minimum => Verdict::Majority(hash),
        Some((_, count)) if count + remaining < rule.minimum => Verdict::Draw,
        _ => Verdict::NotYet,
    };

    let proposal = match verdict {
        Verdict::Majority(hash) => {
            let mut nodes: Vec<_> = bucket
                .records
                .iter()
                .filter(|(node, r)| r.voting_hash == hash && voters.contains(*node))
                .collect();
            nodes.sort_by(|a, b| a.0.cmp(b.0));
            nodes.into_iter().find_map(|(_, r)| r.proposal)
        }
        _ => None,
    };

    VoteResult {
        height: key.height,
        round: key.round,
        stage: key.stage,
        verdict,
        voters,
        proposal,
        concluded_now: false,
    }
}
