//! # Timers
//!
//! Handler timers are plain data: a kind, a deadline and the controller
//! epoch that was current when the timer was armed. Nothing runs in the
//! background. The runtime sleeps until [`Timers::next_deadline`], then asks
//! the controller to fire whatever is due.
//!
//! ```text
//!   handler arms ──► Timers { (kind, deadline, epoch) ... }
//!                         │
//!   runtime sleeps ◄──────┘ next_deadline()
//!        │
//!        └──► due(now) ──► take(due) ──► TimerFired { kind, epoch }
//!                                                │
//!                    controller: epoch == current? ──► handler.on_timer
//!                                         else      ──► dropped
//! ```
//!
//! A handler swap bumps the epoch, so a timer armed by an earlier handler
//! can never reach a later one. Within one epoch every arm gets its own
//! sequence number: [`Timers::take`] only hands out a due timer that is still
//! armed by the same call, so a callback that cancels or re-arms a timer
//! wins over a snapshot taken before it ran. The [`Clock`] trait lets tests drive time
//! by hand with [`ManualClock`].

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Source of "now" for the controller and handlers.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    /// Re-send the current INIT ballot.
    BroadcastInit,
    /// No majority or draw in time; move to the next round.
    RoundTimeout,
    /// INIT agreed but no valid proposal arrived in time.
    WaitProposal,
    /// Re-send the current ACCEPT ballot.
    BroadcastAccept,
    SyncRetry,
    CommitRetry,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::BroadcastInit => "broadcast-init",
            TimerKind::RoundTimeout => "round-timeout",
            TimerKind::WaitProposal => "wait-proposal",
            TimerKind::BroadcastAccept => "broadcast-accept",
            TimerKind::SyncRetry => "sync-retry",
            TimerKind::CommitRetry => "commit-retry",
        }
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timer that came due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub epoch: u64,
}

/// A timer found due by [`Timers::due`], not yet claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueTimer {
    kind: TimerKind,
    seq: u64,
}

impl DueTimer {
    pub fn kind(&self) -> TimerKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    kind: TimerKind,
    deadline: Instant,
    epoch: u64,
    seq: u64,
}

/// Armed timers. At most one per kind.
#[derive(Debug, Default)]
pub struct Timers {
    entries: Vec<TimerEntry>,
    next_seq: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire at `deadline`, replacing any armed timer of the
    /// same kind.
    pub fn arm(&mut self, kind: TimerKind, deadline: Instant, epoch: u64) {
        self.cancel(kind);
        self.next_seq += 1;
        self.entries.push(TimerEntry {
            kind,
            deadline,
            epoch,
            seq: self.next_seq,
        });
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.kind != kind);
        before != self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.entries
            .iter()
            .find(|e| e.kind == kind)
            .map(|e| e.deadline)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Timers due at `now`, earliest first. Nothing is removed.
    pub fn due(&self, now: Instant) -> Vec<DueTimer> {
        let mut due: Vec<&TimerEntry> = self
            .entries
            .iter()
            .filter(|e| e.deadline <= now)
            .collect();
        due.sort_by_key(|e| (e.deadline, e.seq));
        due.into_iter()
            .map(|e| DueTimer {
                kind: e.kind,
                seq: e.seq,
            })
            .collect()
    }

    /// Disarm and return the timer behind `due`, unless it was cancelled or
    /// re-armed since [`Timers::due`] saw it.
    pub fn take(&mut self, due: DueTimer) -> Option<TimerFired> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.kind == due.kind && e.seq == due.seq)?;
        let entry = self.entries.swap_remove(idx);
        Some(TimerFired {
            kind: entry.kind,
            epoch: entry.epoch,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
