//! Syncing: fetch the blocks we missed, commit them in order, then rejoin.
//!
//! The home state moves once, after the last missing block is stored, so
//! the compiler keeps treating the node as behind until the gap is closed.

use tracing::{debug, info, warn};

use super::{sync_target, HandlerResult, Scope, Transition};
use crate::consensus::ballot::Height;
use crate::consensus::ballotbox::VoteResult;
use crate::consensus::timer::TimerKind;
use crate::network::fetch_verified;
use crate::storage::StorageError;

#[derive(Debug)]
pub struct SyncingHandler {
    /// Working height to reach.
    target: Height,
    trigger: Option<VoteResult>,
    attempts: u32,
}

impl SyncingHandler {
    pub fn new(target: Height, trigger: Option<VoteResult>) -> Self {
        Self {
            target,
            trigger,
            attempts: 0,
        }
    }

    pub fn target(&self) -> Height {
        self.target
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(super) fn enter(&mut self, scope: &mut Scope<'_>) -> HandlerResult {
        info!(
            node = %scope.ctx.node,
            height = scope.ctx.home.height(),
            target = self.target,
            trigger = ?self.trigger.as_ref().map(VoteResult::key),
            "syncing"
        );
        self.catch_up(scope)
    }

    pub(super) fn on_vote(&mut self, scope: &mut Scope<'_>, vr: &VoteResult) -> HandlerResult {
        if vr.concluded_now && vr.majority().is_some() && sync_target(vr) > self.target {
            debug!(
                node = %scope.ctx.node,
                from = self.target,
                to = sync_target(vr),
                "sync target extended"
            );
            self.target = sync_target(vr);
        }
        Ok(None)
    }

    pub(super) fn on_timer(&mut self, scope: &mut Scope<'_>, kind: TimerKind) -> HandlerResult {
        if kind == TimerKind::SyncRetry {
            return self.catch_up(scope);
        }
        Ok(None)
    }

    fn catch_up(&mut self, scope: &mut Scope<'_>) -> HandlerResult {
        let ctx = scope.ctx;
        let mut tip = ctx
            .store
            .last_block()?
            .ok_or_else(|| StorageError::Corrupted("store has no genesis block".into()))?;

        while tip.height() + 1 < self.target {
            let height = tip.height() + 1;
            let fetched = fetch_verified(ctx.block_source.as_ref(), height, &tip)
                .map_err(|e| e.to_string())
                .and_then(|block| {
                    ctx.store
                        .commit(&block)
                        .map(|_| block)
                        .map_err(|e| e.to_string())
                });
            match fetched {
                Ok(block) => {
                    ctx.operations.remove_committed(&block);
                    if let Some(metrics) = &ctx.metrics {
                        metrics.blocks_committed.inc();
                    }
                    debug!(height, hash = %block.hash(), "synced block");
                    tip = block;
                }
                Err(reason) => {
                    self.attempts += 1;
                    warn!(
                        node = %ctx.node,
                        height,
                        target = self.target,
                        attempt = self.attempts,
                        %reason,
                        "sync attempt failed"
                    );
                    scope.arm(TimerKind::SyncRetry, ctx.policy.interval_sync_retry());
                    return Ok(None);
                }
            }
        }

        ctx.home.advance(&tip);
        let height = ctx.home.height();
        ctx.ballotbox.prune_below(height);
        ctx.proposals.prune_below(height);
        info!(node = %ctx.node, height, attempts = self.attempts, "sync complete");
        Ok(Some(Transition::Join))
    }
}
