//! # Consensus Runtime
//!
//! The async driver around a [`StateController`]. One task per validator,
//! one consumer of that validator's inbound queue:
//!
//! ```text
//!   loop {
//!     select! {
//!       shutdown changed      ──► stop
//!       inbound bytes         ──► decode ──► controller.dispatch
//!       next timer deadline   ──► controller.poll_timers
//!     }
//!   }
//! ```
//!
//! Everything the controller does happens on this task, so ballots for one
//! bucket are always filed in arrival order.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::controller::{ControllerError, StateController};
use super::home::NodeState;
use crate::network::SealCodec;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),
}

/// Drives one validator until shutdown.
#[derive(Debug)]
pub struct ConsensusRuntime {
    controller: StateController,
    inbound: mpsc::Receiver<Vec<u8>>,
    codec: Arc<dyn SealCodec>,
}

impl ConsensusRuntime {
    pub fn new(
        controller: StateController,
        inbound: mpsc::Receiver<Vec<u8>>,
        codec: Arc<dyn SealCodec>,
    ) -> Self {
        Self {
            controller,
            inbound,
            codec,
        }
    }

    pub fn controller(&self) -> &StateController {
        &self.controller
    }

    /// Start the controller and run until `shutdown` flips to `true`, its
    /// sender is dropped, the inbound queue closes or the node stops.
    ///
    /// Returns the stopped controller for inspection.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<StateController, RuntimeError> {
        let node = self.controller.context().node.clone();
        info!(node = %node, codec = self.codec.name(), "consensus runtime starting");
        self.controller.start()?;

        loop {
            if *shutdown.borrow() {
                info!(node = %node, "shutdown requested");
                break;
            }
            if self.controller.node_state() == Some(NodeState::Stopped) {
                warn!(node = %node, "controller stopped, leaving runtime");
                break;
            }

            let deadline = self
                .controller
                .next_deadline()
                .map(tokio::time::Instant::from_std);

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!(node = %node, "shutdown sender dropped");
                        break;
                    }
                }
                bytes = self.inbound.recv() => match bytes {
                    Some(bytes) => self.handle(&bytes),
                    None => {
                        info!(node = %node, "inbound queue closed");
                        break;
                    }
                },
                _ = sleep_until(deadline) => {
                    if let Err(e) = self.controller.poll_timers() {
                        error!(node = %node, error = %e, "timer handling failed");
                    }
                }
            }
        }

        self.controller.stop()?;
        info!(
            node = %node,
            height = self.controller.context().home.height(),
            "consensus runtime stopped"
        );
        Ok(self.controller)
    }

    fn handle(&mut self, bytes: &[u8]) {
        let seal = match self.codec.decode(bytes) {
            Ok(seal) => seal,
            Err(e) => {
                warn!(error = %e, bytes = bytes.len(), "undecodable seal");
                return;
            }
        };
        match self.controller.dispatch(&seal) {
            Ok(_) => {}
            // Already logged by the controller with its reason.
            Err(ControllerError::Compile(e)) => debug!(reason = e.reason(), "seal dropped"),
            Err(e) => error!(error = %e, "dispatch failed"),
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::consensus::context::ContextBuilder;
    use crate::consensus::home::HomeStateCell;
    use crate::consensus::policy::Policy;
    use crate::consensus::suffrage::ValidatorSet;
    use crate::crypto::Keypair;
    use crate::network::{BincodeCodec, LocalNetwork};
    use crate::storage::{BlockStore, MemoryBlockStore};

    fn fast_policy() -> Policy {
        Policy {
            timeout_waiting_proposal_ms: 200,
            timeout_waiting_ballot_ms: 400,
            interval_broadcasting_init_ms: 50,
            interval_broadcasting_accept_ms: 50,
            interval_sync_retry_ms: 50,
            interval_commit_retry_ms: 20,
            ..Policy::default()
        }
    }

    fn solo() -> (ConsensusRuntime, Arc<HomeStateCell>, Arc<MemoryBlockStore>) {
        let key = Keypair::from_seed(&[9u8; 32]);
        let codec: Arc<dyn SealCodec> = Arc::new(BincodeCodec);
        let network = LocalNetwork::new(codec.clone(), 1024);
        let (endpoint, inbound) = network.register(key.address());
        let store = Arc::new(MemoryBlockStore::new());
        let home = Arc::new(HomeStateCell::default());

        let ctx = ContextBuilder::new(
            key.clone(),
            ValidatorSet::from_keys([key.public_key()]).into_shared(),
            store.clone(),
            Arc::new(endpoint),
        )
        .policy(fast_policy())
        .home(home.clone())
        .build()
        .expect("context");
        let controller = StateController::new(Arc::new(ctx));
        (ConsensusRuntime::new(controller, inbound, codec), home, store)
    }

    #[tokio::test]
    async fn single_validator_commits_blocks() {
        let (runtime, home, store) = solo();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(runtime.run(shutdown_rx));

        let reached = tokio::time::timeout(Duration::from_secs(10), async {
            while home.height() < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "stuck at height {}", home.height());

        shutdown_tx.send(true).expect("send");
        let controller = task.await.expect("join").expect("run");
        assert_eq!(controller.node_state(), Some(NodeState::Stopped));
        assert!(store.last_height().expect("height").unwrap_or(0) >= 4);
    }

    #[tokio::test]
    async fn exits_when_shutdown_already_set() {
        let (runtime, _home, _store) = solo();
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        let controller = runtime.run(shutdown_rx).await.expect("run");
        assert_eq!(controller.node_state(), Some(NodeState::Stopped));
        assert_eq!(controller.live_handlers(), 1);
    }
}
