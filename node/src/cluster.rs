//! # In-Process Validator Network
//!
//! Starts N validators that share one [`LocalNetwork`]. Each gets its own
//! block store, home state, operation pool and consensus runtime task. A
//! validator syncs missing blocks from the stores of the others.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use prometheus::Registry;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use isaac_protocol::config::INBOUND_QUEUE_CAPACITY;
use isaac_protocol::consensus::{
    ConsensusRuntime, ContextBuilder, HomeState, HomeStateCell, OperationPool, RuntimeError,
    StateController, ValidatorSet,
};
use isaac_protocol::crypto::Address;
use isaac_protocol::network::{LocalNetwork, PeerBlockSource};
use isaac_protocol::storage::{BlockStore, MemoryBlockStore, SledBlockStore};

use crate::config::NodeConfig;

const HEIGHT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What the node keeps of one running validator.
#[derive(Debug, Clone)]
pub struct ValidatorHandle {
    pub index: usize,
    pub address: Address,
    pub home: Arc<HomeStateCell>,
    pub operations: Arc<OperationPool>,
}

impl ValidatorHandle {
    pub fn snapshot(&self) -> HomeState {
        self.home.snapshot()
    }
}

/// Queue `operation` on each validator's pool. Returns how many took it.
pub fn submit(validators: &[ValidatorHandle], operation: &[u8]) -> usize {
    validators
        .iter()
        .filter(|v| v.operations.push(operation.to_vec()))
        .count()
}

type RuntimeTask = JoinHandle<Result<StateController, RuntimeError>>;

pub struct Cluster {
    validators: Vec<ValidatorHandle>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<RuntimeTask>,
}

impl Cluster {
    /// Build every validator and spawn its runtime. Must run inside a tokio
    /// runtime.
    ///
    /// With `data_dir`, validator `i` stores blocks in `data_dir/node-i`
    /// (sled). Otherwise blocks stay in memory.
    pub fn start(config: &NodeConfig, data_dir: Option<&Path>, registry: &Registry) -> Result<Self> {
        config.validate()?;

        let keys: Vec<_> = (0..config.validators).map(|i| config.keypair(i)).collect();
        let validators =
            ValidatorSet::from_keys(keys.iter().map(|k| k.public_key())).into_shared();
        let codec = config.codec.build();
        let network = LocalNetwork::new(codec.clone(), INBOUND_QUEUE_CAPACITY);

        let stores = (0..config.validators)
            .map(|i| open_store(data_dir, i))
            .collect::<Result<Vec<_>>>()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(keys.len());
        let mut runtimes = Vec::with_capacity(keys.len());

        // Register everyone before anyone starts broadcasting.
        for (index, key) in keys.into_iter().enumerate() {
            let address = key.address();
            let (endpoint, inbound) = network.register(address.clone());
            let peers = stores
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, store)| store.clone())
                .collect();
            let home = Arc::new(HomeStateCell::default());
            let operations = Arc::new(OperationPool::new());

            let ctx = ContextBuilder::new(key, validators.clone(), stores[index].clone(), Arc::new(endpoint))
                .policy(config.policy.clone())
                .suffrage(config.suffrage.clone())
                .block_source(Arc::new(PeerBlockSource::with_peers(peers)))
                .operations(operations.clone())
                .home(home.clone())
                .metrics(registry.clone())
                .build()
                .with_context(|| format!("failed to build validator {index}"))?;

            runtimes.push(ConsensusRuntime::new(
                StateController::new(Arc::new(ctx)),
                inbound,
                codec.clone(),
            ));
            handles.push(ValidatorHandle {
                index,
                address,
                home,
                operations,
            });
        }

        let tasks = runtimes
            .into_iter()
            .map(|runtime| tokio::spawn(runtime.run(shutdown_rx.clone())))
            .collect();

        info!(
            validators = handles.len(),
            codec = codec.name(),
            persistent = data_dir.is_some(),
            "validator network started"
        );

        Ok(Self {
            validators: handles,
            shutdown,
            tasks,
        })
    }

    pub fn validators(&self) -> &[ValidatorHandle] {
        &self.validators
    }

    /// Lowest committed height over all validators. `None` while any
    /// validator is still booting.
    pub fn min_committed_height(&self) -> Option<u64> {
        self.validators
            .iter()
            .map(|v| v.home.snapshot().committed_height())
            .min()
            .flatten()
    }

    /// Queue `operation` on every validator. Returns how many pools took it.
    pub fn submit(&self, operation: &[u8]) -> usize {
        submit(&self.validators, operation)
    }

    /// Resolve once every validator has committed `target`.
    pub async fn wait_for_height(&self, target: u64) {
        loop {
            if self.min_committed_height().is_some_and(|h| h >= target) {
                return;
            }
            tokio::time::sleep(HEIGHT_POLL_INTERVAL).await;
        }
    }

    /// True once every runtime task has returned.
    pub fn all_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }

    /// Signal shutdown and wait for every runtime. Returns the stopped
    /// controllers in validator order.
    pub async fn shutdown(self) -> Result<Vec<StateController>> {
        // Runtimes that already left their loop dropped their receivers.
        let _ = self.shutdown.send(true);

        let mut controllers = Vec::with_capacity(self.tasks.len());
        for (index, task) in self.tasks.into_iter().enumerate() {
            let controller = task
                .await
                .map_err(|e| anyhow!("validator {index} task failed: {e}"))?
                .with_context(|| format!("validator {index} runtime failed"))?;
            controllers.push(controller);
        }
        info!(validators = controllers.len(), "validator network stopped");
        Ok(controllers)
    }
}

fn open_store(data_dir: Option<&Path>, index: usize) -> Result<Arc<dyn BlockStore>> {
    match data_dir {
        Some(dir) => {
            let path = dir.join(format!("node-{index}"));
            let store = SledBlockStore::open(&path)
                .with_context(|| format!("failed to open block store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryBlockStore::new())),
    }
}
