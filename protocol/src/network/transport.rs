//! # Transport
//!
//! The consensus core's only contract with the network: [`Transport::
//! broadcast`] hands a seal to every validator, the sender included, at
//! least once and in no particular order. Duplicates are harmless because a
//! repeated ballot overwrites itself in the ballotbox.
//!
//! [`LocalNetwork`] is an in-process hub for running several validators
//! in one process. Each registered node gets a bounded inbound queue of
//! encoded seals. A node can be taken offline to simulate a partition.

use std::fmt;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::codec::{CodecError, SealCodec};
use super::seal::Seal;
use crate::crypto::Address;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("node {0} is not registered on this network")]
    UnknownNode(Address),

    #[error("node {0} is offline")]
    Offline(Address),
}

/// Outbound side of the network, as seen by one node.
pub trait Transport: Send + Sync + fmt::Debug {
    fn broadcast(&self, seal: &Seal) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// LocalNetwork
// ---------------------------------------------------------------------------

/// In-process broadcast hub.
#[derive(Debug)]
pub struct LocalNetwork {
    codec: Arc<dyn SealCodec>,
    inboxes: DashMap<Address, mpsc::Sender<Vec<u8>>>,
    offline: DashSet<Address>,
    capacity: usize,
}

impl LocalNetwork {
    pub fn new(codec: Arc<dyn SealCodec>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            codec,
            inboxes: DashMap::new(),
            offline: DashSet::new(),
            capacity,
        })
    }

    /// Register `node` and return its inbound queue plus its outbound
    /// endpoint. Registering again replaces the previous queue.
    pub fn register(self: &Arc<Self>, node: Address) -> (LocalEndpoint, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.inboxes.insert(node.clone(), tx);
        let endpoint = LocalEndpoint {
            network: Arc::clone(self),
            node,
        };
        (endpoint, rx)
    }

    /// Cut `node` off: it neither sends nor receives until brought back.
    pub fn set_offline(&self, node: &Address, offline: bool) {
        if offline {
            self.offline.insert(node.clone());
        } else {
            self.offline.remove(node);
        }
    }

    pub fn is_offline(&self, node: &Address) -> bool {
        self.offline.contains(node)
    }

    pub fn nodes(&self) -> Vec<Address> {
        let mut nodes: Vec<Address> = self.inboxes.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    fn deliver(&self, from: &Address, seal: &Seal) -> Result<(), TransportError> {
        if !self.inboxes.contains_key(from) {
            return Err(TransportError::UnknownNode(from.clone()));
        }
        if self.is_offline(from) {
            return Err(TransportError::Offline(from.clone()));
        }

        let bytes = self.codec.encode(seal)?;
        for inbox in self.inboxes.iter() {
            if self.is_offline(inbox.key()) {
                continue;
            }
            // A full or closed queue loses this copy. Periodic re-broadcast
            // covers the loss.
            if let Err(e) = inbox.value().try_send(bytes.clone()) {
                warn!(to = %inbox.key(), from = %from, error = %e, "dropped seal");
            }
        }
        debug!(from = %from, hint = seal.hint(), bytes = bytes.len(), "broadcast seal");
        Ok(())
    }
}

/// One node's handle on a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    network: Arc<LocalNetwork>,
    node: Address,
}

impl LocalEndpoint {
    pub fn node(&self) -> &Address {
        &self.node
    }
}

impl Transport for LocalEndpoint {
    fn broadcast(&self, seal: &Seal) -> Result<(), TransportError> {
        self.network.deliver(&self.node, seal)
    }
}

// ---------------------------------------------------------------------------
// RecordingTransport
// ---------------------------------------------------------------------------

/// Keeps every broadcast seal in memory. Delivers nothing.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Seal>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Seal> {
        self.sent.lock().clone()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<Seal> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl Transport for RecordingTransport {
    fn broadcast(&self, seal: &Seal) -> Result<(), TransportError> {
        self.sent.lock().push(seal.clone());
        Ok(())
    }
}
