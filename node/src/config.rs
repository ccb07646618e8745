//! Node configuration file.
//!
//! JSON, written by `isaac-node init` and read by `isaac-node run --config`.
//! Every field has a default, so a partial file is fine:
//!
//! ```json
//! { "validators": 7, "policy": { "threshold_percent": 80 } }
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use isaac_protocol::consensus::{Policy, SuffrageKind};
use isaac_protocol::crypto::{blake3_hash, Keypair};
use isaac_protocol::network::{BincodeCodec, JsonCodec, SealCodec};

pub const DEFAULT_VALIDATORS: usize = 4;
pub const DEFAULT_API_PORT: u16 = 9741;
pub const DEFAULT_SEED: &str = "isaac-devnet";

/// Wire format between the in-process validators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Bincode,
    Json,
}

impl CodecKind {
    pub fn build(self) -> Arc<dyn SealCodec> {
        match self {
            CodecKind::Bincode => Arc::new(BincodeCodec),
            CodecKind::Json => Arc::new(JsonCodec),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Number of validators started by `run`.
    pub validators: usize,
    /// Validator keys are derived from this seed and the validator index.
    pub seed: String,
    pub policy: Policy,
    pub suffrage: SuffrageKind,
    pub codec: CodecKind,
    pub api_port: u16,
    /// Feed a synthetic operation to every validator at this interval.
    /// 0 disables the feeder.
    pub operation_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            validators: DEFAULT_VALIDATORS,
            seed: DEFAULT_SEED.to_string(),
            policy: Policy::default(),
            suffrage: SuffrageKind::default(),
            codec: CodecKind::default(),
            api_port: DEFAULT_API_PORT,
            operation_interval_ms: 500,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize config")
    }

    /// Fail fast on anything the validators would reject later.
    pub fn validate(&self) -> Result<()> {
        if self.validators == 0 {
            bail!("validators must be at least 1");
        }
        self.policy.validate().context("invalid policy")?;
        Ok(())
    }

    /// The keypair of validator `index`.
    pub fn keypair(&self, index: usize) -> Keypair {
        let material = format!("{}/{}", self.seed, index);
        Keypair::from_seed(&blake3_hash(material.as_bytes()))
    }
}
