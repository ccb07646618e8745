//! # CLI Interface
//!
//! Command-line structure for `isaac-node`, built with `clap` derive.
//! Three subcommands: `run`, `init` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// ISAAC consensus node.
///
/// Runs a set of ISAAC validators in one process over an in-memory
/// broadcast network, and exposes their progress over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "isaac-node",
    about = "ISAAC consensus node",
    version,
    propagate_version = true
)]
pub struct IsaacNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the validators and the HTTP API.
    Run(RunArgs),
    /// Write a default configuration file.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node configuration file (JSON).
    ///
    /// Built-in defaults are used when omitted.
    #[arg(long, short = 'c', env = "ISAAC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for on-disk block stores, one sled database per validator.
    ///
    /// Blocks are kept in memory when omitted.
    #[arg(long, short = 'd', env = "ISAAC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Number of validators to run. Overrides the configuration file.
    #[arg(long, short = 'n', env = "ISAAC_VALIDATORS")]
    pub validators: Option<usize>,

    /// Port for the HTTP API. Overrides the configuration file.
    #[arg(long, env = "ISAAC_API_PORT")]
    pub api_port: Option<u16>,

    /// Stop once every validator has committed this height.
    #[arg(long, env = "ISAAC_TARGET_HEIGHT")]
    pub target_height: Option<u64>,

    #[arg(long, env = "ISAAC_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Where to write the configuration.
    #[arg(long, short = 'o', default_value = "isaac.json")]
    pub output: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}
