// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # ISAAC Node
//!
//! Entry point for the `isaac-node` binary. Parses CLI arguments, sets up
//! logging and metrics, runs a validator network in this process and
//! serves the HTTP API.
//!
//! - `run`     - start the validators and the API
//! - `init`    - write a default configuration file
//! - `version` - print build version information

mod api;
mod cli;
mod cluster;
mod config;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use isaac_protocol::config::PROTOCOL_VERSION;

use cli::{Commands, IsaacNodeCli};
use cluster::Cluster;
use config::NodeConfig;
use metrics::NodeMetrics;

/// How often the node refreshes its own gauges.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = IsaacNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_config(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the validators, the operation feeder and the API server, then
/// waits for the target height or a shutdown signal.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_DIRECTIVE, args.log_format);

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(n) = args.validators {
        config.validators = n;
    }
    if let Some(port) = args.api_port {
        config.api_port = port;
    }
    config.validate()?;

    if let Some(dir) = &args.data_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data directory: {}", dir.display()))?;
    }

    tracing::info!(
        validators = config.validators,
        threshold = config.policy.threshold_percent,
        api_port = config.api_port,
        target_height = ?args.target_height,
        data_dir = ?args.data_dir,
        "starting isaac-node"
    );

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register node metrics")?);
    node_metrics.validators.set(config.validators as i64);

    // --- Validators ---
    let cluster = Cluster::start(&config, args.data_dir.as_deref(), &node_metrics.registry())?;

    // --- API server ---
    let app_state = api::AppState {
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        started_at: chrono::Utc::now(),
        validators: Arc::new(cluster.validators().to_vec()),
        metrics: Arc::clone(&node_metrics),
    };
    let api_router = api::create_router(app_state.clone());
    let api_addr = format!("0.0.0.0:{}", config.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);
    let mut server = tokio::spawn(async move { axum::serve(api_listener, api_router).await });

    // --- Operation feeder ---
    let feeder = (config.operation_interval_ms > 0).then(|| {
        let validators = Arc::clone(&app_state.validators);
        let metrics = Arc::clone(&node_metrics);
        let period = Duration::from_millis(config.operation_interval_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut sequence: u64 = 0;
            loop {
                interval.tick().await;
                sequence += 1;
                let operation = format!("op-{}-{}", chrono::Utc::now().timestamp_millis(), sequence);
                if cluster::submit(&validators, operation.as_bytes()) > 0 {
                    metrics.operations_submitted_total.inc();
                }
            }
        })
    });

    // --- Wait ---
    let target = args.target_height;
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
        _ = wait_for_target(&cluster, target) => {
            tracing::info!(target = ?target, "target height reached");
            Ok(())
        }
        _ = monitor(&cluster, &node_metrics) => {
            Err(anyhow::anyhow!("every validator stopped"))
        }
        res = &mut server => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("API server failed")),
            Err(e) => Err(anyhow::Error::new(e).context("API server task failed")),
        },
    };

    if let Some(feeder) = feeder {
        feeder.abort();
    }
    server.abort();
    let controllers = cluster.shutdown().await?;
    for controller in &controllers {
        let home = controller.context().home.snapshot();
        tracing::info!(
            node = %controller.context().node,
            height = home.height,
            last_block = %home.last_block,
            "validator finished"
        );
    }
    tracing::info!("isaac-node stopped");
    outcome
}

async fn wait_for_target(cluster: &Cluster, target: Option<u64>) {
    match target {
        Some(target) => cluster.wait_for_height(target).await,
        None => std::future::pending().await,
    }
}

/// Keeps the node gauges current. Returns once every runtime has exited.
async fn monitor(cluster: &Cluster, metrics: &NodeMetrics) {
    let mut interval = tokio::time::interval(MONITOR_INTERVAL);
    loop {
        interval.tick().await;
        if let Some(height) = cluster.min_committed_height() {
            metrics.min_committed_height.set(height as i64);
        }
        if cluster.all_finished() {
            return;
        }
    }
}

/// Writes the default configuration to `args.output`.
fn init_config(args: cli::InitArgs) -> Result<()> {
    let path = &args.output;
    if path.exists() && !args.force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    let config = NodeConfig::default();
    std::fs::write(path, config.to_json()?)
        .with_context(|| format!("failed to write config to {}", path.display()))?;

    println!("Configuration written.");
    println!("  Path        : {}", path.display());
    println!("  Validators  : {}", config.validators);
    println!("  Threshold   : {}%", config.policy.threshold_percent);
    println!("  API port    : {}", config.api_port);
    Ok(())
}

fn print_version() {
    println!("isaac-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol   {}", PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
