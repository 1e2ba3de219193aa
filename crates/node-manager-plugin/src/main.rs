//! node-manager-plugin: runs a blockchain node under supervision and keeps
//! its staking addresses at their target rolls.
//!
//! `run` wires the supervisor, the staking engine and the history retention
//! sweep together and blocks until a shutdown signal. `history` prints sampled
//! total-value history from the local database.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use node_manager::{
    AddressChangedDispatcher, HistoryManager, HttpMetrics, KeyFileWallet, MassaClient, Network,
    NodeLogManager, NodeManagerConfig, NodeManagerError, NodeProcessDriver, NodeRpcClient,
    NodeStatus, NodeSupervisor, SqliteStore, StakingManager, StatusDispatcher, Store,
};

mod signals;

const PURGE_EVERY: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "node-manager-plugin", version, about = "Blockchain node supervisor and staking automation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise the node until interrupted.
    Run {
        /// Start the node on this network right away.
        #[arg(long)]
        start: Option<Network>,
        /// Node wallet password, required with --start.
        #[arg(long, env = "NODE_MANAGER_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Print sampled total-value history as JSON.
    History {
        #[arg(long, default_value = "mainnet")]
        network: Network,
        /// Start of the window (RFC 3339). Defaults to 24 hours ago.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 24)]
        samples: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { start, password } => run(start, password).await,
        Command::History {
            network,
            since,
            samples,
        } => history(network, since, samples),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(kind = ?e.kind(), error = %e, "node manager failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(start: Option<Network>, password: Option<String>) -> Result<(), NodeManagerError> {
    // ── Configuration ───────────────────────────────────────────────────
    let config = NodeManagerConfig::from_env()?;
    config.validate()?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        node_api = %config.node_api_url,
        auto_restart = config.supervisor.auto_restart,
        "starting node manager"
    );

    // ── Storage and history retention ───────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&config.db_path().to_string_lossy())?);
    let history = Arc::new(HistoryManager::new(store.clone(), &config.history));
    if let Err(e) = history.purge_expired(Utc::now()) {
        tracing::warn!(error = %e, "startup history purge failed");
    }
    let shutdown = CancellationToken::new();
    let purge_task = tokio::spawn(purge_loop(history, shutdown.child_token()));

    // ── Node supervisor ─────────────────────────────────────────────────
    let status = StatusDispatcher::new(NodeStatus::Off);
    let api = Arc::new(NodeRpcClient::new(config.node_api_url.clone(), config.http_timeout)?);
    let metrics = Arc::new(HttpMetrics::new(config.metrics_url.clone(), config.http_timeout)?);
    let logs = Arc::new(NodeLogManager::new(config.logs_dir(), config.log_max_bytes)?);
    let supervisor = NodeSupervisor::new(
        config.supervisor.clone(),
        Arc::new(NodeProcessDriver::new(&config)),
        api.clone(),
        metrics,
        logs,
        status.clone(),
    );

    // ── Staking engine ──────────────────────────────────────────────────
    let staking = StakingManager::new(
        config.staking.clone(),
        api,
        Arc::new(MassaClient::new(&config)),
        store,
        Arc::new(KeyFileWallet::new(config.wallet_dir())),
        Arc::new(supervisor.clone()),
        status.clone(),
        AddressChangedDispatcher::new(Vec::new()),
    );
    let staking_task = staking.spawn();

    // ── Feeds ───────────────────────────────────────────────────────────
    let (mut status_rx, status_unsub) = status.subscribe_all("status-logger");
    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            tracing::info!(%status, "node status changed");
        }
    });
    let (mut address_rx, address_unsub) = staking.address_changes("address-logger");
    tokio::spawn(async move {
        while let Some(addresses) = address_rx.recv().await {
            let rolls: u64 = addresses.iter().map(|a| a.candidate_rolls).sum();
            tracing::info!(count = addresses.len(), rolls, "staking addresses changed");
        }
    });

    if let Some(network) = start {
        let password = password.ok_or_else(|| {
            NodeManagerError::Config("--start needs NODE_MANAGER_PASSWORD or --password".into())
        })?;
        supervisor.start_node(network, &password)?;
    }

    signals::wait_for_shutdown_signal().await?;

    // ── Shutdown ────────────────────────────────────────────────────────
    staking.close();
    supervisor.close().await;
    shutdown.cancel();
    status_unsub.unsubscribe();
    address_unsub.unsubscribe();
    let _ = staking_task.await;
    let _ = purge_task.await;
    tracing::info!("node manager stopped");
    Ok(())
}

async fn purge_loop(history: Arc<HistoryManager>, cancel: CancellationToken) {
    let mut every = tokio::time::interval_at(tokio::time::Instant::now() + PURGE_EVERY, PURGE_EVERY);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = every.tick() => {
                if let Err(e) = history.purge_expired(Utc::now()) {
                    tracing::warn!(error = %e, "history purge failed");
                }
            }
        }
    }
}

fn history(network: Network, since: Option<DateTime<Utc>>, samples: u32) -> Result<(), NodeManagerError> {
    let config = NodeManagerConfig::from_env()?;
    let store = Arc::new(SqliteStore::new(&config.db_path().to_string_lossy())?);
    let manager = HistoryManager::new(store, &config.history);

    let since = since.unwrap_or_else(|| Utc::now() - chrono::Duration::hours(24));
    let sampled = manager.sample_until_now(since, samples, network)?;
    println!("{}", serde_json::to_string_pretty(&sampled)?);
    Ok(())
}
