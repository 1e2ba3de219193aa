//! Node manager configuration from environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::NodeManagerError;
use crate::network::Network;

/// Binaries for one network.
#[derive(Debug, Clone)]
pub struct NetworkBinaries {
    pub node: PathBuf,
    pub client: PathBuf,
}

/// Node lifecycle settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Bootstrap poll interval (env: NODE_MANAGER_BOOTSTRAP_CHECK_SECS, default: 10).
    pub bootstrap_check_interval: Duration,
    /// Desync poll interval (env: NODE_MANAGER_DESYNC_CHECK_SECS, default: 30).
    pub desync_check_interval: Duration,
    /// How long the cursor lag must persist before desync is confirmed.
    pub desync_grace: Duration,
    /// Wait before an automatic restart (env: NODE_MANAGER_RESTART_COOLDOWN_SECS, default: 5).
    pub restart_cooldown: Duration,
    /// Initial auto-restart flag (env: NODE_MANAGER_AUTO_RESTART, default: false).
    pub auto_restart: bool,
    /// How long `close` waits for the process to exit.
    pub close_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bootstrap_check_interval: Duration::from_secs(10),
            desync_check_interval: Duration::from_secs(30),
            desync_grace: Duration::from_secs(60),
            restart_cooldown: Duration::from_secs(5),
            auto_restart: false,
            close_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StakingConfig {
    /// Reconciliation poll interval (env: NODE_MANAGER_STAKING_POLL_SECS, default: 30).
    pub poll_interval: Duration,
    /// Total-value registration interval (env: NODE_MANAGER_TOTAL_VALUE_SECS, default: 300).
    pub total_value_interval: Duration,
}

impl Default for StakingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            total_value_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Interval at which total value is recorded; the sampler never samples finer.
    pub total_value_interval: Duration,
    /// Age after which value history is purged (env: NODE_MANAGER_HISTORY_RETENTION_DAYS, default: 30).
    pub retention: Duration,
}

/// Configuration for the node manager.
#[derive(Debug, Clone)]
pub struct NodeManagerConfig {
    /// Root for the database, node logs and wallet (env: NODE_MANAGER_DATA_DIR, default: ./data).
    pub data_dir: PathBuf,
    pub mainnet: NetworkBinaries,
    pub buildnet: NetworkBinaries,
    /// Node JSON-RPC endpoint (env: NODE_MANAGER_NODE_API_URL).
    pub node_api_url: String,
    /// Metrics exposition endpoint (env: NODE_MANAGER_METRICS_URL).
    pub metrics_url: String,
    /// Timeout for node API and metrics requests (env: NODE_MANAGER_HTTP_TIMEOUT_SECS, default: 10).
    pub http_timeout: Duration,
    /// Timeout for client commands (env: NODE_MANAGER_CLIENT_TIMEOUT_SECS, default: 60).
    pub client_timeout: Duration,
    /// Node log size that triggers truncation on session start (env: NODE_MANAGER_LOG_MAX_BYTES).
    pub log_max_bytes: u64,
    pub supervisor: SupervisorConfig,
    pub staking: StakingConfig,
    pub history: HistoryConfig,
}

pub const DEFAULT_NODE_API_URL: &str = "http://localhost:33035";
pub const DEFAULT_METRICS_URL: &str = "http://localhost:31248/metrics";

impl NodeManagerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, NodeManagerError> {
        let data_dir = PathBuf::from(
            std::env::var("NODE_MANAGER_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
        );

        let mainnet = binaries_from_env(Network::Mainnet);
        let buildnet = binaries_from_env(Network::Buildnet);

        let node_api_url = std::env::var("NODE_MANAGER_NODE_API_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_NODE_API_URL.to_string());
        let metrics_url = std::env::var("NODE_MANAGER_METRICS_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_METRICS_URL.to_string());
        for (name, value) in [("node API", &node_api_url), ("metrics", &metrics_url)] {
            url::Url::parse(value)
                .map_err(|e| NodeManagerError::Config(format!("invalid {name} URL {value}: {e}")))?;
        }

        let total_value_interval = secs("NODE_MANAGER_TOTAL_VALUE_SECS", 300);
        let retention_days: u64 = std::env::var("NODE_MANAGER_HISTORY_RETENTION_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let auto_restart = std::env::var("NODE_MANAGER_AUTO_RESTART")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let log_max_bytes: u64 = std::env::var("NODE_MANAGER_LOG_MAX_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10 * 1024 * 1024);

        Ok(Self {
            data_dir,
            mainnet,
            buildnet,
            node_api_url,
            metrics_url,
            http_timeout: secs("NODE_MANAGER_HTTP_TIMEOUT_SECS", 10),
            client_timeout: secs("NODE_MANAGER_CLIENT_TIMEOUT_SECS", 60),
            log_max_bytes,
            supervisor: SupervisorConfig {
                bootstrap_check_interval: secs("NODE_MANAGER_BOOTSTRAP_CHECK_SECS", 10),
                desync_check_interval: secs("NODE_MANAGER_DESYNC_CHECK_SECS", 30),
                restart_cooldown: secs("NODE_MANAGER_RESTART_COOLDOWN_SECS", 5),
                auto_restart,
                ..SupervisorConfig::default()
            },
            staking: StakingConfig {
                poll_interval: secs("NODE_MANAGER_STAKING_POLL_SECS", 30),
                total_value_interval,
            },
            history: HistoryConfig {
                total_value_interval,
                retention: Duration::from_secs(retention_days * 24 * 3600),
            },
        })
    }

    /// Check that everything needed at startup exists. Failures are fatal.
    pub fn validate(&self) -> Result<(), NodeManagerError> {
        std::fs::create_dir_all(&self.data_dir).map_err(|e| {
            NodeManagerError::Config(format!(
                "cannot create data directory {}: {e}",
                self.data_dir.display()
            ))
        })?;

        for network in Network::ALL {
            let bins = self.binaries(network);
            for path in [&bins.node, &bins.client] {
                if !path.is_file() {
                    return Err(NodeManagerError::Config(format!(
                        "{network} binary not found: {}",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn binaries(&self, network: Network) -> &NetworkBinaries {
        match network {
            Network::Mainnet => &self.mainnet,
            Network::Buildnet => &self.buildnet,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("node-manager.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn wallet_dir(&self) -> PathBuf {
        self.data_dir.join("wallet")
    }
}

fn secs(var: &str, default: u64) -> Duration {
    let secs = std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|&s: &u64| s > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn binaries_from_env(network: Network) -> NetworkBinaries {
    let upper = network.as_str().to_ascii_uppercase();
    let default_root = Path::new("./node").join(network.as_str());
    let node = std::env::var(format!("NODE_MANAGER_NODE_BIN_{upper}"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_root.join("massa-node").join("massa-node"));
    let client = std::env::var(format!("NODE_MANAGER_CLIENT_BIN_{upper}"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_root.join("massa-client").join("massa-client"));
    NetworkBinaries { node, client }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> NodeManagerConfig {
        let bins = |net: &str| NetworkBinaries {
            node: dir.join(net).join("node"),
            client: dir.join(net).join("client"),
        };
        NodeManagerConfig {
            data_dir: dir.join("data"),
            mainnet: bins("mainnet"),
            buildnet: bins("buildnet"),
            node_api_url: DEFAULT_NODE_API_URL.to_string(),
            metrics_url: DEFAULT_METRICS_URL.to_string(),
            http_timeout: Duration::from_secs(10),
            client_timeout: Duration::from_secs(60),
            log_max_bytes: 1024,
            supervisor: SupervisorConfig::default(),
            staking: StakingConfig::default(),
            history: HistoryConfig {
                total_value_interval: Duration::from_secs(300),
                retention: Duration::from_secs(3600),
            },
        }
    }

    #[test]
    fn test_validate_requires_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::FatalSetup);
        assert!(err.to_string().contains("binary not found"));
        assert!(config.data_dir.is_dir());

        for network in Network::ALL {
            let bins = config.binaries(network);
            for path in [&bins.node, &bins.client] {
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, b"").unwrap();
            }
        }
        config.validate().unwrap();
    }

    #[test]
    fn test_derived_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        assert_eq!(config.db_path(), dir.path().join("data/node-manager.db"));
        assert_eq!(config.logs_dir(), dir.path().join("data/logs"));
    }
}
