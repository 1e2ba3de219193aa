//! Node client command interface.
//!
//! Wallet and staking operations go through the node's own client binary. Each
//! call is a separate process with a bounded run time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::NodeManagerConfig;
use crate::error::{NodeManagerError, Result};
use crate::network::Network;
use crate::supervisor::NodeSession;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletAddressInfo {
    #[serde(default)]
    pub active_rolls: u64,
}

/// One address of `wallet_info`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletEntry {
    #[serde(default)]
    pub address_info: WalletAddressInfo,
}

#[async_trait]
pub trait ClientDriver: Send + Sync {
    /// Addresses the node is currently staking with.
    async fn staking_addresses(&self, session: &NodeSession) -> Result<Vec<String>>;

    async fn add_staking_address(
        &self,
        session: &NodeSession,
        secret_key: &str,
        address: &str,
    ) -> Result<()>;

    async fn remove_staking_address(&self, session: &NodeSession, address: &str) -> Result<()>;

    /// Returns the id of the submitted operation.
    async fn buy_rolls(
        &self,
        session: &NodeSession,
        address: &str,
        amount: u64,
        fee: f64,
    ) -> Result<String>;

    /// Returns the id of the submitted operation.
    async fn sell_rolls(
        &self,
        session: &NodeSession,
        address: &str,
        amount: u64,
        fee: f64,
    ) -> Result<String>;

    async fn wallet_info(&self, session: &NodeSession) -> Result<HashMap<String, WalletEntry>>;
}

/// [`ClientDriver`] backed by the client binary of each network.
pub struct MassaClient {
    mainnet: PathBuf,
    buildnet: PathBuf,
    timeout: Duration,
}

impl MassaClient {
    pub fn new(config: &NodeManagerConfig) -> Self {
        Self::with_binaries(
            config.binaries(Network::Mainnet).client.clone(),
            config.binaries(Network::Buildnet).client.clone(),
            config.client_timeout,
        )
    }

    pub fn with_binaries(mainnet: PathBuf, buildnet: PathBuf, timeout: Duration) -> Self {
        Self {
            mainnet,
            buildnet,
            timeout,
        }
    }

    fn binary(&self, network: Network) -> &Path {
        match network {
            Network::Mainnet => &self.mainnet,
            Network::Buildnet => &self.buildnet,
        }
    }

    async fn execute(&self, network: Network, args: &[&str]) -> Result<String> {
        let bin = self.binary(network);
        let dir = bin
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let command = args.first().copied().unwrap_or_default();

        let result = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(bin)
                .args(args)
                .arg("-a")
                .current_dir(dir)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => {
                let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if detail.is_empty() {
                    detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
                }
                Err(NodeManagerError::Client(format!(
                    "{command} failed ({}): {detail}",
                    output.status
                )))
            }
            Ok(Err(e)) => Err(NodeManagerError::Client(format!(
                "{command} failed to execute: {e}"
            ))),
            Err(_) => Err(NodeManagerError::Timeout(format!(
                "{command} timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl ClientDriver for MassaClient {
    async fn staking_addresses(&self, session: &NodeSession) -> Result<Vec<String>> {
        let output = self
            .execute(session.network, &["node_get_staking_addresses"])
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    async fn add_staking_address(
        &self,
        session: &NodeSession,
        secret_key: &str,
        address: &str,
    ) -> Result<()> {
        let pwd = session.credential.as_str();
        self.execute(session.network, &["wallet_add_secret_keys", "-p", pwd, secret_key])
            .await?;
        self.execute(session.network, &["node_start_staking", "-p", pwd, address])
            .await?;
        Ok(())
    }

    async fn remove_staking_address(&self, session: &NodeSession, address: &str) -> Result<()> {
        let pwd = session.credential.as_str();
        self.execute(session.network, &["node_stop_staking", "-p", pwd, address])
            .await?;
        self.execute(session.network, &["wallet_remove_addresses", "-p", pwd, address])
            .await?;
        Ok(())
    }

    async fn buy_rolls(
        &self,
        session: &NodeSession,
        address: &str,
        amount: u64,
        fee: f64,
    ) -> Result<String> {
        self.roll_operation(session, "buy_rolls", address, amount, fee)
            .await
    }

    async fn sell_rolls(
        &self,
        session: &NodeSession,
        address: &str,
        amount: u64,
        fee: f64,
    ) -> Result<String> {
        self.roll_operation(session, "sell_rolls", address, amount, fee)
            .await
    }

    async fn wallet_info(&self, session: &NodeSession) -> Result<HashMap<String, WalletEntry>> {
        let output = self
            .execute(
                session.network,
                &["wallet_info", "-p", session.credential.as_str(), "-j"],
            )
            .await?;
        Ok(serde_json::from_str(&output)?)
    }
}

impl MassaClient {
    async fn roll_operation(
        &self,
        session: &NodeSession,
        command: &str,
        address: &str,
        amount: u64,
        fee: f64,
    ) -> Result<String> {
        let amount = amount.to_string();
        let fee = format!("{fee:.6}");
        let output = self
            .execute(
                session.network,
                &[command, "-p", session.credential.as_str(), "-j", address, &amount, &fee],
            )
            .await?;
        first_operation_id(command, &output)
    }
}

fn first_operation_id(command: &str, output: &str) -> Result<String> {
    let ids: Vec<String> = serde_json::from_str(output.trim())?;
    ids.into_iter()
        .next()
        .ok_or_else(|| NodeManagerError::Client(format!("{command} returned no operation id")))
}
