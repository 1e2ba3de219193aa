//! node-manager: supervises a blockchain node subprocess and automates staking.
//!
//! The [`NodeSupervisor`] drives the node through its lifecycle
//! (off, starting, bootstrapping, on, desynced, stopping, crashed) and watches
//! bootstrap and desync health. Every status change is published on a
//! [`StatusDispatcher`]; the [`StakingManager`] listens to it and keeps operator
//! addresses at their target roll counts while the node is on. Aggregate value
//! snapshots are stored in SQLite and resampled by the [`HistoryManager`].
//!
//! The node process, its JSON-RPC API, the metrics endpoint, the client tool,
//! the wallet and the store are all reached through traits, so each piece can
//! be replaced with a fake in tests.

pub mod client;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod metrics;
pub mod monitor;
pub mod network;
pub mod node_api;
pub mod node_log;
pub mod process;
pub mod staking;
pub mod status;
pub mod supervisor;
pub mod wallet;

pub use client::{ClientDriver, MassaClient};
pub use config::NodeManagerConfig;
pub use db::{SqliteStore, Store};
pub use dispatcher::{AddressChangedDispatcher, Dispatcher, StatusDispatcher, Unsubscribe};
pub use error::{ErrorKind, NodeManagerError, Result};
pub use history::{HistoryManager, SampledHistory, ValueHistorySample};
pub use metrics::{HttpMetrics, MetricsSource};
pub use network::Network;
pub use node_api::{NodeApi, NodeRpcClient};
pub use node_log::NodeLogManager;
pub use process::{NodeProcessDriver, ProcessDriver, ProcessExit};
pub use staking::{StakingAddress, StakingManager};
pub use status::NodeStatus;
pub use supervisor::{NodeSession, NodeSupervisor, SessionProvider};
pub use wallet::{KeyFileWallet, Wallet, WalletAccount};
