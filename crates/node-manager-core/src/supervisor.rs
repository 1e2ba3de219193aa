//! Node lifecycle state machine.
//!
//! The supervisor owns the node status and the subprocess session. Every start
//! creates one cancellation scope shared by the bootstrap and desync monitors;
//! stopping or closing cancels it. Status changes happen under a single lock and
//! are published to the [`StatusDispatcher`] as they are committed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::dispatcher::StatusDispatcher;
use crate::error::{NodeManagerError, Result};
use crate::metrics::MetricsSource;
use crate::monitor;
use crate::network::Network;
use crate::node_api::NodeApi;
use crate::node_log::NodeLogManager;
use crate::process::{ProcessDriver, ProcessExit};
use crate::status::NodeStatus;

/// Network and password of the last started node.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeSession {
    pub network: Network,
    pub credential: String,
}

impl fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSession")
            .field("network", &self.network)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Gives other components access to the active node session.
pub trait SessionProvider: Send + Sync {
    fn session(&self) -> Option<NodeSession>;
}

/// Poll period used while waiting for a stopped node to report its exit.
const EXIT_POLL: Duration = Duration::from_millis(500);

struct State {
    status: NodeStatus,
    session: Option<NodeSession>,
    cancel: Option<CancellationToken>,
}

struct Inner {
    config: SupervisorConfig,
    driver: Arc<dyn ProcessDriver>,
    api: Arc<dyn NodeApi>,
    metrics: Arc<dyn MetricsSource>,
    logs: Arc<NodeLogManager>,
    dispatcher: StatusDispatcher,
    state: Mutex<State>,
    auto_restart: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// Cheap to clone; every clone drives the same node.
#[derive(Clone)]
pub struct NodeSupervisor {
    inner: Arc<Inner>,
}

impl NodeSupervisor {
    pub fn new(
        config: SupervisorConfig,
        driver: Arc<dyn ProcessDriver>,
        api: Arc<dyn NodeApi>,
        metrics: Arc<dyn MetricsSource>,
        logs: Arc<NodeLogManager>,
        dispatcher: StatusDispatcher,
    ) -> Self {
        let auto_restart = AtomicBool::new(config.auto_restart);
        dispatcher.publish(NodeStatus::Off);
        Self {
            inner: Arc::new(Inner {
                config,
                driver,
                api,
                metrics,
                logs,
                dispatcher,
                state: Mutex::new(State {
                    status: NodeStatus::Off,
                    session: None,
                    cancel: None,
                }),
                auto_restart,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.lock().status
    }

    pub fn dispatcher(&self) -> &StatusDispatcher {
        &self.inner.dispatcher
    }

    pub fn auto_restart(&self) -> bool {
        self.inner.auto_restart.load(Ordering::SeqCst)
    }

    pub fn set_auto_restart(&self, enabled: bool) {
        self.inner.auto_restart.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "auto-restart updated");
    }

    pub fn node_logs(&self, network: Network) -> Result<String> {
        self.inner.logs.read_logs(network)
    }

    /// Start the node. Accepted only from `off` or `crashed`.
    pub fn start_node(&self, network: Network, credential: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NodeManagerError::Closed);
        }

        let mut state = self.lock();
        if state.status.is_running() {
            return Err(NodeManagerError::AlreadyRunning(state.status));
        }

        let previous = state.status;
        self.set_status(&mut state, NodeStatus::Starting);

        let spawned = self
            .inner
            .logs
            .start_session(network)
            .and_then(|log| self.inner.driver.start(network, credential, log));
        let exit = match spawned {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!(%network, error = %e, "failed to start node");
                self.set_status(&mut state, previous);
                return Err(e);
            }
        };

        self.set_status(&mut state, NodeStatus::Bootstrapping);
        state.session = Some(NodeSession {
            network,
            credential: credential.to_string(),
        });
        let cancel = self.inner.shutdown.child_token();
        state.cancel = Some(cancel.clone());
        drop(state);

        tracing::info!(%network, "node started");
        tokio::spawn(self.clone().run_monitors(cancel));
        tokio::spawn(self.clone().watch_exit(exit));
        Ok(())
    }

    /// Stop the node. Accepted from any running state except `stopping`.
    pub fn stop_node(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.status.is_running() {
            return Err(NodeManagerError::AlreadyStopped);
        }
        if state.status == NodeStatus::Stopping {
            return Err(NodeManagerError::AlreadyStopping);
        }

        self.set_status(&mut state, NodeStatus::Stopping);
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        self.inner.driver.stop()?;
        tracing::info!("node stop requested");
        Ok(())
    }

    /// Stop everything for process shutdown. Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut state = self.lock();
            if !state.status.is_closed_or_closing() {
                self.set_status(&mut state, NodeStatus::Stopping);
                if let Some(cancel) = state.cancel.take() {
                    cancel.cancel();
                }
                if let Err(e) = self.inner.driver.stop() {
                    tracing::warn!(error = %e, "failed to stop node during close");
                }
            }
        }
        self.inner.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.inner.config.close_grace;
        while self.status().is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if self.status().is_running() {
            tracing::warn!("node did not exit before close grace period elapsed");
        }

        self.inner.logs.close();
        tracing::info!("node supervisor closed");
    }

    /// Bootstrap wait followed by the desync watch, for one session.
    async fn run_monitors(self, cancel: CancellationToken) {
        let cfg = &self.inner.config;
        if !monitor::wait_for_bootstrap(self.inner.api.as_ref(), cfg.bootstrap_check_interval, &cancel)
            .await
        {
            return;
        }

        {
            let mut state = self.lock();
            if cancel.is_cancelled() || state.status.is_closed_or_closing() {
                return;
            }
            self.set_status(&mut state, NodeStatus::On);
        }

        if !monitor::watch_desync(
            self.inner.metrics.as_ref(),
            cfg.desync_check_interval,
            cfg.desync_grace,
            &cancel,
        )
        .await
        {
            return;
        }

        self.handle_desync(cancel).await;
    }

    async fn handle_desync(&self, cancel: CancellationToken) {
        {
            let mut state = self.lock();
            if cancel.is_cancelled() || state.status.is_closed_or_closing() {
                return;
            }
            self.set_status(&mut state, NodeStatus::Desynced);
        }

        if !self.auto_restart() {
            return;
        }

        tracing::info!(
            cooldown_secs = self.inner.config.restart_cooldown.as_secs(),
            "restarting desynced node after cooldown"
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.inner.config.restart_cooldown) => {}
        }

        let Some(session) = self.session() else {
            return;
        };
        if let Err(e) = self.stop_node() {
            tracing::warn!(error = %e, "failed to stop desynced node");
            return;
        }

        while self.status().is_running() {
            if self.inner.shutdown.is_cancelled() {
                return;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }

        if let Err(e) = self.start_node(session.network, &session.credential) {
            tracing::warn!(error = %e, "failed to restart desynced node");
        }
    }

    async fn watch_exit(self, exit: oneshot::Receiver<ProcessExit>) {
        let exit = exit.await.unwrap_or_else(|_| ProcessExit {
            status: Err("exit notification dropped".to_string()),
            stop_requested: false,
        });
        let crashed = !exit.is_clean() && !exit.was_user_requested();

        let restart = {
            let mut state = self.lock();
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            if crashed {
                tracing::error!(status = ?exit.status, "node crashed");
                self.set_status(&mut state, NodeStatus::Crashed);
                self.auto_restart() && !self.inner.closed.load(Ordering::SeqCst)
            } else {
                self.set_status(&mut state, NodeStatus::Off);
                false
            }
        };

        if !restart {
            return;
        }

        tracing::info!(
            cooldown_secs = self.inner.config.restart_cooldown.as_secs(),
            "restarting crashed node after cooldown"
        );
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.inner.config.restart_cooldown) => {}
        }

        if let Some(session) = self.session() {
            if let Err(e) = self.start_node(session.network, &session.credential) {
                tracing::warn!(error = %e, "failed to restart crashed node");
            }
        }
    }

    fn set_status(&self, state: &mut State, status: NodeStatus) {
        if state.status != status {
            tracing::info!(from = %state.status, to = %status, "node status changed");
        }
        state.status = status;
        self.inner.dispatcher.publish(status);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl SessionProvider for NodeSupervisor {
    fn session(&self) -> Option<NodeSession> {
        self.lock().session.clone()
    }
}
