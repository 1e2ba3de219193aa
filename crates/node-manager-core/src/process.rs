//! Node subprocess driver.

use std::fs::File;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::config::NodeManagerConfig;
use crate::error::{NodeManagerError, Result};
use crate::network::Network;

/// How a node process ended.
#[derive(Debug)]
pub struct ProcessExit {
    /// `Err` when the exit status could not be collected.
    pub status: std::result::Result<ExitStatus, String>,
    /// Set when the exit followed a call to [`ProcessDriver::stop`].
    pub stop_requested: bool,
}

impl ProcessExit {
    pub fn is_clean(&self) -> bool {
        matches!(&self.status, Ok(status) if status.success())
    }

    /// True for shutdowns the operator asked for: an explicit stop, or an
    /// interrupt delivered by the operating system on the user's behalf.
    pub fn was_user_requested(&self) -> bool {
        self.stop_requested || matches!(&self.status, Ok(status) if interrupted_by_user(status))
    }
}

#[cfg(unix)]
fn interrupted_by_user(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    // SIGINT, SIGQUIT, SIGTERM
    matches!(status.signal(), Some(2 | 3 | 15))
}

#[cfg(windows)]
fn interrupted_by_user(status: &ExitStatus) -> bool {
    const STATUS_CONTROL_C_EXIT: i32 = 0xC000_013A_u32 as i32;
    status.code() == Some(STATUS_CONTROL_C_EXIT)
}

#[cfg(not(any(unix, windows)))]
fn interrupted_by_user(_status: &ExitStatus) -> bool {
    false
}

/// Spawns and terminates the node process.
pub trait ProcessDriver: Send + Sync {
    /// Spawn the node for `network`, unlocking it with `credential` and sending
    /// its output to `log`. The receiver resolves once the process has exited.
    fn start(
        &self,
        network: Network,
        credential: &str,
        log: File,
    ) -> Result<oneshot::Receiver<ProcessExit>>;

    /// Ask the running process to terminate. Its exit is reported through the
    /// receiver returned by `start`.
    fn stop(&self) -> Result<()>;
}

/// Runs the real node binary with tokio's process API.
pub struct NodeProcessDriver {
    mainnet: PathBuf,
    buildnet: PathBuf,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl NodeProcessDriver {
    pub fn new(config: &NodeManagerConfig) -> Self {
        Self::with_binaries(
            config.binaries(Network::Mainnet).node.clone(),
            config.binaries(Network::Buildnet).node.clone(),
        )
    }

    pub fn with_binaries(mainnet: PathBuf, buildnet: PathBuf) -> Self {
        Self {
            mainnet,
            buildnet,
            stop_tx: Mutex::new(None),
        }
    }

    fn binary(&self, network: Network) -> &PathBuf {
        match network {
            Network::Mainnet => &self.mainnet,
            Network::Buildnet => &self.buildnet,
        }
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<oneshot::Sender<()>>>> {
        self.stop_tx
            .lock()
            .map_err(|_| NodeManagerError::Process("process driver lock poisoned".into()))
    }
}

impl ProcessDriver for NodeProcessDriver {
    fn start(
        &self,
        network: Network,
        credential: &str,
        log: File,
    ) -> Result<oneshot::Receiver<ProcessExit>> {
        let mut slot = self.slot()?;
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(NodeManagerError::Process(
                "a node process is already running".into(),
            ));
        }

        let bin = self.binary(network);
        let dir = bin
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let stderr = log.try_clone()?;
        let mut child = tokio::process::Command::new(bin)
            .arg("-p")
            .arg(credential)
            .arg("-a")
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                NodeManagerError::Process(format!("failed to start {}: {e}", bin.display()))
            })?;

        tracing::info!(%network, pid = ?child.id(), bin = %bin.display(), "node process spawned");

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        *slot = Some(stop_tx);

        tokio::spawn(async move {
            let mut stop_requested = false;
            let status = tokio::select! {
                status = child.wait() => status,
                _ = stop_rx => {
                    stop_requested = true;
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(error = %e, "failed to kill node process");
                    }
                    child.wait().await
                }
            };
            let exit = ProcessExit {
                status: status.map_err(|e| e.to_string()),
                stop_requested,
            };
            tracing::info!(status = ?exit.status, stop_requested, "node process exited");
            let _ = exit_tx.send(exit);
        });

        Ok(exit_rx)
    }

    fn stop(&self) -> Result<()> {
        let tx = self.slot()?.take();
        match tx.map(|tx| tx.send(())) {
            Some(Ok(())) => Ok(()),
            _ => Err(NodeManagerError::Process("node process is not running".into())),
        }
    }
}
