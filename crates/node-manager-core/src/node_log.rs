//! Per-network node log files.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{NodeManagerError, Result};
use crate::network::Network;

/// Owns one append-mode log file per network. The node's stdout and stderr
/// are redirected into it.
pub struct NodeLogManager {
    dir: PathBuf,
    max_bytes: u64,
    open: Mutex<HashMap<Network, File>>,
}

impl NodeLogManager {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_bytes,
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self, network: Network) -> PathBuf {
        self.dir.join(format!("node-{network}.log"))
    }

    /// Open the network's log for a new session and write the session marker.
    /// The returned handle is suitable for redirecting child output.
    pub fn start_session(&self, network: Network) -> Result<File> {
        let path = self.path(network);
        let oversized = std::fs::metadata(&path)
            .map(|m| m.len() > self.max_bytes)
            .unwrap_or(false);

        let mut file = open_log(&path, oversized)?;
        if oversized {
            tracing::info!(path = %path.display(), "node log exceeded max size, truncated");
        }
        write!(
            file,
            "\n\n>>> new node session ({}): \n",
            chrono::Utc::now().to_rfc3339()
        )?;
        file.flush()?;

        let handle = file.try_clone()?;
        self.lock()?.insert(network, file);
        Ok(handle)
    }

    pub fn read_logs(&self, network: Network) -> Result<String> {
        let path = self.path(network);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(NodeManagerError::NotFound(
                format!("no logs for {network}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Flush and drop every open handle. A later session reopens lazily.
    pub fn close(&self) {
        let Ok(mut open) = self.lock() else {
            return;
        };
        for (network, mut file) in open.drain() {
            if let Err(e) = file.flush() {
                tracing::warn!(%network, error = %e, "failed to flush node log");
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Network, File>>> {
        self.open
            .lock()
            .map_err(|_| NodeManagerError::Process("node log lock poisoned".into()))
    }
}

fn open_log(path: &Path, truncate: bool) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    options.open(path)
}
