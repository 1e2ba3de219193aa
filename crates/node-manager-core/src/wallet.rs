//! Resolves wallet nicknames to staking keys.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{NodeManagerError, Result};

#[derive(Clone, Deserialize)]
pub struct WalletAccount {
    pub address: String,
    pub secret_key: String,
}

impl fmt::Debug for WalletAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletAccount")
            .field("address", &self.address)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

pub trait Wallet: Send + Sync {
    fn account(&self, nickname: &str) -> Result<WalletAccount>;
}

/// One JSON key file per account: `<dir>/<nickname>.json`.
pub struct KeyFileWallet {
    dir: PathBuf,
}

impl KeyFileWallet {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, nickname: &str) -> Result<PathBuf> {
        let valid = !nickname.is_empty()
            && nickname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(NodeManagerError::InvalidRequest(format!(
                "invalid wallet nickname: {nickname:?}"
            )));
        }
        Ok(self.dir.join(format!("{nickname}.json")))
    }
}

impl Wallet for KeyFileWallet {
    fn account(&self, nickname: &str) -> Result<WalletAccount> {
        let path = self.key_path(nickname)?;
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NodeManagerError::NotFound(format!("wallet account {nickname}")));
            }
            Err(e) => return Err(e.into()),
        };
        warn_if_shared(&path);

        let account: WalletAccount = serde_json::from_str(&raw)?;
        if account.address.is_empty() || account.secret_key.is_empty() {
            return Err(NodeManagerError::InvalidRequest(format!(
                "wallet account {nickname} is incomplete"
            )));
        }
        Ok(account)
    }
}

#[cfg(unix)]
fn warn_if_shared(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.permissions().mode() & 0o077 != 0 {
            tracing::warn!(path = %path.display(), "wallet key file is readable by other users");
        }
    }
}

#[cfg(not(unix))]
fn warn_if_shared(_path: &Path) {}
