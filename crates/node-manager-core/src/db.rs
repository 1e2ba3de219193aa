//! Persistence: roll targets, roll-operation history and the value time series.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

use crate::error::{NodeManagerError, Result};
use crate::network::Network;

/// Persisted operator target for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollsTarget {
    pub address: String,
    /// Negative means buy as many rolls as the balance allows.
    pub target: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollOpKind {
    Buy,
    Sell,
}

impl RollOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollOpKind::Buy => "buy",
            RollOpKind::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(RollOpKind::Buy),
            "sell" => Some(RollOpKind::Sell),
            _ => None,
        }
    }
}

/// One submitted buy/sell operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollOpRecord {
    pub op_id: String,
    pub network: Network,
    pub address: String,
    pub kind: RollOpKind,
    pub amount: u64,
    pub timestamp: DateTime<Utc>,
}

/// One point of the total-value time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueHistory {
    pub timestamp: DateTime<Utc>,
    pub total_value: f64,
}

/// Storage used by the staking engine and the history sampler.
///
/// Update and delete paths report a missing row as [`NodeManagerError::NotFound`].
pub trait Store: Send + Sync {
    fn rolls_targets(&self, network: Network) -> Result<Vec<RollsTarget>>;
    /// Insert a target, replacing any stale row for the same address.
    fn add_rolls_target(&self, address: &str, target: i64, network: Network) -> Result<()>;
    fn update_rolls_target(&self, address: &str, target: i64, network: Network) -> Result<()>;
    fn delete_rolls_target(&self, address: &str, network: Network) -> Result<()>;

    fn add_roll_op(&self, op: &RollOpRecord) -> Result<()>;
    fn roll_op_history(&self, address: &str, network: Network) -> Result<Vec<RollOpRecord>>;
    fn delete_roll_op_history(&self, address: &str, network: Network) -> Result<()>;

    fn post_value_history(&self, entry: &ValueHistory, network: Network) -> Result<()>;
    /// Entries strictly after `after`, oldest first.
    fn value_history_after(&self, after: DateTime<Utc>, network: Network) -> Result<Vec<ValueHistory>>;
    /// Delete every network's entries older than `cutoff`. Returns the number removed.
    fn delete_value_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rolls_target (
    address TEXT NOT NULL,
    network TEXT NOT NULL,
    target INTEGER NOT NULL,
    PRIMARY KEY (address, network)
);

CREATE TABLE IF NOT EXISTS roll_op_history (
    op_id TEXT NOT NULL,
    network TEXT NOT NULL,
    address TEXT NOT NULL,
    op TEXT NOT NULL,
    amount INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (op_id, network)
);
CREATE INDEX IF NOT EXISTS idx_roll_op_address ON roll_op_history(address, network);

CREATE TABLE IF NOT EXISTS value_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    network TEXT NOT NULL,
    total_value REAL NOT NULL,
    -- unix milliseconds
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_value_history_network_created ON value_history(network, created_at);
"#;

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. `":memory:"` gives a private in-memory store.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if path != ":memory:" {
                if let Err(e) =
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                {
                    tracing::warn!(path = %path, error = %e, "failed to restrict database permissions");
                }
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| {
            NodeManagerError::Database(rusqlite::Error::InvalidParameterName(
                "lock poisoned".into(),
            ))
        })
    }
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn from_unix_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

impl Store for SqliteStore {
    fn rolls_targets(&self, network: Network) -> Result<Vec<RollsTarget>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT address, target FROM rolls_target WHERE network = ?1 ORDER BY address")?;
        let targets = stmt
            .query_map(params![network.as_str()], |row| {
                Ok(RollsTarget {
                    address: row.get(0)?,
                    target: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(targets)
    }

    fn add_rolls_target(&self, address: &str, target: i64, network: Network) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO rolls_target (address, network, target) VALUES (?1, ?2, ?3)
             ON CONFLICT(address, network) DO UPDATE SET target = excluded.target",
            params![address, network.as_str(), target],
        )?;
        Ok(())
    }

    fn update_rolls_target(&self, address: &str, target: i64, network: Network) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE rolls_target SET target = ?1 WHERE address = ?2 AND network = ?3",
            params![target, address, network.as_str()],
        )?;
        if changed == 0 {
            return Err(NodeManagerError::NotFound(format!(
                "rolls target for {address} on {network}"
            )));
        }
        Ok(())
    }

    fn delete_rolls_target(&self, address: &str, network: Network) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM rolls_target WHERE address = ?1 AND network = ?2",
            params![address, network.as_str()],
        )?;
        if deleted == 0 {
            return Err(NodeManagerError::NotFound(format!(
                "rolls target for {address} on {network}"
            )));
        }
        Ok(())
    }

    fn add_roll_op(&self, op: &RollOpRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO roll_op_history (op_id, network, address, op, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                op.op_id,
                op.network.as_str(),
                op.address,
                op.kind.as_str(),
                op.amount as i64,
                op.timestamp.timestamp(),
            ],
        )?;
        Ok(())
    }

    fn roll_op_history(&self, address: &str, network: Network) -> Result<Vec<RollOpRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT op_id, address, op, amount, created_at FROM roll_op_history
             WHERE address = ?1 AND network = ?2 ORDER BY created_at, op_id",
        )?;
        let ops = stmt
            .query_map(params![address, network.as_str()], |row| {
                let kind: String = row.get(2)?;
                let amount: i64 = row.get(3)?;
                Ok(RollOpRecord {
                    op_id: row.get(0)?,
                    network,
                    address: row.get(1)?,
                    kind: RollOpKind::parse(&kind).unwrap_or(RollOpKind::Buy),
                    amount: amount.max(0) as u64,
                    timestamp: from_unix(row.get(4)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    fn delete_roll_op_history(&self, address: &str, network: Network) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM roll_op_history WHERE address = ?1 AND network = ?2",
            params![address, network.as_str()],
        )?;
        if deleted == 0 {
            return Err(NodeManagerError::NotFound(format!(
                "roll operations for {address} on {network}"
            )));
        }
        Ok(())
    }

    fn post_value_history(&self, entry: &ValueHistory, network: Network) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO value_history (network, total_value, created_at) VALUES (?1, ?2, ?3)",
            params![network.as_str(), entry.total_value, entry.timestamp.timestamp_millis()],
        )?;
        Ok(())
    }

    fn value_history_after(&self, after: DateTime<Utc>, network: Network) -> Result<Vec<ValueHistory>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT created_at, total_value FROM value_history
             WHERE network = ?1 AND created_at > ?2 ORDER BY created_at, id",
        )?;
        let entries = stmt
            .query_map(params![network.as_str(), after.timestamp_millis()], |row| {
                Ok(ValueHistory {
                    timestamp: from_unix_millis(row.get(0)?),
                    total_value: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn delete_value_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM value_history WHERE created_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(deleted)
    }
}
