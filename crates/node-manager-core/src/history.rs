//! Value-history sampling and retention.
//!
//! Total value is recorded at irregular times (only when it changes), so the
//! history endpoint rebuilds an evenly spaced series from the stored records.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::HistoryConfig;
use crate::db::{Store, ValueHistory};
use crate::error::{NodeManagerError, Result};
use crate::network::Network;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueHistorySample {
    pub timestamp: DateTime<Utc>,
    /// `None` when no record fell into this sample's bucket.
    pub total_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampledHistory {
    pub samples: Vec<ValueHistorySample>,
    pub empty_samples: usize,
}

pub struct HistoryManager {
    store: Arc<dyn Store>,
    total_value_interval: Duration,
    retention: Duration,
}

impl HistoryManager {
    pub fn new(store: Arc<dyn Store>, config: &HistoryConfig) -> Self {
        Self {
            store,
            total_value_interval: config.total_value_interval,
            retention: config.retention,
        }
    }

    /// `sample_num` samples evenly spread between `since` and now.
    pub fn sample_until_now(&self, since: DateTime<Utc>, sample_num: u32, network: Network) -> Result<SampledHistory> {
        self.sample_until(since, sample_num, network, Utc::now())
    }

    pub(crate) fn sample_until(
        &self,
        since: DateTime<Utc>,
        sample_num: u32,
        network: Network,
        now: DateTime<Utc>,
    ) -> Result<SampledHistory> {
        if sample_num == 0 {
            return Err(NodeManagerError::InvalidRequest(
                "sample count must be at least 1".into(),
            ));
        }
        if since > now {
            return Err(NodeManagerError::InvalidRequest(
                "since must not be in the future".into(),
            ));
        }

        let min_interval = to_chrono(self.total_value_interval)?;
        let window = now - since;
        if window < min_interval {
            return Err(NodeManagerError::InvalidRequest(format!(
                "since must be at least {}s in the past",
                min_interval.num_seconds()
            )));
        }
        let interval = window / sample_num as i32;
        if interval < min_interval {
            return Err(NodeManagerError::InvalidRequest(format!(
                "too many samples: interval {}s is below the {}s recording interval",
                interval.num_seconds(),
                min_interval.num_seconds()
            )));
        }

        let samples = self.sample_value_history(since, sample_num, interval, network)?;
        let empty_samples = samples.iter().filter(|s| s.total_value.is_none()).count();
        Ok(SampledHistory {
            samples,
            empty_samples,
        })
    }

    /// Exactly `sample_num` samples at `since + i * interval`. Each stored
    /// record feeds at most one sample.
    pub fn sample_value_history(
        &self,
        since: DateTime<Utc>,
        sample_num: u32,
        interval: chrono::Duration,
        network: Network,
    ) -> Result<Vec<ValueHistorySample>> {
        let records = self.store.value_history_after(since - interval, network)?;
        Ok(sample_records(&records, since, sample_num, interval))
    }

    /// Drop records older than the retention window. Returns how many went.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - to_chrono(self.retention)?;
        let purged = self.store.delete_value_history_before(cutoff)?;
        if purged > 0 {
            tracing::info!(purged, %cutoff, "purged expired value history");
        }
        Ok(purged)
    }
}

/// `records` must be sorted by timestamp.
fn sample_records(
    records: &[ValueHistory],
    since: DateTime<Utc>,
    sample_num: u32,
    interval: chrono::Duration,
) -> Vec<ValueHistorySample> {
    let mut cursor = records.iter().peekable();
    (0..sample_num)
        .map(|i| {
            let timestamp = since + interval * i as i32;
            let mut value = None;
            while let Some(record) = cursor.next_if(|r| r.timestamp <= timestamp) {
                value = Some(record.total_value);
            }
            ValueHistorySample {
                timestamp,
                total_value: value,
            }
        })
        .collect()
}

fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d)
        .map_err(|e| NodeManagerError::Config(format!("duration out of range: {e}")))
}
