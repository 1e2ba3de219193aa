//! Desync detection inputs read from the node's metrics exposition.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{NodeManagerError, Result};
use crate::node_api::classify;

pub const ACTIVE_CURSOR_PERIOD: &str = "active_cursor_period";
pub const FINAL_CURSOR_PERIOD: &str = "final_cursor_period";

/// Lag beyond which the node is suspected to be desynced.
pub const MAX_CURSOR_LAG: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorPeriods {
    pub active: f64,
    pub final_: f64,
}

impl CursorPeriods {
    pub fn lag(&self) -> f64 {
        self.active - self.final_
    }

    pub fn is_lagging(&self) -> bool {
        self.lag() > MAX_CURSOR_LAG
    }
}

/// Source of the two cursor gauges.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn cursor_periods(&self) -> Result<CursorPeriods>;
}

/// Reads the gauges from a text exposition over HTTP.
pub struct HttpMetrics {
    http: reqwest::Client,
    url: String,
}

impl HttpMetrics {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MetricsSource for HttpMetrics {
    async fn cursor_periods(&self) -> Result<CursorPeriods> {
        let resp = self.http.get(&self.url).send().await.map_err(classify)?;
        if !resp.status().is_success() {
            return Err(NodeManagerError::Metrics(format!(
                "metrics endpoint returned HTTP {}",
                resp.status()
            )));
        }
        let body = resp.text().await.map_err(classify)?;
        parse_cursor_periods(&body)
    }
}

pub fn parse_cursor_periods(exposition: &str) -> Result<CursorPeriods> {
    Ok(CursorPeriods {
        active: gauge(exposition, ACTIVE_CURSOR_PERIOD)?,
        final_: gauge(exposition, FINAL_CURSOR_PERIOD)?,
    })
}

/// Value of the first sample line whose metric name is exactly `name`.
fn gauge(exposition: &str, name: &str) -> Result<f64> {
    let mut fields = exposition
        .lines()
        .map(str::split_whitespace)
        .find_map(|mut fields| (fields.next() == Some(name)).then_some(fields))
        .ok_or_else(|| NodeManagerError::Metrics(format!("metric {name} not found")))?;

    let value = fields
        .next()
        .ok_or_else(|| NodeManagerError::Metrics(format!("metric {name} has no value")))?;

    value
        .parse()
        .map_err(|e| NodeManagerError::Metrics(format!("metric {name} value {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPOSITION: &str = "\
# HELP active_cursor_period execution cursor period
# TYPE active_cursor_period gauge
active_cursor_period 4150
# HELP final_cursor_period final cursor period
# TYPE final_cursor_period gauge
final_cursor_period 4138
block_count 12
";

    #[test]
    fn test_parse_and_lag() {
        let periods = parse_cursor_periods(EXPOSITION).unwrap();
        assert_eq!(periods.active, 4150.0);
        assert_eq!(periods.final_, 4138.0);
        assert_eq!(periods.lag(), 12.0);
        assert!(periods.is_lagging());
    }

    #[test]
    fn test_lag_at_threshold_is_not_desync() {
        let periods = CursorPeriods {
            active: 110.0,
            final_: 100.0,
        };
        assert!(!periods.is_lagging());
    }

    #[test]
    fn test_fractional_lag_over_threshold_is_desync() {
        let periods = CursorPeriods {
            active: 110.5,
            final_: 100.0,
        };
        assert!(periods.is_lagging());
    }

    #[test]
    fn test_longer_metric_names_are_not_matched() {
        let exposition = "\
active_cursor_period_seconds 9999
final_cursor_period_total 1
active_cursor_period 20
final_cursor_period 15
";
        let periods = parse_cursor_periods(exposition).unwrap();
        assert_eq!(periods.active, 20.0);
        assert_eq!(periods.final_, 15.0);
        assert!(!periods.is_lagging());
    }

    #[test]
    fn test_missing_gauge_is_error() {
        let err = parse_cursor_periods("active_cursor_period 10\n").unwrap_err();
        assert!(err.to_string().contains(FINAL_CURSOR_PERIOD));

        let err = parse_cursor_periods("active_cursor_period\nfinal_cursor_period 1\n").unwrap_err();
        assert!(err.to_string().contains("has no value"));
    }
}
