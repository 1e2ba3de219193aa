//! Health monitors: bootstrap completion and desync detection.
//!
//! Both are plain cancellable polling loops. They report what they observed and
//! leave every state transition to the supervisor.

use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsSource;
use crate::node_api::NodeApi;

/// Confirms desync only after the cursor lag has persisted for `grace`
/// without interruption. A healthy sample restarts the clock.
#[derive(Debug, Clone)]
pub struct DesyncTracker {
    grace: Duration,
    lagging_since: Option<Instant>,
}

impl DesyncTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            lagging_since: None,
        }
    }

    /// Feed one sample. Returns true once desync is confirmed.
    pub fn observe(&mut self, lagging: bool, now: Instant) -> bool {
        if !lagging {
            self.lagging_since = None;
            return false;
        }
        let since = *self.lagging_since.get_or_insert(now);
        now.duration_since(since) >= self.grace
    }

    pub fn lagging_since(&self) -> Option<Instant> {
        self.lagging_since
    }
}

/// Poll the node status endpoint until it answers. Returns false if cancelled first.
pub async fn wait_for_bootstrap(
    api: &dyn NodeApi,
    every: Duration,
    cancel: &CancellationToken,
) -> bool {
    tracing::info!(interval_secs = every.as_secs(), "waiting for node bootstrap");
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = ticker.tick() => {}
        }

        match api.get_status().await {
            Ok(_) => {
                tracing::info!("node answered status request, bootstrap complete");
                return true;
            }
            Err(e) if e.is_connection_refused() => {
                tracing::debug!(error = %e, "node API not reachable yet");
            }
            Err(e) => {
                tracing::warn!(error = %e, "status request failed during bootstrap");
            }
        }
    }
}

/// Poll the cursor metrics until desync is confirmed. Returns false if cancelled first.
pub async fn watch_desync(
    metrics: &dyn MetricsSource,
    every: Duration,
    grace: Duration,
    cancel: &CancellationToken,
) -> bool {
    let mut tracker = DesyncTracker::new(grace);
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = ticker.tick() => {}
        }

        let periods = match metrics.cursor_periods().await {
            Ok(p) => p,
            Err(e) if e.kind() == crate::error::ErrorKind::TransientRemote => {
                tracing::debug!(error = %e, "metrics endpoint unavailable");
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read cursor metrics");
                continue;
            }
        };

        let was_lagging = tracker.lagging_since().is_some();
        if tracker.observe(periods.is_lagging(), Instant::now()) {
            tracing::warn!(lag = periods.lag(), "node desync confirmed");
            return true;
        }
        match (was_lagging, periods.is_lagging()) {
            (false, true) => tracing::info!(lag = periods.lag(), "node may be desynced"),
            (true, false) => tracing::info!(lag = periods.lag(), "node caught up"),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NodeManagerError, Result};
    use crate::metrics::CursorPeriods;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[test]
    fn test_confirms_after_grace() {
        let start = Instant::now();
        let mut tracker = DesyncTracker::new(Duration::from_secs(60));
        assert!(!tracker.observe(true, start));
        assert!(!tracker.observe(true, start + Duration::from_secs(30)));
        assert!(!tracker.observe(true, start + Duration::from_secs(59)));
        assert!(tracker.observe(true, start + Duration::from_secs(60)));
    }

    #[test]
    fn test_healthy_sample_resets_timer() {
        let start = Instant::now();
        let mut tracker = DesyncTracker::new(Duration::from_secs(60));
        assert!(!tracker.observe(true, start));
        assert!(!tracker.observe(false, start + Duration::from_secs(59)));
        assert!(!tracker.observe(true, start + Duration::from_secs(60)));
        assert!(!tracker.observe(true, start + Duration::from_secs(110)));
        assert!(tracker.observe(true, start + Duration::from_secs(120)));
    }

    struct ScriptedMetrics(Mutex<VecDeque<f64>>);

    #[async_trait::async_trait]
    impl MetricsSource for ScriptedMetrics {
        async fn cursor_periods(&self) -> Result<CursorPeriods> {
            let lag = self
                .0
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| NodeManagerError::Metrics("exhausted".into()))?;
            Ok(CursorPeriods {
                active: 100.0 + lag,
                final_: 100.0,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_desync_confirms_on_sustained_lag() {
        // Samples every 10s: lagging, healthy, then seven lagging in a row.
        let lags = [20.0, 0.0, 20.0, 20.0, 20.0, 20.0, 20.0, 20.0, 20.0];
        let metrics = ScriptedMetrics(Mutex::new(lags.into_iter().collect()));
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let confirmed = watch_desync(
            &metrics,
            Duration::from_secs(10),
            Duration::from_secs(60),
            &cancel,
        )
        .await;

        assert!(confirmed);
        // Lag resumes at t=30s and must hold until t=90s.
        assert_eq!(started.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_desync_stops_on_cancel() {
        let metrics = ScriptedMetrics(Mutex::new(VecDeque::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(
            !watch_desync(&metrics, Duration::from_secs(1), Duration::from_secs(60), &cancel).await
        );
    }
}
