use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{ChargeController, TickOutcome};
use crate::clock::Clock;
use crate::ingest::TelemetryIngest;

/// Task status tracking
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Ticks skipped because of the permanent error flag.
    pub halted_count: u64,
}

impl TaskStatus {
    fn started(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.run_count += 1;
    }

    fn succeeded(&mut self, now: DateTime<Utc>) {
        self.last_success = Some(now);
        self.success_count += 1;
        self.last_error = None;
    }

    fn failed(&mut self, e: &anyhow::Error) {
        self.error_count += 1;
        self.last_error = Some(e.to_string());
    }
}

/// Fires the control loop and the vehicle data refresh at a fixed interval.
pub struct TickScheduler {
    controller: Arc<ChargeController>,
    ingest: Arc<TelemetryIngest>,
    clock: Arc<dyn Clock>,
    tick_seconds: u64,
    tick_status: Arc<RwLock<TaskStatus>>,
    refresh_status: Arc<RwLock<TaskStatus>>,
}

impl TickScheduler {
    pub fn new(
        controller: Arc<ChargeController>,
        ingest: Arc<TelemetryIngest>,
        clock: Arc<dyn Clock>,
        tick_seconds: u64,
    ) -> Self {
        Self {
            controller,
            ingest,
            clock,
            tick_seconds: tick_seconds.max(1),
            tick_status: Arc::new(RwLock::new(TaskStatus::default())),
            refresh_status: Arc::new(RwLock::new(TaskStatus::default())),
        }
    }

    pub async fn run_tick_loop(&self) {
        let mut ticker = interval(Duration::from_secs(self.tick_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_seconds = self.tick_seconds, "charge controller started");
        loop {
            ticker.tick().await;
            self.tick_once().await;
        }
    }

    /// Runs a single control tick and records its outcome.
    pub async fn tick_once(&self) {
        let now = self.clock.now();
        self.tick_status.write().await.started(now);

        match self.controller.on_tick().await {
            Ok(TickOutcome::Halted) => {
                let mut status = self.tick_status.write().await;
                status.halted_count += 1;
            }
            Ok(TickOutcome::Dispatched(vehicles)) => {
                self.tick_status.write().await.succeeded(now);
                debug!(vehicles, "tick dispatched");
            }
            Err(e) => {
                self.tick_status.write().await.failed(&e);
                error!(error = %e, "tick failed");
            }
        }
    }

    pub async fn run_refresh_loop(&self) {
        let mut ticker = interval(Duration::from_secs(self.tick_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.refresh_once().await;
        }
    }

    /// Polls vehicle data for plugged-in vehicles, rate limited per vehicle.
    pub async fn refresh_once(&self) {
        let now = self.clock.now();
        self.refresh_status.write().await.started(now);

        match self.ingest.refresh_plugged_in().await {
            Ok(refreshed) => {
                self.refresh_status.write().await.succeeded(now);
                if refreshed > 0 {
                    debug!(refreshed, "vehicle data refreshed");
                }
            }
            Err(e) => {
                self.refresh_status.write().await.failed(&e);
                warn!(error = %e, "vehicle data refresh failed");
            }
        }
    }

    pub async fn tick_status(&self) -> TaskStatus {
        self.tick_status.read().await.clone()
    }

    pub async fn refresh_status(&self) -> TaskStatus {
        self.refresh_status.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::repo::{SettingKey, Store};

    fn scheduler(h: &Harness) -> TickScheduler {
        let ingest = Arc::new(TelemetryIngest::new(&h.collaborators));
        TickScheduler::new(h.controller.clone(), ingest, h.clock.clone(), 60)
    }

    #[tokio::test]
    async fn test_tick_status_counts() {
        let h = harness();
        let v = vehicle();
        h.register(&v, 50).await;
        let s = scheduler(&h);

        s.tick_once().await;
        let status = s.tick_status().await;
        assert_eq!(status.run_count, 1);
        assert_eq!(status.success_count, 1);
        assert_eq!(status.last_run, Some(t0()));
        assert_eq!(status.last_success, Some(t0()));
        assert!(status.last_error.is_none());

        h.clock.advance(chrono::Duration::minutes(1));
        s.refresh_once().await;
        assert_eq!(
            s.refresh_status().await.last_run,
            Some(t0() + chrono::Duration::minutes(1))
        );

        h.store
            .set_setting(SettingKey::PermanentError, "1")
            .await
            .unwrap();
        s.tick_once().await;
        let status = s.tick_status().await;
        assert_eq!(status.run_count, 2);
        assert_eq!(status.halted_count, 1);

        h.store.set_unavailable(true);
        s.tick_once().await;
        let status = s.tick_status().await;
        assert_eq!(status.error_count, 1);
        assert_eq!(status.last_error.as_deref(), Some("store unavailable"));
    }
}
