use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    api::KioskApi,
    error::{ConsoleError, RequestError},
    reconcile::{reconcile, AttendanceRow, AttendanceSummary},
};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Shorter intervals, zero included, are raised to this.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardView {
    pub rows: Vec<AttendanceRow>,
    pub summary: AttendanceSummary,
    pub refreshed_at: DateTime<Utc>,
}

/// Fetches the roster and today's records together and derives the view.
pub async fn load_dashboard(api: &dyn KioskApi) -> Result<DashboardView, RequestError> {
    let (roster, records) = tokio::try_join!(api.list_students(), api.today_attendance())?;
    Ok(DashboardView {
        rows: reconcile(&roster, &records),
        summary: AttendanceSummary::compute(&roster, &records),
        refreshed_at: Utc::now(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardSnapshot {
    /// Last successfully derived view; kept while later refreshes fail.
    pub view: Option<DashboardView>,
    pub error: Option<ConsoleError>,
    pub refreshes: u64,
}

/// Refreshes the dashboard immediately and then on every tick of the refresh
/// interval. Dropping the poller cancels the timer.
pub struct DashboardPoller {
    snapshots: watch::Receiver<DashboardSnapshot>,
    task: JoinHandle<()>,
}

impl DashboardPoller {
    pub fn spawn(api: Arc<dyn KioskApi>, every: Duration) -> Self {
        let every = every.max(MIN_REFRESH_INTERVAL);
        let (snapshot_tx, snapshots) = watch::channel(DashboardSnapshot::default());
        let task = tokio::spawn(run_poller(api, every, snapshot_tx));
        Self { snapshots, task }
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<DashboardSnapshot> {
        self.snapshots.clone()
    }
}

impl Drop for DashboardPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_poller(
    api: Arc<dyn KioskApi>,
    every: Duration,
    snapshots: watch::Sender<DashboardSnapshot>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let outcome = load_dashboard(api.as_ref()).await;
        snapshots.send_modify(|snapshot| {
            snapshot.refreshes += 1;
            match outcome {
                Ok(view) => {
                    debug!(rows = view.rows.len(), "dashboard refreshed");
                    snapshot.view = Some(view);
                    snapshot.error = None;
                }
                Err(err) => {
                    warn!(%err, "dashboard refresh failed");
                    snapshot.error = Some(ConsoleError::data_fetch(
                        "Failed to fetch dashboard data",
                        &err,
                    ));
                }
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/dashboard_tests.rs"]
mod tests;
