use std::{collections::VecDeque, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::StudentId,
    protocol::{AttendanceMarked, ServerEvent},
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, warn};

use crate::live_channel::LiveChannel;

pub const FEED_CAPACITY: usize = 10;
pub const HIGHLIGHT_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub student_id: Option<StudentId>,
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

impl From<AttendanceMarked> for FeedEntry {
    fn from(marked: AttendanceMarked) -> Self {
        Self {
            student_id: marked.student_id,
            name: marked.name,
            timestamp: marked.timestamp,
        }
    }
}

/// The last [`FEED_CAPACITY`] pushed attendance events, newest first, plus a
/// "just scanned" highlight that expires [`HIGHLIGHT_WINDOW`] after the most
/// recent event.
#[derive(Debug, Default)]
pub struct LiveAttendanceFeed {
    entries: VecDeque<FeedEntry>,
    highlight: Option<(FeedEntry, Instant)>,
}

impl LiveAttendanceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: FeedEntry, now: Instant) {
        self.entries.push_front(entry.clone());
        self.entries.truncate(FEED_CAPACITY);
        // A newer event replaces the window rather than adding a second one.
        self.highlight = Some((entry, now + HIGHLIGHT_WINDOW));
    }

    pub fn entries(&self) -> impl Iterator<Item = &FeedEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn highlighted(&self) -> Option<&FeedEntry> {
        self.highlight.as_ref().map(|(entry, _)| entry)
    }

    pub fn highlight_deadline(&self) -> Option<Instant> {
        self.highlight.as_ref().map(|(_, deadline)| *deadline)
    }

    /// Clears the highlight once its deadline has passed. Returns whether it
    /// was cleared.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.highlight_deadline() {
            Some(deadline) if deadline <= now => {
                self.highlight = None;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            entries: self.entries.iter().cloned().collect(),
            highlight: self.highlighted().cloned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub entries: Vec<FeedEntry>,
    pub highlight: Option<FeedEntry>,
}

/// Keeps a [`LiveAttendanceFeed`] current from the live channel and publishes
/// snapshots. Dropping the monitor stops it and its highlight timer.
pub struct AttendanceMonitor {
    snapshots: watch::Receiver<FeedSnapshot>,
    task: JoinHandle<()>,
}

impl AttendanceMonitor {
    pub fn mount(channel: &LiveChannel) -> Self {
        Self::spawn(channel.subscribe())
    }

    pub fn spawn(events: broadcast::Receiver<ServerEvent>) -> Self {
        let (snapshot_tx, snapshots) = watch::channel(FeedSnapshot::default());
        let task = tokio::spawn(run_monitor(events, snapshot_tx));
        Self { snapshots, task }
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshots.clone()
    }
}

impl Drop for AttendanceMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_monitor(
    mut events: broadcast::Receiver<ServerEvent>,
    snapshots: watch::Sender<FeedSnapshot>,
) {
    let mut feed = LiveAttendanceFeed::new();
    let mut events_open = true;

    loop {
        let deadline = feed.highlight_deadline();
        if !events_open && deadline.is_none() {
            break;
        }
        // Disabled branches still build their future, hence the fallback.
        let wake_at = deadline.unwrap_or_else(|| Instant::now() + HIGHLIGHT_WINDOW);

        tokio::select! {
            event = events.recv(), if events_open => match event {
                Ok(ServerEvent::AttendanceMarked(marked)) => {
                    debug!(name = %marked.name, "attendance marked");
                    feed.push(marked.into(), Instant::now());
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "attendance monitor lagged behind live events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    events_open = false;
                    continue;
                }
            },
            _ = sleep_until(wake_at), if deadline.is_some() => {
                if !feed.expire(Instant::now()) {
                    continue;
                }
            }
        }

        snapshots.send_replace(feed.snapshot());
    }
}
