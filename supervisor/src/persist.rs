//! Best-effort durable snapshots: the quota tracker's state and the optional
//! stats dump. Callers never wait on disk; writes run on detached tasks.

use crate::stats::Stats;
use crate::traffic::{StatePersister, TrafficState};
use chrono::{DateTime, Utc};
use common::json_file::{read_json, to_pretty_vec, write_atomic};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Serializes on the caller's thread and writes on a detached task. Writes
/// carry a sequence number and are applied in order; a snapshot older than
/// the last one written is skipped.
pub struct DetachedJsonWriter {
    path: PathBuf,
    label: &'static str,
    runtime: Handle,
    next_seq: AtomicU64,
    last_written: Arc<Mutex<u64>>,
    completed: Arc<watch::Sender<u64>>,
}

impl DetachedJsonWriter {
    pub fn new(path: PathBuf, label: &'static str, runtime: Handle) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            path,
            label,
            runtime,
            next_seq: AtomicU64::new(0),
            last_written: Arc::new(Mutex::new(0)),
            completed: Arc::new(completed),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn submit<T: Serialize>(&self, value: &T) -> Option<JoinHandle<()>> {
        let contents = match to_pretty_vec(value) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Failed to serialize {}: {}", self.label, e);
                return None;
            }
        };
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let path = self.path.clone();
        let label = self.label;
        let last_written = self.last_written.clone();
        let completed = self.completed.clone();

        Some(self.runtime.spawn(async move {
            {
                let mut last = last_written.lock().await;
                if seq > *last {
                    match write_atomic(&path, &contents).await {
                        Ok(()) => *last = seq,
                        Err(e) => warn!("Failed to write {}: {}", label, e),
                    }
                } else {
                    debug!("Skipping stale {} snapshot #{}", label, seq);
                }
            }
            completed.send_modify(|done| *done = (*done).max(seq));
        }))
    }

    /// Waits until every snapshot submitted so far has been written or skipped.
    pub async fn flush(&self) {
        let target = self.next_seq.load(Ordering::Acquire);
        let mut done = self.completed.subscribe();
        let _ = done.wait_for(|done| *done >= target).await;
    }
}

pub struct StateStore {
    writer: DetachedJsonWriter,
}

impl StateStore {
    pub fn new(path: PathBuf, runtime: Handle) -> Self {
        Self {
            writer: DetachedJsonWriter::new(path, "traffic state", runtime),
        }
    }

    /// Any read or parse failure starts a fresh period; a missing or corrupt
    /// file is never fatal.
    pub async fn load_or_init(&self, now: DateTime<Utc>) -> TrafficState {
        let path = self.writer.path();
        match read_json::<TrafficState>(path).await {
            Ok(state) => {
                info!(
                    "Loaded traffic state from {} (period start {}, {} bytes used, throttled: {})",
                    path.display(),
                    state.period_start_time,
                    state.bytes_used,
                    state.is_throttled
                );
                state
            }
            Err(e) => {
                info!("No usable traffic state ({}), starting a fresh period", e);
                let state = TrafficState::fresh(now);
                self.writer.submit(&state);
                state
            }
        }
    }

    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}

impl StatePersister for StateStore {
    fn persist(&self, state: &TrafficState) {
        self.writer.submit(state);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsFileRecord {
    pub announcing: i64,
    pub connecting_clients: i64,
    pub connected_clients: i64,
    pub total_bytes_up: u64,
    pub total_bytes_down: u64,
    pub uptime_seconds: u64,
    pub idle_seconds: u64,
    pub is_live: bool,
    pub timestamp: DateTime<Utc>,
}

impl StatsFileRecord {
    pub fn new(stats: &Stats, uptime_seconds: f64, idle_seconds: f64, now: DateTime<Utc>) -> Self {
        Self {
            announcing: stats.announcing,
            connecting_clients: stats.connecting_clients,
            connected_clients: stats.connected_clients,
            total_bytes_up: stats.total_bytes_up,
            total_bytes_down: stats.total_bytes_down,
            uptime_seconds: uptime_seconds as u64,
            idle_seconds: idle_seconds as u64,
            is_live: stats.is_live,
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn missing_state_starts_fresh_and_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic_state.json");
        let store = StateStore::new(path.clone(), Handle::current());

        let state = store.load_or_init(now()).await;
        assert_eq!(state, TrafficState::fresh(now()));

        store.flush().await;
        let saved: TrafficState = read_json(&path).await.unwrap();
        assert_eq!(saved, state);
    }

    #[tokio::test]
    async fn corrupt_state_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic_state.json");
        std::fs::write(&path, b"{\"bytesUsed\": \"lots\"").unwrap();
        let store = StateStore::new(path, Handle::current());

        assert_eq!(store.load_or_init(now()).await, TrafficState::fresh(now()));
    }

    #[tokio::test]
    async fn reload_reproduces_last_saved_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic_state.json");
        let store = StateStore::new(path.clone(), Handle::current());

        for bytes_used in [10, 20, 30] {
            store.persist(&TrafficState {
                period_start_time: now(),
                bytes_used,
                is_throttled: bytes_used >= 30,
            });
        }
        store.flush().await;

        let reloaded = StateStore::new(path, Handle::current())
            .load_or_init(now() + chrono::TimeDelta::days(1))
            .await;
        assert_eq!(reloaded.bytes_used, 30);
        assert!(reloaded.is_throttled);
        assert_eq!(reloaded.period_start_time, now());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_leave_latest_state_on_disk() {
        use crate::traffic::{QuotaPolicy, TrafficTracker};
        use std::time::Duration;

        for round in 0..10 {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("traffic_state.json");
            let store = Arc::new(StateStore::new(path.clone(), Handle::current()));
            let tracker = TrafficTracker::new(
                QuotaPolicy::new(1_000_000, Duration::from_secs(86_400), 80),
                TrafficState::fresh(now()),
                store.clone(),
            );

            std::thread::scope(|scope| {
                for _ in 0..8 {
                    scope.spawn(|| {
                        for _ in 0..50 {
                            tracker.record_bytes(1, now());
                        }
                    });
                }
            });
            store.flush().await;

            let saved: TrafficState = read_json(&path).await.unwrap();
            assert_eq!(saved.bytes_used, 400, "round {}", round);
            assert_eq!(saved, tracker.state(), "round {}", round);
        }
    }

    #[tokio::test]
    async fn state_file_uses_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic_state.json");
        let store = StateStore::new(path.clone(), Handle::current());
        store.persist(&TrafficState {
            period_start_time: now(),
            bytes_used: 5,
            is_throttled: false,
        });
        store.flush().await;

        let raw: serde_json::Value = read_json(&path).await.unwrap();
        assert_eq!(raw["bytesUsed"], serde_json::json!(5));
        assert_eq!(raw["isThrottled"], serde_json::json!(false));
        assert_eq!(raw["periodStartTime"], serde_json::json!("2026-03-01T08:30:00Z"));
    }

    #[tokio::test]
    async fn write_failures_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("stats.json");
        let writer = DetachedJsonWriter::new(path.clone(), "stats", Handle::current());

        let task = writer.submit(&serde_json::json!({"ok": true})).unwrap();
        task.await.unwrap();
        writer.flush().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stats_record_snapshot() {
        let stats = Stats {
            announcing: 1,
            connecting_clients: 2,
            connected_clients: 3,
            total_bytes_up: 100,
            total_bytes_down: 200,
            start_time: now(),
            last_active_time: Some(now()),
            is_live: true,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let writer = DetachedJsonWriter::new(path.clone(), "stats", Handle::current());

        writer.submit(&StatsFileRecord::new(&stats, 12.7, 0.0, now()));
        writer.flush().await;

        let raw: serde_json::Value = read_json(&path).await.unwrap();
        assert_eq!(raw["connectedClients"], serde_json::json!(3));
        assert_eq!(raw["totalBytesDown"], serde_json::json!(200));
        assert_eq!(raw["uptimeSeconds"], serde_json::json!(12));
        assert_eq!(raw["isLive"], serde_json::json!(true));
    }
}
