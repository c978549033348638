use crate::notice::{ActivityDelta, ByteCount, RegionActivity, RegionScope};
use chrono::{DateTime, TimeDelta, Utc};
use common::{format_bytes, format_duration};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::info;

const MAX_LOGGED_REGIONS_PER_SCOPE: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub announcing: i64,
    pub connecting_clients: i64,
    pub connected_clients: i64,
    pub total_bytes_up: u64,
    pub total_bytes_down: u64,
    pub start_time: DateTime<Utc>,
    /// Last time at least one client was connecting or connected
    pub last_active_time: Option<DateTime<Utc>>,
    /// Latched once the engine first reports any activity
    pub is_live: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionActivityTotals {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub connecting_clients: i64,
    pub connected_clients: i64,
}

pub type RegionTotals = BTreeMap<RegionScope, BTreeMap<String, RegionActivityTotals>>;

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub snapshot: Stats,
    /// Bytes newly accounted by this notice, after total reconciliation
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub should_log: bool,
    pub became_live: bool,
}

impl ApplyOutcome {
    pub fn bytes_total(&self) -> u64 {
        self.bytes_up.saturating_add(self.bytes_down)
    }
}

/// Last absolute byte totals reported by the current engine instance.
#[derive(Debug, Default)]
struct SessionTotals {
    up: Option<u64>,
    down: Option<u64>,
}

struct StatsInner {
    stats: Stats,
    regions: RegionTotals,
    session: SessionTotals,
    last_log_at: Option<DateTime<Utc>>,
}

/// Owns the live counters. Every mutation happens under one write guard; the
/// client counts and last-active time are mirrored into atomics in the same
/// critical section so idle time can be read without taking the lock.
pub struct StatsAggregator {
    inner: RwLock<StatsInner>,
    log_interval: TimeDelta,
    start_unix_nanos: i64,
    connecting_clients: AtomicI64,
    connected_clients: AtomicI64,
    last_active_unix_nanos: AtomicI64,
}

impl StatsAggregator {
    pub fn new(start_time: DateTime<Utc>, log_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(StatsInner {
                stats: Stats {
                    announcing: 0,
                    connecting_clients: 0,
                    connected_clients: 0,
                    total_bytes_up: 0,
                    total_bytes_down: 0,
                    start_time,
                    last_active_time: None,
                    is_live: false,
                },
                regions: RegionTotals::new(),
                session: SessionTotals::default(),
                last_log_at: None,
            }),
            log_interval: TimeDelta::from_std(log_interval).unwrap_or_else(|_| TimeDelta::days(365)),
            start_unix_nanos: unix_nanos(start_time),
            connecting_clients: AtomicI64::new(0),
            connected_clients: AtomicI64::new(0),
            last_active_unix_nanos: AtomicI64::new(0),
        }
    }

    pub fn apply(&self, delta: &ActivityDelta, now: DateTime<Utc>) -> ApplyOutcome {
        let mut inner = self.inner.write();
        let StatsInner {
            stats,
            regions,
            session,
            last_log_at,
        } = &mut *inner;

        let previous = (
            stats.announcing,
            stats.connecting_clients,
            stats.connected_clients,
        );

        if let Some(v) = delta.announcing {
            stats.announcing = v;
        }
        if let Some(v) = delta.connecting_clients {
            stats.connecting_clients = v;
        }
        if let Some(v) = delta.connected_clients {
            stats.connected_clients = v;
        }

        let bytes_up = reconcile(delta.bytes_up, &mut session.up);
        let bytes_down = reconcile(delta.bytes_down, &mut session.down);
        stats.total_bytes_up = stats.total_bytes_up.saturating_add(bytes_up);
        stats.total_bytes_down = stats.total_bytes_down.saturating_add(bytes_down);

        for (scope, deltas) in &delta.regions {
            accumulate_regions(regions.entry(*scope).or_default(), deltas);
        }

        let active_clients = stats.connecting_clients + stats.connected_clients;
        if active_clients > 0 {
            stats.last_active_time = Some(now);
            self.last_active_unix_nanos
                .store(unix_nanos(now), Ordering::Release);
        }

        let became_live = !stats.is_live && stats.announcing + active_clients > 0;
        if became_live {
            stats.is_live = true;
        }

        let clients_changed = previous
            != (
                stats.announcing,
                stats.connecting_clients,
                stats.connected_clients,
            );
        let should_log = clients_changed
            || last_log_at.is_none_or(|at| now.signed_duration_since(at) >= self.log_interval);
        if should_log {
            *last_log_at = Some(now);
        }

        self.connecting_clients
            .store(stats.connecting_clients, Ordering::Release);
        self.connected_clients
            .store(stats.connected_clients, Ordering::Release);

        let log_line = should_log.then(|| stats_line(stats, regions, now));
        let snapshot = stats.clone();
        drop(inner);

        if let Some(line) = log_line {
            info!("[STATS] {}", line);
        }

        ApplyOutcome {
            snapshot,
            bytes_up,
            bytes_down,
            should_log,
            became_live,
        }
    }

    /// Forgets the absolute totals of the previous engine instance; its
    /// replacement counts from zero again.
    pub fn begin_engine_session(&self) {
        self.inner.write().session = SessionTotals::default();
    }

    pub fn snapshot(&self) -> Stats {
        self.inner.read().stats.clone()
    }

    pub fn region_totals(&self) -> RegionTotals {
        self.inner.read().regions.clone()
    }

    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> f64 {
        nanos_between(self.start_unix_nanos, unix_nanos(now))
    }

    /// Zero while any client is connecting or connected, otherwise the time
    /// since the last active moment (or since start if never active).
    pub fn idle_seconds(&self, now: DateTime<Utc>) -> f64 {
        let connecting = self.connecting_clients.load(Ordering::Acquire);
        let connected = self.connected_clients.load(Ordering::Acquire);
        if connecting > 0 || connected > 0 {
            return 0.0;
        }
        let last_active = self.last_active_unix_nanos.load(Ordering::Acquire);
        let since = if last_active == 0 {
            self.start_unix_nanos
        } else {
            last_active
        };
        nanos_between(since, unix_nanos(now))
    }
}

fn reconcile(count: Option<ByteCount>, last_total: &mut Option<u64>) -> u64 {
    match count {
        None => 0,
        Some(ByteCount::Delta(n)) => n,
        Some(ByteCount::Total(total)) => {
            let increment = match *last_total {
                Some(previous) if total >= previous => total - previous,
                // First report from this engine, or its counters went backwards.
                _ => total,
            };
            *last_total = Some(total);
            increment
        }
    }
}

/// Bytes accumulate; client counts are latest values, so every region in the
/// scope is zeroed first and only regions present in this batch get counts.
fn accumulate_regions(
    totals: &mut BTreeMap<String, RegionActivityTotals>,
    deltas: &BTreeMap<String, RegionActivity>,
) {
    for region in totals.values_mut() {
        region.connecting_clients = 0;
        region.connected_clients = 0;
    }
    for (name, delta) in deltas {
        let region = totals.entry(name.clone()).or_default();
        region.bytes_up = region.bytes_up.saturating_add(delta.bytes_up);
        region.bytes_down = region.bytes_down.saturating_add(delta.bytes_down);
        region.connecting_clients = delta.connecting_clients;
        region.connected_clients = delta.connected_clients;
    }
}

fn stats_line(stats: &Stats, regions: &RegionTotals, now: DateTime<Utc>) -> String {
    let uptime = now
        .signed_duration_since(stats.start_time)
        .to_std()
        .unwrap_or_default();
    format!(
        "Announcing: {} | Connecting: {} | Connected: {} | Up: {} | Down: {} | Uptime: {} | Regions: {}",
        stats.announcing,
        stats.connecting_clients,
        stats.connected_clients,
        format_bytes(stats.total_bytes_up),
        format_bytes(stats.total_bytes_down),
        format_duration(uptime),
        format_regions(regions),
    )
}

pub fn format_regions(regions: &RegionTotals) -> String {
    let parts: Vec<String> = [RegionScope::Personal, RegionScope::Common]
        .iter()
        .filter_map(|scope| {
            let by_region = regions.get(scope).filter(|r| !r.is_empty())?;
            Some(format!("{}[{}]", scope.as_str(), format_scope(by_region)))
        })
        .collect();

    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(" ")
    }
}

fn format_scope(by_region: &BTreeMap<String, RegionActivityTotals>) -> String {
    let traffic = |t: &RegionActivityTotals| t.bytes_up.saturating_add(t.bytes_down);

    let mut ranked: Vec<(&String, &RegionActivityTotals)> = by_region.iter().collect();
    // BTreeMap iteration is name-ordered, so a stable sort keeps ties by name.
    ranked.sort_by(|a, b| traffic(b.1).cmp(&traffic(a.1)));

    let mut parts: Vec<String> = ranked
        .iter()
        .take(MAX_LOGGED_REGIONS_PER_SCOPE)
        .map(|(region, totals)| {
            format!(
                "{}(conn:{}|traffic:{})",
                region,
                totals.connected_clients,
                format_bytes(traffic(totals))
            )
        })
        .collect();

    if ranked.len() > MAX_LOGGED_REGIONS_PER_SCOPE {
        parts.push(format!(
            "(+{} more...)",
            ranked.len() - MAX_LOGGED_REGIONS_PER_SCOPE
        ));
    }
    parts.join(", ")
}

fn unix_nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn nanos_between(from: i64, to: i64) -> f64 {
    (to.saturating_sub(from)).max(0) as f64 / 1e9
}
