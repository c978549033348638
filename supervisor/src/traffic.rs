use crate::engine::CapacityMode;
use chrono::{DateTime, TimeDelta, Utc};
use common::format_bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Durable quota accounting for the current period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficState {
    pub period_start_time: DateTime<Utc>,
    pub bytes_used: u64,
    pub is_throttled: bool,
}

impl TrafficState {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            period_start_time: now,
            bytes_used: 0,
            is_throttled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub limit_bytes: u64,
    pub period: Duration,
    pub threshold_bytes: u64,
}

impl QuotaPolicy {
    pub fn new(limit_bytes: u64, period: Duration, threshold_percent: u8) -> Self {
        let threshold_bytes =
            (u128::from(limit_bytes) * u128::from(threshold_percent) / 100) as u64;
        Self {
            limit_bytes,
            period,
            threshold_bytes,
        }
    }

    fn period_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        let period = TimeDelta::from_std(self.period).unwrap_or(TimeDelta::days(365 * 100));
        start.checked_add_signed(period).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Receives every state change while the tracker lock is held, so calls
/// arrive in update order; implementations must not block.
pub trait StatePersister: Send + Sync {
    fn persist(&self, state: &TrafficState);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    ThresholdCrossed,
    PeriodReset,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::ThresholdCrossed => write!(f, "quota threshold crossed"),
            RestartReason::PeriodReset => write!(f, "quota period reset"),
        }
    }
}

struct TrackerInner {
    state: TrafficState,
    pending_restart: Option<RestartReason>,
    overage_warned: bool,
}

/// Rolling-period byte accounting with a one-way Normal → Throttled switch
/// per period. The tracker never talks to the supervisor directly; it leaves
/// a pending restart request that the supervisor collects with [`poll`].
///
/// [`poll`]: TrafficTracker::poll
pub struct TrafficTracker {
    policy: QuotaPolicy,
    inner: Mutex<TrackerInner>,
    persister: Arc<dyn StatePersister>,
}

impl TrafficTracker {
    pub fn new(policy: QuotaPolicy, state: TrafficState, persister: Arc<dyn StatePersister>) -> Self {
        info!(
            "Traffic quota: {} per {}s, throttling at {}; {} used so far{}",
            format_bytes(policy.limit_bytes),
            policy.period.as_secs(),
            format_bytes(policy.threshold_bytes),
            format_bytes(state.bytes_used),
            if state.is_throttled { " (throttled)" } else { "" }
        );
        Self {
            policy,
            inner: Mutex::new(TrackerInner {
                state,
                pending_restart: None,
                overage_warned: false,
            }),
            persister,
        }
    }

    /// Accounts `bytes` to the current period. Returns true when this call
    /// crossed the throttle threshold and the engine needs a restart.
    pub fn record_bytes(&self, bytes: u64, now: DateTime<Utc>) -> bool {
        if bytes == 0 {
            return false;
        }

        let mut inner = self.inner.lock();
        self.roll_period_locked(&mut inner, now);

        inner.state.bytes_used = inner.state.bytes_used.saturating_add(bytes);

        let crossed =
            !inner.state.is_throttled && inner.state.bytes_used >= self.policy.threshold_bytes;
        if crossed {
            inner.state.is_throttled = true;
            inner.pending_restart = Some(RestartReason::ThresholdCrossed);
            warn!(
                "[THROTTLE] Threshold reached ({} of {} used). Reducing capacity until the period ends",
                format_bytes(inner.state.bytes_used),
                format_bytes(self.policy.limit_bytes)
            );
        }

        if inner.state.is_throttled
            && !inner.overage_warned
            && inner.state.bytes_used >= self.policy.limit_bytes
        {
            inner.overage_warned = true;
            warn!(
                "[OVERAGE] Traffic limit of {} exceeded; continuing at minimum capacity",
                format_bytes(self.policy.limit_bytes)
            );
        }

        // Submitted under the lock so persisted snapshots keep update order.
        self.persister.persist(&inner.state);
        crossed
    }

    /// Applies a due period reset and drains the pending restart request.
    /// Requests raised since the previous poll coalesce into one.
    pub fn poll(&self, now: DateTime<Utc>) -> Option<RestartReason> {
        let mut inner = self.inner.lock();
        if self.roll_period_locked(&mut inner, now) {
            self.persister.persist(&inner.state);
        }
        inner.pending_restart.take()
    }

    pub fn capacity_mode(&self) -> CapacityMode {
        if self.inner.lock().state.is_throttled {
            CapacityMode::Throttled
        } else {
            CapacityMode::Normal
        }
    }

    pub fn state(&self) -> TrafficState {
        self.inner.lock().state.clone()
    }

    fn roll_period_locked(&self, inner: &mut TrackerInner, now: DateTime<Utc>) -> bool {
        if now <= self.policy.period_end(inner.state.period_start_time) {
            return false;
        }

        let was_throttled = inner.state.is_throttled;
        info!(
            "[RESET] Traffic period ended after {} used. Starting a new period",
            format_bytes(inner.state.bytes_used)
        );
        inner.state = TrafficState::fresh(now);
        inner.overage_warned = false;
        if was_throttled {
            inner.pending_restart = Some(RestartReason::PeriodReset);
        }
        true
    }

    #[cfg(test)]
    fn overage_warned(&self) -> bool {
        self.inner.lock().overage_warned
    }
}
