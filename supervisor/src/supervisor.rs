use crate::clock::Clock;
use crate::config::RestartConfig;
use crate::engine::{CapacityConfig, CapacityMode, Engine, EngineHandle};
use crate::error::Result;
use crate::metrics::RelayMetrics;
use crate::traffic::{RestartReason, TrafficTracker};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Restarting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub poll_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Uptime after which an instance counts as healthy
    pub stable_after: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &RestartConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            backoff_initial: Duration::from_millis(config.backoff_initial_ms),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
            stable_after: Duration::from_secs(config.stable_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartCounts {
    pub engine_starts: u64,
    pub transient_failures: u64,
    pub quota_restarts: u64,
}

struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

enum Outcome {
    Shutdown,
    Quota(RestartReason),
    Exited(std::result::Result<Result<()>, tokio::task::JoinError>),
}

/// Keeps exactly one engine instance alive and swaps it for a new one when
/// the quota tracker asks for different capacity. The next instance is only
/// started after the previous one's task has finished.
pub struct Supervisor {
    engine: Arc<dyn Engine>,
    tracker: Option<Arc<TrafficTracker>>,
    normal: CapacityConfig,
    throttled: CapacityConfig,
    policy: RestartPolicy,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<RelayMetrics>>,
    state: watch::Sender<SupervisorState>,
    engine_starts: AtomicU64,
    transient_failures: AtomicU64,
    quota_restarts: AtomicU64,
}

impl Supervisor {
    pub fn new(
        engine: Arc<dyn Engine>,
        normal: CapacityConfig,
        throttled: CapacityConfig,
        policy: RestartPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        Self {
            engine,
            tracker: None,
            normal,
            throttled,
            policy,
            clock,
            metrics: None,
            state,
            engine_starts: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            quota_restarts: AtomicU64::new(0),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<TrafficTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn restart_counts(&self) -> RestartCounts {
        RestartCounts {
            engine_starts: self.engine_starts.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            quota_restarts: self.quota_restarts.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    fn current_capacity(&self) -> &CapacityConfig {
        match self.tracker.as_ref().map(|t| t.capacity_mode()) {
            Some(CapacityMode::Throttled) => &self.throttled,
            _ => &self.normal,
        }
    }

    /// Runs until `root` is cancelled or an engine fails to start.
    #[instrument(skip(self, root))]
    pub async fn run(&self, root: CancellationToken) -> Result<()> {
        let result = self.run_loop(&root).await;
        self.set_state(SupervisorState::Stopped);
        info!("Supervisor stopped");
        result
    }

    async fn run_loop(&self, root: &CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new(self.policy.backoff_initial, self.policy.backoff_max);

        while !root.is_cancelled() {
            // The new instance always reflects the tracker's latest decision,
            // so any request raised meanwhile is already satisfied.
            if let Some(tracker) = &self.tracker {
                tracker.poll(self.clock.now());
            }
            let capacity = self.current_capacity().clone();

            let handle = match self.engine.start(&capacity).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!("Failed to start relay engine: {}", e);
                    return Err(e);
                }
            };
            self.engine_starts.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.engine_starts.inc();
                metrics.record_capacity(&capacity);
            }
            self.set_state(SupervisorState::Running);

            let started_at = Instant::now();
            let instance = root.child_token();
            let mut task = spawn_instance(handle, instance.clone());

            match self.watch_instance(root, &mut task).await {
                Outcome::Shutdown => {
                    instance.cancel();
                    wait_for_instance(task).await;
                    break;
                }
                Outcome::Quota(reason) => {
                    self.set_state(SupervisorState::Restarting);
                    info!(
                        "[RESTART] {}, restarting relay engine with {} capacity",
                        reason,
                        self.current_capacity().mode
                    );
                    instance.cancel();
                    wait_for_instance(task).await;
                    self.quota_restarts.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.quota_restarts.inc();
                    }
                    backoff.reset();
                }
                Outcome::Exited(_) if root.is_cancelled() => break,
                Outcome::Exited(joined) => {
                    self.set_state(SupervisorState::Restarting);
                    match joined {
                        Ok(Ok(())) => warn!("Relay engine exited unexpectedly"),
                        Ok(Err(e)) => warn!("Relay engine failed: {}", e),
                        Err(e) => error!("Relay engine task panicked: {}", e),
                    }
                    self.transient_failures.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.engine_failures.inc();
                    }

                    if started_at.elapsed() >= self.policy.stable_after {
                        backoff.reset();
                    }
                    let delay = backoff.next_delay();
                    info!("Restarting relay engine in {:?}", delay);
                    tokio::select! {
                        _ = root.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Ok(())
    }

    async fn watch_instance(
        &self,
        root: &CancellationToken,
        task: &mut JoinHandle<Result<()>>,
    ) -> Outcome {
        let mut ticker = tokio::time::interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = root.cancelled() => return Outcome::Shutdown,
                joined = &mut *task => return Outcome::Exited(joined),
                _ = ticker.tick() => {
                    let Some(tracker) = &self.tracker else {
                        continue;
                    };
                    if let Some(reason) = tracker.poll(self.clock.now()) {
                        return Outcome::Quota(reason);
                    }
                }
            }
        }
    }
}

fn spawn_instance(
    handle: Box<dyn EngineHandle>,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(handle.run(cancel))
}

async fn wait_for_instance(task: JoinHandle<Result<()>>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Relay engine stopped with error: {}", e),
        Err(e) => error!("Relay engine task panicked: {}", e),
    }
}
