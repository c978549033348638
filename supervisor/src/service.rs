use crate::clock::{Clock, SystemClock};
use crate::config::SupervisorConfig;
use crate::engine::{CommandEngine, Engine, NoticeSink};
use crate::error::{Result, SupervisorError};
use crate::metrics::RelayMetrics;
use crate::notice::{ActivityDelta, Notice, classify};
use crate::persist::{DetachedJsonWriter, StateStore, StatsFileRecord};
use crate::stats::StatsAggregator;
use crate::supervisor::{RestartPolicy, Supervisor};
use crate::traffic::TrafficTracker;
use common::units::format_bandwidth;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Turns raw engine output into stats, quota accounting, metrics and the
/// stats file. Runs on the engine's reader task.
pub struct NoticeHandler {
    aggregator: Arc<StatsAggregator>,
    tracker: Option<Arc<TrafficTracker>>,
    metrics: Option<Arc<RelayMetrics>>,
    stats_writer: Option<DetachedJsonWriter>,
    clock: Arc<dyn Clock>,
    verbosity: u8,
    publish: Mutex<()>,
}

impl NoticeHandler {
    pub fn new(
        aggregator: Arc<StatsAggregator>,
        tracker: Option<Arc<TrafficTracker>>,
        metrics: Option<Arc<RelayMetrics>>,
        stats_writer: Option<DetachedJsonWriter>,
        clock: Arc<dyn Clock>,
        verbosity: u8,
    ) -> Self {
        Self {
            aggregator,
            tracker,
            metrics,
            stats_writer,
            clock,
            verbosity,
            publish: Mutex::new(()),
        }
    }

    pub async fn flush(&self) {
        if let Some(writer) = &self.stats_writer {
            writer.flush().await;
        }
    }

    fn handle_activity(&self, delta: &ActivityDelta) {
        // Held from apply to publish so gauges and the stats file never
        // move back to an older snapshot.
        let _publish = self.publish.lock();
        let now = self.clock.now();
        let outcome = self.aggregator.apply(delta, now);

        if outcome.became_live {
            info!("[OK] Relay is live and serving clients");
        }

        if let Some(tracker) = &self.tracker {
            tracker.record_bytes(outcome.bytes_total(), now);
            if let Some(metrics) = &self.metrics {
                metrics.record_quota(&tracker.state());
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_stats(&outcome.snapshot);
            if !delta.regions.is_empty() {
                metrics.record_regions(&self.aggregator.region_totals());
            }
        }

        if let Some(writer) = self.stats_writer.as_ref().filter(|_| outcome.should_log) {
            writer.submit(&StatsFileRecord::new(
                &outcome.snapshot,
                self.aggregator.uptime_seconds(now),
                self.aggregator.idle_seconds(now),
                now,
            ));
        }
    }
}

impl NoticeSink for NoticeHandler {
    fn on_notice(&self, raw: &[u8]) {
        let Some(notice) = classify(raw) else {
            return;
        };

        match notice {
            Notice::Activity(delta) => self.handle_activity(&delta),
            Notice::MustUpgrade => {
                warn!("A newer version of the relay engine is required. Please upgrade.")
            }
            Notice::Info(message) => {
                if self.verbosity >= 1 {
                    if let Some(message) = message {
                        info!("[INFO] {}", message);
                    }
                }
            }
            Notice::Error { message, data } => {
                if self.verbosity >= 1 {
                    match message {
                        Some(message) => error!("[ERROR] {}", message),
                        None => error!("[ERROR] {:?}", data),
                    }
                }
            }
            Notice::Other { notice_type, data } => {
                if self.verbosity >= 1 {
                    debug!("[DEBUG] {}: {:?}", notice_type, data);
                }
            }
        }
    }

    fn on_engine_start(&self) {
        self.aggregator.begin_engine_session();
    }
}

/// Owns one supervised relay from data directory to shutdown.
pub struct Service {
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    engine: Option<Arc<dyn Engine>>,
}

impl Service {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            engine: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the default child-process engine.
    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    #[instrument(skip(self, root))]
    pub async fn run(self, root: CancellationToken) -> Result<()> {
        let config = self.config;
        let data_dir = config.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|source| SupervisorError::DataDir {
                path: data_dir.clone(),
                source,
            })?;

        let runtime = Handle::current();
        let now = self.clock.now();
        let aggregator = Arc::new(StatsAggregator::new(now, config.stats_log_interval()));

        let (tracker, store) = match config.quota_policy() {
            Some(policy) => {
                let store = Arc::new(StateStore::new(config.traffic_state_path(), runtime.clone()));
                let state = store.load_or_init(now).await;
                let tracker = Arc::new(TrafficTracker::new(policy, state, store.clone()));
                (Some(tracker), Some(store))
            }
            None => (None, None),
        };

        let metrics_shutdown = CancellationToken::new();
        let metrics = match &config.metrics_addr {
            Some(addr) => {
                let metrics = Arc::new(RelayMetrics::new()?);
                let scrape_aggregator = aggregator.clone();
                let scrape_clock = self.clock.clone();
                metrics.set_scrape_hook(move |metrics| {
                    let now = scrape_clock.now();
                    metrics
                        .uptime_seconds
                        .set(scrape_aggregator.uptime_seconds(now));
                    metrics
                        .idle_seconds
                        .set(scrape_aggregator.idle_seconds(now));
                });
                if let Some(tracker) = &tracker {
                    metrics.record_quota(&tracker.state());
                }
                metrics.clone().serve(addr, metrics_shutdown.clone()).await?;
                Some(metrics)
            }
            None => None,
        };

        let stats_writer = config
            .stats_file_path()
            .map(|path| DetachedJsonWriter::new(path, "stats file", runtime.clone()));
        let handler = Arc::new(NoticeHandler::new(
            aggregator,
            tracker.clone(),
            metrics.clone(),
            stats_writer,
            self.clock.clone(),
            config.verbosity,
        ));

        let engine: Arc<dyn Engine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(CommandEngine::new(&config)),
        };
        engine.register_notice_sink(handler.clone())?;

        let normal = config.normal_capacity();
        let throttled = config.throttled_capacity();
        info!(
            "[OK] Relay supervisor starting (data dir {}, normal capacity {} clients at {})",
            data_dir.display(),
            config.max_clients(),
            format_bandwidth(normal.bandwidth_bytes_per_second)
        );

        let mut supervisor = Supervisor::new(
            engine,
            normal,
            throttled,
            RestartPolicy::from_config(&config.restart),
            self.clock.clone(),
        );
        if let Some(tracker) = tracker {
            supervisor = supervisor.with_tracker(tracker);
        }
        if let Some(metrics) = metrics {
            supervisor = supervisor.with_metrics(metrics);
        }

        let result = supervisor.run(root).await;
        let counts = supervisor.restart_counts();
        info!(
            "Relay engine started {} times ({} unexpected exits, {} quota restarts)",
            counts.engine_starts, counts.transient_failures, counts.quota_restarts
        );

        metrics_shutdown.cancel();
        handler.flush().await;
        if let Some(store) = store {
            store.flush().await;
        }
        result
    }
}
