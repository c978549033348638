use crate::engine::CapacityConfig;
use crate::error::{Result, SupervisorError};
use crate::stats::{RegionTotals, Stats};
use crate::traffic::TrafficState;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::Mutex;
use prometheus::{Counter, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const NAMESPACE: &str = "relay";

type ScrapeHook = Box<dyn Fn(&RelayMetrics) + Send + Sync>;

/// Prometheus view of the relay: live engine stats, the capacity the current
/// engine runs with, quota accounting and supervisor restart counters.
pub struct RelayMetrics {
    registry: Registry,
    scrape_hook: Mutex<Option<ScrapeHook>>,

    pub announcing: Gauge,
    pub connecting_clients: Gauge,
    pub connected_clients: Gauge,
    pub bytes_uploaded: Gauge,
    pub bytes_downloaded: Gauge,
    pub is_live: Gauge,
    /// Refreshed at scrape time
    pub uptime_seconds: Gauge,
    /// Refreshed at scrape time
    pub idle_seconds: Gauge,

    pub max_common_clients: Gauge,
    pub max_personal_clients: Gauge,
    pub bandwidth_limit_bytes_per_second: Gauge,

    pub is_throttled: Gauge,
    pub quota_bytes_used: Gauge,

    pub region_bytes_uploaded: GaugeVec,
    pub region_bytes_downloaded: GaugeVec,
    pub region_connecting_clients: GaugeVec,
    pub region_connected_clients: GaugeVec,

    pub engine_starts: Counter,
    pub engine_failures: Counter,
    pub quota_restarts: Counter,
}

fn gauge(name: &str, help: &str) -> Result<Gauge> {
    Ok(Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn region_gauge(name: &str, help: &str) -> Result<GaugeVec> {
    Ok(GaugeVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        &["scope", "region"],
    )?)
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

impl RelayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let announcing = gauge("announcing", "Announcements awaiting a client match.")?;
        let connecting_clients = gauge("connecting_clients", "Clients currently connecting.")?;
        let connected_clients = gauge("connected_clients", "Clients currently connected.")?;
        let bytes_uploaded = gauge("bytes_uploaded", "Total bytes relayed upstream.")?;
        let bytes_downloaded = gauge("bytes_downloaded", "Total bytes relayed downstream.")?;
        let is_live = gauge("is_live", "Whether the engine has reported activity (1=yes, 0=no).")?;
        let uptime_seconds = gauge("uptime_seconds", "Seconds since the service started.")?;
        let idle_seconds = gauge("idle_seconds", "Seconds since a client was last connecting or connected.")?;

        let max_common_clients = gauge("max_common_clients", "Common client limit of the running engine.")?;
        let max_personal_clients = gauge("max_personal_clients", "Personal client limit of the running engine.")?;
        let bandwidth_limit_bytes_per_second = gauge(
            "bandwidth_limit_bytes_per_second",
            "Per-direction bandwidth limit of the running engine, 0 when unlimited.",
        )?;

        let is_throttled = gauge("is_throttled", "Whether the traffic quota throttle is active (1=yes, 0=no).")?;
        let quota_bytes_used = gauge("quota_bytes_used", "Bytes accounted to the current quota period.")?;

        let region_bytes_uploaded = region_gauge("region_bytes_uploaded", "Bytes relayed upstream by client region.")?;
        let region_bytes_downloaded = region_gauge("region_bytes_downloaded", "Bytes relayed downstream by client region.")?;
        let region_connecting_clients = region_gauge("region_connecting_clients", "Connecting clients by client region.")?;
        let region_connected_clients = region_gauge("region_connected_clients", "Connected clients by client region.")?;

        let engine_starts = counter("engine_starts_total", "Engine instances started.")?;
        let engine_failures = counter("engine_failures_total", "Engine instances that exited unexpectedly.")?;
        let quota_restarts = counter("quota_restarts_total", "Engine restarts caused by the traffic quota.")?;

        registry.register(Box::new(announcing.clone()))?;
        registry.register(Box::new(connecting_clients.clone()))?;
        registry.register(Box::new(connected_clients.clone()))?;
        registry.register(Box::new(bytes_uploaded.clone()))?;
        registry.register(Box::new(bytes_downloaded.clone()))?;
        registry.register(Box::new(is_live.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;
        registry.register(Box::new(idle_seconds.clone()))?;
        registry.register(Box::new(max_common_clients.clone()))?;
        registry.register(Box::new(max_personal_clients.clone()))?;
        registry.register(Box::new(bandwidth_limit_bytes_per_second.clone()))?;
        registry.register(Box::new(is_throttled.clone()))?;
        registry.register(Box::new(quota_bytes_used.clone()))?;
        registry.register(Box::new(region_bytes_uploaded.clone()))?;
        registry.register(Box::new(region_bytes_downloaded.clone()))?;
        registry.register(Box::new(region_connecting_clients.clone()))?;
        registry.register(Box::new(region_connected_clients.clone()))?;
        registry.register(Box::new(engine_starts.clone()))?;
        registry.register(Box::new(engine_failures.clone()))?;
        registry.register(Box::new(quota_restarts.clone()))?;

        Ok(Self {
            registry,
            scrape_hook: Mutex::new(None),
            announcing,
            connecting_clients,
            connected_clients,
            bytes_uploaded,
            bytes_downloaded,
            is_live,
            uptime_seconds,
            idle_seconds,
            max_common_clients,
            max_personal_clients,
            bandwidth_limit_bytes_per_second,
            is_throttled,
            quota_bytes_used,
            region_bytes_uploaded,
            region_bytes_downloaded,
            region_connecting_clients,
            region_connected_clients,
            engine_starts,
            engine_failures,
            quota_restarts,
        })
    }

    /// Runs right before every gather, for values derived from the clock.
    pub fn set_scrape_hook<F>(&self, hook: F)
    where
        F: Fn(&RelayMetrics) + Send + Sync + 'static,
    {
        *self.scrape_hook.lock() = Some(Box::new(hook));
    }

    pub fn record_stats(&self, stats: &Stats) {
        self.announcing.set(stats.announcing as f64);
        self.connecting_clients.set(stats.connecting_clients as f64);
        self.connected_clients.set(stats.connected_clients as f64);
        self.bytes_uploaded.set(stats.total_bytes_up as f64);
        self.bytes_downloaded.set(stats.total_bytes_down as f64);
        self.is_live.set(if stats.is_live { 1.0 } else { 0.0 });
    }

    pub fn record_regions(&self, regions: &RegionTotals) {
        for (scope, by_region) in regions {
            for (region, totals) in by_region {
                let labels = [scope.as_str(), region.as_str()];
                self.region_bytes_uploaded
                    .with_label_values(&labels)
                    .set(totals.bytes_up as f64);
                self.region_bytes_downloaded
                    .with_label_values(&labels)
                    .set(totals.bytes_down as f64);
                self.region_connecting_clients
                    .with_label_values(&labels)
                    .set(totals.connecting_clients as f64);
                self.region_connected_clients
                    .with_label_values(&labels)
                    .set(totals.connected_clients as f64);
            }
        }
    }

    pub fn record_capacity(&self, capacity: &CapacityConfig) {
        self.max_common_clients
            .set(f64::from(capacity.max_common_clients));
        self.max_personal_clients
            .set(f64::from(capacity.max_personal_clients));
        self.bandwidth_limit_bytes_per_second
            .set(capacity.bandwidth_bytes_per_second as f64);
    }

    pub fn record_quota(&self, state: &TrafficState) {
        self.is_throttled
            .set(if state.is_throttled { 1.0 } else { 0.0 });
        self.quota_bytes_used.set(state.bytes_used as f64);
    }

    pub fn render(&self) -> Result<String> {
        if let Some(hook) = self.scrape_hook.lock().as_ref() {
            hook(self);
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| SupervisorError::Metrics(prometheus::Error::Msg(e.to_string())))
    }

    /// Binds `addr` (":port" means all interfaces) and serves `/metrics` and
    /// `/healthz` until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, addr: &str, shutdown: CancellationToken) -> Result<SocketAddr> {
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| SupervisorError::MetricsServer {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self);

        tokio::spawn(async move {
            info!("Metrics server listening on {}", local_addr);

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                })
                .await;

            match result {
                Ok(()) => info!("Metrics server stopped"),
                Err(e) => error!("Metrics server error: {}", e),
            }
        });

        Ok(local_addr)
    }
}

async fn metrics_handler(State(metrics): State<Arc<RelayMetrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CapacityMode;
    use crate::notice::RegionScope;
    use crate::stats::RegionActivityTotals;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn stats() -> Stats {
        Stats {
            announcing: 2,
            connecting_clients: 3,
            connected_clients: 7,
            total_bytes_up: 1024,
            total_bytes_down: 4096,
            start_time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            last_active_time: None,
            is_live: true,
        }
    }

    #[test]
    fn renders_recorded_values() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.record_stats(&stats());
        metrics.record_capacity(&CapacityConfig {
            mode: CapacityMode::Normal,
            max_common_clients: 50,
            max_personal_clients: 5,
            bandwidth_bytes_per_second: 5_000_000,
            proxy_key: String::new(),
            compartment_id: None,
            emit_activity: true,
        });
        metrics.engine_starts.inc();

        let mut regions = RegionTotals::new();
        regions.entry(RegionScope::Common).or_insert_with(BTreeMap::new).insert(
            "DE".to_string(),
            RegionActivityTotals {
                bytes_up: 10,
                bytes_down: 20,
                connecting_clients: 0,
                connected_clients: 4,
            },
        );
        metrics.record_regions(&regions);

        let text = metrics.render().unwrap();
        assert!(text.contains("relay_connected_clients 7"));
        assert!(text.contains("relay_bytes_downloaded 4096"));
        assert!(text.contains("relay_is_live 1"));
        assert!(text.contains("relay_max_common_clients 50"));
        assert!(text.contains("relay_bandwidth_limit_bytes_per_second 5000000"));
        assert!(text.contains("relay_engine_starts_total 1"));
        let region_line = text
            .lines()
            .find(|line| line.starts_with("relay_region_connected_clients{"))
            .unwrap();
        assert!(region_line.contains(r#"region="DE""#));
        assert!(region_line.contains(r#"scope="common""#));
        assert!(region_line.ends_with(" 4"));
    }

    #[test]
    fn scrape_hook_runs_before_render() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.set_scrape_hook(|m| m.uptime_seconds.set(42.0));
        assert!(metrics.render().unwrap().contains("relay_uptime_seconds 42"));
    }

    #[tokio::test]
    async fn serves_metrics_until_shutdown() {
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        metrics.quota_bytes_used.set(99.0);
        let shutdown = CancellationToken::new();

        let addr = metrics
            .clone()
            .serve("127.0.0.1:0", shutdown.clone())
            .await
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("relay_quota_bytes_used 99"));

        shutdown.cancel();
    }
}
