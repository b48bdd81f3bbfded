//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(target: "r_bess::metrics", address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(target: "r_bess::metrics", error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address; differs from the requested one when port 0 was asked for.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

fn latency_buckets() -> Result<Vec<f64>> {
    prometheus::exponential_buckets(0.001, 2.0, 16).context("failed to construct histogram buckets")
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
    devices_configured: IntGauge,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "r_bessd_starts_total",
            "Total number of times the R-BESS daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r_bessd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(latency_buckets()?),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "r_bessd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        let devices_configured = IntGauge::with_opts(Opts::new(
            "r_bessd_devices_configured",
            "Number of devices the daemon is polling",
        ))?;
        registry.register(Box::new(devices_configured.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
            devices_configured,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }

    pub fn set_device_count(&self, count: usize) {
        self.devices_configured.set(count as i64);
    }
}

/// Request outcomes as seen by the UDP transport.
#[derive(Clone, Debug)]
pub struct TransportMetrics {
    requests_total: IntCounterVec,
    request_latency_seconds: HistogramVec,
    unmatched_datagrams_total: IntCounterVec,
}

impl TransportMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "r_bess_transport_requests_total",
                "Request attempts by method and outcome",
            ),
            &["method", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "r_bess_transport_request_latency_seconds",
                "Round trip time of answered requests",
            )
            .buckets(latency_buckets()?),
            &["method"],
        )?;
        registry.register(Box::new(request_latency_seconds.clone()))?;

        let unmatched_datagrams_total = IntCounterVec::new(
            Opts::new(
                "r_bess_transport_unmatched_datagrams_total",
                "Inbound datagrams discarded without a waiting request",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(unmatched_datagrams_total.clone()))?;

        Ok(Self {
            requests_total,
            request_latency_seconds,
            unmatched_datagrams_total,
        })
    }

    pub fn record_attempt(&self, method: &str, outcome: &str) {
        self.requests_total
            .with_label_values(&[method, outcome])
            .inc();
    }

    pub fn observe_latency(&self, method: &str, seconds: f64) {
        self.request_latency_seconds
            .with_label_values(&[method])
            .observe(seconds);
    }

    pub fn record_unmatched(&self, kind: &str) {
        self.unmatched_datagrams_total
            .with_label_values(&[kind])
            .inc();
    }
}

/// Polling cycle health per device and tier.
#[derive(Clone, Debug)]
pub struct PollerMetrics {
    cycles_total: IntCounterVec,
    consecutive_failures: IntGaugeVec,
    stale: IntGaugeVec,
}

impl PollerMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let cycles_total = IntCounterVec::new(
            Opts::new(
                "r_bess_poll_cycles_total",
                "Polling cycles by device, tier and outcome",
            ),
            &["device", "tier", "outcome"],
        )?;
        registry.register(Box::new(cycles_total.clone()))?;

        let consecutive_failures = IntGaugeVec::new(
            Opts::new(
                "r_bess_poll_consecutive_failures",
                "Failed polling cycles since the last success",
            ),
            &["device"],
        )?;
        registry.register(Box::new(consecutive_failures.clone()))?;

        let stale = IntGaugeVec::new(
            Opts::new(
                "r_bess_poll_stale",
                "Indicator (0/1) whether device data is stale",
            ),
            &["device"],
        )?;
        registry.register(Box::new(stale.clone()))?;

        Ok(Self {
            cycles_total,
            consecutive_failures,
            stale,
        })
    }

    pub fn record_cycle(&self, device: &str, tier: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.cycles_total
            .with_label_values(&[device, tier, outcome])
            .inc();
    }

    pub fn set_health(&self, device: &str, failures: u32, stale: bool) {
        self.consecutive_failures
            .with_label_values(&[device])
            .set(i64::from(failures));
        self.stale
            .with_label_values(&[device])
            .set(i64::from(stale));
    }
}

/// Scanner activity.
#[derive(Clone, Debug)]
pub struct ScannerMetrics {
    scans_total: IntCounterVec,
    debounced_total: IntCounter,
    address_changes_total: IntCounter,
    unconfigured_total: IntCounter,
}

impl ScannerMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let scans_total = IntCounterVec::new(
            Opts::new("r_bess_scanner_scans_total", "Discovery scans by trigger"),
            &["trigger"],
        )?;
        registry.register(Box::new(scans_total.clone()))?;

        let debounced_total = IntCounter::with_opts(Opts::new(
            "r_bess_scanner_debounced_total",
            "Scan requests ignored inside the cooldown window",
        ))?;
        registry.register(Box::new(debounced_total.clone()))?;

        let address_changes_total = IntCounter::with_opts(Opts::new(
            "r_bess_scanner_address_changes_total",
            "Known devices found at a new address",
        ))?;
        registry.register(Box::new(address_changes_total.clone()))?;

        let unconfigured_total = IntCounter::with_opts(Opts::new(
            "r_bess_scanner_unconfigured_total",
            "Notifications about devices that are not configured",
        ))?;
        registry.register(Box::new(unconfigured_total.clone()))?;

        Ok(Self {
            scans_total,
            debounced_total,
            address_changes_total,
            unconfigured_total,
        })
    }

    pub fn record_scan(&self, trigger: &str) {
        self.scans_total.with_label_values(&[trigger]).inc();
    }

    pub fn record_debounced(&self) {
        self.debounced_total.inc();
    }

    pub fn record_address_change(&self) {
        self.address_changes_total.inc();
    }

    pub fn record_unconfigured(&self) {
        self.unconfigured_total.inc();
    }
}

/// Control command outcomes.
#[derive(Clone, Debug)]
pub struct ControlMetrics {
    commands_total: IntCounterVec,
}

impl ControlMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let commands_total = IntCounterVec::new(
            Opts::new(
                "r_bess_control_commands_total",
                "Control commands by kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;
        Ok(Self { commands_total })
    }

    pub fn record(&self, kind: &str, outcome: &str) {
        self.commands_total
            .with_label_values(&[kind, outcome])
            .inc();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn families_register_once_per_registry() {
        let registry = new_registry();
        TransportMetrics::new(&registry).unwrap();
        PollerMetrics::new(&registry).unwrap();
        ScannerMetrics::new(&registry).unwrap();
        ControlMetrics::new(&registry).unwrap();
        assert!(TransportMetrics::new(&registry).is_err());
    }

    #[test]
    fn poller_health_gauges_follow_updates() {
        let registry = new_registry();
        let metrics = PollerMetrics::new(&registry).unwrap();
        metrics.set_health("venus", 3, true);
        metrics.record_cycle("venus", "fast", false);
        let families = registry.gather();
        let stale = families
            .iter()
            .find(|family| family.get_name() == "r_bess_poll_stale")
            .unwrap();
        assert_eq!(stale.get_metric()[0].get_gauge().get_value(), 1.0);
    }

    #[tokio::test]
    async fn exporter_serves_registered_families() {
        let registry = new_registry();
        let metrics = TransportMetrics::new(&registry).unwrap();
        metrics.record_attempt("ES.GetStatus", "success");

        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.contains("r_bess_transport_requests_total"));
        assert!(body
            .to_ascii_lowercase()
            .contains("content-type: text/plain; version=0.0.4"));

        server.shutdown().await.unwrap();
    }
}
