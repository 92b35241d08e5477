//! Prometheus metrics for the proxy.
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,

    // Authentication metrics
    /// Authentication attempts by outcome
    pub auth_total: IntCounterVec,

    // Query metrics
    /// Statements routed by target kind (master/slave/all)
    pub queries_routed_total: IntCounterVec,
    /// Statement latency by target kind
    pub query_duration_seconds: HistogramVec,
    /// Protocol violations observed (out-of-order packets, bad frames)
    pub protocol_errors_total: IntCounter,
    /// Session commands recorded in history
    pub session_commands_total: IntCounter,
    /// History replays executed on fresh backend connections
    pub history_replays_total: IntCounter,
    /// Replay replies that diverged from the authoritative outcome
    pub replay_mismatches_total: IntCounter,

    // KILL handling
    /// KILL statements processed
    pub kills_total: IntCounter,

    // User account metrics
    /// User database refreshes that published a new version
    pub userdb_updates_total: IntCounter,
    /// Current user database version
    pub userdb_version: IntGauge,

    // Backend metrics
    /// Backend connections by server
    pub backend_connections: IntGaugeVec,
    /// Transient backend errors recovered without the client noticing
    pub backend_recoveries_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "hermes_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "hermes_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let connections_closed = IntCounter::new(
            "hermes_connections_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();

        let auth_total = IntCounterVec::new(
            Opts::new("hermes_auth_total", "Authentication attempts by outcome"),
            &["outcome"], // ok, access_denied, bad_db, blocked, ...
        )
        .unwrap();

        let queries_routed_total = IntCounterVec::new(
            Opts::new(
                "hermes_queries_routed_total",
                "Statements routed by target kind",
            ),
            &["target"], // master, slave, all
        )
        .unwrap();

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new("hermes_query_duration_seconds", "Statement latency")
                .buckets(vec![
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                    5.0, 10.0,
                ]),
            &["target"],
        )
        .unwrap();

        let protocol_errors_total = IntCounter::new(
            "hermes_protocol_errors_total",
            "Protocol violations observed on client connections",
        )
        .unwrap();

        let session_commands_total = IntCounter::new(
            "hermes_session_commands_total",
            "Session commands recorded in history",
        )
        .unwrap();

        let history_replays_total = IntCounter::new(
            "hermes_history_replays_total",
            "History replays executed on fresh backend connections",
        )
        .unwrap();

        let replay_mismatches_total = IntCounter::new(
            "hermes_replay_mismatches_total",
            "Replay replies diverging from the authoritative outcome",
        )
        .unwrap();

        let kills_total =
            IntCounter::new("hermes_kills_total", "KILL statements processed").unwrap();

        let userdb_updates_total = IntCounter::new(
            "hermes_userdb_updates_total",
            "User database refreshes that published a new version",
        )
        .unwrap();

        let userdb_version =
            IntGauge::new("hermes_userdb_version", "Current user database version").unwrap();

        let backend_connections = IntGaugeVec::new(
            Opts::new("hermes_backend_connections", "Backend connections by server"),
            &["server"],
        )
        .unwrap();

        let backend_recoveries_total = IntCounter::new(
            "hermes_backend_recoveries_total",
            "Transient backend errors recovered by reconnect and replay",
        )
        .unwrap();

        registry.register(Box::new(connections_total.clone())).unwrap();
        registry.register(Box::new(connections_active.clone())).unwrap();
        registry.register(Box::new(connections_closed.clone())).unwrap();
        registry.register(Box::new(auth_total.clone())).unwrap();
        registry.register(Box::new(queries_routed_total.clone())).unwrap();
        registry.register(Box::new(query_duration_seconds.clone())).unwrap();
        registry.register(Box::new(protocol_errors_total.clone())).unwrap();
        registry.register(Box::new(session_commands_total.clone())).unwrap();
        registry.register(Box::new(history_replays_total.clone())).unwrap();
        registry.register(Box::new(replay_mismatches_total.clone())).unwrap();
        registry.register(Box::new(kills_total.clone())).unwrap();
        registry.register(Box::new(userdb_updates_total.clone())).unwrap();
        registry.register(Box::new(userdb_version.clone())).unwrap();
        registry.register(Box::new(backend_connections.clone())).unwrap();
        registry.register(Box::new(backend_recoveries_total.clone())).unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            auth_total,
            queries_routed_total,
            query_duration_seconds,
            protocol_errors_total,
            session_commands_total,
            history_replays_total,
            replay_mismatches_total,
            kills_total,
            userdb_updates_total,
            userdb_version,
            backend_connections,
            backend_recoveries_total,
        }
    }

    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    pub fn record_auth(&self, outcome: &str) {
        self.auth_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_route(&self, target: &str, duration_secs: f64) {
        self.queries_routed_total.with_label_values(&[target]).inc();
        self.query_duration_seconds
            .with_label_values(&[target])
            .observe(duration_secs);
    }

    pub fn record_userdb_update(&self, version: i64) {
        self.userdb_updates_total.inc();
        self.userdb_version.set(version);
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().gather();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/health" => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
