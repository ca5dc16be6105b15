//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of handler invocations
    pub static ref HANDLER_INVOCATIONS: CounterVec = register_counter_vec!(
        "pgo_operator_handler_invocations_total",
        "Total number of event handler invocations",
        &["kind"]
    ).unwrap();

    /// Total number of handler errors
    pub static ref HANDLER_ERRORS: CounterVec = register_counter_vec!(
        "pgo_operator_handler_errors_total",
        "Total number of event handler errors",
        &["kind"]
    ).unwrap();

    /// Handler duration histogram
    pub static ref HANDLER_DURATION: HistogramVec = register_histogram_vec!(
        "pgo_operator_handler_duration_seconds",
        "Duration of event handlers in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    /// Pgtasks dispatched by task type
    pub static ref TASKS_DISPATCHED: CounterVec = register_counter_vec!(
        "pgo_operator_tasks_dispatched_total",
        "Total number of Pgtasks dispatched by task type",
        &["task_type"]
    ).unwrap();

    /// Completed backups by backup type
    pub static ref BACKUPS_COMPLETED: CounterVec = register_counter_vec!(
        "pgo_operator_backups_completed_total",
        "Total number of completed pgBackRest backup jobs",
        &["backup_type"]
    ).unwrap();

    /// Work queue depth
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "pgo_operator_queue_depth",
        "Number of keys waiting in a work queue",
        &["queue", "namespace"]
    ).unwrap();

    /// Controller groups currently running
    pub static ref CONTROLLER_GROUPS: Gauge = register_gauge!(
        "pgo_operator_controller_groups",
        "Number of running namespace controller groups"
    ).unwrap();

    /// Bounded waits that ran out of time
    pub static ref POLL_TIMEOUTS: Counter = register_counter!(
        "pgo_operator_poll_timeouts_total",
        "Total number of bounded waits that timed out"
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: Gauge = register_gauge!(
        "pgo_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

static READY: AtomicBool = AtomicBool::new(false);

/// Mark the operator ready once its controller groups are running
pub fn set_ready(ready: bool) {
    READY.store(ready, Ordering::SeqCst);
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text(StatusCode::OK, "ok"),
        "/readyz" | "/ready" if READY.load(Ordering::SeqCst) => text(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
