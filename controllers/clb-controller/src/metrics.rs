//! Prometheus metrics and the probe/metrics HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ControllerError;

/// Controller metrics plus the readiness flag served on `/readyz`.
#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    /// Port allocations by pool and result
    pub allocations: IntCounterVec,
    /// Binding state transitions by kind and state
    pub binding_states: IntCounterVec,
    /// Failed reconciles by controller
    pub reconcile_errors: IntCounterVec,
    /// Allocated listener ports by pool and load balancer
    pub lb_allocated: IntGaugeVec,
    ready: AtomicBool,
}

impl Metrics {
    /// Creates and registers every collector.
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new_custom(Some("clb".to_string()), None)?;

        let allocations = IntCounterVec::new(
            Opts::new("port_allocations_total", "Port allocation attempts by pool and result"),
            &["pool", "result"],
        )?;
        let binding_states = IntCounterVec::new(
            Opts::new("binding_state_transitions_total", "Binding state transitions"),
            &["kind", "state"],
        )?;
        let reconcile_errors = IntCounterVec::new(
            Opts::new("reconcile_errors_total", "Reconciles that returned an error"),
            &["controller"],
        )?;
        let lb_allocated = IntGaugeVec::new(
            Opts::new("lb_allocated_ports", "Listener ports allocated per load balancer"),
            &["pool", "lb_id"],
        )?;

        registry.register(Box::new(allocations.clone()))?;
        registry.register(Box::new(binding_states.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;
        registry.register(Box::new(lb_allocated.clone()))?;

        Ok(Self {
            registry,
            allocations,
            binding_states,
            reconcile_errors,
            lb_allocated,
            ready: AtomicBool::new(false),
        })
    }

    /// Marks startup replay as finished.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Whether startup replay has finished.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Text exposition of every registered collector.
    pub fn encode(&self) -> Result<String, ControllerError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    if metrics.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "replaying")
    }
}

async fn render(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `/healthz`, `/readyz` and `/metrics`.
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/readyz", get(readyz))
        .route("/metrics", get(render))
        .layer(TraceLayer::new_for_http())
        // Probes stay below the trace layer
        .route("/healthz", get(healthz))
        .with_state(metrics)
}

/// Serves [`router`] on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>, shutdown: CancellationToken) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Metrics(format!("bind {addr}: {e}")))?;
    info!("Metrics server listening on {}", addr);
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ControllerError::Metrics(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_status(metrics: &Arc<Metrics>, uri: &str) -> StatusCode {
        router(Arc::clone(metrics))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_readyz_follows_replay() {
        let metrics = Arc::new(Metrics::new().unwrap());
        assert_eq!(get_status(&metrics, "/healthz").await, StatusCode::OK);
        assert_eq!(get_status(&metrics, "/readyz").await, StatusCode::SERVICE_UNAVAILABLE);

        metrics.set_ready();
        assert_eq!(get_status(&metrics, "/readyz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.allocations.with_label_values(&["pool-a", "ok"]).inc();
        metrics.lb_allocated.with_label_values(&["pool-a", "lb-1"]).set(3);

        assert_eq!(get_status(&metrics, "/metrics").await, StatusCode::OK);
        let body = metrics.encode().unwrap();
        assert!(body.contains("clb_port_allocations_total{pool=\"pool-a\",result=\"ok\"} 1"));
        assert!(body.contains("clb_lb_allocated_ports{lb_id=\"lb-1\",pool=\"pool-a\"} 3"));
    }
}
