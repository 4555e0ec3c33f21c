//! Prometheus metrics and health endpoints

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::Response, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use tracing::{debug, error};
use warden_core::ReconcileObserver;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Reconcile passes by kind and outcome
    pub static ref RECONCILE_TOTAL: CounterVec = CounterVec::new(
        Opts::new("reconcile_total", "Total number of reconcile passes")
            .namespace("warden"),
        &["kind", "outcome"]
    ).unwrap();

    pub static ref RECONCILE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("reconcile_duration_seconds", "Reconcile pass duration in seconds")
            .namespace("warden")
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["kind"]
    ).unwrap();

    /// One worker runs per managed object
    pub static ref ACTIVE_WORKERS: GaugeVec = GaugeVec::new(
        Opts::new("active_workers", "Number of live per-object workers")
            .namespace("warden"),
        &["kind"]
    ).unwrap();
}

/// Register every collector with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    register(Box::new(RECONCILE_TOTAL.clone()))?;
    register(Box::new(RECONCILE_DURATION.clone()))?;
    register(Box::new(ACTIVE_WORKERS.clone()))?;
    Ok(())
}

fn register(collector: Box<dyn prometheus::core::Collector>) -> anyhow::Result<()> {
    match REGISTRY.register(collector) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Feeds controller events into the collectors above.
#[derive(Debug, Default)]
pub struct PrometheusObserver;

impl ReconcileObserver for PrometheusObserver {
    fn reconciled(&self, kind: &str, outcome: &str, elapsed: Duration) {
        RECONCILE_TOTAL.with_label_values(&[kind, outcome]).inc();
        RECONCILE_DURATION
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    fn workers_changed(&self, kind: &str, active: usize) {
        ACTIVE_WORKERS.with_label_values(&[kind]).set(active as f64);
    }
}

/// Flipped once both controllers are running.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn mark_not_ready(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn create_router(readiness: Readiness) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(readiness)
}

async fn metrics_handler() -> Result<Response<String>, StatusCode> {
    debug!("Metrics endpoint requested");

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let body = String::from_utf8(buffer).map_err(|e| {
        error!("Failed to convert metrics to string: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Response::builder()
        .status(200)
        .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .body(body)
        .map_err(|e| {
            error!("Failed to build metrics response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(readiness): State<Readiness>) -> StatusCode {
    if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
