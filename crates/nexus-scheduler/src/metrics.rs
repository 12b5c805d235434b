//! Scheduler metrics
//!
//! Counters and gauges for the control plane, registered on a prometheus
//! registry and served as text over a small HTTP listener.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Scheduler control-plane metrics
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    registry: Arc<Registry>,

    /// RPC requests by method and reply status
    pub rpc_requests: IntCounterVec,

    /// Alive backends
    pub backends_alive: IntGauge,

    /// Alive frontends
    pub frontends_alive: IntGauge,

    /// Registered model session groups
    pub session_groups: IntGauge,

    /// Beacon sweeps executed
    pub beacon_runs: IntCounter,

    /// Epoch schedules executed
    pub epoch_runs: IntCounter,

    /// Model-table pushes by result
    pub table_pushes: IntCounterVec,
}

impl SchedulerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());
        let rpc_requests = IntCounterVec::new(
            prometheus::Opts::new("nexus_scheduler_rpc_requests_total", "RPC requests"),
            &["method", "status"],
        )?;
        let backends_alive = IntGauge::new("nexus_scheduler_backends_alive", "Alive backends")?;
        let frontends_alive = IntGauge::new("nexus_scheduler_frontends_alive", "Alive frontends")?;
        let session_groups =
            IntGauge::new("nexus_scheduler_session_groups", "Registered session groups")?;
        let beacon_runs =
            IntCounter::new("nexus_scheduler_beacon_runs_total", "Beacon sweeps executed")?;
        let epoch_runs =
            IntCounter::new("nexus_scheduler_epoch_runs_total", "Epoch schedules executed")?;
        let table_pushes = IntCounterVec::new(
            prometheus::Opts::new("nexus_scheduler_table_pushes_total", "Model table pushes"),
            &["result"],
        )?;

        registry.register(Box::new(rpc_requests.clone()))?;
        registry.register(Box::new(backends_alive.clone()))?;
        registry.register(Box::new(frontends_alive.clone()))?;
        registry.register(Box::new(session_groups.clone()))?;
        registry.register(Box::new(beacon_runs.clone()))?;
        registry.register(Box::new(epoch_runs.clone()))?;
        registry.register(Box::new(table_pushes.clone()))?;

        Ok(Self {
            registry,
            rpc_requests,
            backends_alive,
            frontends_alive,
            session_groups,
            beacon_runs,
            epoch_runs,
            table_pushes,
        })
    }

    /// Count one RPC
    pub fn observe_rpc(&self, method: &str, status: &str) {
        self.rpc_requests.with_label_values(&[method, status]).inc();
    }

    /// Encode the registry in the prometheus text format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Serve `GET /metrics` on the given address until the task is aborted
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let app = Router::new()
            .route("/metrics", get(render_metrics))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Metrics exporter listening on {}", addr);
        axum::serve(listener, app).await
    }
}

async fn render_metrics(
    State(metrics): State<Arc<SchedulerMetrics>>,
) -> (StatusCode, String) {
    (StatusCode::OK, metrics.gather())
}
