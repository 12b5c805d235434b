//! Per-frontend delegate: subscriptions, liveness, and route pushes

use chrono::{DateTime, Utc};
use nexus_core::{FrontendControl, ModelRoute, NodeId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// The scheduler-side mirror of one frontend
pub struct FrontendDelegate {
    node_id: NodeId,
    ip: String,
    server_port: String,
    rpc_port: String,

    /// Model session ids the frontend subscribed to via LoadModel
    subscriptions: BTreeSet<String>,

    beacon_interval: Duration,
    last_beacon: Instant,
    last_alive: DateTime<Utc>,

    ctrl: Arc<dyn FrontendControl>,
}

impl FrontendDelegate {
    pub fn new(
        node_id: NodeId,
        ip: impl Into<String>,
        server_port: impl Into<String>,
        rpc_port: impl Into<String>,
        beacon_interval: Duration,
        ctrl: Arc<dyn FrontendControl>,
    ) -> Self {
        Self {
            node_id,
            ip: ip.into(),
            server_port: server_port.into(),
            rpc_port: rpc_port.into(),
            subscriptions: BTreeSet::new(),
            beacon_interval,
            last_beacon: Instant::now(),
            last_alive: Utc::now(),
            ctrl,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn server_port(&self) -> &str {
        &self.server_port
    }

    pub fn rpc_port(&self) -> &str {
        &self.rpc_port
    }

    /// Bump liveness on any RPC arrival from the frontend
    pub fn tick(&mut self) {
        self.last_beacon = Instant::now();
        self.last_alive = Utc::now();
    }

    pub fn is_alive(&self) -> bool {
        self.last_beacon.elapsed() <= self.beacon_interval * 2
    }

    /// Wall-clock time of the last sign of life, for eviction logs
    pub fn last_alive_time(&self) -> DateTime<Utc> {
        self.last_alive
    }

    /// Record a subscription; returns false when it already existed
    pub fn subscribe_model(&mut self, session_id: impl Into<String>) -> bool {
        self.subscriptions.insert(session_id.into())
    }

    /// Drop a subscription
    pub fn unsubscribe_model(&mut self, session_id: &str) -> bool {
        self.subscriptions.remove(session_id)
    }

    /// Subscribed session ids
    pub fn subscriptions(&self) -> &BTreeSet<String> {
        &self.subscriptions
    }

    /// Push route updates. Fire and forget: frontends re-poll on restart,
    /// so a failed push is only logged.
    pub async fn update_model_routes_rpc(&self, routes: Vec<ModelRoute>) {
        if routes.is_empty() {
            return;
        }
        if let Err(err) = self.ctrl.update_model_routes(routes).await {
            warn!("Route push to frontend {} failed: {}", self.node_id, err);
        }
    }
}

impl std::fmt::Debug for FrontendDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontendDelegate")
            .field("node_id", &self.node_id)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::MockFrontendControl;

    fn frontend() -> (FrontendDelegate, Arc<MockFrontendControl>) {
        let ctrl = Arc::new(MockFrontendControl::new());
        let delegate = FrontendDelegate::new(
            NodeId(10),
            "10.0.0.10",
            "8001",
            "8002",
            Duration::from_secs(2),
            ctrl.clone(),
        );
        (delegate, ctrl)
    }

    #[test]
    fn test_subscriptions() {
        let (mut frontend, _) = frontend();
        assert!(frontend.subscribe_model("a:b:1:100"));
        assert!(!frontend.subscribe_model("a:b:1:100"));
        assert!(frontend.unsubscribe_model("a:b:1:100"));
        assert!(!frontend.unsubscribe_model("a:b:1:100"));
    }

    #[tokio::test]
    async fn test_empty_route_push_is_skipped() {
        let (frontend, ctrl) = frontend();
        frontend.update_model_routes_rpc(Vec::new()).await;
        assert!(ctrl.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_liveness_window() {
        tokio::time::pause();
        let (mut frontend, _) = frontend();
        frontend.tick();
        assert!(frontend.is_alive());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!frontend.is_alive());
    }
}
