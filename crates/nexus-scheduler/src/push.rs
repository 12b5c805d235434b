//! Outbound control channels
//!
//! Delegates push model tables and routes through the [`BackendControl`]
//! and [`FrontendControl`] seams. The gRPC implementations here connect
//! lazily and convert core types to the wire contracts; the factory lets
//! tests swap in the recording mocks from nexus-core.

use async_trait::async_trait;
use nexus_core::{
    BackendControl, BackendInfo, Error, FrontendControl, MockBackendControl, MockFrontendControl,
    ModelRoute, ModelTableUpdate, NodeId, Result,
};
use nexus_proto::{BackendCtrlClient, FrontendCtrlClient, ModelRouteUpdatesRequest};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tonic::transport::Channel;
use tracing::debug;

/// Creates control channels for newly registered nodes
pub trait ControlFactory: Send + Sync {
    fn backend_control(&self, info: &BackendInfo) -> Arc<dyn BackendControl>;
    fn frontend_control(&self, node_id: NodeId, rpc_addr: &str) -> Arc<dyn FrontendControl>;
}

/// Factory producing lazily connected tonic clients
pub struct GrpcControlFactory {
    timeout: Duration,
}

impl GrpcControlFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ControlFactory for GrpcControlFactory {
    fn backend_control(&self, info: &BackendInfo) -> Arc<dyn BackendControl> {
        Arc::new(GrpcBackendControl {
            endpoint: format!("http://{}", info.rpc_addr()),
            timeout: self.timeout,
            client: tokio::sync::Mutex::new(None),
        })
    }

    fn frontend_control(&self, _node_id: NodeId, rpc_addr: &str) -> Arc<dyn FrontendControl> {
        Arc::new(GrpcFrontendControl {
            endpoint: format!("http://{}", rpc_addr),
            timeout: self.timeout,
            client: tokio::sync::Mutex::new(None),
        })
    }
}

struct GrpcBackendControl {
    endpoint: String,
    timeout: Duration,
    client: tokio::sync::Mutex<Option<BackendCtrlClient<Channel>>>,
}

impl GrpcBackendControl {
    async fn client(&self) -> Result<BackendCtrlClient<Channel>> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            let channel = Channel::from_shared(self.endpoint.clone())
                .map_err(|e| Error::transport(format!("bad endpoint {}: {}", self.endpoint, e)))?
                .connect_timeout(self.timeout)
                .timeout(self.timeout)
                .connect()
                .await
                .map_err(|e| Error::transport(format!("connect {}: {}", self.endpoint, e)))?;
            *guard = Some(BackendCtrlClient::new(channel));
        }
        Ok(guard.as_ref().expect("client connected").clone())
    }
}

#[async_trait]
impl BackendControl for GrpcBackendControl {
    async fn update_model_table(&self, update: ModelTableUpdate) -> Result<()> {
        let mut client = self.client().await?;
        let request: nexus_proto::ModelTableUpdateRequest = update.into();
        debug!(
            "Pushing model table ({} instances) to {}",
            request.model_instances.len(),
            self.endpoint
        );
        client
            .update_model_table(request)
            .await
            .map_err(|e| Error::transport(format!("model table push: {}", e)))?;
        Ok(())
    }
}

struct GrpcFrontendControl {
    endpoint: String,
    timeout: Duration,
    client: tokio::sync::Mutex<Option<FrontendCtrlClient<Channel>>>,
}

impl GrpcFrontendControl {
    async fn client(&self) -> Result<FrontendCtrlClient<Channel>> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            let channel = Channel::from_shared(self.endpoint.clone())
                .map_err(|e| Error::transport(format!("bad endpoint {}: {}", self.endpoint, e)))?
                .connect_timeout(self.timeout)
                .timeout(self.timeout)
                .connect()
                .await
                .map_err(|e| Error::transport(format!("connect {}: {}", self.endpoint, e)))?;
            *guard = Some(FrontendCtrlClient::new(channel));
        }
        Ok(guard.as_ref().expect("client connected").clone())
    }
}

#[async_trait]
impl FrontendControl for GrpcFrontendControl {
    async fn update_model_routes(&self, routes: Vec<ModelRoute>) -> Result<()> {
        let mut client = self.client().await?;
        let request = ModelRouteUpdatesRequest {
            model_routes: routes.into_iter().map(Into::into).collect(),
        };
        client
            .update_model_routes(request)
            .await
            .map_err(|e| Error::transport(format!("route push: {}", e)))?;
        Ok(())
    }
}

/// Factory handing out recording mocks, for exercising the scheduler
/// without a network
pub struct MockControlFactory {
    backends: Mutex<HashMap<NodeId, Arc<MockBackendControl>>>,
    frontends: Mutex<HashMap<NodeId, Arc<MockFrontendControl>>>,
}

impl MockControlFactory {
    pub fn new() -> Self {
        Self {
            backends: Mutex::new(HashMap::new()),
            frontends: Mutex::new(HashMap::new()),
        }
    }

    /// The mock channel created for a backend, if it registered
    pub fn backend(&self, node_id: NodeId) -> Option<Arc<MockBackendControl>> {
        self.backends.lock().unwrap().get(&node_id).cloned()
    }

    /// The mock channel created for a frontend, if it registered
    pub fn frontend(&self, node_id: NodeId) -> Option<Arc<MockFrontendControl>> {
        self.frontends.lock().unwrap().get(&node_id).cloned()
    }
}

impl Default for MockControlFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlFactory for MockControlFactory {
    fn backend_control(&self, info: &BackendInfo) -> Arc<dyn BackendControl> {
        let ctrl = Arc::new(MockBackendControl::new());
        self.backends
            .lock()
            .unwrap()
            .insert(info.node_id, ctrl.clone());
        ctrl
    }

    fn frontend_control(&self, node_id: NodeId, _rpc_addr: &str) -> Arc<dyn FrontendControl> {
        let ctrl = Arc::new(MockFrontendControl::new());
        self.frontends.lock().unwrap().insert(node_id, ctrl.clone());
        ctrl
    }
}
