//! Control-push traits for Nexus delegates
//!
//! The scheduler mirrors each backend and frontend with a delegate that
//! pushes state updates over RPC. These traits are the seam between the
//! scheduling logic and the transport, so the core can be exercised in
//! tests without a network.

use crate::types::{ModelRoute, ModelTableUpdate};
use crate::Result;
use async_trait::async_trait;

/// Push channel to one backend process
#[async_trait]
pub trait BackendControl: Send + Sync {
    /// Replace the backend's model table with the given update
    async fn update_model_table(&self, update: ModelTableUpdate) -> Result<()>;
}

/// Push channel to one frontend process
#[async_trait]
pub trait FrontendControl: Send + Sync {
    /// Deliver new routes for the frontend's subscribed model sessions
    async fn update_model_routes(&self, routes: Vec<ModelRoute>) -> Result<()>;
}

/// Mock implementations for testing

/// Recording mock for backend table pushes. Optionally fails every push to
/// exercise the retry/eviction path.
pub struct MockBackendControl {
    updates: std::sync::Mutex<Vec<ModelTableUpdate>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MockBackendControl {
    pub fn new() -> Self {
        Self {
            updates: std::sync::Mutex::new(Vec::new()),
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make subsequent pushes fail with a transport error
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// All updates received so far, in push order
    pub fn updates(&self) -> Vec<ModelTableUpdate> {
        self.updates.lock().unwrap().clone()
    }

    /// The most recent update, if any
    pub fn last_update(&self) -> Option<ModelTableUpdate> {
        self.updates.lock().unwrap().last().cloned()
    }
}

impl Default for MockBackendControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendControl for MockBackendControl {
    async fn update_model_table(&self, update: ModelTableUpdate) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::Error::transport("mock backend push failure"));
        }
        self.updates.lock().unwrap().push(update);
        Ok(())
    }
}

/// Recording mock for frontend route pushes
pub struct MockFrontendControl {
    routes: std::sync::Mutex<Vec<Vec<ModelRoute>>>,
}

impl MockFrontendControl {
    pub fn new() -> Self {
        Self {
            routes: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// All route batches received so far, in push order
    pub fn pushes(&self) -> Vec<Vec<ModelRoute>> {
        self.routes.lock().unwrap().clone()
    }

    /// The most recent route pushed for the given session id, if any
    pub fn last_route_for(&self, session_id: &str) -> Option<ModelRoute> {
        self.routes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .flat_map(|batch| batch.iter())
            .find(|route| route.model_session_id == session_id)
            .cloned()
    }
}

impl Default for MockFrontendControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrontendControl for MockFrontendControl {
    async fn update_model_routes(&self, routes: Vec<ModelRoute>) -> Result<()> {
        self.routes.lock().unwrap().push(routes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendInfo, BackendRate};

    #[tokio::test]
    async fn test_mock_backend_control_records() {
        let control = MockBackendControl::new();
        control
            .update_model_table(ModelTableUpdate::default())
            .await
            .unwrap();
        assert_eq!(control.updates().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_backend_control_failure() {
        let control = MockBackendControl::new();
        control.set_fail(true);
        let err = control
            .update_model_table(ModelTableUpdate::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(control.updates().is_empty());
    }

    #[tokio::test]
    async fn test_mock_frontend_control_last_route() {
        let control = MockFrontendControl::new();
        let route = ModelRoute {
            model_session_id: "tensorflow:resnet_50:1:100".to_string(),
            backend_rate: vec![BackendRate {
                info: BackendInfo::default(),
                throughput: 42.0,
            }],
        };
        control.update_model_routes(vec![route]).await.unwrap();

        let found = control
            .last_route_for("tensorflow:resnet_50:1:100")
            .unwrap();
        assert_eq!(found.backend_rate[0].throughput, 42.0);
        assert!(control.last_route_for("missing").is_none());
    }
}
