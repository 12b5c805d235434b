//! Control RPC service
//!
//! Thin tonic surface over the scheduler: converts wire messages to core
//! types, dispatches under the scheduler mutex, and maps outcomes back to
//! ctrl statuses. The peer IP observed on Register becomes the node's
//! advertised address.

use crate::scheduler::Scheduler;
use nexus_core::{ModelSession, NodeId, NodeType};
use nexus_proto::{
    BackendStatsProto, CtrlStatus, KeepAliveRequest, LoadModelReply, LoadModelRequest,
    RegisterReply, RegisterRequest, RpcReply, SchedulerCtrl, UnregisterRequest,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::debug;

/// Tonic service wrapping the scheduler
pub struct SchedulerService {
    scheduler: Arc<Scheduler>,
}

impl SchedulerService {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    fn peer_ip<T>(request: &Request<T>) -> String {
        request
            .remote_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }
}

#[tonic::async_trait]
impl SchedulerCtrl for SchedulerService {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> std::result::Result<Response<RegisterReply>, Status> {
        let ip = Self::peer_ip(&request);
        let req = request.into_inner();
        debug!("Register request from {}: node {}", ip, req.node_id);
        let node_type = req.node_type();
        let status = match node_type {
            nexus_proto::NodeType::BackendNode => {
                self.scheduler
                    .register_backend(
                        NodeId(req.node_id),
                        ip,
                        req.server_port,
                        req.rpc_port,
                        req.gpu_device_name,
                        req.gpu_available_memory,
                    )
                    .await
            }
            nexus_proto::NodeType::FrontendNode => {
                self.scheduler
                    .register_frontend(NodeId(req.node_id), ip, req.server_port, req.rpc_port)
                    .await
            }
            nexus_proto::NodeType::Unspecified => CtrlStatus::CtrlInvalidRequest,
        };
        self.scheduler
            .metrics()
            .observe_rpc("Register", status.as_str_name());
        Ok(Response::new(RegisterReply {
            status: status as i32,
            beacon_interval_sec: self.scheduler.config().beacon_interval_sec as u32,
        }))
    }

    async fn unregister(
        &self,
        request: Request<UnregisterRequest>,
    ) -> std::result::Result<Response<RpcReply>, Status> {
        let req = request.into_inner();
        let node_type = match req.node_type() {
            nexus_proto::NodeType::BackendNode => NodeType::Backend,
            nexus_proto::NodeType::FrontendNode => NodeType::Frontend,
            nexus_proto::NodeType::Unspecified => {
                return Ok(Response::new(RpcReply {
                    status: CtrlStatus::CtrlInvalidRequest as i32,
                }));
            }
        };
        let status = self.scheduler.unregister(node_type, NodeId(req.node_id)).await;
        self.scheduler
            .metrics()
            .observe_rpc("Unregister", status.as_str_name());
        Ok(Response::new(RpcReply {
            status: status as i32,
        }))
    }

    async fn load_model(
        &self,
        request: Request<LoadModelRequest>,
    ) -> std::result::Result<Response<LoadModelReply>, Status> {
        let req = request.into_inner();
        let sess: ModelSession = match req.model_session {
            Some(proto) => proto.into(),
            None => {
                return Ok(Response::new(LoadModelReply {
                    status: CtrlStatus::CtrlInvalidRequest as i32,
                    model_route: None,
                }));
            }
        };
        let (status, route) = self
            .scheduler
            .load_model(NodeId(req.node_id), sess, req.estimate_workload as f64)
            .await;
        self.scheduler
            .metrics()
            .observe_rpc("LoadModel", status.as_str_name());
        Ok(Response::new(LoadModelReply {
            status: status as i32,
            model_route: route.map(Into::into),
        }))
    }

    async fn update_backend_stats(
        &self,
        request: Request<BackendStatsProto>,
    ) -> std::result::Result<Response<RpcReply>, Status> {
        let req = request.into_inner();
        let stats = req
            .model_stats
            .into_iter()
            .map(|s| (s.model_session_id, s.num_requests))
            .collect();
        let status = self
            .scheduler
            .update_backend_stats(NodeId(req.node_id), stats)
            .await;
        self.scheduler
            .metrics()
            .observe_rpc("UpdateBackendStats", status.as_str_name());
        Ok(Response::new(RpcReply {
            status: status as i32,
        }))
    }

    async fn keep_alive(
        &self,
        request: Request<KeepAliveRequest>,
    ) -> std::result::Result<Response<RpcReply>, Status> {
        let req = request.into_inner();
        let status = self.scheduler.keep_alive(NodeId(req.node_id)).await;
        self.scheduler
            .metrics()
            .observe_rpc("KeepAlive", status.as_str_name());
        Ok(Response::new(RpcReply {
            status: status as i32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::push::MockControlFactory;
    use crate::testing::setup_model_db;
    use crate::workload::StaticWorkloadTable;
    use nexus_proto::ModelSessionProto;
    use tempfile::TempDir;

    fn service() -> (SchedulerService, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(setup_model_db(dir.path()));
        let scheduler = Arc::new(
            Scheduler::new(
                SchedulerConfig::default(),
                db,
                StaticWorkloadTable::default(),
                Arc::new(MockControlFactory::new()),
            )
            .unwrap(),
        );
        (SchedulerService::new(scheduler), dir)
    }

    fn register_request(node_type: nexus_proto::NodeType, node_id: u32) -> RegisterRequest {
        RegisterRequest {
            node_type: node_type as i32,
            node_id,
            server_port: "9001".to_string(),
            rpc_port: "9002".to_string(),
            gpu_device_name: "GPU_A".to_string(),
            gpu_available_memory: 8 << 30,
        }
    }

    #[tokio::test]
    async fn test_register_reply_carries_beacon_interval() {
        let (service, _dir) = service();
        let reply = service
            .register(Request::new(register_request(
                nexus_proto::NodeType::BackendNode,
                1,
            )))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status(), CtrlStatus::CtrlOk);
        assert_eq!(reply.beacon_interval_sec, 2);
    }

    #[tokio::test]
    async fn test_load_model_end_to_end() {
        let (service, _dir) = service();
        service
            .register(Request::new(register_request(
                nexus_proto::NodeType::BackendNode,
                1,
            )))
            .await
            .unwrap();
        service
            .register(Request::new(register_request(
                nexus_proto::NodeType::FrontendNode,
                10,
            )))
            .await
            .unwrap();

        let reply = service
            .load_model(Request::new(LoadModelRequest {
                node_id: 10,
                model_session: Some(ModelSessionProto {
                    framework: "tensorflow".to_string(),
                    model_name: "resnet_50".to_string(),
                    version: 1,
                    latency_sla_ms: 100,
                    image_height: 0,
                    image_width: 0,
                }),
                estimate_workload: 80.0,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status(), CtrlStatus::CtrlOk);
        let route = reply.model_route.unwrap();
        assert_eq!(route.model_session_id, "tensorflow:resnet_50:1:100");
        assert_eq!(route.backend_rate.len(), 1);
    }

    #[tokio::test]
    async fn test_load_model_without_session_is_invalid() {
        let (service, _dir) = service();
        let reply = service
            .load_model(Request::new(LoadModelRequest {
                node_id: 10,
                model_session: None,
                estimate_workload: 0.0,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status(), CtrlStatus::CtrlInvalidRequest);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_ok() {
        let (service, _dir) = service();
        let reply = service
            .unregister(Request::new(UnregisterRequest {
                node_type: nexus_proto::NodeType::BackendNode as i32,
                node_id: 42,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status(), CtrlStatus::CtrlOk);
    }
}
