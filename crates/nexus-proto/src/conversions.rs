//! Conversions between nexus-core types and protobuf types
//!
//! This module provides bidirectional conversions between the rich types
//! defined in nexus-core and the protobuf message types used for network
//! communication.

use crate::ctrl::v1 as proto;
use nexus_core::{
    BackendInfo, BackendRate, ModelInstanceConfig, ModelRoute, ModelSession, ModelTableUpdate,
    NodeId,
};

// Conversions for ModelSession
impl From<ModelSession> for proto::ModelSessionProto {
    fn from(sess: ModelSession) -> Self {
        Self {
            framework: sess.framework,
            model_name: sess.model_name,
            version: sess.version,
            latency_sla_ms: sess.latency_sla_ms,
            image_height: sess.image_height.unwrap_or(0),
            image_width: sess.image_width.unwrap_or(0),
        }
    }
}

impl From<proto::ModelSessionProto> for ModelSession {
    fn from(proto: proto::ModelSessionProto) -> Self {
        Self {
            framework: proto.framework,
            model_name: proto.model_name,
            version: proto.version,
            latency_sla_ms: proto.latency_sla_ms,
            image_height: (proto.image_height > 0).then_some(proto.image_height),
            image_width: (proto.image_width > 0).then_some(proto.image_width),
        }
    }
}

// Conversions for BackendInfo
impl From<BackendInfo> for proto::BackendInfoProto {
    fn from(info: BackendInfo) -> Self {
        Self {
            node_id: info.node_id.as_u32(),
            ip: info.ip,
            server_port: info.server_port,
            rpc_port: info.rpc_port,
        }
    }
}

impl From<proto::BackendInfoProto> for BackendInfo {
    fn from(proto: proto::BackendInfoProto) -> Self {
        Self {
            node_id: NodeId(proto.node_id),
            ip: proto.ip,
            server_port: proto.server_port,
            rpc_port: proto.rpc_port,
        }
    }
}

// Conversions for ModelRoute
impl From<ModelRoute> for proto::ModelRouteProto {
    fn from(route: ModelRoute) -> Self {
        Self {
            model_session_id: route.model_session_id,
            backend_rate: route
                .backend_rate
                .into_iter()
                .map(|rate| proto::BackendRateProto {
                    info: Some(rate.info.into()),
                    throughput: rate.throughput as f32,
                })
                .collect(),
        }
    }
}

impl From<proto::ModelRouteProto> for ModelRoute {
    fn from(proto: proto::ModelRouteProto) -> Self {
        Self {
            model_session_id: proto.model_session_id,
            backend_rate: proto
                .backend_rate
                .into_iter()
                .map(|rate| BackendRate {
                    info: rate.info.unwrap_or_default().into(),
                    throughput: rate.throughput as f64,
                })
                .collect(),
        }
    }
}

// Conversions for model-table updates
impl From<ModelInstanceConfig> for proto::ModelInstanceConfigProto {
    fn from(config: ModelInstanceConfig) -> Self {
        Self {
            model_sessions: config.model_sessions.into_iter().map(Into::into).collect(),
            batch: config.batch,
            max_batch: config.max_batch,
            duty_cycle_us: config.duty_cycle_us,
            memory_usage: config.memory_usage,
            backup_backends: config.backup_backends.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<proto::ModelInstanceConfigProto> for ModelInstanceConfig {
    fn from(proto: proto::ModelInstanceConfigProto) -> Self {
        Self {
            model_sessions: proto.model_sessions.into_iter().map(Into::into).collect(),
            batch: proto.batch,
            max_batch: proto.max_batch,
            duty_cycle_us: proto.duty_cycle_us,
            memory_usage: proto.memory_usage,
            backup_backends: proto.backup_backends.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<ModelTableUpdate> for proto::ModelTableUpdateRequest {
    fn from(update: ModelTableUpdate) -> Self {
        Self {
            model_instances: update.model_instances.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<proto::ModelTableUpdateRequest> for ModelTableUpdate {
    fn from(proto: proto::ModelTableUpdateRequest) -> Self {
        Self {
            model_instances: proto.model_instances.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_session_round_trip() {
        let sess = ModelSession::new("tensorflow", "resnet_50", 1, 100).with_image_size(224, 224);
        let proto: proto::ModelSessionProto = sess.clone().into();
        let back: ModelSession = proto.into();
        assert_eq!(back, sess);
    }

    #[test]
    fn test_model_session_zero_dims_are_none() {
        let proto = proto::ModelSessionProto {
            framework: "caffe2".to_string(),
            model_name: "vgg16".to_string(),
            version: 1,
            latency_sla_ms: 50,
            image_height: 0,
            image_width: 0,
        };
        let sess: ModelSession = proto.into();
        assert_eq!(sess.image_height, None);
        assert_eq!(sess.image_width, None);
    }

    #[test]
    fn test_route_round_trip() {
        let route = ModelRoute {
            model_session_id: "tensorflow:resnet_50:1:100".to_string(),
            backend_rate: vec![BackendRate {
                info: BackendInfo {
                    node_id: NodeId(4),
                    ip: "10.0.0.4".to_string(),
                    server_port: "9001".to_string(),
                    rpc_port: "9002".to_string(),
                },
                throughput: 120.0,
            }],
        };
        let proto: proto::ModelRouteProto = route.clone().into();
        let back: ModelRoute = proto.into();
        assert_eq!(back.model_session_id, route.model_session_id);
        assert_eq!(back.backend_rate[0].info, route.backend_rate[0].info);
        assert!((back.backend_rate[0].throughput - 120.0).abs() < 1e-6);
    }
}
