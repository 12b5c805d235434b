//! # nexus-proto
//!
//! Protocol buffer definitions and generated gRPC bindings for Nexus.
//!
//! This crate provides the control-plane API definitions the scheduler
//! participates in:
//! - `SchedulerCtrl`: register/unregister, load-model, stats, keep-alive
//! - `BackendCtrl`: model-table pushes from the scheduler to backends
//! - `FrontendCtrl`: route pushes from the scheduler to frontends

pub mod conversions;

// Generated protobuf code
pub mod ctrl {
    pub mod v1 {
        tonic::include_proto!("nexus.ctrl.v1");
    }
}

// Re-export commonly used types for convenience (both server and client)
pub use ctrl::v1::{
    backend_ctrl_client::BackendCtrlClient,
    backend_ctrl_server::{BackendCtrl, BackendCtrlServer},
    frontend_ctrl_client::FrontendCtrlClient,
    frontend_ctrl_server::{FrontendCtrl, FrontendCtrlServer},
    scheduler_ctrl_client::SchedulerCtrlClient,
    scheduler_ctrl_server::{SchedulerCtrl, SchedulerCtrlServer},
    BackendInfoProto, BackendRateProto, BackendStatsProto, CtrlStatus, KeepAliveRequest,
    LoadModelReply, LoadModelRequest, ModelInstanceConfigProto, ModelRouteProto,
    ModelRouteUpdatesRequest, ModelSessionProto, ModelStatsProto, ModelTableUpdateRequest,
    NodeType, RegisterReply, RegisterRequest, RpcReply, UnregisterRequest,
};

/// Common error type for proto operations
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
