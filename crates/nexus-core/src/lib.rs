//! # nexus-core
//!
//! Core types, traits, and errors for Nexus - a GPU cluster inference
//! serving system.
//!
//! This crate provides the foundational data structures shared across the
//! scheduler and its collaborators:
//!
//! - Node and session identity types used as routing keys
//! - The model-session schema and its canonical string form
//! - Control-push traits for the outbound backend/frontend RPCs
//! - Error handling types and utilities

pub mod error;
pub mod session;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use error::{Error, Result};
pub use session::ModelSession;
pub use traits::{BackendControl, FrontendControl, MockBackendControl, MockFrontendControl};
pub use types::{
    BackendInfo, BackendRate, ModelInstanceConfig, ModelRoute, ModelTableUpdate, NodeId, NodeType,
};
