//! # nexus-profile
//!
//! Read-only model database for Nexus: per-model metadata, prefix-sharing
//! groups, and per-(model, GPU) latency/memory profiles measured by the
//! offline profiler.
//!
//! The database is immutable after [`ModelDatabase::init`]; the scheduler
//! consults it to solve batch/duty-cycle plans under latency SLAs.

pub mod db;
pub mod profile;

pub use db::{ModelDatabase, ModelMeta};
pub use profile::{InstancePlan, ModelProfile, ProfileEntry};

/// Result type alias for model database operations
pub type Result<T> = std::result::Result<T, ModelDbError>;

/// Errors raised by the model database
#[derive(Debug, thiserror::Error)]
pub enum ModelDbError {
    /// The database root or a profile file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The model db YAML could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A profile file is malformed
    #[error("Invalid profile {path}: {reason}")]
    InvalidProfile { path: String, reason: String },

    /// The requested model or profile does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl ModelDbError {
    pub(crate) fn invalid_profile(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProfile {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
