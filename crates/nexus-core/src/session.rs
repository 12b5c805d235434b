//! Model session schema
//!
//! A model session identifies a concrete (framework, model, version,
//! latency-SLA, input-size) request profile. Its canonical string form is
//! the routing key used across the scheduler, backends, and frontends.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A concrete model serving request profile. Routing unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSession {
    /// Framework name (e.g. "tensorflow", "caffe2", "darknet")
    pub framework: String,

    /// Model name within the framework (e.g. "resnet_50")
    pub model_name: String,

    /// Model version
    pub version: u32,

    /// Latency SLA in milliseconds
    pub latency_sla_ms: u32,

    /// Input image height, for resizable models
    pub image_height: Option<u32>,

    /// Input image width, for resizable models
    pub image_width: Option<u32>,
}

impl ModelSession {
    /// Create a new model session without explicit input dimensions
    pub fn new(
        framework: impl Into<String>,
        model_name: impl Into<String>,
        version: u32,
        latency_sla_ms: u32,
    ) -> Self {
        Self {
            framework: framework.into(),
            model_name: model_name.into(),
            version,
            latency_sla_ms,
            image_height: None,
            image_width: None,
        }
    }

    /// Set explicit input dimensions
    pub fn with_image_size(mut self, height: u32, width: u32) -> Self {
        self.image_height = Some(height);
        self.image_width = Some(width);
        self
    }

    /// Model identifier without SLA or input size: `framework:model:version`
    pub fn model_id(&self) -> String {
        format!("{}:{}:{}", self.framework, self.model_name, self.version)
    }

    /// Canonical session id: `framework:model:version[:HxW]:sla`
    pub fn session_id(&self) -> String {
        match (self.image_height, self.image_width) {
            (Some(h), Some(w)) => {
                format!("{}:{}x{}:{}", self.model_id(), h, w, self.latency_sla_ms)
            }
            _ => format!("{}:{}", self.model_id(), self.latency_sla_ms),
        }
    }

}

impl fmt::Display for ModelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.session_id())
    }
}

impl std::str::FromStr for ModelSession {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (dims, sla_idx) = match parts.len() {
            4 => (None, 3),
            5 => {
                let (h, w) = parts[3]
                    .split_once('x')
                    .ok_or_else(|| format!("Invalid image size in session id: {}", s))?;
                let h = h
                    .parse::<u32>()
                    .map_err(|e| format!("Invalid image height in {}: {}", s, e))?;
                let w = w
                    .parse::<u32>()
                    .map_err(|e| format!("Invalid image width in {}: {}", s, e))?;
                (Some((h, w)), 4)
            }
            _ => return Err(format!("Invalid model session id: {}", s)),
        };
        let version = parts[2]
            .parse::<u32>()
            .map_err(|e| format!("Invalid version in {}: {}", s, e))?;
        let latency_sla_ms = parts[sla_idx]
            .parse::<u32>()
            .map_err(|e| format!("Invalid latency SLA in {}: {}", s, e))?;
        let mut sess = ModelSession::new(parts[0], parts[1], version, latency_sla_ms);
        if let Some((h, w)) = dims {
            sess = sess.with_image_size(h, w);
        }
        Ok(sess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let sess = ModelSession::new("tensorflow", "resnet_50", 1, 100);
        assert_eq!(sess.session_id(), "tensorflow:resnet_50:1:100");
        assert_eq!(sess.model_id(), "tensorflow:resnet_50:1");

        let sized = sess.clone().with_image_size(224, 224);
        assert_eq!(sized.session_id(), "tensorflow:resnet_50:1:224x224:100");
    }

    #[test]
    fn test_session_id_round_trip() {
        let sess = ModelSession::new("caffe2", "vgg16", 2, 50).with_image_size(320, 240);
        let parsed: ModelSession = sess.session_id().parse().unwrap();
        assert_eq!(parsed, sess);

        let plain = ModelSession::new("darknet", "yolo9000", 1, 200);
        let parsed: ModelSession = plain.session_id().parse().unwrap();
        assert_eq!(parsed, plain);
    }

    #[test]
    fn test_session_id_parse_errors() {
        assert!("tensorflow:resnet_50".parse::<ModelSession>().is_err());
        assert!("tensorflow:resnet_50:x:100".parse::<ModelSession>().is_err());
        assert!("tensorflow:resnet_50:1:224:100"
            .parse::<ModelSession>()
            .is_err());
    }
}
