//! Model database: metadata, prefix-share groups, and profile lookup
//!
//! Layout of the database root:
//! - `<root>/db/model_db.yml`: model metadata and prefix-share groups
//! - `<root>/profile/<gpu device name>/<profile id>.txt`: measured
//!   profiles, one file per (model, input size, GPU)

use crate::{ModelDbError, ModelProfile, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Metadata for one model in the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMeta {
    /// Framework name (e.g. "tensorflow")
    pub framework: String,

    /// Model name within the framework
    pub model_name: String,

    /// Model version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Model type tag (e.g. "classification", "detection")
    #[serde(default)]
    pub r#type: String,

    /// Whether the model accepts resized input
    #[serde(default)]
    pub resizable: bool,

    /// Default input height for resizable models
    #[serde(default)]
    pub image_height: u32,

    /// Default input width for resizable models
    #[serde(default)]
    pub image_width: u32,
}

fn default_version() -> u32 {
    1
}

impl ModelMeta {
    /// Model identifier: `framework:model:version`
    pub fn model_id(&self) -> String {
        format!("{}:{}:{}", self.framework, self.model_name, self.version)
    }
}

#[derive(Debug, Deserialize)]
struct ModelDbFile {
    models: Vec<ModelMeta>,
    #[serde(default)]
    prefix_share: Vec<Vec<String>>,
}

/// Read-only database of model metadata and GPU profiles.
///
/// Immutable after [`ModelDatabase::init`].
#[derive(Debug)]
pub struct ModelDatabase {
    root: PathBuf,

    /// Metadata keyed by model id
    metas: HashMap<String, ModelMeta>,

    /// Prefix-share group per model id
    prefix_groups: HashMap<String, Vec<String>>,

    /// Profiles keyed by (gpu device name, profile id)
    profiles: HashMap<(String, String), ModelProfile>,
}

impl ModelDatabase {
    /// Load the database from its root directory. Fails when the root or
    /// the model db file is unreadable; the scheduler refuses to start in
    /// that case.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let db_path = root.join("db").join("model_db.yml");
        let text = std::fs::read_to_string(&db_path)?;
        let file: ModelDbFile = serde_yaml::from_str(&text)?;

        let mut metas = HashMap::new();
        for meta in file.models {
            let model_id = meta.model_id();
            if metas.insert(model_id.clone(), meta).is_some() {
                warn!("Duplicate model db entry: {}", model_id);
            }
        }

        let mut prefix_groups = HashMap::new();
        for group in file.prefix_share {
            for model_id in &group {
                if !metas.contains_key(model_id) {
                    warn!("Prefix-share group names unknown model: {}", model_id);
                }
                prefix_groups.insert(model_id.clone(), group.clone());
            }
        }

        let mut db = Self {
            root,
            metas,
            prefix_groups,
            profiles: HashMap::new(),
        };
        db.load_profiles()?;
        info!(
            "Model database initialized: {} models, {} profiles",
            db.metas.len(),
            db.profiles.len()
        );
        Ok(db)
    }

    fn load_profiles(&mut self) -> Result<()> {
        let profile_root = self.root.join("profile");
        if !profile_root.is_dir() {
            // Profiles are optional at init; lookups will report NotFound.
            warn!("No profile directory at {}", profile_root.display());
            return Ok(());
        }
        for gpu_entry in std::fs::read_dir(&profile_root)? {
            let gpu_dir = gpu_entry?.path();
            if !gpu_dir.is_dir() {
                continue;
            }
            let gpu_name = gpu_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            for file_entry in std::fs::read_dir(&gpu_dir)? {
                let path = file_entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                    continue;
                }
                let profile = ModelProfile::load(&path)?;
                debug!(
                    "Loaded profile {} on {}",
                    profile.profile_id, gpu_name
                );
                self.profiles
                    .insert((gpu_name.clone(), profile.profile_id.clone()), profile);
            }
        }
        Ok(())
    }

    /// Database root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Metadata for a model id, if present
    pub fn get_model_info(&self, model_id: &str) -> Option<&ModelMeta> {
        self.metas.get(model_id)
    }

    /// Profile for a (model session, GPU device) pair
    pub fn get_profile(
        &self,
        framework: &str,
        model_name: &str,
        version: u32,
        gpu_device: &str,
        image_height: Option<u32>,
        image_width: Option<u32>,
    ) -> Result<&ModelProfile> {
        let mut profile_id = format!("{}:{}:{}", framework, model_name, version);
        if let (Some(h), Some(w)) = (image_height, image_width) {
            profile_id.push_str(&format!(":{}x{}", h, w));
        }
        self.profiles
            .get(&(gpu_device.to_string(), profile_id.clone()))
            .ok_or_else(|| {
                ModelDbError::NotFound(format!("profile {} on {}", profile_id, gpu_device))
            })
    }

    /// Models whose backbone prefix is identical to the given model's,
    /// excluding the model itself. Empty when the model is in no group.
    pub fn get_prefix_share_models(&self, model_id: &str) -> Vec<String> {
        self.prefix_groups
            .get(model_id)
            .map(|group| {
                group
                    .iter()
                    .filter(|id| id.as_str() != model_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MODEL_DB: &str = "\
models:
  - framework: tensorflow
    model_name: resnet_50
    version: 1
    type: classification
    resizable: true
    image_height: 224
    image_width: 224
  - framework: tensorflow
    model_name: resnet_101
    version: 1
    type: classification
  - framework: darknet
    model_name: yolo9000
    version: 1
    type: detection
prefix_share:
  - [\"tensorflow:resnet_50:1\", \"tensorflow:resnet_101:1\"]
";

    const PROFILE: &str = "\
tensorflow:resnet_50:1
TITAN_X_PASCAL
Forward latency
batch,latency(us),std(us),memory(B)
1,10000,500,1073741824
2,16000,500,1342177280
Preprocess latency(us): 1500,100
Postprocess latency(us): 500,50
";

    fn setup_db(root: &Path) {
        std::fs::create_dir_all(root.join("db")).unwrap();
        std::fs::write(root.join("db").join("model_db.yml"), MODEL_DB).unwrap();
        let gpu_dir = root.join("profile").join("TITAN_X_PASCAL");
        std::fs::create_dir_all(&gpu_dir).unwrap();
        std::fs::write(gpu_dir.join("tensorflow:resnet_50:1.txt"), PROFILE).unwrap();
    }

    #[test]
    fn test_init_and_metadata() {
        let dir = TempDir::new().unwrap();
        setup_db(dir.path());
        let db = ModelDatabase::init(dir.path()).unwrap();

        let meta = db.get_model_info("tensorflow:resnet_50:1").unwrap();
        assert!(meta.resizable);
        assert_eq!(meta.image_height, 224);
        assert!(db.get_model_info("tensorflow:inception:1").is_none());
    }

    #[test]
    fn test_init_fails_without_db_file() {
        let dir = TempDir::new().unwrap();
        assert!(ModelDatabase::init(dir.path()).is_err());
    }

    #[test]
    fn test_profile_lookup() {
        let dir = TempDir::new().unwrap();
        setup_db(dir.path());
        let db = ModelDatabase::init(dir.path()).unwrap();

        let profile = db
            .get_profile("tensorflow", "resnet_50", 1, "TITAN_X_PASCAL", None, None)
            .unwrap();
        assert_eq!(profile.profiled_max_batch(), 2);

        let missing = db.get_profile("tensorflow", "resnet_50", 1, "GTX_1080", None, None);
        assert!(matches!(missing, Err(ModelDbError::NotFound(_))));
    }

    #[test]
    fn test_prefix_share_models() {
        let dir = TempDir::new().unwrap();
        setup_db(dir.path());
        let db = ModelDatabase::init(dir.path()).unwrap();

        let shared = db.get_prefix_share_models("tensorflow:resnet_50:1");
        assert_eq!(shared, vec!["tensorflow:resnet_101:1".to_string()]);
        assert!(db.get_prefix_share_models("darknet:yolo9000:1").is_empty());
    }
}
