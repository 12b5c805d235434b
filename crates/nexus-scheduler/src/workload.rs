//! Static workload table
//!
//! Operators may pin pre-planned model blocks to backends: the workload
//! file is a YAML sequence of slots, and each newly registered backend
//! fills the first unassigned slot. Static instances are fixed: the epoch
//! loop never rescales or reallocates them. An entry flagged `backup` is
//! loaded in standby for failover instead of serving traffic.

use nexus_core::{Error, ModelSession, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// One statically configured model instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticModelSpec {
    pub framework: String,
    pub model_name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub latency_sla_ms: u32,
    #[serde(default)]
    pub image_height: Option<u32>,
    #[serde(default)]
    pub image_width: Option<u32>,
    /// Fixed batch size for the instance
    pub batch: u32,
    /// Load in standby as a failover backup
    #[serde(default)]
    pub backup: bool,
}

fn default_version() -> u32 {
    1
}

impl StaticModelSpec {
    /// The model session this spec pins
    pub fn model_session(&self) -> ModelSession {
        let mut sess = ModelSession::new(
            self.framework.clone(),
            self.model_name.clone(),
            self.version,
            self.latency_sla_ms,
        );
        if let (Some(h), Some(w)) = (self.image_height, self.image_width) {
            sess = sess.with_image_size(h, w);
        }
        sess
    }
}

/// Immutable slot table plus the slot-to-backend assignment
#[derive(Debug, Default)]
pub struct StaticWorkloadTable {
    slots: Vec<Vec<StaticModelSpec>>,
    assigned: BTreeMap<usize, NodeId>,
}

impl StaticWorkloadTable {
    /// Parse the workload file. Invalid YAML is fatal: the scheduler
    /// refuses to start.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let slots: Vec<Vec<StaticModelSpec>> = serde_yaml::from_str(&text)?;
        for (i, slot) in slots.iter().enumerate() {
            if slot.is_empty() {
                return Err(Error::config(format!("workload slot {} is empty", i)));
            }
            if slot.iter().all(|spec| spec.backup) {
                return Err(Error::config(format!(
                    "workload slot {} holds only backup entries",
                    i
                )));
            }
        }
        info!("Loaded static workload file with {} slots", slots.len());
        Ok(Self {
            slots,
            assigned: BTreeMap::new(),
        })
    }

    /// Build a table from in-memory slots (test and tooling use)
    pub fn from_slots(slots: Vec<Vec<StaticModelSpec>>) -> Self {
        Self {
            slots,
            assigned: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Specs of one slot
    pub fn slot(&self, id: usize) -> &[StaticModelSpec] {
        &self.slots[id]
    }

    /// First slot without a running backend
    pub fn next_unassigned(&self) -> Option<usize> {
        (0..self.slots.len()).find(|id| !self.assigned.contains_key(id))
    }

    /// Record that a backend fills a slot
    pub fn assign(&mut self, slot: usize, node_id: NodeId) {
        self.assigned.insert(slot, node_id);
    }

    /// Return a slot to the unassigned pool
    pub fn release(&mut self, slot: usize) {
        self.assigned.remove(&slot);
    }

    /// Backend currently filling a slot
    pub fn assigned_node(&self, slot: usize) -> Option<NodeId> {
        self.assigned.get(&slot).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKLOAD: &str = "\
- - framework: tensorflow
    model_name: resnet_50
    version: 1
    latency_sla_ms: 100
    batch: 4
  - framework: darknet
    model_name: yolo9000
    latency_sla_ms: 200
    batch: 2
    backup: true
- - framework: caffe2
    model_name: vgg16
    latency_sla_ms: 50
    image_height: 320
    image_width: 240
    batch: 1
";

    #[test]
    fn test_parse_workload() {
        let slots: Vec<Vec<StaticModelSpec>> = serde_yaml::from_str(WORKLOAD).unwrap();
        let table = StaticWorkloadTable::from_slots(slots);
        assert_eq!(table.len(), 2);
        assert_eq!(table.slot(0).len(), 2);
        assert!(table.slot(0)[1].backup);
        assert_eq!(table.slot(0)[1].version, 1);

        let sess = table.slot(1)[0].model_session();
        assert_eq!(sess.session_id(), "caffe2:vgg16:1:320x240:50");
    }

    #[test]
    fn test_slot_assignment() {
        let slots: Vec<Vec<StaticModelSpec>> = serde_yaml::from_str(WORKLOAD).unwrap();
        let mut table = StaticWorkloadTable::from_slots(slots);

        assert_eq!(table.next_unassigned(), Some(0));
        table.assign(0, NodeId(1));
        assert_eq!(table.next_unassigned(), Some(1));
        table.assign(1, NodeId(2));
        assert_eq!(table.next_unassigned(), None);

        table.release(0);
        assert_eq!(table.next_unassigned(), Some(0));
        assert_eq!(table.assigned_node(1), Some(NodeId(2)));
    }

    #[test]
    fn test_load_rejects_backup_only_slot() {
        let yaml = "\
- - framework: tensorflow
    model_name: resnet_50
    latency_sla_ms: 100
    batch: 4
    backup: true
";
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("workload.yml");
        std::fs::write(&path, yaml).unwrap();
        assert!(StaticWorkloadTable::load(&path).is_err());
    }
}
