//! Per-backend delegate: the scheduler's authoritative mirror of one GPU
//! backend
//!
//! The delegate owns the backend's model table (batch/duty-cycle plans),
//! GPU memory accounting, per-session request-rate estimates, liveness, and
//! the push channel for model-table updates.

use crate::config::MAX_PUSH_FAILURES;
use chrono::{DateTime, Utc};
use nexus_core::{
    BackendControl, BackendInfo, Error, ModelInstanceConfig, ModelSession, ModelTableUpdate,
    NodeId, Result,
};
use nexus_profile::{InstancePlan, ModelProfile};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Exponentially weighted moving average over request-rate reports
#[derive(Debug, Clone, Copy, Default)]
pub struct Ewma {
    avg: f64,
    initialized: bool,
}

/// Smoothing factor applied to each stats report
const EWMA_ALPHA: f64 = 0.25;

impl Ewma {
    /// Fold one sample into the average
    pub fn observe(&mut self, sample: f64) {
        if self.initialized {
            self.avg = EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * self.avg;
        } else {
            self.avg = sample;
            self.initialized = true;
        }
    }

    /// Current estimate
    pub fn get(&self) -> f64 {
        self.avg
    }
}

/// Concrete plan for one model instance on one backend.
///
/// `sessions` lists the prefix-sharing group served by the instance, head
/// first; the plan (batch, duty cycle, throughput) is solved for the head.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    /// Sessions served by this instance, head first
    pub sessions: Vec<ModelSession>,

    /// Target batch size
    pub batch: u32,

    /// Largest batch feasible under the SLA
    pub max_batch: u32,

    /// Forward latency at the target batch, microseconds
    pub forward_latency_us: f64,

    /// Batch accumulation window, microseconds
    pub duty_cycle_us: f64,

    /// Sustained throughput in requests per second
    pub throughput: f64,

    /// GPU memory reserved for the instance, bytes
    pub memory_bytes: u64,

    /// Statically configured instances are never rescaled or spilled
    pub fixed: bool,

    /// Backup backends prepared for failover
    pub backups: BTreeMap<NodeId, BackendInfo>,
}

impl InstanceInfo {
    /// Build an instance from a solved plan
    pub fn from_plan(sess: ModelSession, plan: InstancePlan, fixed: bool) -> Self {
        Self {
            sessions: vec![sess],
            batch: plan.batch,
            max_batch: plan.max_batch,
            forward_latency_us: plan.forward_latency_us,
            duty_cycle_us: plan.duty_cycle_us,
            throughput: plan.throughput,
            memory_bytes: plan.memory_bytes,
            fixed,
            backups: BTreeMap::new(),
        }
    }

    /// Session id of the group head
    pub fn head_id(&self) -> String {
        self.sessions[0].session_id()
    }

    /// Whether this instance serves the given session id
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.iter().any(|s| s.session_id() == session_id)
    }

    /// Fraction of GPU time this instance consumes
    pub fn gpu_share(&self) -> f64 {
        if self.duty_cycle_us > 0.0 {
            self.forward_latency_us / self.duty_cycle_us
        } else {
            f64::INFINITY
        }
    }

    fn to_config(&self) -> ModelInstanceConfig {
        ModelInstanceConfig {
            model_sessions: self.sessions.clone(),
            batch: self.batch,
            max_batch: self.max_batch,
            duty_cycle_us: self.duty_cycle_us,
            memory_usage: self.memory_bytes,
            backup_backends: self.backups.values().cloned().collect(),
        }
    }
}

/// The scheduler-side mirror of one GPU backend
pub struct BackendDelegate {
    info: BackendInfo,
    gpu_device: String,
    gpu_total_memory: u64,
    gpu_used_memory: u64,

    /// Static workload slot, -1 when the backend is dynamically scheduled
    workload_id: i32,

    /// Serving instances keyed by the group head session id
    model_table: BTreeMap<String, InstanceInfo>,

    /// Standby instances loaded for failover, keyed by session id
    standby_table: BTreeMap<String, InstanceInfo>,

    /// Request-rate estimates per member session id
    rps: BTreeMap<String, Ewma>,

    beacon_interval: Duration,
    last_beacon: Instant,
    last_alive: DateTime<Utc>,
    alive: bool,
    push_failures: u32,

    ctrl: Arc<dyn BackendControl>,
}

impl BackendDelegate {
    pub fn new(
        info: BackendInfo,
        gpu_device: impl Into<String>,
        gpu_total_memory: u64,
        beacon_interval: Duration,
        ctrl: Arc<dyn BackendControl>,
    ) -> Self {
        Self {
            info,
            gpu_device: gpu_device.into(),
            gpu_total_memory,
            gpu_used_memory: 0,
            workload_id: -1,
            model_table: BTreeMap::new(),
            standby_table: BTreeMap::new(),
            rps: BTreeMap::new(),
            beacon_interval,
            last_beacon: Instant::now(),
            last_alive: Utc::now(),
            alive: true,
            push_failures: 0,
            ctrl,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.info.node_id
    }

    pub fn info(&self) -> &BackendInfo {
        &self.info
    }

    pub fn gpu_device(&self) -> &str {
        &self.gpu_device
    }

    pub fn gpu_total_memory(&self) -> u64 {
        self.gpu_total_memory
    }

    pub fn gpu_free_memory(&self) -> u64 {
        self.gpu_total_memory.saturating_sub(self.gpu_used_memory)
    }

    pub fn workload_id(&self) -> i32 {
        self.workload_id
    }

    pub fn set_workload_id(&mut self, workload_id: i32) {
        self.workload_id = workload_id;
    }

    /// A backend is idle when it serves nothing and fills no static slot
    pub fn is_idle(&self) -> bool {
        self.model_table.is_empty() && self.workload_id < 0
    }

    /// Bump liveness on any RPC arrival from the backend
    pub fn tick(&mut self) {
        self.last_beacon = Instant::now();
        self.last_alive = Utc::now();
    }

    /// Alive while the last beacon is within twice the beacon interval and
    /// the push channel has not been declared dead.
    pub fn is_alive(&self) -> bool {
        self.alive && self.last_beacon.elapsed() <= self.beacon_interval * 2
    }

    /// Wall-clock time of the last sign of life, for eviction logs
    pub fn last_alive_time(&self) -> DateTime<Utc> {
        self.last_alive
    }

    // --- Plan solving ---

    /// Solve for the smallest plan on this GPU that sustains `request_rate`
    /// within the session's latency SLA. Returns the instance and its
    /// occupancy (memory share of the GPU, the packing score), or `None`
    /// when no feasible plan fits the remaining memory.
    pub fn prepare_load_model(
        &self,
        profile: &ModelProfile,
        sess: &ModelSession,
        request_rate: f64,
    ) -> Option<(InstanceInfo, f64)> {
        let plan = profile.plan_for_rate(sess.latency_sla_ms, request_rate)?;
        if plan.memory_bytes > self.gpu_free_memory() {
            return None;
        }
        let occupancy = plan.memory_bytes as f64 / self.gpu_total_memory as f64;
        Some((InstanceInfo::from_plan(sess.clone(), plan, false), occupancy))
    }

    // --- Model table mutation ---

    /// Install a prepared instance
    pub fn load_model(&mut self, inst: InstanceInfo) {
        self.gpu_used_memory += inst.memory_bytes;
        debug!(
            "Backend {} loads {} (batch {}, {:.1} req/s)",
            self.info.node_id,
            inst.head_id(),
            inst.batch,
            inst.throughput
        );
        self.model_table.insert(inst.head_id(), inst);
    }

    /// Install a fixed instance from a static workload spec
    pub fn load_fixed_model(
        &mut self,
        profile: &ModelProfile,
        sess: ModelSession,
        batch: u32,
        standby: bool,
    ) -> Result<f64> {
        let plan = profile
            .plan_for_batch(sess.latency_sla_ms, batch)
            .ok_or_else(|| {
                Error::invalid_request(format!(
                    "batch {} infeasible for {} within {} ms",
                    batch,
                    sess.session_id(),
                    sess.latency_sla_ms
                ))
            })?;
        if plan.memory_bytes > self.gpu_free_memory() {
            return Err(Error::state(format!(
                "backend {} lacks memory for {}",
                self.info.node_id,
                sess.session_id()
            )));
        }
        let session_id = sess.session_id();
        let inst = InstanceInfo::from_plan(sess, plan, true);
        let throughput = inst.throughput;
        self.gpu_used_memory += inst.memory_bytes;
        if standby {
            self.standby_table.insert(session_id, inst);
        } else {
            self.model_table.insert(session_id, inst);
        }
        Ok(throughput)
    }

    /// Attach a prefix-sharing session to the instance already serving
    /// `member_id`. The shared forward pass carries the tail at no extra
    /// plan cost; the member must be loaded.
    pub fn load_prefix_model(&mut self, tail: ModelSession, member_id: &str) -> Result<()> {
        let head_id = self
            .model_table
            .values()
            .find(|inst| inst.contains(member_id))
            .map(InstanceInfo::head_id)
            .ok_or_else(|| {
                Error::state(format!(
                    "backend {} has no instance serving {}",
                    self.info.node_id, member_id
                ))
            })?;
        let inst = self.model_table.get_mut(&head_id).expect("instance exists");
        if !inst.contains(&tail.session_id()) {
            inst.sessions.push(tail);
        }
        Ok(())
    }

    /// Drop one member session. When the last member of an instance goes,
    /// the instance is removed and its memory freed. Returns whether the
    /// session was found.
    pub fn unload_model(&mut self, session_id: &str) -> bool {
        let key = match self
            .model_table
            .iter()
            .find(|(_, inst)| inst.contains(session_id))
        {
            Some((key, _)) => key.clone(),
            None => return false,
        };
        let mut inst = self.model_table.remove(&key).expect("instance exists");
        inst.sessions.retain(|s| s.session_id() != session_id);
        self.rps.remove(session_id);
        if inst.sessions.is_empty() {
            self.gpu_used_memory = self.gpu_used_memory.saturating_sub(inst.memory_bytes);
            debug!("Backend {} unloads {}", self.info.node_id, session_id);
        } else {
            // Remaining members keep the instance under its new head.
            self.model_table.insert(inst.head_id(), inst);
        }
        true
    }

    /// Rescale an instance toward `request_rate`; returns the throughput
    /// actually achieved.
    pub fn update_model_throughput(
        &mut self,
        profile: &ModelProfile,
        session_id: &str,
        request_rate: f64,
    ) -> Result<f64> {
        let key = self
            .model_table
            .iter()
            .find(|(_, inst)| inst.contains(session_id) && !inst.fixed)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| {
                Error::state(format!(
                    "backend {} has no adjustable instance for {}",
                    self.info.node_id, session_id
                ))
            })?;
        let inst = self.model_table.get_mut(&key).expect("instance exists");
        let sla = inst.sessions[0].latency_sla_ms;
        let plan = profile.plan_for_rate(sla, request_rate).ok_or_else(|| {
            Error::state(format!("no feasible plan for {} on {}", key, self.gpu_device))
        })?;
        inst.batch = plan.batch;
        inst.forward_latency_us = plan.forward_latency_us;
        inst.duty_cycle_us = plan.duty_cycle_us;
        inst.throughput = plan.throughput;
        Ok(plan.throughput)
    }

    // --- Overload handling ---

    /// The backend is overloaded when its instances together demand more
    /// than the whole GPU: sum of forward-latency/duty-cycle shares > 1.
    pub fn overload(&self) -> bool {
        let share: f64 = self.model_table.values().map(InstanceInfo::gpu_share).sum();
        share > 1.0 + 1e-6
    }

    /// While overloaded, pop the instance with the smallest marginal
    /// throughput and hand its workload back to the scheduler.
    pub fn spill_out_workload(&mut self) -> Vec<(Vec<ModelSession>, f64)> {
        let mut spilled = Vec::new();
        while self.overload() {
            let victim = self
                .model_table
                .iter()
                .filter(|(_, inst)| !inst.fixed)
                .min_by(|a, b| a.1.throughput.total_cmp(&b.1.throughput))
                .map(|(key, _)| key.clone());
            let key = match victim {
                Some(key) => key,
                None => break,
            };
            let inst = self.model_table.remove(&key).expect("instance exists");
            self.gpu_used_memory = self.gpu_used_memory.saturating_sub(inst.memory_bytes);
            for sess in &inst.sessions {
                self.rps.remove(&sess.session_id());
            }
            info!(
                "Backend {} spills out {} ({:.1} req/s)",
                self.info.node_id, key, inst.throughput
            );
            spilled.push((inst.sessions, inst.throughput));
        }
        spilled
    }

    // --- Lookups ---

    /// Serving instances, in head-id order
    pub fn instances(&self) -> impl Iterator<Item = &InstanceInfo> {
        self.model_table.values()
    }

    /// Session ids this backend stands by for
    pub fn standby_sessions(&self) -> Vec<String> {
        self.standby_table.keys().cloned().collect()
    }

    /// Instance serving the given session id, if any
    pub fn get_instance(&self, session_id: &str) -> Option<&InstanceInfo> {
        self.model_table
            .values()
            .find(|inst| inst.contains(session_id))
    }

    /// Throughput of the instance serving the given session id
    pub fn get_model_throughput(&self, session_id: &str) -> Option<f64> {
        self.get_instance(session_id).map(|inst| inst.throughput)
    }

    // --- Stats ---

    /// Fold a stats report (per-session sample windows) into the estimates
    pub fn update_stats(&mut self, stats: impl IntoIterator<Item = (String, Vec<f64>)>) {
        for (session_id, samples) in stats {
            if samples.is_empty() {
                continue;
            }
            let mean = samples.iter().sum::<f64>() / samples.len() as f64;
            self.rps.entry(session_id).or_default().observe(mean);
        }
    }

    /// Current request-rate estimate for a session
    pub fn get_model_rps(&self, session_id: &str) -> f64 {
        self.rps.get(session_id).map(Ewma::get).unwrap_or(0.0)
    }

    // --- Backups ---

    /// Record a backup backend for the instance serving `session_id`
    pub fn add_backup_for_model(&mut self, session_id: &str, backup: BackendInfo) {
        let inst = self
            .model_table
            .values_mut()
            .find(|inst| inst.contains(session_id));
        match inst {
            Some(inst) => {
                inst.backups.insert(backup.node_id, backup);
            }
            None => warn!(
                "Backend {} asked to back up unknown session {}",
                self.info.node_id, session_id
            ),
        }
    }

    /// Drop a backup backend from the instance serving `session_id`
    pub fn remove_backup_for_model(&mut self, session_id: &str, backup_id: NodeId) {
        if let Some(inst) = self
            .model_table
            .values_mut()
            .find(|inst| inst.contains(session_id))
        {
            inst.backups.remove(&backup_id);
        }
    }

    // --- Failover ---

    /// Adopt a dead backend's entire table. Succeeds only when this backend
    /// is idle, runs the same GPU device, and has the memory for it.
    pub fn assign(&mut self, other: &BackendDelegate) -> bool {
        if !self.is_idle() || self.gpu_device != other.gpu_device {
            return false;
        }
        if other.gpu_used_memory > self.gpu_free_memory() {
            return false;
        }
        self.model_table = other.model_table.clone();
        self.standby_table = other.standby_table.clone();
        self.gpu_used_memory += other.gpu_used_memory;
        self.workload_id = other.workload_id;
        info!(
            "Backend {} adopts the model table of backend {}",
            self.info.node_id, other.info.node_id
        );
        true
    }

    // --- Outbound push ---

    /// Push the current model and standby tables to the backend process.
    /// Idempotent; a transient failure is retried once, and after
    /// `MAX_PUSH_FAILURES` consecutive failed pushes the backend is marked
    /// dead for the next beacon sweep to remove.
    pub async fn update_model_table_rpc(&mut self) -> Result<()> {
        let update = ModelTableUpdate {
            model_instances: self
                .model_table
                .values()
                .chain(self.standby_table.values())
                .map(InstanceInfo::to_config)
                .collect(),
        };
        let mut result = self.ctrl.update_model_table(update.clone()).await;
        if result.is_err() {
            result = self.ctrl.update_model_table(update).await;
        }
        match result {
            Ok(()) => {
                self.push_failures = 0;
                Ok(())
            }
            Err(err) => {
                self.push_failures += 1;
                warn!(
                    "Model table push to backend {} failed ({}/{}): {}",
                    self.info.node_id, self.push_failures, MAX_PUSH_FAILURES, err
                );
                if self.push_failures >= MAX_PUSH_FAILURES {
                    self.alive = false;
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for BackendDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDelegate")
            .field("node_id", &self.info.node_id)
            .field("gpu_device", &self.gpu_device)
            .field("workload_id", &self.workload_id)
            .field("instances", &self.model_table.len())
            .field("used_memory", &self.gpu_used_memory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::MockBackendControl;
    use nexus_profile::ProfileEntry;

    fn sample_profile() -> ModelProfile {
        ModelProfile::from_entries(
            "tensorflow:resnet_50:1",
            "GPU_A",
            vec![
                ProfileEntry {
                    forward_mean_us: 10_000.0,
                    forward_std_us: 500.0,
                    memory_bytes: 1 << 30,
                },
                ProfileEntry {
                    forward_mean_us: 16_000.0,
                    forward_std_us: 500.0,
                    memory_bytes: 5 << 28,
                },
                ProfileEntry {
                    forward_mean_us: 21_000.0,
                    forward_std_us: 500.0,
                    memory_bytes: 6 << 28,
                },
                ProfileEntry {
                    forward_mean_us: 26_000.0,
                    forward_std_us: 1_000.0,
                    memory_bytes: 7 << 28,
                },
            ],
            1_500.0,
            500.0,
        )
    }

    fn sess() -> ModelSession {
        ModelSession::new("tensorflow", "resnet_50", 1, 100)
    }

    fn backend(total_memory: u64) -> (BackendDelegate, Arc<MockBackendControl>) {
        let ctrl = Arc::new(MockBackendControl::new());
        let info = BackendInfo {
            node_id: NodeId(1),
            ip: "10.0.0.1".to_string(),
            server_port: "9001".to_string(),
            rpc_port: "9002".to_string(),
        };
        let delegate = BackendDelegate::new(
            info,
            "GPU_A",
            total_memory,
            Duration::from_secs(2),
            ctrl.clone(),
        );
        (delegate, ctrl)
    }

    #[test]
    fn test_prepare_load_model_meets_rate_and_sla() {
        let (backend, _) = backend(8 << 30);
        let (inst, occupancy) = backend
            .prepare_load_model(&sample_profile(), &sess(), 30.0)
            .unwrap();
        assert!(inst.throughput >= 30.0);
        assert!(inst.duty_cycle_us + inst.forward_latency_us <= 100_000.0);
        assert!(inst.batch <= inst.max_batch);
        assert!(occupancy > 0.0 && occupancy <= 1.0);
    }

    #[test]
    fn test_prepare_load_model_rejects_on_memory() {
        let (backend, _) = backend(1 << 20);
        assert!(backend
            .prepare_load_model(&sample_profile(), &sess(), 30.0)
            .is_none());
    }

    #[test]
    fn test_load_unload_memory_accounting() {
        let (mut backend, _) = backend(8 << 30);
        let (inst, _) = backend
            .prepare_load_model(&sample_profile(), &sess(), 30.0)
            .unwrap();
        let memory = inst.memory_bytes;
        backend.load_model(inst);
        assert_eq!(backend.gpu_free_memory(), (8 << 30) - memory);
        assert!(!backend.is_idle());

        assert!(backend.unload_model(&sess().session_id()));
        assert_eq!(backend.gpu_free_memory(), 8 << 30);
        assert!(backend.is_idle());
        assert!(!backend.unload_model("missing:model:1:10"));
    }

    #[test]
    fn test_load_prefix_model_requires_head() {
        let (mut backend, _) = backend(8 << 30);
        let tail = ModelSession::new("tensorflow", "resnet_101", 1, 100);
        assert!(backend
            .load_prefix_model(tail.clone(), &sess().session_id())
            .is_err());

        let (inst, _) = backend
            .prepare_load_model(&sample_profile(), &sess(), 30.0)
            .unwrap();
        backend.load_model(inst);
        backend
            .load_prefix_model(tail.clone(), &sess().session_id())
            .unwrap();
        let inst = backend.get_instance(&tail.session_id()).unwrap();
        assert_eq!(inst.sessions.len(), 2);
        assert_eq!(inst.head_id(), sess().session_id());
        // Unloading the head re-keys the instance under the surviving member.
        backend.unload_model(&sess().session_id());
        assert!(backend.get_instance(&tail.session_id()).is_some());
        assert_eq!(
            backend.get_instance(&tail.session_id()).unwrap().head_id(),
            tail.session_id()
        );
    }

    #[test]
    fn test_update_model_throughput_rescales() {
        let (mut backend, _) = backend(8 << 30);
        let (inst, _) = backend
            .prepare_load_model(&sample_profile(), &sess(), 30.0)
            .unwrap();
        backend.load_model(inst);

        let new_tp = backend
            .update_model_throughput(&sample_profile(), &sess().session_id(), 10.0)
            .unwrap();
        assert!(new_tp >= 10.0);
        let inst = backend.get_instance(&sess().session_id()).unwrap();
        assert!((inst.throughput - new_tp).abs() < 1e-9);
        assert!(inst.duty_cycle_us + inst.forward_latency_us <= 100_000.0);
    }

    #[test]
    fn test_overload_and_spill_out() {
        let (mut backend, _) = backend(64 << 30);
        let profile = sample_profile();
        // Load several sessions and compress their duty cycles to the floor.
        for i in 0..4 {
            let sess = ModelSession::new("tensorflow", format!("model_{}", i), 1, 100);
            let (inst, _) = backend.prepare_load_model(&profile, &sess, 30.0).unwrap();
            backend.load_model(inst);
            backend
                .update_model_throughput(&profile, &sess.session_id(), 10_000.0)
                .unwrap();
        }
        assert!(backend.overload());
        let spilled = backend.spill_out_workload();
        assert!(!spilled.is_empty());
        assert!(!backend.overload());
        // Spilled throughput is returned for reallocation.
        for (sessions, throughput) in &spilled {
            assert!(!sessions.is_empty());
            assert!(*throughput > 0.0);
        }
    }

    #[test]
    fn test_assign_requires_idle_and_same_gpu() {
        let (mut dead, _) = backend(8 << 30);
        let (inst, _) = dead
            .prepare_load_model(&sample_profile(), &sess(), 30.0)
            .unwrap();
        dead.load_model(inst);

        let (mut other, _) = backend(8 << 30);
        assert!(other.assign(&dead));
        assert_eq!(
            other.get_model_throughput(&sess().session_id()),
            dead.get_model_throughput(&sess().session_id())
        );
        // A busy backend refuses.
        let (mut busy, _) = backend(8 << 30);
        let (inst, _) = busy
            .prepare_load_model(&sample_profile(), &sess(), 1.0)
            .unwrap();
        busy.load_model(inst);
        assert!(!busy.assign(&dead));
    }

    #[tokio::test]
    async fn test_liveness_window() {
        tokio::time::pause();
        let (mut backend, _) = backend(8 << 30);
        backend.tick();
        assert!(backend.is_alive());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!backend.is_alive());
        backend.tick();
        assert!(backend.is_alive());
    }

    #[tokio::test]
    async fn test_push_failures_mark_dead() {
        let (mut backend, ctrl) = backend(8 << 30);
        ctrl.set_fail(true);
        for _ in 0..MAX_PUSH_FAILURES {
            assert!(backend.update_model_table_rpc().await.is_err());
        }
        assert!(!backend.is_alive());

        // A successful push resets the counter for a healthy backend.
        let (mut backend, ctrl) = self::backend(8 << 30);
        ctrl.set_fail(true);
        let _ = backend.update_model_table_rpc().await;
        ctrl.set_fail(false);
        backend.update_model_table_rpc().await.unwrap();
        assert!(backend.is_alive());
    }

    #[test]
    fn test_ewma_stats() {
        let (mut backend, _) = backend(8 << 30);
        let id = sess().session_id();
        backend.update_stats(vec![(id.clone(), vec![10.0, 20.0, 30.0])]);
        assert!((backend.get_model_rps(&id) - 20.0).abs() < 1e-9);
        backend.update_stats(vec![(id.clone(), vec![40.0, 40.0])]);
        // 0.25 * 40 + 0.75 * 20
        assert!((backend.get_model_rps(&id) - 25.0).abs() < 1e-9);
        assert_eq!(backend.get_model_rps("unknown"), 0.0);
    }
}
