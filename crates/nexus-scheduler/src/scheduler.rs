//! The scheduler core: registries, allocation flows, and the control loop
//!
//! One mutex protects all registries, delegate plans, the session table,
//! and the static-workload assignment. RPC handlers and the control loop
//! run their whole mutation under it, so every externally observable state
//! is a consistent snapshot. Within a mutation, backend model-table pushes
//! always precede the frontend route pushes that point traffic at them.

use crate::allocator::{allocate_unassigned_workloads, find_best_backend};
use crate::backend::{BackendDelegate, InstanceInfo};
use crate::config::SchedulerConfig;
use crate::frontend::FrontendDelegate;
use crate::metrics::SchedulerMetrics;
use crate::push::ControlFactory;
use crate::session::{GroupId, SessionInfo, SessionRegistry};
use crate::workload::StaticWorkloadTable;
use nexus_core::{BackendInfo, BackendRate, ModelRoute, ModelSession, NodeId, NodeType};
use nexus_profile::ModelDatabase;
use nexus_proto::CtrlStatus;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub(crate) struct SchedulerState {
    pub(crate) backends: BTreeMap<NodeId, BackendDelegate>,
    pub(crate) frontends: BTreeMap<NodeId, FrontendDelegate>,
    pub(crate) sessions: SessionRegistry,
    pub(crate) workloads: StaticWorkloadTable,
}

/// The central scheduler
pub struct Scheduler {
    config: SchedulerConfig,
    db: Arc<ModelDatabase>,
    factory: Arc<dyn ControlFactory>,
    metrics: Arc<SchedulerMetrics>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        db: Arc<ModelDatabase>,
        workloads: StaticWorkloadTable,
        factory: Arc<dyn ControlFactory>,
    ) -> nexus_core::Result<Self> {
        config.validate()?;
        if !config.epoch_schedule {
            info!("Epoch scheduling is off");
        }
        if !config.prefix_batch {
            info!("Prefix batching is off");
        }
        let metrics = Arc::new(
            SchedulerMetrics::new()
                .map_err(|e| nexus_core::Error::internal(format!("metrics registry: {}", e)))?,
        );
        Ok(Self {
            config,
            db,
            factory,
            metrics,
            state: Mutex::new(SchedulerState {
                backends: BTreeMap::new(),
                frontends: BTreeMap::new(),
                sessions: SessionRegistry::new(),
                workloads,
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.metrics.clone()
    }

    // --- Registration ---

    /// Register a backend node. Duplicate ids are rejected; a fresh backend
    /// first fills the next static workload slot, otherwise it picks up
    /// unassigned workload.
    pub async fn register_backend(
        &self,
        node_id: NodeId,
        ip: String,
        server_port: String,
        rpc_port: String,
        gpu_device: String,
        gpu_available_memory: u64,
    ) -> CtrlStatus {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        if state.backends.contains_key(&node_id) {
            warn!("Backend node id conflict: {}", node_id);
            return CtrlStatus::CtrlBackendNodeIdConflict;
        }
        let info = BackendInfo {
            node_id,
            ip,
            server_port,
            rpc_port,
        };
        let ctrl = self.factory.backend_control(&info);
        info!(
            "Register backend {} ({}, {} bytes GPU memory)",
            node_id, gpu_device, gpu_available_memory
        );
        let delegate = BackendDelegate::new(
            info,
            gpu_device,
            gpu_available_memory,
            self.config.beacon_interval(),
            ctrl,
        );
        state.backends.insert(node_id, delegate);
        self.add_backend(state, node_id).await;
        self.metrics.backends_alive.set(state.backends.len() as i64);
        CtrlStatus::CtrlOk
    }

    /// Register a frontend node
    pub async fn register_frontend(
        &self,
        node_id: NodeId,
        ip: String,
        server_port: String,
        rpc_port: String,
    ) -> CtrlStatus {
        let mut state = self.state.lock().await;
        if state.frontends.contains_key(&node_id) {
            warn!("Frontend node id conflict: {}", node_id);
            return CtrlStatus::CtrlFrontendNodeIdConflict;
        }
        let rpc_addr = format!("{}:{}", ip, rpc_port);
        let ctrl = self.factory.frontend_control(node_id, &rpc_addr);
        info!("Register frontend {}", node_id);
        let delegate = FrontendDelegate::new(
            node_id,
            ip,
            server_port,
            rpc_port,
            self.config.beacon_interval(),
            ctrl,
        );
        state.frontends.insert(node_id, delegate);
        self.metrics
            .frontends_alive
            .set(state.frontends.len() as i64);
        CtrlStatus::CtrlOk
    }

    /// Unregister a node. Unknown ids are a no-op OK.
    pub async fn unregister(&self, node_type: NodeType, node_id: NodeId) -> CtrlStatus {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        match node_type {
            NodeType::Backend => match state.backends.remove(&node_id) {
                Some(backend) => {
                    info!("Remove backend {}", node_id);
                    self.remove_backend(state, backend).await;
                }
                None => error!("Cannot find backend {}", node_id),
            },
            NodeType::Frontend => match state.frontends.remove(&node_id) {
                Some(frontend) => {
                    info!("Remove frontend {}", node_id);
                    self.remove_frontend(state, &frontend).await;
                }
                None => error!("Cannot find frontend {}", node_id),
            },
        }
        self.metrics.backends_alive.set(state.backends.len() as i64);
        self.metrics
            .frontends_alive
            .set(state.frontends.len() as i64);
        CtrlStatus::CtrlOk
    }

    // --- LoadModel ---

    /// Handle a frontend's LoadModel request: subscribe to an existing
    /// session, attach to a prefix-sharing group, or allocate backends for
    /// the estimated workload. On `NOT_ENOUGH_BACKENDS` no state is
    /// mutated.
    pub async fn load_model(
        &self,
        frontend_id: NodeId,
        mut sess: ModelSession,
        estimate_workload: f64,
    ) -> (CtrlStatus, Option<ModelRoute>) {
        let meta = match self.db.get_model_info(&sess.model_id()) {
            Some(meta) => meta,
            None => return (CtrlStatus::ModelNotFound, None),
        };
        if meta.resizable && sess.image_height.is_none() {
            // Default input size for resizable models.
            sess = sess.with_image_size(meta.image_height, meta.image_width);
        }
        let session_id = sess.session_id();

        let mut state = self.state.lock().await;
        let state = &mut *state;
        match state.frontends.get_mut(&frontend_id) {
            Some(frontend) => frontend.tick(),
            None => return (CtrlStatus::CtrlServerNotRegistered, None),
        }

        // Already loaded: subscribe and return the current route. Growth is
        // the epoch loop's business.
        if state.sessions.contains_session(&session_id) {
            subscribe(state, &session_id, frontend_id);
            let route = get_model_route(&state.backends, &state.sessions, &session_id);
            return (CtrlStatus::CtrlOk, route);
        }

        // Prefix batching: ride on a loaded session with the same backbone.
        if self.config.prefix_batch {
            if let Some((group_id, member_id)) = self.find_prefix_group(state, &sess) {
                info!(
                    "Model session {} shares prefix with session {}",
                    session_id, member_id
                );
                let serving: Vec<NodeId> = state
                    .sessions
                    .group(group_id)
                    .map(|g| g.backend_throughputs.keys().copied().collect())
                    .unwrap_or_default();
                for node_id in &serving {
                    if let Some(backend) = state.backends.get_mut(node_id) {
                        if let Err(err) = backend.load_prefix_model(sess.clone(), &member_id) {
                            error!("Prefix load on backend {}: {}", node_id, err);
                            continue;
                        }
                        let pushed = backend.update_model_table_rpc().await;
                        self.record_push(pushed.is_ok());
                    }
                }
                state.sessions.attach_member(group_id, sess);
                subscribe(state, &session_id, frontend_id);
                let route = get_model_route(&state.backends, &state.sessions, &session_id);
                return (CtrlStatus::CtrlOk, route);
            }
        }

        // Allocate backends for the estimated workload. Everything up to
        // the load loop is pure, so a failed allocation leaves no trace.
        let mut assign: Vec<(NodeId, InstanceInfo)> = Vec::new();
        let mut used: BTreeSet<NodeId> = BTreeSet::new();
        if estimate_workload <= 0.0 {
            match find_best_backend(&state.backends, &self.db, &sess, 0.0, &used) {
                Some(found) => assign.push(found),
                None => return (CtrlStatus::NotEnoughBackends, None),
            }
        } else {
            let mut residual = estimate_workload;
            while residual > 0.0 {
                match find_best_backend(&state.backends, &self.db, &sess, residual, &used) {
                    Some((node_id, inst)) => {
                        residual -= inst.throughput;
                        used.insert(node_id);
                        assign.push((node_id, inst));
                    }
                    None => return (CtrlStatus::NotEnoughBackends, None),
                }
            }
        }

        let mut session_info = SessionInfo::new(sess);
        for (node_id, inst) in assign {
            let throughput = inst.throughput;
            let backend = state.backends.get_mut(&node_id).expect("candidate exists");
            backend.load_model(inst);
            let pushed = backend.update_model_table_rpc().await;
            self.record_push(pushed.is_ok());
            session_info.backend_throughputs.insert(node_id, throughput);
        }
        state.sessions.insert_group(session_info);
        subscribe(state, &session_id, frontend_id);
        self.metrics
            .session_groups
            .set(state.sessions.len() as i64);
        let route = get_model_route(&state.backends, &state.sessions, &session_id);
        (CtrlStatus::CtrlOk, route)
    }

    fn find_prefix_group(
        &self,
        state: &SchedulerState,
        sess: &ModelSession,
    ) -> Option<(GroupId, String)> {
        for share_model_id in self.db.get_prefix_share_models(&sess.model_id()) {
            let parts: Vec<&str> = share_model_id.split(':').collect();
            if parts.len() != 3 {
                warn!("Malformed prefix-share model id: {}", share_model_id);
                continue;
            }
            let version = match parts[2].parse::<u32>() {
                Ok(version) => version,
                Err(_) => continue,
            };
            // Prefix batching requires the same latency SLA and input size.
            let mut candidate =
                ModelSession::new(parts[0], parts[1], version, sess.latency_sla_ms);
            if let (Some(h), Some(w)) = (sess.image_height, sess.image_width) {
                candidate = candidate.with_image_size(h, w);
            }
            let candidate_id = candidate.session_id();
            if let Some(group_id) = state.sessions.group_id_of(&candidate_id) {
                return Some((group_id, candidate_id));
            }
        }
        None
    }

    // --- Stats and liveness RPCs ---

    /// Feed a backend's per-session rps window into its estimates
    pub async fn update_backend_stats(
        &self,
        node_id: NodeId,
        stats: Vec<(String, Vec<f64>)>,
    ) -> CtrlStatus {
        let mut state = self.state.lock().await;
        match state.backends.get_mut(&node_id) {
            Some(backend) => {
                backend.tick();
                backend.update_stats(stats);
                CtrlStatus::CtrlOk
            }
            None => CtrlStatus::CtrlServerNotRegistered,
        }
    }

    /// Frontend keep-alive
    pub async fn keep_alive(&self, node_id: NodeId) -> CtrlStatus {
        let mut state = self.state.lock().await;
        match state.frontends.get_mut(&node_id) {
            Some(frontend) => {
                frontend.tick();
                CtrlStatus::CtrlOk
            }
            None => CtrlStatus::CtrlServerNotRegistered,
        }
    }

    // --- Node arrival/departure flows ---

    /// Give a fresh backend its share of work: the next static slot when
    /// one is open, otherwise any unassigned workload.
    async fn add_backend(&self, state: &mut SchedulerState, node_id: NodeId) {
        let mut changed_groups: BTreeSet<GroupId> = BTreeSet::new();
        let mut changed_backends: BTreeSet<NodeId> = BTreeSet::new();

        if let Some(slot) = state.workloads.next_unassigned() {
            state.workloads.assign(slot, node_id);
            info!("Assign workload {} to backend {}", slot, node_id);
            let specs = state.workloads.slot(slot).to_vec();
            {
                let backend = state.backends.get_mut(&node_id).expect("registered");
                for spec in &specs {
                    let sess = spec.model_session();
                    let profile = match self.db.get_profile(
                        &sess.framework,
                        &sess.model_name,
                        sess.version,
                        backend.gpu_device(),
                        sess.image_height,
                        sess.image_width,
                    ) {
                        Ok(profile) => profile,
                        Err(err) => {
                            error!("Static workload {}: {}", sess.session_id(), err);
                            continue;
                        }
                    };
                    if let Err(err) =
                        backend.load_fixed_model(profile, sess.clone(), spec.batch, spec.backup)
                    {
                        error!("Static workload {}: {}", sess.session_id(), err);
                    }
                }
                backend.set_workload_id(slot as i32);
            }
            changed_backends.insert(node_id);

            // Mirror the loaded instances into the session table.
            let instances: Vec<(Vec<ModelSession>, f64)> = state
                .backends
                .get(&node_id)
                .expect("registered")
                .instances()
                .map(|inst| (inst.sessions.clone(), inst.throughput))
                .collect();
            for (sessions, throughput) in instances {
                let head_id = sessions[0].session_id();
                let group_id = match state.sessions.group_id_of(&head_id) {
                    Some(group_id) => group_id,
                    None => {
                        let mut info = SessionInfo::new(sessions[0].clone());
                        info.has_static_workload = true;
                        state.sessions.insert_group(info)
                    }
                };
                if let Some(group) = state.sessions.group_mut(group_id) {
                    group.has_static_workload = true;
                    group.backend_throughputs.insert(node_id, throughput);
                }
                changed_groups.insert(group_id);
            }

            // Standby entries make this backend a failover target.
            let standby = state
                .backends
                .get(&node_id)
                .expect("registered")
                .standby_sessions();
            let backup_info = state
                .backends
                .get(&node_id)
                .expect("registered")
                .info()
                .clone();
            for session_id in standby {
                let group_id = match state.sessions.group_id_of(&session_id) {
                    Some(group_id) => group_id,
                    None => {
                        error!(
                            "Cannot find backup model session {} in the session table",
                            session_id
                        );
                        continue;
                    }
                };
                let serving: Vec<NodeId> = {
                    let group = state.sessions.group_mut(group_id).expect("group exists");
                    if !group.backup_backends.insert(node_id) {
                        continue;
                    }
                    group.backend_throughputs.keys().copied().collect()
                };
                for serving_id in serving {
                    if let Some(backend) = state.backends.get_mut(&serving_id) {
                        backend.add_backup_for_model(&session_id, backup_info.clone());
                        changed_backends.insert(serving_id);
                    }
                }
            }
        } else {
            let outcome =
                allocate_unassigned_workloads(&mut state.backends, &mut state.sessions, &self.db);
            changed_groups.extend(outcome.changed_groups);
            changed_backends.extend(outcome.changed_backends);
        }

        self.push_model_tables(state, changed_backends).await;
        push_model_routes(state, &changed_groups).await;
        self.metrics
            .session_groups
            .set(state.sessions.len() as i64);
    }

    /// Tear down a departed backend: reassign its whole plan to an idle
    /// twin when possible, otherwise return its workload to the pool.
    async fn remove_backend(&self, state: &mut SchedulerState, dead: BackendDelegate) {
        if dead.is_idle() && dead.standby_sessions().is_empty() {
            return;
        }
        let mut changed_groups: BTreeSet<GroupId> = BTreeSet::new();
        let mut changed_backends: BTreeSet<NodeId> = BTreeSet::new();

        // 1. Remove its throughput contributions.
        let dead_instances: Vec<(Vec<ModelSession>, f64)> = dead
            .instances()
            .map(|inst| (inst.sessions.clone(), inst.throughput))
            .collect();
        for (sessions, _) in &dead_instances {
            if let Some(group_id) = state.sessions.group_id_of(&sessions[0].session_id()) {
                if let Some(group) = state.sessions.group_mut(group_id) {
                    group.backend_throughputs.remove(&dead.node_id());
                }
                changed_groups.insert(group_id);
            }
        }

        // 2. Try to hand the entire table to an idle backend.
        let mut assigned_id = None;
        for (node_id, candidate) in state.backends.iter_mut() {
            if candidate.is_idle() && candidate.assign(&dead) {
                assigned_id = Some(*node_id);
                break;
            }
        }

        if let Some(assigned_id) = assigned_id {
            let assigned_info = state
                .backends
                .get(&assigned_id)
                .expect("assigned exists")
                .info()
                .clone();
            for (sessions, throughput) in &dead_instances {
                if let Some(group_id) = state.sessions.group_id_of(&sessions[0].session_id()) {
                    if let Some(group) = state.sessions.group_mut(group_id) {
                        group.backend_throughputs.insert(assigned_id, *throughput);
                    }
                }
            }
            if dead.workload_id() >= 0 {
                state
                    .workloads
                    .assign(dead.workload_id() as usize, assigned_id);
                info!(
                    "Reassign workload {} to backend {}",
                    dead.workload_id(),
                    assigned_id
                );
            }
            changed_backends.insert(assigned_id);

            // Migrate backup-for entries to the adopting backend.
            for session_id in dead.standby_sessions() {
                let group_id = match state.sessions.group_id_of(&session_id) {
                    Some(group_id) => group_id,
                    None => continue,
                };
                let (removed, inserted, serving) = {
                    let group = state.sessions.group_mut(group_id).expect("group exists");
                    let removed = group.backup_backends.remove(&dead.node_id());
                    let inserted = group.backup_backends.insert(assigned_id);
                    (
                        removed,
                        inserted,
                        group
                            .backend_throughputs
                            .keys()
                            .copied()
                            .collect::<Vec<_>>(),
                    )
                };
                if !removed && !inserted {
                    continue;
                }
                for serving_id in serving {
                    if let Some(backend) = state.backends.get_mut(&serving_id) {
                        backend.remove_backup_for_model(&session_id, dead.node_id());
                        backend.add_backup_for_model(&session_id, assigned_info.clone());
                        changed_backends.insert(serving_id);
                    }
                }
            }
        } else {
            // No adopter: retire backup entries pointing at the dead node.
            for session_id in dead.standby_sessions() {
                let group_id = match state.sessions.group_id_of(&session_id) {
                    Some(group_id) => group_id,
                    None => continue,
                };
                let (removed, serving) = {
                    let group = state.sessions.group_mut(group_id).expect("group exists");
                    (
                        group.backup_backends.remove(&dead.node_id()),
                        group
                            .backend_throughputs
                            .keys()
                            .copied()
                            .collect::<Vec<_>>(),
                    )
                };
                if !removed {
                    continue;
                }
                for serving_id in serving {
                    if let Some(backend) = state.backends.get_mut(&serving_id) {
                        backend.remove_backup_for_model(&session_id, dead.node_id());
                        changed_backends.insert(serving_id);
                    }
                }
            }
            if dead.workload_id() >= 0 {
                state.workloads.release(dead.workload_id() as usize);
                info!("Release workload slot {}", dead.workload_id());
            } else {
                // Dynamic workload goes back to the pool for reallocation.
                for (sessions, throughput) in &dead_instances {
                    if let Some(group_id) = state.sessions.group_id_of(&sessions[0].session_id())
                    {
                        if let Some(group) = state.sessions.group_mut(group_id) {
                            group.unassigned_workload += throughput;
                        }
                    }
                }
                let outcome = allocate_unassigned_workloads(
                    &mut state.backends,
                    &mut state.sessions,
                    &self.db,
                );
                changed_groups.extend(outcome.changed_groups);
                changed_backends.extend(outcome.changed_backends);
            }
        }

        self.push_model_tables(state, changed_backends).await;
        push_model_routes(state, &changed_groups).await;
    }

    /// Drop a departed frontend's subscriptions; sessions that lose their
    /// last subscriber and have no static workload are unloaded everywhere.
    async fn remove_frontend(&self, state: &mut SchedulerState, frontend: &FrontendDelegate) {
        let mut changed_backends: BTreeSet<NodeId> = BTreeSet::new();
        for session_id in frontend.subscriptions().iter().cloned().collect::<Vec<_>>() {
            let emptied = state.sessions.unsubscribe(&session_id, frontend.node_id());
            if !emptied {
                continue;
            }
            let group_id = match state.sessions.group_id_of(&session_id) {
                Some(group_id) => group_id,
                None => continue,
            };
            if state
                .sessions
                .group(group_id)
                .is_some_and(|g| g.has_static_workload)
            {
                continue;
            }
            info!("Remove model session: {}", session_id);
            let serving: Vec<NodeId> = state
                .sessions
                .group(group_id)
                .map(|g| g.backend_throughputs.keys().copied().collect())
                .unwrap_or_default();
            state.sessions.detach_member(&session_id);
            for serving_id in serving {
                if let Some(backend) = state.backends.get_mut(&serving_id) {
                    backend.unload_model(&session_id);
                    changed_backends.insert(serving_id);
                }
            }
        }
        self.push_model_tables(state, changed_backends).await;
        self.metrics
            .session_groups
            .set(state.sessions.len() as i64);
    }

    // --- Control loop passes ---

    /// Liveness sweep and rps aggregation, run every beacon interval
    pub async fn beacon_check(&self) {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        self.metrics.beacon_runs.inc();

        // 1. Evict dead frontends.
        let dead_frontends: Vec<NodeId> = state
            .frontends
            .values()
            .filter(|f| !f.is_alive())
            .map(FrontendDelegate::node_id)
            .collect();
        for node_id in dead_frontends {
            let frontend = state.frontends.remove(&node_id).expect("present");
            info!(
                "Remove frontend {}, last alive time: {}",
                node_id,
                frontend.last_alive_time()
            );
            self.remove_frontend(state, &frontend).await;
        }

        // 2. Aggregate per-group request rates.
        let history_len = self.config.history_len();
        for group_id in state.sessions.group_ids() {
            let (members, serving) = {
                let group = state.sessions.group(group_id).expect("group exists");
                (
                    group
                        .model_sessions
                        .iter()
                        .map(ModelSession::session_id)
                        .collect::<Vec<_>>(),
                    group
                        .backend_throughputs
                        .keys()
                        .copied()
                        .collect::<Vec<_>>(),
                )
            };
            let mut rps = 0.0;
            for node_id in &serving {
                if let Some(backend) = state.backends.get(node_id) {
                    for member in &members {
                        rps += backend.get_model_rps(member);
                    }
                }
            }
            let group = state.sessions.group_mut(group_id).expect("group exists");
            // Leading zeros are noise; start recording at the first signal.
            if !group.rps_history.is_empty() || rps > 0.0 {
                group.rps_history.push_back(rps);
            }
            while group.rps_history.len() > history_len {
                group.rps_history.pop_front();
            }
            debug!(
                "Model {} rps: {:.1} req/s",
                members.first().map(String::as_str).unwrap_or(""),
                rps
            );
        }

        // 3. Evict dead backends, then reassign their workload.
        let dead_ids: Vec<NodeId> = state
            .backends
            .values()
            .filter(|b| !b.is_alive())
            .map(BackendDelegate::node_id)
            .collect();
        let mut dead_backends = Vec::new();
        for node_id in dead_ids {
            if let Some(backend) = state.backends.remove(&node_id) {
                info!(
                    "Remove backend {}, last alive time: {}",
                    node_id,
                    backend.last_alive_time()
                );
                dead_backends.push(backend);
            }
        }
        for backend in dead_backends {
            self.remove_backend(state, backend).await;
        }

        self.metrics.backends_alive.set(state.backends.len() as i64);
        self.metrics
            .frontends_alive
            .set(state.frontends.len() as i64);
    }

    /// Revisit every session's allocation against its observed workload,
    /// run every epoch interval
    pub async fn epoch_schedule(&self) {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        self.metrics.epoch_runs.inc();

        let mut changed_groups: BTreeSet<GroupId> = BTreeSet::new();
        let mut overload_backends: Vec<NodeId> = Vec::new();
        let min_history = self.config.min_history_len();

        // 1. Shrink or grow each session toward its estimated rate.
        for group_id in state.sessions.group_ids() {
            let (head, throughput, history, contributions) = {
                let group = state.sessions.group(group_id).expect("group exists");
                (
                    group.head().clone(),
                    group.total_throughput(),
                    group.rps_history.clone(),
                    group
                        .backend_throughputs
                        .iter()
                        .map(|(node_id, tp)| (*node_id, *tp))
                        .collect::<Vec<_>>(),
                )
            };
            let n = history.len();
            if n < min_history {
                continue;
            }
            let mean = history.iter().sum::<f64>() / n as f64;
            let variance = history
                .iter()
                .map(|rps| (rps - mean) * (rps - mean))
                .sum::<f64>()
                / (n as f64 - 1.0).max(1.0);
            let std = variance.sqrt();
            let estimate = (history[n - 1] + std).max(0.1);
            {
                let group = state.sessions.group_mut(group_id).expect("group exists");
                group.unassigned_workload = (estimate - throughput).max(0.0);
            }
            debug!(
                "{} estimate rps: {:.1} (last {:.1}, mean {:.1}, std {:.1}), throughput: {:.1}",
                head.session_id(),
                estimate,
                history[n - 1],
                mean,
                std,
                throughput
            );

            if estimate < throughput * 0.97 {
                self.shrink_session(state, group_id, &head, estimate, &contributions);
                changed_groups.insert(group_id);
            } else if estimate > throughput {
                let overloaded =
                    self.grow_session(state, group_id, &head, estimate, &contributions);
                overload_backends.extend(overloaded);
                changed_groups.insert(group_id);
            }
        }

        // 2. Overloaded backends hand work back to the pool.
        for node_id in overload_backends {
            let spilled = match state.backends.get_mut(&node_id) {
                Some(backend) => backend.spill_out_workload(),
                None => continue,
            };
            for (sessions, throughput) in spilled {
                if let Some(group_id) = state.sessions.group_id_of(&sessions[0].session_id()) {
                    let group = state.sessions.group_mut(group_id).expect("group exists");
                    group.backend_throughputs.remove(&node_id);
                    group.unassigned_workload += throughput;
                    changed_groups.insert(group_id);
                }
            }
        }

        // 3. Place whatever is unassigned.
        let outcome =
            allocate_unassigned_workloads(&mut state.backends, &mut state.sessions, &self.db);
        changed_groups.extend(outcome.changed_groups);

        // 4. Push every backend table, then the changed routes.
        let all_backends: Vec<NodeId> = state.backends.keys().copied().collect();
        self.push_model_tables(state, all_backends).await;
        push_model_routes(state, &changed_groups).await;

        log_model_table(state);
    }

    fn shrink_session(
        &self,
        state: &mut SchedulerState,
        group_id: GroupId,
        head: &ModelSession,
        mut estimate: f64,
        contributions: &[(NodeId, f64)],
    ) {
        // Static slots keep their share; only dynamic backends adjust.
        let mut adjust: Vec<(NodeId, f64)> = Vec::new();
        for (node_id, throughput) in contributions {
            match state.backends.get(node_id) {
                Some(backend) if backend.workload_id() >= 0 => estimate -= throughput,
                Some(_) => adjust.push((*node_id, *throughput)),
                None => {}
            }
        }
        adjust.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        for (node_id, throughput) in adjust {
            if estimate <= 0.0 {
                let members: Vec<String> = state
                    .sessions
                    .group(group_id)
                    .map(|g| g.model_sessions.iter().map(ModelSession::session_id).collect())
                    .unwrap_or_default();
                if let Some(backend) = state.backends.get_mut(&node_id) {
                    for member in &members {
                        backend.unload_model(member);
                    }
                }
                if let Some(group) = state.sessions.group_mut(group_id) {
                    group.backend_throughputs.remove(&node_id);
                }
            } else if throughput > estimate {
                if let Some(new_tp) = self.rescale_backend(state, node_id, head, estimate) {
                    if let Some(group) = state.sessions.group_mut(group_id) {
                        group.backend_throughputs.insert(node_id, new_tp);
                    }
                    estimate -= new_tp;
                }
            } else {
                estimate -= throughput;
            }
        }
    }

    fn grow_session(
        &self,
        state: &mut SchedulerState,
        group_id: GroupId,
        head: &ModelSession,
        mut estimate: f64,
        contributions: &[(NodeId, f64)],
    ) -> Vec<NodeId> {
        let mut overloaded = Vec::new();
        let mut adjust: Vec<(NodeId, f64)> = Vec::new();
        for (node_id, throughput) in contributions {
            match state.backends.get(node_id) {
                Some(backend) if backend.workload_id() >= 0 => estimate -= throughput,
                Some(_) => adjust.push((*node_id, *throughput)),
                None => {}
            }
        }
        adjust.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        for (node_id, _) in adjust {
            // Earlier backends may have absorbed the whole estimate; the
            // rest shrink to the 0.1 req/s floor rather than grow.
            if let Some(new_tp) = self.rescale_backend(state, node_id, head, estimate.max(0.1)) {
                if let Some(group) = state.sessions.group_mut(group_id) {
                    group.backend_throughputs.insert(node_id, new_tp);
                }
                estimate -= new_tp;
                if state
                    .backends
                    .get(&node_id)
                    .is_some_and(BackendDelegate::overload)
                {
                    overloaded.push(node_id);
                }
            }
        }
        if estimate > 0.0 {
            if let Some(group) = state.sessions.group_mut(group_id) {
                group.unassigned_workload = estimate;
            }
        }
        overloaded
    }

    fn rescale_backend(
        &self,
        state: &mut SchedulerState,
        node_id: NodeId,
        head: &ModelSession,
        rate: f64,
    ) -> Option<f64> {
        let backend = state.backends.get_mut(&node_id)?;
        let profile = match self.db.get_profile(
            &head.framework,
            &head.model_name,
            head.version,
            backend.gpu_device(),
            head.image_height,
            head.image_width,
        ) {
            Ok(profile) => profile,
            Err(err) => {
                error!("Profile lookup for rescale on {}: {}", node_id, err);
                return None;
            }
        };
        match backend.update_model_throughput(profile, &head.session_id(), rate) {
            Ok(new_tp) => Some(new_tp),
            Err(err) => {
                error!("Rescale {} on backend {}: {}", head.session_id(), node_id, err);
                None
            }
        }
    }

    // --- Outbound pushes ---

    async fn push_model_tables(
        &self,
        state: &mut SchedulerState,
        ids: impl IntoIterator<Item = NodeId>,
    ) {
        for node_id in ids {
            if let Some(backend) = state.backends.get_mut(&node_id) {
                let pushed = backend.update_model_table_rpc().await;
                self.record_push(pushed.is_ok());
            }
        }
    }

    fn record_push(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.metrics.table_pushes.with_label_values(&[result]).inc();
    }

    // --- Control loop ---

    /// Drive the beacon and epoch passes until shutdown. Deadlines live on
    /// the monotonic clock; wall time is only used in logs.
    pub async fn run_control_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let beacon = self.config.beacon_interval();
        let epoch = self.config.epoch_interval();
        let start = Instant::now();
        let mut next_beacon = start + beacon;
        let mut next_epoch = start + epoch;
        info!(
            "Control loop started (beacon {}s, epoch {}s)",
            self.config.beacon_interval_sec, self.config.epoch_interval_sec
        );
        loop {
            let next = next_beacon.min(next_epoch);
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let now = Instant::now();
            if now >= next_beacon {
                self.beacon_check().await;
                next_beacon += beacon;
            }
            if now >= next_epoch {
                if self.config.epoch_schedule {
                    self.epoch_schedule().await;
                }
                next_epoch += epoch;
            }
        }
        info!("Control loop stopped");
    }

    #[cfg(test)]
    pub(crate) async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().await
    }
}

fn subscribe(state: &mut SchedulerState, session_id: &str, frontend_id: NodeId) {
    state.sessions.subscribe(session_id, frontend_id);
    if let Some(frontend) = state.frontends.get_mut(&frontend_id) {
        frontend.subscribe_model(session_id);
    }
}

fn get_model_route(
    backends: &BTreeMap<NodeId, BackendDelegate>,
    sessions: &SessionRegistry,
    session_id: &str,
) -> Option<ModelRoute> {
    let group = sessions.get_by_session(session_id)?;
    let mut backend_rate = Vec::new();
    for (node_id, throughput) in &group.backend_throughputs {
        match backends.get(node_id) {
            Some(backend) => backend_rate.push(BackendRate {
                info: backend.info().clone(),
                throughput: *throughput,
            }),
            None => error!(
                "Route for {} references unknown backend {}",
                session_id, node_id
            ),
        }
    }
    Some(ModelRoute {
        model_session_id: session_id.to_string(),
        backend_rate,
    })
}

/// Push fresh routes for the given groups to every subscribed frontend
async fn push_model_routes(state: &SchedulerState, groups: &BTreeSet<GroupId>) {
    let mut per_frontend: BTreeMap<NodeId, Vec<ModelRoute>> = BTreeMap::new();
    for group_id in groups {
        let group = match state.sessions.group(*group_id) {
            Some(group) => group,
            None => continue,
        };
        for sess in &group.model_sessions {
            let session_id = sess.session_id();
            let subscribers: Vec<NodeId> = state.sessions.subscribers_of(&session_id).collect();
            if subscribers.is_empty() {
                continue;
            }
            let route = match get_model_route(&state.backends, &state.sessions, &session_id) {
                Some(route) => route,
                None => continue,
            };
            for frontend_id in subscribers {
                per_frontend
                    .entry(frontend_id)
                    .or_default()
                    .push(route.clone());
            }
        }
    }
    for (frontend_id, routes) in per_frontend {
        if let Some(frontend) = state.frontends.get(&frontend_id) {
            frontend.update_model_routes_rpc(routes).await;
        }
    }
}

fn log_model_table(state: &SchedulerState) {
    for (_, group) in state.sessions.groups() {
        let head_id = group.head().session_id();
        let mut line = format!("{}:", head_id);
        for (node_id, throughput) in &group.backend_throughputs {
            let batch = state
                .backends
                .get(node_id)
                .and_then(|b| b.get_instance(&head_id))
                .map(|inst| inst.batch)
                .unwrap_or(0);
            line.push_str(&format!(" {}/{:.1}/{}", node_id, throughput, batch));
        }
        debug!("Model table: {}", line);
    }
}
