//! Session registry: model-session groups and their secondary indices
//!
//! Sessions that share a backbone prefix are batched together and share one
//! `SessionInfo`. The registry stores groups in an arena keyed by a stable
//! group id; members index into it by session-id string. Delegates refer to
//! sessions only by id, never by reference, so no back-pointers exist.

use nexus_core::{ModelSession, NodeId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Stable identifier of a session group
pub type GroupId = u64;

/// Shared state of one prefix-sharing group of model sessions
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Member sessions; the head is `model_sessions[0]`
    pub model_sessions: Vec<ModelSession>,

    /// Throughput contributed by each serving backend
    pub backend_throughputs: BTreeMap<NodeId, f64>,

    /// Backends standing by for failover
    pub backup_backends: BTreeSet<NodeId>,

    /// Recent per-beacon request rates, bounded by the scheduler's
    /// history length
    pub rps_history: VecDeque<f64>,

    /// Workload (req/s) the scheduler has not yet placed on any backend
    pub unassigned_workload: f64,

    /// Groups seeded from the static workload table survive subscriber
    /// loss and are never deallocated by the epoch loop
    pub has_static_workload: bool,
}

impl SessionInfo {
    /// Create a group with a single member
    pub fn new(head: ModelSession) -> Self {
        Self {
            model_sessions: vec![head],
            ..Default::default()
        }
    }

    /// The group head
    pub fn head(&self) -> &ModelSession {
        &self.model_sessions[0]
    }

    /// Sum of serving backend throughputs
    pub fn total_throughput(&self) -> f64 {
        self.backend_throughputs.values().sum()
    }

    /// Whether the given session id is a member
    pub fn contains(&self, session_id: &str) -> bool {
        self.model_sessions
            .iter()
            .any(|s| s.session_id() == session_id)
    }
}

/// Registry of session groups with by-session and subscriber indices
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_group_id: GroupId,
    groups: BTreeMap<GroupId, SessionInfo>,
    by_session: BTreeMap<String, GroupId>,

    /// Subscribed frontends per member session id
    subscribers: BTreeMap<String, BTreeSet<NodeId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new group; indexes every member
    pub fn insert_group(&mut self, info: SessionInfo) -> GroupId {
        let group_id = self.next_group_id;
        self.next_group_id += 1;
        for sess in &info.model_sessions {
            self.by_session.insert(sess.session_id(), group_id);
        }
        self.groups.insert(group_id, info);
        group_id
    }

    /// Attach a member session to an existing group
    pub fn attach_member(&mut self, group_id: GroupId, sess: ModelSession) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            self.by_session.insert(sess.session_id(), group_id);
            if !group.contains(&sess.session_id()) {
                group.model_sessions.push(sess);
            }
        }
    }

    /// Detach a member; removes the whole group when it was the last one.
    /// Returns the group id the member belonged to.
    pub fn detach_member(&mut self, session_id: &str) -> Option<GroupId> {
        let group_id = self.by_session.remove(session_id)?;
        self.subscribers.remove(session_id);
        let emptied = {
            let group = self.groups.get_mut(&group_id)?;
            group
                .model_sessions
                .retain(|s| s.session_id() != session_id);
            group.model_sessions.is_empty()
        };
        if emptied {
            self.groups.remove(&group_id);
        }
        Some(group_id)
    }

    pub fn group(&self, group_id: GroupId) -> Option<&SessionInfo> {
        self.groups.get(&group_id)
    }

    pub fn group_mut(&mut self, group_id: GroupId) -> Option<&mut SessionInfo> {
        self.groups.get_mut(&group_id)
    }

    /// Group id a session id belongs to
    pub fn group_id_of(&self, session_id: &str) -> Option<GroupId> {
        self.by_session.get(session_id).copied()
    }

    /// Group a session id belongs to
    pub fn get_by_session(&self, session_id: &str) -> Option<&SessionInfo> {
        self.group(self.group_id_of(session_id)?)
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.by_session.contains_key(session_id)
    }

    /// All group ids, in creation order
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    /// Iterate groups
    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &SessionInfo)> {
        self.groups.iter().map(|(id, info)| (*id, info))
    }

    /// Number of registered groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    // --- Subscribers ---

    /// Subscribe a frontend to a member session (upsert)
    pub fn subscribe(&mut self, session_id: &str, frontend_id: NodeId) {
        self.subscribers
            .entry(session_id.to_string())
            .or_default()
            .insert(frontend_id);
    }

    /// Unsubscribe a frontend; returns true when the session lost its last
    /// subscriber
    pub fn unsubscribe(&mut self, session_id: &str, frontend_id: NodeId) -> bool {
        match self.subscribers.get_mut(session_id) {
            Some(subs) => {
                subs.remove(&frontend_id);
                if subs.is_empty() {
                    self.subscribers.remove(session_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    /// Subscribed frontends of a member session
    pub fn subscribers_of(&self, session_id: &str) -> impl Iterator<Item = NodeId> + '_ {
        self.subscribers
            .get(session_id)
            .into_iter()
            .flat_map(|subs| subs.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sess(name: &str) -> ModelSession {
        ModelSession::new("tensorflow", name, 1, 100)
    }

    #[test]
    fn test_group_lifecycle() {
        let mut registry = SessionRegistry::new();
        let head = sess("resnet_50");
        let gid = registry.insert_group(SessionInfo::new(head.clone()));
        assert!(registry.contains_session(&head.session_id()));

        let tail = sess("resnet_101");
        registry.attach_member(gid, tail.clone());
        assert_eq!(registry.group_id_of(&tail.session_id()), Some(gid));
        assert_eq!(registry.group(gid).unwrap().model_sessions.len(), 2);

        // Detaching one member keeps the group alive.
        registry.detach_member(&head.session_id());
        assert!(!registry.contains_session(&head.session_id()));
        assert!(registry.contains_session(&tail.session_id()));
        assert_eq!(registry.group(gid).unwrap().head(), &tail);

        // Detaching the last member removes the group.
        registry.detach_member(&tail.session_id());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_detach_member_cleans_subscribers() {
        let mut registry = SessionRegistry::new();
        let head = sess("resnet_50");
        registry.insert_group(SessionInfo::new(head.clone()));
        registry.subscribe(&head.session_id(), NodeId(1));

        registry.detach_member(&head.session_id());
        assert!(!registry.contains_session(&head.session_id()));
        assert_eq!(registry.subscribers_of(&head.session_id()).count(), 0);
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let mut registry = SessionRegistry::new();
        let head = sess("resnet_50");
        registry.insert_group(SessionInfo::new(head.clone()));
        let id = head.session_id();

        registry.subscribe(&id, NodeId(1));
        registry.subscribe(&id, NodeId(2));
        // Upsert: duplicate subscribe is harmless.
        registry.subscribe(&id, NodeId(1));
        assert_eq!(registry.subscribers_of(&id).count(), 2);

        assert!(!registry.unsubscribe(&id, NodeId(1)));
        assert!(registry.unsubscribe(&id, NodeId(2)));
        assert_eq!(registry.subscribers_of(&id).count(), 0);
    }

    #[test]
    fn test_total_throughput() {
        let mut info = SessionInfo::new(sess("resnet_50"));
        info.backend_throughputs.insert(NodeId(1), 50.0);
        info.backend_throughputs.insert(NodeId(2), 30.0);
        assert!((info.total_throughput() - 80.0).abs() < 1e-9);
    }
}
