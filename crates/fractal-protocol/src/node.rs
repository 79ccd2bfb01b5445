//! Node identity model.
//!
//! A node is known to its peers by a [`NodeInfo`]: the id it was granted at
//! join time plus the address it listens on. Ids are handed out densely from
//! 0 by the current frontier node; `-1` marks "not assigned yet".

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A node's local replica of the membership table, keyed by node id.
pub type SystemInfo = BTreeMap<i64, NodeInfo>;

/// Address and id of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Assigned id, or [`NodeInfo::UNASSIGNED_ID`].
    pub id: i64,
    /// Host name or IP address.
    pub address: String,
    /// TCP port the node listens on.
    pub port: u16,
}

impl NodeInfo {
    /// Sentinel id: "unassigned / no such node yet".
    pub const UNASSIGNED_ID: i64 = -1;

    /// Create a node record with an explicit id.
    pub fn new(id: i64, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
        }
    }

    /// Create a node record that has not been granted an id yet.
    pub fn unassigned(address: impl Into<String>, port: u16) -> Self {
        Self::new(Self::UNASSIGNED_ID, address, port)
    }

    /// The "no such node" record (used as broadcast receiver and as the
    /// "you are first" contact).
    pub fn sentinel() -> Self {
        Self::unassigned("", 0)
    }

    /// Whether this record carries the sentinel id.
    pub fn is_unassigned(&self) -> bool {
        self.id == Self::UNASSIGNED_ID
    }

    /// `address:port`, suitable for dialing.
    pub fn full_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Whether this is the [`NodeInfo::sentinel`] record itself.
    pub fn is_sentinel(&self) -> bool {
        self.is_unassigned() && self.address.is_empty() && self.port == 0
    }

    /// Same address, different id.
    pub fn with_id(&self, id: i64) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}:{}", self.id, self.address, self.port)
    }
}

/// Capabilities shared by every node role.
pub trait NodeRole {
    /// This node's identity record.
    fn node_info(&self) -> &NodeInfo;

    /// Assigned id (`-1` if none).
    fn id(&self) -> i64 {
        self.node_info().id
    }

    /// Listen address.
    fn address(&self) -> &str {
        &self.node_info().address
    }

    /// Listen port.
    fn port(&self) -> u16 {
        self.node_info().port
    }
}

impl NodeRole for NodeInfo {
    fn node_info(&self) -> &NodeInfo {
        self
    }
}

/// The well-known rendezvous node.
///
/// `workers` is a best-effort registry fed by Join/Leave notifications. It
/// is not authoritative membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bootstrap {
    pub node: NodeInfo,
    pub workers: Vec<NodeInfo>,
}

impl Bootstrap {
    pub fn new(node: NodeInfo) -> Self {
        Self {
            node,
            workers: Vec::new(),
        }
    }

    /// Record a worker that joined. A previous record with the same id is replaced.
    pub fn register(&mut self, worker: NodeInfo) {
        self.workers.retain(|w| w.id != worker.id);
        self.workers.push(worker);
    }

    /// Forget a worker that left. Returns the removed record.
    pub fn deregister(&mut self, id: i64) -> Option<NodeInfo> {
        let index = self.workers.iter().position(|w| w.id == id)?;
        Some(self.workers.remove(index))
    }

    /// The registered worker with the highest id.
    pub fn latest(&self) -> Option<&NodeInfo> {
        self.workers.iter().max_by_key(|w| w.id)
    }
}

impl NodeRole for Bootstrap {
    fn node_info(&self) -> &NodeInfo {
        &self.node
    }
}

/// A cluster member and its view of the rest of the system.
///
/// Invariant: no two entries share an id. Once an id is assigned,
/// `system_info` holds an entry for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub node: NodeInfo,
    pub system_info: SystemInfo,
}

impl Worker {
    /// A fresh, unjoined worker listening on `address:port`.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            node: NodeInfo::unassigned(address, port),
            system_info: SystemInfo::new(),
        }
    }

    /// Whether this worker has been granted an id.
    pub fn is_member(&self) -> bool {
        !self.node.is_unassigned()
    }

    /// Take `id` as our own and record ourselves in the table.
    pub fn assign_id(&mut self, id: i64) -> NodeInfo {
        self.node.id = id;
        self.system_info.insert(id, self.node.clone());
        self.node.clone()
    }

    /// Highest id known to this worker, its own included.
    pub fn frontier_id(&self) -> i64 {
        self.system_info
            .keys()
            .copied()
            .fold(self.node.id, i64::max)
    }

    /// Every known member except ourselves.
    pub fn peers(&self) -> Vec<NodeInfo> {
        self.system_info
            .values()
            .filter(|n| n.id != self.node.id)
            .cloned()
            .collect()
    }

    /// Insert a newly announced member.
    ///
    /// An id that is already present is rejected and the existing record is
    /// returned untouched.
    pub fn admit(&mut self, node: NodeInfo) -> std::result::Result<(), NodeInfo> {
        if let Some(existing) = self.system_info.get(&node.id) {
            return Err(existing.clone());
        }
        self.system_info.insert(node.id, node);
        Ok(())
    }

    /// Insert or replace a member record. Returns the previous record.
    pub fn update(&mut self, node: NodeInfo) -> Option<NodeInfo> {
        self.system_info.insert(node.id, node)
    }

    /// Merge a membership snapshot received from another node.
    ///
    /// Entries we already have are kept; returns how many were added.
    pub fn merge(&mut self, snapshot: SystemInfo) -> usize {
        let mut added = 0;
        for (id, node) in snapshot {
            if let std::collections::btree_map::Entry::Vacant(slot) = self.system_info.entry(id) {
                slot.insert(node);
                added += 1;
            }
        }
        added
    }

    /// Drop a member from the table.
    pub fn evict(&mut self, id: i64) -> Option<NodeInfo> {
        if id == self.node.id {
            return None;
        }
        self.system_info.remove(&id)
    }
}

impl NodeRole for Worker {
    fn node_info(&self) -> &NodeInfo {
        &self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64) -> NodeInfo {
        NodeInfo::new(id, "127.0.0.1", 9000 + id as u16)
    }

    #[test]
    fn sentinel_is_unassigned() {
        assert!(NodeInfo::sentinel().is_unassigned());
        assert!(NodeInfo::sentinel().is_sentinel());
        assert!(!NodeInfo::unassigned("127.0.0.1", 9000).is_sentinel());
        assert!(!node(0).is_unassigned());
        assert_eq!(node(3).full_address(), "127.0.0.1:9003");
    }

    #[test]
    fn roles_share_capabilities() {
        let bootstrap = Bootstrap::new(NodeInfo::unassigned("10.0.0.1", 7000));
        let worker = Worker::new("10.0.0.2", 7001);

        let roles: [&dyn NodeRole; 2] = [&bootstrap, &worker];
        assert_eq!(roles[0].address(), "10.0.0.1");
        assert_eq!(roles[1].port(), 7001);
        assert_eq!(roles[1].id(), NodeInfo::UNASSIGNED_ID);
    }

    #[test]
    fn assign_id_records_self() {
        let mut worker = Worker::new("127.0.0.1", 9100);
        assert!(!worker.is_member());

        let me = worker.assign_id(4);
        assert_eq!(me.id, 4);
        assert!(worker.is_member());
        assert_eq!(worker.system_info.get(&4), Some(&me));
    }

    #[test]
    fn frontier_is_highest_known_id() {
        let mut worker = Worker::new("127.0.0.1", 9100);
        worker.assign_id(1);
        worker.admit(node(0)).unwrap();
        assert_eq!(worker.frontier_id(), 1);

        worker.admit(node(2)).unwrap();
        assert_eq!(worker.frontier_id(), 2);
    }

    #[test]
    fn admit_rejects_duplicate_ids() {
        let mut worker = Worker::new("127.0.0.1", 9100);
        worker.assign_id(0);

        assert!(worker.admit(node(5)).is_ok());
        let impostor = NodeInfo::new(5, "10.9.9.9", 1);
        let existing = worker.admit(impostor).unwrap_err();

        assert_eq!(existing, node(5));
        assert_eq!(worker.system_info.get(&5), Some(&node(5)));
        assert_eq!(worker.system_info.len(), 2);
    }

    #[test]
    fn merge_keeps_existing_entries() {
        let mut worker = Worker::new("127.0.0.1", 9100);
        worker.assign_id(2);

        let mut snapshot = SystemInfo::new();
        snapshot.insert(0, node(0));
        snapshot.insert(1, node(1));
        snapshot.insert(2, NodeInfo::new(2, "10.9.9.9", 1));

        assert_eq!(worker.merge(snapshot), 2);
        assert_eq!(worker.system_info.len(), 3);
        assert_eq!(worker.system_info[&2].port, 9100);
    }

    #[test]
    fn peers_exclude_self_and_evict_never_removes_self() {
        let mut worker = Worker::new("127.0.0.1", 9100);
        worker.assign_id(0);
        worker.admit(node(1)).unwrap();

        assert_eq!(worker.peers(), vec![node(1)]);
        assert_eq!(worker.evict(0), None);
        assert_eq!(worker.evict(1), Some(node(1)));
        assert!(worker.peers().is_empty());
    }

    #[test]
    fn bootstrap_registry() {
        let mut bootstrap = Bootstrap::new(NodeInfo::unassigned("127.0.0.1", 9000));
        assert!(bootstrap.latest().is_none());

        bootstrap.register(node(0));
        bootstrap.register(node(2));
        bootstrap.register(node(1));
        bootstrap.register(node(2));
        assert_eq!(bootstrap.workers.len(), 3);
        assert_eq!(bootstrap.latest(), Some(&node(2)));

        assert_eq!(bootstrap.deregister(2), Some(node(2)));
        assert_eq!(bootstrap.deregister(2), None);
        assert_eq!(bootstrap.latest(), Some(&node(1)));
    }
}
