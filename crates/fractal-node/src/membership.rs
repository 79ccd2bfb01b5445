//! Shared membership state of a worker.

use fractal_protocol::{Direction, NodeInfo, SystemInfo, Worker};
use tokio::sync::{Mutex, MutexGuard};

/// A worker's identity and membership table behind a single lock.
///
/// Anything that reads the table and then decides what to write (or what to
/// send) must keep the guard from [`MembershipTable::lock`] for the whole
/// window.
#[derive(Debug)]
pub struct MembershipTable {
    worker: Mutex<Worker>,
}

impl MembershipTable {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker: Mutex::new(worker),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Worker> {
        self.worker.lock().await
    }

    pub async fn me(&self) -> NodeInfo {
        self.worker.lock().await.node.clone()
    }

    pub async fn snapshot(&self) -> SystemInfo {
        self.worker.lock().await.system_info.clone()
    }

    pub async fn peers(&self) -> Vec<NodeInfo> {
        self.worker.lock().await.peers()
    }

    pub async fn get(&self, id: i64) -> Option<NodeInfo> {
        self.worker.lock().await.system_info.get(&id).cloned()
    }
}

/// Ring neighbours negotiated through ConnectionRequest/Response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingLinks {
    pub next: Option<NodeInfo>,
    pub prev: Option<NodeInfo>,
}

impl RingLinks {
    pub fn slot(&self, direction: Direction) -> Option<&NodeInfo> {
        match direction {
            Direction::Next => self.next.as_ref(),
            Direction::Prev => self.prev.as_ref(),
        }
    }

    pub fn set(&mut self, direction: Direction, node: NodeInfo) {
        match direction {
            Direction::Next => self.next = Some(node),
            Direction::Prev => self.prev = Some(node),
        }
    }

    /// Whether `node` may take the slot: it is free or already holds `node`.
    pub fn can_link(&self, direction: Direction, node: &NodeInfo) -> bool {
        self.slot(direction).map_or(true, |held| held.id == node.id)
    }

    /// Clear any slot that points at `id`. Returns whether something was cleared.
    pub fn unlink(&mut self, id: i64) -> bool {
        let mut cleared = false;
        for slot in [&mut self.next, &mut self.prev] {
            if slot.as_ref().is_some_and(|n| n.id == id) {
                *slot = None;
                cleared = true;
            }
        }
        cleared
    }
}

/// Where a worker is in the join protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Unjoined,
    AwaitingContact,
    AwaitingWelcome,
    Member,
}
