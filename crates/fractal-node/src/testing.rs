//! Socket-free harness for driving node handlers in unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fractal_protocol::{Job, Message, MessageFactory, MessageKind, NodeInfo, Payload, Point, SequenceGenerator};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;

use crate::config::{ComputeConfig, JoinConfig};
use crate::log::EventLog;
use crate::membership::JoinState;
use crate::transport::{MessageHandler, Outbox};
use crate::worker::{WorkerNode, WorkerSettings};

pub const BOOTSTRAP_PORT: u16 = 8999;

pub fn node(id: i64) -> NodeInfo {
    NodeInfo::new(id, "127.0.0.1", 9000 + id as u16)
}

pub fn bootstrap() -> NodeInfo {
    NodeInfo::unassigned("127.0.0.1", BOOTSTRAP_PORT)
}

pub fn triangle() -> Job {
    Job {
        name: "sierpinski".to_string(),
        width: 600,
        height: 600,
        ratio: 0.5,
        point_count: 500,
        anchors: vec![Point::new(300, 0), Point::new(0, 600), Point::new(600, 600)],
    }
}

/// An [`Outbox`] that records envelopes instead of sending them.
///
/// Lets handler logic be driven without sockets. Receivers marked with
/// [`MemoryOutbox::fail_to`] make sends fail after being recorded.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    sent: StdMutex<Vec<(NodeInfo, Message)>>,
    unreachable: StdMutex<HashSet<String>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `node`'s address fail.
    pub fn fail_to(&self, node: &NodeInfo) {
        lock(&self.unreachable).insert(node.full_address());
    }

    /// Everything attempted so far, in order.
    pub fn sent(&self) -> Vec<(NodeInfo, Message)> {
        lock(&self.sent).clone()
    }

    /// Attempts of one kind.
    pub fn sent_of(&self, kind: MessageKind) -> Vec<(NodeInfo, Message)> {
        lock(&self.sent)
            .iter()
            .filter(|(_, msg)| msg.kind() == kind)
            .cloned()
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        lock(&self.sent).clear();
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn send(&self, to: &NodeInfo, msg: &Message) -> bool {
        lock(&self.sent).push((to.clone(), msg.clone()));
        !lock(&self.unreachable).contains(&to.full_address())
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TestWorker {
    pub node: Arc<WorkerNode>,
    pub outbox: Arc<MemoryOutbox>,
    me: NodeInfo,
    peers: MessageFactory,
    activity: Mutex<UnboundedReceiver<String>>,
    errors: Mutex<UnboundedReceiver<String>>,
}

impl TestWorker {
    pub fn settings() -> WorkerSettings {
        WorkerSettings {
            join: JoinConfig {
                timeout: Some(Duration::from_secs(1)),
                attempts: 1,
            },
            evict_on_quit: false,
            compute: ComputeConfig {
                batch: 32,
                interval: Duration::from_millis(5),
            },
        }
    }

    fn build(me: NodeInfo, settings: WorkerSettings) -> Self {
        let outbox = Arc::new(MemoryOutbox::new());
        let (log, activity, errors) = EventLog::detached();
        let node = WorkerNode::new(
            me.clone(),
            bootstrap(),
            outbox.clone(),
            MessageFactory::new(Arc::new(SequenceGenerator::new())),
            log,
            settings,
        );
        Self {
            node: Arc::new(node),
            outbox,
            me,
            peers: MessageFactory::new(Arc::new(SequenceGenerator::new())),
            activity: Mutex::new(activity),
            errors: Mutex::new(errors),
        }
    }

    /// A worker that has not hailed yet, listening on `port`.
    pub async fn unjoined(port: u16) -> Self {
        Self::build(NodeInfo::unassigned("127.0.0.1", port), Self::settings())
    }

    pub async fn unjoined_with_timeout(port: u16, timeout: Duration, attempts: u32) -> Self {
        let settings = WorkerSettings {
            join: JoinConfig {
                timeout: Some(timeout),
                attempts,
            },
            ..Self::settings()
        };
        Self::build(NodeInfo::unassigned("127.0.0.1", port), settings)
    }

    /// A member with id `id` that already knows `peers`.
    pub async fn member(id: i64, peers: &[i64]) -> Self {
        Self::member_with(id, peers, Self::settings()).await
    }

    pub async fn member_with(id: i64, peers: &[i64], settings: WorkerSettings) -> Self {
        let w = Self::build(node(id), settings);
        {
            let mut worker = w.node.table.lock().await;
            worker.assign_id(id);
            for &peer in peers {
                worker.update(node(peer));
            }
        }
        let mut entrance = w.node.entrance.lock().await;
        w.node.set_join_state(&mut entrance, JoinState::Member);
        drop(entrance);
        w
    }

    /// Put the worker in the state it has right after hailing.
    pub async fn expect_contact(&self) {
        let mut entrance = self.node.entrance.lock().await;
        self.node
            .set_join_state(&mut entrance, JoinState::AwaitingContact);
    }

    pub async fn wait_for_hail(&self) {
        for _ in 0..200 {
            if !self.outbox.sent_of(MessageKind::Hail).is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no Hail was sent");
    }

    /// An envelope from member `id` to this worker.
    pub fn from(&self, id: i64, body: Payload) -> Message {
        self.peers.envelope(&node(id), &self.me, body)
    }

    /// An envelope from an arbitrary node to this worker.
    pub fn from_node(&self, sender: &NodeInfo, body: Payload) -> Message {
        self.peers.envelope(sender, &self.me, body)
    }

    pub fn from_bootstrap(&self, body: Payload) -> Message {
        self.peers.envelope(&bootstrap(), &self.me, body)
    }

    /// A SystemKnock from a fresh node listening on `port`.
    pub fn newcomer_knock(&self, port: u16) -> Message {
        self.peers
            .system_knock(&NodeInfo::unassigned("127.0.0.1", port), &self.me)
    }

    pub async fn deliver(&self, msg: Message) {
        self.node.handle(msg).await;
    }

    pub async fn next_error(&self) -> String {
        let mut errors = self.errors.lock().await;
        tokio::time::timeout(Duration::from_secs(1), errors.recv())
            .await
            .expect("no error was logged")
            .expect("error log closed")
    }

    pub async fn drain_activity(&self) -> Vec<String> {
        let mut activity = self.activity.lock().await;
        let mut lines = Vec::new();
        while let Ok(line) = activity.try_recv() {
            lines.push(line);
        }
        lines
    }
}
