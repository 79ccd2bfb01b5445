//! The bootstrap service: rendezvous point for newcomers.
//!
//! The bootstrap never becomes a member. It points hailing workers at a
//! member to knock on and keeps a best-effort registry of who joined.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fractal_protocol::{Bootstrap, Job, Message, MessageFactory, NodeInfo, Payload, SequenceGenerator};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{load_jobs, split_host_port, NodeConfig};
use crate::error::Result;
use crate::log::EventLog;
use crate::service::Running;
use crate::transport::{Listener, MessageHandler, Outbox, TcpTransport};

#[derive(Debug)]
struct Registry {
    bootstrap: Bootstrap,
    /// The hailer told it was first and when, until its Join arrives.
    pending_first: Option<(NodeInfo, Instant)>,
}

impl Registry {
    /// Forget a first hailer that never followed up with Join.
    fn expire_pending_first(&mut self, ttl: Option<Duration>) -> Option<NodeInfo> {
        let ttl = ttl?;
        match &self.pending_first {
            Some((_, since)) if since.elapsed() >= ttl => {
                self.pending_first.take().map(|(first, _)| first)
            }
            _ => None,
        }
    }
}

pub struct BootstrapNode {
    registry: Mutex<Registry>,
    catalog: Mutex<Vec<Job>>,
    factory: MessageFactory,
    outbox: Arc<dyn Outbox>,
    log: EventLog,
    /// How long a first hailer may take to Join; `None` waits forever.
    first_join_timeout: Option<Duration>,
}

impl BootstrapNode {
    pub fn new(
        me: NodeInfo,
        catalog: Vec<Job>,
        outbox: Arc<dyn Outbox>,
        factory: MessageFactory,
        log: EventLog,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry {
                bootstrap: Bootstrap::new(me),
                pending_first: None,
            }),
            catalog: Mutex::new(catalog),
            factory,
            outbox,
            log,
            first_join_timeout: None,
        }
    }

    /// Give up on a first hailer that has not joined after `timeout`.
    pub fn with_first_join_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.first_join_timeout = timeout;
        self
    }

    /// Bind the listener and start serving.
    pub async fn spawn(config: &NodeConfig, log: EventLog) -> Result<Running<BootstrapNode>> {
        let catalog = match &config.jobs_file {
            Some(path) => load_jobs(path)?,
            None => Vec::new(),
        };
        let (host, _) = split_host_port(&config.listen_addr)?;

        let listener =
            Listener::bind(&config.listen_addr, config.transport.clone(), log.clone()).await?;
        let local_addr = listener.local_addr()?;

        let outbox = Arc::new(TcpTransport::new(config.transport.dial_timeout, log.clone()));
        let factory = MessageFactory::new(Arc::new(SequenceGenerator::new()));
        let node = Arc::new(
            BootstrapNode::new(
                NodeInfo::unassigned(host, local_addr.port()),
                catalog,
                outbox,
                factory,
                log,
            )
            .with_first_join_timeout(config.join.timeout),
        );

        node.log
            .activity(format!("bootstrap listening on {local_addr}"));
        let handle = listener.spawn(Arc::clone(&node));
        Ok(Running::new(node, handle, local_addr))
    }

    pub async fn me(&self) -> NodeInfo {
        self.registry.lock().await.bootstrap.node.clone()
    }

    /// Workers that announced Join and have not left.
    pub async fn workers(&self) -> Vec<NodeInfo> {
        self.registry.lock().await.bootstrap.workers.clone()
    }

    pub async fn add_job(&self, job: Job) {
        let mut catalog = self.catalog.lock().await;
        catalog.retain(|j| j.name != job.name);
        catalog.push(job);
    }

    async fn on_hail(&self, msg: &Message) {
        let (me, contact) = {
            let mut registry = self.registry.lock().await;
            let me = registry.bootstrap.node.clone();
            if let Some(stale) = registry.expire_pending_first(self.first_join_timeout) {
                self.log
                    .error(format!("{stale} never joined; the next hailer goes first"));
            }
            let contact = if let Some(latest) = registry.bootstrap.latest() {
                latest.clone()
            } else {
                match &registry.pending_first {
                    Some((first, _)) if first.full_address() != msg.sender.full_address() => {
                        first.clone()
                    }
                    // Nobody pending yet, or the first hailer asking again.
                    _ => {
                        registry.pending_first = Some((msg.sender.with_id(0), Instant::now()));
                        NodeInfo::sentinel()
                    }
                }
            };
            (me, contact)
        };

        if contact.is_unassigned() {
            self.log
                .activity(format!("{} is the first node", msg.sender));
        } else {
            self.log
                .activity(format!("pointing {} at {contact}", msg.sender));
        }

        let reply = self.factory.contact(&me, &msg.sender, &contact);
        if !self.outbox.send(&msg.sender, &reply).await {
            self.log
                .error(format!("Contact for {} failed", msg.sender));
        }
    }

    async fn on_join(&self, msg: &Message, id: i64) {
        let mut registry = self.registry.lock().await;
        let worker = msg.sender.with_id(id);
        if registry
            .pending_first
            .as_ref()
            .is_some_and(|(first, _)| first.full_address() == worker.full_address())
        {
            registry.pending_first = None;
        }
        self.log.activity(format!("{worker} joined"));
        registry.bootstrap.register(worker);
    }

    async fn on_leave(&self, id: i64) {
        match self.registry.lock().await.bootstrap.deregister(id) {
            Some(worker) => self.log.activity(format!("{worker} left")),
            None => self.log.error(format!("Leave from unknown worker #{id}")),
        }
    }

    async fn on_ask_for_job(&self, msg: &Message) {
        let me = self.me().await;
        let jobs = self.catalog.lock().await.clone();
        for job in &jobs {
            let reply = self.factory.job_sharing(&me, &msg.sender, job);
            if !self.outbox.send(&msg.sender, &reply).await {
                self.log
                    .error(format!("JobSharing {} to {} failed", job.name, msg.sender));
            }
        }
    }
}

#[async_trait]
impl MessageHandler for BootstrapNode {
    async fn handle(&self, msg: Message) {
        self.log.activity(format!("recv {msg}"));

        match &msg.body {
            Payload::Hail => self.on_hail(&msg).await,
            Payload::Join { id } => self.on_join(&msg, *id).await,
            Payload::Leave { id } => self.on_leave(*id).await,
            Payload::AskForJob => self.on_ask_for_job(&msg).await,
            Payload::Info { text } | Payload::InfoBroadcast { text } => {
                self.log.activity(format!("{} says: {text}", msg.sender))
            }
            _ => self
                .log
                .error(format!("bootstrap does not handle {}, discarding {msg}", msg.kind())),
        }
    }
}
