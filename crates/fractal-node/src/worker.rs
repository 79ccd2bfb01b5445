//! The worker service: a cluster member.

use std::sync::Arc;

use async_trait::async_trait;
use fractal_protocol::{
    Job, JobStatus, Message, MessageFactory, NodeInfo, Payload, SequenceGenerator, SystemInfo,
    Worker,
};
use tokio::sync::{watch, Mutex};

use crate::cluster::{ClusterView, JobBook};
use crate::config::{load_jobs, split_host_port, ComputeConfig, JoinConfig, NodeConfig};
use crate::error::{Error, Result};
use crate::log::EventLog;
use crate::membership::{JoinState, MembershipTable, RingLinks};
use crate::service::Running;
use crate::transport::{Listener, MessageHandler, Outbox, TcpTransport};

/// Worker behaviour knobs.
#[derive(Debug, Clone, Default)]
pub struct WorkerSettings {
    pub join: JoinConfig,
    /// Remove a member from the table when it announces Quit.
    pub evict_on_quit: bool,
    pub compute: ComputeConfig,
}

impl From<&NodeConfig> for WorkerSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            join: config.join.clone(),
            evict_on_quit: config.evict_on_quit,
            compute: config.compute.clone(),
        }
    }
}

/// A cluster member and everything it shares between connection handlers.
pub struct WorkerNode {
    pub(crate) table: MembershipTable,
    pub(crate) ring: Mutex<RingLinks>,
    pub(crate) entrance: Mutex<JoinState>,
    pub(crate) joined: watch::Sender<JoinState>,
    pub(crate) bootstrap: NodeInfo,
    pub(crate) factory: MessageFactory,
    pub(crate) outbox: Arc<dyn Outbox>,
    pub(crate) log: EventLog,
    pub(crate) jobs: JobBook,
    pub(crate) settings: WorkerSettings,
}

impl WorkerNode {
    /// An unjoined worker advertising `me` (whose id is ignored).
    pub fn new(
        me: NodeInfo,
        bootstrap: NodeInfo,
        outbox: Arc<dyn Outbox>,
        factory: MessageFactory,
        log: EventLog,
        settings: WorkerSettings,
    ) -> Self {
        let (joined, _) = watch::channel(JoinState::Unjoined);
        Self {
            table: MembershipTable::new(Worker::new(me.address, me.port)),
            ring: Mutex::new(RingLinks::default()),
            entrance: Mutex::new(JoinState::Unjoined),
            joined,
            bootstrap,
            factory,
            outbox,
            log,
            jobs: JobBook::default(),
            settings,
        }
    }

    /// Bind the listener, load the job catalog and start serving.
    ///
    /// The worker is not joined yet; call [`WorkerNode::join`].
    pub async fn spawn(config: &NodeConfig, log: EventLog) -> Result<Running<WorkerNode>> {
        let jobs = match &config.jobs_file {
            Some(path) => load_jobs(path)?,
            None => Vec::new(),
        };
        let (host, _) = split_host_port(&config.listen_addr)?;
        let bootstrap = config.bootstrap_node()?;

        let listener =
            Listener::bind(&config.listen_addr, config.transport.clone(), log.clone()).await?;
        let local_addr = listener.local_addr()?;

        let outbox = Arc::new(TcpTransport::new(config.transport.dial_timeout, log.clone()));
        let factory = MessageFactory::new(Arc::new(SequenceGenerator::new()));
        let node = Arc::new(WorkerNode::new(
            NodeInfo::unassigned(host, local_addr.port()),
            bootstrap,
            outbox,
            factory,
            log,
            WorkerSettings::from(config),
        ));
        for job in jobs {
            node.jobs.add(job).await;
        }

        node.log
            .activity(format!("worker listening on {local_addr}"));
        let handle = listener.spawn(Arc::clone(&node));
        Ok(Running::new(node, handle, local_addr))
    }

    pub async fn me(&self) -> NodeInfo {
        self.table.me().await
    }

    pub async fn system_info(&self) -> SystemInfo {
        self.table.snapshot().await
    }

    pub async fn ring(&self) -> RingLinks {
        self.ring.lock().await.clone()
    }

    pub fn join_state(&self) -> JoinState {
        *self.joined.borrow()
    }

    pub fn bootstrap(&self) -> &NodeInfo {
        &self.bootstrap
    }

    pub async fn catalog(&self) -> Vec<Job> {
        self.jobs.catalog().await
    }

    pub async fn cluster(&self, job_name: &str) -> Option<ClusterView> {
        self.jobs.cluster(job_name).await
    }

    /// JobStatus replies received so far.
    pub async fn statuses(&self) -> Vec<JobStatus> {
        self.jobs.statuses().await
    }

    /// Points reported by other members for `job_name`.
    pub async fn collected(&self, job_name: &str) -> Vec<fractal_protocol::Point> {
        self.jobs.collected(job_name).await
    }

    async fn member(&self) -> Result<NodeInfo> {
        let me = self.table.me().await;
        if me.is_unassigned() {
            return Err(Error::NotMember);
        }
        Ok(me)
    }

    /// Send an arbitrary payload from this node to `to`.
    pub async fn send_to(&self, to: &NodeInfo, body: Payload) -> bool {
        let me = self.table.me().await;
        let msg = self.factory.envelope(&me, to, body);
        self.outbox.send(to, &msg).await
    }

    /// Broadcast Quit to every peer and Leave to the bootstrap.
    pub async fn leave(&self) -> Result<bool> {
        let me = self.member().await?;
        let peers = self.table.peers().await;
        let quit = self.factory.quit(&me);
        let reached_peers = self.outbox.broadcast(&peers, &quit).await;
        let leave = self.factory.leave(&me, &self.bootstrap);
        let reached_bootstrap = self.outbox.send(&self.bootstrap, &leave).await;
        self.log.activity(format!("{me} left the system"));
        Ok(reached_peers && reached_bootstrap)
    }

    /// Add a job locally and send it to every peer.
    pub async fn share_job(&self, job: Job) -> Result<bool> {
        let me = self.member().await?;
        self.jobs.add(job.clone()).await;
        let mut delivered = true;
        for peer in self.table.peers().await {
            let msg = self.factory.job_sharing(&me, &peer, &job);
            delivered &= self.outbox.send(&peer, &msg).await;
        }
        Ok(delivered)
    }

    /// Ask `member` to admit us to its cluster for `job_name`.
    pub async fn approach(&self, member: &NodeInfo, job_name: &str) -> Result<bool> {
        let me = self.member().await?;
        let msg = self.factory.approach_cluster(&me, member, job_name, &me);
        Ok(self.outbox.send(member, &msg).await)
    }

    /// Ask every peer for the status of its jobs; replies land in [`WorkerNode::statuses`].
    pub async fn request_status(&self) -> Result<bool> {
        let me = self.member().await?;
        let mut delivered = true;
        for peer in self.table.peers().await {
            let msg = self.factory.job_status_request(&me, &peer);
            delivered &= self.outbox.send(&peer, &msg).await;
        }
        Ok(delivered)
    }

    /// Ask every other member of our `job_name` cluster for its points.
    pub async fn request_image(&self, job_name: &str) -> Result<bool> {
        let me = self.member().await?;
        let view = self
            .jobs
            .cluster(job_name)
            .await
            .ok_or_else(|| Error::UnknownJob(job_name.to_string()))?;
        let mut delivered = true;
        for member in view.roster.iter().filter(|m| m.node.id != me.id) {
            let msg = self.factory.image_info_request(&me, &member.node, job_name);
            delivered &= self.outbox.send(&member.node, &msg).await;
        }
        Ok(delivered)
    }

    /// Tell `member` to stop working on `job_name` and hand back its points.
    pub async fn stop_member(&self, member: &NodeInfo, job_name: &str) -> Result<bool> {
        let me = self.member().await?;
        let msg = self.factory.stop_share_job(&me, member, job_name);
        Ok(self.outbox.send(member, &msg).await)
    }

    /// Ask the bootstrap for its job catalog.
    pub async fn ask_for_jobs(&self) -> bool {
        let me = self.table.me().await;
        let msg = self.factory.ask_for_job(&me, &self.bootstrap);
        self.outbox.send(&self.bootstrap, &msg).await
    }

    /// Broadcast free text to every peer.
    pub async fn announce(&self, text: &str) -> Result<bool> {
        let me = self.member().await?;
        let msg = self.factory.info_broadcast(&me, text);
        Ok(self.outbox.broadcast(&self.table.peers().await, &msg).await)
    }

    /// Re-announce our own record to every peer.
    pub async fn publish_update(&self) -> Result<bool> {
        let me = self.member().await?;
        let msg = self.factory.updated_node(&me, &me);
        Ok(self.outbox.broadcast(&self.table.peers().await, &msg).await)
    }

    /// Drop all job state here and on every peer.
    pub async fn purge_all(&self) -> Result<bool> {
        let me = self.member().await?;
        self.purge_jobs().await;
        let msg = self.factory.purge(&me);
        Ok(self.outbox.broadcast(&self.table.peers().await, &msg).await)
    }

    async fn on_updated_node(&self, node: &NodeInfo) {
        let mut worker = self.table.lock().await;
        if node.id == worker.node.id {
            return;
        }
        match worker.update(node.clone()) {
            Some(previous) if previous != *node => self
                .log
                .activity(format!("#{} moved from {previous} to {node}", node.id)),
            Some(_) => {}
            None => self.log.activity(format!("learned about {node}")),
        }
    }

    async fn on_quit(&self, msg: &Message, id: i64) {
        let mut worker = self.table.lock().await;
        // A newcomer handing back an id we granted but it never took.
        let declined = msg.sender.id != id
            && worker
                .system_info
                .get(&id)
                .is_some_and(|granted| granted.full_address() == msg.sender.full_address());
        if !declined && !self.settings.evict_on_quit {
            drop(worker);
            self.log.activity(format!("#{id} quit"));
            return;
        }
        let evicted = worker.evict(id);
        drop(worker);
        self.ring.lock().await.unlink(id);
        match evicted {
            Some(node) if declined => self
                .log
                .activity(format!("{node} was declined by {} and withdrawn", msg.sender)),
            Some(node) => self.log.activity(format!("{node} quit and was evicted")),
            None => self.log.activity(format!("#{id} quit (not in table)")),
        }
    }
}

#[async_trait]
impl MessageHandler for WorkerNode {
    async fn handle(&self, msg: Message) {
        self.log.activity(format!("recv {msg}"));

        match &msg.body {
            Payload::Contact(contact) => self.on_contact(contact).await,
            Payload::SystemKnock => self.on_system_knock(&msg).await,
            Payload::Welcome {
                assigned_id,
                system_info,
            } => {
                self.on_welcome(&msg, *assigned_id, system_info.clone())
                    .await
            }
            Payload::Entered(node) => self.on_entered(node).await,
            Payload::ConnectionRequest { direction } => {
                self.on_connection_request(&msg, *direction).await
            }
            Payload::ConnectionResponse {
                accepted,
                direction,
            } => {
                self.on_connection_response(&msg, *accepted, *direction)
                    .await
            }

            Payload::UpdatedNode(node) => self.on_updated_node(node).await,
            Payload::Quit { id } => self.on_quit(&msg, *id).await,
            Payload::Purge => self.purge_jobs().await,
            Payload::Info { text } | Payload::InfoBroadcast { text } => {
                self.log.activity(format!("{} says: {text}", msg.sender))
            }

            Payload::JobSharing(job) => self.on_job_sharing(job.clone()).await,
            Payload::StartJobGenesis { job_name } => self.on_start_genesis(job_name).await,
            Payload::StartJob { job_name } => self.on_start_job(job_name).await,
            Payload::ClusterKnock { job_name } => {
                self.admit_to_cluster(&msg, job_name, &msg.sender, false)
                    .await
            }
            Payload::ApproachCluster { job_name, contact } => {
                self.admit_to_cluster(&msg, job_name, contact, true).await
            }
            Payload::ClusterWelcome {
                fractal_id,
                job_name,
                roster,
            } => {
                self.on_cluster_welcome(&msg, fractal_id, job_name, roster.clone())
                    .await
            }
            Payload::EnterCluster { job_name, member } => {
                self.on_enter_cluster(job_name, member).await
            }
            Payload::ExitCluster { job_name, member } => {
                self.on_exit_cluster(job_name, member).await
            }
            Payload::ClusterConnectionRequest { job_name } => {
                self.on_cluster_connection_request(&msg, job_name).await
            }
            Payload::ClusterConnectionResponse { job_name, accepted } => {
                self.on_cluster_connection_response(&msg, job_name, *accepted)
                    .await
            }
            Payload::ImageInfoRequest { job_name } => {
                self.on_image_info_request(&msg, job_name).await
            }
            Payload::ImageInfo { job_name, points }
            | Payload::StoppedJobInfo { job_name, points } => {
                self.collect_points(job_name, points).await
            }
            Payload::StopShareJob { job_name } => self.on_stop_share_job(&msg, job_name).await,
            Payload::JobStatusRequest => self.on_job_status_request(&msg).await,
            Payload::JobStatus(status) => self.on_job_status(status).await,
            Payload::AskForJob => self.on_ask_for_job(&msg).await,

            Payload::Hail | Payload::Join { .. } | Payload::Leave { .. } => self
                .log
                .error(format!("{} is for the bootstrap, discarding {msg}", msg.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::testing::{node, triangle, TestWorker};
    use fractal_protocol::MessageKind;

    #[tokio::test]
    async fn updated_node_replaces_entry() {
        let w = TestWorker::member(0, &[3]).await;
        let moved = NodeInfo::new(3, "10.0.0.3", 7003);
        w.deliver(w.from(3, Payload::UpdatedNode(moved.clone()))).await;
        assert_eq!(w.node.system_info().await[&3], moved);

        // Our own record is never overwritten by gossip.
        w.deliver(w.from(3, Payload::UpdatedNode(NodeInfo::new(0, "10.0.0.9", 1))))
            .await;
        assert_eq!(w.node.me().await, node(0));
    }

    #[tokio::test]
    async fn quit_is_logged_but_kept_by_default() {
        let w = TestWorker::member(0, &[1]).await;
        w.deliver(w.from(1, Payload::Quit { id: 1 })).await;
        assert!(w.node.system_info().await.contains_key(&1));
    }

    #[tokio::test]
    async fn quit_evicts_when_configured() {
        let settings = WorkerSettings {
            evict_on_quit: true,
            ..TestWorker::settings()
        };
        let w = TestWorker::member_with(0, &[1, 2], settings).await;
        w.deliver(w.from(1, Payload::ConnectionRequest {
            direction: fractal_protocol::Direction::Prev,
        }))
        .await;
        assert_eq!(w.node.ring().await.next, Some(node(1)));

        w.deliver(w.from(1, Payload::Quit { id: 1 })).await;
        let table = w.node.system_info().await;
        assert!(!table.contains_key(&1));
        assert!(table.contains_key(&2));
        assert_eq!(w.node.ring().await.next, None);

        // Quit carrying our own id never removes us.
        w.deliver(w.from(2, Payload::Quit { id: 0 })).await;
        assert!(w.node.system_info().await.contains_key(&0));
    }

    #[tokio::test]
    async fn handed_back_grant_is_withdrawn_without_evict_on_quit() {
        let w = TestWorker::member(2, &[0, 1]).await;
        w.deliver(w.newcomer_knock(9200)).await;
        assert_eq!(w.node.system_info().await[&3].port, 9200);

        // Someone else cannot withdraw #1 on its behalf.
        let holder = NodeInfo::new(5, "127.0.0.1", 9200);
        w.deliver(w.from_node(&holder, Payload::Quit { id: 1 })).await;
        assert!(w.node.system_info().await.contains_key(&1));

        w.deliver(w.from_node(&holder, Payload::Quit { id: 3 })).await;
        let table = w.node.system_info().await;
        assert!(!table.contains_key(&3));
        assert_eq!(table.len(), 3);
    }

    #[tokio::test]
    async fn bootstrap_kinds_are_discarded() {
        let w = TestWorker::member(0, &[1]).await;
        w.deliver(w.from(1, Payload::Hail)).await;
        assert!(w.outbox.sent().is_empty());
        assert!(w.next_error().await.contains("is for the bootstrap"));
    }

    #[tokio::test]
    async fn leave_announces_quit_and_informs_bootstrap() {
        let w = TestWorker::member(2, &[0, 1]).await;
        w.outbox.fail_to(&node(0));

        assert!(!w.node.leave().await.unwrap());
        let quits: Vec<i64> = w
            .outbox
            .sent_of(MessageKind::Quit)
            .iter()
            .map(|(to, _)| to.id)
            .collect();
        assert_eq!(quits, vec![0, 1]);
        assert_eq!(w.outbox.sent_of(MessageKind::Leave).len(), 1);
    }

    #[tokio::test]
    async fn api_requires_membership() {
        let w = TestWorker::unjoined(9100).await;
        assert!(matches!(w.node.leave().await, Err(Error::NotMember)));
        assert!(matches!(w.node.share_job(triangle()).await, Err(Error::NotMember)));
        assert!(matches!(
            w.node.start_genesis("sierpinski").await,
            Err(Error::NotMember)
        ));
    }

    #[tokio::test]
    async fn shared_jobs_reach_peers_and_catalog() {
        let w = TestWorker::member(0, &[1, 2]).await;
        assert!(w.node.share_job(triangle()).await.unwrap());
        assert_eq!(w.outbox.sent_of(MessageKind::JobSharing).len(), 2);
        assert_eq!(w.node.catalog().await, vec![triangle()]);
    }

    #[tokio::test]
    async fn maintenance_broadcasts() {
        let w = TestWorker::member(0, &[1, 2]).await;
        assert!(w.node.announce("hello").await.unwrap());
        assert!(w.node.publish_update().await.unwrap());
        assert!(w.node.purge_all().await.unwrap());
        assert!(w.node.request_status().await.unwrap());

        for kind in [
            MessageKind::InfoBroadcast,
            MessageKind::UpdatedNode,
            MessageKind::Purge,
            MessageKind::JobStatusRequest,
        ] {
            assert_eq!(w.outbox.sent_of(kind).len(), 2, "{kind}");
        }
    }

    #[tokio::test]
    async fn spawn_binds_an_ephemeral_port() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = dir.path().join("jobs.json");
        std::fs::write(&jobs, serde_json::to_string(&vec![triangle()]).unwrap()).unwrap();

        let config = NodeConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            jobs_file: Some(jobs),
            transport: TransportConfig {
                accept_timeout: std::time::Duration::from_millis(50),
                ..TransportConfig::default()
            },
            ..NodeConfig::default()
        };
        let running = WorkerNode::spawn(&config, EventLog::silent()).await.unwrap();
        let me = running.node().me().await;
        assert_ne!(me.port, 0);
        assert_eq!(me.port, running.local_addr().port());
        assert_eq!(running.node().catalog().await.len(), 1);
        running.stop().await;
    }
}
