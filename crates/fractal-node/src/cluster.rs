//! Job clusters: formation, job sharing and result reporting.
//!
//! A cluster is the set of members working on one job. Each member holds a
//! fractal address in base `job.branching()`; the member with the highest
//! address is the cluster frontier and the only one that admits newcomers,
//! mirroring how the membership frontier hands out node ids.

use std::collections::BTreeMap;
use std::sync::Arc;

use fractal_numeral::{edit_distance, Numeral};
use fractal_protocol::{ClusterMember, Job, JobStatus, Message, NodeInfo, Point};
use futures::future::join_all;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::chaos::{spawn_compute, ChaosGame, GENESIS_ADDRESS};
use crate::config::ComputeConfig;
use crate::error::{Error, Result};
use crate::worker::WorkerNode;

/// Everything a worker knows about jobs.
#[derive(Debug, Default)]
pub struct JobBook {
    inner: Mutex<Jobs>,
}

#[derive(Debug, Default)]
pub(crate) struct Jobs {
    catalog: BTreeMap<String, Job>,
    clusters: BTreeMap<String, ClusterState>,
    statuses: BTreeMap<(String, String), JobStatus>,
    collected: BTreeMap<String, Vec<Point>>,
}

impl JobBook {
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Jobs> {
        self.inner.lock().await
    }

    /// Add a job to the catalog, replacing one with the same name.
    pub async fn add(&self, job: Job) -> bool {
        self.inner
            .lock()
            .await
            .catalog
            .insert(job.name.clone(), job)
            .is_some()
    }

    pub async fn catalog(&self) -> Vec<Job> {
        self.inner.lock().await.catalog.values().cloned().collect()
    }

    pub async fn cluster(&self, job_name: &str) -> Option<ClusterView> {
        let jobs = self.inner.lock().await;
        let cluster = jobs.clusters.get(job_name)?;
        Some(cluster.view().await)
    }

    pub async fn statuses(&self) -> Vec<JobStatus> {
        self.inner.lock().await.statuses.values().cloned().collect()
    }

    pub async fn collected(&self, job_name: &str) -> Vec<Point> {
        self.inner
            .lock()
            .await
            .collected
            .get(job_name)
            .cloned()
            .unwrap_or_default()
    }
}

/// This member's share of one job.
#[derive(Debug)]
pub(crate) struct ClusterState {
    job: Job,
    numeral: Numeral,
    fractal_id: String,
    roster: Vec<ClusterMember>,
    links: Vec<NodeInfo>,
    points: Arc<Mutex<Vec<Point>>>,
    stop: watch::Sender<bool>,
}

impl ClusterState {
    /// Take `fractal_id` in the job's cluster and start computing.
    fn start(
        job: Job,
        fractal_id: &str,
        roster: Vec<ClusterMember>,
        compute: &ComputeConfig,
    ) -> Result<Self> {
        let numeral = Numeral::new(job.branching())?;
        let game = ChaosGame::new(&job, fractal_id)?;
        let points = Arc::new(Mutex::new(Vec::new()));
        let (stop, stop_rx) = watch::channel(false);
        spawn_compute(
            game,
            job.point_count,
            Arc::clone(&points),
            compute.clone(),
            stop_rx,
        );

        Ok(Self {
            job,
            numeral,
            fractal_id: fractal_id.to_string(),
            roster,
            links: Vec::new(),
            points,
            stop,
        })
    }

    /// Member with the highest fractal address.
    fn frontier(&self) -> Option<&ClusterMember> {
        self.roster
            .iter()
            .max_by(|a, b| self.numeral.compare(&a.fractal_id, &b.fractal_id))
    }

    /// Roster member closest to our own address, ourselves excluded.
    fn nearest(&self, me: i64) -> Option<&ClusterMember> {
        self.roster
            .iter()
            .filter(|m| m.node.id != me)
            .min_by_key(|m| edit_distance(&self.fractal_id, &m.fractal_id))
    }

    fn link(&mut self, node: &NodeInfo) {
        if !self.links.iter().any(|n| n.id == node.id) {
            self.links.push(node.clone());
        }
    }

    fn halt(&self) {
        let _ = self.stop.send(true);
    }

    async fn status(&self) -> JobStatus {
        JobStatus {
            job_name: self.job.name.clone(),
            fractal_id: self.fractal_id.clone(),
            points_computed: self.points.lock().await.len() as u64,
            cluster_size: self.roster.len() as u32,
        }
    }

    async fn view(&self) -> ClusterView {
        ClusterView {
            job_name: self.job.name.clone(),
            fractal_id: self.fractal_id.clone(),
            roster: self.roster.clone(),
            links: self.links.clone(),
            points_computed: self.points.lock().await.len() as u64,
        }
    }
}

/// Read-only snapshot of a cluster membership.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterView {
    pub job_name: String,
    pub fractal_id: String,
    pub roster: Vec<ClusterMember>,
    pub links: Vec<NodeInfo>,
    pub points_computed: u64,
}

impl WorkerNode {
    pub(crate) async fn on_job_sharing(&self, job: Job) {
        let name = job.name.clone();
        if self.jobs.add(job).await {
            self.log.activity(format!("job {name} replaced"));
        } else {
            self.log.activity(format!("job {name} added"));
        }
    }

    /// Seed a new cluster for `job_name` with this node at the genesis address.
    pub async fn start_genesis(&self, job_name: &str) -> Result<()> {
        let me = self.table.me().await;
        if me.is_unassigned() {
            return Err(Error::NotMember);
        }

        let mut jobs = self.jobs.lock().await;
        if jobs.clusters.contains_key(job_name) {
            return Err(Error::InvalidJob(format!("{job_name} is already running here")));
        }
        let job = jobs
            .catalog
            .get(job_name)
            .cloned()
            .ok_or_else(|| Error::UnknownJob(job_name.to_string()))?;

        let roster = vec![ClusterMember::new(GENESIS_ADDRESS, me)];
        let cluster = ClusterState::start(job, GENESIS_ADDRESS, roster, &self.settings.compute)?;
        jobs.clusters.insert(job_name.to_string(), cluster);
        self.log
            .activity(format!("seeded cluster for {job_name} at {GENESIS_ADDRESS}"));
        Ok(())
    }

    /// Ask every peer to let us into the running cluster for `job_name`.
    pub async fn start_job(&self, job_name: &str) -> Result<()> {
        let me = self.table.me().await;
        if me.is_unassigned() {
            return Err(Error::NotMember);
        }
        {
            let jobs = self.jobs.lock().await;
            if !jobs.catalog.contains_key(job_name) {
                return Err(Error::UnknownJob(job_name.to_string()));
            }
            if jobs.clusters.contains_key(job_name) {
                return Err(Error::InvalidJob(format!("{job_name} is already running here")));
            }
        }

        let peers = self.table.peers().await;
        let knocks = peers.iter().map(|peer| {
            let knock = self.factory.cluster_knock(&me, peer, job_name);
            async move { self.outbox.send(peer, &knock).await }
        });
        let delivered = join_all(knocks).await.into_iter().filter(|ok| *ok).count();
        self.log.activity(format!(
            "knocked on {delivered}/{} peers for {job_name}",
            peers.len()
        ));
        Ok(())
    }

    pub(crate) async fn on_start_genesis(&self, job_name: &str) {
        if let Err(e) = self.start_genesis(job_name).await {
            self.log.error(format!("cannot seed {job_name}: {e}"));
        }
    }

    pub(crate) async fn on_start_job(&self, job_name: &str) {
        if let Err(e) = self.start_job(job_name).await {
            self.log.error(format!("cannot start {job_name}: {e}"));
        }
    }

    /// Handle a ClusterKnock (`approach == false`) or an ApproachCluster.
    ///
    /// Non-frontier members relay the envelope to the frontier. The frontier
    /// grants the next address while holding the job book, so two newcomers
    /// never receive the same address from it.
    pub(crate) async fn admit_to_cluster(
        &self,
        msg: &Message,
        job_name: &str,
        newcomer: &NodeInfo,
        approach: bool,
    ) {
        let me = self.table.me().await;
        let mut jobs = self.jobs.lock().await;

        let Some(cluster) = jobs.clusters.get_mut(job_name) else {
            if approach {
                self.log
                    .error(format!("approach for {job_name} but not in its cluster: {msg}"));
            } else {
                tracing::debug!("ignoring knock for {job_name}: not a member");
            }
            return;
        };

        if cluster.roster.iter().any(|m| m.node.id == newcomer.id) {
            tracing::debug!("{newcomer} is already in the {job_name} cluster");
            return;
        }

        let Some(frontier) = cluster.frontier().cloned() else {
            self.log.error(format!("cluster for {job_name} has an empty roster"));
            return;
        };

        if frontier.node.id != me.id {
            let relayed = msg.make_me_a_sender(&me);
            self.log.activity(format!(
                "relaying {} for {job_name} to cluster frontier {}",
                msg.kind(),
                frontier.node
            ));
            if !self.outbox.send(&frontier.node, &relayed).await {
                self.log
                    .error(format!("could not relay {msg} to {}", frontier.node));
            }
            return;
        }

        let address = match cluster.numeral.successor(&frontier.fractal_id) {
            Ok(address) => address,
            Err(e) => {
                self.log.error(format!("no address after {}: {e}", frontier.fractal_id));
                return;
            }
        };

        let member = ClusterMember::new(address.clone(), newcomer.clone());
        let others: Vec<NodeInfo> = cluster
            .roster
            .iter()
            .filter(|m| m.node.id != me.id)
            .map(|m| m.node.clone())
            .collect();
        cluster.roster.push(member.clone());

        let welcome =
            self.factory
                .cluster_welcome(&me, newcomer, &address, job_name, cluster.roster.clone());
        if !self.outbox.send(newcomer, &welcome).await {
            self.log
                .error(format!("ClusterWelcome to {newcomer} failed; withdrawing {address}"));
            cluster.roster.retain(|m| m.fractal_id != address);
            return;
        }
        self.log
            .activity(format!("admitted {newcomer} to {job_name} at {address}"));

        let announcements = others.iter().map(|peer| {
            let enter = self.factory.enter_cluster(&me, peer, job_name, &member);
            async move { self.outbox.send(peer, &enter).await }
        });
        if !join_all(announcements).await.into_iter().all(|ok| ok) {
            self.log
                .error(format!("EnterCluster for {address} did not reach every member"));
        }
    }

    pub(crate) async fn on_cluster_welcome(
        &self,
        msg: &Message,
        fractal_id: &str,
        job_name: &str,
        roster: Vec<ClusterMember>,
    ) {
        let me = self.table.me().await;
        let nearest = {
            let mut jobs = self.jobs.lock().await;
            if jobs.clusters.contains_key(job_name) {
                self.log
                    .error(format!("duplicate ClusterWelcome for {job_name}: {msg}"));
                return;
            }
            let Some(job) = jobs.catalog.get(job_name).cloned() else {
                self.log
                    .error(format!("ClusterWelcome for unknown job {job_name}"));
                return;
            };

            let cluster =
                match ClusterState::start(job, fractal_id, roster, &self.settings.compute) {
                    Ok(cluster) => cluster,
                    Err(e) => {
                        self.log.error(format!("cannot join {job_name}: {e}"));
                        return;
                    }
                };
            let nearest = cluster.nearest(me.id).map(|m| m.node.clone());
            jobs.clusters.insert(job_name.to_string(), cluster);
            nearest
        };

        self.log
            .activity(format!("joined {job_name} cluster at {fractal_id}"));

        if let Some(peer) = nearest {
            let request = self.factory.cluster_connection_request(&me, &peer, job_name);
            if !self.outbox.send(&peer, &request).await {
                self.log
                    .error(format!("cluster link request to {peer} failed"));
            }
        }
    }

    pub(crate) async fn on_enter_cluster(&self, job_name: &str, member: &ClusterMember) {
        let mut jobs = self.jobs.lock().await;
        let Some(cluster) = jobs.clusters.get_mut(job_name) else {
            self.log
                .error(format!("EnterCluster for {job_name} but not in its cluster"));
            return;
        };
        if let Some(existing) = cluster
            .roster
            .iter()
            .find(|m| m.fractal_id == member.fractal_id)
        {
            self.log.error(format!(
                "duplicate EnterCluster for {job_name} address {}: held by {}",
                member.fractal_id, existing.node
            ));
            return;
        }
        cluster.roster.push(member.clone());
        self.log.activity(format!(
            "{} entered {job_name} at {}",
            member.node, member.fractal_id
        ));
    }

    pub(crate) async fn on_cluster_connection_request(&self, msg: &Message, job_name: &str) {
        let me = self.table.me().await;
        let accepted = {
            let mut jobs = self.jobs.lock().await;
            match jobs.clusters.get_mut(job_name) {
                Some(cluster) => {
                    cluster.link(&msg.sender);
                    true
                }
                None => false,
            }
        };

        let response = self
            .factory
            .cluster_connection_response(&me, &msg.sender, job_name, accepted);
        if !self.outbox.send(&msg.sender, &response).await {
            self.log
                .error(format!("cluster link response to {} failed", msg.sender));
        }
    }

    pub(crate) async fn on_cluster_connection_response(
        &self,
        msg: &Message,
        job_name: &str,
        accepted: bool,
    ) {
        if !accepted {
            self.log
                .activity(format!("{} refused a {job_name} link", msg.sender));
            return;
        }
        let mut jobs = self.jobs.lock().await;
        match jobs.clusters.get_mut(job_name) {
            Some(cluster) => cluster.link(&msg.sender),
            None => self
                .log
                .error(format!("link accepted for {job_name} but not in its cluster")),
        }
    }

    pub(crate) async fn on_image_info_request(&self, msg: &Message, job_name: &str) {
        let me = self.table.me().await;
        let points = {
            let jobs = self.jobs.lock().await;
            match jobs.clusters.get(job_name) {
                Some(cluster) => cluster.points.lock().await.clone(),
                None => Vec::new(),
            }
        };
        let reply = self.factory.image_info(&me, &msg.sender, job_name, points);
        if !self.outbox.send(&msg.sender, &reply).await {
            self.log
                .error(format!("ImageInfo for {job_name} to {} failed", msg.sender));
        }
    }

    /// Merge points reported by another member.
    pub(crate) async fn collect_points(&self, job_name: &str, points: &[Point]) {
        let mut jobs = self.jobs.lock().await;
        jobs.collected
            .entry(job_name.to_string())
            .or_default()
            .extend_from_slice(points);
        self.log
            .activity(format!("collected {} points for {job_name}", points.len()));
    }

    /// Stop our share of `job_name`, hand the points to the requester and
    /// tell the rest of the roster we left so the frontier moves on.
    pub(crate) async fn on_stop_share_job(&self, msg: &Message, job_name: &str) {
        let me = self.table.me().await;
        let Some(cluster) = self.jobs.lock().await.clusters.remove(job_name) else {
            self.log
                .error(format!("StopShareJob for {job_name} but not working on it"));
            return;
        };
        cluster.halt();
        let points = cluster.points.lock().await.clone();
        self.log
            .activity(format!("stopped {job_name} with {} points", points.len()));

        let reply = self
            .factory
            .stopped_job_info(&me, &msg.sender, job_name, points);
        if !self.outbox.send(&msg.sender, &reply).await {
            self.log
                .error(format!("StoppedJobInfo for {job_name} to {} failed", msg.sender));
        }

        let leaving = ClusterMember::new(cluster.fractal_id.clone(), me.clone());
        let others: Vec<NodeInfo> = cluster
            .roster
            .iter()
            .filter(|m| m.node.id != me.id)
            .map(|m| m.node.clone())
            .collect();
        let exits = others.iter().map(|peer| {
            let exit = self.factory.exit_cluster(&me, peer, job_name, &leaving);
            async move { self.outbox.send(peer, &exit).await }
        });
        if !join_all(exits).await.into_iter().all(|ok| ok) {
            self.log.error(format!(
                "ExitCluster for {} did not reach every member",
                leaving.fractal_id
            ));
        }
    }

    pub(crate) async fn on_exit_cluster(&self, job_name: &str, member: &ClusterMember) {
        let mut jobs = self.jobs.lock().await;
        let Some(cluster) = jobs.clusters.get_mut(job_name) else {
            tracing::debug!("ignoring ExitCluster for {job_name}: not a member");
            return;
        };
        let before = cluster.roster.len();
        cluster
            .roster
            .retain(|m| !(m.node.id == member.node.id && m.fractal_id == member.fractal_id));
        cluster.links.retain(|n| n.id != member.node.id);
        if cluster.roster.len() == before {
            self.log.activity(format!(
                "{} left {job_name} but held no address there",
                member.node
            ));
        } else {
            self.log.activity(format!(
                "{} left {job_name} at {}",
                member.node, member.fractal_id
            ));
        }
    }

    pub(crate) async fn on_job_status_request(&self, msg: &Message) {
        let me = self.table.me().await;
        let statuses = {
            let jobs = self.jobs.lock().await;
            let mut statuses = Vec::with_capacity(jobs.clusters.len());
            for cluster in jobs.clusters.values() {
                statuses.push(cluster.status().await);
            }
            statuses
        };

        for status in statuses {
            let reply = self.factory.job_status(&me, &msg.sender, status);
            if !self.outbox.send(&msg.sender, &reply).await {
                self.log
                    .error(format!("JobStatus to {} failed", msg.sender));
            }
        }
    }

    pub(crate) async fn on_job_status(&self, status: &JobStatus) {
        let key = (status.job_name.clone(), status.fractal_id.clone());
        self.jobs.lock().await.statuses.insert(key, status.clone());
    }

    pub(crate) async fn on_ask_for_job(&self, msg: &Message) {
        let me = self.table.me().await;
        for job in self.jobs.catalog().await {
            let reply = self.factory.job_sharing(&me, &msg.sender, &job);
            if !self.outbox.send(&msg.sender, &reply).await {
                self.log
                    .error(format!("JobSharing {} to {} failed", job.name, msg.sender));
            }
        }
    }

    /// Stop every active job and forget cluster state. The catalog is kept.
    pub(crate) async fn purge_jobs(&self) {
        let mut jobs = self.jobs.lock().await;
        let stopped = jobs.clusters.len();
        for cluster in jobs.clusters.values() {
            cluster.halt();
        }
        jobs.clusters.clear();
        jobs.statuses.clear();
        jobs.collected.clear();
        self.log
            .activity(format!("purged job state ({stopped} cluster(s) stopped)"));
    }
}
