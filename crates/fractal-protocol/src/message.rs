//! The message envelope and its payload variants.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::{ClusterMember, Job, JobStatus, Point};
use crate::node::{NodeInfo, NodeRole, SystemInfo};

/// Every kind of message the mesh exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Info,
    InfoBroadcast,
    Hail,
    Contact,
    Welcome,
    Join,
    Leave,
    Entered,
    ConnectionRequest,
    ConnectionResponse,
    Quit,
    ClusterKnock,
    EnterCluster,
    ExitCluster,
    ClusterConnectionRequest,
    ClusterConnectionResponse,
    JobSharing,
    ImageInfoRequest,
    ImageInfo,
    SystemKnock,
    Purge,
    StartJob,
    StartJobGenesis,
    ApproachCluster,
    ClusterWelcome,
    StopShareJob,
    StoppedJobInfo,
    AskForJob,
    JobStatusRequest,
    JobStatus,
    UpdatedNode,
}

impl MessageKind {
    /// All kinds, in catalog order.
    pub const ALL: [MessageKind; 31] = [
        MessageKind::Info,
        MessageKind::InfoBroadcast,
        MessageKind::Hail,
        MessageKind::Contact,
        MessageKind::Welcome,
        MessageKind::Join,
        MessageKind::Leave,
        MessageKind::Entered,
        MessageKind::ConnectionRequest,
        MessageKind::ConnectionResponse,
        MessageKind::Quit,
        MessageKind::ClusterKnock,
        MessageKind::EnterCluster,
        MessageKind::ExitCluster,
        MessageKind::ClusterConnectionRequest,
        MessageKind::ClusterConnectionResponse,
        MessageKind::JobSharing,
        MessageKind::ImageInfoRequest,
        MessageKind::ImageInfo,
        MessageKind::SystemKnock,
        MessageKind::Purge,
        MessageKind::StartJob,
        MessageKind::StartJobGenesis,
        MessageKind::ApproachCluster,
        MessageKind::ClusterWelcome,
        MessageKind::StopShareJob,
        MessageKind::StoppedJobInfo,
        MessageKind::AskForJob,
        MessageKind::JobStatusRequest,
        MessageKind::JobStatus,
        MessageKind::UpdatedNode,
    ];
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which ring neighbour a connection request is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "NEXT")]
    Next,
    #[serde(rename = "PREV")]
    Prev,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Next => Direction::Prev,
            Direction::Prev => Direction::Next,
        }
    }
}

/// Kind-specific message content.
///
/// On the wire this is `{"type": "<Kind>", "payload": ...}`; kinds without
/// content omit `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Payload {
    /// Free-text diagnostic for one node.
    Info { text: String },
    /// Free-text diagnostic for every known peer.
    InfoBroadcast { text: String },
    /// "I want to join."
    Hail,
    /// Answer to Hail: a member to knock on, or the sentinel for "you are first".
    Contact(NodeInfo),
    /// Newcomer asks a member for an id.
    SystemKnock,
    /// The frontier grants an id and a membership snapshot.
    Welcome {
        assigned_id: i64,
        system_info: SystemInfo,
    },
    /// A worker entered the system (sent to bootstrap).
    Join { id: i64 },
    /// A worker left the system (sent to bootstrap).
    Leave { id: i64 },
    /// A new member joined (broadcast).
    Entered(NodeInfo),
    /// A member is leaving (broadcast).
    Quit { id: i64 },
    /// Ask the receiver to become our neighbour in `direction`.
    ConnectionRequest { direction: Direction },
    ConnectionResponse { accepted: bool, direction: Direction },
    /// Ask any member of the job's cluster for admission.
    ClusterKnock { job_name: String },
    /// A new member was admitted to a cluster.
    EnterCluster {
        job_name: String,
        member: ClusterMember,
    },
    /// A member stopped working on the job and left its cluster.
    ExitCluster {
        job_name: String,
        member: ClusterMember,
    },
    /// Ask a cluster member for admission on behalf of `contact`.
    ApproachCluster { job_name: String, contact: NodeInfo },
    /// Admission granted: our fractal address and the roster.
    ClusterWelcome {
        fractal_id: String,
        job_name: String,
        roster: Vec<ClusterMember>,
    },
    ClusterConnectionRequest { job_name: String },
    ClusterConnectionResponse { job_name: String, accepted: bool },
    /// A job definition.
    JobSharing(Job),
    /// Join the running cluster of a known job.
    StartJob { job_name: String },
    /// Seed a brand-new cluster for a known job.
    StartJobGenesis { job_name: String },
    /// Stop working on a job and hand back the results.
    StopShareJob { job_name: String },
    StoppedJobInfo { job_name: String, points: Vec<Point> },
    ImageInfoRequest { job_name: String },
    ImageInfo { job_name: String, points: Vec<Point> },
    AskForJob,
    JobStatusRequest,
    JobStatus(JobStatus),
    /// A member's record changed (broadcast).
    UpdatedNode(NodeInfo),
    /// Drop all job state (broadcast).
    Purge,
}

impl Payload {
    /// The kind tag of this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Info { .. } => MessageKind::Info,
            Payload::InfoBroadcast { .. } => MessageKind::InfoBroadcast,
            Payload::Hail => MessageKind::Hail,
            Payload::Contact(_) => MessageKind::Contact,
            Payload::SystemKnock => MessageKind::SystemKnock,
            Payload::Welcome { .. } => MessageKind::Welcome,
            Payload::Join { .. } => MessageKind::Join,
            Payload::Leave { .. } => MessageKind::Leave,
            Payload::Entered(_) => MessageKind::Entered,
            Payload::Quit { .. } => MessageKind::Quit,
            Payload::ConnectionRequest { .. } => MessageKind::ConnectionRequest,
            Payload::ConnectionResponse { .. } => MessageKind::ConnectionResponse,
            Payload::ClusterKnock { .. } => MessageKind::ClusterKnock,
            Payload::EnterCluster { .. } => MessageKind::EnterCluster,
            Payload::ExitCluster { .. } => MessageKind::ExitCluster,
            Payload::ApproachCluster { .. } => MessageKind::ApproachCluster,
            Payload::ClusterWelcome { .. } => MessageKind::ClusterWelcome,
            Payload::ClusterConnectionRequest { .. } => MessageKind::ClusterConnectionRequest,
            Payload::ClusterConnectionResponse { .. } => MessageKind::ClusterConnectionResponse,
            Payload::JobSharing(_) => MessageKind::JobSharing,
            Payload::StartJob { .. } => MessageKind::StartJob,
            Payload::StartJobGenesis { .. } => MessageKind::StartJobGenesis,
            Payload::StopShareJob { .. } => MessageKind::StopShareJob,
            Payload::StoppedJobInfo { .. } => MessageKind::StoppedJobInfo,
            Payload::ImageInfoRequest { .. } => MessageKind::ImageInfoRequest,
            Payload::ImageInfo { .. } => MessageKind::ImageInfo,
            Payload::AskForJob => MessageKind::AskForJob,
            Payload::JobStatusRequest => MessageKind::JobStatusRequest,
            Payload::JobStatus(_) => MessageKind::JobStatus,
            Payload::UpdatedNode(_) => MessageKind::UpdatedNode,
            Payload::Purge => MessageKind::Purge,
        }
    }
}

/// The single envelope every node sends and receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sequence id, unique per envelope. Kept when relayed.
    pub id: u64,
    /// Original sender.
    pub sender: NodeInfo,
    /// Intended receiver; the sentinel for broadcasts.
    pub receiver: NodeInfo,
    /// Ids of the nodes this envelope passed through, sender first.
    pub route: Vec<i64>,
    pub body: Payload,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Whether the receiver is the broadcast sentinel.
    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_sentinel()
    }

    /// Copy of this envelope forwarded by `relayer`.
    ///
    /// Id, sender, receiver and payload are kept; the relayer's id is
    /// appended to the route.
    pub fn make_me_a_sender<N: NodeRole + ?Sized>(&self, relayer: &N) -> Message {
        let mut relayed = self.clone();
        relayed.route.push(relayer.id());
        relayed
    }

    /// Compact `sender¦receiver¦id¦kind` form for log lines.
    pub fn log_line(&self) -> String {
        format!(
            "{}¦{}¦{}¦{}",
            self.sender.id,
            self.receiver.id,
            self.id,
            self.kind()
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.log_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Worker;

    fn envelope() -> Message {
        Message {
            id: 42,
            sender: NodeInfo::new(3, "127.0.0.1", 9003),
            receiver: NodeInfo::new(1, "127.0.0.1", 9001),
            route: vec![3],
            body: Payload::SystemKnock,
        }
    }

    #[test]
    fn route_accumulates_relayers() {
        let original = envelope();
        let mut relayed = original.clone();
        for id in [1, 5, 8] {
            let mut relayer = Worker::new("127.0.0.1", 9100);
            relayer.assign_id(id);
            relayed = relayed.make_me_a_sender(&relayer);
        }

        assert_eq!(relayed.route, vec![3, 1, 5, 8]);
        assert_eq!(relayed.id, original.id);
        assert_eq!(relayed.sender, original.sender);
        assert_eq!(relayed.receiver, original.receiver);
        assert_eq!(relayed.body, original.body);
        assert_eq!(original.route, vec![3]);
    }

    #[test]
    fn log_line_format() {
        assert_eq!(envelope().log_line(), "3¦1¦42¦SystemKnock");
    }

    #[test]
    fn direction_wire_names() {
        assert_eq!(serde_json::to_string(&Direction::Next).unwrap(), "\"NEXT\"");
        assert_eq!(serde_json::to_string(&Direction::Prev).unwrap(), "\"PREV\"");
        assert_eq!(Direction::Next.opposite(), Direction::Prev);
    }

    #[test]
    fn payload_tagging() {
        let json = serde_json::to_value(&Payload::Join { id: 7 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "Join", "payload": {"id": 7}}));

        let json = serde_json::to_value(&Payload::Hail).unwrap();
        assert_eq!(json, serde_json::json!({"type": "Hail"}));
    }

    #[test]
    fn broadcast_receiver() {
        let mut msg = envelope();
        assert!(!msg.is_broadcast());
        msg.receiver = NodeInfo::sentinel();
        assert!(msg.is_broadcast());
    }
}
