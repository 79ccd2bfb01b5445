//! Message constructors.
//!
//! Every constructor allocates the next id from the shared
//! [`SequenceGenerator`], stamps sender and receiver, and starts the route
//! at the sender's id. Broadcast kinds are addressed to
//! [`NodeInfo::sentinel`].

use std::sync::Arc;

use crate::job::{ClusterMember, Job, JobStatus, Point};
use crate::message::{Direction, Message, Payload};
use crate::node::{NodeInfo, SystemInfo};
use crate::sequence::SequenceGenerator;

/// Builds envelopes for one process (or one isolated test node).
#[derive(Debug, Clone)]
pub struct MessageFactory {
    sequence: Arc<SequenceGenerator>,
}

impl MessageFactory {
    pub fn new(sequence: Arc<SequenceGenerator>) -> Self {
        Self { sequence }
    }

    /// The generator this factory draws ids from.
    pub fn sequence(&self) -> &Arc<SequenceGenerator> {
        &self.sequence
    }

    /// Wrap an arbitrary payload in a fresh envelope.
    pub fn envelope(&self, sender: &NodeInfo, receiver: &NodeInfo, body: Payload) -> Message {
        Message {
            id: self.sequence.next(),
            sender: sender.clone(),
            receiver: receiver.clone(),
            route: vec![sender.id],
            body,
        }
    }

    fn broadcast(&self, sender: &NodeInfo, body: Payload) -> Message {
        self.envelope(sender, &NodeInfo::sentinel(), body)
    }

    pub fn info(&self, sender: &NodeInfo, receiver: &NodeInfo, text: impl Into<String>) -> Message {
        self.envelope(sender, receiver, Payload::Info { text: text.into() })
    }

    pub fn info_broadcast(&self, sender: &NodeInfo, text: impl Into<String>) -> Message {
        self.broadcast(sender, Payload::InfoBroadcast { text: text.into() })
    }

    // --- Join protocol -------------------------------------------------

    pub fn hail(&self, sender: &NodeInfo, bootstrap: &NodeInfo) -> Message {
        self.envelope(sender, bootstrap, Payload::Hail)
    }

    /// `contact` is the member to knock on, or the sentinel for "you are first".
    pub fn contact(&self, sender: &NodeInfo, receiver: &NodeInfo, contact: &NodeInfo) -> Message {
        self.envelope(sender, receiver, Payload::Contact(contact.clone()))
    }

    pub fn system_knock(&self, sender: &NodeInfo, contact: &NodeInfo) -> Message {
        self.envelope(sender, contact, Payload::SystemKnock)
    }

    pub fn welcome(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        assigned_id: i64,
        system_info: SystemInfo,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::Welcome {
                assigned_id,
                system_info,
            },
        )
    }

    pub fn join(&self, sender: &NodeInfo, bootstrap: &NodeInfo) -> Message {
        self.envelope(sender, bootstrap, Payload::Join { id: sender.id })
    }

    pub fn leave(&self, sender: &NodeInfo, bootstrap: &NodeInfo) -> Message {
        self.envelope(sender, bootstrap, Payload::Leave { id: sender.id })
    }

    pub fn entered(&self, sender: &NodeInfo) -> Message {
        self.broadcast(sender, Payload::Entered(sender.clone()))
    }

    pub fn quit(&self, sender: &NodeInfo) -> Message {
        self.broadcast(sender, Payload::Quit { id: sender.id })
    }

    /// Hand an unwanted id grant back to the frontier that made it.
    pub fn decline_grant(&self, sender: &NodeInfo, frontier: &NodeInfo, id: i64) -> Message {
        self.envelope(sender, frontier, Payload::Quit { id })
    }

    // --- Ring neighbours -----------------------------------------------

    pub fn connection_request(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        direction: Direction,
    ) -> Message {
        self.envelope(sender, receiver, Payload::ConnectionRequest { direction })
    }

    pub fn connection_response(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        accepted: bool,
        direction: Direction,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::ConnectionResponse {
                accepted,
                direction,
            },
        )
    }

    // --- Clusters ------------------------------------------------------

    pub fn cluster_knock(&self, sender: &NodeInfo, receiver: &NodeInfo, job_name: &str) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::ClusterKnock {
                job_name: job_name.to_string(),
            },
        )
    }

    pub fn enter_cluster(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        job_name: &str,
        member: &ClusterMember,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::EnterCluster {
                job_name: job_name.to_string(),
                member: member.clone(),
            },
        )
    }

    pub fn exit_cluster(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        job_name: &str,
        member: &ClusterMember,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::ExitCluster {
                job_name: job_name.to_string(),
                member: member.clone(),
            },
        )
    }

    pub fn approach_cluster(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        job_name: &str,
        contact: &NodeInfo,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::ApproachCluster {
                job_name: job_name.to_string(),
                contact: contact.clone(),
            },
        )
    }

    pub fn cluster_welcome(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        fractal_id: &str,
        job_name: &str,
        roster: Vec<ClusterMember>,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::ClusterWelcome {
                fractal_id: fractal_id.to_string(),
                job_name: job_name.to_string(),
                roster,
            },
        )
    }

    pub fn cluster_connection_request(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        job_name: &str,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::ClusterConnectionRequest {
                job_name: job_name.to_string(),
            },
        )
    }

    pub fn cluster_connection_response(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        job_name: &str,
        accepted: bool,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::ClusterConnectionResponse {
                job_name: job_name.to_string(),
                accepted,
            },
        )
    }

    // --- Jobs ----------------------------------------------------------

    pub fn job_sharing(&self, sender: &NodeInfo, receiver: &NodeInfo, job: &Job) -> Message {
        self.envelope(sender, receiver, Payload::JobSharing(job.clone()))
    }

    pub fn start_job(&self, sender: &NodeInfo, receiver: &NodeInfo, job_name: &str) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::StartJob {
                job_name: job_name.to_string(),
            },
        )
    }

    pub fn start_job_genesis(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        job_name: &str,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::StartJobGenesis {
                job_name: job_name.to_string(),
            },
        )
    }

    pub fn stop_share_job(&self, sender: &NodeInfo, receiver: &NodeInfo, job_name: &str) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::StopShareJob {
                job_name: job_name.to_string(),
            },
        )
    }

    pub fn stopped_job_info(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        job_name: &str,
        points: Vec<Point>,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::StoppedJobInfo {
                job_name: job_name.to_string(),
                points,
            },
        )
    }

    pub fn image_info_request(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        job_name: &str,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::ImageInfoRequest {
                job_name: job_name.to_string(),
            },
        )
    }

    pub fn image_info(
        &self,
        sender: &NodeInfo,
        receiver: &NodeInfo,
        job_name: &str,
        points: Vec<Point>,
    ) -> Message {
        self.envelope(
            sender,
            receiver,
            Payload::ImageInfo {
                job_name: job_name.to_string(),
                points,
            },
        )
    }

    pub fn ask_for_job(&self, sender: &NodeInfo, receiver: &NodeInfo) -> Message {
        self.envelope(sender, receiver, Payload::AskForJob)
    }

    pub fn job_status_request(&self, sender: &NodeInfo, receiver: &NodeInfo) -> Message {
        self.envelope(sender, receiver, Payload::JobStatusRequest)
    }

    pub fn job_status(&self, sender: &NodeInfo, receiver: &NodeInfo, status: JobStatus) -> Message {
        self.envelope(sender, receiver, Payload::JobStatus(status))
    }

    // --- Maintenance ---------------------------------------------------

    pub fn updated_node(&self, sender: &NodeInfo, node: &NodeInfo) -> Message {
        self.broadcast(sender, Payload::UpdatedNode(node.clone()))
    }

    pub fn purge(&self, sender: &NodeInfo) -> Message {
        self.broadcast(sender, Payload::Purge)
    }
}
