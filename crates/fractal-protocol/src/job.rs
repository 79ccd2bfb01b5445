//! Job records carried by the cluster protocol.
//!
//! The protocol only moves these around; producing and consuming them is the
//! job owner's business.

use serde::{Deserialize, Serialize};

use crate::node::NodeInfo;

/// A pixel coordinate produced by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// A fractal job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job name.
    pub name: String,
    /// Canvas width in pixels.
    pub width: u32,
    /// Canvas height in pixels.
    pub height: u32,
    /// Fraction of the distance travelled toward the chosen anchor each step.
    pub ratio: f64,
    /// Number of points each cluster member computes before idling.
    pub point_count: u64,
    /// Anchor points; their count is the fractal's branching factor.
    pub anchors: Vec<Point>,
}

impl Job {
    /// Base of the fractal address space for this job.
    pub fn branching(&self) -> u32 {
        (self.anchors.len() as u32).max(2)
    }
}

/// Progress of one cluster member on one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_name: String,
    /// Fractal address of the reporting member.
    pub fractal_id: String,
    pub points_computed: u64,
    pub cluster_size: u32,
}

/// A member of a job cluster and its fractal address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub fractal_id: String,
    pub node: NodeInfo,
}

impl ClusterMember {
    pub fn new(fractal_id: impl Into<String>, node: NodeInfo) -> Self {
        Self {
            fractal_id: fractal_id.into(),
            node,
        }
    }
}
