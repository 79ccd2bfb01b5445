//! Fractal Node - Membership, Job Clusters and Transport
//!
//! A Fractal system is a bootstrap node plus any number of workers talking
//! over short-lived TCP connections, one JSON envelope per connection.
//!
//! # Roles
//!
//! - [`BootstrapNode`]: well-known rendezvous. Answers Hail with a member to
//!   knock on and keeps a best-effort registry of joined workers.
//! - [`WorkerNode`]: a member. Obtains an id through the join protocol,
//!   replicates the membership table, and takes part in job clusters.
//!
//! # Join protocol
//!
//! ```text
//! newcomer ── Hail ──────────────▶ bootstrap
//! newcomer ◀─ Contact(member) ──── bootstrap     (sentinel: "you are #0")
//! newcomer ── SystemKnock ───────▶ member ──relay──▶ frontier
//! newcomer ◀─ Welcome(max+1, table) ─────────────── frontier
//! newcomer ── Entered ───────────▶ every peer
//! newcomer ── Join ──────────────▶ bootstrap
//! ```
//!
//! Only the frontier (highest id) grants ids, and it does so while holding
//! its membership lock.
//!
//! # Clusters
//!
//! A job is worked on by a cluster whose members hold fractal addresses. The
//! member with the highest address admits newcomers at the successor address
//! and every member draws its own region of the job's attractor (see
//! [`chaos`]).

pub mod bootstrap;
pub mod chaos;
pub mod cluster;
pub mod config;
pub mod error;
mod join;
pub mod log;
pub mod membership;
pub mod service;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bootstrap::BootstrapNode;
pub use chaos::ChaosGame;
pub use cluster::{ClusterView, JobBook};
pub use config::{NodeConfig, Role};
pub use error::{Error, Result};
pub use log::{EventLog, EventLogWriters};
pub use membership::{JoinState, MembershipTable, RingLinks};
pub use service::Running;
pub use transport::{Listener, ListenerHandle, MessageHandler, Outbox, TcpTransport};
pub use worker::{WorkerNode, WorkerSettings};
