//! Fractal Protocol - Identity Model and Message Catalog
//!
//! Everything two Fractal nodes need to agree on to talk to each other.
//!
//! # Overview
//!
//! - **Identity**: [`NodeInfo`] records and the two node roles, [`Bootstrap`]
//!   (well-known rendezvous) and [`Worker`] (cluster member holding a replica
//!   of the membership table). Both expose the [`NodeRole`] capability set.
//! - **Envelope**: a single [`Message`] type carrying sender, receiver, route,
//!   a sequence id and a [`Payload`]. The payload is a closed set of variants,
//!   one per [`MessageKind`].
//! - **Catalog**: [`MessageFactory`] builds every kind of message, stamping ids
//!   from an injected [`SequenceGenerator`].
//! - **Wire**: [`codec`] turns an envelope into one newline-terminated JSON
//!   document and back.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use fractal_protocol::{codec, MessageFactory, MessageKind, NodeInfo, SequenceGenerator};
//!
//! let factory = MessageFactory::new(Arc::new(SequenceGenerator::new()));
//! let worker = NodeInfo::unassigned("127.0.0.1", 9001);
//! let bootstrap = NodeInfo::unassigned("127.0.0.1", 9000);
//!
//! let hail = factory.hail(&worker, &bootstrap);
//! let line = codec::encode(&hail).unwrap();
//! let decoded = codec::decode(&line).unwrap();
//! assert_eq!(decoded.kind(), MessageKind::Hail);
//! ```

pub mod catalog;
pub mod codec;
pub mod error;
pub mod job;
pub mod message;
pub mod node;
pub mod sequence;

pub use catalog::MessageFactory;
pub use error::{Error, Result};
pub use job::{ClusterMember, Job, JobStatus, Point};
pub use message::{Direction, Message, MessageKind, Payload};
pub use node::{Bootstrap, NodeInfo, NodeRole, SystemInfo, Worker};
pub use sequence::SequenceGenerator;
