//! Wire codec: one JSON envelope per connection, newline terminated.

use crate::error::{Error, Result};
use crate::message::Message;

/// Serialize an envelope to its wire form (JSON followed by `\n`).
pub fn encode(msg: &Message) -> Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Parse the first envelope in `frame`, ignoring anything after it.
pub fn decode(frame: &str) -> Result<Message> {
    let mut stream = serde_json::Deserializer::from_str(frame).into_iter::<Message>();
    match stream.next() {
        Some(msg) => Ok(msg?),
        None => Err(Error::EmptyFrame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MessageFactory;
    use crate::job::{ClusterMember, Job, JobStatus, Point};
    use crate::message::{Direction, MessageKind};
    use crate::node::{NodeInfo, SystemInfo};
    use crate::sequence::SequenceGenerator;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn node(id: i64) -> NodeInfo {
        NodeInfo::new(id, "127.0.0.1", 9000 + id as u16)
    }

    fn job() -> Job {
        Job {
            name: "sierpinski".to_string(),
            width: 800,
            height: 600,
            ratio: 0.5,
            point_count: 1000,
            anchors: vec![Point::new(400, 0), Point::new(0, 600), Point::new(800, 600)],
        }
    }

    /// One message of every kind.
    fn catalog() -> Vec<Message> {
        let f = MessageFactory::new(Arc::new(SequenceGenerator::new()));
        let (a, b) = (node(1), node(2));
        let mut snapshot = SystemInfo::new();
        snapshot.insert(0, node(0));
        snapshot.insert(1, node(1));
        let member = ClusterMember::new("01", node(2));
        let points = vec![Point::new(1, 2), Point::new(-3, 4)];
        let status = JobStatus {
            job_name: "sierpinski".to_string(),
            fractal_id: "1".to_string(),
            points_computed: 12,
            cluster_size: 3,
        };

        vec![
            f.info(&a, &b, "hello"),
            f.info_broadcast(&a, "hello all"),
            f.hail(&NodeInfo::unassigned("127.0.0.1", 9100), &b),
            f.contact(&a, &b, &NodeInfo::sentinel()),
            f.welcome(&a, &b, 2, snapshot),
            f.join(&a, &b),
            f.leave(&a, &b),
            f.entered(&a),
            f.connection_request(&a, &b, Direction::Prev),
            f.connection_response(&a, &b, true, Direction::Next),
            f.quit(&a),
            f.cluster_knock(&a, &b, "sierpinski"),
            f.enter_cluster(&a, &b, "sierpinski", &member),
            f.exit_cluster(&a, &b, "sierpinski", &member),
            f.cluster_connection_request(&a, &b, "sierpinski"),
            f.cluster_connection_response(&a, &b, "sierpinski", false),
            f.job_sharing(&a, &b, &job()),
            f.image_info_request(&a, &b, "sierpinski"),
            f.image_info(&a, &b, "sierpinski", points.clone()),
            f.system_knock(&a, &b),
            f.purge(&a),
            f.start_job(&a, &b, "sierpinski"),
            f.start_job_genesis(&a, &b, "sierpinski"),
            f.approach_cluster(&a, &b, "sierpinski", &node(7)),
            f.cluster_welcome(&a, &b, "01", "sierpinski", vec![member.clone()]),
            f.stop_share_job(&a, &b, "sierpinski"),
            f.stopped_job_info(&a, &b, "sierpinski", points),
            f.ask_for_job(&a, &b),
            f.job_status_request(&a, &b),
            f.job_status(&a, &b, status),
            f.updated_node(&a, &node(3)),
        ]
    }

    #[test]
    fn catalog_covers_every_kind() {
        let kinds: HashSet<MessageKind> = catalog().iter().map(Message::kind).collect();
        assert_eq!(kinds.len(), MessageKind::ALL.len());
        for kind in MessageKind::ALL {
            assert!(kinds.contains(&kind), "no constructor exercised for {kind}");
        }
    }

    #[test]
    fn every_kind_survives_the_wire() {
        for msg in catalog() {
            let line = encode(&msg).unwrap();
            assert!(line.ends_with('\n'));
            assert_eq!(line.matches('\n').count(), 1, "{} spans lines", msg.kind());

            let decoded = decode(&line).unwrap();
            assert_eq!(decoded, msg, "{} changed on the wire", msg.kind());
        }
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let f = MessageFactory::new(Arc::new(SequenceGenerator::new()));
        let msg = f.join(&node(1), &node(0));
        let mut frame = encode(&msg).unwrap();
        frame.push_str("{\"garbage\": true}\nmore");

        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn empty_and_malformed_frames() {
        assert!(matches!(decode(""), Err(Error::EmptyFrame)));
        assert!(matches!(decode("  \n"), Err(Error::EmptyFrame)));
        assert!(matches!(decode("{\"id\": 1"), Err(Error::Serialization(_))));
        assert!(matches!(
            decode("{\"id\":1,\"sender\":{\"id\":0,\"address\":\"a\",\"port\":1},\"receiver\":{\"id\":0,\"address\":\"a\",\"port\":1},\"route\":[0],\"body\":{\"type\":\"Teleport\"}}"),
            Err(Error::Serialization(_))
        ));
    }
}
