//! Connection-per-message TCP transport.
//!
//! Sending dials the receiver, writes one newline-terminated envelope and
//! closes. Listening accepts connections, reads one envelope from each on its
//! own task and hands it to a [`MessageHandler`]. Nothing is acknowledged and
//! nothing is retried here; callers decide what a failed send means.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fractal_protocol::{codec, Message, NodeInfo};
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::TransportConfig;
use crate::error::Error;
use crate::log::EventLog;

/// Outgoing half of the transport.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Deliver `msg` to `to`. Returns whether the attempt succeeded.
    async fn send(&self, to: &NodeInfo, msg: &Message) -> bool;

    /// Deliver `msg` to every peer.
    ///
    /// Every peer is attempted even when some fail; the result is `true`
    /// only if all sends succeeded.
    async fn broadcast(&self, peers: &[NodeInfo], msg: &Message) -> bool {
        let attempts = peers.iter().map(|peer| self.send(peer, msg));
        join_all(attempts)
            .await
            .into_iter()
            .fold(true, |all, delivered| all & delivered)
    }
}

/// Receives every envelope a [`Listener`] decodes.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: Message);
}

/// [`Outbox`] over short-lived TCP connections.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    dial_timeout: Duration,
    log: EventLog,
}

impl TcpTransport {
    pub fn new(dial_timeout: Duration, log: EventLog) -> Self {
        Self { dial_timeout, log }
    }

    async fn deliver(&self, addr: &str, line: &str) -> io::Result<()> {
        let mut stream = timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        stream.write_all(line.as_bytes()).await?;
        stream.shutdown().await
    }
}

#[async_trait]
impl Outbox for TcpTransport {
    async fn send(&self, to: &NodeInfo, msg: &Message) -> bool {
        let line = match codec::encode(msg) {
            Ok(line) => line,
            Err(e) => {
                self.log.error(format!("encode {msg}: {e}"));
                return false;
            }
        };

        match self.deliver(&to.full_address(), &line).await {
            Ok(()) => {
                tracing::trace!(to = %to, "sent {msg}");
                true
            }
            Err(e) => {
                self.log.error(format!("send {msg} to {to}: {e}"));
                false
            }
        }
    }
}

/// Bound listening socket, not yet accepting.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    config: TransportConfig,
    log: EventLog,
}

impl Listener {
    pub async fn bind(addr: &str, config: TransportConfig, log: EventLog) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config,
            log,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the accept loop. Each accepted connection is served on its own task.
    pub fn spawn<H: MessageHandler>(self, handler: Arc<H>) -> ListenerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.accept_loop(handler, stop_rx));
        ListenerHandle {
            stop: stop_tx,
            task,
        }
    }

    async fn accept_loop<H: MessageHandler>(self, handler: Arc<H>, mut stop: watch::Receiver<bool>) {
        let Listener {
            listener,
            config,
            log,
        } = self;

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = timeout(config.accept_timeout, listener.accept()) => match accepted {
                    // Deadline expired: re-arm and look at the stop flag again.
                    Err(_) => continue,
                    Ok(Ok((stream, peer))) => {
                        let handler = Arc::clone(&handler);
                        let log = log.clone();
                        let (read_timeout, max_frame) = (config.read_timeout, config.max_frame);
                        tokio::spawn(async move {
                            match read_envelope(stream, read_timeout, max_frame).await {
                                Ok(msg) => handler.handle(msg).await,
                                Err(e) => log.error(format!("discarding frame from {peer}: {e}")),
                            }
                        });
                    }
                    Ok(Err(e)) => log.error(format!("accept failed: {e}")),
                },
            }
        }

        tracing::debug!("accept loop stopped");
    }
}

/// Read one envelope line of at most `max_frame` bytes.
async fn read_envelope(
    stream: TcpStream,
    read_timeout: Duration,
    max_frame: usize,
) -> crate::Result<Message> {
    let mut reader = BufReader::new(stream.take(max_frame as u64));
    let mut line = String::new();
    let read = timeout(read_timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))??;
    if read >= max_frame && !line.ends_with('\n') {
        return Err(Error::FrameTooLarge { limit: max_frame });
    }
    Ok(codec::decode(&line)?)
}

/// Running accept loop.
#[derive(Debug)]
pub struct ListenerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Signal the accept loop and wait for it to exit.
    ///
    /// Handlers already dispatched keep running.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("accept loop panicked: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryOutbox;
    use fractal_protocol::{MessageFactory, SequenceGenerator};
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn factory() -> MessageFactory {
        MessageFactory::new(Arc::new(SequenceGenerator::new()))
    }

    fn node(id: i64, port: u16) -> NodeInfo {
        NodeInfo::new(id, "127.0.0.1", port)
    }

    fn fast() -> TransportConfig {
        TransportConfig {
            dial_timeout: Duration::from_millis(500),
            accept_timeout: Duration::from_millis(50),
            read_timeout: Duration::from_millis(500),
            max_frame: 4096,
        }
    }

    struct Forward(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, msg: Message) {
            let _ = self.0.send(msg);
        }
    }

    async fn listening() -> (SocketAddr, ListenerHandle, mpsc::UnboundedReceiver<Message>, mpsc::UnboundedReceiver<String>) {
        let (log, _activity, errors) = EventLog::detached();
        let listener = Listener::bind("127.0.0.1:0", fast(), log).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = listener.spawn(Arc::new(Forward(tx)));
        (addr, handle, rx, errors)
    }

    fn closed_port() -> u16 {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn broadcast_attempts_every_peer() {
        let outbox = MemoryOutbox::new();
        let peers: Vec<_> = (0..5).map(|id| node(id, 9000 + id as u16)).collect();
        outbox.fail_to(&peers[1]);

        let msg = factory().entered(&node(7, 9007));
        assert!(!outbox.broadcast(&peers, &msg).await);

        let attempted: HashSet<i64> = outbox.sent().iter().map(|(to, _)| to.id).collect();
        assert_eq!(attempted, (0..5).collect());
    }

    #[tokio::test]
    async fn broadcast_succeeds_when_all_deliver() {
        let outbox = MemoryOutbox::new();
        let peers = vec![node(0, 9000), node(1, 9001)];
        assert!(outbox.broadcast(&peers, &factory().purge(&node(2, 9002))).await);
        assert!(outbox.broadcast(&[], &factory().purge(&node(2, 9002))).await);
    }

    #[tokio::test]
    async fn envelope_crosses_tcp() {
        let (addr, handle, mut rx, _errors) = listening().await;
        let (log, _, _) = EventLog::detached();
        let transport = TcpTransport::new(Duration::from_millis(500), log);

        let to = node(1, addr.port());
        let msg = factory().system_knock(&node(3, 9003), &to);
        assert!(transport.send(&to, &msg).await);

        let received = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(received, msg);
        handle.stop().await;
    }

    #[tokio::test]
    async fn tcp_broadcast_reaches_live_peers_past_a_dead_one() {
        let (addr, handle, mut rx, _errors) = listening().await;
        let (log, _, mut errors) = EventLog::detached();
        let transport = TcpTransport::new(Duration::from_millis(500), log);

        let dead = node(0, closed_port());
        let live = node(1, addr.port());
        let msg = factory().entered(&node(2, 9002));

        assert!(!transport.broadcast(&[dead, live], &msg).await);
        let received = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.id, msg.id);
        assert!(errors.recv().await.unwrap().contains("#0@"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn malformed_frames_are_logged_and_the_loop_survives() {
        let (addr, handle, mut rx, mut errors) = listening().await;

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"this is not json\n").await.unwrap();
        raw.shutdown().await.unwrap();
        drop(raw);

        let line = timeout(Duration::from_secs(2), errors.recv()).await.unwrap().unwrap();
        assert!(line.starts_with("discarding frame"));

        let (log, _, _) = EventLog::detached();
        let transport = TcpTransport::new(Duration::from_millis(500), log);
        let to = node(1, addr.port());
        let msg = factory().info(&node(0, 9000), &to, "still here");
        assert!(transport.send(&to, &msg).await);
        assert_eq!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap(), msg);

        handle.stop().await;
    }

    #[tokio::test]
    async fn oversized_frames_are_cut_off() {
        let (addr, handle, mut rx, mut errors) = listening().await;
        let (log, _, _) = EventLog::detached();
        let transport = TcpTransport::new(Duration::from_millis(500), log);
        let to = node(1, addr.port());

        // The reader stops at the limit; the sender may see the reset.
        let flood = factory().info(&node(0, 9000), &to, &"x".repeat(64 * 1024));
        let _ = transport.send(&to, &flood).await;
        let line = timeout(Duration::from_secs(2), errors.recv()).await.unwrap().unwrap();
        assert!(line.contains("exceeds 4096 bytes"), "{line}");

        let msg = factory().info(&node(0, 9000), &to, "fits");
        assert!(transport.send(&to, &msg).await);
        assert_eq!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap(), msg);

        handle.stop().await;
    }

    #[tokio::test]
    async fn accept_timeouts_are_not_fatal() {
        let (addr, handle, mut rx, _errors) = listening().await;
        // Several accept deadlines expire before anything arrives.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (log, _, _) = EventLog::detached();
        let transport = TcpTransport::new(Duration::from_millis(500), log);
        let to = node(1, addr.port());
        assert!(transport.send(&to, &factory().join(&node(4, 9004), &to)).await);
        assert!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().is_some());
        handle.stop().await;
    }

    #[tokio::test]
    async fn stopped_listener_refuses_connections() {
        let (addr, handle, _rx, _errors) = listening().await;
        timeout(Duration::from_secs(2), handle.stop()).await.unwrap();

        let (log, _, _) = EventLog::detached();
        let transport = TcpTransport::new(Duration::from_millis(200), log);
        let to = node(1, addr.port());
        assert!(!transport.send(&to, &factory().hail(&node(-1, 9100), &to)).await);
    }
}
