//! A node together with its running listener.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::transport::ListenerHandle;

/// A spawned node: the shared handler plus its accept loop.
#[derive(Debug)]
pub struct Running<N> {
    node: Arc<N>,
    listener: ListenerHandle,
    local_addr: SocketAddr,
}

impl<N> Running<N> {
    pub(crate) fn new(node: Arc<N>, listener: ListenerHandle, local_addr: SocketAddr) -> Self {
        Self {
            node,
            listener,
            local_addr,
        }
    }

    pub fn node(&self) -> &Arc<N> {
        &self.node
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Returns the node for final inspection.
    pub async fn stop(self) -> Arc<N> {
        self.listener.stop().await;
        self.node
    }
}
