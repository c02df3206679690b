//! Per-flow UDP endpoint

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::stack::StackHandle;
use crate::FlowId;

/// A forwarding endpoint for one UDP flow
///
/// Datagrams the client sends on the flow are received with [`recv`];
/// [`send`] writes a reply that appears to come from the address the client
/// originally targeted. Dropping the connection unregisters the endpoint, so
/// the next datagram of the flow is treated as a new flow.
///
/// [`recv`]: UdpConn::recv
/// [`send`]: UdpConn::send
pub struct UdpConn {
    id: FlowId,
    rx: mpsc::Receiver<Bytes>,
    stack: StackHandle,
}

impl UdpConn {
    pub(crate) fn new(id: FlowId, rx: mpsc::Receiver<Bytes>, stack: StackHandle) -> Self {
        Self { id, rx, stack }
    }

    /// The flow this endpoint serves
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Receive the next datagram; `None` once the stack has closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Send a reply datagram to the client
    pub async fn send(&self, payload: &[u8]) -> Result<usize> {
        self.stack
            .send_udp(self.id.local(), self.id.remote(), payload)
            .await?;
        Ok(payload.len())
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        self.stack.remove_endpoint(&self.id);
    }
}

impl std::fmt::Debug for UdpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConn").field("id", &self.id).finish()
    }
}
