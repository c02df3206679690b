//! Transport glue between the stack and the tunnel

use std::sync::Arc;

use parking_lot::RwLock;

use crate::conn::UdpConn;
use crate::stack::{DatagramWriter, StackHandle, TransportHandler};
use crate::tcp::TcpConn;
use crate::FlowId;

/// Gets the first look at every datagram of a new UDP flow
///
/// Returning `true` consumes the datagram: no endpoint is created and the
/// connection handler never sees it. Runs on the stack's inbound task and
/// must not block. Replies go through `replies`, which may be cloned and kept
/// for asynchronous answers.
pub trait PacketInterceptor: Send + Sync {
    fn intercept(&self, flow: &FlowId, payload: &[u8], replies: &Arc<dyn DatagramWriter>) -> bool;
}

/// Accepts new connections from the stack
///
/// Both methods run on stack tasks and must not block.
pub trait ConnHandler: Send + Sync {
    /// Take ownership of a new UDP flow
    fn handle_udp(&self, conn: UdpConn);

    /// Take ownership of an established TCP connection
    fn handle_tcp(&self, conn: TcpConn);
}

/// The stack's UDP transport handler
///
/// Offers each new datagram to the interceptor chain in registration order,
/// then falls back to creating an endpoint for the flow and submitting it to
/// the connection handler.
pub struct UdpForwarder {
    interceptors: RwLock<Vec<Arc<dyn PacketInterceptor>>>,
    handler: Arc<dyn ConnHandler>,
}

impl UdpForwarder {
    pub fn new(handler: Arc<dyn ConnHandler>) -> Self {
        Self {
            interceptors: RwLock::new(Vec::new()),
            handler,
        }
    }

    /// Append an interceptor to the chain
    pub fn push_interceptor(&self, interceptor: Arc<dyn PacketInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    pub fn interceptor_count(&self) -> usize {
        self.interceptors.read().len()
    }

    fn intercepted(&self, stack: &StackHandle, flow: &FlowId, payload: &[u8]) -> bool {
        let interceptors = self.interceptors.read();
        if interceptors.is_empty() {
            return false;
        }
        let writer = stack.writer();
        interceptors
            .iter()
            .any(|i| i.intercept(flow, payload, &writer))
    }
}

impl TransportHandler for UdpForwarder {
    fn handle(&self, stack: &StackHandle, flow: FlowId, payload: &[u8]) -> bool {
        if self.intercepted(stack, &flow, payload) {
            return true;
        }

        let conn = match stack.create_udp_endpoint(flow) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("[STACK] cannot create UDP endpoint for {}: {}", flow, e);
                return false;
            }
        };

        stack.deliver(&flow, payload);
        self.handler.handle_udp(conn);
        true
    }
}
