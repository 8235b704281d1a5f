//! Carriers of RPC messages between nodes.
//!
//! The protocol layer only depends on [`Transport`]. [`UdpTransport`] is the production
//! implementation, while [`MemoryNetwork`] hands out in-process transports for simulations and
//! tests.

mod memory;
mod udp;

pub use self::memory::{MemoryNetwork, MemoryTransport};
pub use self::udp::UdpTransport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{MessageId, Request, Response};

/// Callback invoked for every inbound request together with the address it came from.
pub type RequestHandler = Arc<dyn Fn(Request, SocketAddr) + Send + Sync>;

pub trait Transport: Send + Sync {
    /// Returns the address the transport receives on.
    fn local_addr(&self) -> SocketAddr;

    /// Sends `request` to `dest` and blocks until the matching response arrives. Fails with
    /// [`Error::RpcTimeout`] if nothing arrives within `timeout`.
    fn send(&self, request: &Request, dest: SocketAddr, timeout: Duration) -> Result<Response>;

    /// Registers the callback for inbound requests, replacing any previous one.
    fn set_request_handler(&self, handler: RequestHandler);

    /// Sends `response` to `dest` without waiting for anything in return.
    fn send_response(&self, response: &Response, dest: SocketAddr) -> Result<()>;

    /// Stops receiving and releases the request handler.
    fn close(&self);
}

/// Outgoing requests waiting for their response, keyed by message id.
#[derive(Default)]
struct PendingRequests {
    requests: Mutex<HashMap<MessageId, Sender<Response>>>,
}

impl PendingRequests {
    /// Starts waiting for the response to message `id`.
    fn register(&self, id: MessageId) -> Receiver<Response> {
        let (tx, rx) = channel();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        rx
    }

    /// Hands `response` to its waiting request. Returns `false` if nobody is waiting for it.
    fn complete(&self, response: Response) -> bool {
        let sender = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&response.id);
        match sender {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    /// Stops waiting for message `id`.
    fn remove(&self, id: &MessageId) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Blocks until the response to message `id` arrives on `rx` or `timeout` elapses.
    fn wait(&self, id: &MessageId, rx: Receiver<Response>, timeout: Duration) -> Result<Response> {
        let result = rx.recv_timeout(timeout);
        self.remove(id);
        match result {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(Error::RpcTimeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::TransportFailure("request abandoned".to_string()))
            },
        }
    }
}
