use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread;
use std::time::Duration;

use super::{PendingRequests, RequestHandler, Transport};
use crate::error::{Error, Result};
use crate::protocol::{codec, Message, Request, Response};

struct Endpoint {
    addr: SocketAddr,
    pending: PendingRequests,
    handler: RwLock<Option<RequestHandler>>,
}

impl Endpoint {
    fn receive(&self, packet: &[u8], src: SocketAddr) {
        match codec::decode(packet) {
            Ok(Message::Response(response)) => {
                if !self.pending.complete(response) {
                    debug!("{} - Dropping unmatched response from {}", self.addr, src);
                }
            },
            Ok(Message::Request(request)) => {
                let handler = self
                    .handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(handler) = handler {
                    thread::spawn(move || handler(request, src));
                }
            },
            Err(err) => warn!("{} - Dropping packet from {}: {}", self.addr, src, err),
        }
    }
}

/// An in-process network connecting [`MemoryTransport`]s by address.
///
/// Messages go through the same wire codec as [`super::UdpTransport`]. Sending to an address with
/// no bound transport fails immediately, which lets tests simulate crashed nodes without waiting
/// for timeouts.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<SocketAddr, Weak<Endpoint>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork::default()
    }

    /// Binds a transport on `addr`, taking the address over from any transport bound there.
    pub fn bind(&self, addr: SocketAddr) -> MemoryTransport {
        let endpoint = Arc::new(Endpoint {
            addr,
            pending: PendingRequests::default(),
            handler: RwLock::new(None),
        });
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, Arc::downgrade(&endpoint));
        MemoryTransport {
            network: self.clone(),
            endpoint,
        }
    }

    /// Makes `addr` unreachable until something binds it again.
    pub fn disconnect(&self, addr: &SocketAddr) {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(addr);
    }

    fn deliver(&self, message: &Message, src: SocketAddr, dest: SocketAddr) -> Result<()> {
        let packet = codec::encode(message)?;
        let endpoint = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dest)
            .and_then(Weak::upgrade);
        match endpoint {
            Some(endpoint) => {
                endpoint.receive(&packet, src);
                Ok(())
            },
            None => Err(Error::TransportFailure(format!("{} is unreachable", dest))),
        }
    }
}

/// Transport attached to a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    endpoint: Arc<Endpoint>,
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.endpoint.addr
    }

    fn send(&self, request: &Request, dest: SocketAddr, timeout: Duration) -> Result<Response> {
        let rx = self.endpoint.pending.register(request.id);
        let message = Message::Request(request.clone());
        if let Err(err) = self.network.deliver(&message, self.endpoint.addr, dest) {
            self.endpoint.pending.remove(&request.id);
            return Err(err);
        }
        self.endpoint.pending.wait(&request.id, rx, timeout)
    }

    fn set_request_handler(&self, handler: RequestHandler) {
        *self
            .endpoint
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn send_response(&self, response: &Response, dest: SocketAddr) -> Result<()> {
        let message = Message::Response(response.clone());
        self.network.deliver(&message, self.endpoint.addr, dest)
    }

    fn close(&self) {
        self.endpoint
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut endpoints = self
            .network
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let is_bound_here = endpoints
            .get(&self.endpoint.addr)
            .map_or(false, |bound| bound.as_ptr() == Arc::as_ptr(&self.endpoint));
        if is_bound_here {
            endpoints.remove(&self.endpoint.addr);
        }
    }
}
