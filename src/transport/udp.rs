use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use super::{PendingRequests, RequestHandler, Transport};
use crate::error::{Error, Result};
use crate::protocol::{codec, Message, Request, Response};
use crate::MESSAGE_LENGTH;

/// How long the receiver blocks on the socket before checking whether it should stop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Shared {
    socket: UdpSocket,
    local_addr: SocketAddr,
    pending: PendingRequests,
    handler: RwLock<Option<RequestHandler>>,
    is_active: AtomicBool,
}

/// Transport over a UDP socket, one datagram per message.
pub struct UdpTransport {
    shared: Arc<Shared>,
}

impl UdpTransport {
    /// Binds a socket on `addr` and starts the thread receiving on it.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let local_addr = socket.local_addr()?;
        if !local_addr.is_ipv4() {
            return Err(Error::UnsupportedAddress(Some(local_addr)));
        }
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let shared = Arc::new(Shared {
            socket,
            local_addr,
            pending: PendingRequests::default(),
            handler: RwLock::new(None),
            is_active: AtomicBool::new(true),
        });
        let receiver = Arc::clone(&shared);
        thread::spawn(move || receiver.receive_loop());
        Ok(UdpTransport { shared })
    }

    fn send_message(&self, message: &Message, dest: SocketAddr) -> Result<()> {
        let buffer = codec::encode(message)?;
        self.shared
            .socket
            .send_to(&buffer, dest)
            .map_err(|err| Error::TransportFailure(err.to_string()))?;
        Ok(())
    }
}

impl Shared {
    fn receive_loop(&self) {
        let mut buffer = vec![0u8; MESSAGE_LENGTH];
        while self.is_active.load(Ordering::Acquire) {
            let (len, src) = match self.socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(ref err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
                {
                    continue
                },
                Err(err) => {
                    debug!("{} - Error receiving packet: {}", self.local_addr, err);
                    continue;
                },
            };

            match codec::decode(&buffer[..len]) {
                Ok(Message::Response(response)) => {
                    if !self.pending.complete(response) {
                        debug!(
                            "{} - Original request not found; irrelevant response or expired \
                             request.",
                            self.local_addr
                        );
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
                Err(err) => {
                    warn!("{} - Dropping packet from {}: {}", self.local_addr, src, err);
                },
            }
        }
        info!("{} - Killed receiver", self.local_addr);
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    fn send(&self, request: &Request, dest: SocketAddr, timeout: Duration) -> Result<Response> {
        let rx = self.shared.pending.register(request.id);
        if let Err(err) = self.send_message(&Message::Request(request.clone()), dest) {
            self.shared.pending.remove(&request.id);
            return Err(err);
        }
        self.shared.pending.wait(&request.id, rx, timeout)
    }

    fn set_request_handler(&self, handler: RequestHandler) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn send_response(&self, response: &Response, dest: SocketAddr) -> Result<()> {
        self.send_message(&Message::Response(response.clone()), dest)
    }

    fn close(&self) {
        self.shared.is_active.store(false, Ordering::Release);
        self.shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::UdpTransport;
    use crate::error::Error;
    use crate::key::NodeId;
    use crate::node::node_data::NodeData;
    use crate::protocol::{Request, RequestPayload, Response, ResponsePayload};
    use crate::transport::Transport;

    #[test]
    fn test_request_and_response_over_loopback() {
        let server = Arc::new(UdpTransport::bind("127.0.0.1:0").unwrap());
        let client = UdpTransport::bind("127.0.0.1:0").unwrap();
        let server_id = NodeId::rand();

        let responder = Arc::clone(&server);
        server.set_request_handler(Arc::new(move |request: Request, from| {
            let response = Response {
                id: request.id,
                payload: ResponsePayload::Pong(server_id),
            };
            responder.send_response(&response, from).unwrap();
        }));

        let request = Request {
            id: [9, 9, 9, 9],
            sender: NodeData::new(NodeId::rand(), client.local_addr()),
            payload: RequestPayload::Ping,
        };
        let response = client
            .send(&request, server.local_addr(), Duration::from_secs(2))
            .unwrap();
        assert_eq!(response.payload, ResponsePayload::Pong(server_id));

        server.close();
        client.close();
    }

    #[test]
    fn test_silent_peer_times_out() {
        let silent = UdpTransport::bind("127.0.0.1:0").unwrap();
        let client = UdpTransport::bind("127.0.0.1:0").unwrap();
        let request = Request {
            id: [1, 1, 1, 1],
            sender: NodeData::new(NodeId::rand(), client.local_addr()),
            payload: RequestPayload::Ping,
        };
        match client.send(&request, silent.local_addr(), Duration::from_millis(200)) {
            Err(Error::RpcTimeout) => {},
            other => panic!("unexpected {:?}", other),
        }
        silent.close();
        client.close();
    }
}
