use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use crate::key::NodeId;
use crate::node::node_data::NodeData;
use crate::protocol::{
    FindValueResult, MessageId, Request, RequestPayload, Response, ResponsePayload,
};
use crate::routing::RoutingTable;
use crate::storage::Storage;
use crate::transport::Transport;

/// The RPC layer of a node: answers inbound requests, issues outbound calls, and keeps the
/// routing table in sync with what it observes on the wire.
#[derive(Clone)]
pub struct Rpc {
    node_data: Arc<NodeData>,
    routing_table: Arc<RwLock<RoutingTable>>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    message_counter: Arc<AtomicU32>,
    ksize: usize,
    request_timeout: Duration,
}

impl Rpc {
    pub fn new(
        node_data: NodeData,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        ksize: usize,
        request_timeout: Duration,
    ) -> Self {
        let routing_table = RoutingTable::new(node_data.id, ksize);
        Rpc {
            node_data: Arc::new(node_data),
            routing_table: Arc::new(RwLock::new(routing_table)),
            storage,
            transport,
            message_counter: Arc::new(AtomicU32::new(rand::random())),
            ksize,
            request_timeout,
        }
    }

    /// Registers this layer as the transport's request handler.
    pub fn start(&self) {
        let rpc = self.clone();
        self.transport
            .set_request_handler(Arc::new(move |request, src| rpc.handle_request(request, src)));
    }

    /// Releases the transport. The handler closure is dropped with it.
    pub fn close(&self) {
        self.transport.close();
    }

    pub fn node_data(&self) -> &NodeData {
        &self.node_data
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn routing_table(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing_table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn routing_table_mut(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.routing_table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the closest `count` known nodes to `target`, closest first.
    pub fn find_neighbors(&self, target: &NodeId, count: usize) -> Vec<NodeData> {
        self.routing_table().find_neighbors(target, count, None)
    }

    /// Returns one random id inside every bucket not updated within `interval`.
    pub fn refresh_ids(&self, interval: Duration) -> Vec<NodeId> {
        let routing_table = self.routing_table();
        let ids = routing_table.refresh_ids(interval);
        debug!(
            "{} - {} of {} buckets are stale",
            self.addr(),
            ids.len(),
            routing_table.size(),
        );
        ids
    }

    pub fn contact_count(&self) -> usize {
        self.routing_table().contact_count()
    }

    fn next_message_id(&self) -> MessageId {
        self.message_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
            .to_be_bytes()
    }

    /// Learns about `node_data`. A node seen for the first time is sent every locally stored
    /// pair it should now hold, before it joins the routing table.
    fn welcome_if_new(&self, node_data: &NodeData) {
        if node_data.addr.is_none() || node_data.id == self.node_data.id {
            return;
        }
        if !self.routing_table().is_new_node(&node_data.id) {
            self.routing_table_mut().add_contact(node_data.clone());
            return;
        }

        info!("{} - Welcoming new node {:?}", self.addr(), node_data);
        let mut transfers = Vec::new();
        {
            let routing_table = self.routing_table();
            for entry in self.storage.iter() {
                let (key, value) = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!("{} - Stopped scanning storage: {}", self.addr(), err);
                        break;
                    },
                };
                let key_id = match NodeId::from_bytes(&key) {
                    Ok(key_id) => key_id,
                    Err(_) => continue,
                };
                let neighbors = routing_table.find_neighbors(&key_id, self.ksize, None);
                let should_transfer = match (neighbors.first(), neighbors.last()) {
                    (Some(first), Some(last)) => {
                        let new_node_close =
                            node_data.id.distance_rank(&key_id) < last.id.distance_rank(&key_id);
                        let this_closest = self.node_data.id.distance_rank(&key_id)
                            < first.id.distance_rank(&key_id);
                        new_node_close && this_closest
                    },
                    _ => false,
                };
                if should_transfer {
                    transfers.push((key, value));
                }
            }
        }

        self.routing_table_mut().add_contact(node_data.clone());

        for (key, value) in transfers {
            let rpc = self.clone();
            let dest = node_data.clone();
            thread::spawn(move || {
                rpc.store(&dest, key, value);
            });
        }
    }

    /// Returns the address the node receives on.
    pub fn addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Answers one inbound request.
    pub fn handle_request(&self, request: Request, src: SocketAddr) {
        debug!(
            "{} - Receiving request from {} {:?}",
            self.addr(),
            src,
            request.payload,
        );
        let sender = NodeData::new(request.sender.id, src);
        self.welcome_if_new(&sender);

        let payload = match request.payload {
            RequestPayload::Ping => ResponsePayload::Pong(self.node_data.id),
            RequestPayload::Store(key, value) => {
                self.storage.put(key, value);
                ResponsePayload::Stored(true)
            },
            RequestPayload::FindNode(target) => {
                ResponsePayload::Nodes(self.neighbors_for(&target, &sender.id))
            },
            RequestPayload::FindValue(key) => match self.storage.get(&key) {
                Some(value) => ResponsePayload::Value(FindValueResult::Found(value)),
                None => {
                    let nodes = match NodeId::from_bytes(&key) {
                        Ok(target) => self.neighbors_for(&target, &sender.id),
                        Err(err) => {
                            debug!("{} - Lookup key is not an id: {}", self.addr(), err);
                            Vec::new()
                        },
                    };
                    ResponsePayload::Value(FindValueResult::Closest(nodes))
                },
            },
        };

        let response = Response {
            id: request.id,
            payload,
        };
        if let Err(err) = self.transport.send_response(&response, src) {
            warn!("{} - Could not respond to {}: {}", self.addr(), src, err);
        }
    }

    fn neighbors_for(&self, target: &NodeId, requester: &NodeId) -> Vec<NodeData> {
        self.routing_table()
            .find_neighbors(target, self.ksize, Some(requester))
    }

    /// Sends a request and waits for its response. A destination that fails to answer is removed
    /// from the routing table; one that answers is welcomed.
    fn send_request(&self, dest: &NodeData, payload: RequestPayload) -> Option<ResponsePayload> {
        let addr = dest.addr?;
        let request = Request {
            id: self.next_message_id(),
            sender: (*self.node_data).clone(),
            payload,
        };
        debug!(
            "{} - Sending request to {:?} {:?}",
            self.addr(),
            dest,
            request.payload,
        );

        match self.transport.send(&request, addr, self.request_timeout) {
            Ok(response) => {
                let responder = match response.payload {
                    ResponsePayload::Pong(id) => NodeData::new(id, addr),
                    _ => dest.clone(),
                };
                self.welcome_if_new(&responder);
                Some(response.payload)
            },
            Err(err) => {
                warn!(
                    "{} - No response from {:?} ({}), removing it from the routing table",
                    self.addr(),
                    dest,
                    err,
                );
                self.routing_table_mut().remove_contact(&dest.id);
                None
            },
        }
    }

    fn unexpected(&self, dest: &NodeData, payload: &ResponsePayload) {
        warn!(
            "{} - Unexpected response from {:?}: {:?}",
            self.addr(),
            dest,
            payload,
        );
    }

    /// Sends a `PING` and returns the id the destination reports.
    pub fn ping(&self, dest: &NodeData) -> Option<NodeId> {
        match self.send_request(dest, RequestPayload::Ping)? {
            ResponsePayload::Pong(id) => Some(id),
            other => {
                self.unexpected(dest, &other);
                None
            },
        }
    }

    /// Sends a `STORE` and returns whether the destination accepted it.
    pub fn store(&self, dest: &NodeData, key: Vec<u8>, value: Vec<u8>) -> bool {
        match self.send_request(dest, RequestPayload::Store(key, value)) {
            Some(ResponsePayload::Stored(success)) => success,
            Some(other) => {
                self.unexpected(dest, &other);
                false
            },
            None => false,
        }
    }

    /// Sends a `FIND_NODE` and returns the nodes the destination knows closest to `target`.
    pub fn find_node(&self, dest: &NodeData, target: &NodeId) -> Option<Vec<NodeData>> {
        match self.send_request(dest, RequestPayload::FindNode(*target))? {
            ResponsePayload::Nodes(nodes) => Some(nodes),
            other => {
                self.unexpected(dest, &other);
                None
            },
        }
    }

    /// Sends a `FIND_VALUE` for `key`.
    pub fn find_value(&self, dest: &NodeData, key: &NodeId) -> Option<FindValueResult> {
        let payload = RequestPayload::FindValue(key.as_bytes().to_vec());
        match self.send_request(dest, payload)? {
            ResponsePayload::Value(result) => Some(result),
            other => {
                self.unexpected(dest, &other);
                None
            },
        }
    }
}
