//! RPC messages exchanged between nodes.

pub mod codec;

use crate::key::NodeId;
use crate::node::node_data::NodeData;
use crate::MESSAGE_ID_LENGTH;

/// Correlates a response with the request that caused it.
pub type MessageId = [u8; MESSAGE_ID_LENGTH];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: MessageId,
    pub sender: NodeData,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Ping,
    Store(Vec<u8>, Vec<u8>),
    FindNode(NodeId),
    FindValue(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: MessageId,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    /// Answers a ping with the responder's id.
    Pong(NodeId),
    /// Answers a store with whether it was accepted.
    Stored(bool),
    /// Answers a find-node with the closest known nodes.
    Nodes(Vec<NodeData>),
    /// Answers a find-value.
    Value(FindValueResult),
}

/// Either the value found for a key or the closest nodes known to the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindValueResult {
    Found(Vec<u8>),
    Closest(Vec<NodeData>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}
