//! Binary framing of RPC messages.
//!
//! Every message starts with `[type:1][message id:4]`, followed by a type-specific payload. All
//! integers are big-endian. Requests carry `[sender id:20][sender ip:4][sender port:2]` right after
//! the message id. Only IPv4 addresses are representable.

use bytes::{Buf, BufMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use super::{FindValueResult, Message, MessageId, Request, RequestPayload, Response, ResponsePayload};
use crate::error::{Error, Result};
use crate::key::NodeId;
use crate::node::node_data::NodeData;
use crate::{KEY_LENGTH, MESSAGE_ID_LENGTH};

const PING: u8 = 0x01;
const STORE: u8 = 0x02;
const FIND_NODE: u8 = 0x03;
const FIND_VALUE: u8 = 0x04;
const PING_RESPONSE: u8 = 0x11;
const STORE_RESPONSE: u8 = 0x12;
const FIND_NODE_RESPONSE: u8 = 0x13;
const FIND_VALUE_RESPONSE: u8 = 0x14;

/// Encoded size of one node entry: id, IPv4 address and port.
const NODE_ENTRY_LENGTH: usize = KEY_LENGTH + 4 + 2;

/// Encodes `message` into its wire representation.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match message {
        Message::Request(request) => encode_request(&mut buf, request)?,
        Message::Response(response) => encode_response(&mut buf, response)?,
    }
    Ok(buf)
}

fn encode_request(buf: &mut Vec<u8>, request: &Request) -> Result<()> {
    let kind = match request.payload {
        RequestPayload::Ping => PING,
        RequestPayload::Store(..) => STORE,
        RequestPayload::FindNode(_) => FIND_NODE,
        RequestPayload::FindValue(_) => FIND_VALUE,
    };
    buf.put_u8(kind);
    buf.put_slice(&request.id);
    put_node(buf, &request.sender)?;
    match &request.payload {
        RequestPayload::Ping => {},
        RequestPayload::Store(key, value) => {
            put_bytes(buf, key);
            put_bytes(buf, value);
        },
        RequestPayload::FindNode(target) => buf.put_slice(target.as_bytes()),
        RequestPayload::FindValue(key) => put_bytes(buf, key),
    }
    Ok(())
}

fn encode_response(buf: &mut Vec<u8>, response: &Response) -> Result<()> {
    let kind = match response.payload {
        ResponsePayload::Pong(_) => PING_RESPONSE,
        ResponsePayload::Stored(_) => STORE_RESPONSE,
        ResponsePayload::Nodes(_) => FIND_NODE_RESPONSE,
        ResponsePayload::Value(_) => FIND_VALUE_RESPONSE,
    };
    buf.put_u8(kind);
    buf.put_slice(&response.id);
    match &response.payload {
        ResponsePayload::Pong(id) => buf.put_slice(id.as_bytes()),
        ResponsePayload::Stored(success) => buf.put_u8(u8::from(*success)),
        ResponsePayload::Nodes(nodes) => put_nodes(buf, nodes)?,
        ResponsePayload::Value(FindValueResult::Found(value)) => {
            buf.put_u8(1);
            put_bytes(buf, value);
        },
        ResponsePayload::Value(FindValueResult::Closest(nodes)) => {
            buf.put_u8(0);
            put_nodes(buf, nodes)?;
        },
    }
    Ok(())
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn put_node(buf: &mut Vec<u8>, node_data: &NodeData) -> Result<()> {
    let addr = match node_data.addr {
        Some(SocketAddr::V4(addr)) => addr,
        other => return Err(Error::UnsupportedAddress(other)),
    };
    buf.put_slice(node_data.id.as_bytes());
    buf.put_slice(&addr.ip().octets());
    buf.put_u16(addr.port());
    Ok(())
}

fn put_nodes(buf: &mut Vec<u8>, nodes: &[NodeData]) -> Result<()> {
    buf.put_u32(nodes.len() as u32);
    for node_data in nodes {
        put_node(buf, node_data)?;
    }
    Ok(())
}

/// Decodes a message from its wire representation. Fails with [`Error::MalformedMessage`] on an
/// unknown type byte or a truncated payload.
pub fn decode(mut data: &[u8]) -> Result<Message> {
    let buf = &mut data;
    ensure(buf, 1 + MESSAGE_ID_LENGTH)?;
    let kind = buf.get_u8();
    let mut id: MessageId = [0; MESSAGE_ID_LENGTH];
    buf.copy_to_slice(&mut id);

    let message = match kind {
        PING | STORE | FIND_NODE | FIND_VALUE => {
            let sender = get_node(buf)?;
            let payload = match kind {
                PING => RequestPayload::Ping,
                STORE => {
                    let key = get_bytes(buf)?;
                    RequestPayload::Store(key, get_bytes(buf)?)
                },
                FIND_NODE => RequestPayload::FindNode(get_id(buf)?),
                _ => RequestPayload::FindValue(get_bytes(buf)?),
            };
            Message::Request(Request {
                id,
                sender,
                payload,
            })
        },
        PING_RESPONSE => response(id, ResponsePayload::Pong(get_id(buf)?)),
        STORE_RESPONSE => {
            ensure(buf, 1)?;
            response(id, ResponsePayload::Stored(buf.get_u8() != 0))
        },
        FIND_NODE_RESPONSE => response(id, ResponsePayload::Nodes(get_nodes(buf)?)),
        FIND_VALUE_RESPONSE => {
            ensure(buf, 1)?;
            let result = if buf.get_u8() != 0 {
                FindValueResult::Found(get_bytes(buf)?)
            } else {
                FindValueResult::Closest(get_nodes(buf)?)
            };
            response(id, ResponsePayload::Value(result))
        },
        other => {
            return Err(Error::MalformedMessage(format!("unknown message type {:#04x}", other)))
        },
    };
    Ok(message)
}

fn response(id: MessageId, payload: ResponsePayload) -> Message {
    Message::Response(Response { id, payload })
}

fn ensure(buf: &&[u8], len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::MalformedMessage(format!(
            "truncated message: needed {} more bytes, {} left",
            len,
            buf.remaining(),
        )));
    }
    Ok(())
}

fn get_id(buf: &mut &[u8]) -> Result<NodeId> {
    ensure(buf, KEY_LENGTH)?;
    let id = NodeId::from_bytes(&buf[..KEY_LENGTH])?;
    buf.advance(KEY_LENGTH);
    Ok(id)
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn get_node(buf: &mut &[u8]) -> Result<NodeData> {
    ensure(buf, NODE_ENTRY_LENGTH)?;
    let id = get_id(buf)?;
    let ip = Ipv4Addr::from(buf.get_u32());
    let port = buf.get_u16();
    Ok(NodeData::new(id, SocketAddr::V4(SocketAddrV4::new(ip, port))))
}

fn get_nodes(buf: &mut &[u8]) -> Result<Vec<NodeData>> {
    ensure(buf, 4)?;
    let count = buf.get_u32() as usize;
    ensure(buf, count.saturating_mul(NODE_ENTRY_LENGTH))?;
    (0..count).map(|_| get_node(buf)).collect()
}
