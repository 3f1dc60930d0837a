//! KRPC wire format (BEP 5): bencoded message classification, per-kind
//! argument projection, message builders, and the compact node/peer
//! encodings.
//!
//! Inbound datagrams decode into the generic [`Value`] tree; [`classify`]
//! assigns one label from a closed set, and the projection helpers turn the
//! tree into statically-shaped argument structs at the handler boundary.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use rand::Rng;
use tracing::debug;

pub use serde_bencode::value::Value;

use super::types::{
    Node, NodeError, Peer, StoredNode, COMPACT_NODE_LEN, TRANSACTION_ID_LEN,
};

type Dict = HashMap<Vec<u8>, Value>;

/// Every inbound message gets exactly one of these labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    AnnouncePeerRequest,
    FindNodeRequest,
    GetPeersRequest,
    PingRequest,
    SampleInfohashes,
    Vote,
    GetPeersResponse,
    FindNodeResponse,
    PingResponse,
    Error,
    Unknown,
}

/// Decode a raw datagram into a bencode value tree.
pub fn decode(data: &[u8]) -> Result<Value, NodeError> {
    Ok(serde_bencode::from_bytes(data)?)
}

/// Encode a message for the wire. Dictionaries are emitted with sorted keys,
/// as bencode requires.
pub fn encode(message: &Value) -> Result<Vec<u8>, NodeError> {
    Ok(serde_bencode::to_bytes(message)?)
}

/// Assign a message kind. Total: anything unrecognized is `Unknown`.
pub fn classify(message: &Value) -> MessageKind {
    let Some(top) = as_dict(message) else {
        debug!("Unexpected message type: {:?}", message);
        return MessageKind::Unknown;
    };

    match bytes_field(top, b"y") {
        Some(b"q") => match bytes_field(top, b"q") {
            Some(b"announce_peer") => MessageKind::AnnouncePeerRequest,
            Some(b"find_node") => MessageKind::FindNodeRequest,
            Some(b"get_peers") => MessageKind::GetPeersRequest,
            Some(b"ping") => MessageKind::PingRequest,
            Some(b"sample_infohashes") => MessageKind::SampleInfohashes,
            // utorrent
            Some(b"vote") => MessageKind::Vote,
            _ => {
                debug!("Unexpected request type: {:?}", message);
                MessageKind::Unknown
            }
        },
        Some(b"r") => {
            let reply = dict_field(top, b"r");
            let has = |key: &[u8]| reply.map(|r| r.contains_key(key)).unwrap_or(false);
            if has(b"values") {
                MessageKind::GetPeersResponse
            } else if has(b"nodes") {
                MessageKind::FindNodeResponse
            } else if reply
                .map(|r| r.keys().all(|k| matches!(k.as_slice(), b"id" | b"ip" | b"p")))
                .unwrap_or(true)
            {
                MessageKind::PingResponse
            } else {
                debug!("Unexpected response type: {:?}", message);
                MessageKind::Unknown
            }
        }
        Some(b"e") => MessageKind::Error,
        _ => {
            debug!("Unexpected message type: {:?}", message);
            MessageKind::Unknown
        }
    }
}

/// Extract the sender id: `a.id` for queries, `r.id` for responses, rendered
/// to 40-hex. `None` means the datagram should be dropped.
pub fn sender_id(message: &Value) -> Option<String> {
    let top = as_dict(message)?;
    if let Some(args) = dict_field(top, b"a") {
        return bytes_field(args, b"id").map(hex::encode);
    }
    if let Some(reply) = dict_field(top, b"r") {
        return bytes_field(reply, b"id").map(hex::encode);
    }
    None
}

/// Transaction id of a message; required so replies can echo it.
pub fn transaction_id(message: &Value) -> Result<Vec<u8>, NodeError> {
    as_dict(message)
        .and_then(|top| bytes_field(top, b"t"))
        .map(|t| t.to_vec())
        .ok_or(NodeError::Field("t"))
}

// =============================================================================
// PER-KIND ARGUMENT PROJECTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeArgs {
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPeersArgs {
    pub info_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceArgs {
    pub info_hash: String,
    /// When set, the announced port is the UDP source port of the query and
    /// the `port` argument is ignored entirely.
    pub implied_port: bool,
    /// Raw wire value; only read and range-checked when `implied_port` is
    /// falsy.
    pub port: Option<i64>,
}

impl AnnounceArgs {
    /// The explicitly announced port, validated on demand.
    pub fn announced_port(&self) -> Result<u16, NodeError> {
        let port = self.port.ok_or(NodeError::Field("port"))?;
        u16::try_from(port).map_err(|_| NodeError::Field("port"))
    }
}

pub fn find_node_args(message: &Value) -> Result<FindNodeArgs, NodeError> {
    let args = query_args(message)?;
    let target = bytes_field(args, b"target")
        .map(hex::encode)
        .ok_or(NodeError::Field("target"))?;
    Ok(FindNodeArgs { target })
}

pub fn get_peers_args(message: &Value) -> Result<GetPeersArgs, NodeError> {
    let args = query_args(message)?;
    let info_hash = bytes_field(args, b"info_hash")
        .map(hex::encode)
        .ok_or(NodeError::Field("info_hash"))?;
    Ok(GetPeersArgs { info_hash })
}

pub fn announce_args(message: &Value) -> Result<AnnounceArgs, NodeError> {
    let args = query_args(message)?;
    let info_hash = bytes_field(args, b"info_hash")
        .map(hex::encode)
        .ok_or(NodeError::Field("info_hash"))?;
    let implied_port = int_field(args, b"implied_port").unwrap_or(0) != 0;
    let port = int_field(args, b"port");
    Ok(AnnounceArgs { info_hash, implied_port, port })
}

/// Nodes carried by a `find_node` response (`r.nodes`, compact form).
pub fn response_nodes(message: &Value) -> Result<Vec<Node>, NodeError> {
    let reply = as_dict(message)
        .and_then(|top| dict_field(top, b"r"))
        .ok_or(NodeError::Field("r"))?;
    let data = bytes_field(reply, b"nodes").ok_or(NodeError::Field("nodes"))?;
    Ok(parse_compact_node_info(data))
}

// =============================================================================
// MESSAGE BUILDERS
// =============================================================================

/// Reply carrying only our id (answers ping and announce_peer).
pub fn reply_with_id(transaction_id: &[u8], base_id: &str) -> Result<Value, NodeError> {
    let reply = message_dict(vec![(b"id".as_slice(), Value::Bytes(hex::decode(base_id)?))]);
    Ok(message_dict(vec![
        (b"t".as_slice(), Value::Bytes(transaction_id.to_vec())),
        (b"y".as_slice(), Value::Bytes(b"r".to_vec())),
        (b"r".as_slice(), reply),
    ]))
}

/// Reply carrying our id and a compact list of nodes (answers find_node and
/// peerless get_peers).
pub fn reply_with_nodes(
    transaction_id: &[u8],
    base_id: &str,
    nodes: &[StoredNode],
) -> Result<Value, NodeError> {
    let reply = message_dict(vec![
        (b"id".as_slice(), Value::Bytes(hex::decode(base_id)?)),
        (b"nodes".as_slice(), Value::Bytes(create_compact_node_info(nodes)?)),
    ]);
    Ok(message_dict(vec![
        (b"t".as_slice(), Value::Bytes(transaction_id.to_vec())),
        (b"y".as_slice(), Value::Bytes(b"r".to_vec())),
        (b"r".as_slice(), reply),
    ]))
}

/// Reply carrying our id, an opaque token, and the known compact peers for an
/// info hash (answers get_peers on a hit). The token is two random bytes and
/// is not tracked afterwards.
pub fn reply_with_values(
    transaction_id: &[u8],
    base_id: &str,
    peers: &[Peer],
) -> Result<Value, NodeError> {
    let values = peers
        .iter()
        .map(|peer| Value::Bytes(peer.compact_info()))
        .collect();
    let reply = message_dict(vec![
        (b"id".as_slice(), Value::Bytes(hex::decode(base_id)?)),
        (b"token".as_slice(), Value::Bytes(random_bytes(TRANSACTION_ID_LEN))),
        (b"values".as_slice(), Value::List(values)),
    ]);
    Ok(message_dict(vec![
        (b"t".as_slice(), Value::Bytes(transaction_id.to_vec())),
        (b"y".as_slice(), Value::Bytes(b"r".to_vec())),
        (b"r".as_slice(), reply),
    ]))
}

/// Outbound ping query with a fresh transaction id.
pub fn ping_query(base_id: &str) -> Result<Value, NodeError> {
    let args = message_dict(vec![(b"id".as_slice(), Value::Bytes(hex::decode(base_id)?))]);
    Ok(query("ping", args))
}

/// Outbound find_node query with a fresh transaction id.
pub fn find_node_query(base_id: &str, target: &str) -> Result<Value, NodeError> {
    let args = message_dict(vec![
        (b"id".as_slice(), Value::Bytes(hex::decode(base_id)?)),
        (b"target".as_slice(), Value::Bytes(hex::decode(target)?)),
    ]);
    Ok(query("find_node", args))
}

// =============================================================================
// COMPACT ENCODINGS
// =============================================================================

/// Concatenate nodes into compact node info (26 bytes each, no delimiter).
pub fn create_compact_node_info(nodes: &[StoredNode]) -> Result<Vec<u8>, NodeError> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        out.extend_from_slice(&node.compact_info()?);
    }
    Ok(out)
}

/// Parse compact node info, 26 bytes at a time. Trailing partial records are
/// discarded.
pub fn parse_compact_node_info(data: &[u8]) -> Vec<Node> {
    data.chunks_exact(COMPACT_NODE_LEN)
        .map(|record| Node {
            id: hex::encode(&record[..20]),
            ip: Ipv4Addr::new(record[20], record[21], record[22], record[23]),
            port: u16::from_be_bytes([record[24], record[25]]),
        })
        .collect()
}

// =============================================================================
// HELPERS
// =============================================================================

fn query(name: &str, args: Value) -> Value {
    message_dict(vec![
        (b"t".as_slice(), Value::Bytes(random_bytes(TRANSACTION_ID_LEN))),
        (b"y".as_slice(), Value::Bytes(b"q".to_vec())),
        (b"q".as_slice(), Value::Bytes(name.as_bytes().to_vec())),
        (b"a".as_slice(), args),
    ])
}

fn message_dict(pairs: Vec<(&[u8], Value)>) -> Value {
    Value::Dict(
        pairs
            .into_iter()
            .map(|(key, value)| (key.to_vec(), value))
            .collect(),
    )
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(bytes.as_mut_slice());
    bytes
}

fn as_dict(value: &Value) -> Option<&Dict> {
    match value {
        Value::Dict(dict) => Some(dict),
        _ => None,
    }
}

fn query_args(message: &Value) -> Result<&Dict, NodeError> {
    as_dict(message)
        .and_then(|top| dict_field(top, b"a"))
        .ok_or(NodeError::Field("a"))
}

fn bytes_field<'a>(dict: &'a Dict, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key) {
        Some(Value::Bytes(bytes)) => Some(bytes.as_slice()),
        _ => None,
    }
}

fn dict_field<'a>(dict: &'a Dict, key: &[u8]) -> Option<&'a Dict> {
    match dict.get(key) {
        Some(Value::Dict(inner)) => Some(inner),
        _ => None,
    }
}

fn int_field(dict: &Dict, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(Value::Int(value)) => Some(*value),
        _ => None,
    }
}
