//! Black-box tests driving a running node over UDP loopback through the
//! public API only.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lodestone::net::message::{self, Value};
use lodestone::net::{log_stats, DhtNode, MessageKind, NodeConfig};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const LOCAL_ID_CHAR: &str = "a";
const SENDER_ID: &str = "32f54e697351ff4aec29cdbaabf2fbe3467cc267";

fn local_id() -> String {
    LOCAL_ID_CHAR.repeat(40)
}

fn bytes(data: &[u8]) -> Value {
    Value::Bytes(data.to_vec())
}

fn dict(pairs: Vec<(&[u8], Value)>) -> Value {
    Value::Dict(
        pairs
            .into_iter()
            .map(|(key, value)| (key.to_vec(), value))
            .collect::<HashMap<_, _>>(),
    )
}

fn query(name: &[u8], transaction_id: &[u8], args: Vec<(&[u8], Value)>) -> Value {
    let mut all_args = vec![(b"id".as_slice(), bytes(&hex::decode(SENDER_ID).unwrap()))];
    all_args.extend(args);
    dict(vec![
        (b"t".as_slice(), bytes(transaction_id)),
        (b"y".as_slice(), bytes(b"q")),
        (b"q".as_slice(), bytes(name)),
        (b"a".as_slice(), dict(all_args)),
    ])
}

async fn start_node() -> DhtNode {
    for _ in 0..5 {
        let node = DhtNode::new(NodeConfig {
            node_id: Some(local_id()),
            node_port: None,
        });
        if node.start().await.is_ok() {
            return node;
        }
    }
    panic!("cannot bind a test node");
}

async fn send_query(probe: &UdpSocket, node: &DhtNode, message: &Value) {
    probe
        .send_to(&message::encode(message).unwrap(), ("127.0.0.1", node.port()))
        .await
        .unwrap();
}

async fn recv_reply(probe: &UdpSocket) -> Value {
    let mut buf = vec![0u8; 65535];
    let (len, _) = timeout(Duration::from_secs(5), probe.recv_from(&mut buf))
        .await
        .expect("no reply within 5 seconds")
        .unwrap();
    message::decode(&buf[..len]).unwrap()
}

#[tokio::test]
async fn test_ping_round_trip() {
    let node = start_node().await;
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    send_query(&probe, &node, &query(b"ping", b"tp", vec![])).await;

    let reply = recv_reply(&probe).await;
    assert_eq!(message::classify(&reply), MessageKind::PingResponse);
    assert_eq!(message::transaction_id(&reply).unwrap(), b"tp");
    assert_eq!(message::sender_id(&reply), Some(local_id()));

    node.stop().await;
}

#[tokio::test]
async fn test_announce_then_get_peers() {
    let node = start_node().await;
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let info_hash = hex::decode("8a02007babbfb08a7aeaffaf82902c948f679cfd").unwrap();

    // Announce ourselves as a peer for the info hash.
    send_query(
        &probe,
        &node,
        &query(
            b"announce_peer",
            b"ta",
            vec![
                (b"info_hash".as_slice(), bytes(&info_hash)),
                (b"port".as_slice(), Value::Int(51413)),
                (b"token".as_slice(), bytes(b"xy")),
            ],
        ),
    )
    .await;
    let reply = recv_reply(&probe).await;
    assert_eq!(message::transaction_id(&reply).unwrap(), b"ta");

    // The peer is now served back to a get_peers query.
    send_query(
        &probe,
        &node,
        &query(
            b"get_peers",
            b"tg",
            vec![(b"info_hash".as_slice(), bytes(&info_hash))],
        ),
    )
    .await;
    let reply = recv_reply(&probe).await;
    assert_eq!(message::classify(&reply), MessageKind::GetPeersResponse);

    let Value::Dict(top) = reply else { panic!("expected dict") };
    let Some(Value::Dict(inner)) = top.get(b"r".as_slice()) else {
        panic!("expected r dict")
    };
    let Some(Value::Bytes(token)) = inner.get(b"token".as_slice()) else {
        panic!("expected token")
    };
    assert_eq!(token.len(), 2);

    let Some(Value::List(values)) = inner.get(b"values".as_slice()) else {
        panic!("expected values")
    };
    let mut expected = Ipv4Addr::LOCALHOST.octets().to_vec();
    expected.extend_from_slice(&51413u16.to_be_bytes());
    assert_eq!(values, &vec![Value::Bytes(expected)]);

    node.stop().await;
}

#[tokio::test]
async fn test_get_peers_miss_returns_nodes() {
    let node = start_node().await;
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    send_query(
        &probe,
        &node,
        &query(
            b"get_peers",
            b"tm",
            vec![(b"info_hash".as_slice(), bytes(&[0x42; 20]))],
        ),
    )
    .await;

    let reply = recv_reply(&probe).await;
    // A peerless reply carries compact nodes and no values.
    assert_eq!(message::classify(&reply), MessageKind::FindNodeResponse);

    let Value::Dict(top) = reply else { panic!("expected dict") };
    let Some(Value::Dict(inner)) = top.get(b"r".as_slice()) else {
        panic!("expected r dict")
    };
    let Some(Value::Bytes(nodes)) = inner.get(b"nodes".as_slice()) else {
        panic!("expected nodes")
    };
    assert_eq!(nodes.len() % 26, 0);
    assert!(!nodes.is_empty());
    assert!(!inner.contains_key(b"values".as_slice()));

    node.stop().await;
}

#[tokio::test]
async fn test_message_handler_and_stats() {
    let node = start_node().await;
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let kinds: Arc<Mutex<Vec<MessageKind>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    node.add_message_handler(move |message, _sender| {
        sink.lock().unwrap().push(message::classify(message));
        Ok(())
    });

    send_query(&probe, &node, &query(b"ping", b"ts", vec![])).await;
    recv_reply(&probe).await;

    assert!(kinds.lock().unwrap().contains(&MessageKind::PingRequest));
    assert!(node.messages_in().value() >= 1);
    assert!(node.messages_out().value() >= 1);

    log_stats(&[&node]);
    assert_eq!(node.messages_in().value(), 0);
    assert_eq!(node.messages_out().value(), 0);

    node.stop().await;
}

#[tokio::test]
async fn test_start_stop_is_clean() {
    let node = start_node().await;
    let port = node.port();
    node.stop().await;
    drop(node);

    // The port is released once the node is stopped and dropped.
    let rebind = UdpSocket::bind(("0.0.0.0", port)).await;
    assert!(rebind.is_ok());
}
