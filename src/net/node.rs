//! The DHT node: one UDP socket, a receive/dispatch loop, a maintenance
//! loop, and a serialized send path shared by both.
//!
//! Inbound flow: socket -> decode -> classify -> validate sender ->
//! (blocklist / freshness) -> per-kind handler -> response -> socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::blocklist::Blocklist;
use super::message::{self, MessageKind, Value};
use super::stats::Counter;
use super::table::RoutingTable;
use super::types::{
    now, Node, NodeError, Peer, BOOTSTRAP_NODE_ID, BOOTSTRAP_NODE_IP, BOOTSTRAP_NODE_PORT,
    BOOTSTRAP_ROUNDS, BOOTSTRAP_ROUND_DELAY_SECS, MAINTENANCE_INTERVAL_SECS, MAX_DATAGRAM_SIZE,
    RECV_TIMEOUT_SECS,
};

/// Node configuration. Unset fields are randomized at construction: the id
/// as 20 cryptographically random bytes, the port in 1025..=65535.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// 40-char hex node id.
    pub node_id: Option<String>,
    /// UDP port to listen on.
    pub node_port: Option<u16>,
}

/// Handlers registered on the `all` chain run for every message kind, in
/// registration order, before the per-kind built-ins.
pub type MessageHandler = Arc<dyn Fn(&Value, &Node) -> Result<(), NodeError> + Send + Sync>;

struct NodeInner {
    id: String,
    port: u16,
    routing_table: RoutingTable,
    blocklist: Mutex<Blocklist>,
    handlers: StdMutex<Vec<MessageHandler>>,
    socket: OnceLock<Arc<UdpSocket>>,
    send_lock: Mutex<()>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    messages_in: Counter,
    messages_out: Counter,
}

/// A participating Mainline DHT node. Cheap to clone; all clones share the
/// same underlying node.
#[derive(Clone)]
pub struct DhtNode {
    inner: Arc<NodeInner>,
}

impl DhtNode {
    pub fn new(config: NodeConfig) -> Self {
        let id = config.node_id.unwrap_or_else(random_node_id);
        let port = config
            .node_port
            .unwrap_or_else(|| rand::thread_rng().gen_range(1025..=65535));
        let (stop, _) = watch::channel(false);

        Self {
            inner: Arc::new(NodeInner {
                routing_table: RoutingTable::new(id.clone()),
                id,
                port,
                blocklist: Mutex::new(Blocklist::new()),
                handlers: StdMutex::new(Vec::new()),
                socket: OnceLock::new(),
                send_lock: Mutex::new(()),
                stop,
                tasks: Mutex::new(Vec::new()),
                messages_in: Counter::new(),
                messages_out: Counter::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn messages_in(&self) -> &Counter {
        &self.inner.messages_in
    }

    pub fn messages_out(&self) -> &Counter {
        &self.inner.messages_out
    }

    /// Append a handler to the `all` chain. Registration is additive;
    /// handlers never unregister.
    pub fn add_message_handler<F>(&self, handler: F)
    where
        F: Fn(&Value, &Node) -> Result<(), NodeError> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(handler));
    }

    /// Bind the socket and spawn the receive and maintenance loops.
    pub async fn start(&self) -> Result<(), NodeError> {
        if self.inner.socket.get().is_some() {
            return Err(NodeError::AlreadyStarted);
        }

        info!("Starting node {} at port {}", self.inner.id, self.inner.port);
        let socket = Arc::new(
            UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.inner.port))).await?,
        );
        if self.inner.socket.set(socket).is_err() {
            return Err(NodeError::AlreadyStarted);
        }

        let node = self.clone();
        let receive = tokio::spawn(async move { node.process_messages().await });
        let node = self.clone();
        let maintain = tokio::spawn(async move { node.maintain_routing_table().await });
        self.inner.tasks.lock().await.extend([receive, maintain]);

        Ok(())
    }

    /// Signal both loops to stop and wait for them to finish. No in-flight
    /// datagram is cancelled.
    pub async fn stop(&self) {
        info!("Stopping node {}", self.inner.id);
        let _ = self.inner.stop.send(true);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                debug!("Node task ended abnormally: {}", err);
            }
        }
    }

    /// Bencode and send a message. Sends are serialized so two tasks never
    /// interleave a datagram; failures are logged and swallowed.
    pub async fn send_message(&self, message: &Value, ip: Ipv4Addr, port: u16) {
        let Some(socket) = self.inner.socket.get() else {
            error!("Cannot send message to {}:{}, node is not started", ip, port);
            return;
        };

        let payload = match message::encode(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Cannot send message {:?} to {}:{}, error: {}", message, ip, port, err);
                return;
            }
        };

        let _guard = self.inner.send_lock.lock().await;
        match socket.send_to(&payload, SocketAddr::from((ip, port))).await {
            Ok(_) => self.inner.messages_out.increment(),
            Err(err) => {
                error!("Cannot send message {:?} to {}:{}, error: {}", message, ip, port, err);
            }
        }
    }

    // =========================================================================
    // RECEIVE PATH
    // =========================================================================

    async fn process_messages(&self) {
        let Some(socket) = self.inner.socket.get() else {
            return;
        };
        let socket = Arc::clone(socket);
        let mut stop_rx = self.inner.stop.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        while !*stop_rx.borrow() {
            // Bounded receive so the stop signal is checked at least once a
            // second.
            let received = match timeout(
                Duration::from_secs(RECV_TIMEOUT_SECS),
                socket.recv_from(&mut buf),
            )
            .await
            {
                Ok(Ok(received)) => received,
                Ok(Err(err)) => {
                    error!("Cannot receive message, error: {}", err);
                    continue;
                }
                Err(_) => continue,
            };
            let (len, from) = received;
            self.inner.messages_in.increment();

            let IpAddr::V4(node_ip) = from.ip() else {
                continue;
            };

            if self.inner.blocklist.lock().await.contains(&node_ip) {
                debug!("Ignoring message from blocked IP {}", node_ip);
                continue;
            }

            let message = match message::decode(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    debug!("Cannot decode message from {}, error: {}", node_ip, err);
                    continue;
                }
            };

            let kind = message::classify(&message);

            let Some(node_id) = message::sender_id(&message) else {
                continue;
            };
            let node = Node::new(node_id, node_ip, from.port());

            if !node.is_valid(&self.inner.id) {
                self.inner.blocklist.lock().await.insert(node.ip);
                continue;
            }

            self.dispatch(kind, &message, &node).await;
        }
    }

    async fn dispatch(&self, kind: MessageKind, message: &Value, node: &Node) {
        // The `all` chain: refresh the sender's freshness, then registered
        // handlers in registration order.
        self.inner
            .routing_table
            .save_node(node.clone(), Some(now()))
            .await;
        for handler in self.handler_chain() {
            if let Err(err) = handler(message, node) {
                debug!("Cannot process message {:?}, error: {}", message, err);
            }
        }

        let result = match kind {
            MessageKind::PingRequest => self.on_ping_request(message, node).await,
            MessageKind::FindNodeRequest => self.on_find_node_request(message, node).await,
            MessageKind::GetPeersRequest => self.on_get_peers_request(message, node).await,
            MessageKind::AnnouncePeerRequest => self.on_announce_peer_request(message, node).await,
            MessageKind::FindNodeResponse => self.on_find_node_response(message).await,
            // Plain responses, errors, and unknown kinds need no reply.
            _ => Ok(()),
        };
        if let Err(err) = result {
            debug!("Cannot process message {:?}, error: {}", message, err);
        }
    }

    fn handler_chain(&self) -> Vec<MessageHandler> {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    // =========================================================================
    // BUILT-IN HANDLERS
    // =========================================================================

    async fn on_ping_request(&self, message: &Value, node: &Node) -> Result<(), NodeError> {
        let reply = message::reply_with_id(&message::transaction_id(message)?, &self.inner.id)?;
        self.send_message(&reply, node.ip, node.port).await;
        Ok(())
    }

    async fn on_find_node_request(&self, message: &Value, node: &Node) -> Result<(), NodeError> {
        let args = message::find_node_args(message)?;
        let closest = self.inner.routing_table.get_closest_nodes(&args.target).await;
        let reply = message::reply_with_nodes(
            &message::transaction_id(message)?,
            &self.inner.id,
            &closest,
        )?;
        self.send_message(&reply, node.ip, node.port).await;
        Ok(())
    }

    async fn on_get_peers_request(&self, message: &Value, node: &Node) -> Result<(), NodeError> {
        let args = message::get_peers_args(message)?;
        let transaction_id = message::transaction_id(message)?;

        let peers = self.inner.routing_table.get_peers(&args.info_hash).await;
        let reply = if peers.is_empty() {
            // No peers known, answer with the closest nodes instead.
            let closest = self.inner.routing_table.get_closest_nodes(&args.info_hash).await;
            message::reply_with_nodes(&transaction_id, &self.inner.id, &closest)?
        } else {
            message::reply_with_values(&transaction_id, &self.inner.id, &peers)?
        };
        self.send_message(&reply, node.ip, node.port).await;
        Ok(())
    }

    async fn on_announce_peer_request(&self, message: &Value, node: &Node) -> Result<(), NodeError> {
        let args = message::announce_args(message)?;
        // The announced port is only read when it is not implied by the UDP
        // source port.
        let port = if args.implied_port {
            node.port
        } else {
            args.announced_port()?
        };

        let peer = Peer {
            info_hash: args.info_hash,
            ip: node.ip,
            port,
        };
        self.inner.routing_table.save_peer(peer, &node.id).await;

        let reply = message::reply_with_id(&message::transaction_id(message)?, &self.inner.id)?;
        self.send_message(&reply, node.ip, node.port).await;
        Ok(())
    }

    /// Admit the nodes carried by a find_node response. Invalid entries get
    /// their IP blocked; valid ones are saved without a freshness bump.
    async fn on_find_node_response(&self, message: &Value) -> Result<(), NodeError> {
        for found in message::response_nodes(message)? {
            if !found.is_valid(&self.inner.id) {
                self.inner.blocklist.lock().await.insert(found.ip);
                continue;
            }
            self.inner.routing_table.save_node(found, None).await;
        }
        Ok(())
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    async fn maintain_routing_table(&self) {
        let mut stop_rx = self.inner.stop.subscribe();

        // Bootstrapping: seed an empty table and probe for neighbors of our
        // own id.
        if self.inner.routing_table.is_empty().await {
            self.inner
                .routing_table
                .save_node(
                    Node::new(BOOTSTRAP_NODE_ID, BOOTSTRAP_NODE_IP, BOOTSTRAP_NODE_PORT),
                    None,
                )
                .await;

            for _ in 0..BOOTSTRAP_ROUNDS {
                if *stop_rx.borrow() {
                    break;
                }
                for stored in self.inner.routing_table.get_closest_nodes(&self.inner.id).await {
                    match message::find_node_query(&self.inner.id, &self.inner.id) {
                        Ok(query) => {
                            self.send_message(&query, stored.node.ip, stored.node.port).await
                        }
                        Err(err) => debug!("Cannot build find_node query, error: {}", err),
                    }
                }
                if wait_or_stop(&mut stop_rx, BOOTSTRAP_ROUND_DELAY_SECS).await {
                    break;
                }
            }
        }

        // Maintaining: probe questionable nodes, then prune the ones that
        // never answered.
        while !*stop_rx.borrow() {
            self.ping_questionable_nodes().await;
            self.inner.routing_table.delete_unresponsive_nodes().await;
            if wait_or_stop(&mut stop_rx, MAINTENANCE_INTERVAL_SECS).await {
                break;
            }
        }
    }

    async fn ping_questionable_nodes(&self) {
        for stored in self.inner.routing_table.get_all_nodes().await {
            if !stored.is_questionable() {
                continue;
            }
            match message::ping_query(&self.inner.id) {
                Ok(query) => self.send_message(&query, stored.node.ip, stored.node.port).await,
                Err(err) => debug!("Cannot build ping query, error: {}", err),
            }
        }
    }
}

/// Interruptible sleep. Returns true when stop was requested.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, secs: u64) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
        _ = stop_rx.changed() => {}
    }
    *stop_rx.borrow()
}

fn random_node_id() -> String {
    let mut id = [0u8; 20];
    rand::thread_rng().fill(&mut id[..]);
    hex::encode(id)
}
