pub mod net;

pub use net::{
    log_stats, now, prefix_distance, Blocklist, Counter, DhtNode, MessageKind, Node, NodeConfig,
    NodeError, Peer, RoutingTable, StoredNode, Value,
};
