//! Mainline DHT networking layer.

pub mod blocklist;
pub mod message;
pub mod node;
pub mod stats;
pub mod table;
pub mod types;

// Re-exports
pub use blocklist::Blocklist;
pub use message::{MessageKind, Value};
pub use node::{DhtNode, MessageHandler, NodeConfig};
pub use stats::{log_stats, Counter};
pub use table::RoutingTable;
pub use types::*;
