//! Message counters and aggregate stats logging.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use super::node::DhtNode;

/// Monotonically incrementing, explicitly resettable counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Log aggregate message counts for a set of nodes, then reset every counter.
/// Resets are atomic per counter, not across counters.
pub fn log_stats(nodes: &[&DhtNode]) {
    info!(
        "{} nodes, {} messages in, {} messages out",
        nodes.len(),
        nodes.iter().map(|node| node.messages_in().value()).sum::<u64>(),
        nodes.iter().map(|node| node.messages_out().value()).sum::<u64>(),
    );

    for node in nodes {
        node.messages_in().reset();
        node.messages_out().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.value(), 0);

        counter.increment();
        counter.increment();
        assert_eq!(counter.value(), 2);

        counter.reset();
        assert_eq!(counter.value(), 0);
    }
}
