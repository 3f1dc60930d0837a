//! Routing table keyed by node id, ordered by prefix distance.
//!
//! The table owns its stored nodes outright. Every operation takes the
//! table's own mutex for its whole duration, and every read hands out
//! freshly cloned snapshots, never references into the internal map.

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;

use super::types::{
    now, prefix_distance, Node, Peer, StoredNode, MAX_CLOSEST_NODES, MAX_STORED_DISTANCE,
    MIN_TABLE_NODES,
};

pub struct RoutingTable {
    base_id: String,
    nodes: Mutex<HashMap<String, StoredNode>>,
}

impl RoutingTable {
    pub fn new(base_id: impl Into<String>) -> Self {
        Self {
            base_id: base_id.into(),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a node, or refresh its communication time if it is already
    /// stored and `communicated` is supplied. The base node itself is never
    /// stored. New entries are admitted when they fall inside the local
    /// neighborhood (distance <= 36) or while the table is still small.
    pub async fn save_node(&self, node: Node, communicated: Option<u64>) {
        if node.id == self.base_id {
            return;
        }

        let mut nodes = self.nodes.lock().await;
        match nodes.get_mut(&node.id) {
            Some(stored) if communicated.is_some() => stored.communicated = communicated,
            _ => {
                let distance = prefix_distance(&self.base_id, &node.id);
                if distance <= MAX_STORED_DISTANCE || nodes.len() < MIN_TABLE_NODES {
                    nodes.insert(
                        node.id.clone(),
                        StoredNode {
                            node,
                            added: now(),
                            communicated,
                            distance,
                            peers: HashSet::new(),
                        },
                    );
                }
            }
        }
    }

    /// Attach a peer to the node it was announced through. No effect when the
    /// node is not stored. Set semantics: re-announcing is idempotent.
    pub async fn save_peer(&self, peer: Peer, node_id: &str) {
        if let Some(stored) = self.nodes.lock().await.get_mut(node_id) {
            stored.peers.insert(peer);
        }
    }

    /// Snapshot of all stored nodes.
    pub async fn get_all_nodes(&self) -> Vec<StoredNode> {
        self.nodes.lock().await.values().cloned().collect()
    }

    /// Up to 7 stored nodes closest to the given id, ascending by prefix
    /// distance.
    pub async fn get_closest_nodes(&self, node_id: &str) -> Vec<StoredNode> {
        let mut closest: Vec<StoredNode> = self.nodes.lock().await.values().cloned().collect();
        closest.sort_by_key(|stored| prefix_distance(node_id, &stored.node.id));
        closest.truncate(MAX_CLOSEST_NODES);
        closest
    }

    /// Every stored peer announced for the given info hash.
    pub async fn get_peers(&self, info_hash: &str) -> Vec<Peer> {
        self.nodes
            .lock()
            .await
            .values()
            .flat_map(|stored| stored.peers.iter())
            .filter(|peer| peer.info_hash == info_hash)
            .cloned()
            .collect()
    }

    /// Drop every node that is unresponsive at this moment.
    pub async fn delete_unresponsive_nodes(&self) {
        self.nodes
            .lock()
            .await
            .retain(|_, stored| !stored.is_unresponsive());
    }

    pub async fn len(&self) -> usize {
        self.nodes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_node(id: impl Into<String>) -> Node {
        Node::new(id, Ipv4Addr::new(10, 0, 0, 1), 1)
    }

    #[tokio::test]
    async fn test_save_node_base_id_excluded() {
        let base_id = "abcd".to_string() + &"0".repeat(36);
        let table = RoutingTable::new(base_id.clone());

        table.save_node(test_node(base_id), None).await;
        assert!(table.get_all_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_save_node_small_table() {
        // Distant nodes are admitted only while the table holds fewer than 7.
        let table = RoutingTable::new("abcd".to_string() + &"0".repeat(36));
        for i in 0..7 {
            table.save_node(test_node("0000".to_string() + &i.to_string().repeat(36)), None).await;
        }
        assert_eq!(table.len().await, 7);

        table.save_node(test_node("0000".to_string() + &"a".repeat(36)), None).await;
        assert_eq!(table.len().await, 7);
    }

    #[tokio::test]
    async fn test_save_node_neighborhood() {
        // Close nodes (distance <= 36) are admitted without limit.
        let base_id = "abcd".to_string() + &"a".repeat(36);
        let table = RoutingTable::new(base_id);
        for i in 0..512 {
            let id = format!("abcd{:0>36}", i);
            table.save_node(test_node(id), None).await;
        }
        assert_eq!(table.len().await, 512);

        // One more distant node is rejected.
        table.save_node(test_node("1234".to_string() + &"a".repeat(36)), None).await;
        assert_eq!(table.len().await, 512);
    }

    #[tokio::test]
    async fn test_save_node_refreshes_communicated_only() {
        let table = RoutingTable::new("abcd".to_string() + &"0".repeat(36));
        let node = test_node("1234".to_string() + &"0".repeat(36));

        table.save_node(node.clone(), None).await;
        let before = table.get_all_nodes().await.remove(0);
        assert_eq!(before.communicated, None);

        let peer = Peer {
            info_hash: "11".repeat(20),
            ip: Ipv4Addr::new(10, 0, 0, 2),
            port: 2,
        };
        table.save_peer(peer, &node.id).await;

        let communicated = now() - 60;
        table.save_node(node, Some(communicated)).await;
        let after = table.get_all_nodes().await.remove(0);

        assert_eq!(after.communicated, Some(communicated));
        assert_eq!(after.added, before.added);
        assert_eq!(after.distance, before.distance);
        assert_eq!(after.node, before.node);
        assert_eq!(after.peers.len(), 1);
    }

    #[tokio::test]
    async fn test_get_closest_nodes() {
        let table = RoutingTable::new("abcd".to_string() + &"0".repeat(36));

        for i in 0..7 {
            table.save_node(test_node(format!("7777{:0>36}", i)), None).await;
        }
        for i in 0..512 {
            table.save_node(test_node(format!("0000{:0>36}", i)), None).await;
        }

        let found = table.get_closest_nodes(&("7777".to_string() + &"0".repeat(36))).await;
        assert_eq!(found.len(), MAX_CLOSEST_NODES);
        assert!(found.iter().all(|stored| stored.node.id.starts_with("7777")));

        // Ascending by distance to the target.
        let target = "7777".to_string() + &"0".repeat(36);
        let distances: Vec<u32> = found
            .iter()
            .map(|stored| prefix_distance(&target, &stored.node.id))
            .collect();
        let mut sorted = distances.clone();
        sorted.sort_unstable();
        assert_eq!(distances, sorted);
    }

    #[tokio::test]
    async fn test_save_peer() {
        let table = RoutingTable::new("abcd".to_string() + &"0".repeat(36));

        let node_1 = test_node("1234".to_string() + &"0".repeat(36));
        let node_2 = test_node("5678".to_string() + &"0".repeat(36));
        table.save_node(node_1, None).await;
        table.save_node(node_2.clone(), None).await;

        let peer_1 = Peer {
            info_hash: "11".repeat(20),
            ip: Ipv4Addr::new(10, 0, 0, 2),
            port: 1,
        };
        let peer_2 = Peer {
            info_hash: "22".repeat(20),
            ip: Ipv4Addr::new(10, 0, 0, 2),
            port: 1,
        };

        table.save_peer(peer_1.clone(), &node_2.id).await;
        table.save_peer(peer_1.clone(), &node_2.id).await;
        table.save_peer(peer_2.clone(), &node_2.id).await;
        table.save_peer(peer_2.clone(), "missing_node").await;

        for stored in table.get_all_nodes().await {
            if stored.node.id == node_2.id {
                assert_eq!(stored.peers.len(), 2);
            } else {
                assert!(stored.peers.is_empty());
            }
        }

        assert_eq!(table.get_peers(&peer_1.info_hash).await, vec![peer_1]);
    }

    #[tokio::test]
    async fn test_delete_unresponsive_nodes() {
        let table = RoutingTable::new("abcd".to_string() + &"0".repeat(36));
        let node = test_node("1234".to_string() + &"0".repeat(36));

        // Freshly added: neither questionable nor unresponsive.
        table.save_node(node.clone(), None).await;
        table.delete_unresponsive_nodes().await;
        let stored = table.get_all_nodes().await.remove(0);
        assert!(!stored.is_questionable());
        assert!(!stored.is_unresponsive());

        // Heard from a minute ago: still fine.
        table.save_node(node.clone(), Some(now() - 60)).await;
        table.delete_unresponsive_nodes().await;
        let stored = table.get_all_nodes().await.remove(0);
        assert!(!stored.is_questionable());
        assert!(!stored.is_unresponsive());

        // Ten minutes ago: questionable but kept.
        table.save_node(node.clone(), Some(now() - 10 * 60)).await;
        table.delete_unresponsive_nodes().await;
        let stored = table.get_all_nodes().await.remove(0);
        assert!(stored.is_questionable());
        assert!(!stored.is_unresponsive());

        // Twenty minutes ago: gone.
        table.save_node(node, Some(now() - 20 * 60)).await;
        table.delete_unresponsive_nodes().await;
        assert!(table.get_all_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_boundary() {
        let table = RoutingTable::new("abcd".to_string() + &"0".repeat(36));

        let survivor = test_node("1234".to_string() + &"0".repeat(36));
        let goner = test_node("5678".to_string() + &"0".repeat(36));
        table.save_node(survivor.clone(), Some(now() - 15 * 60 + 30)).await;
        table.save_node(goner, Some(now() - 15 * 60 - 30)).await;

        table.delete_unresponsive_nodes().await;
        let remaining = table.get_all_nodes().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].node.id, survivor.id);
    }
}
