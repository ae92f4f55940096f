//! Per-run node snapshot
//!
//! Node records are loaded once at the start of a run. Liveness stays as
//! loaded; counters are updated in place as the run commits replicas, so
//! later chunks in the same run see the load it has already added.

use chunkvault_metadata::{MetadataRepository, Node, Result};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    nodes: BTreeMap<Uuid, Node>,
}

impl NodeSnapshot {
    /// Load every node from the repository
    pub async fn load(repo: &dyn MetadataRepository) -> Result<Self> {
        let nodes = repo.list_nodes().await?;
        Ok(Self::from_nodes(nodes))
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
        }
    }

    pub fn get(&self, node_id: &Uuid) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Online nodes, ordered by id
    pub fn online(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.is_online())
    }

    pub fn online_count(&self) -> usize {
        self.online().count()
    }

    /// The online members of `node_ids`, ordered by load then id
    pub fn online_among(&self, node_ids: &HashSet<Uuid>) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .online()
            .filter(|n| node_ids.contains(&n.id))
            .cloned()
            .collect();
        nodes.sort_by_key(|n| (n.load(), n.id));
        nodes
    }

    /// Write back a node whose counters were updated this run.
    ///
    /// Liveness is kept from the snapshot.
    pub fn update_counters(&mut self, node: &Node) {
        if let Some(entry) = self.nodes.get_mut(&node.id) {
            entry.reset_counters(node.load(), node.storage_usage());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkvault_metadata::NodeStatus;

    #[test]
    fn test_online_among_sorted_by_load() {
        let snapshot = NodeSnapshot::from_nodes(vec![
            Node::new(Uuid::from_u128(1), "a").with_load(5),
            Node::new(Uuid::from_u128(2), "b").with_load(1),
            Node::new(Uuid::from_u128(3), "c").with_status(NodeStatus::Offline),
        ]);
        let ids: HashSet<Uuid> = (1..=3).map(Uuid::from_u128).collect();
        let online: Vec<u128> = snapshot
            .online_among(&ids)
            .iter()
            .map(|n| n.id.as_u128())
            .collect();
        assert_eq!(online, vec![2, 1]);
        assert_eq!(snapshot.online_count(), 2);
    }

    #[test]
    fn test_update_counters_keeps_status() {
        let mut snapshot = NodeSnapshot::from_nodes(vec![
            Node::new(Uuid::from_u128(1), "a").with_status(NodeStatus::Offline)
        ]);
        let mut changed = Node::new(Uuid::from_u128(1), "a");
        changed.record_replica_added(10);
        snapshot.update_counters(&changed);

        let node = snapshot.get(&Uuid::from_u128(1)).unwrap();
        assert_eq!(node.load(), 1);
        assert_eq!(node.storage_usage(), 10);
        assert!(!node.is_online());
    }
}
