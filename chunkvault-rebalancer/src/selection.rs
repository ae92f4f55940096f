//! Node selection policy
//!
//! Picks where new replicas go: the least-loaded eligible nodes first, ties
//! broken by node id so identical inputs always yield the same list.

use chunkvault_metadata::Node;
use std::collections::HashSet;
use uuid::Uuid;

/// Whether `node` may receive a replica of a chunk held by `have`
pub fn is_eligible(
    node: &Node,
    have: &HashSet<Uuid>,
    chunk_size: i64,
    respect_capacity: bool,
) -> bool {
    node.is_online()
        && !have.contains(&node.id)
        && (!respect_capacity || node.has_room_for(chunk_size))
}

/// Select at most `need` target nodes from `candidates`.
///
/// Nodes already in `have`, offline nodes and (with `respect_capacity`)
/// nodes without room for `chunk_size` bytes are excluded. The result is
/// ordered ascending by load, then id. Fewer than `need` nodes come back when
/// fewer are eligible.
pub fn select_targets<'a>(
    need: usize,
    have: &HashSet<Uuid>,
    candidates: impl IntoIterator<Item = &'a Node>,
    chunk_size: i64,
    respect_capacity: bool,
) -> Vec<&'a Node> {
    if need == 0 {
        return Vec::new();
    }

    let mut eligible: Vec<&Node> = candidates
        .into_iter()
        .filter(|n| is_eligible(n, have, chunk_size, respect_capacity))
        .collect();

    eligible.sort_by_key(|n| (n.load(), n.id));
    eligible.truncate(need);
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkvault_metadata::NodeStatus;
    use proptest::prelude::*;

    fn node(id: u128, load: i64) -> Node {
        Node::new(Uuid::from_u128(id), format!("http://node-{}:9000", id)).with_load(load)
    }

    fn ids(nodes: &[&Node]) -> Vec<u128> {
        nodes.iter().map(|n| n.id.as_u128()).collect()
    }

    #[test]
    fn test_lowest_load_first() {
        let nodes = vec![node(1, 30), node(2, 10), node(3, 20)];
        let picked = select_targets(2, &HashSet::new(), &nodes, 1, true);
        assert_eq!(ids(&picked), vec![2, 3]);
    }

    #[test]
    fn test_excludes_holders_and_offline() {
        let nodes = vec![
            node(1, 0),
            node(2, 5).with_status(NodeStatus::Offline),
            node(3, 10),
            node(4, 20),
        ];
        let have: HashSet<Uuid> = [Uuid::from_u128(1)].into_iter().collect();
        let picked = select_targets(3, &have, &nodes, 1, true);
        assert_eq!(ids(&picked), vec![3, 4]);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let nodes = vec![node(9, 5), node(3, 5), node(7, 5)];
        let picked = select_targets(3, &HashSet::new(), &nodes, 1, true);
        assert_eq!(ids(&picked), vec![3, 7, 9]);
    }

    #[test]
    fn test_capacity_guard() {
        let nodes = vec![
            node(1, 0).with_capacity(100).with_storage_usage(95),
            node(2, 50).with_capacity(100),
        ];
        let picked = select_targets(2, &HashSet::new(), &nodes, 10, true);
        assert_eq!(ids(&picked), vec![2]);

        let picked = select_targets(2, &HashSet::new(), &nodes, 10, false);
        assert_eq!(ids(&picked), vec![1, 2]);
    }

    #[test]
    fn test_zero_need() {
        let nodes = vec![node(1, 0)];
        assert!(select_targets(0, &HashSet::new(), &nodes, 1, true).is_empty());
    }

    proptest! {
        #[test]
        fn prop_deterministic_and_sorted(
            loads in proptest::collection::vec(0i64..20, 0..12),
            need in 0usize..8,
        ) {
            let nodes: Vec<Node> = loads
                .iter()
                .enumerate()
                .map(|(i, load)| node(i as u128 + 1, *load))
                .collect();
            let mut reversed = nodes.clone();
            reversed.reverse();

            let first = ids(&select_targets(need, &HashSet::new(), &nodes, 1, true));
            let second = ids(&select_targets(need, &HashSet::new(), &reversed, 1, true));
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), need.min(nodes.len()));

            let picked = select_targets(need, &HashSet::new(), &nodes, 1, true);
            for pair in picked.windows(2) {
                prop_assert!((pair[0].load(), pair[0].id) < (pair[1].load(), pair[1].id));
            }
        }
    }
}
