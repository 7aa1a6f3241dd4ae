//! Flat chain records to a validated, sorted hierarchy.

mod builder;
mod cache;

use std::collections::HashSet;

pub use builder::{build_tree, build_tree_with_report, TreeBuild, TreeDiagnostic};
pub use cache::{metadata_hash, structural_hash, ChangeKind, TreeCache, TreeCacheStats};

use crate::models::{Chain, ChainTreeNode};

/// Depth-first search over a forest.
pub fn find_node<'a>(roots: &'a [ChainTreeNode], id: &str) -> Option<&'a ChainTreeNode> {
    for root in roots {
        if root.id() == id {
            return Some(root);
        }
        if let Some(found) = find_node(&root.children, id) {
            return Some(found);
        }
    }
    None
}

/// Parent ids of `id`, nearest first. Stops at a repeated id, so loops end.
pub fn ancestor_ids(chains: &[Chain], id: &str) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::from([id]);
    let mut out = Vec::new();
    let mut current = chains.iter().find(|c| c.id == id);

    while let Some(parent_id) = current.and_then(|c| c.parent_id.as_deref()) {
        if !seen.insert(parent_id) {
            break;
        }
        out.push(parent_id.to_string());
        current = chains.iter().find(|c| c.id == parent_id);
    }
    out
}

/// Every record below `id` in the flat list (children, grandchildren, ...).
pub fn descendant_ids(chains: &[Chain], id: &str) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::from([id]);
    let mut out = Vec::new();
    let mut frontier = vec![id];

    while let Some(parent) = frontier.pop() {
        for child in chains
            .iter()
            .filter(|c| c.parent_id.as_deref() == Some(parent))
        {
            if seen.insert(child.id.as_str()) {
                out.push(child.id.clone());
                frontier.push(child.id.as_str());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(id: &str, parent: Option<&str>) -> Chain {
        Chain {
            id: id.into(),
            parent_id: parent.map(str::to_string),
            ..Chain::default()
        }
    }

    #[test]
    fn ancestors_nearest_first() {
        let chains = vec![chain("root", None), chain("mid", Some("root")), chain("leaf", Some("mid"))];
        assert_eq!(ancestor_ids(&chains, "leaf"), vec!["mid", "root"]);
        assert!(ancestor_ids(&chains, "root").is_empty());
    }

    #[test]
    fn ancestor_walk_stops_on_loops() {
        let chains = vec![chain("a", Some("b")), chain("b", Some("a"))];
        assert_eq!(ancestor_ids(&chains, "a"), vec!["b"]);
    }

    #[test]
    fn descendants_cover_nested_levels() {
        let chains = vec![
            chain("g", None),
            chain("u1", Some("g")),
            chain("inner", Some("g")),
            chain("u2", Some("inner")),
            chain("other", None),
        ];
        let mut ids = descendant_ids(&chains, "g");
        ids.sort();
        assert_eq!(ids, vec!["inner", "u1", "u2"]);
    }

    #[test]
    fn find_node_searches_nested_children() {
        let roots = build_tree(&[chain("g", None), chain("u", Some("g"))]);
        assert_eq!(find_node(&roots, "u").map(|n| n.depth), Some(1));
        assert!(find_node(&roots, "missing").is_none());
    }
}
