use std::collections::{HashMap, HashSet};

use crate::models::{Chain, ChainTreeNode};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_warn};

/// A repair or defect noticed while building the tree. None of these abort the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeDiagnostic {
    /// Input entry at `index` had an empty id and was dropped.
    MissingId { index: usize },
    /// Two entries shared an id; the later one replaced the earlier.
    DuplicateId { id: String },
    /// `parent_id == id`; the node was promoted to root.
    SelfParent { id: String },
    /// Parent is not among the input records; the node was promoted to root.
    OrphanedParent { id: String, parent_id: String },
    /// Node was unreachable from any root (parent loop); its parent link was cut.
    CycleBroken { id: String, parent_id: String },
    /// Post-condition failure: these input ids are absent from the output.
    MissingFromTree { ids: Vec<String> },
}

#[derive(Debug, Clone, Default)]
pub struct TreeBuild {
    pub roots: Vec<ChainTreeNode>,
    pub diagnostics: Vec<TreeDiagnostic>,
}

/// Builds the sorted hierarchy for `chains`. Never panics; bad links are repaired.
pub fn build_tree(chains: &[Chain]) -> Vec<ChainTreeNode> {
    build_tree_with_report(chains).roots
}

pub fn build_tree_with_report(chains: &[Chain]) -> TreeBuild {
    let mut diagnostics = Vec::new();

    // First-seen order drives tie-breaking between equal sort orders.
    let mut order: Vec<String> = Vec::with_capacity(chains.len());
    let mut records: HashMap<String, Chain> = HashMap::with_capacity(chains.len());

    for (index, chain) in chains.iter().enumerate() {
        if chain.id.trim().is_empty() {
            log_warn!("dropping chain at index {index}: missing id");
            diagnostics.push(TreeDiagnostic::MissingId { index });
            continue;
        }

        let mut record = chain.clone();
        if record.parent_id.as_deref() == Some("") {
            record.parent_id = None;
        }
        if record.parent_id.as_deref() == Some(record.id.as_str()) {
            log_warn!("chain {} references itself as parent; promoting to root", record.id);
            diagnostics.push(TreeDiagnostic::SelfParent {
                id: record.id.clone(),
            });
            record.parent_id = None;
        }

        if records.contains_key(&record.id) {
            log_warn!("duplicate chain id {}; keeping the later record", record.id);
            diagnostics.push(TreeDiagnostic::DuplicateId {
                id: record.id.clone(),
            });
        } else {
            order.push(record.id.clone());
        }
        records.insert(record.id.clone(), record);
    }

    for id in &order {
        let dangling = records[id]
            .parent_id
            .as_ref()
            .filter(|parent| !records.contains_key(parent.as_str()))
            .cloned();
        if let Some(parent_id) = dangling {
            log_warn!("chain {id} has missing parent {parent_id}; promoting to root");
            diagnostics.push(TreeDiagnostic::OrphanedParent {
                id: id.clone(),
                parent_id,
            });
            if let Some(record) = records.get_mut(id) {
                record.parent_id = None;
            }
        }
    }

    let mut children_of: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut root_ids: Vec<&str> = Vec::new();
    for id in &order {
        match records[id].parent_id.as_deref() {
            Some(parent) => children_of.entry(parent).or_default().push(id.as_str()),
            None => root_ids.push(id.as_str()),
        }
    }

    let mut visited: HashSet<&str> = HashSet::with_capacity(order.len());
    let mut roots: Vec<ChainTreeNode> = Vec::with_capacity(root_ids.len());
    for &root_id in &root_ids {
        if let Some(node) = build_node(root_id, 0, &records, &children_of, &mut visited) {
            roots.push(node);
        }
    }

    // Anything still unvisited sits on a parent loop. Cut it loose as a root.
    for id in &order {
        if visited.contains(id.as_str()) {
            continue;
        }
        let parent_id = records[id].parent_id.clone().unwrap_or_default();
        log_warn!("chain {id} is part of a parent cycle via {parent_id}; promoting to root");
        diagnostics.push(TreeDiagnostic::CycleBroken {
            id: id.clone(),
            parent_id,
        });
        if let Some(mut node) = build_node(id.as_str(), 0, &records, &children_of, &mut visited) {
            node.chain.parent_id = None;
            roots.push(node);
        }
    }

    roots.sort_by_key(|node| node.chain.sort_order);

    let placed: HashSet<&str> = roots
        .iter()
        .flat_map(|root| root.walk())
        .map(|node| node.id())
        .collect();
    let missing: Vec<String> = order
        .iter()
        .filter(|id| !placed.contains(id.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        log_error!("tree build lost {} chain(s): {:?}", missing.len(), missing);
        diagnostics.push(TreeDiagnostic::MissingFromTree { ids: missing });
    }

    TreeBuild { roots, diagnostics }
}

fn build_node<'a>(
    id: &'a str,
    depth: u32,
    records: &'a HashMap<String, Chain>,
    children_of: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
) -> Option<ChainTreeNode> {
    if !visited.insert(id) {
        return None;
    }
    let chain = records.get(id)?.clone();

    let mut children: Vec<ChainTreeNode> = children_of
        .get(id)
        .map(|ids| {
            ids.iter()
                .filter_map(|&child| build_node(child, depth + 1, records, children_of, visited))
                .collect()
        })
        .unwrap_or_default();
    children.sort_by_key(|node| node.chain.sort_order);

    Some(ChainTreeNode {
        chain,
        children,
        depth,
    })
}
