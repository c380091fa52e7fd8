//! Workflow graph validation.
//!
//! Admission-time checks over the node list: the graph is non-empty, node
//! ids are unique and typed, and every reference (edge target, dependency
//! barrier, skip-to target) resolves to a known node. Edge conditions must
//! carry the operands their type requires.
//!
//! Cycles are allowed: the scheduler's per-(execution, step) dedup makes a
//! revisited node a no-op, so validation only guards referential integrity.
//! Nodes unreachable from the entry point produce a warning, not an error.

use std::collections::HashMap;

use petgraph::graph::DiGraph;
use petgraph::visit::Dfs;

use weft_types::workflow::Node;

/// Violations that make a workflow graph inadmissible.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The node list is empty.
    #[error("invalid workflow: graph has no nodes")]
    EmptyGraph,

    /// Two nodes share an id.
    #[error("invalid workflow: duplicate node id '{0}'")]
    DuplicateNodeId(String),

    /// A node has an empty type tag.
    #[error("invalid workflow: node '{0}' has no type")]
    MissingNodeType(String),

    /// An edge points at a node that does not exist.
    #[error("invalid workflow: node '{node}' routes to unknown node '{target}'")]
    UnknownEdgeTarget { node: String, target: String },

    /// A dependency barrier names a node that does not exist.
    #[error("invalid workflow: node '{node}' waits for unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    /// A skip-to policy names a node that does not exist.
    #[error("invalid workflow: node '{node}' skips to unknown node '{target}'")]
    UnknownSkipTarget { node: String, target: String },

    /// An edge condition is missing its field operand.
    #[error(
        "invalid workflow: edge '{node}' -> '{target}' needs condition_field for its condition type"
    )]
    MissingConditionField { node: String, target: String },

    /// An edge condition is missing its value operand.
    #[error(
        "invalid workflow: edge '{node}' -> '{target}' needs condition_value for its condition type"
    )]
    MissingConditionValue { node: String, target: String },
}

/// Validate a workflow's node list for admission.
///
/// The first node of the list is the entry point.
pub fn validate_graph(nodes: &[Node]) -> Result<(), GraphError> {
    if nodes.is_empty() {
        return Err(GraphError::EmptyGraph);
    }

    let mut id_to_idx: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (idx, node) in nodes.iter().enumerate() {
        if node.node_type.trim().is_empty() {
            return Err(GraphError::MissingNodeType(node.id.clone()));
        }
        if id_to_idx.insert(node.id.as_str(), idx).is_some() {
            return Err(GraphError::DuplicateNodeId(node.id.clone()));
        }
    }

    // Referential integrity plus per-edge condition operand checks.
    for node in nodes {
        for edge in &node.next_steps {
            if !id_to_idx.contains_key(edge.target_id.as_str()) {
                return Err(GraphError::UnknownEdgeTarget {
                    node: node.id.clone(),
                    target: edge.target_id.clone(),
                });
            }
            if edge.condition_type.requires_field() && edge.condition_field.is_none() {
                return Err(GraphError::MissingConditionField {
                    node: node.id.clone(),
                    target: edge.target_id.clone(),
                });
            }
            if edge.condition_type.requires_value() && edge.condition_value.is_none() {
                return Err(GraphError::MissingConditionValue {
                    node: node.id.clone(),
                    target: edge.target_id.clone(),
                });
            }
        }
        for dependency in &node.wait_for {
            if !id_to_idx.contains_key(dependency.as_str()) {
                return Err(GraphError::UnknownDependency {
                    node: node.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        if let Some(policy) = &node.error_handling {
            if let Some(target) = &policy.skip_to_step_id {
                if !id_to_idx.contains_key(target.as_str()) {
                    return Err(GraphError::UnknownSkipTarget {
                        node: node.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }

    warn_unreachable(nodes, &id_to_idx);
    Ok(())
}

/// Walk the graph from the entry node and warn about unreachable nodes.
fn warn_unreachable(nodes: &[Node], id_to_idx: &HashMap<&str, usize>) {
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = nodes.iter().map(|n| graph.add_node(n.id.as_str())).collect();

    for (idx, node) in nodes.iter().enumerate() {
        for edge in &node.next_steps {
            let target_idx = id_to_idx[edge.target_id.as_str()];
            graph.add_edge(node_indices[idx], node_indices[target_idx], ());
        }
    }

    let mut reachable = vec![false; nodes.len()];
    let mut dfs = Dfs::new(&graph, node_indices[0]);
    while let Some(visited) = dfs.next(&graph) {
        reachable[visited.index()] = true;
    }

    for (idx, node) in nodes.iter().enumerate() {
        // Barrier-joined nodes are reached through edges too, so anything
        // still unreached can never execute.
        if !reachable[idx] {
            tracing::warn!(
                node_id = node.id.as_str(),
                "node is unreachable from the entry point"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
