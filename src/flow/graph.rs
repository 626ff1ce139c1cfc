use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::GraphError;

use super::model::{FlowEdge, FlowGraph, FlowNode};

/// Rejects duplicate node ids and edges pointing at unknown nodes.
pub fn validate(nodes: &[FlowNode], edges: &[FlowEdge]) -> Result<(), GraphError> {
    let mut seen = HashSet::with_capacity(nodes.len());
    for node in nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(GraphError::DuplicateNode(node.id.clone()));
        }
    }

    for edge in edges {
        for endpoint in [&edge.source, &edge.target] {
            if !seen.contains(endpoint.as_str()) {
                return Err(GraphError::DanglingEdge {
                    edge: edge.id.clone(),
                    node: endpoint.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Orders `nodes` so that every edge's source precedes its target.
///
/// Kahn's algorithm. Nodes that become ready at the same time keep their
/// relative order from `nodes`, so the result is deterministic. A graph with a
/// cycle is rejected with [`GraphError::Cycle`] listing the nodes that could
/// not be scheduled.
pub fn order<'a>(
    nodes: &'a [FlowNode],
    edges: &[FlowEdge],
) -> Result<Vec<&'a FlowNode>, GraphError> {
    validate(nodes, edges)?;

    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(position, node)| (node.id.as_str(), position))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for edge in edges {
        let (Some(&source), Some(&target)) =
            (index.get(edge.source.as_str()), index.get(edge.target.as_str()))
        else {
            continue;
        };
        successors[source].push(target);
        in_degree[target] += 1;
    }

    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(nodes.len());

    while let Some(current) = queue.pop_front() {
        sorted.push(&nodes[current]);
        for &next in &successors[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted.len() < nodes.len() {
        let unresolved = nodes
            .iter()
            .zip(&in_degree)
            .filter(|(_, degree)| **degree > 0)
            .map(|(node, _)| node.id.clone())
            .collect();
        return Err(GraphError::Cycle { unresolved });
    }

    Ok(sorted)
}

impl FlowGraph {
    pub fn validate(&self) -> Result<(), GraphError> {
        validate(&self.nodes, &self.edges)
    }

    pub fn execution_order(&self) -> Result<Vec<&FlowNode>, GraphError> {
        order(&self.nodes, &self.edges)
    }
}
