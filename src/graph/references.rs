use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Stable identity token for a tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Directed link `owner.property -> target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEdge {
    pub owner: ObjectId,
    pub property: String,
    pub target: ObjectId,
}

/// A cycle closed by one `track` call, edges in traversal order starting with
/// the edge that closed it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub owner_type: String,
    pub property: String,
    pub target_type: String,
    pub edges: Vec<ReferenceEdge>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

const UNKNOWN_TYPE: &str = "unknown";

/// Object-to-object links recorded by application code, with cycle detection.
///
/// Objects are identified by [`ObjectId`] handles so nothing here keeps the
/// objects themselves alive.
#[derive(Default)]
pub struct ReferenceGraph {
    graph: StableDiGraph<ObjectId, String>,
    nodes: HashMap<ObjectId, NodeIndex>,
    types: HashMap<ObjectId, String>,
    next_id: u64,
    cycles: Vec<CycleReport>,
}

impl ReferenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a handle for an object of the given type
    pub fn register(&mut self, type_name: impl Into<String>) -> ObjectId {
        self.next_id += 1;
        let id = ObjectId(self.next_id);
        self.types.insert(id, type_name.into());
        self.node(id);
        id
    }

    pub fn type_name(&self, id: ObjectId) -> &str {
        self.types.get(&id).map(String::as_str).unwrap_or(UNKNOWN_TYPE)
    }

    fn node(&mut self, id: ObjectId) -> NodeIndex {
        if let Some(&index) = self.nodes.get(&id) {
            return index;
        }
        let index = self.graph.add_node(id);
        self.nodes.insert(id, index);
        index
    }

    /// Record `owner.property -> target`, replacing any previous target of
    /// that property. Returns true when the new edge closes a cycle.
    pub fn track(&mut self, owner: ObjectId, property: &str, target: ObjectId) -> bool {
        let from = self.node(owner);
        let to = self.node(target);

        let previous: Vec<EdgeIndex> = self
            .graph
            .edges_directed(from, Direction::Outgoing)
            .filter(|edge| edge.weight() == property)
            .map(|edge| edge.id())
            .collect();
        for edge in previous {
            self.graph.remove_edge(edge);
        }

        // Look for the way back before adding the new edge
        let path_back = self.path(to, from);
        self.graph.add_edge(from, to, property.to_string());

        let Some(path_back) = path_back else {
            return false;
        };

        let mut edges = vec![ReferenceEdge {
            owner,
            property: property.to_string(),
            target,
        }];
        edges.extend(path_back);

        let report = CycleReport {
            owner_type: self.type_name(owner).to_string(),
            property: property.to_string(),
            target_type: self.type_name(target).to_string(),
            edges,
        };
        warn!(
            "Circular reference: {}.{} -> {} ({} edges)",
            report.owner_type,
            report.property,
            report.target_type,
            report.edges.len()
        );
        self.cycles.push(report);
        true
    }

    /// Edges of some path from `start` to `goal`, empty when they coincide
    fn path(&self, start: NodeIndex, goal: NodeIndex) -> Option<Vec<ReferenceEdge>> {
        if start == goal {
            return Some(Vec::new());
        }

        let mut came_from: HashMap<NodeIndex, EdgeIndex> = HashMap::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                let next = edge.target();
                if next == start || came_from.contains_key(&next) {
                    continue;
                }
                came_from.insert(next, edge.id());
                if next == goal {
                    return Some(self.unwind(&came_from, start, goal));
                }
                stack.push(next);
            }
        }
        None
    }

    fn unwind(
        &self,
        came_from: &HashMap<NodeIndex, EdgeIndex>,
        start: NodeIndex,
        goal: NodeIndex,
    ) -> Vec<ReferenceEdge> {
        let mut edges = Vec::new();
        let mut current = goal;
        while current != start {
            let Some(&edge) = came_from.get(&current) else {
                break;
            };
            let Some((source, target)) = self.graph.edge_endpoints(edge) else {
                break;
            };
            edges.push(ReferenceEdge {
                owner: self.graph[source],
                property: self.graph[edge].clone(),
                target: self.graph[target],
            });
            current = source;
        }
        edges.reverse();
        edges
    }

    /// Whether some path from `from` returns to a node already on it
    pub fn has_cycle(&self, from: ObjectId) -> bool {
        let Some(&start) = self.nodes.get(&from) else {
            return false;
        };

        let successors = |node: NodeIndex| -> Vec<NodeIndex> {
            self.graph.neighbors_directed(node, Direction::Outgoing).collect()
        };

        let mut marks: HashMap<NodeIndex, Mark> = HashMap::new();
        marks.insert(start, Mark::OnPath);
        let mut stack = vec![(start, successors(start))];

        while let Some((node, pending)) = stack.last_mut() {
            let node = *node;
            match pending.pop() {
                Some(next) => match marks.get(&next) {
                    Some(Mark::OnPath) => return true,
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::OnPath);
                        stack.push((next, successors(next)));
                    }
                },
                None => {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                }
            }
        }
        false
    }

    /// Cycle reports accumulated since the last `clear_all`
    pub fn cycles(&self) -> &[CycleReport] {
        &self.cycles
    }

    /// Outgoing references of `owner` as `(property, target)`
    pub fn references(&self, owner: ObjectId) -> Vec<(String, ObjectId)> {
        let Some(&index) = self.nodes.get(&owner) else {
            return Vec::new();
        };
        let mut refs: Vec<(String, ObjectId)> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| (edge.weight().clone(), self.graph[edge.target()]))
            .collect();
        refs.sort();
        refs
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Remove every edge with `id` at either end
    pub fn clear(&mut self, id: ObjectId) {
        let Some(&index) = self.nodes.get(&id) else {
            return;
        };
        let edges: Vec<EdgeIndex> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .chain(self.graph.edges_directed(index, Direction::Incoming))
            .map(|edge| edge.id())
            .collect();
        let removed = edges.len();
        for edge in edges {
            self.graph.remove_edge(edge);
        }
        debug!("Cleared {} references of {}", removed, id);
    }

    /// Drop every edge and every cycle report; handles stay valid
    pub fn clear_all(&mut self) {
        self.graph.clear_edges();
        self.cycles.clear();
    }
}
