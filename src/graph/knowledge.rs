//! The unified knowledge graph: a directed multigraph with typed edge
//! keys over string node ids.
//!
//! Nodes are indexed by id (`"{type}::{slug}"`); attributes are free-form
//! JSON maps. Storage is a petgraph `StableDiGraph` with a side index from
//! id to `NodeIndex` — node-id strings are the ownership story, petgraph
//! indices never leak out of this module.

use anyhow::{Context, Result};
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::graph::louvain;
use crate::graph::pagerank;

/// PageRank damping factor.
const PAGERANK_ALPHA: f64 = 0.85;

/// Fixed seed for Louvain community detection; identical partitions
/// across runs are a tested invariant.
pub const LOUVAIN_SEED: u64 = 42;

/// Attributes of one node.
pub type Attrs = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
struct NodeData {
    id: String,
    attrs: Attrs,
}

#[derive(Debug, Clone)]
struct EdgeData {
    relation: String,
    attrs: Attrs,
}

/// One edge as seen by callers: `(source, target, relation, attrs)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub relation: String,
    pub attrs: Attrs,
}

/// Directed multigraph with string node ids and typed edge keys.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    graph: StableDiGraph<NodeData, EdgeData>,
    ids: HashMap<String, NodeIndex>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Add a node, merging `attrs` into any existing attributes.
    pub fn add_node(&mut self, id: &str, attrs: Attrs) {
        match self.ids.get(id) {
            Some(&idx) => {
                let node = &mut self.graph[idx];
                for (k, v) in attrs {
                    node.attrs.insert(k, v);
                }
            }
            None => {
                let idx = self.graph.add_node(NodeData {
                    id: id.to_string(),
                    attrs,
                });
                self.ids.insert(id.to_string(), idx);
            }
        }
    }

    /// Set one attribute on an existing node. No-op for unknown ids.
    pub fn set_attr(&mut self, id: &str, key: &str, value: Value) {
        if let Some(&idx) = self.ids.get(id) {
            self.graph[idx].attrs.insert(key.to_string(), value);
        }
    }

    /// Add an edge with a relation key; the `relation` attribute is always
    /// stored on the edge for duplicate serialization safety. Endpoints
    /// missing from the graph are created with empty attributes.
    pub fn add_edge(&mut self, u: &str, v: &str, relation: &str, mut attrs: Attrs) {
        if !self.ids.contains_key(u) {
            self.add_node(u, Attrs::new());
        }
        if !self.ids.contains_key(v) {
            self.add_node(v, Attrs::new());
        }
        attrs.insert("relation".to_string(), Value::String(relation.to_string()));
        let ui = self.ids[u];
        let vi = self.ids[v];
        self.graph.add_edge(
            ui,
            vi,
            EdgeData {
                relation: relation.to_string(),
                attrs,
            },
        );
    }

    pub fn clear(&mut self) {
        self.graph.clear();
        self.ids.clear();
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn get_node(&self, id: &str) -> Option<&Attrs> {
        self.ids.get(id).map(|&idx| &self.graph[idx].attrs)
    }

    /// Convenience string attribute read, empty when missing.
    pub fn attr_str(&self, id: &str, key: &str) -> String {
        self.get_node(id)
            .and_then(|attrs| attrs.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_default()
    }

    /// Convenience float attribute read, 0.0 when missing.
    pub fn attr_f64(&self, id: &str, key: &str) -> f64 {
        self.get_node(id)
            .and_then(|attrs| attrs.get(key))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|n| n.id.as_str())
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Attrs)> {
        self.graph.node_weights().map(|n| (n.id.as_str(), &n.attrs))
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.graph
            .edge_references()
            .map(|e| Edge {
                source: self.graph[e.source()].id.clone(),
                target: self.graph[e.target()].id.clone(),
                relation: e.weight().relation.clone(),
                attrs: e.weight().attrs.clone(),
            })
            .collect()
    }

    pub fn out_edges(&self, id: &str) -> Vec<Edge> {
        self.directed_edges(id, Direction::Outgoing)
    }

    pub fn in_edges(&self, id: &str) -> Vec<Edge> {
        self.directed_edges(id, Direction::Incoming)
    }

    fn directed_edges(&self, id: &str, dir: Direction) -> Vec<Edge> {
        let Some(&idx) = self.ids.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, dir)
            .map(|e| Edge {
                source: self.graph[e.source()].id.clone(),
                target: self.graph[e.target()].id.clone(),
                relation: e.weight().relation.clone(),
                attrs: e.weight().attrs.clone(),
            })
            .collect()
    }

    /// Successor node ids over outgoing edges.
    pub fn successors(&self, id: &str) -> Vec<String> {
        let Some(&idx) = self.ids.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].id.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// BFS forward over outgoing edges up to `max_depth` hops; the start
    /// node is excluded from the result.
    pub fn descendants(&self, id: &str, max_depth: usize) -> HashSet<String> {
        self.bfs(id, max_depth, Direction::Outgoing)
    }

    /// BFS backward over incoming edges up to `max_depth` hops.
    pub fn ancestors(&self, id: &str, max_depth: usize) -> HashSet<String> {
        self.bfs(id, max_depth, Direction::Incoming)
    }

    fn bfs(&self, id: &str, max_depth: usize, dir: Direction) -> HashSet<String> {
        let Some(&start) = self.ids.get(id) else {
            return HashSet::new();
        };
        let mut visited: HashSet<NodeIndex> = HashSet::from([start]);
        let mut result = HashSet::new();
        let mut queue = VecDeque::from([(start, 0usize)]);
        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for next in self.graph.neighbors_directed(current, dir) {
                if visited.insert(next) {
                    result.insert(self.graph[next].id.clone());
                    queue.push_back((next, depth + 1));
                }
            }
        }
        result
    }

    /// Undirected adjacency: neighbor set per node id.
    pub fn undirected_adjacency(&self) -> HashMap<String, HashSet<String>> {
        let mut adj: HashMap<String, HashSet<String>> = self
            .node_ids()
            .map(|id| (id.to_string(), HashSet::new()))
            .collect();
        for e in self.graph.edge_references() {
            let u = &self.graph[e.source()].id;
            let v = &self.graph[e.target()].id;
            if u != v {
                if let Some(neighbors) = adj.get_mut(u) {
                    neighbors.insert(v.clone());
                }
                if let Some(neighbors) = adj.get_mut(v) {
                    neighbors.insert(u.clone());
                }
            }
        }
        adj
    }

    /// BFS shortest-path distances from `source` over the undirected
    /// projection (every node reachable ignoring edge direction).
    pub fn undirected_distances(&self, source: &str) -> HashMap<String, usize> {
        if !self.contains(source) {
            return HashMap::new();
        }
        bfs_distances(&self.undirected_adjacency(), source)
    }

    /// One shortest path between two nodes over the undirected projection,
    /// or `None` when no path exists.
    pub fn shortest_path_undirected(&self, source: &str, target: &str) -> Option<Vec<String>> {
        if !self.contains(source) || !self.contains(target) {
            return None;
        }
        shortest_path_in(&self.undirected_adjacency(), source, target)
    }

    /// The radius-bounded ego neighborhood around `id`.
    ///
    /// Returns the induced directed subgraph plus the BFS distance of each
    /// retained node from the center. With `undirected` the traversal
    /// follows edges in both directions; otherwise outgoing edges only.
    pub fn ego_subgraph(
        &self,
        id: &str,
        radius: usize,
        undirected: bool,
    ) -> (KnowledgeGraph, HashMap<String, usize>) {
        let mut distances: HashMap<String, usize> = HashMap::new();
        if !self.contains(id) {
            return (KnowledgeGraph::new(), distances);
        }

        distances.insert(id.to_string(), 0);
        let mut queue = VecDeque::from([id.to_string()]);
        let adj = if undirected {
            Some(self.undirected_adjacency())
        } else {
            None
        };
        while let Some(current) = queue.pop_front() {
            let d = distances[&current];
            if d >= radius {
                continue;
            }
            let neighbors: Vec<String> = match &adj {
                Some(adj) => adj
                    .get(&current)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default(),
                None => self.successors(&current),
            };
            for n in neighbors {
                if !distances.contains_key(&n) {
                    distances.insert(n.clone(), d + 1);
                    queue.push_back(n);
                }
            }
        }

        (self.induced_subgraph(distances.keys().map(String::as_str)), distances)
    }

    /// The directed subgraph induced by `keep` (nodes plus every edge
    /// whose endpoints are both retained).
    pub fn induced_subgraph<'a>(&self, keep: impl IntoIterator<Item = &'a str>) -> KnowledgeGraph {
        let keep: HashSet<&str> = keep.into_iter().collect();
        let mut sub = KnowledgeGraph::new();
        for (id, attrs) in self.nodes() {
            if keep.contains(id) {
                sub.add_node(id, attrs.clone());
            }
        }
        for e in self.graph.edge_references() {
            let u = self.graph[e.source()].id.as_str();
            let v = self.graph[e.target()].id.as_str();
            if keep.contains(u) && keep.contains(v) {
                let mut attrs = e.weight().attrs.clone();
                attrs.remove("relation");
                sub.add_edge(u, v, &e.weight().relation, attrs);
            }
        }
        sub
    }

    /// Degree in the undirected projection (parallel edges collapsed).
    pub fn undirected_degree(&self, id: &str) -> usize {
        self.undirected_adjacency()
            .get(id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    /// PageRank over the directed multigraph, damping 0.85.
    pub fn compute_pagerank(&self) -> HashMap<String, f64> {
        pagerank::pagerank(self, PAGERANK_ALPHA)
    }

    /// Louvain communities over the undirected projection with the fixed
    /// seed; identical partitions across runs.
    pub fn compute_communities(&self, resolution: f64) -> Vec<HashSet<String>> {
        louvain::louvain_communities(self, resolution, LOUVAIN_SEED)
    }

    // ------------------------------------------------------------------
    // Serialization (node-link JSON)
    // ------------------------------------------------------------------

    /// Serialize as node-link JSON: `{directed, multigraph, nodes, edges}`.
    pub fn to_json(&self) -> Result<String> {
        let nodes: Vec<Value> = self
            .nodes()
            .map(|(id, attrs)| {
                let mut obj = serde_json::Map::new();
                obj.insert("id".to_string(), Value::String(id.to_string()));
                for (k, v) in attrs {
                    obj.insert(k.clone(), v.clone());
                }
                Value::Object(obj)
            })
            .collect();
        let edges: Vec<Value> = self
            .edges()
            .into_iter()
            .map(|e| {
                let mut obj = serde_json::Map::new();
                obj.insert("source".to_string(), Value::String(e.source));
                obj.insert("target".to_string(), Value::String(e.target));
                obj.insert("key".to_string(), Value::String(e.relation));
                for (k, v) in e.attrs {
                    obj.insert(k, v);
                }
                Value::Object(obj)
            })
            .collect();
        let doc = serde_json::json!({
            "directed": true,
            "multigraph": true,
            "nodes": nodes,
            "edges": edges,
        });
        serde_json::to_string(&doc).context("Failed to serialize knowledge graph")
    }

    /// Rebuild the graph from node-link JSON, replacing current contents.
    pub fn from_json(&mut self, raw: &str) -> Result<()> {
        let doc: Value = serde_json::from_str(raw).context("Failed to parse graph JSON")?;
        self.clear();

        for node in doc.get("nodes").and_then(Value::as_array).unwrap_or(&Vec::new()) {
            let Some(obj) = node.as_object() else { continue };
            let Some(id) = obj.get("id").and_then(Value::as_str) else {
                continue;
            };
            let attrs: Attrs = obj
                .iter()
                .filter(|(k, _)| k.as_str() != "id")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.add_node(id, attrs);
        }

        for edge in doc.get("edges").and_then(Value::as_array).unwrap_or(&Vec::new()) {
            let Some(obj) = edge.as_object() else { continue };
            let (Some(source), Some(target)) = (
                obj.get("source").and_then(Value::as_str),
                obj.get("target").and_then(Value::as_str),
            ) else {
                continue;
            };
            let relation = obj
                .get("key")
                .and_then(Value::as_str)
                .or_else(|| obj.get("relation").and_then(Value::as_str))
                .unwrap_or("IMPORTS")
                .to_string();
            let attrs: Attrs = obj
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "source" | "target" | "key" | "relation"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.add_edge(source, target, &relation, attrs);
        }
        Ok(())
    }
}

/// The undirected neighbor map returned by
/// [`KnowledgeGraph::undirected_adjacency`].
pub type UndirectedAdjacency = HashMap<String, HashSet<String>>;

/// BFS shortest-path distances over a prebuilt undirected adjacency.
pub fn bfs_distances(adj: &UndirectedAdjacency, source: &str) -> HashMap<String, usize> {
    let mut distances = HashMap::new();
    if !adj.contains_key(source) {
        return distances;
    }
    distances.insert(source.to_string(), 0);
    let mut queue = VecDeque::from([source.to_string()]);
    while let Some(current) = queue.pop_front() {
        let d = distances[&current];
        if let Some(neighbors) = adj.get(&current) {
            for n in neighbors {
                if !distances.contains_key(n) {
                    distances.insert(n.clone(), d + 1);
                    queue.push_back(n.clone());
                }
            }
        }
    }
    distances
}

/// One shortest path over a prebuilt undirected adjacency, or `None`.
pub fn shortest_path_in(
    adj: &UndirectedAdjacency,
    source: &str,
    target: &str,
) -> Option<Vec<String>> {
    if !adj.contains_key(source) || !adj.contains_key(target) {
        return None;
    }
    if source == target {
        return Some(vec![source.to_string()]);
    }
    let mut parents: HashMap<String, String> = HashMap::new();
    let mut visited: HashSet<String> = HashSet::from([source.to_string()]);
    let mut queue = VecDeque::from([source.to_string()]);
    while let Some(current) = queue.pop_front() {
        if let Some(neighbors) = adj.get(&current) {
            // Deterministic expansion order keeps paths stable.
            let mut sorted: Vec<&String> = neighbors.iter().collect();
            sorted.sort();
            for n in sorted {
                if visited.insert(n.clone()) {
                    parents.insert(n.clone(), current.clone());
                    if n == target {
                        let mut path = vec![n.clone()];
                        let mut cursor = n.clone();
                        while let Some(parent) = parents.get(&cursor) {
                            path.push(parent.clone());
                            cursor = parent.clone();
                        }
                        path.reverse();
                        return Some(path);
                    }
                    queue.push_back(n.clone());
                }
            }
        }
    }
    None
}

/// Build an attrs map from string pairs.
pub fn attrs_of<const N: usize>(pairs: [(&str, Value); N]) -> Attrs {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_graph() -> KnowledgeGraph {
        let mut kg = KnowledgeGraph::new();
        kg.add_node("file::a.py", attrs_of([("node_type", json!("file"))]));
        kg.add_node("file::b.py", attrs_of([("node_type", json!("file"))]));
        kg.add_node("file::c.py", attrs_of([("node_type", json!("file"))]));
        kg.add_edge("file::a.py", "file::b.py", "IMPORTS", Attrs::new());
        kg.add_edge("file::b.py", "file::c.py", "IMPORTS", Attrs::new());
        kg
    }

    #[test]
    fn add_node_merges_attributes() {
        let mut kg = KnowledgeGraph::new();
        kg.add_node("service::auth", attrs_of([("domain", json!("identity"))]));
        kg.add_node("service::auth", attrs_of([("pagerank", json!(0.3))]));
        assert_eq!(kg.node_count(), 1);
        let attrs = kg.get_node("service::auth").unwrap();
        assert_eq!(attrs["domain"], json!("identity"));
        assert_eq!(attrs["pagerank"], json!(0.3));
    }

    #[test]
    fn add_edge_creates_missing_endpoints_and_stores_relation() {
        let mut kg = KnowledgeGraph::new();
        kg.add_edge("a", "b", "CALLS", Attrs::new());
        assert!(kg.contains("a"));
        assert!(kg.contains("b"));
        let edges = kg.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relation, "CALLS");
        assert_eq!(edges[0].attrs["relation"], json!("CALLS"));
    }

    #[test]
    fn parallel_edges_are_kept() {
        let mut kg = KnowledgeGraph::new();
        kg.add_edge("a", "b", "IMPORTS", Attrs::new());
        kg.add_edge("a", "b", "CALLS", Attrs::new());
        assert_eq!(kg.edge_count(), 2);
    }

    #[test]
    fn descendants_respect_depth_cutoff() {
        let kg = small_graph();
        assert_eq!(
            kg.descendants("file::a.py", 1),
            HashSet::from(["file::b.py".to_string()])
        );
        assert_eq!(kg.descendants("file::a.py", 2).len(), 2);
        assert!(kg.descendants("file::missing", 3).is_empty());
    }

    #[test]
    fn ancestors_follow_incoming_edges() {
        let kg = small_graph();
        assert_eq!(
            kg.ancestors("file::c.py", 3),
            HashSet::from(["file::a.py".to_string(), "file::b.py".to_string()])
        );
    }

    #[test]
    fn ego_subgraph_undirected_reaches_both_directions() {
        let kg = small_graph();
        let (sub, distances) = kg.ego_subgraph("file::b.py", 1, true);
        assert_eq!(sub.node_count(), 3);
        assert_eq!(distances["file::b.py"], 0);
        assert_eq!(distances["file::a.py"], 1);
        assert_eq!(distances["file::c.py"], 1);
    }

    #[test]
    fn ego_subgraph_directed_follows_outgoing_only() {
        let kg = small_graph();
        let (sub, _) = kg.ego_subgraph("file::b.py", 1, false);
        assert_eq!(sub.node_count(), 2); // b and c only
        assert!(sub.contains("file::c.py"));
        assert!(!sub.contains("file::a.py"));
    }

    #[test]
    fn ego_subgraph_of_missing_node_is_empty() {
        let kg = small_graph();
        let (sub, distances) = kg.ego_subgraph("file::nope", 2, true);
        assert_eq!(sub.node_count(), 0);
        assert!(distances.is_empty());
    }

    #[test]
    fn shortest_path_undirected_crosses_edge_direction() {
        let kg = small_graph();
        let path = kg.shortest_path_undirected("file::c.py", "file::a.py").unwrap();
        assert_eq!(
            path,
            vec!["file::c.py", "file::b.py", "file::a.py"]
        );
        assert!(kg.shortest_path_undirected("file::a.py", "file::zzz").is_none());
    }

    #[test]
    fn json_roundtrip_preserves_counts_and_attributes() {
        let mut kg = small_graph();
        kg.set_attr("file::a.py", "service_name", json!("auth-service"));
        kg.add_edge(
            "service::auth",
            "file::a.py",
            "CONTAINS_FILE",
            attrs_of([("weight", json!(2))]),
        );

        let json_str = kg.to_json().unwrap();
        let mut restored = KnowledgeGraph::new();
        restored.from_json(&json_str).unwrap();

        assert_eq!(restored.node_count(), kg.node_count());
        assert_eq!(restored.edge_count(), kg.edge_count());
        assert_eq!(restored.attr_str("file::a.py", "service_name"), "auth-service");
        let contains_edges: Vec<Edge> = restored
            .out_edges("service::auth")
            .into_iter()
            .filter(|e| e.relation == "CONTAINS_FILE")
            .collect();
        assert_eq!(contains_edges.len(), 1);
        assert_eq!(contains_edges[0].attrs["weight"], json!(2));
    }

    #[test]
    fn star_pagerank_assigns_hub_the_unique_maximum() {
        let mut kg = KnowledgeGraph::new();
        for i in 0..5 {
            kg.add_edge(&format!("leaf{i}"), "hub", "CALLS", Attrs::new());
        }
        let ranks = kg.compute_pagerank();
        let hub = ranks["hub"];
        for i in 0..5 {
            assert!(
                hub > ranks[&format!("leaf{i}")],
                "hub should outrank leaf{i}"
            );
        }
    }

    #[test]
    fn louvain_is_deterministic_across_runs() {
        let mut kg = KnowledgeGraph::new();
        // Two cliques bridged by one edge.
        for (a, b) in [("a1", "a2"), ("a2", "a3"), ("a1", "a3")] {
            kg.add_edge(a, b, "IMPORTS", Attrs::new());
        }
        for (a, b) in [("b1", "b2"), ("b2", "b3"), ("b1", "b3")] {
            kg.add_edge(a, b, "IMPORTS", Attrs::new());
        }
        kg.add_edge("a1", "b1", "IMPORTS", Attrs::new());

        let first = kg.compute_communities(1.0);
        let second = kg.compute_communities(1.0);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn undirected_degree_collapses_parallel_edges() {
        let mut kg = KnowledgeGraph::new();
        kg.add_edge("a", "b", "IMPORTS", Attrs::new());
        kg.add_edge("a", "b", "CALLS", Attrs::new());
        kg.add_node("isolated", Attrs::new());
        assert_eq!(kg.undirected_degree("a"), 1);
        assert_eq!(kg.undirected_degree("isolated"), 0);
    }
}
