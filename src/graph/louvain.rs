//! Louvain community detection over the undirected projection.
//!
//! Two-phase Louvain: local moving with a seeded shuffle of the node
//! order, then community aggregation, repeated until modularity stops
//! improving. The seed is threaded through every level so partitions are
//! reproducible run to run.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};

use crate::graph::knowledge::KnowledgeGraph;

/// Detect communities; returns one node-id set per community.
pub fn louvain_communities(
    kg: &KnowledgeGraph,
    resolution: f64,
    seed: u64,
) -> Vec<HashSet<String>> {
    let ids: Vec<String> = {
        let mut ids: Vec<String> = kg.node_ids().map(str::to_string).collect();
        ids.sort();
        ids
    };
    let n = ids.len();
    if n == 0 {
        return Vec::new();
    }
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

    // Collapse the directed multigraph into a weighted undirected simple
    // graph: weight = number of parallel edges in either direction.
    let mut level_adj: Vec<HashMap<usize, f64>> = vec![HashMap::new(); n];
    for edge in kg.edges() {
        let u = index[edge.source.as_str()];
        let v = index[edge.target.as_str()];
        if u == v {
            continue;
        }
        *level_adj[u].entry(v).or_insert(0.0) += 1.0;
        *level_adj[v].entry(u).or_insert(0.0) += 1.0;
    }
    let mut level_self: Vec<f64> = vec![0.0; n];

    let mut rng = StdRng::seed_from_u64(seed);

    // partition[i] = final community of original node i;
    // level_of_original[i] = level-node currently representing node i.
    let mut partition: Vec<usize> = (0..n).collect();
    let mut level_of_original: Vec<usize> = (0..n).collect();

    loop {
        let (moved, assignment) = one_level(&level_adj, &level_self, resolution, &mut rng);
        let level_partition = renumber(&assignment);

        for (orig, level_node) in level_of_original.iter_mut().enumerate() {
            let community = level_partition[*level_node];
            partition[orig] = community;
            *level_node = community;
        }

        if !moved {
            break;
        }

        // Aggregate the level graph by community.
        let community_count = level_partition.iter().copied().max().map_or(0, |m| m + 1);
        if community_count == level_adj.len() {
            break;
        }
        let mut next_adj: Vec<HashMap<usize, f64>> = vec![HashMap::new(); community_count];
        let mut next_self: Vec<f64> = vec![0.0; community_count];
        for (u, neighbors) in level_adj.iter().enumerate() {
            let cu = level_partition[u];
            next_self[cu] += level_self[u];
            for (&v, &w) in neighbors {
                let cv = level_partition[v];
                if cu == cv {
                    // Each undirected edge is visited from both endpoints.
                    next_self[cu] += w / 2.0;
                } else {
                    *next_adj[cu].entry(cv).or_insert(0.0) += w;
                }
            }
        }
        level_adj = next_adj;
        level_self = next_self;
    }

    // Group original node ids by final community.
    let mut groups: HashMap<usize, HashSet<String>> = HashMap::new();
    for (i, &community) in partition.iter().enumerate() {
        groups.entry(community).or_default().insert(ids[i].clone());
    }
    let mut keys: Vec<usize> = groups.keys().copied().collect();
    keys.sort();
    keys.into_iter().map(|k| groups.remove(&k).unwrap()).collect()
}

/// One pass of local moving. Returns whether any node changed community
/// and the resulting community assignment.
fn one_level(
    adjacency: &[HashMap<usize, f64>],
    self_loops: &[f64],
    resolution: f64,
    rng: &mut StdRng,
) -> (bool, Vec<usize>) {
    let n = adjacency.len();
    let mut community: Vec<usize> = (0..n).collect();

    let degree: Vec<f64> = (0..n)
        .map(|i| adjacency[i].values().sum::<f64>() + 2.0 * self_loops[i])
        .collect();
    let m2: f64 = degree.iter().sum::<f64>().max(1.0);
    let mut community_total: Vec<f64> = degree.clone();

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);

    let mut improved = false;
    let mut changed = true;
    while changed {
        changed = false;
        for &node in &order {
            let current = community[node];
            let k = degree[node];

            // Link weight from node to each neighboring community.
            let mut neighbor_weights: HashMap<usize, f64> = HashMap::new();
            for (&nbr, &w) in adjacency[node].iter() {
                *neighbor_weights.entry(community[nbr]).or_insert(0.0) += w;
            }

            community_total[current] -= k;

            let mut best_community = current;
            let mut best_gain = *neighbor_weights.get(&current).unwrap_or(&0.0)
                - resolution * community_total[current] * k / m2;

            let mut candidates: Vec<usize> = neighbor_weights.keys().copied().collect();
            candidates.sort();
            for candidate in candidates {
                if candidate == current {
                    continue;
                }
                let gain = neighbor_weights[&candidate]
                    - resolution * community_total[candidate] * k / m2;
                if gain > best_gain + 1.0e-12 {
                    best_gain = gain;
                    best_community = candidate;
                }
            }

            community_total[best_community] += k;
            if best_community != current {
                community[node] = best_community;
                changed = true;
                improved = true;
            }
        }
    }

    (improved, community)
}

/// Renumber community labels to a dense 0..k range, ordered by first
/// appearance.
fn renumber(assignment: &[usize]) -> Vec<usize> {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    let mut next = 0;
    assignment
        .iter()
        .map(|&c| {
            *mapping.entry(c).or_insert_with(|| {
                let id = next;
                next += 1;
                id
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::knowledge::Attrs;

    fn two_cliques() -> KnowledgeGraph {
        let mut kg = KnowledgeGraph::new();
        for (a, b) in [("a1", "a2"), ("a2", "a3"), ("a1", "a3"), ("a3", "a4"), ("a1", "a4")] {
            kg.add_edge(a, b, "IMPORTS", Attrs::new());
        }
        for (a, b) in [("b1", "b2"), ("b2", "b3"), ("b1", "b3"), ("b3", "b4"), ("b1", "b4")] {
            kg.add_edge(a, b, "IMPORTS", Attrs::new());
        }
        kg.add_edge("a1", "b1", "IMPORTS", Attrs::new());
        kg
    }

    #[test]
    fn splits_two_cliques() {
        let kg = two_cliques();
        let communities = louvain_communities(&kg, 1.0, 42);
        assert_eq!(communities.len(), 2);
        let with_a1 = communities.iter().find(|c| c.contains("a1")).unwrap();
        for node in ["a2", "a3", "a4"] {
            assert!(with_a1.contains(node), "{node} should sit with a1");
        }
        assert!(!with_a1.contains("b1"));
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let kg = two_cliques();
        let first = louvain_communities(&kg, 1.0, 42);
        for _ in 0..5 {
            assert_eq!(louvain_communities(&kg, 1.0, 42), first);
        }
    }

    #[test]
    fn empty_graph_yields_no_communities() {
        let kg = KnowledgeGraph::new();
        assert!(louvain_communities(&kg, 1.0, 42).is_empty());
    }

    #[test]
    fn isolated_nodes_form_singletons() {
        let mut kg = KnowledgeGraph::new();
        kg.add_node("x", Attrs::new());
        kg.add_node("y", Attrs::new());
        let communities = louvain_communities(&kg, 1.0, 42);
        assert_eq!(communities.len(), 2);
    }
}
