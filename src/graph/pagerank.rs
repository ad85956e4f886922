//! PageRank over the directed multigraph.
//!
//! Power iteration with uniform edge weights. Parallel edges contribute
//! their multiplicity to the transition weight; dangling mass is spread
//! uniformly, matching the conventional formulation.

use std::collections::HashMap;

use crate::graph::knowledge::KnowledgeGraph;

const MAX_ITER: usize = 100;
const TOL: f64 = 1.0e-6;

/// Compute PageRank scores for every node. Empty graph yields an empty map.
pub fn pagerank(kg: &KnowledgeGraph, alpha: f64) -> HashMap<String, f64> {
    let ids: Vec<String> = kg.node_ids().map(str::to_string).collect();
    let n = ids.len();
    if n == 0 {
        return HashMap::new();
    }
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

    // Out-neighbor multiplicities per node.
    let mut out: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    let mut out_weight: Vec<f64> = vec![0.0; n];
    for edge in kg.edges() {
        let u = index[edge.source.as_str()];
        let v = index[edge.target.as_str()];
        out_weight[u] += 1.0;
        match out[u].iter_mut().find(|(t, _)| *t == v) {
            Some((_, w)) => *w += 1.0,
            None => out[u].push((v, 1.0)),
        }
    }

    let uniform = 1.0 / n as f64;
    let mut rank = vec![uniform; n];

    for _ in 0..MAX_ITER {
        let mut next = vec![(1.0 - alpha) * uniform; n];

        let dangling_mass: f64 = (0..n)
            .filter(|&i| out_weight[i] == 0.0)
            .map(|i| rank[i])
            .sum();
        let dangling_share = alpha * dangling_mass * uniform;

        for value in next.iter_mut() {
            *value += dangling_share;
        }
        for u in 0..n {
            if out_weight[u] == 0.0 {
                continue;
            }
            let share = alpha * rank[u] / out_weight[u];
            for &(v, w) in &out[u] {
                next[v] += share * w;
            }
        }

        let delta: f64 = rank.iter().zip(&next).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < TOL * n as f64 {
            break;
        }
    }

    ids.into_iter().zip(rank).collect()
}
