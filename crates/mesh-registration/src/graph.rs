//! Deformation graph: sparse nodes carrying local transforms that drive
//! every source vertex.

use std::collections::BTreeSet;

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use nalgebra::Point3;
use rayon::prelude::*;
use tracing::debug;

/// Number of graph nodes for `vertex_count` vertices at a sampling ratio
/// given in percent, clamped to `[min(4, n), n]`.
pub fn node_count_for(vertex_count: usize, ratio_percent: f64) -> usize {
    let wanted = (vertex_count as f64 * ratio_percent / 100.0).ceil();
    let wanted = if wanted.is_finite() && wanted > 0.0 {
        wanted as usize
    } else {
        0
    };
    wanted.clamp(vertex_count.min(4), vertex_count)
}

/// Farthest-point sampling starting from vertex 0.
///
/// Returns `count` distinct indices (all indices when `count >= n`).
pub fn farthest_point_sampling(positions: &[Point3<f64>], count: usize) -> Vec<usize> {
    let n = positions.len();
    if count >= n {
        return (0..n).collect();
    }
    if count == 0 {
        return Vec::new();
    }

    let mut selected = Vec::with_capacity(count);
    let mut min_distances = vec![f64::INFINITY; n];
    selected.push(0);

    while selected.len() < count {
        let last = positions[selected[selected.len() - 1]];
        min_distances
            .par_iter_mut()
            .zip(positions.par_iter())
            .for_each(|(d, p)| *d = d.min((p - last).norm_squared()));

        let next = min_distances
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i);
        match next {
            // Every remaining point coincides with a selected one.
            Some(i) if min_distances[i] > 0.0 => selected.push(i),
            _ => break,
        }
    }

    selected
}

/// Graph nodes, their connectivity and the per-vertex skinning weights.
#[derive(Debug, Clone)]
pub struct DeformationGraph {
    /// Source vertex index of each node.
    pub nodes: Vec<usize>,
    /// Rest position `g_j` of each node.
    pub node_positions: Vec<Point3<f64>>,
    /// Undirected edges `(j, k)` with `j < k`.
    pub edges: Vec<(usize, usize)>,
    /// Neighbours of each node (both directions of every edge).
    pub neighbours: Vec<Vec<usize>>,
    /// For every vertex, `(node, weight)` pairs with weights summing to 1.
    pub influences: Vec<Vec<(usize, f64)>>,
}

impl DeformationGraph {
    /// Sample nodes from `positions` and bind every vertex to its nearest
    /// `nodes_per_vertex` nodes.
    pub fn build(
        positions: &[Point3<f64>],
        ratio_percent: f64,
        nodes_per_vertex: usize,
        graph_neighbours: usize,
    ) -> Self {
        let count = node_count_for(positions.len(), ratio_percent);
        let nodes = farthest_point_sampling(positions, count);
        let node_positions: Vec<Point3<f64>> = nodes.iter().map(|&i| positions[i]).collect();
        let m = node_positions.len();

        if m == 0 {
            return Self {
                nodes,
                node_positions,
                edges: Vec::new(),
                neighbours: Vec::new(),
                influences: Vec::new(),
            };
        }
        let points: Vec<[f64; 3]> = node_positions.iter().map(|g| [g.x, g.y, g.z]).collect();
        let tree: ImmutableKdTree<f64, 3> = ImmutableKdTree::new_from_slice(&points);

        let k = nodes_per_vertex.max(1).min(m);
        let influences: Vec<Vec<(usize, f64)>> = positions
            .par_iter()
            .map(|p| vertex_influences(&tree, p, k, m))
            .collect();

        let mut edge_set = BTreeSet::new();
        for bound in &influences {
            for (a, &(j, wj)) in bound.iter().enumerate() {
                for &(l, wl) in &bound[a + 1..] {
                    if wj > 0.0 && wl > 0.0 && j != l {
                        edge_set.insert((j.min(l), j.max(l)));
                    }
                }
            }
        }
        let kn = graph_neighbours.min(m.saturating_sub(1));
        if kn > 0 {
            for (j, g) in node_positions.iter().enumerate() {
                for nb in tree.nearest_n::<SquaredEuclidean>(&[g.x, g.y, g.z], kn + 1) {
                    let l = nb.item as usize;
                    if l != j {
                        edge_set.insert((j.min(l), j.max(l)));
                    }
                }
            }
        }

        let edges: Vec<(usize, usize)> = edge_set.into_iter().collect();
        let mut neighbours = vec![Vec::new(); m];
        for &(j, l) in &edges {
            neighbours[j].push(l);
            neighbours[l].push(j);
        }

        debug!(
            target: "mesh_registration::nonrigid",
            vertices = positions.len(),
            nodes = m,
            edges = edges.len(),
            "Built deformation graph"
        );

        Self {
            nodes,
            node_positions,
            edges,
            neighbours,
            influences,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of ordered node pairs `(j, k)` with `k ∈ N(j)`.
    pub fn directed_edge_count(&self) -> usize {
        2 * self.edges.len()
    }
}

/// Weights `(1 - d/d_max)²` over the `k` nearest nodes, normalized to 1.
///
/// `d_max` is the distance to the next-nearest node, or twice the farthest
/// bound node when every node is bound.
fn vertex_influences(
    tree: &ImmutableKdTree<f64, 3>,
    p: &Point3<f64>,
    k: usize,
    node_count: usize,
) -> Vec<(usize, f64)> {
    if k == 0 {
        return Vec::new();
    }
    let query = [p.x, p.y, p.z];
    let found = tree.nearest_n::<SquaredEuclidean>(&query, (k + 1).min(node_count));

    let bound = &found[..k.min(found.len())];
    let d_max = match found.get(k) {
        Some(next) => next.distance.sqrt(),
        None => 2.0 * bound.last().map_or(0.0, |nb| nb.distance.sqrt()) + f64::EPSILON,
    };

    let mut weights: Vec<(usize, f64)> = bound
        .iter()
        .map(|nb| {
            let w = if d_max > 0.0 {
                (1.0 - nb.distance.sqrt() / d_max).max(0.0).powi(2)
            } else {
                0.0
            };
            (nb.item as usize, w)
        })
        .collect();

    let total: f64 = weights.iter().map(|(_, w)| w).sum();
    if total > 0.0 {
        for (_, w) in &mut weights {
            *w /= total;
        }
    } else {
        let uniform = 1.0 / weights.len() as f64;
        for (_, w) in &mut weights {
            *w = uniform;
        }
    }
    weights
}
