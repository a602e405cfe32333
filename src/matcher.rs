//! Bipartite matching of required topologies onto provided ones.
//!
//! The deployment coordinator needs an injection from runners (each with a
//! required topology) into instances (each with a gathered topology) such
//! that every runner lands on a compatible instance. This is maximum
//! bipartite matching; the implementation is Hopcroft-Karp, O(E * sqrt(V)).
//!
//! The result is deterministic for a fixed input: left vertices are
//! processed in order and adjacency lists are built lowest right index
//! first.

use crate::topology::{is_subset, Topology};
use std::collections::VecDeque;

const INF: usize = usize::MAX;

/// Match each topology in `required` onto a distinct entry of `given`.
///
/// Returns `Some(assignment)` with `assignment[i]` the index into `given`
/// chosen for `required[i]`, such that
/// `is_subset(given[assignment[i]], required[i])` holds for every `i` and
/// no two runners share an instance. Returns `None` when no complete
/// matching exists.
pub fn match_topologies(required: &[Topology], given: &[Topology]) -> Option<Vec<usize>> {
    let adjacency: Vec<Vec<usize>> = required
        .iter()
        .map(|need| {
            given
                .iter()
                .enumerate()
                .filter(|(_, host)| is_subset(host, need))
                .map(|(j, _)| j)
                .collect()
        })
        .collect();

    let (pair_left, matched) = hopcroft_karp(&adjacency, given.len());
    if matched != required.len() {
        return None;
    }
    // A matching of size `required.len()` pairs every left vertex.
    debug_assert!(pair_left.iter().all(|p| p.is_some()));
    Some(pair_left.into_iter().flatten().collect())
}

/// Textbook Hopcroft-Karp over an adjacency list representation.
///
/// Returns the left-side pairing and the matching size. Phases alternate a
/// BFS that layers the graph from free left vertices and a DFS sweep that
/// augments along vertex-disjoint shortest paths.
fn hopcroft_karp(adjacency: &[Vec<usize>], right_count: usize) -> (Vec<Option<usize>>, usize) {
    let left_count = adjacency.len();
    let mut pair_left: Vec<Option<usize>> = vec![None; left_count];
    let mut pair_right: Vec<Option<usize>> = vec![None; right_count];
    let mut dist: Vec<usize> = vec![INF; left_count];
    let mut matched = 0;

    loop {
        let free_dist = layer(adjacency, &pair_left, &pair_right, &mut dist);
        if free_dist == INF {
            break;
        }
        for u in 0..left_count {
            if pair_left[u].is_none()
                && augment(u, adjacency, &mut pair_left, &mut pair_right, &mut dist, free_dist)
            {
                matched += 1;
            }
        }
    }

    (pair_left, matched)
}

/// BFS phase: compute layer distances from the free left vertices.
///
/// Returns the layer at which a free right vertex was first reached, or
/// `INF` when no augmenting path exists.
fn layer(
    adjacency: &[Vec<usize>],
    pair_left: &[Option<usize>],
    pair_right: &[Option<usize>],
    dist: &mut [usize],
) -> usize {
    let mut queue = VecDeque::new();
    for (u, pairing) in pair_left.iter().enumerate() {
        if pairing.is_none() {
            dist[u] = 0;
            queue.push_back(u);
        } else {
            dist[u] = INF;
        }
    }

    let mut free_dist = INF;
    while let Some(u) = queue.pop_front() {
        if dist[u] >= free_dist {
            continue;
        }
        for &v in &adjacency[u] {
            match pair_right[v] {
                None => {
                    if free_dist == INF {
                        free_dist = dist[u] + 1;
                    }
                }
                Some(w) => {
                    if dist[w] == INF {
                        dist[w] = dist[u] + 1;
                        queue.push_back(w);
                    }
                }
            }
        }
    }
    free_dist
}

/// DFS phase: search for one augmenting path from `u` along the layers.
fn augment(
    u: usize,
    adjacency: &[Vec<usize>],
    pair_left: &mut [Option<usize>],
    pair_right: &mut [Option<usize>],
    dist: &mut [usize],
    free_dist: usize,
) -> bool {
    for i in 0..adjacency[u].len() {
        let v = adjacency[u][i];
        let reachable = match pair_right[v] {
            None => free_dist == dist[u] + 1,
            Some(w) => {
                dist[w] == dist[u] + 1
                    && augment(w, adjacency, pair_left, pair_right, dist, free_dist)
            }
        };
        if reachable {
            pair_left[u] = Some(v);
            pair_right[v] = Some(u);
            return true;
        }
    }
    dist[u] = INF;
    false
}
