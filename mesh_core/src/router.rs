//! C1 — shortest paths over the static adjacency graph and candidate ranking.

use crate::error::RouterError;
use crate::ledger::LedgerSnapshot;
use crate::types::{Edge, NodeId, RankedCandidate};
use std::collections::{HashMap, VecDeque};

/// The static adjacency graph: row `i` lists `i`'s outgoing edges. Row `0`
/// is the unused sentinel row.
pub type AdjacencyGraph = Vec<Vec<Edge>>;

const UNREACHABLE: f64 = -1.0;

/// Precomputed all-pairs shortest path weights and hop counts, plus the
/// pruned adjacency graph they were computed from.
///
/// Built once at startup; immutable and safe to share across threads
/// without synchronization for the remainder of the agent's lifetime.
#[derive(Debug)]
pub struct Router {
    own_id: NodeId,
    graph: AdjacencyGraph,
    cost: Vec<Vec<f64>>,
    hop: Vec<Vec<i64>>,
}

impl Router {
    /// Prunes `unreachable` rows/edges out of `graph`, validates it, then
    /// runs Dijkstra from every node to fill in the cost and hop matrices.
    ///
    /// Fails on a negative-weight edge, a self-loop, or an edge that
    /// references a node index out of range. Nodes with no outgoing edges
    /// remain `-1` rows in the cost matrix.
    pub fn build_from_adjacency(
        own_id: NodeId,
        mut graph: AdjacencyGraph,
        unreachable: &[NodeId],
    ) -> Result<Self, RouterError> {
        if graph.is_empty() {
            return Err(RouterError::EmptyGraph);
        }
        let n = graph.len();

        for unreachable_host in unreachable {
            if let Some(row) = graph.get_mut(*unreachable_host as usize) {
                row.clear();
            }
        }
        for row in graph.iter_mut() {
            row.retain(|edge| !unreachable.contains(&edge.node));
        }

        for (from, row) in graph.iter().enumerate() {
            for edge in row {
                if edge.node as usize >= n {
                    return Err(RouterError::NodeOutOfRange { from: from as NodeId, to: edge.node });
                }
                if edge.node as usize == from {
                    return Err(RouterError::SelfLoop(from as NodeId));
                }
                if edge.etx < 0.0 {
                    return Err(RouterError::NegativeWeight {
                        from: from as NodeId,
                        to: edge.node,
                        weight: edge.etx,
                    });
                }
            }
        }

        let mut router = Router {
            own_id,
            graph,
            cost: vec![vec![UNREACHABLE; n]; n],
            hop: vec![vec![-1; n]; n],
        };
        router.calculate_cost_and_hop_matrices();
        Ok(router)
    }

    /// The local node's own ID, as derived from the host environment at
    /// construction time.
    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    /// Runs Dijkstra from `initial` using a plain linear scan of the
    /// unvisited set (adequate for the target deployment's node counts;
    /// swap in a priority queue if this ever needs to scale past ~100
    /// nodes). Ties for "next node to settle" are broken by ascending node
    /// ID, since nodes are scanned in that order.
    fn dijkstra(&self, initial: NodeId) -> (HashMap<NodeId, f64>, HashMap<NodeId, NodeId>) {
        let n = self.graph.len() as NodeId;
        let mut visited: HashMap<NodeId, f64> = HashMap::new();
        visited.insert(initial, 0.0);
        let mut prev: HashMap<NodeId, NodeId> = HashMap::new();
        let mut left: Vec<NodeId> = (1..n).collect();

        loop {
            let mut min_node: Option<NodeId> = None;
            for &node in &left {
                if let Some(&w) = visited.get(&node) {
                    match min_node {
                        None => min_node = Some(node),
                        Some(m) if w < visited[&m] => min_node = Some(node),
                        _ => {}
                    }
                }
            }
            let Some(min_node) = min_node else { break };
            left.retain(|&x| x != min_node);
            let current_weight = visited[&min_node];

            for edge in &self.graph[min_node as usize] {
                let weight = current_weight + edge.etx;
                let better = match visited.get(&edge.node) {
                    None => true,
                    Some(&existing) => weight < existing,
                };
                if better {
                    visited.insert(edge.node, weight);
                    prev.insert(edge.node, min_node);
                }
            }
        }

        (visited, prev)
    }

    /// Returns `(weight, path)` from `src` to `dst`, or `None` if `dst` is
    /// unreachable from `src`. The path starts with `src` and ends with
    /// `dst`. For `src == dst` this returns `(0.0, [src])` without running
    /// the relaxation loop.
    pub fn shortest_path(&self, src: NodeId, dst: NodeId) -> Option<(f64, Vec<NodeId>)> {
        let (visited, prev) = self.dijkstra(src);

        if src == dst {
            return Some((*visited.get(&dst).unwrap_or(&0.0), vec![src]));
        }
        if prev.is_empty() || !prev.contains_key(&dst) {
            return None;
        }

        let mut path = VecDeque::new();
        let mut node_previous = prev[&dst];
        while node_previous != src {
            path.push_front(node_previous);
            node_previous = prev[&node_previous];
        }
        path.push_front(src);
        path.push_back(dst);

        Some((visited[&dst], path.into_iter().collect()))
    }

    fn calculate_cost_and_hop_matrices(&mut self) {
        let n = self.graph.len();
        for from in 1..n {
            let (visited, _) = self.dijkstra(from as NodeId);
            for (&to, &weight) in &visited {
                self.cost[from][to as usize] = weight;
            }
            self.cost[from][from] = 0.0;
        }
        for from in 1..n {
            for to in 1..n {
                if let Some((_, path)) = self.shortest_path(from as NodeId, to as NodeId) {
                    self.hop[from][to] = path.len() as i64 - 1;
                }
            }
        }
    }

    /// Shortest-path weight from `i` to `j`, or `-1.0` if unreachable.
    pub fn cost(&self, i: NodeId, j: NodeId) -> f64 {
        self.cost.get(i as usize).and_then(|row| row.get(j as usize)).copied().unwrap_or(UNREACHABLE)
    }

    /// Hop count of the chosen shortest path from `i` to `j`, or `-1` if
    /// unreachable.
    pub fn hops(&self, i: NodeId, j: NodeId) -> i64 {
        self.hop.get(i as usize).and_then(|row| row.get(j as usize)).copied().unwrap_or(-1)
    }

    /// The local interface `from` uses to directly reach `to`, or `None` if
    /// they are not directly adjacent. When more than one interface reaches
    /// the same neighbor, the first one listed wins.
    pub fn direct_interface(&self, from: NodeId, to: NodeId) -> Option<u16> {
        self.graph.get(from as usize)?.iter().find(|edge| edge.node == to).map(|edge| edge.interface)
    }

    /// Returns a derived graph keeping only edges whose endpoints share at
    /// least one partition, used to isolate virtual subnets.
    pub fn subnet_graph(&self, partitions: &[Vec<NodeId>]) -> AdjacencyGraph {
        let n = self.graph.len();
        let mut new_graph: AdjacencyGraph = vec![Vec::new(); n];

        for (node, row) in self.graph.iter().enumerate() {
            let node = node as NodeId;
            let subnets_of_node: Vec<usize> = partitions
                .iter()
                .enumerate()
                .filter(|(_, subnet)| subnet.contains(&node))
                .map(|(idx, _)| idx)
                .collect();
            if subnets_of_node.is_empty() {
                continue;
            }
            for edge in row {
                let shares_subnet =
                    subnets_of_node.iter().any(|&idx| partitions[idx].contains(&edge.node));
                if shares_subnet {
                    new_graph[node as usize].push(*edge);
                }
            }
        }

        new_graph
    }

    /// Ranks every candidate host by the traffic-weighted cost of serving
    /// `ledger` from it. Candidates requiring a `-1` (unreachable) lookup
    /// for any peer in the ledger are excluded. The result is sorted
    /// ascending by score; ties are broken by ascending node ID, since
    /// candidates are scored in that order and the sort is stable.
    pub fn rank_candidates(&self, ledger: &LedgerSnapshot) -> Vec<RankedCandidate> {
        let n = self.graph.len() as NodeId;
        let mut ranked = Vec::new();

        'candidate: for candidate in 1..n {
            let mut score = 0.0;
            for (&peer, traffic) in ledger {
                let cost_to_server = self.cost(peer, candidate);
                let cost_from_server = self.cost(candidate, peer);
                if cost_to_server < 0.0 || cost_from_server < 0.0 {
                    continue 'candidate;
                }
                score += cost_to_server * traffic.in_bytes as f64
                    + cost_from_server * traffic.out_bytes as f64;
            }
            ranked.push(RankedCandidate { id: candidate, score });
        }

        ranked.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap());
        ranked
    }
}
