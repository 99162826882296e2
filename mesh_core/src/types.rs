//! Shared value types used across the routing and migration subsystem.

use serde::{Deserialize, Serialize};

/// Identifies a participating host. Valid range is `1..=N` where `N` is the
/// number of rows in the adjacency graph; `0` is a reserved sentinel and
/// never assigned to a real node.
pub type NodeId = u16;

/// Mesh-wide monotonic counter identifying a service generation. Incremented
/// by one in the sender before every successful handoff.
pub type ServiceId = u64;

/// A directed edge of the static adjacency graph: hop to `peer` over the
/// given `interface` at cost `etx` (expected transmission count, any
/// nonnegative real).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Destination node of this hop.
    pub node: NodeId,
    /// Local interface index the hop goes out on.
    pub interface: u16,
    /// Nonnegative edge weight ("expected transmission count").
    pub etx: f64,
}

/// One ranked destination candidate produced by [`crate::router::Router::rank_candidates`].
///
/// Lower `score` is better. Candidates are ordered ascending by score, with
/// ties broken by insertion order (lowest node ID wins) — see
/// `Router::rank_candidates` for why this matters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedCandidate {
    /// The candidate host.
    pub id: NodeId,
    /// The traffic-weighted path cost of running the service on `id`.
    pub score: f64,
}

/// Per-peer accumulated traffic for one migration cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerTraffic {
    /// Bytes received from this peer.
    pub in_bytes: u64,
    /// Bytes sent to this peer.
    pub out_bytes: u64,
}
