//! C2 — the per-cycle traffic ledger.
//!
//! Accumulates per-peer in/out byte counts for one migration cycle and
//! atomically hands that snapshot to whoever asks while installing a fresh,
//! empty ledger. The ledger never calls out to any other component.

use crate::types::{NodeId, PeerTraffic};
use std::collections::HashMap;
use std::sync::Mutex;

/// An immutable snapshot of one migration cycle's traffic, keyed by peer.
pub type LedgerSnapshot = HashMap<NodeId, PeerTraffic>;

#[derive(Default)]
struct LedgerState {
    peers: LedgerSnapshot,
    total: u64,
}

/// Accumulates per-peer traffic in fixed migration cycles.
///
/// `total == sum(in + out)` over all peers is maintained as an invariant at
/// every observable point (right after `record` returns, and in every
/// snapshot returned by `snapshot_and_reset`).
#[derive(Debug)]
pub struct TrafficLedger {
    state: Mutex<LedgerState>,
}

impl std::fmt::Debug for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerState").field("total", &self.total).finish()
    }
}

impl Default for TrafficLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficLedger {
    /// Creates a fresh, empty ledger.
    pub fn new() -> Self {
        Self { state: Mutex::new(LedgerState::default()) }
    }

    /// Records a single packet. O(1).
    pub fn record(&self, peer: NodeId, bytes: u64, inbound: bool) {
        let mut state = self.state.lock().unwrap();
        let entry = state.peers.entry(peer).or_default();
        if inbound {
            entry.in_bytes += bytes;
        } else {
            entry.out_bytes += bytes;
        }
        state.total += bytes;
    }

    /// Atomically returns the current ledger state and installs a fresh,
    /// empty one in its place.
    pub fn snapshot_and_reset(&self) -> (LedgerSnapshot, u64) {
        let mut state = self.state.lock().unwrap();
        let taken = std::mem::take(&mut state.peers);
        let total = state.total;
        state.total = 0;
        (taken, total)
    }
}
