//! Error types for the routing, transport and service-launch subsystems.
//!
//! Each enum corresponds to one of the error kinds named in the design's
//! error-handling section. There are no cross-component exceptions: every
//! component surfaces its own errors as a `Result` of its public operations,
//! and only the mediator decides whether to retry, reset, or continue.

use crate::types::NodeId;
use thiserror::Error;

/// Errors raised while building the [`crate::router::Router`] from a raw
/// adjacency list.
#[derive(Debug, Error, PartialEq)]
pub enum RouterError {
    /// An edge has a negative ETX weight.
    #[error("edge {from} -> {to} has negative weight {weight}")]
    NegativeWeight {
        /// Edge source.
        from: NodeId,
        /// Edge destination.
        to: NodeId,
        /// The offending (negative) weight.
        weight: f64,
    },
    /// An edge references a node index outside of `[0, N)`.
    #[error("edge from node {from} references out-of-range node {to}")]
    NodeOutOfRange {
        /// Edge source.
        from: NodeId,
        /// The out-of-range destination referenced by the edge.
        to: NodeId,
    },
    /// An edge is a self-loop (`peerID == row index`), which the adjacency
    /// graph invariant forbids.
    #[error("node {0} has a self-loop edge")]
    SelfLoop(NodeId),
    /// The adjacency list was empty (no rows at all, not even the unused
    /// sentinel row 0).
    #[error("adjacency list is empty")]
    EmptyGraph,
}

/// Errors raised while sending or receiving a service over the transporter's
/// TCP protocol. Variants map directly onto the wire tokens, since a sender
/// needs to tell a `CONFLICT` (stop trying candidates) from a timeout (try
/// the next one).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The target is already running a service instance; do not try the
    /// next candidate, another sender already won.
    #[error("target already running the service")]
    Conflict,
    /// A send is already in progress on this agent.
    #[error("a send is already in progress")]
    Locked,
    /// No candidate in the ranked list accepted the transfer.
    #[error("no reachable candidate accepted the service")]
    NotFound,
    /// A connection attempt to one candidate timed out.
    #[error("connection to candidate timed out")]
    Timeout,
    /// A connection or framed read/write failed with an I/O error.
    #[error("transport I/O error: {0}")]
    Io(String),
    /// The payload was garbled (empty body, bad JSON, truncated frame).
    #[error("transport payload was corrupt")]
    TransportError,
    /// The receiver's service launch failed after accepting the transfer.
    #[error("receiver failed to start the service")]
    InternalServerError,
}

/// Errors raised while starting the user-supplied service subprocess.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The launcher reported a nonzero exit, or the child never opened a
    /// listening port.
    #[error("service process failed to start: {0}")]
    ExecFailed(String),
    /// `ServiceReceived` waited the full grace period and the status never
    /// left `InTransmission`.
    #[error("timed out waiting for the service to start")]
    Timeout,
}
