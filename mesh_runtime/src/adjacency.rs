//! Loads the JSON adjacency file described in the external interfaces into
//! the shape `mesh_core::Router` expects.

use mesh_core::router::AdjacencyGraph;
use mesh_core::types::Edge;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// One row entry of the adjacency file, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEdge {
    pub node: u16,
    pub interface: u16,
    pub etx: f64,
}

/// Errors reading or parsing the adjacency file. Fatal at boot; the caller
/// turns this into a one-line diagnostic and a nonzero exit.
#[derive(Debug, Error)]
pub enum AdjacencyLoadError {
    #[error("failed to read adjacency file {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("failed to parse adjacency file {path}: {source}")]
    Parse { path: String, #[source] source: serde_json::Error },
}

/// Reads and parses the adjacency file at `path` into an [`AdjacencyGraph`].
/// Does not prune unreachable hosts or validate edges; that is
/// `mesh_core::Router::build_from_adjacency`'s job.
pub fn load_adjacency_file(path: impl AsRef<Path>) -> Result<AdjacencyGraph, AdjacencyLoadError> {
    let path_ref = path.as_ref();
    let raw = std::fs::read_to_string(path_ref)
        .map_err(|source| AdjacencyLoadError::Io { path: path_ref.display().to_string(), source })?;
    let rows: Vec<Vec<RawEdge>> = serde_json::from_str(&raw)
        .map_err(|source| AdjacencyLoadError::Parse { path: path_ref.display().to_string(), source })?;
    Ok(rows
        .into_iter()
        .map(|row| row.into_iter().map(|e| Edge { node: e.node, interface: e.interface, etx: e.etx }).collect())
        .collect())
}
