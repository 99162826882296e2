// mesh_core: control-plane for a self-migrating mesh service host.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! # mesh_runtime
//!
//! The OS/network collaborators `mesh_core` abstracts behind traits:
//! adjacency-file loading, packet capture, CPU/RAM load sampling, process
//! launch and open-port discovery, real TCP/UDP transport, filesystem
//! service storage, and static route installation.

pub mod adjacency;
pub mod launcher;
pub mod net;
pub mod routes;
pub mod sampler;
pub mod sniffer;
pub mod store;

pub use adjacency::{load_adjacency_file, AdjacencyLoadError};
pub use launcher::{ProcPortDiscovery, ProcessLauncher};
pub use net::{TcpConnection, TcpDialer, UdpBroadcast};
pub use routes::install_static_routes;
pub use sampler::ProcLoadSampler;
pub use sniffer::{NoopPortSink, PacketSniffer};
pub use store::FileServiceStore;
