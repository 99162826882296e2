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

//! # mesh_core
//!
//! The mediator of the migration control loop for a flat wireless mesh of
//! identical agents, each of which can host a single long-running service
//! process and hand it off to a better-placed peer.
//!
//! This crate implements the six components described in the design: the
//! [`router`] (shortest paths and candidate ranking), the [`ledger`]
//! (per-cycle traffic accounting), the [`inspector`] (the periodic migration
//! decision), the [`service`] handler (service lifecycle, status and
//! discovery), the [`transport`] protocol (handing the service binary
//! between agents) and the [`mediator`] that serializes all of the above.
//!
//! Everything that needs the local OS, the network interface, or a
//! subprocess lives one layer up, in `mesh_runtime` and `mesh_agent`: this
//! crate only knows about the abstractions named in its traits.

#![deny(missing_debug_implementations)]

pub mod error;
pub mod inspector;
pub mod ledger;
pub mod mediator;
pub mod router;
pub mod service;
pub mod transport;
pub mod types;

pub use error::{LaunchError, RouterError, TransportError};
pub use ledger::TrafficLedger;
pub use mediator::{Mediator, MediatorEvent, MeshMediator, PortSink, ServiceStore};
pub use router::Router;
pub use service::{ServiceConfig, ServiceHandler, ServiceStatus};
pub use transport::{Dialer, Transporter};
pub use types::{NodeId, RankedCandidate, ServiceId};
