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

//! Wires `mesh_runtime`'s concrete collaborators into a `mesh_core::MeshMediator`
//! and drives its main loop until an interrupt.

use clap::Parser;
use log::{error, info, warn};
use mesh_core::inspector::InspectorConfig;
use mesh_core::ledger::TrafficLedger;
use mesh_core::mediator::MeshMediator;
use mesh_core::router::Router;
use mesh_core::service::ServiceHandler;
use mesh_core::transport::Transporter;
use mesh_core::types::NodeId;
use mesh_runtime::{
    install_static_routes, load_adjacency_file, FileServiceStore, NoopPortSink, PacketSniffer,
    ProcLoadSampler, ProcPortDiscovery, ProcessLauncher, TcpConnection, TcpDialer, UdpBroadcast,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

const DISCOVERY_PORT: u16 = 6500;

/// CLI surface for the mesh service host agent, one field per external
/// interface option.
#[derive(Parser, Debug)]
#[command(name = "mesh_agent", about = "Self-migrating mesh service host agent")]
struct AgentArgs {
    /// Path to the JSON adjacency file describing the static mesh topology.
    adjacency_file: String,

    /// Path where the received service executable is persisted.
    service_file: String,

    /// The service executable to launch once started (and its arguments).
    #[arg(long = "service-exec", required = true)]
    service_exec: String,
    #[arg(long = "service-arg")]
    service_args: Vec<String>,

    /// Transporter TCP listen port.
    #[arg(long, default_value_t = 6001)]
    transporter_port: u16,

    /// Raise `startService` on boot instead of waiting for a received transfer.
    #[arg(long, default_value_t = false)]
    run_service_at_boot: bool,

    /// Skip wireless bring-up, read own ID from the wired interface, sniff wired traffic.
    #[arg(long, default_value_t = false)]
    testing_mode: bool,

    /// If false, the inspector never arms its migration timer.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    migration_enabled: bool,

    /// Node IDs to prune from the graph at load time.
    #[arg(long = "unreachable-host")]
    unreachable_hosts: Vec<NodeId>,

    /// If non-empty, the inspector only ever ranks these candidates.
    #[arg(long = "server-whitelist-host")]
    server_whitelist: Vec<NodeId>,

    /// Inspector cycle period, in seconds.
    #[arg(long, default_value_t = 30)]
    cycle_interval: u64,

    /// CPU/RAM sampling period, in seconds.
    #[arg(long, default_value_t = 1)]
    sample_interval: u64,

    /// CPU utilization percentage above which a cycle duplicates instead of migrating.
    #[arg(long, default_value_t = 20.0)]
    cpu_threshold: f64,

    /// RAM utilization percentage above which a cycle duplicates instead of migrating.
    #[arg(long, default_value_t = 15.0)]
    ram_threshold: f64,

    /// Minimum percentage improvement a migration candidate must offer over staying put.
    #[arg(long, default_value_t = 2.0)]
    migration_threshold: f64,
}

fn own_node_id(testing_mode: bool) -> Result<NodeId, String> {
    if !testing_mode {
        let output = Command::new("hostname").output().map_err(|e| e.to_string())?;
        let hostname = String::from_utf8_lossy(&output.stdout);
        let digits: String = hostname.chars().skip_while(|c| !c.is_ascii_digit()).take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().map_err(|_| format!("hostname '{}' has no trailing node number", hostname.trim()))
    } else {
        let output = Command::new("hostname").arg("-I").output().map_err(|e| e.to_string())?;
        let addrs = String::from_utf8_lossy(&output.stdout);
        let first = addrs.split_whitespace().next().ok_or("hostname -I returned no address")?;
        let last_octet = first.rsplit('.').next().ok_or("malformed IPv4 address")?;
        last_octet.parse().map_err(|_| format!("address '{first}' has no numeric last octet"))
    }
}

/// Canonical address of `node` on the primary wireless subnet, per the
/// original deployment's `10.0.0.x` addressing.
fn node_address(node: NodeId) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, node as u8))
}

fn run() -> Result<(), String> {
    let args = AgentArgs::parse();

    let own_id = own_node_id(args.testing_mode)?;
    let graph = load_adjacency_file(&args.adjacency_file).map_err(|e| e.to_string())?;
    let node_count = graph.len();
    let router = Arc::new(
        Router::build_from_adjacency(own_id, graph, &args.unreachable_hosts).map_err(|e| e.to_string())?,
    );

    if !args.testing_mode {
        install_static_routes(&router, node_count);
    }

    let own_ip = node_address(own_id);
    let addresses: HashMap<NodeId, std::net::SocketAddr> = (1..node_count as NodeId)
        .map(|n| (n, std::net::SocketAddr::new(node_address(n), args.transporter_port)))
        .collect();
    let addr_to_node: HashMap<IpAddr, NodeId> = (1..node_count as NodeId).map(|n| (node_address(n), n)).collect();

    let ledger = Arc::new(TrafficLedger::new());
    let broadcast_addrs = UdpBroadcast::default_broadcast_addrs(args.testing_mode, DISCOVERY_PORT);
    let broadcast = Arc::new(
        UdpBroadcast::bind(own_ip, DISCOVERY_PORT, broadcast_addrs).map_err(|e| e.to_string())?,
    );
    let launcher = Arc::new(ProcessLauncher::new(args.service_exec.clone(), args.service_args.clone()));
    let ports = Arc::new(ProcPortDiscovery);
    let store = Arc::new(FileServiceStore::new(args.service_file.clone()));

    let service = Arc::new(ServiceHandler::new(
        "mesh-service",
        own_ip,
        DISCOVERY_PORT,
        args.transporter_port,
        launcher,
        ports,
        broadcast,
        Arc::clone(&store) as Arc<dyn mesh_core::mediator::ServiceStore>,
    ));

    let transporter = Arc::new(Transporter::new());
    let dialer = Arc::new(TcpDialer::new(addresses, Duration::from_secs(5)));
    let load_sampler_pid = std::process::id();
    let load_sampler = ProcLoadSampler::spawn(load_sampler_pid, Duration::from_secs(args.sample_interval));

    let inspector_config = InspectorConfig {
        cycle_interval: Duration::from_secs(args.cycle_interval),
        cpu_threshold: args.cpu_threshold,
        ram_threshold: args.ram_threshold,
        migration_threshold: args.migration_threshold,
        server_whitelist: if args.server_whitelist.is_empty() { None } else { Some(args.server_whitelist.clone()) },
    };

    let interface = if args.testing_mode { "eth0" } else { "wlan0" };
    let port_sink: Arc<dyn mesh_core::mediator::PortSink> =
        match PacketSniffer::spawn(interface, own_ip, addr_to_node, Arc::clone(&ledger)) {
            Ok(sniffer) => sniffer as Arc<dyn mesh_core::mediator::PortSink>,
            Err(e) => {
                warn!("packet capture on {interface} unavailable, traffic ledger stays empty: {e}");
                Arc::new(NoopPortSink) as Arc<dyn mesh_core::mediator::PortSink>
            }
        };

    let discovery_service = Arc::clone(&service);

    let mediator = MeshMediator::new(
        router,
        Arc::clone(&ledger),
        service,
        transporter,
        dialer,
        store,
        port_sink,
        load_sampler,
        inspector_config,
        args.run_service_at_boot,
        args.migration_enabled,
    );

    std::thread::spawn(move || discovery_service.run_discovery_listener());

    let listener = TcpListener::bind((own_ip, args.transporter_port)).map_err(|e| e.to_string())?;
    let accept_mediator = Arc::clone(&mediator);
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let mediator = Arc::clone(&accept_mediator);
                    std::thread::spawn(move || {
                        let mut conn = TcpConnection::new(stream);
                        if let Err(err) = mediator.handle_receive(&mut conn) {
                            warn!("transporter accept failed: {err}");
                        }
                    });
                }
                Err(err) => warn!("transporter accept loop error: {err}"),
            }
        }
    });

    let shutdown_mediator = Arc::clone(&mediator);
    ctrlc::set_handler(move || {
        info!("received interrupt, shutting down");
        shutdown_mediator.shutdown();
    })
    .map_err(|e| e.to_string())?;

    mediator.run();
    Ok(())
}

fn main() {
    pretty_env_logger::init();
    if let Err(e) = run() {
        error!("{e}");
        eprintln!("mesh_agent: {e}");
        std::process::exit(1);
    }
}
