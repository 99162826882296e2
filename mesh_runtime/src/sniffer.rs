//! Packet capture over the wired/wireless interface: watches the service's
//! discovered ports and records observed traffic directly into the traffic
//! ledger. Depends on `TrafficLedger` as a concrete data type rather than
//! routing through the `Mediator` trait boundary, since this is the
//! outermost layer and there is no cyclic-construction problem to solve here
//! (unlike `MeshMediator`'s `Inspector`/`ServiceHandler` wiring).
//!
//! Implements `PortSink` so the service handler's port-discovery results
//! become this sniffer's port filter directly, with no third component in
//! between.

use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use mesh_core::mediator::PortSink;
use mesh_core::ledger::TrafficLedger;
use mesh_core::types::NodeId;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn node_for(addr_to_node: &HashMap<IpAddr, NodeId>, ip: IpAddr) -> Option<NodeId> {
    addr_to_node.get(&ip).copied()
}

/// Extracts `(src_ip, dst_ip, src_port, dst_port, payload_len)` from one
/// sliced packet, or `None` if it isn't IPv4 TCP/UDP.
fn packet_fields(packet: &SlicedPacket) -> Option<(IpAddr, IpAddr, u16, u16, u64)> {
    let (src_ip, dst_ip) = match &packet.ip {
        Some(InternetSlice::Ipv4(header)) => {
            (IpAddr::V4(header.source_addr()), IpAddr::V4(header.destination_addr()))
        }
        _ => return None,
    };
    let (src_port, dst_port, payload_len) = match &packet.transport {
        Some(TransportSlice::Tcp(h)) => (h.source_port(), h.destination_port(), packet.payload.len() as u64),
        Some(TransportSlice::Udp(h)) => (h.source_port(), h.destination_port(), packet.payload.len() as u64),
        _ => return None,
    };
    Some((src_ip, dst_ip, src_port, dst_port, payload_len))
}

/// Captures on one interface, filters to the service's currently-known
/// ports, and reports every matching packet to the mediator.
#[derive(Debug)]
pub struct PacketSniffer {
    ports: Arc<Mutex<HashSet<u16>>>,
    cancelled: Arc<AtomicBool>,
}

impl PortSink for PacketSniffer {
    fn service_ports_found(&self, _pid: u32, ports: Vec<u16>) {
        let mut guard = self.ports.lock().unwrap();
        guard.clear();
        guard.extend(ports);
    }
}

impl PacketSniffer {
    /// Opens `interface` in promiscuous capture mode and spawns the reader
    /// thread. Logs and continues past individual malformed packets
    /// (`Sniffer.Parse`); a capture-open failure is returned to the caller
    /// since it means the agent cannot observe traffic at all.
    pub fn spawn(
        interface: &str,
        own_ip: IpAddr,
        addr_to_node: HashMap<IpAddr, NodeId>,
        ledger: Arc<TrafficLedger>,
    ) -> Result<Arc<Self>, pcap::Error> {
        let mut cap = pcap::Capture::from_device(interface)?.promisc(true).timeout(500).open()?;
        let interface = interface.to_string();

        let sniffer = Arc::new(PacketSniffer { ports: Arc::new(Mutex::new(HashSet::new())), cancelled: Arc::new(AtomicBool::new(false)) });

        let ports = Arc::clone(&sniffer.ports);
        let cancelled = Arc::clone(&sniffer.cancelled);
        std::thread::spawn(move || {
            while !cancelled.load(Ordering::SeqCst) {
                let packet = match cap.next() {
                    Ok(p) => p,
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => {
                        log::warn!("packet capture on {interface} stopped: {e}");
                        return;
                    }
                };
                let sliced = match SlicedPacket::from_ethernet(packet.data) {
                    Ok(s) => s,
                    Err(e) => {
                        log::debug!("dropped a packet that failed to decode: {e}");
                        continue;
                    }
                };
                let Some((src_ip, dst_ip, src_port, dst_port, len)) = packet_fields(&sliced) else { continue };

                let filter = ports.lock().unwrap();
                if filter.is_empty() || !(filter.contains(&src_port) || filter.contains(&dst_port)) {
                    continue;
                }
                drop(filter);

                let inbound = dst_ip == own_ip;
                let peer_ip = if inbound { src_ip } else { dst_ip };
                let Some(peer) = node_for(&addr_to_node, peer_ip) else { continue };
                ledger.record(peer, len, inbound);
            }
        });

        Ok(sniffer)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// A `PortSink` that discards every report, used when packet capture could
/// not be started (no libpcap device, insufficient privilege) so the agent
/// still runs with an always-empty traffic ledger instead of failing boot.
#[derive(Debug, Default)]
pub struct NoopPortSink;

impl PortSink for NoopPortSink {
    fn service_ports_found(&self, _pid: u32, _ports: Vec<u16>) {}
}
