//! Static route installation for non-testing boots, supplementing the
//! distilled spec from the original `network_router.py::add_all_network_routes`.
//!
//! Best-effort: a failed route add is logged and the next destination is
//! still attempted, matching the original's per-route try/log.

use mesh_core::router::Router;
use mesh_core::types::NodeId;
use std::process::Command;

/// One of the three wireless subnets the original deployment used
/// (`10.0.{0,1,2}.x`).
const SUBNETS: [u8; 3] = [0, 1, 2];

/// Installs a static route to every node the router can reach, via the
/// first hop on its shortest path, on every wireless subnet. Shells out to
/// `ip route add`; logs and continues past any single failure.
pub fn install_static_routes(router: &Router, node_count: usize) {
    let own_id = router.own_id();
    for dest in 1..node_count as NodeId {
        if dest == own_id {
            continue;
        }
        let Some((_, path)) = router.shortest_path(own_id, dest) else {
            log::info!("no route found: {own_id} -> {dest}");
            continue;
        };
        if path.len() < 2 {
            continue;
        }
        let next_hop = path[1];
        let interface = router.direct_interface(own_id, next_hop).unwrap_or(0);

        for &subnet in &SUBNETS {
            let dest_addr = format!("10.0.{subnet}.{dest}");
            let gw_addr = format!("10.0.{interface}.{next_hop}");
            let dev = format!("wlan{interface}");
            let status = Command::new("ip")
                .args(["route", "add", &dest_addr, "via", &gw_addr, "dev", &dev])
                .status();
            match status {
                Ok(s) if s.success() => log::info!("installed route {dest_addr} via {gw_addr} dev {dev}"),
                Ok(s) => log::warn!("ip route add {dest_addr} exited with {s}"),
                Err(e) => log::warn!("failed to run ip route add {dest_addr}: {e}"),
            }
        }
    }
}
