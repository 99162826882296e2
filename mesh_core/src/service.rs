//! C4 — service lifecycle, status/config bookkeeping, and discovery.
//!
//! Everything that touches an actual subprocess, socket, or OS listening-port
//! table is abstracted behind [`ServiceLauncher`], [`PortDiscovery`] and
//! [`Broadcast`] so this crate stays free of OS specifics; `mesh_runtime`
//! supplies the concrete implementations.

use crate::error::LaunchError;
use crate::mediator::{Mediator, ServiceStore};
use crate::types::ServiceId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A running child process, as handed back by a [`ServiceLauncher`].
#[derive(Debug, Clone, Copy)]
pub struct ChildHandle {
    /// OS process ID, used to look up listening ports and to signal.
    pub pid: u32,
}

/// Starts and stops the opaque user-supplied service binary.
pub trait ServiceLauncher: std::fmt::Debug + Send + Sync {
    /// Starts the child. Fails if the launcher itself could not exec it.
    fn launch(&self) -> Result<ChildHandle, LaunchError>;
    /// Sends an interrupt/terminate signal to the child.
    fn stop(&self, child: ChildHandle);
}

/// Polls the OS's listening-socket table for ports opened by `pid`.
pub trait PortDiscovery: std::fmt::Debug + Send + Sync {
    /// Returns every currently listening port owned by `pid`.
    fn listening_ports(&self, pid: u32) -> Vec<u16>;
}

/// The UDP broadcast/discovery channel: sends datagrams to every configured
/// broadcast address, and receives inbound discovery datagrams addressed to
/// this agent.
pub trait Broadcast: std::fmt::Debug + Send + Sync {
    /// Sends `payload` to every configured broadcast address on the
    /// broadcast port.
    fn send(&self, payload: &[u8]);
    /// Blocks up to `timeout` for an inbound datagram; returns its bytes and
    /// the sender's address.
    fn recv_timeout(&self, timeout: Duration) -> Option<(Vec<u8>, std::net::SocketAddr)>;
    /// Replies directly to `to` (used for `who_is` -> `who_is_answer`).
    fn reply_to(&self, to: std::net::SocketAddr, payload: &[u8]);
}

/// One lifecycle state of the service child. See the module docs for the
/// full transition graph; enforced by [`ServiceHandler`], not by this type.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceStatus {
    /// No child running; no transfer in progress.
    NotStarted,
    /// Child is running and reachable.
    Started,
    /// The launcher or the 10s post-receive grace period failed.
    ErrorStarting(String),
    /// A receive is in progress; the service file has not been persisted yet
    /// or has been persisted but not yet started.
    InTransmission,
}

/// `(serviceID, ports)`, as described in the data model.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Mesh-wide monotonic generation counter.
    pub service_id: ServiceId,
    /// Ports the child opened, minus the broadcast and transporter ports.
    pub ports: HashSet<u16>,
}

#[derive(Serialize, Deserialize, Debug)]
struct DiscoveryMessage {
    service_name: String,
    event: String,
    #[serde(rename = "serverIP", skip_serializing_if = "Option::is_none")]
    server_ip: Option<String>,
    #[serde(rename = "serviceID", skip_serializing_if = "Option::is_none")]
    service_id: Option<ServiceId>,
}

struct Inner {
    status: ServiceStatus,
    config: ServiceConfig,
    child: Option<ChildHandle>,
}

/// Starts/stops the service child, tracks its status and config, discovers
/// its listening ports and answers mesh discovery datagrams.
#[derive(Debug)]
pub struct ServiceHandler {
    service_name: String,
    server_ip: IpAddr,
    reserved_ports: [u16; 2],
    state: Mutex<Inner>,
    discovery_cancelled: Arc<AtomicBool>,
    launcher: Arc<dyn ServiceLauncher>,
    ports: Arc<dyn PortDiscovery>,
    broadcast: Arc<dyn Broadcast>,
    store: Arc<dyn ServiceStore>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("status", &self.status)
            .field("config", &self.config)
            .field("child", &self.child)
            .finish()
    }
}

impl ServiceHandler {
    /// Builds a new handler in `NotStarted` with an empty config.
    ///
    /// `broadcast_port` and `transporter_port` are excluded from any
    /// discovered or configured port set, per the data model.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service_name: impl Into<String>,
        server_ip: IpAddr,
        broadcast_port: u16,
        transporter_port: u16,
        launcher: Arc<dyn ServiceLauncher>,
        ports: Arc<dyn PortDiscovery>,
        broadcast: Arc<dyn Broadcast>,
        store: Arc<dyn ServiceStore>,
    ) -> Self {
        ServiceHandler {
            service_name: service_name.into(),
            server_ip,
            reserved_ports: [broadcast_port, transporter_port],
            state: Mutex::new(Inner {
                status: ServiceStatus::NotStarted,
                config: ServiceConfig::default(),
                child: None,
            }),
            discovery_cancelled: Arc::new(AtomicBool::new(true)),
            launcher,
            ports,
            broadcast,
            store,
        }
    }

    /// Launches the child, transitions to `Started` on success, records its
    /// PID, and arms the open-port discovery timer. Broadcasts `started`.
    ///
    /// `self` must be held in an `Arc` since the discovery timer runs on a
    /// background thread that outlives this call.
    pub fn start(self: &Arc<Self>, mediator: Arc<dyn Mediator>) -> ServiceStatus {
        match self.launcher.launch() {
            Ok(child) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.status = ServiceStatus::Started;
                    state.child = Some(child);
                }
                self.spawn_port_discovery(child, mediator);
                self.broadcast_event("started");
                ServiceStatus::Started
            }
            Err(err) => {
                let mut state = self.state.lock().unwrap();
                state.status = ServiceStatus::ErrorStarting(err.to_string());
                state.status.clone()
            }
        }
    }

    fn spawn_port_discovery(self: &Arc<Self>, child: ChildHandle, mediator: Arc<dyn Mediator>) {
        self.discovery_cancelled.store(false, Ordering::SeqCst);
        let handler = Arc::clone(self);
        let cancelled = Arc::clone(&self.discovery_cancelled);
        std::thread::spawn(move || loop {
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_secs(5));
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            let found: Vec<u16> = handler
                .ports
                .listening_ports(child.pid)
                .into_iter()
                .filter(|p| !handler.reserved_ports.contains(p))
                .collect();
            if !found.is_empty() {
                cancelled.store(true, Ordering::SeqCst);
                mediator.service_ports_found(child.pid, found);
                return;
            }
        });
    }

    /// Signals the child to stop, clears status to `NotStarted`, broadcasts
    /// `stopped`. Returns `true` if a child was actually running.
    pub fn stop(&self) -> bool {
        let child = {
            let mut state = self.state.lock().unwrap();
            let child = state.child.take();
            state.status = ServiceStatus::NotStarted;
            child
        };
        self.discovery_cancelled.store(true, Ordering::SeqCst);
        if let Some(child) = child {
            self.launcher.stop(child);
            self.broadcast_event("stopped");
            true
        } else {
            false
        }
    }

    /// Cancels port discovery, removes the on-disk service file and returns
    /// to `NotStarted`. Does not signal the child (use
    /// [`ServiceHandler::stop`] for that first). Idempotent.
    pub fn reset(&self) -> bool {
        self.discovery_cancelled.store(true, Ordering::SeqCst);
        if let Err(err) = self.store.remove() {
            log::debug!("reset: no service file to remove ({err})");
        }
        let mut state = self.state.lock().unwrap();
        state.status = ServiceStatus::NotStarted;
        state.child = None;
        true
    }

    /// Current status.
    pub fn get_status(&self) -> ServiceStatus {
        self.state.lock().unwrap().status.clone()
    }

    /// Sets the status directly (used by the transporter/mediator to mark
    /// `InTransmission` or `ErrorStarting`).
    pub fn set_status(&self, status: ServiceStatus) {
        self.state.lock().unwrap().status = status;
    }

    /// Current `(serviceID, ports)`.
    pub fn get_config(&self) -> ServiceConfig {
        self.state.lock().unwrap().config.clone()
    }

    /// Sets `(serviceID, ports)`, filtering the broadcast and transporter
    /// ports out of `ports` first.
    pub fn set_config(&self, service_id: ServiceId, ports: HashSet<u16>) {
        let filtered: HashSet<u16> =
            ports.into_iter().filter(|p| !self.reserved_ports.contains(p)).collect();
        let mut state = self.state.lock().unwrap();
        state.config = ServiceConfig { service_id, ports: filtered };
    }

    /// Re-broadcasts `started` without touching status or config; used when
    /// the inspector reports a quiet cycle so isolated clients rediscover.
    pub fn announce_started(&self) {
        self.broadcast_event("started");
    }

    fn broadcast_event(&self, event: &str) {
        let service_id = self.get_config().service_id;
        let msg = DiscoveryMessage {
            service_name: self.service_name.clone(),
            event: event.to_string(),
            server_ip: Some(self.server_ip.to_string()),
            service_id: Some(service_id),
        };
        if let Ok(body) = serde_json::to_vec(&msg) {
            self.broadcast.send(&body);
        }
    }

    /// Runs the always-on `who_is` responder loop. Intended to be spawned on
    /// its own thread for the agent's lifetime; only answers while status is
    /// `Started`.
    pub fn run_discovery_listener(&self) {
        loop {
            let Some((bytes, from)) = self.broadcast.recv_timeout(Duration::from_millis(500))
            else {
                continue;
            };
            let Ok(msg) = serde_json::from_slice::<DiscoveryMessage>(&bytes) else {
                continue;
            };
            if msg.event != "who_is" {
                continue;
            }
            if self.get_status() != ServiceStatus::Started {
                continue;
            }
            let answer = DiscoveryMessage {
                service_name: self.service_name.clone(),
                event: "who_is_answer".to_string(),
                server_ip: Some(self.server_ip.to_string()),
                service_id: Some(self.get_config().service_id),
            };
            if let Ok(body) = serde_json::to_vec(&answer) {
                self.broadcast.reply_to(from, &body);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mediator::MediatorEvent;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::mpsc::{channel, Sender};

    #[derive(Debug)]
    struct FakeLauncher {
        fail: bool,
    }
    impl ServiceLauncher for FakeLauncher {
        fn launch(&self) -> Result<ChildHandle, LaunchError> {
            if self.fail {
                Err(LaunchError::ExecFailed("boom".into()))
            } else {
                Ok(ChildHandle { pid: 42 })
            }
        }
        fn stop(&self, _child: ChildHandle) {}
    }

    #[derive(Debug)]
    struct FakePorts {
        ports: Vec<u16>,
    }
    impl PortDiscovery for FakePorts {
        fn listening_ports(&self, _pid: u32) -> Vec<u16> {
            self.ports.clone()
        }
    }

    #[derive(Debug)]
    struct FakeBroadcast {
        sent: Mutex<Vec<Vec<u8>>>,
    }
    impl Broadcast for FakeBroadcast {
        fn send(&self, payload: &[u8]) {
            self.sent.lock().unwrap().push(payload.to_vec());
        }
        fn recv_timeout(&self, timeout: Duration) -> Option<(Vec<u8>, SocketAddr)> {
            std::thread::sleep(timeout);
            None
        }
        fn reply_to(&self, _to: SocketAddr, _payload: &[u8]) {}
    }

    #[derive(Debug)]
    struct FakeMediator {
        tx: Sender<MediatorEvent>,
    }
    impl Mediator for FakeMediator {
        fn own_id(&self) -> crate::types::NodeId {
            1
        }
        fn service_received(&self) -> (ServiceStatus, Option<String>) {
            (ServiceStatus::Started, None)
        }
        fn service_ports_found(&self, pid: u32, ports: Vec<u16>) {
            let _ = self.tx.send(MediatorEvent::ServicePortsFound { pid, ports });
        }
        fn new_service_packet(&self, _peer: crate::types::NodeId, _bytes: u64, _inbound: bool) {}
        fn rank_candidates(
            &self,
            _ledger: &crate::ledger::LedgerSnapshot,
        ) -> Vec<crate::types::RankedCandidate> {
            Vec::new()
        }
        fn no_recent_connections(&self) {}
        fn send_service(&self, _duplicate: bool, _ranked: Vec<crate::types::NodeId>, _reason: String) {}
    }

    #[derive(Debug)]
    struct FakeStore;
    impl ServiceStore for FakeStore {
        fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn write_bytes(&self, _bytes: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        fn remove(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn start_success_transitions_to_started_and_broadcasts() {
        let broadcast = Arc::new(FakeBroadcast { sent: Mutex::new(Vec::new()) });
        let handler = Arc::new(ServiceHandler::new(
            "svc",
            addr(),
            6500,
            6001,
            Arc::new(FakeLauncher { fail: false }),
            Arc::new(FakePorts { ports: vec![] }),
            broadcast.clone(),
            Arc::new(FakeStore),
        ));
        let (tx, _rx) = channel();
        let status = handler.start(Arc::new(FakeMediator { tx }));
        assert_eq!(status, ServiceStatus::Started);
        assert_eq!(handler.get_status(), ServiceStatus::Started);
        assert_eq!(broadcast.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn start_failure_sets_error_starting() {
        let handler = Arc::new(ServiceHandler::new(
            "svc",
            addr(),
            6500,
            6001,
            Arc::new(FakeLauncher { fail: true }),
            Arc::new(FakePorts { ports: vec![] }),
            Arc::new(FakeBroadcast { sent: Mutex::new(Vec::new()) }),
            Arc::new(FakeStore),
        ));
        let (tx, _rx) = channel();
        let status = handler.start(Arc::new(FakeMediator { tx }));
        assert!(matches!(status, ServiceStatus::ErrorStarting(_)));
    }

    #[test]
    fn port_discovery_excludes_reserved_ports_and_notifies_mediator() {
        let handler = Arc::new(ServiceHandler::new(
            "svc",
            addr(),
            6500,
            6001,
            Arc::new(FakeLauncher { fail: false }),
            Arc::new(FakePorts { ports: vec![6500, 6001, 9000] }),
            Arc::new(FakeBroadcast { sent: Mutex::new(Vec::new()) }),
            Arc::new(FakeStore),
        ));
        let (tx, rx) = channel();
        handler.start(Arc::new(FakeMediator { tx }));

        let event = rx.recv_timeout(Duration::from_secs(7)).expect("port discovery should fire");
        match event {
            MediatorEvent::ServicePortsFound { ports, .. } => assert_eq!(ports, vec![9000]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn reset_is_idempotent() {
        let handler = ServiceHandler::new(
            "svc",
            addr(),
            6500,
            6001,
            Arc::new(FakeLauncher { fail: false }),
            Arc::new(FakePorts { ports: vec![] }),
            Arc::new(FakeBroadcast { sent: Mutex::new(Vec::new()) }),
            Arc::new(FakeStore),
        );
        assert!(handler.reset());
        assert!(handler.reset());
        assert_eq!(handler.get_status(), ServiceStatus::NotStarted);
    }

    #[test]
    fn set_config_filters_reserved_ports() {
        let handler = ServiceHandler::new(
            "svc",
            addr(),
            6500,
            6001,
            Arc::new(FakeLauncher { fail: false }),
            Arc::new(FakePorts { ports: vec![] }),
            Arc::new(FakeBroadcast { sent: Mutex::new(Vec::new()) }),
            Arc::new(FakeStore),
        );
        handler.set_config(9, [6500, 6001, 8080].into_iter().collect());
        let config = handler.get_config();
        assert_eq!(config.service_id, 9);
        assert_eq!(config.ports, [8080].into_iter().collect());
    }
}
