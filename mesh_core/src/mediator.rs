//! C6 — the mediator: the only component that holds references to every
//! other component, and the sole serializer of start/stop/migrate/duplicate.
//!
//! Components never reference each other directly. Each one is handed an
//! `Arc<dyn Mediator>` (a [`WeakMediatorHandle`] in practice, to avoid a
//! reference cycle back to the struct that owns them) and calls back through
//! that trait only.

use crate::inspector::{Inspector, InspectorConfig, LoadSampler};
use crate::ledger::{LedgerSnapshot, TrafficLedger};
use crate::router::Router;
use crate::service::{ServiceConfig, ServiceHandler, ServiceStatus};
use crate::transport::{Dialer, ReceiveOutcome, Transporter};
use crate::types::{NodeId, RankedCandidate};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Persists and reads back the service executable's bytes. Implemented over
/// the local filesystem by `mesh_runtime`.
pub trait ServiceStore: std::fmt::Debug + Send + Sync {
    fn read_bytes(&self) -> std::io::Result<Vec<u8>>;
    fn write_bytes(&self, bytes: &[u8]) -> std::io::Result<()>;
    fn remove(&self) -> std::io::Result<()>;
}

/// Receives the filter set of ports the service ended up listening on, so
/// the packet source can start recording traffic on those ports.
pub trait PortSink: std::fmt::Debug + Send + Sync {
    fn service_ports_found(&self, pid: u32, ports: Vec<u16>);
}

/// The interface every component calls back through. Never call across
/// components directly; go through here.
pub trait Mediator: std::fmt::Debug + Send + Sync {
    /// The local node's own ID.
    fn own_id(&self) -> NodeId;
    /// Raises `startService` and blocks (up to the launch grace period) for
    /// the service status to resolve to `Started` or `ErrorStarting`.
    fn service_received(&self) -> (ServiceStatus, Option<String>);
    /// The service's discovered listening ports, forwarded to the packet
    /// source's filter set.
    fn service_ports_found(&self, pid: u32, ports: Vec<u16>);
    /// One observed packet on a service port.
    fn new_service_packet(&self, peer: NodeId, bytes: u64, inbound: bool);
    /// Delegates to the router.
    fn rank_candidates(&self, ledger: &LedgerSnapshot) -> Vec<RankedCandidate>;
    /// Raises `noRecent`.
    fn no_recent_connections(&self);
    /// Raises `migrate` (duplicate = false) or `duplicate` (duplicate =
    /// true) with the ranked destination list and a human-readable reason.
    fn send_service(&self, duplicate: bool, ranked: Vec<NodeId>, reason: String);
}

/// Observable mediator callbacks, useful for test doubles that want to
/// assert on what fired without reimplementing [`Mediator`] from scratch.
#[derive(Debug, Clone, PartialEq)]
pub enum MediatorEvent {
    ServiceReceived,
    ServicePortsFound { pid: u32, ports: Vec<u16> },
    NewServicePacket { peer: NodeId, bytes: u64, inbound: bool },
    NoRecentConnections,
    SendService { duplicate: bool, ranked: Vec<NodeId>, reason: String },
}

#[derive(Debug, Default)]
struct Flags {
    start: AtomicBool,
    stop: AtomicBool,
    no_recent: AtomicBool,
    migrate: Mutex<Option<(Vec<NodeId>, String)>>,
    duplicate: Mutex<Option<(Vec<NodeId>, String)>>,
}

/// Delegates every [`Mediator`] call to the [`MeshMediator`] it was built
/// from, through a `Weak` reference so components holding this handle don't
/// keep the mediator (and through it, themselves) alive forever.
#[derive(Debug, Clone)]
pub struct WeakMediatorHandle(Weak<MeshMediator>);

impl Mediator for WeakMediatorHandle {
    fn own_id(&self) -> NodeId {
        self.0.upgrade().map(|m| m.router.own_id()).unwrap_or(0)
    }

    fn service_received(&self) -> (ServiceStatus, Option<String>) {
        match self.0.upgrade() {
            Some(m) => m.request_start_and_wait(),
            None => (ServiceStatus::ErrorStarting("mediator gone".into()), Some("mediator gone".into())),
        }
    }

    fn service_ports_found(&self, pid: u32, ports: Vec<u16>) {
        if let Some(m) = self.0.upgrade() {
            m.port_sink.service_ports_found(pid, ports);
        }
    }

    fn new_service_packet(&self, peer: NodeId, bytes: u64, inbound: bool) {
        if let Some(m) = self.0.upgrade() {
            m.ledger.record(peer, bytes, inbound);
        }
    }

    fn rank_candidates(&self, ledger: &LedgerSnapshot) -> Vec<RankedCandidate> {
        self.0.upgrade().map(|m| m.router.rank_candidates(ledger)).unwrap_or_default()
    }

    fn no_recent_connections(&self) {
        if let Some(m) = self.0.upgrade() {
            m.flags.no_recent.store(true, Ordering::SeqCst);
        }
    }

    fn send_service(&self, duplicate: bool, ranked: Vec<NodeId>, reason: String) {
        if let Some(m) = self.0.upgrade() {
            let slot = if duplicate { &m.flags.duplicate } else { &m.flags.migrate };
            *slot.lock().unwrap() = Some((ranked, reason));
        }
    }
}

/// Owns the router, ledger, service handler, transporter and inspector, and
/// serializes the five lifecycle flags through its main loop.
#[derive(Debug)]
pub struct MeshMediator {
    router: Arc<Router>,
    ledger: Arc<TrafficLedger>,
    service: Arc<ServiceHandler>,
    transporter: Arc<Transporter>,
    inspector: Arc<Inspector>,
    dialer: Arc<dyn Dialer>,
    store: Arc<dyn ServiceStore>,
    port_sink: Arc<dyn PortSink>,
    mediator_handle: Arc<dyn Mediator>,
    flags: Flags,
    run_service_at_boot: bool,
    migration_enabled: bool,
    shutting_down: AtomicBool,
}

impl MeshMediator {
    /// Builds the mediator and every component it owns, wiring the
    /// mediator<->inspector reference cycle through a weak handle.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<Router>,
        ledger: Arc<TrafficLedger>,
        service: Arc<ServiceHandler>,
        transporter: Arc<Transporter>,
        dialer: Arc<dyn Dialer>,
        store: Arc<dyn ServiceStore>,
        port_sink: Arc<dyn PortSink>,
        load_sampler: Arc<dyn LoadSampler>,
        inspector_config: InspectorConfig,
        run_service_at_boot: bool,
        migration_enabled: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let mediator_handle: Arc<dyn Mediator> = Arc::new(WeakMediatorHandle(weak.clone()));
            let inspector = Inspector::new(
                inspector_config,
                Arc::clone(&router),
                Arc::clone(&ledger),
                load_sampler,
                Arc::clone(&mediator_handle),
            );
            MeshMediator {
                router,
                ledger,
                service,
                transporter,
                inspector,
                dialer,
                store,
                port_sink,
                mediator_handle,
                flags: Flags::default(),
                run_service_at_boot,
                migration_enabled,
                shutting_down: AtomicBool::new(false),
            }
        })
    }

    /// Runs the main loop until [`MeshMediator::shutdown`] is called from
    /// another thread. Polls the five flags in priority order once per
    /// millisecond; each branch clears its flag before acting.
    pub fn run(self: &Arc<Self>) {
        if self.run_service_at_boot {
            self.flags.start.store(true, Ordering::SeqCst);
        }
        while !self.shutting_down.load(Ordering::SeqCst) {
            if self.flags.start.swap(false, Ordering::SeqCst) {
                self.handle_start();
                continue;
            }
            if self.flags.stop.swap(false, Ordering::SeqCst) {
                self.handle_stop();
                continue;
            }
            if self.flags.no_recent.swap(false, Ordering::SeqCst) {
                self.handle_no_recent();
                continue;
            }
            if let Some((ranked, reason)) = self.flags.migrate.lock().unwrap().take() {
                self.handle_send(false, ranked, reason);
                continue;
            }
            if let Some((ranked, reason)) = self.flags.duplicate.lock().unwrap().take() {
                self.handle_send(true, ranked, reason);
                continue;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stops the main loop after its current iteration.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// `ServiceHandler.Stop()` calls land here via `StopService` (handshake
    /// failures on the receive side).
    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::SeqCst);
    }

    fn handle_start(&self) {
        log::info!("starting service");
        let status = self.service.start(Arc::clone(&self.mediator_handle));
        if matches!(status, ServiceStatus::Started) {
            self.inspector.arm();
        } else {
            log::warn!("service failed to start: {status:?}");
            self.service.reset();
        }
    }

    fn handle_stop(&self) {
        log::info!("stopping service");
        self.service.stop();
        self.service.reset();
        if self.migration_enabled {
            self.inspector.arm();
        }
    }

    fn handle_no_recent(&self) {
        self.service.announce_started();
    }

    fn handle_send(&self, duplicate: bool, ranked: Vec<NodeId>, reason: String) {
        log::info!("migration decision: duplicate={duplicate} reason={reason}");
        self.inspector.cancel();

        let service_bytes = match self.store.read_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("could not read service bytes for handoff: {err}");
                if self.migration_enabled {
                    self.inspector.arm();
                }
                return;
            }
        };
        let config = self.service.get_config();

        let result = self.transporter.send(
            self.dialer.as_ref(),
            &ranked,
            config.service_id,
            config.ports,
            service_bytes,
        );

        match result {
            Ok(()) => {
                if duplicate {
                    if self.migration_enabled {
                        self.inspector.arm();
                    }
                } else {
                    self.service.stop();
                }
            }
            Err(err) => {
                log::warn!("handoff failed: {err}");
                if self.migration_enabled {
                    self.inspector.arm();
                }
            }
        }
    }

    /// Raises `startService` and blocks up to 10s (polling once per second)
    /// for the status to resolve, for the transporter's receive handshake.
    fn request_start_and_wait(&self) -> (ServiceStatus, Option<String>) {
        self.flags.start.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match self.service.get_status() {
                ServiceStatus::Started => return (ServiceStatus::Started, None),
                ServiceStatus::ErrorStarting(reason) => {
                    return (ServiceStatus::ErrorStarting(reason.clone()), Some(reason))
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                let reason = "timed out waiting for service start".to_string();
                return (ServiceStatus::ErrorStarting(reason.clone()), Some(reason));
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    /// Called by the transporter's accept loop once a connection lands.
    /// Persists the payload, asks the service to start, and reports whether
    /// it came up so the caller can send the final token.
    pub fn handle_receive(
        &self,
        conn: &mut dyn crate::transport::Connection,
    ) -> Result<bool, crate::error::TransportError> {
        let already_running = !matches!(self.service.get_status(), ServiceStatus::NotStarted);
        let store = Arc::clone(&self.store);
        let service = Arc::clone(&self.service);
        let service_for_accept = Arc::clone(&self.service);
        let outcome = self.transporter.accept(
            conn,
            already_running,
            move || service_for_accept.set_status(ServiceStatus::InTransmission),
            move |payload| {
                if let Err(err) = store.write_bytes(&payload.service) {
                    log::warn!("failed to persist received service bytes: {err}");
                }
                service.set_config(payload.counter, payload.ports.clone());
            },
        )?;

        match outcome {
            ReceiveOutcome::Rejected { attempted } => {
                if attempted {
                    self.service.reset();
                }
                Ok(false)
            }
            ReceiveOutcome::Received(_) => {
                let (status, _) = self.request_start_and_wait();
                let started = matches!(status, ServiceStatus::Started);
                if !started {
                    self.request_stop();
                }
                self.transporter.respond_final(conn, started)?;
                Ok(started)
            }
        }
    }

    /// A read-only snapshot of the current service config, for callers that
    /// need it outside the mediator (e.g. the CLI's status command).
    pub fn service_config(&self) -> ServiceConfig {
        self.service.get_config()
    }

    /// A read-only snapshot of the current service status.
    pub fn service_status(&self) -> ServiceStatus {
        self.service.get_status()
    }
}
