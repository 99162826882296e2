//! C3 — the periodic migration/duplication decision.

use crate::ledger::TrafficLedger;
use crate::mediator::Mediator;
use crate::router::Router;
use crate::types::NodeId;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Drains accumulated CPU/RAM utilization samples since the last call.
pub trait LoadSampler: std::fmt::Debug + Send + Sync {
    /// Returns `(avgCPU, avgRAM)` since the previous drain, as percentages.
    fn drain(&self) -> (f64, f64);
}

/// Read-only configuration for one [`Inspector`], set once at construction.
#[derive(Debug, Clone)]
pub struct InspectorConfig {
    pub cycle_interval: Duration,
    pub cpu_threshold: f64,
    pub ram_threshold: f64,
    pub migration_threshold: f64,
    pub server_whitelist: Option<Vec<NodeId>>,
}

struct TimerState {
    cancelled: bool,
    armed: bool,
}

/// Periodically snapshots the traffic ledger and decides whether the
/// mediator should migrate, duplicate, or do nothing.
#[derive(Debug)]
pub struct Inspector {
    config: InspectorConfig,
    router: Arc<Router>,
    ledger: Arc<TrafficLedger>,
    load_sampler: Arc<dyn LoadSampler>,
    mediator: Arc<dyn Mediator>,
    timer: Mutex<TimerState>,
    timer_cv: Condvar,
    in_tick: Mutex<()>,
}

impl std::fmt::Debug for TimerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerState").field("cancelled", &self.cancelled).field("armed", &self.armed).finish()
    }
}

impl Inspector {
    pub fn new(
        config: InspectorConfig,
        router: Arc<Router>,
        ledger: Arc<TrafficLedger>,
        load_sampler: Arc<dyn LoadSampler>,
        mediator: Arc<dyn Mediator>,
    ) -> Arc<Self> {
        Arc::new(Inspector {
            config,
            router,
            ledger,
            load_sampler,
            mediator,
            timer: Mutex::new(TimerState { cancelled: true, armed: false }),
            timer_cv: Condvar::new(),
            in_tick: Mutex::new(()),
        })
    }

    /// Arms the periodic timer if it is not already running. Spawns a
    /// background thread that ticks once per `cycle_interval` until
    /// [`Inspector::cancel`] is called.
    pub fn arm(self: &Arc<Self>) {
        let mut state = self.timer.lock().unwrap();
        if state.armed {
            return;
        }
        state.armed = true;
        state.cancelled = false;
        drop(state);

        let inspector = Arc::clone(self);
        std::thread::spawn(move || loop {
            let cancelled = {
                let state = inspector.timer.lock().unwrap();
                let (state, _) = inspector
                    .timer_cv
                    .wait_timeout_while(state, inspector.config.cycle_interval, |s| !s.cancelled)
                    .unwrap();
                state.cancelled
            };
            if cancelled {
                return;
            }
            let _tick_guard = inspector.in_tick.lock().unwrap();
            inspector.tick();
        });
    }

    /// Whether the periodic timer is currently armed. Crate-internal; used
    /// by the mediator's own tests to assert re-arming behavior.
    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.timer.lock().unwrap().armed
    }

    /// Stops the timer and blocks until any in-flight tick has finished.
    pub fn cancel(&self) {
        {
            let mut state = self.timer.lock().unwrap();
            state.cancelled = true;
            state.armed = false;
        }
        self.timer_cv.notify_all();
        drop(self.in_tick.lock().unwrap());
    }

    /// The full per-cycle decision procedure. Exposed directly so tests can
    /// drive it without waiting on the timer.
    pub fn tick(&self) {
        let (ledger, total) = self.ledger.snapshot_and_reset();
        if total == 0 {
            log::debug!("migration cycle saw no traffic");
            self.mediator.no_recent_connections();
            return;
        }

        let mut ranked = self.router.rank_candidates(&ledger);
        let own_id = self.router.own_id();
        if ranked.is_empty() || ranked[0].id == own_id {
            log::debug!("best candidate is the local node; nothing to do");
            return;
        }

        if let Some(whitelist) = &self.config.server_whitelist {
            ranked.retain(|c| whitelist.contains(&c.id));
            if ranked.is_empty() {
                log::debug!("whitelist excluded every eligible candidate");
                return;
            }
        }

        let best_score = ranked[0].score;
        if let Some(own_candidate) = ranked.iter().find(|c| c.id == own_id) {
            let own_score = own_candidate.score;
            if best_score > 0.0 && own_score / best_score < 1.0 + self.config.migration_threshold / 100.0 {
                log::debug!(
                    "rejecting migration: own/best = {:.4} below threshold",
                    own_score / best_score
                );
                return;
            }
        }

        let (avg_cpu, avg_ram) = self.load_sampler.drain();
        let duplicate = avg_cpu > self.config.cpu_threshold || avg_ram > self.config.ram_threshold;
        let destinations: Vec<NodeId> = ranked.iter().map(|c| c.id).collect();
        let reason = if duplicate {
            format!("local load high (cpu={avg_cpu:.1}, ram={avg_ram:.1})")
        } else {
            format!("better candidate found (own/best = {:.4})", ranked.iter().find(|c| c.id == own_id).map(|c| c.score / best_score).unwrap_or(0.0))
        };
        self.mediator.send_service(duplicate, destinations, reason);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::router::AdjacencyGraph;
    use crate::types::{Edge, RankedCandidate};
    use std::sync::Mutex as StdMutex;

    fn edge(node: NodeId, etx: f64) -> Edge {
        Edge { node, interface: 0, etx }
    }

    fn trivial_graph() -> AdjacencyGraph {
        vec![
            vec![],
            vec![edge(2, 1.0), edge(3, 2.0)],
            vec![edge(1, 1.0), edge(3, 3.0)],
            vec![edge(1, 2.0), edge(2, 3.0)],
        ]
    }

    #[derive(Debug)]
    struct FixedLoad {
        cpu: f64,
        ram: f64,
    }
    impl LoadSampler for FixedLoad {
        fn drain(&self) -> (f64, f64) {
            (self.cpu, self.ram)
        }
    }

    #[derive(Debug, PartialEq, Clone)]
    enum Observed {
        NoRecent,
        Send { duplicate: bool, ranked: Vec<NodeId> },
        None,
    }

    #[derive(Debug)]
    struct SpyMediator {
        observed: StdMutex<Observed>,
    }
    impl Mediator for SpyMediator {
        fn own_id(&self) -> NodeId {
            1
        }
        fn service_received(&self) -> (crate::service::ServiceStatus, Option<String>) {
            (crate::service::ServiceStatus::Started, None)
        }
        fn service_ports_found(&self, _pid: u32, _ports: Vec<u16>) {}
        fn new_service_packet(&self, _peer: NodeId, _bytes: u64, _inbound: bool) {}
        fn rank_candidates(&self, _ledger: &crate::ledger::LedgerSnapshot) -> Vec<RankedCandidate> {
            Vec::new()
        }
        fn no_recent_connections(&self) {
            *self.observed.lock().unwrap() = Observed::NoRecent;
        }
        fn send_service(&self, duplicate: bool, ranked: Vec<NodeId>, _reason: String) {
            *self.observed.lock().unwrap() = Observed::Send { duplicate, ranked };
        }
    }

    fn make_inspector(config: InspectorConfig, mediator: Arc<SpyMediator>) -> (Arc<Inspector>, Arc<TrafficLedger>) {
        let router = Arc::new(crate::router::Router::build_from_adjacency(1, trivial_graph(), &[]).unwrap());
        let ledger = Arc::new(TrafficLedger::new());
        let inspector = Inspector::new(
            config,
            router,
            Arc::clone(&ledger),
            Arc::new(FixedLoad { cpu: 0.0, ram: 0.0 }),
            mediator,
        );
        (inspector, ledger)
    }

    fn base_config() -> InspectorConfig {
        InspectorConfig {
            cycle_interval: Duration::from_secs(30),
            cpu_threshold: 20.0,
            ram_threshold: 15.0,
            migration_threshold: 2.0,
            server_whitelist: None,
        }
    }

    #[test]
    fn empty_cycle_reports_no_recent_connections() {
        let mediator = Arc::new(SpyMediator { observed: StdMutex::new(Observed::None) });
        let (inspector, _ledger) = make_inspector(base_config(), Arc::clone(&mediator));
        inspector.tick();
        assert_eq!(*mediator.observed.lock().unwrap(), Observed::NoRecent);
    }

    /// Scenario 1: ledger {2: in=100}; 0% threshold migrates to [2,1,3].
    #[test]
    fn trivial_rank_migrates_with_zero_threshold() {
        let mut config = base_config();
        config.migration_threshold = 0.0;
        let mediator = Arc::new(SpyMediator { observed: StdMutex::new(Observed::None) });
        let (inspector, ledger) = make_inspector(config, Arc::clone(&mediator));
        ledger.record(2, 100, true);

        inspector.tick();
        match &*mediator.observed.lock().unwrap() {
            Observed::Send { duplicate, ranked } => {
                assert!(!duplicate);
                assert_eq!(ranked, &vec![2, 1, 3]);
            }
            other => panic!("expected Send, got {other:?}"),
        };
    }

    /// Scenario 2: threshold 2% rejects a tied own/best score.
    #[test]
    fn threshold_rejects_tied_scores() {
        let config = base_config();
        let mediator = Arc::new(SpyMediator { observed: StdMutex::new(Observed::None) });
        let (inspector, ledger) = make_inspector(config, Arc::clone(&mediator));
        ledger.record(2, 50, true);
        ledger.record(3, 50, true);

        inspector.tick();
        assert_eq!(*mediator.observed.lock().unwrap(), Observed::None);
    }

    #[test]
    fn high_cpu_triggers_duplicate_instead_of_migrate() {
        let mut config = base_config();
        config.migration_threshold = 0.0;
        let mediator = Arc::new(SpyMediator { observed: StdMutex::new(Observed::None) });
        let router = Arc::new(crate::router::Router::build_from_adjacency(1, trivial_graph(), &[]).unwrap());
        let ledger = Arc::new(TrafficLedger::new());
        let inspector = Inspector::new(
            config,
            router,
            Arc::clone(&ledger),
            Arc::new(FixedLoad { cpu: 99.0, ram: 0.0 }),
            Arc::clone(&mediator) as Arc<dyn Mediator>,
        );
        ledger.record(2, 100, true);

        inspector.tick();
        match &*mediator.observed.lock().unwrap() {
            Observed::Send { duplicate, .. } => assert!(duplicate),
            other => panic!("expected Send, got {other:?}"),
        };
    }

    #[test]
    fn whitelist_excluding_everyone_cancels_migration() {
        let mut config = base_config();
        config.migration_threshold = 0.0;
        config.server_whitelist = Some(vec![99]);
        let mediator = Arc::new(SpyMediator { observed: StdMutex::new(Observed::None) });
        let (inspector, ledger) = make_inspector(config, Arc::clone(&mediator));
        ledger.record(2, 100, true);

        inspector.tick();
        assert_eq!(*mediator.observed.lock().unwrap(), Observed::None);
    }

    #[test]
    fn cancel_waits_for_in_flight_tick() {
        let mediator = Arc::new(SpyMediator { observed: StdMutex::new(Observed::None) });
        let (inspector, _ledger) = make_inspector(base_config(), mediator);
        inspector.cancel();
        drop(inspector.timer.lock().unwrap());
    }
}
