// The application context: every subsystem hangs off one App so tests
// can construct as many independent instances as they like.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::clock::now_ms;
use crate::config::Config;
use crate::globe::TileLists;
use crate::modes::modeac::ModeAcState;
use crate::net::{ClientStats, NetWriter};
use crate::stats::StatsHub;
use crate::store::AircraftStore;

/// All shared outbound writers.
pub struct Outputs {
    pub beast_out: NetWriter,
    pub beast_reduce_out: NetWriter,
    pub raw_out: NetWriter,
    pub sbs_out: NetWriter,
    pub sbs_out_mlat: NetWriter,
    pub sbs_out_jaero: NetWriter,
    pub sbs_out_prio: NetWriter,
    pub json_out: NetWriter,
    pub vrs_out: NetWriter,
}

impl Outputs {
    fn new(flush_size: usize, flush_interval: u64) -> Self {
        let w = |name| NetWriter::new(name, flush_size, flush_interval);
        Outputs {
            beast_out: w("beast-out"),
            beast_reduce_out: w("beast-reduce-out"),
            raw_out: w("raw-out"),
            sbs_out: w("sbs-out"),
            sbs_out_mlat: w("sbs-out-mlat"),
            sbs_out_jaero: w("sbs-out-jaero"),
            sbs_out_prio: w("sbs-out-prio"),
            json_out: w("json-out"),
            vrs_out: w("vrs-out"),
        }
    }
}

pub struct App {
    pub config: Config,
    pub store: AircraftStore,
    pub tiles: TileLists,
    pub stats: StatsHub,
    pub outputs: Outputs,
    pub modeac: Mutex<ModeAcState>,
    pub startup_time: u64,
    clients: Mutex<Vec<Weak<ClientStats>>>,
    exit: AtomicBool,
}

impl App {
    pub fn new(config: Config) -> Self {
        let now = now_ms();
        let outputs = Outputs::new(config.net_flush_size, config.net_flush_interval);
        App {
            store: AircraftStore::new(),
            tiles: TileLists::new(),
            stats: StatsHub::new(now),
            outputs,
            modeac: Mutex::new(ModeAcState::new()),
            startup_time: now,
            clients: Mutex::new(Vec::new()),
            exit: AtomicBool::new(false),
            config,
        }
    }

    /// Track a connection for clients.json; dead entries are pruned on
    /// each snapshot.
    pub fn register_client(&self, client: &Arc<ClientStats>) {
        self.clients.lock().unwrap().push(Arc::downgrade(client));
    }

    pub fn clients_snapshot(&self) -> Vec<Arc<ClientStats>> {
        let mut guard = self.clients.lock().unwrap();
        guard.retain(|w| w.strong_count() > 0);
        guard.iter().filter_map(|w| w.upgrade()).collect()
    }

    pub fn for_tests() -> Self {
        App::new(Config::for_tests())
    }

    pub fn receiver_position(&self) -> Option<(f64, f64)> {
        match (self.config.lat, self.config.lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    pub fn exiting(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    /// Reduced-rate Beast pacing interval in milliseconds.
    pub fn reduce_interval(&self) -> u64 {
        self.config.net_beast_reduce_interval
    }

    /// Heartbeat interval in milliseconds, 0 when disabled.
    pub fn heartbeat_interval(&self) -> u64 {
        self.config.net_heartbeat * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_contexts() {
        let a = App::for_tests();
        let b = App::for_tests();
        a.store.insert(0x123456, crate::aircraft::Aircraft::new(0x123456, 1));
        assert_eq!(a.store.len(), 1);
        assert_eq!(b.store.len(), 0);
    }

    #[test]
    fn test_exit_flag() {
        let app = App::for_tests();
        assert!(!app.exiting());
        app.request_exit();
        assert!(app.exiting());
    }

    #[test]
    fn test_receiver_position_needs_both() {
        let mut cfg = Config::for_tests();
        cfg.lat = Some(48.0);
        let app = App::new(cfg);
        assert!(app.receiver_position().is_none());
    }
}
