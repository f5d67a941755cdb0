// Network layer: services, per-connection framing, outbound writers and
// connectors.

pub mod ascii;
pub mod beast;
pub mod client;
pub mod connector;
pub mod listener;
pub mod sbs;
pub mod writer;

pub use writer::NetWriter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::modes::message::Source;

/// How inbound bytes of a service are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Discard inbound bytes; pure outputs.
    Ignore,
    /// Messages delimited by a byte sequence, typically newline.
    Ascii,
    /// 0x1A escape-framed binary.
    Beast,
    /// Short out-of-band control frames.
    BeastCommand,
}

/// A logical protocol endpoint: framing mode plus the source tag its
/// decode handler stamps on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    BeastIn,
    BeastOut,
    BeastReduceOut,
    RawIn,
    RawOut,
    SbsIn,
    SbsInMlat,
    SbsInJaero,
    SbsInPrio,
    SbsOut,
    JsonOut,
    VrsOut,
}

impl ServiceKind {
    pub fn descr(&self) -> &'static str {
        match self {
            ServiceKind::BeastIn => "beast-in",
            ServiceKind::BeastOut => "beast-out",
            ServiceKind::BeastReduceOut => "beast-reduce-out",
            ServiceKind::RawIn => "raw-in",
            ServiceKind::RawOut => "raw-out",
            ServiceKind::SbsIn => "sbs-in",
            ServiceKind::SbsInMlat => "sbs-in-mlat",
            ServiceKind::SbsInJaero => "sbs-in-jaero",
            ServiceKind::SbsInPrio => "sbs-in-prio",
            ServiceKind::SbsOut => "sbs-out",
            ServiceKind::JsonOut => "json-out",
            ServiceKind::VrsOut => "vrs-out",
        }
    }

    pub fn read_mode(&self) -> ReadMode {
        match self {
            ServiceKind::BeastIn => ReadMode::Beast,
            ServiceKind::RawIn
            | ServiceKind::SbsIn
            | ServiceKind::SbsInMlat
            | ServiceKind::SbsInJaero
            | ServiceKind::SbsInPrio => ReadMode::Ascii,
            _ => ReadMode::Ignore,
        }
    }

    /// Source override for SBS input variants.
    pub fn sbs_source(&self) -> Source {
        match self {
            ServiceKind::SbsInMlat => Source::Mlat,
            ServiceKind::SbsInJaero => Source::Jaero,
            ServiceKind::SbsInPrio => Source::Prio,
            _ => Source::Sbs,
        }
    }

    pub fn is_input(&self) -> bool {
        self.read_mode() != ReadMode::Ignore
    }
}

/// Per-connection accounting shared with messages in flight. Lives in an
/// Arc so the tracker can attribute positions after the connection is
/// gone.
#[derive(Debug)]
pub struct ClientStats {
    pub service: ServiceKind,
    pub host: String,
    pub port: u16,
    pub connected_since: u64,
    pub receiver_id: AtomicU64,
    pub messages: AtomicU64,
    pub positions: AtomicU64,
    pub bytes_received: AtomicU64,
    pub garbage_bytes: AtomicU64,
    pub uuid: Mutex<Option<String>>,
    /// Rough receiver location estimated from positions this connection
    /// contributed; reference for surface CPR.
    rough_pos: Mutex<Option<(f64, f64)>>,
}

impl ClientStats {
    pub fn new(service: ServiceKind, host: String, port: u16, now: u64) -> Self {
        ClientStats {
            service,
            host,
            port,
            connected_since: now,
            receiver_id: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            positions: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            garbage_bytes: AtomicU64::new(0),
            uuid: Mutex::new(None),
            rough_pos: Mutex::new(None),
        }
    }

    pub fn count_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold an accepted position into the rough receiver estimate.
    pub fn record_position(&self, lat: f64, lon: f64) {
        self.positions.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.rough_pos.lock().unwrap();
        *guard = match *guard {
            None => Some((lat, lon)),
            Some((rlat, rlon)) => Some((rlat + (lat - rlat) / 16.0, rlon + (lon - rlon) / 16.0)),
        };
    }

    pub fn rough_position(&self) -> Option<(f64, f64)> {
        *self.rough_pos.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_read_modes() {
        assert_eq!(ServiceKind::BeastIn.read_mode(), ReadMode::Beast);
        assert_eq!(ServiceKind::SbsIn.read_mode(), ReadMode::Ascii);
        assert_eq!(ServiceKind::BeastOut.read_mode(), ReadMode::Ignore);
        assert!(ServiceKind::RawIn.is_input());
        assert!(!ServiceKind::VrsOut.is_input());
    }

    #[test]
    fn test_sbs_source_tags() {
        assert_eq!(ServiceKind::SbsIn.sbs_source(), Source::Sbs);
        assert_eq!(ServiceKind::SbsInMlat.sbs_source(), Source::Mlat);
        assert_eq!(ServiceKind::SbsInJaero.sbs_source(), Source::Jaero);
        assert_eq!(ServiceKind::SbsInPrio.sbs_source(), Source::Prio);
    }

    #[test]
    fn test_rough_position_converges() {
        let c = ClientStats::new(ServiceKind::BeastIn, "peer".into(), 30005, 0);
        assert!(c.rough_position().is_none());
        c.record_position(48.0, 8.0);
        assert_eq!(c.rough_position(), Some((48.0, 8.0)));
        for _ in 0..200 {
            c.record_position(49.0, 9.0);
        }
        let (lat, lon) = c.rough_position().unwrap();
        assert!((lat - 49.0).abs() < 0.01);
        assert!((lon - 9.0).abs() < 0.01);
        assert_eq!(c.positions.load(Ordering::Relaxed), 201);
    }
}
