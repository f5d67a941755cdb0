// Per-aircraft trajectory: fixed-size packed points, a quarter-rate
// dense snapshot, append gating and flight-leg detection.

use bytemuck::{Pod, Zeroable};

use crate::aircraft::{to_state_all, Aircraft, StateAll};
use crate::clock::MINUTES;
use crate::geodesy::{greatcircle, norm_diff};
use crate::modes::message::AirGround;

/// Hard cap on points held per aircraft.
pub const TRACE_SIZE: usize = 32_768;
/// Eviction granularity; a multiple of 4 so the quarter-rate snapshot
/// alignment survives.
pub const TRACE_EVICT: usize = 64;

// Packed altitude word layout. Bits 0..=20 carry altitude + 100000 ft.
const ALT_MASK: i32 = (1 << 21) - 1;
const ALT_OFFSET: i32 = 100_000;
pub const PF_STALE: i32 = 1 << 21;
pub const PF_ON_GROUND: i32 = 1 << 22;
pub const PF_ALT_UNKNOWN: i32 = 1 << 23;
pub const PF_TRACK_UNKNOWN: i32 = 1 << 24;
pub const PF_GS_UNKNOWN: i32 = 1 << 25;
pub const PF_LEG_MARKER: i32 = 1 << 26;
pub const PF_RATE_UNKNOWN: i32 = 1 << 27;
pub const PF_RATE_GEOM: i32 = 1 << 28;
pub const PF_ALT_GEOM: i32 = 1 << 29;

/// One trajectory sample. Fixed-size and Pod: this is also the on-disk
/// record format of the state files.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct StatePoint {
    /// milliseconds
    pub timestamp: u64,
    /// 1e-6 degrees
    pub lat: i32,
    pub lon: i32,
    /// packed altitude + flag word, see the PF_* bits
    pub altitude: i32,
    /// 0.1 kt units
    pub gs: u16,
    /// 0.1 degree units
    pub track: u16,
    /// 32 fpm units
    pub rate: i16,
    pub _pad: [u8; 6],
}

impl StatePoint {
    /// Altitude in feet; None when unknown.
    pub fn altitude_ft(&self) -> Option<i32> {
        if self.altitude & PF_ALT_UNKNOWN != 0 {
            None
        } else {
            Some((self.altitude & ALT_MASK) - ALT_OFFSET)
        }
    }

    pub fn set_altitude_ft(&mut self, alt: Option<i32>) {
        self.altitude &= !(ALT_MASK | PF_ALT_UNKNOWN);
        match alt {
            Some(ft) => self.altitude |= (ft + ALT_OFFSET).clamp(0, ALT_MASK) & ALT_MASK,
            None => self.altitude |= PF_ALT_UNKNOWN,
        }
    }

    pub fn on_ground(&self) -> bool {
        self.altitude & PF_ON_GROUND != 0
    }

    pub fn leg_marker(&self) -> bool {
        self.altitude & PF_LEG_MARKER != 0
    }

    pub fn set_leg_marker(&mut self, set: bool) {
        if set {
            self.altitude |= PF_LEG_MARKER;
        } else {
            self.altitude &= !PF_LEG_MARKER;
        }
    }

    pub fn flag(&self, bit: i32) -> bool {
        self.altitude & bit != 0
    }

    pub fn gs_kt(&self) -> Option<f64> {
        if self.flag(PF_GS_UNKNOWN) {
            None
        } else {
            Some(self.gs as f64 / 10.0)
        }
    }

    pub fn track_deg(&self) -> Option<f64> {
        if self.flag(PF_TRACK_UNKNOWN) {
            None
        } else {
            Some(self.track as f64 / 10.0)
        }
    }

    pub fn rate_fpm(&self) -> Option<i32> {
        if self.flag(PF_RATE_UNKNOWN) {
            None
        } else {
            Some(self.rate as i32 * 32)
        }
    }

    pub fn lat_deg(&self) -> f64 {
        self.lat as f64 / 1e6
    }

    pub fn lon_deg(&self) -> f64 {
        self.lon as f64 / 1e6
    }
}

/// Append-only trajectory plus writer bookkeeping. trace_all[i] pairs
/// with points[4*i].
#[derive(Debug, Default)]
pub struct Trace {
    pub points: Vec<StatePoint>,
    pub all: Vec<StateAll>,
    /// Set when there is something new for the trace writer.
    pub trace_write: bool,
    /// Writes since the last full write.
    pub full_write_counter: u32,
    /// Deadline for the next full write, jittered per aircraft.
    pub next_full_write: u64,
    /// Day (days since epoch) the history file was last written for.
    pub history_written_day: u64,
}

impl Trace {
    pub fn new() -> Self {
        Trace::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Gate for appending a new position sample.
    pub fn should_add(&self, a: &Aircraft, now: u64, interval_ms: u64) -> bool {
        let last = match self.points.last() {
            None => return true,
            Some(p) => p,
        };
        if now < last.timestamp {
            return false;
        }
        let elapsed = now - last.timestamp;
        if elapsed >= interval_ms {
            return true;
        }

        let on_ground = a.airground == AirGround::Ground && a.airground_valid.valid();
        if on_ground != last.on_ground() {
            return true;
        }

        // very close in time: only the ground-state change above counts
        if elapsed < 1000 {
            return false;
        }

        if a.track_valid.valid() {
            if let Some(t) = last.track_deg() {
                if norm_diff(a.track - t, 180.0).abs() > 2.0 {
                    return true;
                }
            }
        }

        if a.altitude_baro_valid.valid() {
            if let Some(alt) = last.altitude_ft() {
                if (a.altitude_baro - alt).abs() > 300 {
                    return true;
                }
            }
        }

        // unexpected jump relative to the sampled path
        let dist = greatcircle(last.lat_deg(), last.lon_deg(), a.lat, a.lon);
        let expected = (a.gs.max(100.0)) * 1852.0 / 3600.0 * (elapsed as f64 / 1000.0 + 1.0);
        if dist > expected.max(500.0) {
            return true;
        }

        false
    }

    /// Append the aircraft's current position. Caller has already run
    /// the gate. Evicts the oldest block when full.
    pub fn add(&mut self, a: &Aircraft, now: u64) {
        if self.points.len() >= TRACE_SIZE {
            self.points.drain(..TRACE_EVICT);
            self.all.drain(..TRACE_EVICT / 4);
        }

        let mut p = StatePoint {
            timestamp: now,
            lat: (a.lat * 1e6).round() as i32,
            lon: (a.lon * 1e6).round() as i32,
            ..Default::default()
        };

        let on_ground = a.airground == AirGround::Ground && a.airground_valid.valid();
        if on_ground {
            p.altitude |= PF_ON_GROUND;
        }

        let use_geom =
            !a.altitude_baro_valid.valid() && a.altitude_geom_valid.valid();
        if a.altitude_baro_valid.valid() {
            p.set_altitude_ft(Some(a.altitude_baro));
        } else if use_geom {
            p.set_altitude_ft(Some(a.altitude_geom));
            p.altitude |= PF_ALT_GEOM;
        } else {
            p.set_altitude_ft(None);
        }
        if a.altitude_baro_valid.stale && !use_geom {
            p.altitude |= PF_STALE;
        }

        if a.gs_valid.valid() {
            p.gs = (a.gs * 10.0).round().clamp(0.0, u16::MAX as f64) as u16;
        } else {
            p.altitude |= PF_GS_UNKNOWN;
        }

        if a.track_valid.valid() {
            p.track = (a.track * 10.0).round().rem_euclid(3600.0) as u16;
        } else {
            p.altitude |= PF_TRACK_UNKNOWN;
        }

        if a.geom_rate_valid.valid() {
            p.rate = (a.geom_rate as f64 / 32.0).round() as i16;
            p.altitude |= PF_RATE_GEOM;
        } else if a.baro_rate_valid.valid() {
            p.rate = (a.baro_rate as f64 / 32.0).round() as i16;
        } else {
            p.altitude |= PF_RATE_UNKNOWN;
        }

        self.points.push(p);
        if (self.points.len() - 1) % 4 == 0 {
            self.all.push(to_state_all(a, now));
        }

        self.trace_write = true;
    }

    /// The StateAll paired with point index i, if it is a quarter point.
    pub fn state_all_at(&self, i: usize) -> Option<&StateAll> {
        if i % 4 != 0 {
            return None;
        }
        self.all.get(i / 4)
    }

    /// Drop points older than the retention window.
    pub fn maintain(&mut self, now: u64, keep_ms: u64) {
        let cutoff = now.saturating_sub(keep_ms);
        let first_keep = self.points.iter().position(|p| p.timestamp >= cutoff);
        let drop = match first_keep {
            None if !self.points.is_empty() => self.points.len(),
            Some(n) => n,
            None => 0,
        };
        // round down so the quarter alignment holds
        let drop = drop - drop % 4;
        if drop > 0 {
            self.points.drain(..drop);
            self.all.drain(..drop / 4);
            self.trace_write = true;
        }
    }

    /// Scan the trajectory and mark the first point of each new flight
    /// leg. Existing markers are recomputed from scratch.
    pub fn mark_legs(&mut self) {
        if self.points.len() < 20 {
            return;
        }

        let mut sum: i64 = 0;
        for p in self.points.iter_mut() {
            p.set_leg_marker(false);
            if p.flag(PF_ALT_UNKNOWN) {
                continue;
            }
            let alt = if p.on_ground() { 0 } else { p.altitude_ft().unwrap_or(0) };
            sum += alt as i64;
        }

        let mut threshold = (sum / self.points.len() as i64 / 3) as i32;
        if threshold > 10_000 {
            threshold = 10_000;
        }

        let mut high = 0i32;
        let mut low = 100_000i32;

        let mut major_climb: u64 = 0;
        let mut major_descent: u64 = 0;
        let mut major_climb_index = 0usize;
        let mut major_descent_index = 0usize;
        let mut last_high: u64 = 0;
        let mut last_low: u64 = 0;
        let mut last_low_index = 0usize;
        let mut last_airborne: u64 = 0;
        let mut was_ground = false;

        for i in 1..self.points.len() {
            let p = self.points[i];
            let on_ground = p.on_ground();
            let alt_unknown = p.flag(PF_ALT_UNKNOWN);
            let altitude = if on_ground || alt_unknown { 0 } else { p.altitude_ft().unwrap_or(0) };

            if !on_ground {
                last_airborne = p.timestamp;
            }

            if altitude >= high {
                high = altitude;
            }
            if altitude <= low {
                low = altitude;
            }

            if (low - altitude).abs() < 800 {
                last_low = p.timestamp;
                last_low_index = i;
            }
            if (high - altitude).abs() < 800 {
                last_high = p.timestamp;
            }

            if high - low > threshold {
                if last_high > last_low {
                    let idx = (last_low_index + 3).min(self.points.len() - 1);
                    major_climb = self.points[idx].timestamp;
                    major_climb_index = idx;
                    low = high - threshold * 9 / 10;
                }
                if last_high < last_low {
                    let idx = i.saturating_sub(3);
                    major_descent = self.points[idx].timestamp;
                    major_descent_index = idx;
                    high = low + threshold * 9 / 10;
                }
            }

            let prev_ts = self.points[i - 1].timestamp;
            let leg_ground = major_descent != 0
                && (on_ground || was_ground)
                && (p.timestamp > prev_ts + 25 * MINUTES
                    || p.timestamp > last_airborne + 45 * MINUTES);

            let leg_airborne = major_climb != 0
                && major_descent != 0
                && major_climb >= major_descent + 10 * MINUTES;

            if leg_ground || leg_airborne {
                if leg_ground {
                    self.points[i].set_leg_marker(true);
                } else if major_descent_index + 1 == major_climb_index {
                    self.points[major_climb_index].set_leg_marker(true);
                } else {
                    let mut found = false;
                    // prefer the largest time gap between the descent
                    // and the climb
                    let mut j = major_climb_index;
                    while j > major_descent_index {
                        let gap = self.points[j].timestamp
                            .saturating_sub(self.points[j - 1].timestamp);
                        if gap > 5 * MINUTES {
                            self.points[j].set_leg_marker(true);
                            found = true;
                            break;
                        }
                        j -= 1;
                    }
                    if !found {
                        let half = major_descent + (major_climb - major_descent) / 2;
                        for j in major_descent_index + 1..major_climb_index {
                            if self.points[j].timestamp > half {
                                self.points[j].set_leg_marker(true);
                                break;
                            }
                        }
                    }
                }

                major_climb = 0;
                major_climb_index = 0;
                major_descent = 0;
                major_descent_index = 0;
            }

            was_ground = on_ground;
        }
    }
}
