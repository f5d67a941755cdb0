// Rolling statistics: ten-second buckets in a ring of 90 (15 minutes),
// merged into 1/5/15-minute and all-time aggregates on each roll-over.

use std::sync::Mutex;

use serde_json::{json, Value};

pub const STAT_BUCKETS: usize = 90;
pub const BUCKET_MS: u64 = 10_000;
pub const RANGE_BUCKET_COUNT: usize = 76;
const NUM_ADDRTYPES: usize = 16;

/// One bucket of pure counters and reducible gauges.
#[derive(Debug, Clone)]
pub struct Stats {
    pub start: u64,
    pub end: u64,

    // local (directly attached receiver) message flow
    pub local_received_modes: u64,
    pub local_received_modeac: u64,
    pub local_accepted: u64,
    pub local_rejected_bad: u64,
    pub local_rejected_unknown_icao: u64,

    // network peers
    pub remote_received_modes: u64,
    pub remote_received_modeac: u64,
    pub remote_accepted: u64,
    pub remote_rejected_bad: u64,
    pub remote_rejected_unknown_icao: u64,
    pub remote_malformed_beast: u64,
    pub remote_received_basestation_valid: u64,
    pub remote_received_basestation_invalid: u64,

    // CPR outcomes
    pub cpr_surface: u64,
    pub cpr_airborne: u64,
    pub cpr_global_ok: u64,
    pub cpr_global_bad: u64,
    pub cpr_global_skipped: u64,
    pub cpr_global_range_checks: u64,
    pub cpr_global_speed_checks: u64,
    pub cpr_local_ok: u64,
    pub cpr_local_skipped: u64,
    pub cpr_local_range_checks: u64,
    pub cpr_local_speed_checks: u64,
    pub cpr_local_aircraft_relative: u64,
    pub cpr_local_receiver_relative: u64,

    // positions
    pub pos_all: u64,
    pub pos_duplicate: u64,
    pub pos_garbage: u64,
    pub pos_by_type: [u64; NUM_ADDRTYPES],

    pub messages_total: u64,
    pub single_message_aircraft: u64,
    pub unique_aircraft: u64,

    pub bytes_in: u64,
    pub bytes_out: u64,

    // signal gauges
    pub signal_power_sum: f64,
    pub signal_power_count: u64,
    pub peak_signal_power: f64,
    pub strong_signal_count: u64,

    // receiver range gauges, meters
    pub distance_max: f64,
    pub distance_min: f64,
    pub range_histogram: [u64; RANGE_BUCKET_COUNT],

    // maintenance timing, milliseconds
    pub remove_stale_ms: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Stats {
            start: 0,
            end: 0,
            local_received_modes: 0,
            local_received_modeac: 0,
            local_accepted: 0,
            local_rejected_bad: 0,
            local_rejected_unknown_icao: 0,
            remote_received_modes: 0,
            remote_received_modeac: 0,
            remote_accepted: 0,
            remote_rejected_bad: 0,
            remote_rejected_unknown_icao: 0,
            remote_malformed_beast: 0,
            remote_received_basestation_valid: 0,
            remote_received_basestation_invalid: 0,
            cpr_surface: 0,
            cpr_airborne: 0,
            cpr_global_ok: 0,
            cpr_global_bad: 0,
            cpr_global_skipped: 0,
            cpr_global_range_checks: 0,
            cpr_global_speed_checks: 0,
            cpr_local_ok: 0,
            cpr_local_skipped: 0,
            cpr_local_range_checks: 0,
            cpr_local_speed_checks: 0,
            cpr_local_aircraft_relative: 0,
            cpr_local_receiver_relative: 0,
            pos_all: 0,
            pos_duplicate: 0,
            pos_garbage: 0,
            pos_by_type: [0; NUM_ADDRTYPES],
            messages_total: 0,
            single_message_aircraft: 0,
            unique_aircraft: 0,
            bytes_in: 0,
            bytes_out: 0,
            signal_power_sum: 0.0,
            signal_power_count: 0,
            peak_signal_power: 0.0,
            strong_signal_count: 0,
            distance_max: 0.0,
            distance_min: f64::MAX,
            range_histogram: [0; RANGE_BUCKET_COUNT],
            remove_stale_ms: 0,
        }
    }
}

impl Stats {
    /// Merge `other` into self: counters add, gauges reduce.
    pub fn add(&mut self, other: &Stats) {
        if self.start == 0 || (other.start != 0 && other.start < self.start) {
            self.start = other.start;
        }
        self.end = self.end.max(other.end);

        self.local_received_modes += other.local_received_modes;
        self.local_received_modeac += other.local_received_modeac;
        self.local_accepted += other.local_accepted;
        self.local_rejected_bad += other.local_rejected_bad;
        self.local_rejected_unknown_icao += other.local_rejected_unknown_icao;
        self.remote_received_modes += other.remote_received_modes;
        self.remote_received_modeac += other.remote_received_modeac;
        self.remote_accepted += other.remote_accepted;
        self.remote_rejected_bad += other.remote_rejected_bad;
        self.remote_rejected_unknown_icao += other.remote_rejected_unknown_icao;
        self.remote_malformed_beast += other.remote_malformed_beast;
        self.remote_received_basestation_valid += other.remote_received_basestation_valid;
        self.remote_received_basestation_invalid += other.remote_received_basestation_invalid;
        self.cpr_surface += other.cpr_surface;
        self.cpr_airborne += other.cpr_airborne;
        self.cpr_global_ok += other.cpr_global_ok;
        self.cpr_global_bad += other.cpr_global_bad;
        self.cpr_global_skipped += other.cpr_global_skipped;
        self.cpr_global_range_checks += other.cpr_global_range_checks;
        self.cpr_global_speed_checks += other.cpr_global_speed_checks;
        self.cpr_local_ok += other.cpr_local_ok;
        self.cpr_local_skipped += other.cpr_local_skipped;
        self.cpr_local_range_checks += other.cpr_local_range_checks;
        self.cpr_local_speed_checks += other.cpr_local_speed_checks;
        self.cpr_local_aircraft_relative += other.cpr_local_aircraft_relative;
        self.cpr_local_receiver_relative += other.cpr_local_receiver_relative;
        self.pos_all += other.pos_all;
        self.pos_duplicate += other.pos_duplicate;
        self.pos_garbage += other.pos_garbage;
        for i in 0..NUM_ADDRTYPES {
            self.pos_by_type[i] += other.pos_by_type[i];
        }
        self.messages_total += other.messages_total;
        self.single_message_aircraft += other.single_message_aircraft;
        self.unique_aircraft += other.unique_aircraft;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.signal_power_sum += other.signal_power_sum;
        self.signal_power_count += other.signal_power_count;
        self.peak_signal_power = self.peak_signal_power.max(other.peak_signal_power);
        self.strong_signal_count += other.strong_signal_count;
        self.distance_max = self.distance_max.max(other.distance_max);
        self.distance_min = self.distance_min.min(other.distance_min);
        for i in 0..RANGE_BUCKET_COUNT {
            self.range_histogram[i] += other.range_histogram[i];
        }
        self.remove_stale_ms = self.remove_stale_ms.max(other.remove_stale_ms);
    }

    pub fn record_signal(&mut self, level: f64) {
        self.signal_power_sum += level;
        self.signal_power_count += 1;
        if level > self.peak_signal_power {
            self.peak_signal_power = level;
        }
        // above -3 dBFS
        if level > 0.50119 {
            self.strong_signal_count += 1;
        }
    }

    pub fn record_range(&mut self, range_m: f64, max_range_m: f64, histogram: bool) {
        if max_range_m <= 0.0 || range_m <= max_range_m {
            if range_m > self.distance_max {
                self.distance_max = range_m;
            }
            if range_m < self.distance_min {
                self.distance_min = range_m;
            }
        }
        if histogram && max_range_m > 0.0 {
            let bucket = ((range_m / max_range_m * RANGE_BUCKET_COUNT as f64).round() as usize)
                .min(RANGE_BUCKET_COUNT - 1);
            self.range_histogram[bucket] += 1;
        }
    }

    fn to_json(&self) -> Value {
        let mean_signal_db = if self.signal_power_count > 0 && self.signal_power_sum > 0.0 {
            Some(10.0 * (self.signal_power_sum / self.signal_power_count as f64).log10())
        } else {
            None
        };
        let peak_signal_db = if self.peak_signal_power > 0.0 {
            Some(10.0 * self.peak_signal_power.log10())
        } else {
            None
        };

        json!({
            "start": self.start as f64 / 1000.0,
            "end": self.end as f64 / 1000.0,
            "local": {
                "modes": self.local_received_modes,
                "modeac": self.local_received_modeac,
                "accepted": self.local_accepted,
                "bad": self.local_rejected_bad,
                "unknown_icao": self.local_rejected_unknown_icao,
                "signal": mean_signal_db,
                "peak_signal": peak_signal_db,
                "strong_signals": self.strong_signal_count,
            },
            "remote": {
                "modes": self.remote_received_modes,
                "modeac": self.remote_received_modeac,
                "accepted": self.remote_accepted,
                "bad": self.remote_rejected_bad,
                "unknown_icao": self.remote_rejected_unknown_icao,
                "malformed": self.remote_malformed_beast,
                "basestation_valid": self.remote_received_basestation_valid,
                "basestation_invalid": self.remote_received_basestation_invalid,
            },
            "cpr": {
                "surface": self.cpr_surface,
                "airborne": self.cpr_airborne,
                "global_ok": self.cpr_global_ok,
                "global_bad": self.cpr_global_bad,
                "global_skipped": self.cpr_global_skipped,
                "global_range": self.cpr_global_range_checks,
                "global_speed": self.cpr_global_speed_checks,
                "local_ok": self.cpr_local_ok,
                "local_skipped": self.cpr_local_skipped,
                "local_range": self.cpr_local_range_checks,
                "local_speed": self.cpr_local_speed_checks,
                "local_aircraft_relative": self.cpr_local_aircraft_relative,
                "local_receiver_relative": self.cpr_local_receiver_relative,
            },
            "position": {
                "all": self.pos_all,
                "duplicate": self.pos_duplicate,
                "garbage": self.pos_garbage,
                "by_type": self.pos_by_type.to_vec(),
            },
            "messages": self.messages_total,
            "single_message_aircraft": self.single_message_aircraft,
            "bytes": { "in": self.bytes_in, "out": self.bytes_out },
            "max_distance": if self.distance_max > 0.0 { Some(self.distance_max) } else { None },
            "min_distance": if self.distance_min < f64::MAX { Some(self.distance_min) } else { None },
            "remove_stale_ms": self.remove_stale_ms,
        })
    }
}

/// The ring of buckets plus derived aggregates. The hot path increments
/// `current`; the periodic task rolls it over every ten seconds.
pub struct StatsHub {
    inner: Mutex<StatsInner>,
}

struct StatsInner {
    current: Stats,
    ring: Vec<Stats>,
    bucket: usize,
    filled: usize,
    alltime: Stats,
    latest_1min: Stats,
    latest_5min: Stats,
    latest_15min: Stats,
}

impl StatsHub {
    pub fn new(now: u64) -> Self {
        let mut current = Stats::default();
        current.start = now;
        StatsHub {
            inner: Mutex::new(StatsInner {
                current,
                ring: vec![Stats::default(); STAT_BUCKETS],
                bucket: 0,
                filled: 0,
                alltime: Stats { start: now, ..Default::default() },
                latest_1min: Stats::default(),
                latest_5min: Stats::default(),
                latest_15min: Stats::default(),
            }),
        }
    }

    /// Mutate the current bucket.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut Stats) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.current)
    }

    /// Close the current bucket and recompute the aggregates.
    pub fn roll(&self, now: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.current.end = now;

        let current = std::mem::take(&mut inner.current);
        inner.current = Stats { start: now, ..Default::default() };

        inner.alltime.add(&current);
        let bucket = inner.bucket;
        inner.ring[bucket] = current;
        inner.bucket = (bucket + 1) % STAT_BUCKETS;
        inner.filled = (inner.filled + 1).min(STAT_BUCKETS);

        let agg_1min = inner.aggregate(6);
        let agg_5min = inner.aggregate(30);
        let agg_15min = inner.aggregate(STAT_BUCKETS);
        inner.latest_1min = agg_1min;
        inner.latest_5min = agg_5min;
        inner.latest_15min = agg_15min;
    }

    pub fn alltime(&self) -> Stats {
        self.inner.lock().unwrap().alltime.clone()
    }

    pub fn last_1min(&self) -> Stats {
        self.inner.lock().unwrap().latest_1min.clone()
    }

    /// stats.json document.
    pub fn to_json(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        json!({
            "latest": inner.current.to_json(),
            "last1min": inner.latest_1min.to_json(),
            "last5min": inner.latest_5min.to_json(),
            "last15min": inner.latest_15min.to_json(),
            "total": inner.alltime.to_json(),
        })
    }

    /// Prometheus text exposition of the all-time counters plus the
    /// 1-minute gauges.
    pub fn to_prometheus(&self, aircraft_count: usize, with_pos: usize) -> String {
        let inner = self.inner.lock().unwrap();
        let t = &inner.alltime;
        let m = &inner.latest_1min;
        let mut out = String::with_capacity(2048);

        let mut counter = |name: &str, v: u64| {
            out.push_str("# TYPE ");
            out.push_str(name);
            out.push_str(" counter\n");
            out.push_str(name);
            out.push(' ');
            out.push_str(&v.to_string());
            out.push('\n');
        };
        counter("adsbhub_messages_total", t.messages_total);
        counter("adsbhub_positions_total", t.pos_all);
        counter("adsbhub_positions_duplicate_total", t.pos_duplicate);
        counter("adsbhub_cpr_global_ok_total", t.cpr_global_ok);
        counter("adsbhub_cpr_global_bad_total", t.cpr_global_bad);
        counter("adsbhub_cpr_local_ok_total", t.cpr_local_ok);
        counter("adsbhub_remote_accepted_total", t.remote_accepted);
        counter("adsbhub_remote_rejected_total", t.remote_rejected_bad + t.remote_rejected_unknown_icao);
        counter("adsbhub_malformed_bytes_total", t.remote_malformed_beast);
        counter("adsbhub_bytes_in_total", t.bytes_in);
        counter("adsbhub_bytes_out_total", t.bytes_out);

        out.push_str("# TYPE adsbhub_aircraft_tracked gauge\n");
        out.push_str(&format!("adsbhub_aircraft_tracked {}\n", aircraft_count));
        out.push_str("# TYPE adsbhub_aircraft_with_position gauge\n");
        out.push_str(&format!("adsbhub_aircraft_with_position {}\n", with_pos));
        if m.distance_max > 0.0 {
            out.push_str("# TYPE adsbhub_max_range_meters gauge\n");
            out.push_str(&format!("adsbhub_max_range_meters {:.0}\n", m.distance_max));
        }

        out
    }
}

impl StatsInner {
    /// Sum of the most recent `n` closed buckets.
    fn aggregate(&self, n: usize) -> Stats {
        let mut out = Stats::default();
        let n = n.min(self.filled);
        for k in 0..n {
            let idx = (self.bucket + STAT_BUCKETS - 1 - k) % STAT_BUCKETS;
            out.add(&self.ring[idx]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_counters_and_gauges() {
        let mut a = Stats::default();
        let mut b = Stats::default();
        a.pos_all = 5;
        a.distance_max = 100.0;
        a.distance_min = 10.0;
        b.pos_all = 3;
        b.distance_max = 200.0;
        b.distance_min = 5.0;
        a.add(&b);
        assert_eq!(a.pos_all, 8);
        assert_eq!(a.distance_max, 200.0);
        assert_eq!(a.distance_min, 5.0);
    }

    #[test]
    fn test_roll_and_aggregates() {
        let hub = StatsHub::new(0);
        for i in 0..10u64 {
            hub.with_current(|s| s.pos_all += 1);
            hub.roll((i + 1) * BUCKET_MS);
        }
        // 1 minute = 6 buckets
        assert_eq!(hub.last_1min().pos_all, 6);
        assert_eq!(hub.alltime().pos_all, 10);
    }

    #[test]
    fn test_ring_wraps() {
        let hub = StatsHub::new(0);
        for i in 0..(STAT_BUCKETS as u64 + 20) {
            hub.with_current(|s| s.messages_total += 2);
            hub.roll((i + 1) * BUCKET_MS);
        }
        let inner = hub.inner.lock().unwrap();
        assert_eq!(inner.latest_15min.messages_total, 2 * STAT_BUCKETS as u64);
        assert_eq!(inner.alltime.messages_total, 2 * (STAT_BUCKETS as u64 + 20));
    }

    #[test]
    fn test_record_range_histogram() {
        let mut s = Stats::default();
        s.record_range(50_000.0, 100_000.0, true);
        s.record_range(99_000.0, 100_000.0, true);
        s.record_range(150_000.0, 100_000.0, true); // beyond max: histogram clamps, gauges skip
        assert_eq!(s.range_histogram.iter().sum::<u64>(), 3);
        assert_eq!(s.distance_max, 99_000.0);
    }

    #[test]
    fn test_signal_gauges() {
        let mut s = Stats::default();
        s.record_signal(0.25);
        s.record_signal(0.6);
        assert_eq!(s.signal_power_count, 2);
        assert_eq!(s.strong_signal_count, 1);
        assert_eq!(s.peak_signal_power, 0.6);
    }

    #[test]
    fn test_json_shape() {
        let hub = StatsHub::new(1000);
        hub.with_current(|s| {
            s.pos_all = 7;
            s.end = 2000;
        });
        let v = hub.to_json();
        assert_eq!(v["latest"]["position"]["all"], 7);
        assert!(v["total"].is_object());
    }

    #[test]
    fn test_prometheus_output() {
        let hub = StatsHub::new(0);
        hub.with_current(|s| s.messages_total = 41);
        hub.roll(BUCKET_MS);
        let text = hub.to_prometheus(12, 9);
        assert!(text.contains("adsbhub_messages_total 41"));
        assert!(text.contains("adsbhub_aircraft_tracked 12"));
        assert!(text.contains("# TYPE adsbhub_aircraft_with_position gauge"));
    }
}
