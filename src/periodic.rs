// The periodic machinery: the 200 ms driver for output flushing,
// heartbeats and snapshot deadlines; four sharded stale sweepers; eight
// trace writers on a 25-second 64-part rotor; and the misc worker for
// state saving, heatmaps and the client snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::warn;

use crate::app::App;
use crate::clock::{now_ms, AntiSpam, Deadline, Watch, MINUTES, SECONDS};
use crate::net::{ascii, beast, sbs};
use crate::snapshot;
use crate::state;
use crate::store::partition;
use crate::tracker;
use crate::trace::Trace;
use crate::{heatmap, stats};

pub const PERIODIC_UPDATE: u64 = 200;
pub const STALE_WORKERS: usize = 4;
pub const TRACE_WORKERS: usize = 8;
/// Rotor granularity: each trace worker covers its shard once per 25 s.
pub const TRACE_PARTS: usize = 64;
/// Full traces rewrite at most this often, minus a per-aircraft jitter.
const FULL_TRACE_INTERVAL_S: u64 = 900;
/// Points kept in the fast-update recent trace.
const RECENT_POINTS: usize = 142;
/// State files are spread over 256 shards, one saved per misc cycle.
const STATE_SHARDS: usize = 256;

/// Spawn every periodic task. Handles are returned so a shutdown can
/// wait for them, although they all watch the exit flag themselves.
pub fn spawn_all(app: &Arc<App>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(tokio::spawn(driver(Arc::clone(app))));
    for worker in 0..STALE_WORKERS {
        handles.push(tokio::spawn(stale_sweeper(Arc::clone(app), worker)));
    }
    for worker in 0..TRACE_WORKERS {
        handles.push(tokio::spawn(trace_writer(Arc::clone(app), worker)));
    }
    handles.push(tokio::spawn(misc_worker(Arc::clone(app))));

    handles
}

/// The main driver: flush and heartbeat the writers, emit due
/// snapshots, roll stats, correlate Mode A/C.
async fn driver(app: Arc<App>) {
    let mut tick = interval(Duration::from_millis(PERIODIC_UPDATE));

    let now = now_ms();
    let mut json_due = Deadline::starting_at(now, app.config.json_interval.max(PERIODIC_UPDATE));
    let mut globe_due = Deadline::starting_at(now, app.config.json_interval.max(PERIODIC_UPDATE));
    let mut vrs_due = Deadline::starting_at(now, SECONDS);
    let mut stats_roll_due = Deadline::starting_at(now, stats::BUCKET_MS);
    let mut stats_write_due = Deadline::starting_at(now, app.config.stats_every.max(1) * SECONDS);
    let mut receiver_due = Deadline::new(60 * SECONDS);
    let mut modeac_due = Deadline::starting_at(now, SECONDS);
    let mut vrs_part = 0usize;

    loop {
        tick.tick().await;
        if app.exiting() {
            return;
        }
        let now = now_ms();
        let heartbeat = app.heartbeat_interval();

        let o = &app.outputs;
        o.beast_out.periodic(now, heartbeat, &beast::HEARTBEAT);
        o.beast_reduce_out.periodic(now, heartbeat, &beast::HEARTBEAT);
        o.raw_out.periodic(now, heartbeat, ascii::HEARTBEAT);
        o.sbs_out.periodic(now, heartbeat, sbs::HEARTBEAT);
        o.sbs_out_mlat.periodic(now, heartbeat, sbs::HEARTBEAT);
        o.sbs_out_jaero.periodic(now, heartbeat, sbs::HEARTBEAT);
        o.sbs_out_prio.periodic(now, heartbeat, sbs::HEARTBEAT);
        o.json_out.periodic(now, 0, &[]);
        o.vrs_out.periodic(now, 0, &[]);

        let out_bytes: u64 = [
            &o.beast_out,
            &o.beast_reduce_out,
            &o.raw_out,
            &o.sbs_out,
            &o.sbs_out_mlat,
            &o.sbs_out_jaero,
            &o.sbs_out_prio,
            &o.json_out,
            &o.vrs_out,
        ]
        .iter()
        .map(|w| w.bytes_out.swap(0, std::sync::atomic::Ordering::Relaxed))
        .sum();
        if out_bytes > 0 {
            app.stats.with_current(|s| s.bytes_out += out_bytes);
        }

        let vrs_tick = vrs_due.due(now);

        if let Some(dir) = &app.config.json_dir {
            let dir = PathBuf::from(dir);
            if json_due.due(now) {
                let doc = snapshot::generate_aircraft_json(&app, now);
                if let Err(e) = snapshot::write_json_atomic(&dir, "aircraft.json", &doc) {
                    warn!(error = %e, "aircraft.json write failed");
                }
            }
            if receiver_due.due(now) {
                let doc = snapshot::generate_receiver_json(&app, app.store.len());
                let _ = snapshot::write_json_atomic(&dir, "receiver.json", &doc);
            }
            if app.config.json_globe_index && globe_due.due(now) {
                emit_globe_tiles(&app, &dir, now);
            }
            if vrs_tick {
                let doc = snapshot::generate_vrs_json(&app, vrs_part, 16, now);
                let name = format!("vrs_{:02}.json", vrs_part);
                let _ = snapshot::write_json_atomic(&dir, &name, &doc);
            }
        }

        // VRS network output follows the same part rotation
        if vrs_tick {
            if app.outputs.vrs_out.connections() > 0 {
                let doc = snapshot::generate_vrs_json(&app, vrs_part, 16, now);
                let mut bytes = doc.to_string().into_bytes();
                bytes.push(b'\n');
                app.outputs
                    .vrs_out
                    .send_with(now, bytes.len(), |buf| buf.extend_from_slice(&bytes));
            }
            vrs_part = (vrs_part + 1) % 16;
        }

        if stats_roll_due.due(now) {
            app.stats.roll(now);
        }
        if stats_write_due.due(now) {
            if let Some(dir) = &app.config.json_dir {
                let _ = snapshot::write_json_atomic(
                    Path::new(dir),
                    "stats.json",
                    &app.stats.to_json(),
                );
            }
            if let Some(prom) = &app.config.prom_file {
                let with_pos = count_with_position(&app);
                let text = app.stats.to_prometheus(app.store.len(), with_pos);
                if let Some(parent) = Path::new(prom).parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let _ = std::fs::write(prom, text);
            }
        }

        if app.config.mode_ac && modeac_due.due(now) {
            tracker::match_modeac(&app, now);
        }
    }
}

fn count_with_position(app: &App) -> usize {
    let mut n = 0;
    app.store.for_each(|_, slot| {
        if slot.lock().unwrap().ac.position_valid.valid() {
            n += 1;
        }
    });
    n
}

fn emit_globe_tiles(app: &App, dir: &Path, now: u64) {
    for tile in app.tiles.active_tiles() {
        let name_base = format!("globe_{:04}", tile);
        if app.config.json_bin_craft > 0 {
            let bin = snapshot::generate_globe_bin(app, tile, now);
            let _ = snapshot::write_bytes_atomic(dir, &format!("{}.binCraft", name_base), &bin);
        } else {
            let doc = snapshot::generate_globe_json(app, tile, now);
            let _ = snapshot::write_json_atomic(dir, &format!("{}.json", name_base), &doc);
        }
    }
}

/// One stale sweeper: owns every address whose partition matches, runs
/// once a second, logs delayed sweeps rate-limited.
async fn stale_sweeper(app: Arc<App>, worker: usize) {
    let mut tick = interval(Duration::from_secs(1));
    let mut anti_spam = AntiSpam::new(30 * SECONDS);

    loop {
        tick.tick().await;
        if app.exiting() {
            return;
        }
        let now = now_ms();
        let watch = Watch::start();
        tracker::remove_stale_shard(&app, worker, STALE_WORKERS, now);
        let elapsed = watch.elapsed_ms();
        app.stats.with_current(|s| s.remove_stale_ms = s.remove_stale_ms.max(elapsed));
        tracker::log_slow_sweep(&mut anti_spam, elapsed, now);
    }
}

/// One trace writer: visits 1/64 of its shard per tick so the whole
/// shard is covered every 25 seconds.
async fn trace_writer(app: Arc<App>, worker: usize) {
    let mut tick = interval(Duration::from_millis(25 * 1000 / TRACE_PARTS as u64));
    let mut part = 0usize;
    // YYYY-MM-DD the history tree was last prepared for
    let mut last_day: Option<String> = None;

    loop {
        tick.tick().await;
        if app.exiting() {
            return;
        }
        if app.config.json_dir.is_none() && app.config.globe_history_dir.is_none() {
            continue;
        }
        let now = now_ms();

        for addr in app.store.addresses() {
            let p = partition(addr, TRACE_WORKERS * TRACE_PARTS);
            if p % TRACE_WORKERS != worker || p / TRACE_WORKERS != part {
                continue;
            }
            if let Some(slot) = app.store.get(addr) {
                write_traces(&app, addr, &slot, now, &mut last_day);
            }
        }

        part = (part + 1) % TRACE_PARTS;
    }
}

/// Serialize one aircraft's trace documents. The slot lock is held only
/// to mark legs and snap a shadow copy; compression and file I/O run on
/// the copy.
fn write_traces(
    app: &App,
    addr: u32,
    slot: &crate::store::SlotRef,
    now: u64,
    last_day: &mut Option<String>,
) {
    let (ac, shadow, write_full) = {
        let mut guard = slot.lock().unwrap();
        if !guard.trace.trace_write || guard.trace.is_empty() {
            return;
        }
        guard.trace.trace_write = false;
        guard.trace.mark_legs();

        let write_full =
            guard.trace.full_write_counter > 122 || now > guard.trace.next_full_write;
        if write_full {
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0..FULL_TRACE_INTERVAL_S / 16);
            guard.trace.next_full_write = now + (FULL_TRACE_INTERVAL_S - 60 - jitter) * SECONDS;
            guard.trace.full_write_counter = 0;
        } else {
            guard.trace.full_write_counter += 1;
        }

        let shadow = Trace {
            points: guard.trace.points.clone(),
            all: guard.trace.all.clone(),
            ..Default::default()
        };
        (guard.ac.clone(), shadow, write_full)
    };

    let hex = ac.hex();
    let bucket = format!("{:02x}", addr % 256);

    if let Some(dir) = &app.config.json_dir {
        let dir = Path::new(dir);
        let start = shadow.len().saturating_sub(RECENT_POINTS);
        let recent = snapshot::generate_trace_json(&ac, &shadow, start);
        let name = format!("traces/{}/trace_recent_{}.json", bucket, hex);
        let _ = snapshot::write_gzip_atomic(dir, &format!("{}.gz", name), recent.to_string().as_bytes(), 1);

        if write_full {
            let full = snapshot::generate_trace_json(&ac, &shadow, 0);
            let name = format!("traces/{}/trace_full_{}.json.gz", bucket, hex);
            let level = if ac.non_icao() { 3 } else { 7 };
            let _ = snapshot::write_gzip_atomic(dir, &name, full.to_string().as_bytes(), level);
        }
    }

    if write_full && !ac.non_icao() {
        if let Some(history_dir) = &app.config.globe_history_dir {
            write_history_trace(history_dir, &ac, &shadow, now, &bucket, &hex, last_day);
        }
    }
}

/// Write the after-midnight portion of the trace into the permanent
/// history tree, creating the day's directories on first use.
fn write_history_trace(
    history_dir: &str,
    ac: &crate::aircraft::Aircraft,
    shadow: &Trace,
    now: u64,
    bucket: &str,
    hex: &str,
    last_day: &mut Option<String>,
) {
    let dt = match Utc.timestamp_millis_opt(now as i64).single() {
        Some(dt) => dt,
        None => return,
    };
    let day = dt.format("%Y-%m-%d").to_string();
    let start_of_day = dt
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc().timestamp_millis() as u64)
        .unwrap_or(0);

    let start = match shadow.points.iter().position(|p| p.timestamp > start_of_day) {
        Some(i) => i,
        None => return,
    };

    let day_dir = Path::new(history_dir).join(&day);
    if last_day.as_deref() != Some(day.as_str()) {
        let _ = std::fs::create_dir_all(day_dir.join("traces"));
        *last_day = Some(day);
    }

    let doc = snapshot::generate_trace_json(ac, shadow, start);
    let name = format!("traces/{}/trace_full_{}.json.gz", bucket, hex);
    let _ = snapshot::write_gzip_atomic(&day_dir, &name, doc.to_string().as_bytes(), 9);
}

/// The misc worker: state shard saving, heatmap sampling, the clients
/// and receivers snapshot. One duty per cycle.
async fn misc_worker(app: Arc<App>) {
    let mut tick = interval(Duration::from_millis(250));
    let now = now_ms();
    let mut state_due = Deadline::starting_at(now, 60 * MINUTES / STATE_SHARDS as u64);
    let mut heatmap_due = Deadline::starting_at(now, app.config.heatmap.max(1) * SECONDS);
    let mut clients_due = Deadline::starting_at(now, 10 * SECONDS);
    let mut state_shard = 0usize;

    loop {
        tick.tick().await;
        if app.exiting() {
            return;
        }
        let now = now_ms();

        // one duty per cycle; none of this is time critical
        if app.config.heatmap > 0 && app.config.heatmap_dir.is_some() && heatmap_due.due(now) {
            let entries = heatmap::sample(&app, now);
            if let Some(dir) = &app.config.heatmap_dir {
                if let Err(e) = heatmap::append(Path::new(dir), now, &entries) {
                    warn!(error = %e, "heatmap write failed");
                }
            }
            continue;
        }

        if let Some(base) = state_base_dir(&app) {
            if state_due.due(now) {
                state::save_shard(&app, &base, state_shard, STATE_SHARDS, now);
                state_shard = (state_shard + 1) % STATE_SHARDS;
                continue;
            }
        }

        if clients_due.due(now) {
            if let Some(dir) = &app.config.json_dir {
                let doc = snapshot::generate_clients_json(&app, now);
                let _ = snapshot::write_json_atomic(Path::new(dir), "clients.json", &doc);
            }
        }
    }
}

/// Where aircraft state persists: an explicit state dir wins, otherwise
/// the history tree.
pub fn state_base_dir(app: &App) -> Option<PathBuf> {
    app.config
        .state_dir
        .as_ref()
        .or(app.config.globe_history_dir.as_ref())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::message::Source;

    #[test]
    fn test_state_base_dir_priority() {
        let mut cfg = crate::config::Config::for_tests();
        cfg.globe_history_dir = Some("/tmp/history".into());
        let app = App::new(cfg.clone());
        assert_eq!(state_base_dir(&app), Some(PathBuf::from("/tmp/history")));

        cfg.state_dir = Some("/tmp/state".into());
        let app = App::new(cfg);
        assert_eq!(state_base_dir(&app), Some(PathBuf::from("/tmp/state")));

        let app = App::for_tests();
        assert!(state_base_dir(&app).is_none());
    }

    #[test]
    fn test_write_traces_produces_files() {
        let dir = std::env::temp_dir().join(format!("adsbhub-traces-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let mut cfg = crate::config::Config::for_tests();
        cfg.json_dir = Some(dir.to_string_lossy().into_owned());
        let app = App::new(cfg);

        let now = 1_700_000_000_000;
        let addr = 0x4b1803;
        let mut a = crate::aircraft::Aircraft::new(addr, now);
        a.lat = 47.99;
        a.lon = 7.85;
        a.altitude_baro = 30_000;
        a.altitude_baro_valid.source = Source::Adsb;
        a.altitude_baro_valid.updated = now;
        let slot = app.store.insert(addr, a);
        {
            let mut guard = slot.lock().unwrap();
            let ac = guard.ac.clone();
            for i in 0..10u64 {
                guard.trace.add(&ac, now + i * 20_000);
            }
            // force the full write path
            guard.trace.next_full_write = 0;
        }

        let mut last_day = None;
        write_traces(&app, addr, &slot, now + 300_000, &mut last_day);

        assert!(dir.join("traces/03/trace_recent_4b1803.json.gz").exists());
        assert!(dir.join("traces/03/trace_full_4b1803.json.gz").exists());
        // flag cleared, deadline rescheduled
        let guard = slot.lock().unwrap();
        assert!(!guard.trace.trace_write);
        assert!(guard.trace.next_full_write > now);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_write_traces_skips_clean() {
        let app = App::for_tests();
        let now = 1_700_000_000_000;
        let addr = 0x123456;
        let slot = app.store.insert(addr, crate::aircraft::Aircraft::new(addr, now));
        let mut last_day = None;
        // no points, no trace_write flag: nothing happens
        write_traces(&app, addr, &slot, now, &mut last_day);
        assert!(!slot.lock().unwrap().trace.trace_write);
    }

    #[test]
    fn test_history_day_directory_created_once() {
        let dir = std::env::temp_dir().join(format!("adsbhub-hist-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let now: u64 = 1_700_000_000_000;
        let mut a = crate::aircraft::Aircraft::new(0x4b1803, now);
        a.lat = 47.99;
        a.lon = 7.85;
        let mut shadow = Trace::new();
        for i in 0..5u64 {
            shadow.add(&a, now + i * 30_000);
        }

        let mut last_day = None;
        write_history_trace(
            dir.to_str().unwrap(),
            &a,
            &shadow,
            now + 200_000,
            "03",
            "4b1803",
            &mut last_day,
        );
        assert!(last_day.is_some());

        let day = last_day.clone().unwrap();
        let written = dir.join(&day).join("traces/03/trace_full_4b1803.json.gz");
        assert!(written.exists(), "missing {:?}", written);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
