// Aircraft state persistence: one file per aircraft under
// internal_state/<bb>/<addr>, written on shutdown and read back on
// startup. The header carries an explicit version and the record sizes;
// any mismatch discards the file.

use std::io;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use rand::Rng;
use tracing::{info, warn};

use crate::aircraft::{from_state_all, to_state_all, Aircraft, StateAll};
use crate::app::App;
use crate::clock::SECONDS;
use crate::globe::{globe_index, TILE_NONE};
use crate::store::Slot;
use crate::trace::{StatePoint, Trace};

const STATE_MAGIC: [u8; 4] = *b"ADSH";
const STATE_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
struct StateFileHeader {
    magic: [u8; 4],
    version: u32,
    pos_size: u32,
    all_size: u32,
    point_size: u32,
    trace_len: u32,
    all_len: u32,
}

/// Position and lifetime fields not covered by StateAll.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
struct SavedPosition {
    seen: u64,
    seen_pos: u64,
    seen_pos_reliable: u64,
    seen_pos_global: u64,
    lat: f64,
    lon: f64,
    lat_reliable: f64,
    lon_reliable: f64,
    addr: u32,
    messages: u32,
    pos_reliable_odd: i32,
    pos_reliable_even: i32,
    alt_reliable: i32,
    _pad: [u8; 4],
}

fn state_path(base: &Path, addr: u32) -> PathBuf {
    base.join("internal_state")
        .join(format!("{:02x}", addr % 256))
        .join(format!("{:06x}", addr & 0xffffff))
}

/// Serialize one aircraft and its trace.
pub fn save_aircraft(base: &Path, a: &Aircraft, trace: &Trace, now: u64) -> io::Result<()> {
    let header = StateFileHeader {
        magic: STATE_MAGIC,
        version: STATE_VERSION,
        pos_size: std::mem::size_of::<SavedPosition>() as u32,
        all_size: std::mem::size_of::<StateAll>() as u32,
        point_size: std::mem::size_of::<StatePoint>() as u32,
        trace_len: trace.points.len() as u32,
        all_len: trace.all.len() as u32,
    };
    let pos = SavedPosition {
        seen: a.seen,
        seen_pos: a.seen_pos,
        seen_pos_reliable: a.seen_pos_reliable,
        seen_pos_global: a.seen_pos_global,
        lat: a.lat,
        lon: a.lon,
        lat_reliable: a.lat_reliable,
        lon_reliable: a.lon_reliable,
        addr: a.addr,
        messages: a.messages,
        pos_reliable_odd: a.pos_reliable_odd,
        pos_reliable_even: a.pos_reliable_even,
        alt_reliable: a.alt_reliable,
        _pad: [0; 4],
    };
    let all = to_state_all(a, now);

    let mut out = Vec::with_capacity(
        std::mem::size_of::<StateFileHeader>()
            + std::mem::size_of::<SavedPosition>()
            + std::mem::size_of::<StateAll>()
            + trace.points.len() * std::mem::size_of::<StatePoint>()
            + trace.all.len() * std::mem::size_of::<StateAll>(),
    );
    out.extend_from_slice(bytemuck::bytes_of(&header));
    out.extend_from_slice(bytemuck::bytes_of(&pos));
    out.extend_from_slice(bytemuck::bytes_of(&all));
    out.extend_from_slice(bytemuck::cast_slice(&trace.points));
    out.extend_from_slice(bytemuck::cast_slice(&trace.all));

    let path = state_path(base, a.addr);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, out)
}

fn read_unaligned_slice<T: Pod + Default + Copy>(bytes: &[u8], count: usize) -> Option<Vec<T>> {
    let size = std::mem::size_of::<T>();
    if bytes.len() < size * count {
        return None;
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(bytemuck::pod_read_unaligned(&bytes[i * size..(i + 1) * size]));
    }
    Some(out)
}

/// Deserialize one state file. None on any size or version mismatch.
fn load_file(bytes: &[u8], now: u64) -> Option<(u32, Slot)> {
    let header_size = std::mem::size_of::<StateFileHeader>();
    if bytes.len() < header_size {
        return None;
    }
    let header: StateFileHeader = bytemuck::pod_read_unaligned(&bytes[..header_size]);
    if header.magic != STATE_MAGIC
        || header.version != STATE_VERSION
        || header.pos_size != std::mem::size_of::<SavedPosition>() as u32
        || header.all_size != std::mem::size_of::<StateAll>() as u32
        || header.point_size != std::mem::size_of::<StatePoint>() as u32
    {
        return None;
    }

    let pos_size = header.pos_size as usize;
    let all_size = header.all_size as usize;
    let trace_len = header.trace_len as usize;
    let all_len = header.all_len as usize;

    let expected = header_size
        + pos_size
        + all_size
        + trace_len * header.point_size as usize
        + all_len * all_size;
    if bytes.len() != expected {
        return None;
    }
    // the quarter-rate pairing must survive the round trip
    if all_len != trace_len.div_ceil(4) {
        return None;
    }

    let mut off = header_size;
    let pos: SavedPosition = bytemuck::pod_read_unaligned(&bytes[off..off + pos_size]);
    off += pos_size;
    let all: StateAll = bytemuck::pod_read_unaligned(&bytes[off..off + all_size]);
    off += all_size;

    let points: Vec<StatePoint> = read_unaligned_slice(&bytes[off..], trace_len)?;
    off += trace_len * header.point_size as usize;
    let alls: Vec<StateAll> = read_unaligned_slice(&bytes[off..], all_len)?;

    let mut a = Aircraft::new(pos.addr, pos.seen);
    from_state_all(&all, &mut a, now);
    a.seen = pos.seen;
    a.seen_pos = pos.seen_pos;
    a.seen_pos_reliable = pos.seen_pos_reliable;
    a.seen_pos_global = pos.seen_pos_global;
    a.lat = pos.lat;
    a.lon = pos.lon;
    a.lat_reliable = pos.lat_reliable;
    a.lon_reliable = pos.lon_reliable;
    a.messages = pos.messages;
    a.pos_reliable_odd = pos.pos_reliable_odd;
    a.pos_reliable_even = pos.pos_reliable_even;
    a.alt_reliable = pos.alt_reliable;

    let trace = Trace { points, all: alls, ..Default::default() };

    Some((pos.addr, Slot { ac: a, trace }))
}

/// Write every persistable aircraft in one writer shard.
pub fn save_shard(app: &App, base: &Path, part: usize, parts: usize, now: u64) -> usize {
    let mut written = 0;
    for addr in app.store.addresses_part(part, parts) {
        let slot = match app.store.get(addr) {
            Some(s) => s,
            None => continue,
        };
        let guard = slot.lock().unwrap();
        let a = &guard.ac;
        if a.seen_pos == 0 || a.non_icao() || a.messages < 2 {
            continue;
        }
        match save_aircraft(base, a, &guard.trace, now) {
            Ok(()) => written += 1,
            Err(e) => warn!(addr = %a.hex(), error = %e, "state write failed"),
        }
    }
    written
}

/// Read the whole internal_state tree back into the registry. Each
/// loaded aircraft is scheduled for a full-trace rewrite within two
/// minutes, jittered to spread the I/O.
pub fn load_all(app: &App, base: &Path, now: u64) -> usize {
    let mut loaded = 0;
    let root = base.join("internal_state");
    let mut rng = rand::thread_rng();

    for bucket in 0..256 {
        let dir = root.join(format!("{:02x}", bucket));
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(_) => continue,
            };
            match load_file(&bytes, now) {
                Some((addr, mut slot)) => {
                    slot.trace.next_full_write = now + rng.gen_range(0..120) * SECONDS;
                    slot.trace.full_write_counter = 123;
                    slot.trace.trace_write = !slot.trace.is_empty();

                    if slot.ac.pos_reliable(app.config.json_reliable) {
                        slot.ac.globe_index = app.tiles.relink(
                            addr,
                            TILE_NONE,
                            globe_index(slot.ac.lat, slot.ac.lon),
                        );
                    }
                    app.store
                        .insert_slot(addr, std::sync::Arc::new(std::sync::Mutex::new(slot)));
                    loaded += 1;
                }
                None => {
                    warn!(path = %path.display(), "state file mismatch, discarding");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }

    if loaded > 0 {
        info!(loaded, "restored aircraft state");
    }
    loaded
}

/// Shutdown save across the writer pool layout (synchronous).
pub fn save_all(app: &App, base: &Path, now: u64) -> usize {
    let mut total = 0;
    for part in 0..8 {
        total += save_shard(app, base, part, 8, now);
    }
    info!(total, "saved aircraft state");
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::message::{AirGround, Source};

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("adsbhub-state-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn tracked_aircraft(addr: u32, now: u64, points: usize) -> (Aircraft, Trace) {
        let mut a = Aircraft::new(addr, now);
        a.lat = 47.99;
        a.lon = 7.85;
        a.lat_reliable = 47.99;
        a.lon_reliable = 7.85;
        a.seen_pos = now;
        a.seen_pos_reliable = now;
        a.messages = 500;
        a.pos_reliable_odd = 2;
        a.pos_reliable_even = 2;
        a.altitude_baro = 34_000;
        a.altitude_baro_valid.source = Source::Adsb;
        a.altitude_baro_valid.updated = now;
        a.position_valid.source = Source::Adsb;
        a.position_valid.last_source = Source::Adsb;
        a.position_valid.updated = now;
        a.airground = AirGround::Airborne;
        a.airground_valid.source = Source::Adsb;
        a.airground_valid.updated = now;

        let mut trace = Trace::new();
        for i in 0..points {
            a.lat = 47.99 + i as f64 * 0.001;
            trace.add(&a, now.saturating_sub(((points - i) as u64) * 20_000));
        }
        a.lat = 47.99;
        (a, trace)
    }

    #[test]
    fn test_warm_restart_roundtrip() {
        let dir = test_dir("roundtrip");
        let now = 1_700_000_000_000;
        let (a, trace) = tracked_aircraft(0x4b1803, now, 500);
        save_aircraft(&dir, &a, &trace, now).unwrap();

        // a fresh context, as after a restart
        let app = App::for_tests();
        let loaded = load_all(&app, &dir, now + 10_000);
        assert_eq!(loaded, 1);
        assert_eq!(app.store.len(), 1);

        let slot = app.store.get(0x4b1803).unwrap();
        let guard = slot.lock().unwrap();
        assert_eq!(guard.trace.len(), 500);
        assert_eq!(guard.ac.messages, 500);
        assert_eq!(guard.ac.pos_reliable_odd, 2);
        assert!((guard.ac.lat - 47.99).abs() < 1e-9);
        // full rewrite scheduled within two minutes
        assert!(guard.trace.trace_write);
        assert!(guard.trace.next_full_write <= now + 10_000 + 120 * SECONDS);
        // reliable position is back in a tile
        assert!(app.tiles.contains(guard.ac.globe_index, 0x4b1803));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_version_mismatch_discards() {
        let dir = test_dir("mismatch");
        let now = 1_700_000_000_000;
        let (a, trace) = tracked_aircraft(0xabcdef, now, 20);
        save_aircraft(&dir, &a, &trace, now).unwrap();

        // corrupt the version field
        let path = state_path(&dir, 0xabcdef);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4] = 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let app = App::for_tests();
        assert_eq!(load_all(&app, &dir, now), 0);
        assert!(!path.exists(), "mismatched file must be unlinked");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_truncated_file_discards() {
        let dir = test_dir("truncated");
        let now = 1_700_000_000_000;
        let (a, trace) = tracked_aircraft(0x111111, now, 40);
        save_aircraft(&dir, &a, &trace, now).unwrap();

        let path = state_path(&dir, 0x111111);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();

        let app = App::for_tests();
        assert_eq!(load_all(&app, &dir, now), 0);
        assert_eq!(app.store.len(), 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_save_all_skips_nonpersistable() {
        let dir = test_dir("skips");
        let now = 1_700_000_000_000;
        let app = App::for_tests();

        // no position: skipped
        let mut a = Aircraft::new(0x222222, now);
        a.messages = 10;
        app.store.insert(a.addr, a);

        // non-ICAO: skipped
        let (mut b, _) = tracked_aircraft(0x333333, now, 5);
        b.addr |= crate::aircraft::NON_ICAO_ADDRESS;
        app.store.insert(b.addr, b);

        // persistable
        let (c, trace_c) = tracked_aircraft(0x444444, now, 5);
        let slot = app.store.insert(c.addr, c);
        slot.lock().unwrap().trace = trace_c;

        assert_eq!(save_all(&app, &dir, now), 1);
        assert!(state_path(&dir, 0x444444).exists());
        assert!(!state_path(&dir, 0x222222).exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
