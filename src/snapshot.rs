// Snapshot emitters: aircraft.json, per-tile documents (JSON and packed
// binary), trace documents, receiver/clients JSON and the VRS array.
// Every file write goes to a temporary path and renames into place.

use std::fs;
use std::io;
use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::Ordering;

use bytemuck::{Pod, Zeroable};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Map, Value};

use crate::aircraft::{from_state_all, Aircraft, StateAll, TRACK_EXPIRE};
use crate::app::App;
use crate::clock::SECONDS;
use crate::globe::tile_bbox;
use crate::modes::message::{AirGround, Message, NavAltSource, SilType, Source, RC_UNKNOWN};
use crate::modes::message::{
    NAV_MODE_ALT_HOLD, NAV_MODE_APPROACH, NAV_MODE_AUTOPILOT, NAV_MODE_LNAV, NAV_MODE_TCAS,
    NAV_MODE_VNAV,
};
use crate::trace::{Trace, PF_ALT_GEOM, PF_RATE_GEOM, PF_STALE};

fn nav_modes_array(modes: u8) -> Value {
    let mut out = Vec::new();
    if modes & NAV_MODE_AUTOPILOT != 0 {
        out.push("autopilot");
    }
    if modes & NAV_MODE_VNAV != 0 {
        out.push("vnav");
    }
    if modes & NAV_MODE_ALT_HOLD != 0 {
        out.push("althold");
    }
    if modes & NAV_MODE_APPROACH != 0 {
        out.push("approach");
    }
    if modes & NAV_MODE_LNAV != 0 {
        out.push("lnav");
    }
    if modes & NAV_MODE_TCAS != 0 {
        out.push("tcas");
    }
    json!(out)
}

fn sil_type_str(t: Option<SilType>) -> &'static str {
    match t {
        None => "unknown",
        Some(SilType::Unknown) => "unknown",
        Some(SilType::PerSample) => "persample",
        Some(SilType::PerHour) => "perhour",
    }
}

/// One aircraft as a JSON object, the field set the map client expects.
/// Fields appear only while their validity holds.
pub fn aircraft_object(a: &Aircraft, now: u64) -> Value {
    let mut o = Map::new();
    o.insert("hex".into(), json!(a.hex()));
    o.insert("type".into(), json!(a.addr_type.as_str()));

    if let Some(r) = &a.registration {
        o.insert("r".into(), json!(r));
    }
    if let Some(t) = &a.type_code {
        o.insert("t".into(), json!(t));
    }
    if let Some(d) = &a.type_long {
        o.insert("desc".into(), json!(d));
    }
    if a.db_flags != 0 {
        o.insert("dbFlags".into(), json!(a.db_flags));
    }

    if a.callsign_valid.valid() {
        o.insert("flight".into(), json!(a.callsign));
    }
    if a.altitude_baro_valid.valid() {
        if a.airground == AirGround::Ground {
            o.insert("alt_baro".into(), json!("ground"));
        } else {
            o.insert("alt_baro".into(), json!(a.altitude_baro));
        }
    }
    if a.altitude_geom_valid.valid() {
        o.insert("alt_geom".into(), json!(a.altitude_geom));
    }
    if a.gs_valid.valid() {
        o.insert("gs".into(), json!((a.gs * 10.0).round() / 10.0));
    }
    if a.ias_valid.valid() {
        o.insert("ias".into(), json!(a.ias));
    }
    if a.tas_valid.valid() {
        o.insert("tas".into(), json!(a.tas));
    }
    if a.mach_valid.valid() {
        o.insert("mach".into(), json!((a.mach * 1000.0).round() / 1000.0));
    }
    if a.track_valid.valid() {
        o.insert("track".into(), json!((a.track * 10.0).round() / 10.0));
    }
    if a.track_rate_valid.valid() {
        o.insert("track_rate".into(), json!((a.track_rate * 100.0).round() / 100.0));
    }
    if a.roll_valid.valid() {
        o.insert("roll".into(), json!((a.roll * 100.0).round() / 100.0));
    }
    if a.mag_heading_valid.valid() {
        o.insert("mag_heading".into(), json!((a.mag_heading * 10.0).round() / 10.0));
    }
    if a.true_heading_valid.valid() {
        o.insert("true_heading".into(), json!((a.true_heading * 10.0).round() / 10.0));
    }
    if a.baro_rate_valid.valid() {
        o.insert("baro_rate".into(), json!(a.baro_rate));
    }
    if a.geom_rate_valid.valid() {
        o.insert("geom_rate".into(), json!(a.geom_rate));
    }
    if a.squawk_valid.valid() {
        o.insert("squawk".into(), json!(format!("{:04x}", a.squawk)));
    }
    if a.emergency_valid.valid() {
        o.insert("emergency".into(), json!(a.emergency.as_str()));
    }
    if a.category != 0 {
        o.insert("category".into(), json!(format!("{:02X}", a.category)));
    }
    if a.nav_qnh_valid.valid() {
        o.insert("nav_qnh".into(), json!((a.nav_qnh * 10.0).round() / 10.0));
    }
    if a.nav_altitude_mcp_valid.valid() {
        o.insert("nav_altitude_mcp".into(), json!(a.nav_altitude_mcp));
    }
    if a.nav_altitude_fms_valid.valid() {
        o.insert("nav_altitude_fms".into(), json!(a.nav_altitude_fms));
    }
    if a.nav_altitude_src_valid.valid() {
        let s = match a.nav_altitude_src {
            NavAltSource::Unknown => "unknown",
            NavAltSource::Aircraft => "aircraft",
            NavAltSource::Mcp => "mcp",
            NavAltSource::Fms => "fms",
        };
        o.insert("nav_altitude_src".into(), json!(s));
    }
    if a.nav_heading_valid.valid() {
        o.insert("nav_heading".into(), json!((a.nav_heading * 10.0).round() / 10.0));
    }
    if a.nav_modes_valid.valid() {
        o.insert("nav_modes".into(), nav_modes_array(a.nav_modes));
    }

    if a.position_valid.valid() {
        o.insert("lat".into(), json!((a.lat * 1e6).round() / 1e6));
        o.insert("lon".into(), json!((a.lon * 1e6).round() / 1e6));
        o.insert("nic".into(), json!(a.pos_nic));
        if a.pos_rc != RC_UNKNOWN {
            o.insert("rc".into(), json!(a.pos_rc));
        }
        o.insert("seen_pos".into(), json!(a.position_valid.age(now) as f64 / 1000.0));
    }

    if a.adsb_version >= 0 {
        o.insert("version".into(), json!(a.adsb_version));
    }
    if a.nic_baro_valid.valid() {
        o.insert("nic_baro".into(), json!(a.nic_baro as u8));
    }
    if a.nac_p_valid.valid() {
        o.insert("nac_p".into(), json!(a.nac_p));
    }
    if a.nac_v_valid.valid() {
        o.insert("nac_v".into(), json!(a.nac_v));
    }
    if a.sil_valid.valid() {
        o.insert("sil".into(), json!(a.sil));
        o.insert("sil_type".into(), json!(sil_type_str(a.sil_type)));
    }
    if a.gva_valid.valid() {
        o.insert("gva".into(), json!(a.gva));
    }
    if a.sda_valid.valid() {
        o.insert("sda".into(), json!(a.sda));
    }
    if a.alert_valid.valid() {
        o.insert("alert".into(), json!(a.alert as u8));
    }
    if a.spi_valid.valid() {
        o.insert("spi".into(), json!(a.spi as u8));
    }

    if a.wind_updated != 0
        && now < a.wind_updated + TRACK_EXPIRE
        && (a.wind_altitude - a.altitude_baro).abs() < 500
    {
        o.insert("ws".into(), json!(a.wind_speed.round()));
        o.insert("wd".into(), json!(a.wind_direction.round()));
    }
    if a.oat_updated != 0 && now < a.oat_updated + TRACK_EXPIRE {
        o.insert("oat".into(), json!(a.oat.round()));
        o.insert("tat".into(), json!(a.tat.round()));
    }

    o.insert("messages".into(), json!(a.messages));
    o.insert("seen".into(), json!(a.seen_age_s(now)));
    o.insert("rssi".into(), json!((a.rssi() * 10.0).round() / 10.0));

    Value::Object(o)
}

impl Aircraft {
    fn seen_age_s(&self, now: u64) -> f64 {
        (now.saturating_sub(self.seen) as f64 / 100.0).round() / 10.0
    }
}

/// The aircraft object embedded in traces for a quarter-rate snapshot.
pub fn state_all_object(s: &StateAll, addr: u32, ts: u64) -> Value {
    let mut a = Aircraft::new(addr, ts);
    from_state_all(s, &mut a, ts);
    aircraft_object(&a, ts)
}

/// Immediate JSON position line for the json-out port.
pub fn json_position_output(app: &App, a: &Aircraft, mm: &Message) {
    let writer = &app.outputs.json_out;
    if writer.connections() == 0 {
        return;
    }
    let d = match mm.decoded {
        Some(d) => d,
        None => return,
    };
    let line = json!({
        "hex": a.hex(),
        "lat": (d.lat * 1e6).round() / 1e6,
        "lon": (d.lon * 1e6).round() / 1e6,
        "nic": d.nic,
        "time": mm.sys_timestamp as f64 / 1000.0,
    });
    let mut bytes = line.to_string().into_bytes();
    bytes.push(b'\n');
    writer.send_with(mm.sys_timestamp, bytes.len(), |buf| buf.extend_from_slice(&bytes));
}

/// Global aircraft.json. Skips aircraft not seen for half the track
/// expiry unless they still carry a fresh satellite position.
pub fn generate_aircraft_json(app: &App, now: u64) -> Value {
    let mut aircraft = Vec::new();
    let jaero_cutoff = app.config.jaero_timeout * 60 * SECONDS;

    app.store.for_each(|_, slot| {
        let guard = slot.lock().unwrap();
        let a = &guard.ac;
        if a.messages < 2 {
            return;
        }
        let fresh = now < a.seen + TRACK_EXPIRE / 2;
        let jaero_pos = a.position_valid.last_source == Source::Jaero
            && a.seen_pos != 0
            && now < a.seen_pos + jaero_cutoff;
        if !fresh && !jaero_pos {
            return;
        }
        aircraft.push(aircraft_object(a, now));
    });

    json!({
        "now": now as f64 / 1000.0,
        "messages": app.stats.alltime().messages_total,
        "aircraft": aircraft,
    })
}

/// One tile's JSON document.
pub fn generate_globe_json(app: &App, tile: i32, now: u64) -> Value {
    let mut aircraft = Vec::new();
    for addr in app.tiles.members(tile) {
        if let Some(slot) = app.store.get(addr) {
            let guard = slot.lock().unwrap();
            aircraft.push(aircraft_object(&guard.ac, now));
        }
    }

    let (south, west, north, east) = tile_bbox(tile);
    json!({
        "now": now as f64 / 1000.0,
        "globeIndex": tile,
        "south": south,
        "west": west,
        "north": north,
        "east": east,
        "aircraft": aircraft,
    })
}

// Fixed-size binary tile records.

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct BinHeader {
    /// milliseconds
    pub now: u64,
    pub element_size: u32,
    /// aircraft with a valid position in this document
    pub ac_count_pos: u32,
    pub index: i32,
    /// bbox, 1e-3 degrees
    pub south: i32,
    pub west: i32,
    pub north: i32,
    pub east: i32,
    pub _pad: [u8; 4],
}

pub const BIN_FLAG_POSITION: u16 = 1 << 0;
pub const BIN_FLAG_ON_GROUND: u16 = 1 << 1;
pub const BIN_FLAG_ALT_GEOM: u16 = 1 << 2;
pub const BIN_FLAG_RATE_GEOM: u16 = 1 << 3;
pub const BIN_FLAG_TRACK: u16 = 1 << 4;
pub const BIN_FLAG_GS: u16 = 1 << 5;
pub const BIN_FLAG_ALT: u16 = 1 << 6;
pub const BIN_FLAG_SQUAWK: u16 = 1 << 7;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct BinCraft {
    pub addr: u32,
    /// milliseconds since last message, saturated
    pub seen_ms: u32,
    /// 1e-6 degrees
    pub lat: i32,
    pub lon: i32,
    /// 25 ft units
    pub alt_baro: i16,
    pub alt_geom: i16,
    /// 0.1 kt
    pub gs: i16,
    /// 0.1 deg
    pub track: i16,
    /// 8 fpm
    pub rate: i16,
    pub squawk: u16,
    pub flags: u16,
    pub pos_nic: u8,
    pub category: u8,
    pub callsign: [u8; 8],
    /// RSSI, dB + 50, clamped 0..=255
    pub signal: u8,
    pub _pad: [u8; 3],
}

fn bincraft_of(a: &Aircraft, now: u64) -> BinCraft {
    let mut c = BinCraft {
        addr: a.addr,
        seen_ms: now.saturating_sub(a.seen).min(u32::MAX as u64) as u32,
        ..Default::default()
    };
    if a.position_valid.valid() {
        c.flags |= BIN_FLAG_POSITION;
        c.lat = (a.lat * 1e6) as i32;
        c.lon = (a.lon * 1e6) as i32;
        c.pos_nic = a.pos_nic;
    }
    if a.airground == AirGround::Ground && a.airground_valid.valid() {
        c.flags |= BIN_FLAG_ON_GROUND;
    }
    if a.altitude_baro_valid.valid() {
        c.flags |= BIN_FLAG_ALT;
        c.alt_baro = (a.altitude_baro as f64 / 25.0).round() as i16;
    }
    if a.altitude_geom_valid.valid() {
        c.flags |= BIN_FLAG_ALT_GEOM;
        c.alt_geom = (a.altitude_geom as f64 / 25.0).round() as i16;
    }
    if a.gs_valid.valid() {
        c.flags |= BIN_FLAG_GS;
        c.gs = (a.gs * 10.0).round() as i16;
    }
    if a.track_valid.valid() {
        c.flags |= BIN_FLAG_TRACK;
        c.track = (a.track * 10.0).round() as i16;
    }
    if a.geom_rate_valid.valid() {
        c.flags |= BIN_FLAG_RATE_GEOM;
        c.rate = (a.geom_rate as f64 / 8.0).round() as i16;
    } else if a.baro_rate_valid.valid() {
        c.rate = (a.baro_rate as f64 / 8.0).round() as i16;
    }
    if a.squawk_valid.valid() {
        c.flags |= BIN_FLAG_SQUAWK;
        c.squawk = a.squawk;
    }
    c.category = a.category;
    let cs = a.callsign.as_bytes();
    for i in 0..8 {
        c.callsign[i] = *cs.get(i).unwrap_or(&0);
    }
    c.signal = (a.rssi() + 50.0).clamp(0.0, 255.0) as u8;
    c
}

/// One tile's packed binary document: a 40-byte header then the fixed
/// records.
pub fn generate_globe_bin(app: &App, tile: i32, now: u64) -> Vec<u8> {
    let mut crafts = Vec::new();
    let mut with_pos = 0u32;
    for addr in app.tiles.members(tile) {
        if let Some(slot) = app.store.get(addr) {
            let guard = slot.lock().unwrap();
            let c = bincraft_of(&guard.ac, now);
            if c.flags & BIN_FLAG_POSITION != 0 {
                with_pos += 1;
            }
            crafts.push(c);
        }
    }

    let (south, west, north, east) = tile_bbox(tile);
    let header = BinHeader {
        now,
        element_size: std::mem::size_of::<BinCraft>() as u32,
        ac_count_pos: with_pos,
        index: tile,
        south: (south * 1000.0) as i32,
        west: (west * 1000.0) as i32,
        north: (north * 1000.0) as i32,
        east: (east * 1000.0) as i32,
        _pad: [0; 4],
    };

    let mut out = Vec::with_capacity(40 + crafts.len() * std::mem::size_of::<BinCraft>());
    out.extend_from_slice(bytemuck::bytes_of(&header));
    out.extend_from_slice(bytemuck::cast_slice(&crafts));
    out
}

/// Trace document in the compact array form:
/// [dt_s, lat, lon, alt|"ground"|null, gs|null, track|null, bitfield,
/// rate|null, state_all|null]
pub fn generate_trace_json(a: &Aircraft, trace: &Trace, start: usize) -> Value {
    let mut o = Map::new();
    o.insert("icao".into(), json!(a.hex()));
    if let Some(r) = &a.registration {
        o.insert("r".into(), json!(r));
    }
    if let Some(t) = &a.type_code {
        o.insert("t".into(), json!(t));
    }
    if let Some(d) = &a.type_long {
        o.insert("desc".into(), json!(d));
    }
    if a.db_flags != 0 {
        o.insert("dbFlags".into(), json!(a.db_flags));
    }

    if start < trace.len() {
        let base_ts = trace.points[start].timestamp;
        o.insert("timestamp".into(), json!(base_ts as f64 / 1000.0));

        let mut points = Vec::with_capacity(trace.len() - start);
        for i in start..trace.len() {
            let p = &trace.points[i];

            let alt: Value = if p.on_ground() {
                json!("ground")
            } else if let Some(ft) = p.altitude_ft() {
                json!(ft)
            } else {
                Value::Null
            };

            let bitfield = ((p.flag(PF_ALT_GEOM) as u8) << 3)
                | ((p.flag(PF_RATE_GEOM) as u8) << 2)
                | ((p.leg_marker() as u8) << 1)
                | p.flag(PF_STALE) as u8;

            let state_all: Value = match trace.state_all_at(i) {
                Some(s) => state_all_object(s, a.addr, p.timestamp),
                None => Value::Null,
            };

            points.push(json!([
                (p.timestamp - base_ts) as f64 / 1000.0,
                p.lat_deg(),
                p.lon_deg(),
                alt,
                p.gs_kt(),
                p.track_deg(),
                bitfield,
                p.rate_fpm(),
                state_all,
            ]));
        }
        o.insert("trace".into(), json!(points));
    }

    Value::Object(o)
}

/// receiver.json: what the map client needs to configure itself.
pub fn generate_receiver_json(app: &App, aircraft_count: usize) -> Value {
    let mut o = Map::new();
    o.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
    o.insert("refresh".into(), json!(app.config.json_interval));
    o.insert("history".into(), json!(0));
    o.insert("aircraft".into(), json!(aircraft_count));
    if app.config.json_globe_index {
        o.insert("globeIndexGrid".into(), json!(crate::globe::GLOBE_INDEX_GRID));
    }
    match app.config.json_location_accuracy {
        2 => {
            if let Some((lat, lon)) = app.receiver_position() {
                o.insert("lat".into(), json!(lat));
                o.insert("lon".into(), json!(lon));
            }
        }
        1 => {
            if let Some((lat, lon)) = app.receiver_position() {
                // approximate to two decimals
                o.insert("lat".into(), json!((lat * 100.0).round() / 100.0));
                o.insert("lon".into(), json!((lon * 100.0).round() / 100.0));
            }
        }
        _ => {}
    }
    Value::Object(o)
}

/// clients.json: connection counters for every live peer.
pub fn generate_clients_json(app: &App, now: u64) -> Value {
    let clients: Vec<Value> = app
        .clients_snapshot()
        .iter()
        .map(|c| {
            let elapsed_s = (now.saturating_sub(c.connected_since) as f64 / 1000.0).max(0.001);
            let bytes = c.bytes_received.load(Ordering::Relaxed);
            json!({
                "service": c.service.descr(),
                "host": c.host,
                "port": c.port,
                "receiverId": format!("{:016x}", c.receiver_id.load(Ordering::Relaxed)),
                "uuid": c.uuid.lock().unwrap().clone(),
                "messages": c.messages.load(Ordering::Relaxed),
                "positions": c.positions.load(Ordering::Relaxed),
                "garbage": c.garbage_bytes.load(Ordering::Relaxed),
                "kbps": (bytes as f64 / 128.0 / elapsed_s * 10.0).round() / 10.0,
                "connectedSeconds": (elapsed_s * 10.0).round() / 10.0,
            })
        })
        .collect();
    json!({ "clients": clients })
}

/// One part of the VRS-compatible array. Aircraft are assigned to parts
/// by address so only a fraction re-serializes per tick.
pub fn generate_vrs_json(app: &App, part: usize, n_parts: usize, now: u64) -> Value {
    let mut ac_list = Vec::new();

    app.store.for_each(|addr, slot| {
        if crate::store::partition(addr, n_parts) != part {
            return;
        }
        let guard = slot.lock().unwrap();
        let a = &guard.ac;
        if now > a.seen + TRACK_EXPIRE / 2 {
            return;
        }

        let mut o = Map::new();
        o.insert("Icao".into(), json!(format!("{:06X}", a.addr & 0xffffff)));
        if a.altitude_baro_valid.valid() {
            o.insert("Alt".into(), json!(a.altitude_baro));
        }
        if a.altitude_geom_valid.valid() {
            o.insert("GAlt".into(), json!(a.altitude_geom));
        }
        if a.position_valid.valid() {
            o.insert("Lat".into(), json!((a.lat * 1e6).round() / 1e6));
            o.insert("Long".into(), json!((a.lon * 1e6).round() / 1e6));
            o.insert("PosTime".into(), json!(a.seen_pos));
            o.insert("Mlat".into(), json!(a.position_valid.source == Source::Mlat));
        }
        if a.gs_valid.valid() {
            o.insert("Spd".into(), json!((a.gs * 10.0).round() / 10.0));
        }
        if a.track_valid.valid() {
            o.insert("Trak".into(), json!((a.track * 10.0).round() / 10.0));
        }
        if a.baro_rate_valid.valid() {
            o.insert("Vsi".into(), json!(a.baro_rate));
        }
        if a.squawk_valid.valid() {
            o.insert("Sqk".into(), json!(format!("{:04x}", a.squawk)));
        }
        if a.callsign_valid.valid() {
            o.insert("Call".into(), json!(a.callsign.trim_end()));
        }
        if a.airground_valid.valid() {
            o.insert("Gnd".into(), json!(a.airground == AirGround::Ground));
        }
        ac_list.push(Value::Object(o));
    });

    let total = ac_list.len();
    json!({
        "acList": ac_list,
        "totalAc": total,
        "stm": now,
    })
}

//
// File output helpers
//

/// Serialize JSON to `dir/name`, atomically.
pub fn write_json_atomic(dir: &Path, name: &str, value: &Value) -> io::Result<()> {
    let bytes = serde_json::to_vec(value)?;
    write_bytes_atomic(dir, name, &bytes)
}

/// Gzip `bytes` to `dir/name`, atomically.
pub fn write_gzip_atomic(dir: &Path, name: &str, bytes: &[u8], level: u32) -> io::Result<()> {
    let mut enc = GzEncoder::new(Vec::with_capacity(bytes.len() / 4), Compression::new(level));
    enc.write_all(bytes)?;
    let compressed = enc.finish()?;
    write_bytes_atomic(dir, name, &compressed)
}

pub fn write_bytes_atomic(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let final_path = dir.join(name);
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = dir.join(format!("{}.tmp", name));
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, &final_path)
}
