// The state-update engine: one call per decoded message, executed on the
// caller's task. Position candidates run against a scratch copy of the
// record; failed plausibility checks roll the scalars back untouched.

use tracing::debug;

use crate::aircraft::*;
use crate::app::App;
use crate::clock::{AntiSpam, HOURS, MINUTES, SECONDS};
use crate::geodesy::{bearing, bogus_lat_lon, greatcircle, norm_angle, norm_diff};
use crate::geomag;
use crate::globe::{globe_index, TILE_NONE};
use crate::modes::cpr;
use crate::modes::message::{
    AddrType, AirGround, CprType, DecodedPos, HeadingType, Message, SilType, Source, RC_UNKNOWN,
};
use crate::modes::modeac;
use crate::snapshot;
use crate::store::SlotRef;
use crate::trace::Trace;

/// Messages with an untrusted address may update an existing record only
/// this long after the last trusted one.
const ADDRESS_TRUST_WINDOW: u64 = 45 * SECONDS;

/// A message whose address we trust enough to create or refresh a track:
/// extended squitter, a CRC-verified all-call without interrogator id, or
/// ground-station originated SBS.
pub fn address_reliable(mm: &Message) -> bool {
    mm.df == 17 || mm.df == 18 || (mm.df == 11 && mm.iid == 0) || mm.sbs_in
}

/// Update the tracked state from one message. Returns the registry slot
/// so the caller can forward the message with aircraft context.
pub fn update_from_message(app: &App, mm: &mut Message) -> Option<SlotRef> {
    if mm.df == 32 {
        if let Some(squawk) = mm.squawk {
            app.modeac.lock().unwrap().record(squawk);
        }
        return None;
    }

    let now = mm.sys_timestamp;
    let reduce_interval = app.reduce_interval();

    let slot = match app.store.get(mm.addr) {
        Some(s) => s,
        None => {
            if !address_reliable(mm) {
                return None;
            }
            let mut a = Aircraft::new(mm.addr, now);
            if let Some(t) = mm.addr_type {
                a.addr_type = t;
            }
            app.stats.with_current(|s| s.unique_aircraft += 1);
            app.store.insert(mm.addr, a)
        }
    };

    let mut guard = slot.lock().unwrap();
    let crate::store::Slot { ac: a, trace } = &mut *guard;

    let scratch = if mm.has_position() {
        // garbage-classified receivers still get processed to see
        // whether they are still sending garbage
        Some(a.clone())
    } else if mm.garbage {
        return None;
    } else {
        None
    };

    if address_reliable(mm) {
        a.seen = now;
    }
    if now > a.seen + ADDRESS_TRUST_WINDOW {
        return None;
    }

    a.record_signal(mm.signal_level);
    if a.messages == u32::MAX {
        a.messages = 100_000;
    }
    a.messages += 1;
    if let (Some(client), false) = (&mm.client, mm.garbage) {
        client.count_message();
    }
    app.stats.with_current(|s| s.messages_total += 1);

    // the address type ages towards whatever the messages carry:
    // upgrades are quick, downgrades slow
    if a.addrtype_updated > now {
        a.addrtype_updated = now;
    }
    let mm_addrtype = mm.addr_type.unwrap_or(AddrType::Unknown);
    if (mm_addrtype <= a.addr_type && now > a.addrtype_updated + 30 * SECONDS)
        || (mm_addrtype > a.addr_type && now > a.addrtype_updated + 90 * SECONDS)
    {
        a.addr_type = mm_addrtype;
        a.addrtype_updated = now;
        if a.addr_type > AddrType::AdsbIcaoNt {
            a.adsb_version = -1;
        }
    }

    let source = mm.source.unwrap_or(Source::Invalid);

    // the ADS-B version is tracked separately per relay path
    let mut message_version: i8 = match source {
        Source::Adsb => a.adsb_version,
        Source::Tisb => a.tisb_version,
        Source::Adsr => a.adsr_version,
        _ => -1,
    };
    if message_version < 0 {
        message_version = 0;
    }

    if let Some(cat) = mm.category {
        a.category = cat;
        a.category_updated = now;
    }

    // operational status first: it refreshes version / HRD / TAH used
    // further down
    if let Some(op) = mm.opstatus {
        message_version = op.version as i8;
        if let Some(hrd) = op.hrd {
            a.adsb_hrd = hrd;
        }
        if let Some(tah) = op.tah {
            a.adsb_tah = tah;
        }
    }
    match source {
        Source::Adsb => a.adsb_version = message_version,
        Source::Tisb => a.tisb_version = message_version,
        Source::Adsr => a.adsr_version = message_version,
        _ => {}
    }

    // ADS-B v0 has no NACp / SIL fields; derive them from the position
    // message type
    if message_version == 0 && mm.accuracy.nac_p.is_none() {
        if let Some(nacp) = compute_v0_nacp(mm) {
            mm.accuracy.nac_p = Some(nacp);
        }
    }
    if message_version == 0 && mm.accuracy.sil.is_none() {
        if let Some(sil) = compute_v0_sil(mm) {
            mm.accuracy.sil = Some((sil, SilType::Unknown));
        }
    }

    update_altitude_baro(a, mm, source, now, reduce_interval);

    if let Some(squawk) = mm.squawk {
        if accept_data(&mut a.squawk_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            if squawk != a.squawk {
                a.mode_a_hit = false;
            }
            a.squawk = squawk;
        }
    }

    if let Some(emergency) = mm.emergency {
        if accept_data(&mut a.emergency_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.emergency = emergency;
        }
    }

    if let Some(alt) = mm.altitude_geom {
        if accept_data(&mut a.altitude_geom_valid, source, mm, ReduceRate::Often, reduce_interval) {
            a.altitude_geom = alt;
        }
    }

    if let Some(delta) = mm.geom_delta {
        if accept_data(&mut a.geom_delta_valid, source, mm, ReduceRate::Often, reduce_interval) {
            a.geom_delta = delta;
        }
    }

    if let Some((heading, raw_type)) = mm.heading {
        let htype = match raw_type {
            HeadingType::MagneticOrTrue => a.adsb_hrd,
            HeadingType::TrackOrHeading => a.adsb_tah,
            other => other,
        };
        match htype {
            HeadingType::GroundTrack => {
                if accept_data(&mut a.track_valid, source, mm, ReduceRate::VeryOften, reduce_interval)
                {
                    a.track = heading;
                }
            }
            HeadingType::Magnetic => {
                let dec = geomag::declination(a.lat, a.lon, geomag::decimal_year(now));
                if accept_data(
                    &mut a.mag_heading_valid,
                    source,
                    mm,
                    ReduceRate::Often,
                    reduce_interval,
                ) {
                    a.mag_heading = heading;

                    // do not accept more than 45 degrees of crab when
                    // deriving the true heading
                    if let Some(dec) = dec {
                        let crab_ok = !a.track_valid.valid()
                            || norm_diff(heading + dec - a.track, 180.0).abs() < 45.0;
                        if crab_ok
                            && accept_data(
                                &mut a.true_heading_valid,
                                Source::Indirect,
                                mm,
                                ReduceRate::Often,
                                reduce_interval,
                            )
                        {
                            a.true_heading = norm_angle(heading + dec, 180.0);
                            calc_wind(a, now);
                        }
                    }
                }
            }
            HeadingType::True => {
                if accept_data(
                    &mut a.true_heading_valid,
                    source,
                    mm,
                    ReduceRate::Often,
                    reduce_interval,
                ) {
                    a.true_heading = heading;
                }
            }
            _ => {}
        }
    }

    if let Some(rate) = mm.track_rate {
        if accept_data(&mut a.track_rate_valid, source, mm, ReduceRate::Often, reduce_interval) {
            a.track_rate = rate;
        }
    }

    if let Some(roll) = mm.roll {
        if accept_data(&mut a.roll_valid, source, mm, ReduceRate::Often, reduce_interval) {
            a.roll = roll;
        }
    }

    if let Some(gs) = mm.gs_selected(message_version) {
        if accept_data(&mut a.gs_valid, source, mm, ReduceRate::VeryOften, reduce_interval) {
            a.gs = gs;
        }
    }

    if let Some(ias) = mm.ias {
        if accept_data(&mut a.ias_valid, source, mm, ReduceRate::Often, reduce_interval) {
            a.ias = ias;
        }
    }

    if let Some(tas) = mm.tas {
        if !(a.ias_valid.valid() && tas < a.ias)
            && accept_data(&mut a.tas_valid, source, mm, ReduceRate::Often, reduce_interval)
        {
            a.tas = tas;
            calc_temp(a, now);
            calc_wind(a, now);
        }
    }

    if let Some(mach) = mm.mach {
        if accept_data(&mut a.mach_valid, source, mm, ReduceRate::Often, reduce_interval) {
            a.mach = mach;
            calc_temp(a, now);
        }
    }

    if let Some(rate) = mm.baro_rate {
        if accept_data(&mut a.baro_rate_valid, source, mm, ReduceRate::VeryOften, reduce_interval) {
            a.baro_rate = rate;
        }
    }

    if let Some(rate) = mm.geom_rate {
        if accept_data(&mut a.geom_rate_valid, source, mm, ReduceRate::VeryOften, reduce_interval) {
            a.geom_rate = rate;
        }
    }

    update_airground(a, mm, source, now, reduce_interval);

    if let Some(callsign) = mm.callsign.clone() {
        if accept_data(&mut a.callsign_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.callsign = callsign;
        }
    }

    if let Some(alt) = mm.nav.mcp_altitude {
        if accept_data(&mut a.nav_altitude_mcp_valid, source, mm, ReduceRate::Rare, reduce_interval)
        {
            a.nav_altitude_mcp = alt;
        }
    }
    if let Some(alt) = mm.nav.fms_altitude {
        if accept_data(&mut a.nav_altitude_fms_valid, source, mm, ReduceRate::Rare, reduce_interval)
        {
            a.nav_altitude_fms = alt;
        }
    }
    if let Some(nav_src) = mm.nav.altitude_source {
        if accept_data(&mut a.nav_altitude_src_valid, source, mm, ReduceRate::Rare, reduce_interval)
        {
            a.nav_altitude_src = nav_src;
        }
    }
    if let Some(heading) = mm.nav.heading {
        if accept_data(&mut a.nav_heading_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.nav_heading = heading;
        }
    }
    if let Some(modes) = mm.nav.modes {
        if accept_data(&mut a.nav_modes_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.nav_modes = modes;
        }
    }
    if let Some(qnh) = mm.nav.qnh {
        if accept_data(&mut a.nav_qnh_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.nav_qnh = qnh;
        }
    }

    if let Some(alert) = mm.alert {
        if accept_data(&mut a.alert_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.alert = alert;
        }
    }
    if let Some(spi) = mm.spi {
        if accept_data(&mut a.spi_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.spi = spi;
        }
    }

    // stash CPR frames for global decoding
    let mut cpr_new = false;
    if let Some(frame) = mm.cpr {
        if app.config.net_ingest {
            // forward all CPRs upstream for faster garbage detection
            mm.reduce_forward = true;
        }
        let (nic, rc) = compute_nic_rc_from_message(mm, a);
        if !frame.odd {
            if accept_data(&mut a.cpr_even.valid, source, mm, ReduceRate::Often, reduce_interval) {
                a.cpr_even.typ = frame.typ;
                a.cpr_even.lat = frame.lat;
                a.cpr_even.lon = frame.lon;
                a.cpr_even.nic = nic;
                a.cpr_even.rc = rc;
                cpr_new = true;
            }
        } else if accept_data(&mut a.cpr_odd.valid, source, mm, ReduceRate::Often, reduce_interval) {
            a.cpr_odd.typ = frame.typ;
            a.cpr_odd.lat = frame.lat;
            a.cpr_odd.lon = frame.lon;
            a.cpr_odd.nic = nic;
            a.cpr_odd.rc = rc;
            cpr_new = true;
        }
    }

    if let Some(v) = mm.accuracy.sda {
        if accept_data(&mut a.sda_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.sda = v;
        }
    }
    if let Some(v) = mm.accuracy.nic_a {
        if accept_data(&mut a.nic_a_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.nic_a = v;
        }
    }
    if let Some(v) = mm.accuracy.nic_c {
        if accept_data(&mut a.nic_c_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.nic_c = v;
        }
    }
    if let Some(v) = mm.accuracy.nic_baro {
        if accept_data(&mut a.nic_baro_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.nic_baro = v;
        }
    }
    if let Some(v) = mm.accuracy.nac_p {
        if accept_data(&mut a.nac_p_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.nac_p = v;
        }
    }
    if let Some(v) = mm.accuracy.nac_v {
        if accept_data(&mut a.nac_v_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.nac_v = v;
        }
    }
    if let Some((sil, sil_type)) = mm.accuracy.sil {
        if accept_data(&mut a.sil_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.sil = sil;
            if a.sil_type.is_none() || sil_type != SilType::Unknown {
                a.sil_type = Some(sil_type);
            }
        }
    }
    if let Some(v) = mm.accuracy.gva {
        if accept_data(&mut a.gva_valid, source, mm, ReduceRate::Rare, reduce_interval) {
            a.gva = v;
        }
    }

    // derive geometric altitude while baro and the delta are both
    // fresher than the last direct geometric report
    if a.alt_reliable >= app.config.json_reliable + 1
        && compare_validity(&a.altitude_baro_valid, &a.altitude_geom_valid) > 0
        && compare_validity(&a.geom_delta_valid, &a.altitude_geom_valid) > 0
    {
        a.altitude_geom = a.altitude_baro + a.geom_delta;
        a.altitude_geom_valid = combine_validity(&a.altitude_baro_valid, &a.geom_delta_valid, now);
    }

    // and conversely keep a derived delta when both altitudes are fresh
    if mm.altitude_geom.is_some()
        && mm.geom_delta.is_none()
        && a.alt_reliable >= app.config.json_reliable + 1
        && a.altitude_baro_valid.age(now) < SECONDS
        && accept_data(&mut a.geom_delta_valid, source, mm, ReduceRate::VeryOften, reduce_interval)
    {
        a.geom_delta = a.altitude_geom - a.altitude_baro;
    }

    if cpr_new {
        // surface <-> airborne CPR crossings force the ground state in
        // addition to the normal air/ground handling
        if let (Some(frame), Some(last_type)) = (mm.cpr, a.last_cpr_type) {
            if last_type == CprType::Surface
                && frame.typ == CprType::Airborne
                && accept_data(&mut a.airground_valid, source, mm, ReduceRate::Rare, reduce_interval)
            {
                a.airground = AirGround::Airborne;
                mm.reduce_forward = true;
            }
            if last_type == CprType::Airborne
                && frame.typ == CprType::Surface
                && accept_data(&mut a.airground_valid, source, mm, ReduceRate::Rare, reduce_interval)
            {
                a.airground = AirGround::Ground;
                mm.reduce_forward = true;
            }
        }

        update_position(app, a, trace, mm, now);
    }

    if mm.sbs_in && mm.sbs_pos.is_some() {
        update_sbs_position(app, a, trace, mm, now);
    }

    if mm.df == 11 && mm.iid == 0 {
        // a clean all-call gives a rough receiver reference for surface
        // decoding
        if let Some(client) = &mm.client {
            if let Some((rlat, rlon)) = client.rough_position() {
                a.rr_lat = rlat;
                a.rr_lon = rlon;
                a.rr_seen = now;
            }
        }

        if now > a.next_reduce_forward_df11 {
            a.next_reduce_forward_df11 = now + reduce_interval * 4;
            mm.reduce_forward = true;
        }
    }

    if let Some(frame) = mm.cpr {
        a.last_cpr_type = Some(frame.typ);
    }

    if let Some(scratch) = scratch {
        if mm.garbage || mm.pos_bad || mm.duplicate {
            *a = scratch;
            if mm.pos_bad {
                position_bad(app, mm, a);
            }
        }
    }

    drop(guard);
    Some(slot)
}

/// Barometric altitude fusion with the reliability counter.
fn update_altitude_baro(
    a: &mut Aircraft,
    mm: &mut Message,
    source: Source,
    now: u64,
    reduce_interval: u64,
) {
    let alt = match mm.altitude_baro {
        Some(alt) => alt,
        None => return,
    };

    let takeover_ok = source >= a.altitude_baro_valid.source
        || (a.altitude_baro_valid.age(now) > 10 * SECONDS
            && a.altitude_baro_valid.source != Source::Jaero
            && a.altitude_baro_valid.source != Source::Sbs);
    if !takeover_ok {
        return;
    }

    if a.mode_c_hit {
        let new_mode_c = (a.altitude_baro + 49) / 100;
        let old_mode_c = (alt + 49) / 100;
        if new_mode_c != old_mode_c {
            a.mode_c_hit = false;
        }
    }

    let delta = alt - a.altitude_baro;
    let mut fpm: i64 = 0;
    let mut max_fpm: i64 = 12_500;
    let mut min_fpm: i64 = -12_500;

    if delta.abs() >= 300 {
        let age = a.altitude_baro_valid.age(now) as i64;
        fpm = delta as i64 * 60 * 10 / (age / 100 + 10);

        if a.geom_rate_valid.valid() && a.geom_rate_valid.age(now) < a.baro_rate_valid.age(now) {
            let allow = 1500 + (a.geom_rate_valid.age(now) as i64 / 2).min(11_000);
            min_fpm = a.geom_rate as i64 - allow;
            max_fpm = a.geom_rate as i64 + allow;
        } else if a.baro_rate_valid.valid() {
            let allow = 1500 + (a.baro_rate_valid.age(now) as i64 / 2).min(11_000);
            min_fpm = a.baro_rate as i64 - allow;
            max_fpm = a.baro_rate as i64 + allow;
        }

        if a.altitude_baro_valid.valid() && age < 30 * SECONDS as i64 {
            let decayed = ALTITUDE_BARO_RELIABLE_MAX
                - (ALTITUDE_BARO_RELIABLE_MAX * age as i32 / (30 * SECONDS) as i32);
            a.alt_reliable = a.alt_reliable.min(decayed);
        } else {
            a.alt_reliable = 0;
        }
    }

    let mut good_crc = if mm.crc == 0 && source >= Source::Jaero { 4 } else { 0 };
    if source == Source::Sbs || source == Source::Mlat {
        good_crc = ALTITUDE_BARO_RELIABLE_MAX / 2 - 1;
    }

    // a Q-bit altitude claiming to sit above the encodable band is
    // always discarded
    let q_bit_bogus =
        a.altitude_baro > 50_175 && mm.alt_q_bit && a.alt_reliable > ALTITUDE_BARO_RELIABLE_MAX / 4;

    let accept = if q_bit_bogus {
        good_crc = 0;
        false
    } else if a.alt_reliable <= 0 || delta.abs() < 300 {
        true
    } else if fpm < max_fpm && fpm > min_fpm {
        true
    } else if good_crc > a.alt_reliable {
        true
    } else if source > a.altitude_baro_valid.source {
        true
    } else if source == Source::Jaero
        && (a.altitude_baro_valid.source == Source::Jaero
            || a.altitude_baro_valid.source == Source::Invalid)
    {
        good_crc = ALTITUDE_BARO_RELIABLE_MAX;
        true
    } else {
        false
    };

    if accept {
        if accept_data(&mut a.altitude_baro_valid, source, mm, ReduceRate::VeryOften, reduce_interval)
        {
            a.alt_reliable = ALTITUDE_BARO_RELIABLE_MAX.min(a.alt_reliable + good_crc + 1);
            a.altitude_baro = alt;
        }
    } else {
        a.alt_reliable -= good_crc + 1;
        if a.alt_reliable <= 0 {
            a.alt_reliable = 0;
            if a.position_valid.source > Source::Jaero {
                a.altitude_baro_valid.invalidate();
            }
        }
    }
}

/// Ground/air state machine. Certain states yield only to fresher
/// certain data of the opposite value, or to anything once expired.
fn update_airground(
    a: &mut Aircraft,
    mm: &mut Message,
    source: Source,
    now: u64,
    reduce_interval: u64,
) {
    if mm.airground == AirGround::Invalid || source == Source::ModeS {
        return;
    }
    // a recent surface CPR pins the ground state against plain airborne
    // claims
    if a.last_cpr_type == Some(CprType::Surface)
        && mm.airground == AirGround::Airborne
        && now < a.airground_valid.updated + TRACK_EXPIRE_LONG
    {
        return;
    }

    let acceptable = a.airground == AirGround::Uncertain
        || mm.airground != AirGround::Uncertain
        || now > a.airground_valid.updated + TRACK_EXPIRE_LONG;
    if !acceptable {
        return;
    }

    if mm.airground != a.airground {
        mm.reduce_forward = true;
    }
    if accept_data(&mut a.airground_valid, source, mm, ReduceRate::Rare, reduce_interval) {
        a.airground = mm.airground;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CprKind {
    Global,
    Local,
    Direct,
}

#[derive(Debug, Clone, Copy)]
enum CprOutcome {
    Position { lat: f64, lon: f64, nic: u8, rc: u32, relative_to: u8 },
    Skip,
    Bad,
}

fn update_position(app: &App, a: &mut Aircraft, trace: &mut Trace, mm: &mut Message, now: u64) {
    let frame = match mm.cpr {
        Some(f) => f,
        None => return,
    };
    let surface = frame.typ == CprType::Surface;
    a.pos_surface = a.airground_valid.valid() && a.airground == AirGround::Ground;

    let max_elapsed = if surface {
        app.stats.with_current(|s| s.cpr_surface += 1);
        // surface: 25 s, or 50 s when slow or speed unknown
        match mm.gs_selected(a.adsb_version) {
            Some(gs) if gs > 25.0 => 25 * SECONDS,
            _ => 50 * SECONDS,
        }
    } else {
        app.stats.with_current(|s| s.cpr_airborne += 1);
        10 * SECONDS
    };

    let mut outcome = CprOutcome::Skip;
    let mut try_local = true;
    let mut global_ok = false;

    if a.cpr_odd.valid.valid()
        && a.cpr_even.valid.valid()
        && a.cpr_odd.valid.source == a.cpr_even.valid.source
        && a.cpr_odd.typ == a.cpr_even.typ
        && a.cpr_odd.valid.updated.abs_diff(a.cpr_even.valid.updated) <= max_elapsed
    {
        outcome = do_global_cpr(app, a, mm, frame.odd, surface);

        match outcome {
            CprOutcome::Bad => {
                mm.pos_bad = true;
                return;
            }
            CprOutcome::Skip => {
                // no reference, or the pair crossed a zone; nonfatal
                app.stats.with_current(|s| s.cpr_global_skipped += 1);
            }
            CprOutcome::Position { .. } => {
                if accept_data(
                    &mut a.position_valid,
                    mm.source.unwrap_or(Source::Invalid),
                    mm,
                    ReduceRate::VeryOften,
                    app.reduce_interval(),
                ) {
                    app.stats.with_current(|s| s.cpr_global_ok += 1);
                    global_ok = true;
                } else {
                    app.stats.with_current(|s| s.cpr_global_skipped += 1);
                    outcome = CprOutcome::Skip;
                }
                try_local = false;
            }
        }
    }

    if matches!(outcome, CprOutcome::Skip) && try_local {
        outcome = do_local_cpr(app, a, mm, frame.odd, surface);

        match outcome {
            CprOutcome::Bad => {
                mm.pos_bad = true;
                return;
            }
            CprOutcome::Skip => {
                app.stats.with_current(|s| s.cpr_local_skipped += 1);
            }
            CprOutcome::Position { relative_to, .. } => {
                if accept_data(
                    &mut a.position_valid,
                    mm.source.unwrap_or(Source::Invalid),
                    mm,
                    ReduceRate::VeryOften,
                    app.reduce_interval(),
                ) {
                    app.stats.with_current(|s| {
                        s.cpr_local_ok += 1;
                        if relative_to == 1 {
                            s.cpr_local_aircraft_relative += 1;
                        }
                        if relative_to == 2 {
                            s.cpr_local_receiver_relative += 1;
                        }
                    });
                } else {
                    app.stats.with_current(|s| s.cpr_local_skipped += 1);
                    outcome = CprOutcome::Skip;
                }
            }
        }
    }

    if let CprOutcome::Position { lat, lon, nic, rc, .. } = outcome {
        mm.decoded = Some(DecodedPos { lat, lon, nic, rc });

        if a.gs_valid.valid() {
            a.gs_last_pos = a.gs;
        }

        if global_ok {
            increment_reliable(app, a, mm, now, if frame.odd { 1 } else { 0 });
        }

        set_position(app, a, trace, mm, now);
    }
}

fn do_global_cpr(
    app: &App,
    a: &Aircraft,
    mm: &mut Message,
    want_odd: bool,
    surface: bool,
) -> CprOutcome {
    // NIC / Rc from the worse of the pair: smaller NIC, larger Rc
    let nic = a.cpr_even.nic.min(a.cpr_odd.nic);
    let rc = a.cpr_even.rc.max(a.cpr_odd.rc);

    let decoded = if surface {
        // a reference is required to pick the 90-degree quadrant
        let reference = if a.rr_seen != 0 && mm.sys_timestamp < a.rr_seen + HOURS {
            Some((a.rr_lat, a.rr_lon))
        } else if a.position_valid.valid() {
            Some((a.lat, a.lon))
        } else if let Some(user) = app.receiver_position() {
            Some(user)
        } else if a.seen_pos != 0 {
            Some((a.lat, a.lon))
        } else {
            None
        };
        let (reflat, reflon) = match reference {
            Some(r) => r,
            None => return CprOutcome::Skip,
        };
        cpr::decode_surface_global(
            reflat,
            reflon,
            a.cpr_even.lat,
            a.cpr_even.lon,
            a.cpr_odd.lat,
            a.cpr_odd.lon,
            want_odd,
        )
    } else {
        cpr::decode_airborne_global(
            a.cpr_even.lat,
            a.cpr_even.lon,
            a.cpr_odd.lat,
            a.cpr_odd.lon,
            want_odd,
        )
    };

    let (lat, lon) = match decoded {
        Ok(pos) => pos,
        Err(_) => return CprOutcome::Skip,
    };

    // range gate against the receiver
    if app.config.max_range_m() > 0.0 {
        if let Some((user_lat, user_lon)) = app.receiver_position() {
            let range = greatcircle(user_lat, user_lon, lat, lon);
            if range > app.config.max_range_m() {
                app.stats.with_current(|s| s.cpr_global_range_checks += 1);
                return CprOutcome::Bad;
            }
        }
    }

    if !speed_check(app, a, mm.source.unwrap_or(Source::Invalid), lat, lon, mm, CprKind::Global) {
        app.stats.with_current(|s| s.cpr_global_speed_checks += 1);
        return CprOutcome::Bad;
    }

    CprOutcome::Position { lat, lon, nic, rc, relative_to: 0 }
}

fn do_local_cpr(
    app: &App,
    a: &Aircraft,
    mm: &mut Message,
    odd: bool,
    surface: bool,
) -> CprOutcome {
    let frame = match mm.cpr {
        Some(f) => f,
        None => return CprOutcome::Skip,
    };
    let (mut nic, mut rc) =
        if odd { (a.cpr_odd.nic, a.cpr_odd.rc) } else { (a.cpr_even.nic, a.cpr_even.rc) };

    let now = mm.sys_timestamp;
    let range_limit;
    let relative_to;
    let (reflat, reflon);

    if now < a.seen_pos_global + 10 * MINUTES
        && a.position_valid.valid()
        && now < a.position_valid.updated + 10 * MINUTES
    {
        reflat = a.lat;
        reflon = a.lon;
        if a.pos_nic < nic {
            nic = a.pos_nic;
        }
        if a.pos_rc < rc {
            rc = a.pos_rc;
        }
        // 100 NM against a reference at most 10 minutes old: a wrong
        // decode one cell away would need Mach 2+ over the ground
        range_limit = 1852.0 * 100.0;
        relative_to = 1;
    } else if !surface {
        let (user_lat, user_lon) = match app.receiver_position() {
            Some(u) => u,
            None => return CprOutcome::Skip,
        };
        reflat = user_lat;
        reflon = user_lon;

        // the receiver-centred window shrinks from max_range towards
        // half a CPR cell to stay unambiguous
        let max_range = app.config.max_range_m();
        if max_range <= 0.0 {
            return CprOutcome::Skip;
        } else if max_range <= 1852.0 * 180.0 {
            range_limit = max_range;
        } else if max_range < 1852.0 * 360.0 {
            range_limit = 1852.0 * 360.0 - max_range;
        } else {
            return CprOutcome::Skip;
        }
        relative_to = 2;
    } else {
        return CprOutcome::Skip;
    }

    let (lat, lon) = match cpr::decode_relative(reflat, reflon, frame.lat, frame.lon, odd, surface)
    {
        Ok(pos) => pos,
        Err(_) => return CprOutcome::Skip,
    };

    if range_limit > 0.0 {
        let range = greatcircle(reflat, reflon, lat, lon);
        if range > range_limit {
            app.stats.with_current(|s| s.cpr_local_range_checks += 1);
            return CprOutcome::Skip;
        }
    }

    if !speed_check(app, a, mm.source.unwrap_or(Source::Invalid), lat, lon, mm, CprKind::Local) {
        app.stats.with_current(|s| s.cpr_local_speed_checks += 1);
        return CprOutcome::Bad;
    }

    CprOutcome::Position { lat, lon, nic, rc, relative_to }
}

/// Could the aircraft plausibly have reached (lat, lon) since its last
/// accepted position?
fn speed_check(
    app: &App,
    a: &Aircraft,
    source: Source,
    lat: f64,
    lon: f64,
    mm: &mut Message,
    kind: CprKind,
) -> bool {
    // disabled entirely via config
    if app.config.json_reliable == -1 {
        return true;
    }

    let now = a.seen;

    if bogus_lat_lon(lat, lon) || mm.cpr.map_or(false, |c| c.lat == 0 && c.lon == 0) {
        mm.pos_ignore = true;
        return false;
    }

    let surface = a.airground_valid.valid()
        && a.airground == AirGround::Ground
        && a.pos_surface
        && mm.cpr.map_or(true, |c| c.typ == CprType::Surface);

    if a.pos_reliable_odd < 1 && a.pos_reliable_even < 1 {
        return true;
    }
    if now > a.position_valid.updated + 120 * SECONDS {
        return true; // no recent reference, assume OK
    }
    if source > a.position_valid.last_source {
        return true; // better quality data overrides
    }

    let elapsed = a.position_valid.age(now);

    let mut speed = if surface { 150.0 } else { 900.0 }; // guess
    if a.gs_valid.valid() {
        // the larger of the current speed and the speed at the last
        // position, plus an allowance growing while the speed is unheard
        speed = a.gs_last_pos.max(a.gs);
        speed += 3.0 * a.gs_valid.age(now) as f64 / 1000.0;
    } else if a.tas_valid.valid() {
        speed = a.tas as f64 * 4.0 / 3.0;
    } else if a.ias_valid.valid() {
        speed = a.ias as f64 * 2.0;
    }

    if source <= Source::Mlat {
        if elapsed > 25 * SECONDS {
            return true;
        }
        speed = (speed * 2.0).min(2400.0);
    }

    // current speed + 1/3; surface clamped 20..150 kt, airborne floor
    // 200 kt
    speed *= 1.3;
    if surface {
        speed = speed.clamp(20.0, 150.0);
    } else if speed < 200.0 {
        speed = 200.0;
    }

    let distance = greatcircle(a.lat, a.lon, lat, lon);

    let mut track_diff = -1.0_f64;
    if !surface
        && distance > 1.0
        && source > Source::Mlat
        && a.track_valid.age(now) < 7 * SECONDS
        && a.position_valid.age(now) < 7 * SECONDS
        && (a.lat != lat || a.lon != lon)
        && a.pos_reliable(app.config.json_reliable)
    {
        let calc_track = bearing(a.lat, a.lon, lat, lon);
        track_diff = norm_diff(a.track - calc_track, 180.0).abs();
        // moving along the known track earns extra allowance, clipped
        // off 90 degrees to the side
        let track_bonus = speed * (90.0 - track_diff) / 90.0;
        speed += track_bonus * (1.1 - a.track_valid.age(now) as f64 / 5000.0);
        if track_diff > 160.0 {
            mm.pos_ignore = true; // do not penalize reliability
        }
    }

    // 100 m surface base distance for minor errors, plus distance
    // covered at the allowed speed over elapsed + 1 s
    let range = if surface { 100.0 } else { 0.0 }
        + (elapsed as f64 + 1000.0) / 1000.0 * (speed * 1852.0 / 3600.0);

    let inrange = distance <= range;

    let focused = app.config.cpr_focus_addr() == Some(a.addr);
    if (!inrange && (app.config.debug_speed_check || app.config.debug_cpr))
        || (focused && distance > 100.0)
    {
        debug!(
            addr = %a.hex(),
            kind = ?kind,
            distance_km = distance / 1000.0,
            allowed_km = range / 1000.0,
            elapsed_s = elapsed as f64 / 1000.0,
            track_diff,
            inrange,
            "speed check"
        );
    }

    if inrange
        && mm.source == Some(Source::Adsb)
        && mm.cpr.map_or(true, |c| c.typ != CprType::Surface)
    {
        let persist = app.config.filter_persistence;
        if a.pos_reliable_odd >= persist * 3 / 4 && a.pos_reliable_even >= persist * 3 / 4 {
            if let Some(client) = &mm.client {
                client.record_position(lat, lon);
            }
        }
    }

    inrange
}

fn set_position(app: &App, a: &mut Aircraft, trace: &mut Trace, mm: &mut Message, now: u64) {
    let (lat, lon) = match mm.decoded {
        Some(d) => (d.lat, d.lon),
        None => return,
    };

    if now < a.seen_pos + 3 * SECONDS && a.lat == lat && a.lon == lon {
        // duplicate positions do not feed the reduced output
        mm.reduce_forward = false;
        mm.duplicate = true;
        mm.pos_ignore = true;
    }

    let addrtype_idx = mm.addr_type.unwrap_or(AddrType::Unknown).index();
    app.stats.with_current(|s| {
        s.pos_by_type[addrtype_idx] += 1;
        s.pos_all += 1;
    });

    if mm.cpr.is_some() && (mm.garbage || mm.pos_bad) {
        app.stats.with_current(|s| s.pos_garbage += 1);
        return;
    }

    if mm.source == Some(Source::Mlat) {
        a.receiver_count_mlat = mm.receiver_count_mlat;
    } else {
        let simple_hash = (mm.receiver_id as u16).max(1);
        a.receiver_ids[a.receiver_ids_next % RECEIVER_ID_RING] = simple_hash;
        a.receiver_ids_next = a.receiver_ids_next.wrapping_add(1);
    }

    if mm.duplicate {
        app.stats.with_current(|s| s.pos_duplicate += 1);
        return;
    }

    if let Some(client) = &mm.client {
        client.positions.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    // derive a track from consecutive positions when nothing reports one
    if a.track_valid.age(now) >= 10 * SECONDS && a.seen_pos != 0 {
        let distance = greatcircle(a.lat, a.lon, lat, lon);
        if distance > 100.0 {
            a.calc_track = bearing(a.lat, a.lon, lat, lon);
        }
        if mm.source == Some(Source::Jaero)
            && (a.position_valid.last_source == Source::Jaero
                || a.position_valid.age(now) >= 30 * MINUTES)
            && a.track_valid.age(now) > TRACK_EXPIRE
            && distance > 10e3
            && accept_data(
                &mut a.track_valid,
                Source::Jaero,
                mm,
                ReduceRate::VeryOften,
                app.reduce_interval(),
            )
        {
            a.track = a.calc_track;
        }
    }

    a.lat = lat;
    a.lon = lon;
    if let Some(d) = mm.decoded {
        a.pos_nic = d.nic;
        a.pos_rc = d.rc;
    }
    a.last_pos_receiver_id = mm.receiver_id;

    if a.pos_reliable(app.config.json_reliable) {
        let new_tile = globe_index(a.lat, a.lon);
        a.globe_index = app.tiles.relink(a.addr, a.globe_index, new_tile);

        if trace.should_add(a, now, app.config.json_trace_interval * 1000) {
            trace.add(a, now);
            mm.json_pos = true;
        }

        // after the trace append so stale detection sees the new point
        a.seen_pos_reliable = now;
        a.lat_reliable = lat;
        a.lon_reliable = lon;
    }

    a.pos_surface = a.airground_valid.valid() && a.airground == AirGround::Ground;

    if mm.json_pos {
        snapshot::json_position_output(app, a, mm);
    }

    if a.pos_reliable_odd >= 2 && a.pos_reliable_even >= 2 && mm.source == Some(Source::Adsb) {
        if let Some((user_lat, user_lon)) = app.receiver_position() {
            let range = greatcircle(user_lat, user_lon, lat, lon);
            app.stats.with_current(|s| {
                s.record_range(range, app.config.max_range_m(), app.config.stats_range)
            });
        }
    }

    a.seen_pos = now;

    // the address type follows the accepted position
    if let Some(t) = mm.addr_type {
        a.addr_type = t;
        a.addrtype_updated = now;
    }
}

fn update_sbs_position(app: &App, a: &mut Aircraft, trace: &mut Trace, mm: &mut Message, now: u64) {
    let (lat, lon) = match mm.sbs_pos {
        Some(p) => p,
        None => return,
    };
    let source = mm.source.unwrap_or(Source::Sbs);

    // JAERO repeats positions; skip ones already in the trace
    let mut old_jaero = false;
    if source == Source::Jaero && !trace.is_empty() {
        let start = trace.len().saturating_sub(10);
        for p in &trace.points[start..] {
            if p.lat == (lat * 1e6).round() as i32 && p.lon == (lon * 1e6).round() as i32 {
                old_jaero = true;
            }
        }
    }

    if old_jaero || greatcircle(a.lat, a.lon, lat, lon) < 1.0 {
        return;
    }

    if source != Source::Prio && !speed_check(app, a, source, lat, lon, mm, CprKind::Direct) {
        mm.pos_bad = true;
        return;
    }

    if accept_data(&mut a.position_valid, source, mm, ReduceRate::VeryOften, app.reduce_interval())
    {
        mm.decoded = Some(DecodedPos { lat, lon, nic: 0, rc: RC_UNKNOWN });
        increment_reliable(app, a, mm, now, 2);
        set_position(app, a, trace, mm, now);

        if a.messages < 2 {
            a.messages = 2;
        }
        a.signal_level = [0.0; SIGNAL_RING];
        a.no_signal_count = 10;
    }
}

fn increment_reliable(app: &App, a: &mut Aircraft, mm: &Message, now: u64, odd: u8) {
    a.seen_pos_global = now;

    let json_reliable = app.config.json_reliable.max(1);
    let source = mm.source.unwrap_or(Source::Invalid);

    if source > Source::Jaero
        && a.seen_pos_reliable != 0
        && now > a.seen_pos_reliable + POS_RELIABLE_TIMEOUT
        && a.pos_reliable_odd <= 0
        && a.pos_reliable_even <= 0
    {
        if let Some(d) = mm.decoded {
            let distance = greatcircle(a.lat_reliable, a.lon_reliable, d.lat, d.lon);
            // within 12 km of the last reliable position after a two
            // minute gap is under 194 kt; trust it immediately
            if distance < 12e3 {
                a.pos_reliable_odd = json_reliable;
                a.pos_reliable_even = json_reliable;
                return;
            }
        }
    }

    if a.pos_reliable_odd <= 0 || a.pos_reliable_even <= 0 {
        a.pos_reliable_odd = 1;
        a.pos_reliable_even = 1;
        return;
    }

    let cap = app.config.filter_persistence;
    if odd == 1 {
        a.pos_reliable_odd = (a.pos_reliable_odd + 1).min(cap);
    }
    if odd == 0 || odd == 2 {
        a.pos_reliable_even = (a.pos_reliable_even + 1).min(cap);
    }
}

fn position_bad(app: &App, mm: &Message, a: &mut Aircraft) {
    if mm.garbage || mm.pos_ignore {
        return;
    }
    if mm.source.unwrap_or(Source::Invalid) < a.position_valid.source {
        return;
    }

    app.stats.with_current(|s| s.cpr_global_bad += 1);

    a.pos_reliable_odd -= 1;
    a.pos_reliable_even -= 1;

    if a.pos_reliable_odd <= 0 || a.pos_reliable_even <= 0 {
        a.position_valid.invalidate();
        a.pos_reliable_odd = 0;
        a.pos_reliable_even = 0;
        a.cpr_odd.valid.invalidate();
        a.cpr_even.valid.invalidate();
    }
}

/// Wind vector from TAS / GS / track / true heading, all fresh.
fn calc_wind(a: &mut Aircraft, now: u64) {
    if !a.position_valid.valid() || a.airground == AirGround::Ground {
        return;
    }
    if a.tas_valid.age(now) > TRACK_WT_TIMEOUT
        || a.gs_valid.age(now) > TRACK_WT_TIMEOUT
        || a.track_valid.age(now) > TRACK_WT_TIMEOUT / 2
        || a.true_heading_valid.age(now) > TRACK_WT_TIMEOUT / 2
    {
        return;
    }

    let trk = a.track.to_radians();
    let hdg = a.true_heading.to_radians();
    let tas = a.tas as f64;
    let gs = a.gs;
    let crab = norm_diff(hdg - trk, std::f64::consts::PI);

    let hw = tas - crab.cos() * gs;
    let cw = crab.sin() * gs;
    let ws = (hw * hw + cw * cw).sqrt();
    let wd = norm_angle(hdg + cw.atan2(hw), std::f64::consts::PI).to_degrees();

    if ws > 250.0 {
        // wildly unrealistic
        return;
    }
    a.wind_speed = ws;
    a.wind_direction = wd;
    a.wind_updated = now;
    a.wind_altitude = a.altitude_baro;
}

/// Outside/total air temperature from Mach and TAS.
fn calc_temp(a: &mut Aircraft, now: u64) {
    if a.airground == AirGround::Ground {
        return;
    }
    if a.tas_valid.age(now) > TRACK_WT_TIMEOUT || a.mach_valid.age(now) > TRACK_WT_TIMEOUT {
        return;
    }
    if a.mach < 0.395 {
        return;
    }

    let fraction = a.tas as f64 / 661.47 / a.mach;
    let oat = fraction * fraction * 288.15 - 273.15;
    let tat = -273.15 + (oat + 273.15) * (1.0 + 0.2 * a.mach * a.mach);

    a.oat = oat;
    a.tat = tat;
    a.oat_updated = now;
}

fn compute_nic(metype: u8, version: i8, nic_a: bool, nic_b: bool, nic_c: bool) -> u8 {
    match metype {
        5 | 9 | 20 => 11,
        6 | 10 | 21 => 10,
        7 => {
            if version == 2 {
                if nic_a && !nic_c {
                    9
                } else {
                    8
                }
            } else if version == 1 {
                if nic_a {
                    9
                } else {
                    8
                }
            } else {
                8
            }
        }
        8 => {
            if version == 2 {
                if nic_a && nic_c {
                    7
                } else if nic_a != nic_c {
                    6
                } else {
                    0
                }
            } else {
                0
            }
        }
        11 => {
            if version == 2 {
                if nic_a && nic_b {
                    9
                } else {
                    8
                }
            } else if version == 1 {
                if nic_a {
                    9
                } else {
                    8
                }
            } else {
                8
            }
        }
        12 => 7,
        13 => 6,
        14 => 5,
        15 => 4,
        16 => {
            if nic_a && nic_b {
                3
            } else {
                2
            }
        }
        17 => 1,
        _ => 0,
    }
}

fn compute_rc(metype: u8, version: i8, nic_a: bool, nic_b: bool, nic_c: bool) -> u32 {
    match metype {
        5 | 9 | 20 => 8, // 7.5 m
        6 | 10 | 21 => 25,
        7 => {
            if version == 2 {
                if nic_a && !nic_c {
                    75
                } else {
                    186 // 0.1 NM
                }
            } else if version == 1 {
                if nic_a {
                    75
                } else {
                    186
                }
            } else {
                186
            }
        }
        8 => {
            if version == 2 {
                if nic_a && nic_c {
                    371 // 0.2 NM
                } else if nic_a && !nic_c {
                    556 // 0.3 NM
                } else if !nic_a && nic_c {
                    926 // 0.5 NM
                } else {
                    RC_UNKNOWN
                }
            } else {
                RC_UNKNOWN
            }
        }
        11 => {
            if version == 2 {
                if nic_a && nic_b {
                    75
                } else {
                    186
                }
            } else if version == 1 {
                if nic_a {
                    75
                } else {
                    186
                }
            } else {
                186
            }
        }
        12 => 371,
        13 => {
            if version == 2 {
                if !nic_a && nic_b {
                    556
                } else if !nic_a && !nic_b {
                    926
                } else if nic_a && nic_b {
                    1112 // 0.6 NM
                } else {
                    RC_UNKNOWN
                }
            } else if version == 1 {
                if nic_a {
                    1112
                } else {
                    926
                }
            } else {
                926
            }
        }
        14 => 1852, // 1 NM
        15 => 3704, // 2 NM
        16 => {
            if version == 2 {
                if nic_a && nic_b {
                    7408 // 4 NM
                } else {
                    14_816 // 8 NM
                }
            } else if version == 1 {
                if nic_a {
                    7408
                } else {
                    14_816
                }
            } else {
                18_520 // 10 NM
            }
        }
        17 => 37_040, // 20 NM
        _ => RC_UNKNOWN,
    }
}

fn compute_nic_rc_from_message(mm: &Message, a: &Aircraft) -> (u8, u32) {
    let nic_a = a.nic_a_valid.valid() && a.nic_a;
    let nic_b = mm.accuracy.nic_b.unwrap_or(false);
    let nic_c = a.nic_c_valid.valid() && a.nic_c;

    (
        compute_nic(mm.metype, a.adsb_version, nic_a, nic_b, nic_c),
        compute_rc(mm.metype, a.adsb_version, nic_a, nic_b, nic_c),
    )
}

/// ED-102A Table N-7: NACp implied by a v0 position message type.
fn compute_v0_nacp(mm: &Message) -> Option<u8> {
    if mm.df != 17 && mm.df != 18 {
        return None;
    }
    match mm.metype {
        0 | 8 | 18 | 22 => Some(0),
        5 | 9 | 20 => Some(11),
        6 | 10 | 21 => Some(10),
        7 | 11 => Some(8),
        12 => Some(7),
        13 => Some(6),
        14 => Some(5),
        15 => Some(4),
        16 | 17 => Some(1),
        _ => None,
    }
}

/// ED-102A Table N-8: SIL implied by a v0 position message type.
fn compute_v0_sil(mm: &Message) -> Option<u8> {
    if mm.df != 17 && mm.df != 18 {
        return None;
    }
    match mm.metype {
        0 | 18 | 22 => Some(0),
        5..=17 | 20 | 21 => Some(2),
        _ => None,
    }
}

//
// Periodic maintenance
//

/// Per-field staleness and expiry plus position reliability decay.
pub fn update_validities(app: &App, a: &mut Aircraft, now: u64) {
    a.receiver_ids[a.receiver_ids_next % RECEIVER_ID_RING] = 0;
    a.receiver_ids_next = a.receiver_ids_next.wrapping_add(1);

    let jaero_expire = app.config.jaero_timeout * MINUTES;
    if a.globe_index >= 0 && now > a.seen_pos + jaero_expire + MINUTES {
        a.globe_index = app.tiles.relink(a.addr, a.globe_index, TILE_NONE);
    }

    if now > a.category_updated + 2 * HOURS {
        a.category = 0;
    }

    a.callsign_valid.update(now, TRACK_EXPIRE_LONG);
    a.squawk_valid.update(now, TRACK_EXPIRE_LONG);
    a.airground_valid.update(now, TRACK_EXPIRE_LONG);
    a.altitude_baro_valid.update(now, TRACK_EXPIRE);
    a.altitude_geom_valid.update(now, TRACK_EXPIRE);
    a.geom_delta_valid.update(now, TRACK_EXPIRE);
    a.gs_valid.update(now, TRACK_EXPIRE);
    a.ias_valid.update(now, TRACK_EXPIRE);
    a.tas_valid.update(now, TRACK_EXPIRE);
    a.mach_valid.update(now, TRACK_EXPIRE);
    a.track_valid.update(now, TRACK_EXPIRE);
    a.track_rate_valid.update(now, TRACK_EXPIRE);
    a.roll_valid.update(now, TRACK_EXPIRE);
    a.mag_heading_valid.update(now, TRACK_EXPIRE);
    a.true_heading_valid.update(now, TRACK_EXPIRE);
    a.baro_rate_valid.update(now, TRACK_EXPIRE);
    a.geom_rate_valid.update(now, TRACK_EXPIRE);
    a.nav_qnh_valid.update(now, TRACK_EXPIRE);
    a.nav_altitude_mcp_valid.update(now, TRACK_EXPIRE);
    a.nav_altitude_fms_valid.update(now, TRACK_EXPIRE);
    a.nav_altitude_src_valid.update(now, TRACK_EXPIRE);
    a.nav_heading_valid.update(now, TRACK_EXPIRE);
    a.nav_modes_valid.update(now, TRACK_EXPIRE);
    a.emergency_valid.update(now, TRACK_EXPIRE);
    a.alert_valid.update(now, TRACK_EXPIRE);
    a.spi_valid.update(now, TRACK_EXPIRE);
    a.cpr_odd.valid.update(now, TRACK_EXPIRE);
    a.cpr_even.valid.update(now, TRACK_EXPIRE);
    a.position_valid.update(now, TRACK_EXPIRE);
    a.nic_a_valid.update(now, TRACK_EXPIRE);
    a.nic_c_valid.update(now, TRACK_EXPIRE);
    a.nic_baro_valid.update(now, TRACK_EXPIRE);
    a.nac_p_valid.update(now, TRACK_EXPIRE);
    a.nac_v_valid.update(now, TRACK_EXPIRE);
    a.sil_valid.update(now, TRACK_EXPIRE);
    a.gva_valid.update(now, TRACK_EXPIRE);
    a.sda_valid.update(now, TRACK_EXPIRE);

    // reset position reliability when positions stop coming
    if a.position_valid.age(now) > POS_RELIABLE_TIMEOUT || now > a.seen_pos_global + 10 * MINUTES {
        a.pos_reliable_odd = 0;
        a.pos_reliable_even = 0;
    }

    if !a.altitude_baro_valid.valid() {
        a.alt_reliable = 0;
    }
}

/// TTL-based removal for one shard of the registry, plus per-aircraft
/// maintenance for the survivors.
pub fn remove_stale_shard(app: &App, part: usize, parts: usize, now: u64) {
    let mut nonicao_timeout = now.saturating_sub(HOURS);
    let mut pos_timeout = now.saturating_sub(HOURS);
    if app.config.json_globe_index {
        pos_timeout = now.saturating_sub(26 * HOURS);
        nonicao_timeout = now.saturating_sub(26 * HOURS);
    }
    if app.config.state_dir.is_some() || app.config.globe_history_dir.is_some() {
        pos_timeout = now.saturating_sub(14 * 24 * HOURS);
    }
    let nopos_timeout = now.saturating_sub(5 * MINUTES);
    let keep_traces = app.config.keep_traces * HOURS;

    for addr in app.store.addresses_part(part, parts) {
        let slot = match app.store.get(addr) {
            Some(s) => s,
            None => continue,
        };
        let mut guard = slot.lock().unwrap();
        let crate::store::Slot { ac: a, trace } = &mut *guard;

        let non_icao = a.non_icao();
        let expired = if a.seen_pos == 0 {
            a.seen < nopos_timeout
        } else {
            a.seen_pos < pos_timeout || (non_icao && a.seen_pos < nonicao_timeout)
        };

        if expired {
            if a.messages == 1 {
                app.stats.with_current(|s| s.single_message_aircraft += 1);
            }
            a.globe_index = app.tiles.relink(a.addr, a.globe_index, TILE_NONE);
            drop(guard);
            app.store.remove(addr);
        } else {
            update_validities(app, a, now);
            if keep_traces > 0 && !trace.is_empty() {
                trace.maintain(now, keep_traces);
            }
        }
    }
}

/// Correlate raw Mode A/C replies with Mode S tracks: squawk matches set
/// `mode_a_hit`, altitude matches (within 100 ft) set `mode_c_hit`.
pub fn match_modeac(app: &App, now: u64) {
    let mut state = app.modeac.lock().unwrap();
    state.matched = [0; 4096];

    app.store.for_each(|_, slot| {
        let mut guard = slot.lock().unwrap();
        let a = &mut guard.ac;
        if now.saturating_sub(a.seen) > 5 * SECONDS {
            return;
        }

        if a.squawk_valid.valid() {
            let i = modeac::mode_a_to_index(a.squawk);
            if state.count[i].wrapping_sub(state.lastcount[i]) >= modeac::MODEAC_MIN_MESSAGES {
                a.mode_a_hit = true;
                state.matched[i] = if state.matched[i] != 0 { u32::MAX } else { a.addr };
            }
        }

        if a.altitude_baro_valid.valid() {
            let mode_c = (a.altitude_baro + 49) / 100;
            for candidate in [mode_c, mode_c + 1, mode_c - 1] {
                if let Some(mode_a) = state.mode_c_to_mode_a(candidate) {
                    let i = modeac::mode_a_to_index(mode_a);
                    if state.count[i].wrapping_sub(state.lastcount[i])
                        >= modeac::MODEAC_MIN_MESSAGES
                    {
                        a.mode_c_hit = true;
                        state.matched[i] = if state.matched[i] != 0 { u32::MAX } else { a.addr };
                    }
                }
            }
        }
    });

    for i in 0..4096 {
        if state.count[i] == 0 {
            continue;
        }
        if state.count[i].wrapping_sub(state.lastcount[i]) < modeac::MODEAC_MIN_MESSAGES {
            state.age[i] += 1;
            if state.age[i] > 15 {
                state.count[i] = 0;
                state.lastcount[i] = 0;
                state.age[i] = 0;
                continue;
            }
        } else {
            // matched codes start old so they age out quickly once the
            // Mode S data disappears
            state.age[i] = if state.matched[i] != 0 { 10 } else { 0 };
        }
        state.lastcount[i] = state.count[i];
    }
}

/// Log maintenance spikes, rate limited.
pub fn log_slow_sweep(anti_spam: &mut AntiSpam, elapsed_ms: u64, now: u64) {
    if elapsed_ms > 50 && anti_spam.allow(now) {
        tracing::warn!(elapsed_ms, "high load: stale sweep took too long, suppressing for 30s");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::modes::cpr::testenc::encode_airborne;
    use crate::modes::message::{CprFrame, OpStatus};

    fn df17_msg(addr: u32, now: u64) -> Message {
        let mut mm = Message::new(now);
        mm.df = 17;
        mm.addr = addr;
        mm.addr_type = Some(AddrType::AdsbIcao);
        mm.source = Some(Source::Adsb);
        mm.signal_level = 0.2;
        mm
    }

    fn position_msg(addr: u32, now: u64, lat: f64, lon: f64, odd: bool, alt: i32) -> Message {
        let mut mm = df17_msg(addr, now);
        mm.metype = 11;
        let (cpr_lat, cpr_lon) = encode_airborne(lat, lon, odd);
        mm.cpr =
            Some(CprFrame { odd, typ: CprType::Airborne, lat: cpr_lat, lon: cpr_lon, nucp: 7 });
        mm.altitude_baro = Some(alt);
        mm.alt_q_bit = true;
        mm.airground = AirGround::Airborne;
        mm
    }

    fn feed_global_pair(app: &App, addr: u32, t0: u64, lat: f64, lon: f64, alt: i32) {
        let mut even = position_msg(addr, t0, lat, lon, false, alt);
        update_from_message(app, &mut even);
        let mut odd = position_msg(addr, t0 + 2000, lat, lon, true, alt);
        update_from_message(app, &mut odd);
    }

    #[test]
    fn test_creation_requires_reliable_address() {
        let app = App::for_tests();
        let now = 1_000_000;

        // DF4 replies cannot create a track
        let mut mm = Message::new(now);
        mm.df = 4;
        mm.addr = 0x4b1803;
        mm.source = Some(Source::ModeS);
        mm.altitude_baro = Some(30_000);
        assert!(update_from_message(&app, &mut mm).is_none());
        assert_eq!(app.store.len(), 0);

        // DF17 can
        let mut mm = df17_msg(0x4b1803, now);
        assert!(update_from_message(&app, &mut mm).is_some());
        assert_eq!(app.store.len(), 1);

        // and now the DF4 updates the existing record
        let mut mm = Message::new(now + 1000);
        mm.df = 4;
        mm.addr = 0x4b1803;
        mm.source = Some(Source::ModeS);
        mm.altitude_baro = Some(30_000);
        assert!(update_from_message(&app, &mut mm).is_some());
    }

    #[test]
    fn test_trust_window_expires() {
        let app = App::for_tests();
        let now = 1_000_000;
        let mut mm = df17_msg(0xa0a0a0, now);
        update_from_message(&app, &mut mm);

        // untrusted update inside the window works
        let mut mm = Message::new(now + 30_000);
        mm.df = 4;
        mm.addr = 0xa0a0a0;
        mm.source = Some(Source::ModeS);
        mm.altitude_baro = Some(10_000);
        assert!(update_from_message(&app, &mut mm).is_some());

        // beyond 45 s it is refused
        let mut mm = Message::new(now + 50_000);
        mm.df = 4;
        mm.addr = 0xa0a0a0;
        mm.source = Some(Source::ModeS);
        mm.altitude_baro = Some(10_000);
        assert!(update_from_message(&app, &mut mm).is_none());
    }

    #[test]
    fn test_global_airborne_decode() {
        let app = App::for_tests();
        let addr = 0x4b1803;
        let t0 = 1_700_000_000_000;
        let lat = 47.994;
        let lon = 7.852;

        feed_global_pair(&app, addr, t0, lat, lon, 36_000);

        let slot = app.store.get(addr).unwrap();
        let guard = slot.lock().unwrap();
        let a = &guard.ac;
        assert!(a.position_valid.valid());
        assert!((a.lat - lat).abs() < 0.001, "lat {}", a.lat);
        assert!((a.lon - lon).abs() < 0.001, "lon {}", a.lon);
        assert_eq!(a.pos_reliable_odd, 1);
        assert_eq!(a.pos_reliable_even, 1);
        assert_eq!(guard.trace.len(), 1);
        assert_eq!(a.altitude_baro, 36_000);
        assert!(a.globe_index >= 0);
        assert!(app.tiles.contains(a.globe_index, addr));
    }

    #[test]
    fn test_global_needs_fresh_pair() {
        let app = App::for_tests();
        let addr = 0x4b1804;
        let t0 = 1_700_000_000_000;

        // single even frame: no pair yet, no position
        let mut even = position_msg(addr, t0, 47.994, 7.852, false, 36_000);
        update_from_message(&app, &mut even);
        {
            let slot = app.store.get(addr).unwrap();
            assert!(!slot.lock().unwrap().ac.position_valid.valid());
        }

        // the odd frame arrives 15 s later: beyond the 10 s airborne
        // pairing window, so still no global decode
        let mut odd = position_msg(addr, t0 + 15_000, 47.994, 7.852, true, 36_000);
        update_from_message(&app, &mut odd);
        let slot = app.store.get(addr).unwrap();
        let guard = slot.lock().unwrap();
        assert!(!guard.ac.position_valid.valid());
        assert_eq!(guard.ac.pos_reliable_odd, 0);
        assert_eq!(guard.trace.len(), 0);
    }

    #[test]
    fn test_mlat_downgrade_guard() {
        let app = App::for_tests();
        let addr = 0x4b1803;
        let t0 = 1_700_000_000_000;
        feed_global_pair(&app, addr, t0, 47.994, 7.852, 36_000);

        // an MLAT position 400 km away right afterwards
        let mut mm = Message::new(t0 + 4000);
        mm.df = 17;
        mm.addr = addr;
        mm.sbs_in = true;
        mm.source = Some(Source::Mlat);
        mm.addr_type = Some(AddrType::Mlat);
        mm.sbs_pos = Some((51.6, 7.852));
        update_from_message(&app, &mut mm);
        assert!(mm.pos_bad);

        let slot = app.store.get(addr).unwrap();
        let guard = slot.lock().unwrap();
        let a = &guard.ac;
        // position unchanged, still ADS-B sourced; the worse source
        // cannot decrement reliability either
        assert!((a.lat - 47.994).abs() < 0.001);
        assert_eq!(a.position_valid.source, Source::Adsb);
        assert_eq!(a.pos_reliable_odd, 1);
        assert_eq!(a.pos_reliable_even, 1);
    }

    #[test]
    fn test_speed_check_reject_decrements() {
        let app = App::for_tests();
        let addr = 0x3c6444;
        let t0 = 1_700_000_000_000;
        // build up reliability with two pairs
        feed_global_pair(&app, addr, t0, 47.994, 7.852, 34_000);
        feed_global_pair(&app, addr, t0 + 5_000, 47.998, 7.860, 34_000);
        {
            let slot = app.store.get(addr).unwrap();
            let guard = slot.lock().unwrap();
            assert!(guard.ac.pos_reliable_odd >= 2);
            assert!(guard.ac.pos_reliable_even >= 2);
        }
        let (odd_before, even_before) = {
            let slot = app.store.get(addr).unwrap();
            let guard = slot.lock().unwrap();
            (guard.ac.pos_reliable_odd, guard.ac.pos_reliable_even)
        };

        // ~10 degrees north a few seconds later: thousands of knots
        let mut mm = position_msg(addr, t0 + 15_000, 57.99, 7.852, false, 34_000);
        update_from_message(&app, &mut mm);
        let mut mm = position_msg(addr, t0 + 15_500, 57.99, 7.852, true, 34_000);
        update_from_message(&app, &mut mm);
        assert!(mm.pos_bad);

        let slot = app.store.get(addr).unwrap();
        let guard = slot.lock().unwrap();
        let a = &guard.ac;
        // position kept, reliability decremented on both counters
        assert!((a.lat - 47.998).abs() < 0.01, "lat {}", a.lat);
        assert_eq!(a.pos_reliable_odd, odd_before - 1);
        assert_eq!(a.pos_reliable_even, even_before - 1);
    }

    #[test]
    fn test_altitude_fusion_reject_and_recover() {
        let app = App::for_tests();
        let addr = 0x3c0000;
        let t0: u64 = 1_700_000_000_000;

        // establish altitude and a zero baro rate
        let mut mm = df17_msg(addr, t0);
        mm.altitude_baro = Some(30_000);
        mm.alt_q_bit = true;
        mm.baro_rate = Some(0);
        update_from_message(&app, &mut mm);
        for k in 1..6u64 {
            let mut mm = df17_msg(addr, t0 + k * 1000);
            mm.altitude_baro = Some(30_000);
            mm.alt_q_bit = true;
            update_from_message(&app, &mut mm);
        }
        let reliable_before = {
            let slot = app.store.get(addr).unwrap();
            let guard = slot.lock().unwrap();
            assert_eq!(guard.ac.altitude_baro, 30_000);
            guard.ac.alt_reliable
        };
        assert!(reliable_before >= 5);

        // implausible 5000 ft jump one second later
        let mut mm = df17_msg(addr, t0 + 6_000);
        mm.altitude_baro = Some(35_000);
        mm.alt_q_bit = true;
        update_from_message(&app, &mut mm);
        {
            let slot = app.store.get(addr).unwrap();
            let guard = slot.lock().unwrap();
            assert_eq!(guard.ac.altitude_baro, 30_000, "altitude must be unchanged");
            assert!(guard.ac.alt_reliable < reliable_before);
        }

        // consistent observations restore the counter
        for k in 0..3u64 {
            let mut mm = df17_msg(addr, t0 + 8_000 + k * 1000);
            mm.altitude_baro = Some(30_000);
            mm.alt_q_bit = true;
            update_from_message(&app, &mut mm);
        }
        let slot = app.store.get(addr).unwrap();
        let guard = slot.lock().unwrap();
        assert_eq!(guard.ac.altitude_baro, 30_000);
        assert!(guard.ac.alt_reliable >= reliable_before);
    }

    #[test]
    fn test_duplicate_position_suppressed() {
        let app = App::for_tests();
        let addr = 0x4ca123;
        let t0 = 1_700_000_000_000;
        feed_global_pair(&app, addr, t0, 47.994, 7.852, 36_000);
        let (trace_len, odd_before) = {
            let guard = app.store.get(addr).unwrap();
            let guard = guard.lock().unwrap();
            (guard.trace.len(), guard.ac.pos_reliable_odd)
        };

        // the same odd frame repeated one second later
        let mut mm = position_msg(addr, t0 + 3_000, 47.994, 7.852, true, 36_000);
        update_from_message(&app, &mut mm);
        assert!(mm.duplicate);
        assert!(!mm.reduce_forward);

        let slot = app.store.get(addr).unwrap();
        let guard = slot.lock().unwrap();
        assert_eq!(guard.trace.len(), trace_len, "no trace append for duplicates");
        // the reliability increment was rolled back with the scratch
        assert_eq!(guard.ac.pos_reliable_odd, odd_before);
    }

    #[test]
    fn test_airground_surface_cpr_pins_state() {
        let app = App::for_tests();
        let addr = 0x111111;
        let now = 1_700_000_000_000;

        let mut mm = df17_msg(addr, now);
        mm.airground = AirGround::Ground;
        mm.cpr = Some(CprFrame { odd: false, typ: CprType::Surface, lat: 1, lon: 1, nucp: 8 });
        update_from_message(&app, &mut mm);

        // a plain airborne claim shortly after does not flip the state
        let mut mm = df17_msg(addr, now + 5_000);
        mm.airground = AirGround::Airborne;
        update_from_message(&app, &mut mm);

        let slot = app.store.get(addr).unwrap();
        let guard = slot.lock().unwrap();
        assert_eq!(guard.ac.airground, AirGround::Ground);
    }

    #[test]
    fn test_heading_disambiguation_via_opstatus() {
        let app = App::for_tests();
        let addr = 0x222222;
        let now = 1_700_000_000_000;

        // opstatus says deferred headings are true headings
        let mut mm = df17_msg(addr, now);
        mm.opstatus = Some(OpStatus {
            version: 2,
            hrd: Some(HeadingType::True),
            tah: Some(HeadingType::GroundTrack),
        });
        update_from_message(&app, &mut mm);

        let mut mm = df17_msg(addr, now + 1000);
        mm.heading = Some((185.0, HeadingType::MagneticOrTrue));
        update_from_message(&app, &mut mm);

        let slot = app.store.get(addr).unwrap();
        let guard = slot.lock().unwrap();
        assert!(guard.ac.true_heading_valid.valid());
        assert!((guard.ac.true_heading - 185.0).abs() < 0.01);
        assert!(!guard.ac.mag_heading_valid.valid());
    }

    #[test]
    fn test_remove_stale_no_position() {
        let app = App::for_tests();
        let now = 1_700_000_000_000;
        let mut mm = df17_msg(0x333333, now);
        update_from_message(&app, &mut mm);
        assert_eq!(app.store.len(), 1);

        // not yet
        for p in 0..4 {
            remove_stale_shard(&app, p, 4, now + 4 * MINUTES);
        }
        assert_eq!(app.store.len(), 1);

        // 5 minutes without a position: gone
        for p in 0..4 {
            remove_stale_shard(&app, p, 4, now + 5 * MINUTES + SECONDS);
        }
        assert_eq!(app.store.len(), 0);
    }

    #[test]
    fn test_remove_stale_unlinks_tile() {
        let app = App::for_tests();
        let addr = 0x444444;
        let t0 = 1_700_000_000_000;
        feed_global_pair(&app, addr, t0, 47.994, 7.852, 30_000);
        let tile = app.store.get(addr).unwrap().lock().unwrap().ac.globe_index;
        assert!(app.tiles.contains(tile, addr));

        for p in 0..4 {
            remove_stale_shard(&app, p, 4, t0 + 2 * HOURS);
        }
        assert_eq!(app.store.len(), 0);
        assert!(!app.tiles.contains(tile, addr));
    }

    #[test]
    fn test_validity_reset_after_quiet_period() {
        let app = App::for_tests();
        let addr = 0x555555;
        let t0 = 1_700_000_000_000;
        feed_global_pair(&app, addr, t0, 47.994, 7.852, 30_000);

        let slot = app.store.get(addr).unwrap();
        let mut guard = slot.lock().unwrap();
        let crate::store::Slot { ac: a, .. } = &mut *guard;
        update_validities(&app, a, t0 + 3 * MINUTES);
        assert_eq!(a.pos_reliable_odd, 0);
        assert_eq!(a.pos_reliable_even, 0);
        assert!(!a.position_valid.valid(), "expired after the track timeout");
    }

    #[test]
    fn test_wind_calculation() {
        let now = 1_700_000_000_000;
        let mut a = Aircraft::new(0x666666, now);
        a.position_valid.source = Source::Adsb;
        a.position_valid.updated = now;
        a.airground = AirGround::Airborne;
        a.tas = 450;
        a.tas_valid.source = Source::Adsb;
        a.tas_valid.updated = now;
        a.gs = 400.0;
        a.gs_valid.source = Source::Adsb;
        a.gs_valid.updated = now;
        a.track = 90.0;
        a.track_valid.source = Source::Adsb;
        a.track_valid.updated = now;
        a.true_heading = 90.0;
        a.true_heading_valid.source = Source::Adsb;
        a.true_heading_valid.updated = now;

        calc_wind(&mut a, now);
        assert_eq!(a.wind_updated, now);
        // pure headwind: 50 kt out of the east
        assert!((a.wind_speed - 50.0).abs() < 0.5, "ws {}", a.wind_speed);
        assert!((a.wind_direction - 90.0).abs() < 1.0, "wd {}", a.wind_direction);
    }

    #[test]
    fn test_temp_calculation() {
        let now = 1_700_000_000_000;
        let mut a = Aircraft::new(0x777777, now);
        a.airground = AirGround::Airborne;
        a.tas = 450;
        a.tas_valid.source = Source::Adsb;
        a.tas_valid.updated = now;
        a.mach = 0.78;
        a.mach_valid.source = Source::Adsb;
        a.mach_valid.updated = now;

        calc_temp(&mut a, now);
        assert_eq!(a.oat_updated, now);
        // cold aloft
        assert!(a.oat < -30.0 && a.oat > -80.0, "oat {}", a.oat);
        assert!(a.tat > a.oat);
    }

    #[test]
    fn test_mode_ac_counted_and_matched() {
        let app = App::for_tests();
        let now = 1_700_000_000_000;

        // a Mode S track squawking 1234
        let mut mm = df17_msg(0x888888, now);
        mm.squawk = Some(0x1234);
        update_from_message(&app, &mut mm);

        // raw Mode A replies for the same code
        for _ in 0..5 {
            let mut mm = Message::new(now);
            mm.df = 32;
            mm.squawk = Some(0x1234);
            assert!(update_from_message(&app, &mut mm).is_none());
        }

        match_modeac(&app, now);
        let slot = app.store.get(0x888888).unwrap();
        assert!(slot.lock().unwrap().ac.mode_a_hit);
    }

    #[test]
    fn test_v0_nacp_sil_synthesis() {
        let app = App::for_tests();
        let now = 1_700_000_000_000;
        let mut mm = position_msg(0x999999, now, 47.994, 7.852, false, 30_000);
        update_from_message(&app, &mut mm);

        let slot = app.store.get(0x999999).unwrap();
        let guard = slot.lock().unwrap();
        assert_eq!(guard.ac.nac_p, 8);
        assert_eq!(guard.ac.sil, 2);
    }

    #[test]
    fn test_field_timestamp_follows_latest_accept() {
        let app = App::for_tests();
        let addr = 0xaaaaaa;
        let t1 = 1_700_000_000_000;
        let t2 = t1 + 700;

        let mut m1 = df17_msg(addr, t1);
        m1.gs_v0 = Some(400.0);
        update_from_message(&app, &mut m1);
        let mut m2 = df17_msg(addr, t2);
        m2.gs_v0 = Some(401.0);
        update_from_message(&app, &mut m2);

        let slot = app.store.get(addr).unwrap();
        let guard = slot.lock().unwrap();
        assert_eq!(guard.ac.gs_valid.updated, t2);
        assert_eq!(guard.ac.gs, 401.0);
    }
}
