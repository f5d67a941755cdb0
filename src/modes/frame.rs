// Mode S frame decoding: a pure function from raw bytes + signal level to
// a Message. CRC-correcting repair is not attempted here; frames that do
// not verify are rejected and counted by the caller.

use std::fmt;

use super::altitude::{ac12_q_bit, ac13_q_bit, decode_ac12, decode_ac13};
use super::crc;
use super::message::*;

const AIS_CHARSET: &[u8; 64] =
    b"?ABCDEFGHIJKLMNOPQRSTUVWXYZ????? ???????????????0123456789??????";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Frame length is not 7 or 14 bytes.
    BadLength,
    /// CRC does not verify for a format that requires it.
    BadCrc,
    /// Downlink format we do not handle.
    UnknownFormat,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::BadLength => write!(f, "bad frame length"),
            FrameError::BadCrc => write!(f, "crc failed"),
            FrameError::UnknownFormat => write!(f, "unknown downlink format"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Extract bits firstbit..=lastbit (1-based, MSB first) from a byte field.
fn getbits(data: &[u8], firstbit: usize, lastbit: usize) -> u32 {
    let mut result: u32 = 0;
    for bit in firstbit..=lastbit {
        result <<= 1;
        let byte = (bit - 1) / 8;
        let mask = 0x80 >> ((bit - 1) % 8);
        if data[byte] & mask != 0 {
            result |= 1;
        }
    }
    result
}

fn getbit(data: &[u8], bit: usize) -> bool {
    getbits(data, bit, bit) != 0
}

/// Decode one raw Mode S frame. The caller supplies the signal level and
/// fills in timestamps, source overrides and the client handle afterwards.
pub fn decode_frame(bytes: &[u8], signal_level: f64) -> Result<Message, FrameError> {
    if bytes.len() != 7 && bytes.len() != 14 {
        return Err(FrameError::BadLength);
    }

    let df = bytes[0] >> 3;
    if (df < 16 && bytes.len() != 7) || (df >= 16 && bytes.len() != 14) {
        return Err(FrameError::BadLength);
    }

    let mut mm = Message::default();
    mm.df = df;
    mm.signal_level = signal_level;
    mm.set_raw(bytes);
    mm.crc = crc::residual(bytes);

    match df {
        0 | 16 => {
            // short/long air-air surveillance: address is in the parity
            mm.addr = mm.crc;
            mm.addr_type = Some(AddrType::ModeS);
            mm.source = Some(Source::ModeS);
            let vs = bytes[0] & 0x04 != 0;
            mm.airground = if vs { AirGround::Ground } else { AirGround::Uncertain };
            let ac13 = (((bytes[2] as u16) & 0x1f) << 8) | bytes[3] as u16;
            if let Some(alt) = decode_ac13(ac13) {
                mm.altitude_baro = Some(alt);
                mm.alt_q_bit = ac13_q_bit(ac13);
            }
        }

        4 | 5 | 20 | 21 => {
            mm.addr = mm.crc;
            mm.addr_type = Some(AddrType::ModeS);
            mm.source = Some(Source::ModeS);
            decode_fs(&mut mm, bytes[0] & 0x07);
            if df == 4 || df == 20 {
                let ac13 = (((bytes[2] as u16) & 0x1f) << 8) | bytes[3] as u16;
                if let Some(alt) = decode_ac13(ac13) {
                    mm.altitude_baro = Some(alt);
                    mm.alt_q_bit = ac13_q_bit(ac13);
                }
            } else {
                let id13 = (((bytes[2] as u16) & 0x1f) << 8) | bytes[3] as u16;
                mm.squawk = Some(decode_id13(id13));
            }
            if df == 20 || df == 21 {
                decode_commb(&mut mm, &bytes[4..11]);
            }
        }

        11 => {
            // all-call reply: parity is overlaid with the interrogator id
            if mm.crc & 0xffff80 != 0 {
                return Err(FrameError::BadCrc);
            }
            mm.iid = mm.crc;
            mm.addr = ((bytes[1] as u32) << 16) | ((bytes[2] as u32) << 8) | bytes[3] as u32;
            mm.addr_type = Some(AddrType::ModeS);
            mm.source = Some(if mm.iid == 0 { Source::ModeSChecked } else { Source::ModeS });
            match bytes[0] & 0x07 {
                4 => mm.airground = AirGround::Ground,
                5 => mm.airground = AirGround::Airborne,
                _ => mm.airground = AirGround::Uncertain,
            }
        }

        17 => {
            if mm.crc != 0 {
                return Err(FrameError::BadCrc);
            }
            mm.addr = ((bytes[1] as u32) << 16) | ((bytes[2] as u32) << 8) | bytes[3] as u32;
            mm.addr_type = Some(AddrType::AdsbIcao);
            mm.source = Some(Source::Adsb);
            match bytes[0] & 0x07 {
                4 => mm.airground = AirGround::Ground,
                5 => mm.airground = AirGround::Airborne,
                _ => mm.airground = AirGround::Uncertain,
            }
            decode_es(&mut mm, &bytes[4..11]);
        }

        18 => {
            if mm.crc != 0 {
                return Err(FrameError::BadCrc);
            }
            mm.addr = ((bytes[1] as u32) << 16) | ((bytes[2] as u32) << 8) | bytes[3] as u32;
            let cf = bytes[0] & 0x07;
            match cf {
                0 => {
                    mm.addr_type = Some(AddrType::AdsbIcaoNt);
                    mm.source = Some(Source::Adsb);
                }
                1 => {
                    mm.addr |= crate::aircraft::NON_ICAO_ADDRESS;
                    mm.addr_type = Some(AddrType::AdsbOther);
                    mm.source = Some(Source::Adsb);
                }
                2 | 3 => {
                    mm.addr_type = Some(AddrType::TisbIcao);
                    mm.source = Some(Source::Tisb);
                }
                5 => {
                    mm.addr |= crate::aircraft::NON_ICAO_ADDRESS;
                    mm.addr_type = Some(AddrType::TisbOther);
                    mm.source = Some(Source::Tisb);
                }
                6 => {
                    mm.addr_type = Some(AddrType::AdsrIcao);
                    mm.source = Some(Source::Adsr);
                }
                _ => return Err(FrameError::UnknownFormat),
            }
            if cf != 3 {
                decode_es(&mut mm, &bytes[4..11]);
            }
        }

        24..=31 => {
            // Comm-D ELM, nothing usable for tracking
            return Err(FrameError::UnknownFormat);
        }

        _ => return Err(FrameError::UnknownFormat),
    }

    Ok(mm)
}

fn decode_fs(mm: &mut Message, fs: u8) {
    match fs {
        0 => mm.airground = AirGround::Airborne,
        1 => mm.airground = AirGround::Ground,
        2 => {
            mm.airground = AirGround::Airborne;
            mm.alert = Some(true);
        }
        3 => {
            mm.airground = AirGround::Ground;
            mm.alert = Some(true);
        }
        4 => {
            mm.airground = AirGround::Uncertain;
            mm.alert = Some(true);
            mm.spi = Some(true);
        }
        5 => {
            mm.airground = AirGround::Uncertain;
            mm.spi = Some(true);
        }
        _ => mm.airground = AirGround::Invalid,
    }
    if mm.alert.is_none() {
        mm.alert = Some(false);
    }
    if mm.spi.is_none() {
        mm.spi = Some(false);
    }
}

/// 13-bit identity field to a squawk code (4 BCD octal digits).
fn decode_id13(id13: u16) -> u16 {
    let mut sq: u16 = 0;
    if id13 & 0x1000 != 0 { sq |= 0x0010 } // C1
    if id13 & 0x0800 != 0 { sq |= 0x1000 } // A1
    if id13 & 0x0400 != 0 { sq |= 0x0020 } // C2
    if id13 & 0x0200 != 0 { sq |= 0x2000 } // A2
    if id13 & 0x0100 != 0 { sq |= 0x0040 } // C4
    if id13 & 0x0080 != 0 { sq |= 0x4000 } // A4
    if id13 & 0x0020 != 0 { sq |= 0x0100 } // B1
    if id13 & 0x0010 != 0 { sq |= 0x0001 } // D1
    if id13 & 0x0008 != 0 { sq |= 0x0200 } // B2
    if id13 & 0x0004 != 0 { sq |= 0x0002 } // D2
    if id13 & 0x0002 != 0 { sq |= 0x0400 } // B4
    if id13 & 0x0001 != 0 { sq |= 0x0004 } // D4
    sq
}

/// Surface movement field to groundspeed in knots.
fn decode_movement(movement: u32) -> Option<f64> {
    match movement {
        1 => Some(0.0),
        2..=8 => Some(0.125 + (movement - 2) as f64 * 0.125),
        9..=12 => Some(1.0 + (movement - 9) as f64 * 0.25),
        13..=38 => Some(2.0 + (movement - 13) as f64 * 0.5),
        39..=93 => Some(15.0 + (movement - 39) as f64),
        94..=108 => Some(70.0 + (movement - 94) as f64 * 2.0),
        109..=123 => Some(100.0 + (movement - 109) as f64 * 5.0),
        124 => Some(175.0),
        _ => None, // 0 = no info, 125..127 reserved
    }
}

/// Extended squitter ME field decode (7 bytes).
fn decode_es(mm: &mut Message, me: &[u8]) {
    let metype = me[0] >> 3;
    let mesub = me[0] & 0x07;
    mm.metype = metype;
    mm.mesub = mesub;

    match metype {
        1..=4 => {
            // aircraft identification and category
            let mut callsign = String::with_capacity(8);
            let mut valid = true;
            for i in 0..8 {
                let idx = getbits(me, 9 + i * 6, 14 + i * 6) as usize;
                let ch = AIS_CHARSET[idx];
                if ch == b'?' {
                    valid = false;
                    break;
                }
                callsign.push(ch as char);
            }
            if valid {
                mm.callsign = Some(callsign);
            }
            mm.category = Some(((0x0e - metype) << 4) | mesub);
        }

        5..=8 => {
            // surface position
            mm.airground = AirGround::Ground;
            let movement = getbits(me, 6, 12);
            if let Some(gs) = decode_movement(movement) {
                mm.gs_v0 = Some(gs);
                mm.gs_v2 = Some(gs);
            }
            if getbit(me, 13) {
                let track = getbits(me, 14, 20) as f64 * 360.0 / 128.0;
                mm.heading = Some((track, HeadingType::GroundTrack));
            }
            mm.cpr = Some(CprFrame {
                odd: getbit(me, 22),
                typ: CprType::Surface,
                lat: getbits(me, 23, 39),
                lon: getbits(me, 40, 56),
                nucp: 14u8.saturating_sub(metype),
            });
        }

        0 => {
            // airborne position with no position information
            let ac12 = getbits(me, 9, 20) as u16;
            if let Some(alt) = decode_ac12(ac12) {
                mm.altitude_baro = Some(alt);
                mm.alt_q_bit = ac12_q_bit(ac12);
            }
        }

        9..=18 | 20..=22 => {
            // airborne position
            mm.airground = AirGround::Airborne;
            let ac12 = getbits(me, 9, 20) as u16;
            if metype >= 20 {
                // GNSS height
                if let Some(alt) = decode_ac12(ac12) {
                    mm.altitude_geom = Some(alt);
                }
            } else if let Some(alt) = decode_ac12(ac12) {
                mm.altitude_baro = Some(alt);
                mm.alt_q_bit = ac12_q_bit(ac12);
            }
            mm.accuracy.nic_b = Some(getbit(me, 8));
            mm.cpr = Some(CprFrame {
                odd: getbit(me, 22),
                typ: CprType::Airborne,
                lat: getbits(me, 23, 39),
                lon: getbits(me, 40, 56),
                nucp: if metype >= 20 { 29 - metype } else { 18 - metype },
            });
        }

        19 => decode_velocity(mm, me, mesub),

        28 => {
            if mesub == 1 {
                // emergency / priority status
                mm.emergency = Some(Emergency::from_u8(me[1] >> 5));
                let id13 = getbits(me, 12, 24) as u16;
                if id13 != 0 {
                    mm.squawk = Some(decode_id13(id13));
                }
            }
        }

        29 => {
            if mesub == 1 {
                decode_target_state(mm, me);
            }
        }

        31 => decode_opstatus(mm, me, mesub),

        _ => {}
    }
}

fn decode_velocity(mm: &mut Message, me: &[u8], mesub: u8) {
    let supersonic = mesub == 2 || mesub == 4;
    let scale = if supersonic { 4.0 } else { 1.0 };

    match mesub {
        1 | 2 => {
            let ew_raw = getbits(me, 15, 24);
            let ns_raw = getbits(me, 26, 35);
            if ew_raw != 0 && ns_raw != 0 {
                let ew = (ew_raw as f64 - 1.0) * scale * if getbit(me, 14) { -1.0 } else { 1.0 };
                let ns = (ns_raw as f64 - 1.0) * scale * if getbit(me, 25) { -1.0 } else { 1.0 };
                let gs = (ew * ew + ns * ns).sqrt();
                mm.gs_v0 = Some(gs);
                mm.gs_v2 = Some(gs);
                if gs > 0.0 {
                    let mut track = ew.atan2(ns).to_degrees();
                    if track < 0.0 {
                        track += 360.0;
                    }
                    mm.heading = Some((track, HeadingType::GroundTrack));
                }
            }
        }
        3 | 4 => {
            if getbit(me, 14) {
                let hdg = getbits(me, 15, 24) as f64 * 360.0 / 1024.0;
                mm.heading = Some((hdg, HeadingType::MagneticOrTrue));
            }
            let as_raw = getbits(me, 26, 35);
            if as_raw != 0 {
                let speed = ((as_raw - 1) as f64 * scale) as u32;
                if getbit(me, 25) {
                    mm.tas = Some(speed);
                } else {
                    mm.ias = Some(speed);
                }
            }
        }
        _ => return,
    }

    // vertical rate, shared by all subtypes
    let vr_raw = getbits(me, 38, 46);
    if vr_raw != 0 {
        let rate = (vr_raw as i32 - 1) * 64 * if getbit(me, 37) { -1 } else { 1 };
        if getbit(me, 36) {
            mm.baro_rate = Some(rate);
        } else {
            mm.geom_rate = Some(rate);
        }
    }

    // geometric height difference from baro
    let delta_raw = getbits(me, 50, 56);
    if delta_raw != 0 && delta_raw != 127 {
        let delta = (delta_raw as i32 - 1) * 25 * if getbit(me, 49) { -1 } else { 1 };
        mm.geom_delta = Some(delta);
    }

    mm.accuracy.nac_v = Some(getbits(me, 11, 13) as u8);
}

fn decode_target_state(mm: &mut Message, me: &[u8]) {
    mm.accuracy.sil = Some((getbits(me, 45, 46) as u8, SilType::PerSample));

    let alt_bits = getbits(me, 9, 19);
    if alt_bits != 0 {
        let alt = (alt_bits - 1) * 32;
        if getbit(me, 8) {
            mm.nav.fms_altitude = Some(alt);
            mm.nav.altitude_source = Some(NavAltSource::Fms);
        } else {
            mm.nav.mcp_altitude = Some(alt);
            mm.nav.altitude_source = Some(NavAltSource::Mcp);
        }
    }

    let qnh_bits = getbits(me, 20, 28);
    if qnh_bits != 0 {
        mm.nav.qnh = Some(800.0 + (qnh_bits - 1) as f64 * 0.8);
    }

    if getbit(me, 29) {
        let hdg = getbits(me, 30, 38) as f64 * 180.0 / 256.0;
        mm.nav.heading = Some(hdg);
    }

    mm.accuracy.nac_p = Some(getbits(me, 40, 43) as u8);
    mm.accuracy.nic_baro = Some(getbit(me, 44));

    if getbit(me, 47) {
        let mut modes = 0u8;
        if getbit(me, 48) {
            modes |= NAV_MODE_AUTOPILOT;
        }
        if getbit(me, 49) {
            modes |= NAV_MODE_VNAV;
        }
        if getbit(me, 50) {
            modes |= NAV_MODE_ALT_HOLD;
        }
        if getbit(me, 52) {
            modes |= NAV_MODE_APPROACH;
        }
        if getbit(me, 53) {
            modes |= NAV_MODE_TCAS;
        }
        if getbit(me, 54) {
            modes |= NAV_MODE_LNAV;
        }
        mm.nav.modes = Some(modes);
    }
}

fn decode_opstatus(mm: &mut Message, me: &[u8], mesub: u8) {
    let version = (me[5] >> 5) & 0x07;
    if version == 0 || version > 2 || mesub > 1 {
        return;
    }

    let mut op = OpStatus { version, hrd: None, tah: None };

    mm.accuracy.nic_a = Some(me[5] & 0x10 != 0);
    mm.accuracy.nac_p = Some(me[5] & 0x0f);

    if version == 2 {
        mm.accuracy.sil = Some((
            (me[6] >> 4) & 0x03,
            if me[6] & 0x02 != 0 { SilType::PerSample } else { SilType::PerHour },
        ));
        mm.accuracy.sda = Some(me[6] & 0x03);
    } else {
        mm.accuracy.sil = Some(((me[6] >> 4) & 0x03, SilType::Unknown));
    }

    if mesub == 0 {
        // airborne participants
        if version == 2 {
            mm.accuracy.gva = Some((me[6] >> 6) & 0x03);
        }
        mm.accuracy.nic_baro = Some(me[6] & 0x08 != 0);
        op.hrd = Some(if me[6] & 0x04 != 0 { HeadingType::Magnetic } else { HeadingType::True });
        op.tah = Some(HeadingType::GroundTrack);
    } else {
        // surface participants
        if version == 2 {
            mm.accuracy.nic_c = Some(me[5] & 0x20 != 0);
        }
        op.hrd = Some(if me[6] & 0x04 != 0 { HeadingType::Magnetic } else { HeadingType::True });
        op.tah = Some(if me[6] & 0x08 != 0 {
            if me[6] & 0x04 != 0 {
                HeadingType::Magnetic
            } else {
                HeadingType::True
            }
        } else {
            HeadingType::GroundTrack
        });
    }

    mm.opstatus = Some(op);
}

/// Comm-B register inference for DF20/21: try BDS 5,0 (track and turn)
/// then BDS 6,0 (heading and speed). Both matching is treated as
/// ambiguous and neither is used.
fn decode_commb(mm: &mut Message, mb: &[u8]) {
    let bds50 = decode_bds50(mb);
    let bds60 = decode_bds60(mb);

    match (bds50, bds60) {
        (Some(fields), None) => fields.apply(mm),
        (None, Some(fields)) => fields.apply(mm),
        _ => {}
    }
}

struct Bds50 {
    roll: Option<f64>,
    track: Option<f64>,
    gs: Option<f64>,
    track_rate: Option<f64>,
    tas: Option<u32>,
}

impl Bds50 {
    fn apply(self, mm: &mut Message) {
        mm.roll = self.roll;
        if let Some(t) = self.track {
            mm.heading = Some((t, HeadingType::GroundTrack));
        }
        if let Some(gs) = self.gs {
            mm.gs_v0 = Some(gs);
            mm.gs_v2 = Some(gs);
        }
        mm.track_rate = self.track_rate;
        mm.tas = self.tas;
    }
}

fn decode_bds50(mb: &[u8]) -> Option<Bds50> {
    let mut out = Bds50 { roll: None, track: None, gs: None, track_rate: None, tas: None };

    if getbit(mb, 1) {
        let raw = getbits(mb, 2, 10) as i32;
        let signed = if raw >= 256 { raw - 512 } else { raw };
        let roll = signed as f64 * 45.0 / 256.0;
        if roll.abs() > 50.0 {
            return None;
        }
        out.roll = Some(roll);
    } else if getbits(mb, 2, 10) != 0 {
        return None;
    }

    if getbit(mb, 12) {
        let raw = getbits(mb, 13, 23) as i32;
        let signed = if raw >= 1024 { raw - 2048 } else { raw };
        let mut track = signed as f64 * 90.0 / 512.0;
        if track < 0.0 {
            track += 360.0;
        }
        out.track = Some(track);
    } else if getbits(mb, 13, 23) != 0 {
        return None;
    }

    if getbit(mb, 24) {
        let gs = getbits(mb, 25, 34) as f64 * 2.0;
        if gs > 1000.0 {
            return None;
        }
        out.gs = Some(gs);
    } else if getbits(mb, 25, 34) != 0 {
        return None;
    }

    if getbit(mb, 35) {
        let raw = getbits(mb, 36, 45) as i32;
        let signed = if raw >= 512 { raw - 1024 } else { raw };
        out.track_rate = Some(signed as f64 * 8.0 / 256.0);
    } else if getbits(mb, 36, 45) != 0 {
        return None;
    }

    if getbit(mb, 46) {
        let tas = getbits(mb, 47, 56) * 2;
        if tas > 800 {
            return None;
        }
        out.tas = Some(tas);
    } else if getbits(mb, 47, 56) != 0 {
        return None;
    }

    // an all-unset register is an empty response, not BDS 5,0
    if out.roll.is_none() && out.track.is_none() && out.gs.is_none() && out.tas.is_none() {
        return None;
    }

    Some(out)
}

struct Bds60 {
    mag_heading: Option<f64>,
    ias: Option<u32>,
    mach: Option<f64>,
    baro_rate: Option<i32>,
    geom_rate: Option<i32>,
}

impl Bds60 {
    fn apply(self, mm: &mut Message) {
        if let Some(h) = self.mag_heading {
            mm.heading = Some((h, HeadingType::Magnetic));
        }
        mm.ias = self.ias;
        mm.mach = self.mach;
        mm.baro_rate = self.baro_rate;
        mm.geom_rate = self.geom_rate;
    }
}

fn decode_bds60(mb: &[u8]) -> Option<Bds60> {
    let mut out =
        Bds60 { mag_heading: None, ias: None, mach: None, baro_rate: None, geom_rate: None };

    if getbit(mb, 1) {
        let raw = getbits(mb, 2, 12) as i32;
        let signed = if raw >= 1024 { raw - 2048 } else { raw };
        let mut hdg = signed as f64 * 90.0 / 512.0;
        if hdg < 0.0 {
            hdg += 360.0;
        }
        out.mag_heading = Some(hdg);
    } else if getbits(mb, 2, 12) != 0 {
        return None;
    }

    if getbit(mb, 13) {
        let ias = getbits(mb, 14, 23);
        if ias == 0 || ias > 500 {
            return None;
        }
        out.ias = Some(ias);
    } else if getbits(mb, 14, 23) != 0 {
        return None;
    }

    if getbit(mb, 24) {
        let mach = getbits(mb, 25, 34) as f64 * 2.048 / 512.0;
        if mach > 1.0 {
            return None;
        }
        out.mach = Some(mach);
    } else if getbits(mb, 25, 34) != 0 {
        return None;
    }

    if getbit(mb, 35) {
        let raw = getbits(mb, 36, 45) as i32;
        let signed = if raw >= 512 { raw - 1024 } else { raw };
        let rate = signed * 32;
        if rate.abs() > 16_000 {
            return None;
        }
        out.baro_rate = Some(rate);
    } else if getbits(mb, 36, 45) != 0 {
        return None;
    }

    if getbit(mb, 46) {
        let raw = getbits(mb, 47, 56) as i32;
        let signed = if raw >= 512 { raw - 1024 } else { raw };
        let rate = signed * 32;
        if rate.abs() > 16_000 {
            return None;
        }
        out.geom_rate = Some(rate);
    } else if getbits(mb, 47, 56) != 0 {
        return None;
    }

    if out.ias.is_none() && out.mag_heading.is_none() && out.mach.is_none() {
        return None;
    }

    Some(out)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::super::crc;

    /// Fill in the parity of a frame under construction so it verifies.
    pub fn seal(frame: &mut [u8]) {
        let n = frame.len();
        frame[n - 3] = 0;
        frame[n - 2] = 0;
        frame[n - 1] = 0;
        let parity = crc::residual(frame);
        frame[n - 3] = (parity >> 16) as u8;
        frame[n - 2] = (parity >> 8) as u8;
        frame[n - 1] = parity as u8;
    }

    /// Build a DF17 airborne position frame (metype 11).
    pub fn df17_airborne_position(
        addr: u32,
        alt_ft: i32,
        odd: bool,
        cpr_lat: u32,
        cpr_lon: u32,
    ) -> [u8; 14] {
        let mut f = [0u8; 14];
        f[0] = (17 << 3) | 5;
        f[1] = (addr >> 16) as u8;
        f[2] = (addr >> 8) as u8;
        f[3] = addr as u8;

        // AC12 with Q bit
        let n = ((alt_ft + 1000) / 25) as u16;
        let ac13 = ((n << 2) & 0x1f80) | ((n << 1) & 0x0020) | (n & 0x000f) | 0x0010;
        let ac12 = ((ac13 & 0x1f80) >> 1) | (ac13 & 0x003f);

        let me = &mut f[4..11];
        me[0] = 11 << 3;
        me[1] = (ac12 >> 4) as u8;
        me[2] = ((ac12 & 0x0f) << 4) as u8;
        if odd {
            me[2] |= 0x04;
        }
        me[2] |= ((cpr_lat >> 15) & 0x03) as u8;
        me[3] = (cpr_lat >> 7) as u8;
        me[4] = ((cpr_lat & 0x7f) << 1) as u8 | ((cpr_lon >> 16) & 0x01) as u8;
        me[5] = (cpr_lon >> 8) as u8;
        me[6] = cpr_lon as u8;

        seal(&mut f);
        f
    }

    /// Build a DF17 ground velocity frame (metype 19 subtype 1).
    pub fn df17_velocity(addr: u32, ew_kt: i32, ns_kt: i32, baro_rate_fpm: i32) -> [u8; 14] {
        let mut f = [0u8; 14];
        f[0] = (17 << 3) | 5;
        f[1] = (addr >> 16) as u8;
        f[2] = (addr >> 8) as u8;
        f[3] = addr as u8;

        let me = &mut f[4..11];
        me[0] = (19 << 3) | 1;

        let ew_raw = (ew_kt.unsigned_abs() + 1) as u16;
        let ns_raw = (ns_kt.unsigned_abs() + 1) as u16;
        if ew_kt < 0 {
            me[1] |= 0x04;
        }
        me[1] |= (ew_raw >> 8) as u8 & 0x03;
        me[2] = ew_raw as u8;
        if ns_kt < 0 {
            me[3] |= 0x80;
        }
        me[3] |= ((ns_raw >> 3) & 0x7f) as u8;
        me[4] = ((ns_raw & 0x07) << 5) as u8;

        // baro vertical rate
        let vr_raw = (baro_rate_fpm.unsigned_abs() / 64 + 1) as u16;
        me[4] |= 0x10; // source: baro
        if baro_rate_fpm < 0 {
            me[4] |= 0x08;
        }
        me[4] |= (vr_raw >> 6) as u8 & 0x07;
        me[5] = ((vr_raw & 0x3f) << 2) as u8;

        seal(&mut f);
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_df17_identification() {
        let frame = [
            0x8d, 0x48, 0x40, 0xd6, 0x20, 0x2c, 0xc3, 0x71, 0xc3, 0x2c, 0xe0, 0x57, 0x60, 0x98,
        ];
        let mm = decode_frame(&frame, 0.5).unwrap();
        assert_eq!(mm.df, 17);
        assert_eq!(mm.addr, 0x4840d6);
        assert_eq!(mm.addr_type, Some(AddrType::AdsbIcao));
        assert_eq!(mm.source, Some(Source::Adsb));
        assert_eq!(mm.metype, 4);
        assert_eq!(mm.callsign.as_deref(), Some("KLM1023 "));
        assert_eq!(mm.category, Some(0xa0));
    }

    #[test]
    fn test_df17_bad_crc_rejected() {
        let mut frame = [
            0x8d, 0x48, 0x40, 0xd6, 0x20, 0x2c, 0xc3, 0x71, 0xc3, 0x2c, 0xe0, 0x57, 0x60, 0x98,
        ];
        frame[4] ^= 0x40;
        assert_eq!(decode_frame(&frame, 0.5).err(), Some(FrameError::BadCrc));
    }

    #[test]
    fn test_bad_length() {
        assert_eq!(decode_frame(&[0u8; 5], 0.0).err(), Some(FrameError::BadLength));
        // DF17 in a short frame
        assert_eq!(decode_frame(&[0x8d; 7], 0.0).err(), Some(FrameError::BadLength));
    }

    #[test]
    fn test_df17_airborne_position_roundtrip() {
        let frame = testutil::df17_airborne_position(0x4b1803, 36_000, true, 93000, 51372);
        let mm = decode_frame(&frame, 0.3).unwrap();
        assert_eq!(mm.addr, 0x4b1803);
        assert_eq!(mm.metype, 11);
        let cpr = mm.cpr.unwrap();
        assert!(cpr.odd);
        assert_eq!(cpr.typ, CprType::Airborne);
        assert_eq!(cpr.lat, 93000);
        assert_eq!(cpr.lon, 51372);
        assert_eq!(mm.altitude_baro, Some(36_000));
        assert_eq!(mm.airground, AirGround::Airborne);
    }

    #[test]
    fn test_df17_velocity_roundtrip() {
        let frame = testutil::df17_velocity(0x4b1803, 300, 400, -1600);
        let mm = decode_frame(&frame, 0.3).unwrap();
        assert_eq!(mm.metype, 19);
        let gs = mm.gs_v0.unwrap();
        assert!((gs - 500.0).abs() < 1.0, "gs {}", gs);
        let (track, ht) = mm.heading.unwrap();
        assert_eq!(ht, HeadingType::GroundTrack);
        assert!((track - 36.87).abs() < 0.5, "track {}", track);
        assert_eq!(mm.baro_rate, Some(-1600));
    }

    #[test]
    fn test_df11_iid() {
        let mut frame = [0x5d, 0x4b, 0x18, 0x03, 0, 0, 0];
        testutil::seal(&mut frame);
        let mm = decode_frame(&frame, 0.2).unwrap();
        assert_eq!(mm.df, 11);
        assert_eq!(mm.addr, 0x4b1803);
        assert_eq!(mm.iid, 0);
        assert_eq!(mm.source, Some(Source::ModeSChecked));
    }

    #[test]
    fn test_df4_altitude() {
        // DF4, FS=0, AC13 with Q bit for 30000 ft
        let n = ((30_000 + 1000) / 25) as u16;
        let ac13 = ((n << 2) & 0x1f80) | ((n << 1) & 0x0020) | (n & 0x000f) | 0x0010;
        let frame = [0x20, 0x00, (ac13 >> 8) as u8 & 0x1f, ac13 as u8, 0, 0, 0];
        // DF4 carries address/parity: the residual IS the address
        let mm = decode_frame(&frame, 0.2).unwrap();
        assert_eq!(mm.df, 4);
        assert_eq!(mm.altitude_baro, Some(30_000));
        assert_eq!(mm.airground, AirGround::Airborne);
        assert_eq!(mm.addr, mm.crc);
    }

    #[test]
    fn test_movement_table() {
        assert_eq!(decode_movement(0), None);
        assert_eq!(decode_movement(1), Some(0.0));
        assert_eq!(decode_movement(13), Some(2.0));
        assert_eq!(decode_movement(39), Some(15.0));
        assert_eq!(decode_movement(124), Some(175.0));
        assert_eq!(decode_movement(125), None);
    }

    #[test]
    fn test_id13() {
        // all A bits: squawk 7000
        assert_eq!(decode_id13(0x0880 | 0x0200), 0x7000);
    }

    #[test]
    fn test_getbits() {
        let data = [0b1010_1010, 0b1100_0011];
        assert_eq!(getbits(&data, 1, 4), 0b1010);
        assert_eq!(getbits(&data, 5, 12), 0b1010_1100);
        assert!(getbit(&data, 1));
        assert!(!getbit(&data, 2));
    }
}
