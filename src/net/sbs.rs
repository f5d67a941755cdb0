// SBS "BaseStation" comma separated lines: 22 fields, MSG,<type>,...

use chrono::{TimeZone, Utc};

use crate::aircraft::Aircraft;
use crate::modes::message::{AirGround, HeadingType, Message, Source};

pub const HEARTBEAT: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbsError {
    /// Too short to bother with; a heartbeat, not an error.
    Heartbeat,
    /// Malformed line: counted, connection survives.
    Invalid,
}

/// Parse one SBS input line with the service's source override.
pub fn decode_line(line: &str, source: Source, now: u64) -> Result<Message, SbsError> {
    if line.len() < 2 {
        return Err(SbsError::Heartbeat);
    }
    if line.len() < 20 || line.len() >= 200 {
        return Err(SbsError::Invalid);
    }

    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 22 {
        return Err(SbsError::Invalid);
    }

    if fields[0] != "MSG" || fields[1].len() != 1 {
        return Err(SbsError::Invalid);
    }

    let icao = fields[4];
    if icao.len() != 6 {
        return Err(SbsError::Invalid);
    }
    let addr = u32::from_str_radix(icao, 16).map_err(|_| SbsError::Invalid)?;

    let mut mm = Message::new(now);
    mm.df = 17; // address-reliable like an extended squitter
    mm.addr = addr;
    mm.source = Some(source);
    mm.remote = true;
    mm.sbs_in = true;

    // field 11: callsign, A-Z 0-9 and spaces only
    let callsign = fields.get(10).copied().unwrap_or("");
    if !callsign.is_empty() {
        let mut cs: String = callsign.chars().take(8).collect();
        while cs.len() < 8 {
            cs.push(' ');
        }
        let ok = cs
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == ' ');
        if ok {
            mm.callsign = Some(cs);
        }
    }

    // field 12: altitude
    if let Some(alt) = fields.get(11).and_then(|s| s.parse::<i32>().ok()) {
        if alt > -5000 && alt < 100_000 {
            mm.altitude_baro = Some(alt);
        }
    }

    // field 13: groundspeed
    if let Some(gs) = fields.get(12).and_then(|s| s.parse::<f64>().ok()) {
        if gs > 0.0 {
            mm.gs_v0 = Some(gs);
        }
    }

    // field 14: ground track
    if let Some(track) = fields.get(13).and_then(|s| s.parse::<f64>().ok()) {
        mm.heading = Some((track, HeadingType::GroundTrack));
    }

    // fields 15/16: position
    let lat = fields.get(14).and_then(|s| s.parse::<f64>().ok());
    let lon = fields.get(15).and_then(|s| s.parse::<f64>().ok());
    if let (Some(lat), Some(lon)) = (lat, lon) {
        if lat != 0.0 && lon != 0.0 {
            mm.sbs_pos = Some((lat, lon));
        }
    }

    // field 17: vertical rate, assume barometric
    if let Some(rate) = fields.get(16).and_then(|s| s.parse::<i32>().ok()) {
        mm.baro_rate = Some(rate);
    }

    // field 18: squawk as decimal digits
    if let Some(squawk) = fields.get(17).and_then(|s| s.parse::<u32>().ok()) {
        if squawk > 0 {
            let bcd = (squawk / 1000) * 16 * 16 * 16
                + (squawk / 100 % 10) * 16 * 16
                + (squawk / 10 % 10) * 16
                + squawk % 10;
            mm.squawk = Some(bcd as u16);
        }
    }

    // field 19: receiver count, MLAT servers repurpose this column
    if source == Source::Mlat {
        if let Some(n) = fields.get(18).and_then(|s| s.parse::<u16>().ok()) {
            mm.receiver_count_mlat = n;
        }
    }

    // field 22: on-ground flag
    if let Some(g) = fields.get(21).and_then(|s| s.parse::<i32>().ok()) {
        if g != 0 {
            mm.airground = AirGround::Ground;
        }
    }

    Ok(mm)
}

fn sbs_msg_type(mm: &Message) -> Option<u8> {
    match mm.df {
        4 | 20 => Some(5),
        5 | 21 => Some(6),
        0 | 16 => Some(7),
        11 => Some(8),
        17 | 18 => match mm.metype {
            1..=4 => Some(1),
            5..=8 => Some(2),
            9..=18 => Some(3),
            19 => Some(4),
            _ => None,
        },
        _ => None,
    }
}

fn timestamp_fields(ms: u64) -> (String, String) {
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(dt) => (dt.format("%Y/%m/%d").to_string(), dt.format("%H:%M:%S%.3f").to_string()),
        None => (String::new(), String::new()),
    }
}

/// Format one decoded message as an SBS output line, using tracked
/// geometry deltas where the original does.
pub fn encode_line(mm: &Message, a: &Aircraft, now: u64) -> Option<Vec<u8>> {
    if mm.addr & crate::aircraft::NON_ICAO_ADDRESS != 0 {
        return None;
    }
    let msg_type = sbs_msg_type(mm)?;

    let (rx_date, rx_time) = timestamp_fields(mm.sys_timestamp);
    let (now_date, now_time) = timestamp_fields(now);

    let mut out = String::with_capacity(160);
    out.push_str(&format!(
        "MSG,{},1,1,{:06X},1,{},{},{},{}",
        msg_type,
        mm.addr & 0xffffff,
        rx_date,
        rx_time,
        now_date,
        now_time
    ));

    // callsign
    match &mm.callsign {
        Some(cs) => out.push_str(&format!(",{}", cs)),
        None => out.push(','),
    }

    // altitude: baro preferred, geometric corrected by the tracked delta
    if let Some(alt) = mm.altitude_baro {
        out.push_str(&format!(",{}", alt));
    } else if let (Some(geom), true) = (mm.altitude_geom, a.geom_delta_valid.valid()) {
        out.push_str(&format!(",{}", geom - a.geom_delta));
    } else {
        out.push(',');
    }

    match mm.gs_selected(a.adsb_version) {
        Some(gs) => out.push_str(&format!(",{:.0}", gs)),
        None => out.push(','),
    }

    match mm.heading {
        Some((track, HeadingType::GroundTrack)) => out.push_str(&format!(",{:.0}", track)),
        _ => out.push(','),
    }

    match mm.decoded {
        Some(d) => out.push_str(&format!(",{:.5},{:.5}", d.lat, d.lon)),
        None => out.push_str(",,"),
    }

    if let Some(rate) = mm.baro_rate {
        out.push_str(&format!(",{}", rate));
    } else if let Some(rate) = mm.geom_rate {
        out.push_str(&format!(",{}", rate));
    } else {
        out.push(',');
    }

    match mm.squawk {
        Some(sq) => out.push_str(&format!(",{:04x}", sq)),
        None => out.push(','),
    }

    // alert flag
    match mm.alert {
        Some(true) => out.push_str(",-1"),
        Some(false) => out.push_str(",0"),
        None => out.push(','),
    }

    // emergency squawk flag
    match mm.squawk {
        Some(sq) if sq == 0x7500 || sq == 0x7600 || sq == 0x7700 => out.push_str(",-1"),
        Some(_) => out.push_str(",0"),
        None => out.push(','),
    }

    // ident flag
    match mm.spi {
        Some(true) => out.push_str(",-1"),
        Some(false) => out.push_str(",0"),
        None => out.push(','),
    }

    match mm.airground {
        AirGround::Ground => out.push_str(",-1"),
        AirGround::Airborne => out.push_str(",0"),
        _ => out.push(','),
    }

    out.push_str("\r\n");
    Some(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MLAT_LINE: &str =
        "MSG,3,1,1,4AC8B3,1,2019/12/10,19:10:46.320,2019/12/10,19:10:47.789,,36017,,,51.1001,10.1915,,,3,,,";

    #[test]
    fn test_decode_mlat_line() {
        let mm = decode_line(MLAT_LINE, Source::Mlat, 1000).unwrap();
        assert_eq!(mm.addr, 0x4ac8b3);
        assert_eq!(mm.altitude_baro, Some(36_017));
        assert_eq!(mm.sbs_pos, Some((51.1001, 10.1915)));
        assert_eq!(mm.receiver_count_mlat, 3);
        assert!(mm.sbs_in);
        assert_eq!(mm.source, Some(Source::Mlat));
    }

    #[test]
    fn test_too_few_fields_invalid() {
        let line = "MSG,3,1,1,4AC8B3,1,2019/12/10,19:10:46.320";
        assert_eq!(decode_line(line, Source::Sbs, 1000).err(), Some(SbsError::Invalid));
    }

    #[test]
    fn test_short_line_is_heartbeat() {
        assert_eq!(decode_line("", Source::Sbs, 1000).err(), Some(SbsError::Heartbeat));
        assert_eq!(decode_line("\r", Source::Sbs, 1000).err(), Some(SbsError::Heartbeat));
    }

    #[test]
    fn test_bad_icao_invalid() {
        let line = MLAT_LINE.replace("4AC8B3", "4AC8BZ");
        assert_eq!(decode_line(&line, Source::Sbs, 1000).err(), Some(SbsError::Invalid));
    }

    #[test]
    fn test_squawk_bcd() {
        let line =
            "MSG,6,1,1,4AC8B3,1,2019/12/10,19:10:46.320,2019/12/10,19:10:47.789,,,,,,,,7500,,,,";
        let mm = decode_line(line, Source::Sbs, 1000).unwrap();
        assert_eq!(mm.squawk, Some(0x7500));
    }

    #[test]
    fn test_callsign_charset() {
        let good = "MSG,1,1,1,4AC8B3,1,2019/12/10,19:10:46.320,2019/12/10,19:10:47.789,DLH9U,,,,,,,,,,,";
        let mm = decode_line(good, Source::Sbs, 1000).unwrap();
        assert_eq!(mm.callsign.as_deref(), Some("DLH9U   "));

        let bad = good.replace("DLH9U", "D?H9U");
        let mm = decode_line(&bad, Source::Sbs, 1000).unwrap();
        assert!(mm.callsign.is_none());
    }

    #[test]
    fn test_ground_flag() {
        let line =
            "MSG,2,1,1,4AC8B3,1,2019/12/10,19:10:46.320,2019/12/10,19:10:47.789,,,12,90,51.1,10.1,,,,,,-1";
        let mm = decode_line(line, Source::Sbs, 1000).unwrap();
        assert_eq!(mm.airground, AirGround::Ground);
    }

    #[test]
    fn test_encode_line_shape() {
        let now = 1_700_000_000_000;
        let mut mm = Message::new(now);
        mm.df = 17;
        mm.metype = 11;
        mm.addr = 0x4b1803;
        mm.altitude_baro = Some(36_000);
        mm.squawk = Some(0x7700);
        mm.decoded = Some(crate::modes::message::DecodedPos {
            lat: 47.99412,
            lon: 7.85201,
            nic: 8,
            rc: 186,
        });
        mm.airground = AirGround::Airborne;

        let a = Aircraft::new(0x4b1803, now);
        let line = String::from_utf8(encode_line(&mm, &a, now).unwrap()).unwrap();
        assert!(line.starts_with("MSG,3,1,1,4B1803,1,"));
        assert!(line.contains(",36000,"));
        assert!(line.contains(",47.99412,7.85201,"));
        assert!(line.contains(",7700,"));
        // emergency flag set for 7700
        assert!(line.ends_with(",0\r\n"));
        assert_eq!(line.matches(',').count(), 21);
    }

    #[test]
    fn test_encode_skips_non_icao() {
        let now = 1000;
        let mut mm = Message::new(now);
        mm.df = 17;
        mm.metype = 11;
        mm.addr = 0x123456 | crate::aircraft::NON_ICAO_ADDRESS;
        let a = Aircraft::new(mm.addr, now);
        assert!(encode_line(&mm, &a, now).is_none());
    }
}
