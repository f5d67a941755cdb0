// Raw AVR ASCII framing: `*<hex>;`, `:<hex>;`, `@<ts><hex>;`,
// `%<ts><hex>;`, `<<ts><sig><hex>;` lines.

use crate::modes::frame::decode_frame;
use crate::modes::message::Message;
use crate::modes::modeac::decode_mode_ac;

pub const HEARTBEAT: &[u8] = b"*0000;\n";

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode one raw AVR line (without the trailing separator). Returns
/// None for anything unusable; the connection always survives.
pub fn decode_line(line: &str, mode_ac: bool, now: u64) -> Option<Message> {
    let line = line.trim();
    if line.len() < 2 || !line.ends_with(';') {
        return None;
    }
    let bytes = line.as_bytes();

    let mut signal = 0.0f64;
    let hex = match bytes[0] {
        b'<' => {
            // 12 hex digits of timestamp, 2 of signal level
            if line.len() < 17 {
                return None;
            }
            let hi = hex_val(bytes[13])?;
            let lo = hex_val(bytes[14])?;
            let raw = ((hi << 4) | lo) as f64 / 255.0;
            signal = raw * raw;
            &bytes[15..bytes.len() - 1]
        }
        b'@' | b'%' => {
            // 12 hex digits of timestamp
            if line.len() < 15 {
                return None;
            }
            &bytes[13..bytes.len() - 1]
        }
        b'*' | b':' => &bytes[1..bytes.len() - 1],
        _ => return None,
    };

    let n = hex.len();
    if n != 2 * 2 && n != 7 * 2 && n != 14 * 2 {
        return None;
    }
    if n == 4 && !mode_ac {
        return None;
    }

    let msg = hex::decode(hex).ok()?;

    let mut mm = if msg.len() == 2 {
        decode_mode_ac(&msg, signal)
    } else {
        decode_frame(&msg, signal).ok()?
    };
    mm.sys_timestamp = now;
    mm.remote = true;
    Some(mm)
}

/// Format a message as a raw output line.
pub fn encode_line(mm: &Message, mlat_form: bool) -> Vec<u8> {
    let raw = mm.raw_bytes();
    let mut out = Vec::with_capacity(2 * raw.len() + 16);
    if mlat_form && mm.timestamp_12mhz != 0 {
        out.push(b'@');
        let ts = mm.timestamp_12mhz.to_be_bytes();
        out.extend_from_slice(hex::encode_upper(&ts[2..]).as_bytes());
    } else {
        out.push(b'*');
    }
    out.extend_from_slice(hex::encode_upper(raw).as_bytes());
    out.push(b';');
    out.push(b'\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DF17_HEX: &str = "8D4840D6202CC371C32CE0576098";

    #[test]
    fn test_star_form() {
        let mm = decode_line(&format!("*{};", DF17_HEX), false, 1000).unwrap();
        assert_eq!(mm.addr, 0x4840d6);
        assert_eq!(mm.sys_timestamp, 1000);
        assert!(mm.remote);
        assert_eq!(mm.signal_level, 0.0);
    }

    #[test]
    fn test_at_form_skips_timestamp() {
        let mm = decode_line(&format!("@00000012345A{};", DF17_HEX), false, 1000).unwrap();
        assert_eq!(mm.addr, 0x4840d6);
    }

    #[test]
    fn test_angle_form_carries_signal() {
        let mm = decode_line(&format!("<00000012345AFF{};", DF17_HEX), false, 1000).unwrap();
        assert!((mm.signal_level - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(decode_line("*8D4840;", false, 1000).is_none());
        assert!(decode_line("", false, 1000).is_none());
        assert!(decode_line("*8D4840D6202CC371C32CE057609;", false, 1000).is_none());
    }

    #[test]
    fn test_bad_hex_rejected() {
        let broken = DF17_HEX.replace('8', "Z");
        assert!(decode_line(&format!("*{};", broken), false, 1000).is_none());
    }

    #[test]
    fn test_modeac_needs_enable() {
        assert!(decode_line("*1234;", false, 1000).is_none());
        let mm = decode_line("*1234;", true, 1000).unwrap();
        assert_eq!(mm.df, 32);
    }

    #[test]
    fn test_encode_roundtrip() {
        let mut mm = decode_line(&format!("*{};", DF17_HEX), false, 1000).unwrap();
        let line = encode_line(&mm, false);
        assert_eq!(line, format!("*{};\n", DF17_HEX).as_bytes());

        mm.timestamp_12mhz = 0x12345a;
        let line = encode_line(&mm, true);
        assert!(line.starts_with(b"@00000012345A"));
        let parsed = decode_line(std::str::from_utf8(&line).unwrap().trim(), false, 2000).unwrap();
        assert_eq!(parsed.addr, 0x4840d6);
    }
}
