// Beast binary framing: 0x1A-escaped frames with a 6-byte 12 MHz
// timestamp and a signal byte. Every 0x1A inside a field is doubled.

use crate::modes::frame::decode_frame;
use crate::modes::message::Message;
use crate::modes::modeac::decode_mode_ac;

pub const ESCAPE: u8 = 0x1a;
pub const TYPE_MODEAC: u8 = b'1';
pub const TYPE_SHORT: u8 = b'2';
pub const TYPE_LONG: u8 = b'3';
pub const TYPE_RECEIVER_ID: u8 = 0xe3;
pub const TYPE_UUID: u8 = 0xe4;

/// 11-byte zero Mode A/C frame used as the keep-alive.
pub const HEARTBEAT: [u8; 11] = [ESCAPE, TYPE_MODEAC, 0, 0, 0, 0, 0, 0, 0, 0, 0];

#[derive(Debug, Clone, PartialEq)]
pub enum BeastEvent {
    Frame {
        msg_type: u8,
        timestamp: u64,
        /// RSSI in [0..1], already squared back to power
        signal: f64,
        payload: Vec<u8>,
        receiver_id: Option<u64>,
    },
    Uuid(String),
}

#[derive(Debug, Default)]
pub struct ScanResult {
    /// Bytes consumed from the start of the buffer.
    pub consumed: usize,
    /// How many of the consumed bytes were garbage.
    pub garbage: usize,
    pub events: Vec<BeastEvent>,
}

fn payload_len(msg_type: u8) -> Option<usize> {
    match msg_type {
        TYPE_MODEAC => Some(2),
        TYPE_SHORT => Some(7),
        TYPE_LONG | b'4' | b'5' => Some(14),
        _ => None,
    }
}

/// Read `n` unescaped bytes starting at `pos`. Returns the bytes and the
/// position after them, or None when the buffer ends first. A lone
/// escape followed by a non-escape byte is a framing error.
fn read_escaped(buf: &[u8], mut pos: usize, n: usize) -> Option<Result<(Vec<u8>, usize), usize>> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let b = *buf.get(pos)?;
        if b == ESCAPE {
            match buf.get(pos + 1) {
                None => return None, // incomplete double escape
                Some(&ESCAPE) => {
                    out.push(ESCAPE);
                    pos += 2;
                }
                // a new message started in the middle of this one
                Some(_) => return Some(Err(pos)),
            }
        } else {
            out.push(b);
            pos += 1;
        }
    }
    Some(Ok((out, pos)))
}

/// Scan the buffer for complete Beast frames. Bytes before each frame
/// start count as garbage; an incomplete frame at the tail is left
/// unconsumed. Trailing data with no frame start is consumed as garbage
/// once it exceeds 256 bytes.
pub fn scan(buf: &[u8]) -> ScanResult {
    let mut res = ScanResult::default();
    let mut som = 0usize;

    'outer: while som < buf.len() {
        // find the next frame start
        let esc = match buf[som..].iter().position(|&b| b == ESCAPE) {
            Some(off) => som + off,
            None => break,
        };
        res.garbage += esc - som;
        som = esc;
        let mut pos = som + 1;

        let first = match buf.get(pos) {
            Some(&b) => b,
            None => break, // escape at very end, wait for more
        };

        // receiver id record prefixing the actual frame
        let mut receiver_id = None;
        let mut msg_type = first;
        if first == TYPE_RECEIVER_ID {
            pos += 1;
            let (id_bytes, after) = match read_escaped(buf, pos, 8) {
                None => break,
                Some(Err(restart)) => {
                    res.garbage += restart - som;
                    som = restart;
                    continue;
                }
                Some(Ok(v)) => v,
            };
            let mut id = 0u64;
            for b in id_bytes {
                id = id << 8 | b as u64;
            }
            receiver_id = Some(id);
            // expect the frame itself right behind
            match (buf.get(after), buf.get(after + 1)) {
                (Some(&ESCAPE), Some(&t)) => {
                    msg_type = t;
                    pos = after + 2;
                }
                (Some(&ESCAPE), None) | (None, _) => break,
                (Some(_), _) => {
                    res.garbage += after - som;
                    som = after;
                    continue;
                }
            }
        } else if first == TYPE_UUID {
            pos += 1;
            // ASCII until the next escape
            let end = match buf[pos..].iter().position(|&b| b == ESCAPE) {
                Some(off) => pos + off,
                None => {
                    if buf.len() - pos > 256 {
                        // oversized, not a UUID
                        res.garbage += 1;
                        som += 1;
                        continue;
                    }
                    break;
                }
            };
            let text: String = buf[pos..end]
                .iter()
                .map(|&b| b as char)
                .filter(|c| c.is_ascii_graphic())
                .collect();
            if !text.is_empty() {
                res.events.push(BeastEvent::Uuid(text));
            }
            som = end;
            res.consumed = som;
            continue;
        } else {
            pos += 1;
        }

        let body_len = match payload_len(msg_type) {
            Some(n) => n,
            None => {
                // not a frame start, skip this escape
                res.garbage += 1;
                som += 1;
                continue;
            }
        };

        // 6-byte timestamp + signal + payload, all escaped
        let (header, after_header) = match read_escaped(buf, pos, 7) {
            None => break,
            Some(Err(restart)) => {
                res.garbage += restart - som;
                som = restart;
                continue;
            }
            Some(Ok(v)) => v,
        };
        let (payload, after_payload) = match read_escaped(buf, after_header, body_len) {
            None => break,
            Some(Err(restart)) => {
                res.garbage += restart - som;
                som = restart;
                continue 'outer;
            }
            Some(Ok(v)) => v,
        };

        let mut timestamp = 0u64;
        for &b in &header[..6] {
            timestamp = timestamp << 8 | b as u64;
        }
        let raw_signal = header[6] as f64 / 255.0;

        res.events.push(BeastEvent::Frame {
            msg_type,
            timestamp,
            signal: raw_signal * raw_signal,
            payload,
            receiver_id,
        });

        som = after_payload;
        res.consumed = som;
    }

    // data with no frame start does not linger forever
    if res.consumed < som {
        res.consumed = som;
    }
    let tail = buf.len() - res.consumed;
    if tail > 256 && !buf[res.consumed..].contains(&ESCAPE) {
        res.garbage += tail;
        res.consumed = buf.len();
    }

    res
}

/// Turn one frame event into a Message. None for frame types we consume
/// but do not decode, or frames the decoder rejects.
pub fn decode_event(
    msg_type: u8,
    timestamp: u64,
    signal: f64,
    payload: &[u8],
    mode_ac: bool,
    now: u64,
    remote: bool,
) -> Option<Message> {
    let mut mm = match msg_type {
        TYPE_MODEAC => {
            if !mode_ac || payload.len() != 2 {
                return None;
            }
            decode_mode_ac(payload, signal)
        }
        TYPE_SHORT | TYPE_LONG => decode_frame(payload, signal).ok()?,
        _ => return None,
    };
    mm.timestamp_12mhz = timestamp;
    mm.sys_timestamp = now;
    mm.remote = remote;
    Some(mm)
}

fn push_escaped(out: &mut Vec<u8>, b: u8) {
    out.push(b);
    if b == ESCAPE {
        out.push(ESCAPE);
    }
}

/// Maximum encoded size of one output frame incl. a receiver id record.
pub const MAX_ENCODED: usize = 2 + 2 * (7 + 8 + 14) + 2 + 2 * 8;

/// Encode a message as a Beast output frame. When `receiver_id` is set a
/// `0x1A 0xE3` record precedes the frame.
pub fn encode(mm: &Message, receiver_id: Option<u64>) -> Vec<u8> {
    let raw = mm.raw_bytes();
    let mut out = Vec::with_capacity(MAX_ENCODED);

    if let Some(id) = receiver_id {
        out.push(ESCAPE);
        out.push(TYPE_RECEIVER_ID);
        for shift in (0..8).rev() {
            push_escaped(&mut out, (id >> (shift * 8)) as u8);
        }
    }

    out.push(ESCAPE);
    out.push(match raw.len() {
        2 => TYPE_MODEAC,
        7 => TYPE_SHORT,
        _ => TYPE_LONG,
    });

    for shift in (0..6).rev() {
        push_escaped(&mut out, (mm.timestamp_12mhz >> (shift * 8)) as u8);
    }

    let mut sig = (mm.signal_level.sqrt() * 255.0).round() as i64;
    if mm.signal_level > 0.0 && sig < 1 {
        sig = 1;
    }
    push_escaped(&mut out, sig.clamp(0, 255) as u8);

    for &b in raw {
        push_escaped(&mut out, b);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap_frame(msg_type: u8, timestamp: u64, signal: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![ESCAPE, msg_type];
        for shift in (0..6).rev() {
            push_escaped(&mut out, (timestamp >> (shift * 8)) as u8);
        }
        push_escaped(&mut out, signal);
        for &b in payload {
            push_escaped(&mut out, b);
        }
        out
    }

    const DF17: [u8; 14] = [
        0x8d, 0x48, 0x40, 0xd6, 0x20, 0x2c, 0xc3, 0x71, 0xc3, 0x2c, 0xe0, 0x57, 0x60, 0x98,
    ];

    #[test]
    fn test_scan_single_frame() {
        let buf = wrap_frame(TYPE_LONG, 0x123456789a, 100, &DF17);
        let res = scan(&buf);
        assert_eq!(res.consumed, buf.len());
        assert_eq!(res.garbage, 0);
        assert_eq!(res.events.len(), 1);
        match &res.events[0] {
            BeastEvent::Frame { msg_type, timestamp, payload, receiver_id, .. } => {
                assert_eq!(*msg_type, TYPE_LONG);
                assert_eq!(*timestamp, 0x123456789a);
                assert_eq!(payload.as_slice(), &DF17);
                assert!(receiver_id.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_scan_doubled_escape_in_payload() {
        let mut payload = DF17;
        payload[5] = ESCAPE;
        let buf = wrap_frame(TYPE_LONG, ESCAPE as u64, ESCAPE, &payload);
        let res = scan(&buf);
        assert_eq!(res.events.len(), 1);
        match &res.events[0] {
            BeastEvent::Frame { timestamp, payload: p, signal, .. } => {
                assert_eq!(*timestamp, ESCAPE as u64);
                assert_eq!(p[5], ESCAPE);
                let expected = (ESCAPE as f64 / 255.0).powi(2);
                assert!((signal - expected).abs() < 1e-9);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_scan_garbage_before_frame() {
        let mut buf = vec![0xde, 0xad, 0xbe, 0xef];
        buf.extend(wrap_frame(TYPE_SHORT, 1, 10, &[0u8; 7]));
        let res = scan(&buf);
        assert_eq!(res.garbage, 4);
        assert_eq!(res.events.len(), 1);
        assert_eq!(res.consumed, buf.len());
    }

    #[test]
    fn test_scan_incomplete_frame_left_in_buffer() {
        let full = wrap_frame(TYPE_LONG, 42, 10, &DF17);
        let res = scan(&full[..10]);
        assert!(res.events.is_empty());
        assert_eq!(res.consumed, 0, "incomplete frame must stay buffered");

        // the rest arrives
        let res = scan(&full);
        assert_eq!(res.events.len(), 1);
    }

    #[test]
    fn test_scan_receiver_id_prefix() {
        let mut buf = vec![ESCAPE, TYPE_RECEIVER_ID];
        for &b in &[1u8, 2, 3, 4, 5, 6, 7, 8] {
            push_escaped(&mut buf, b);
        }
        buf.extend(wrap_frame(TYPE_LONG, 7, 50, &DF17));
        let res = scan(&buf);
        assert_eq!(res.events.len(), 1);
        match &res.events[0] {
            BeastEvent::Frame { receiver_id, .. } => {
                assert_eq!(*receiver_id, Some(0x0102030405060708));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_scan_uuid() {
        let mut buf = vec![ESCAPE, TYPE_UUID];
        buf.extend(b"0f3e4c5d-aaaa-bbbb-cccc-111122223333");
        buf.extend(wrap_frame(TYPE_SHORT, 0, 0, &[0u8; 7]));
        let res = scan(&buf);
        assert_eq!(res.events.len(), 2);
        assert_eq!(
            res.events[0],
            BeastEvent::Uuid("0f3e4c5d-aaaa-bbbb-cccc-111122223333".into())
        );
    }

    #[test]
    fn test_scan_unknown_type_skips_escape() {
        let mut buf = vec![ESCAPE, 0x99];
        buf.extend(wrap_frame(TYPE_SHORT, 0, 0, &[1u8; 7]));
        let res = scan(&buf);
        assert_eq!(res.events.len(), 1);
        assert!(res.garbage >= 1);
    }

    #[test]
    fn test_trailing_noise_expires() {
        let mut buf = wrap_frame(TYPE_SHORT, 0, 0, &[1u8; 7]);
        let frame_len = buf.len();
        buf.extend(std::iter::repeat(0x42u8).take(300));
        let res = scan(&buf);
        assert_eq!(res.events.len(), 1);
        assert_eq!(res.consumed, buf.len());
        assert_eq!(res.garbage, 300);
        let _ = frame_len;
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut mm = Message::new(5000);
        mm.set_raw(&DF17);
        mm.timestamp_12mhz = 0x1a2b3c4d5e;
        mm.signal_level = 0.25;

        let encoded = encode(&mm, None);
        let res = scan(&encoded);
        assert_eq!(res.events.len(), 1);
        match &res.events[0] {
            BeastEvent::Frame { msg_type, timestamp, payload, signal, .. } => {
                assert_eq!(*msg_type, TYPE_LONG);
                assert_eq!(*timestamp, 0x1a2b3c4d5e);
                assert_eq!(payload.as_slice(), &DF17);
                assert!((signal - 0.25).abs() < 0.01);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_encode_with_receiver_id() {
        let mut mm = Message::new(5000);
        mm.set_raw(&DF17);
        let encoded = encode(&mm, Some(0x1a1a1a1a00000000));
        let res = scan(&encoded);
        assert_eq!(res.events.len(), 1);
        match &res.events[0] {
            BeastEvent::Frame { receiver_id, .. } => {
                assert_eq!(*receiver_id, Some(0x1a1a1a1a00000000));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_event_to_message() {
        let mm = decode_event(TYPE_LONG, 99, 0.3, &DF17, false, 123_456, true).unwrap();
        assert_eq!(mm.addr, 0x4840d6);
        assert_eq!(mm.timestamp_12mhz, 99);
        assert_eq!(mm.sys_timestamp, 123_456);
        assert!(mm.remote);

        // mode A/C only when enabled
        assert!(decode_event(TYPE_MODEAC, 0, 0.1, &[0x12, 0x34], false, 1, true).is_none());
        let mm = decode_event(TYPE_MODEAC, 0, 0.1, &[0x12, 0x34], true, 1, true).unwrap();
        assert_eq!(mm.df, 32);
    }

    #[test]
    fn test_heartbeat_is_valid_frame() {
        let res = scan(&HEARTBEAT);
        assert_eq!(res.events.len(), 1);
        match &res.events[0] {
            BeastEvent::Frame { msg_type, payload, .. } => {
                assert_eq!(*msg_type, TYPE_MODEAC);
                assert_eq!(payload.as_slice(), &[0, 0]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
