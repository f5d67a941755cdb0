// Per-connection handling: the framed read loop for input services, the
// subscription pump for output services, and message dispatch into the
// tracker plus fan-out to the outbound writers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::clock::{now_ms, AntiSpam, SECONDS};
use crate::modes::message::{Message, Source};
use crate::net::writer::NetWriter;
use crate::net::{ascii, beast, sbs, ClientStats, ReadMode, ServiceKind};
use crate::tracker;

pub const CLIENT_BUF_SIZE: usize = 64 * 1024;
/// Sustained garbage beyond this closes the connection.
pub const GARBAGE_LIMIT: u64 = 512;
/// A send that cannot complete within this long drops the client.
pub const SEND_DEADLINE: Duration = Duration::from_secs(5);

/// Synthesize a 64-bit receiver id from the peer address.
fn receiver_id_of(host: &str, port: u16) -> u64 {
    let mut h = DefaultHasher::new();
    host.hash(&mut h);
    port.hash(&mut h);
    let id = h.finish();
    if id == 0 {
        1
    } else {
        id
    }
}

/// Run the tracker on one decoded message and fan it out.
pub fn process_message(app: &App, mm: &mut Message) {
    let remote = mm.remote;
    let slot = tracker::update_from_message(app, mm);

    if slot.is_none() && !tracker::address_reliable(mm) && mm.df != 32 {
        // address/parity frame for an aircraft we are not tracking
        app.stats.with_current(|s| {
            if remote {
                s.remote_rejected_unknown_icao += 1;
            } else {
                s.local_rejected_unknown_icao += 1;
            }
        });
        return;
    }

    if mm.garbage {
        return;
    }

    let now = mm.sys_timestamp;
    let reduce_out = &app.outputs.beast_reduce_out;

    // full-rate Beast output
    if mm.raw_len > 0 && !(mm.source == Some(Source::Mlat) && !app.config.forward_mlat) {
        let writer = &app.outputs.beast_out;
        if writer.connections() > 0 {
            let id = beast_receiver_id(app, writer, mm);
            let bytes = beast::encode(mm, id);
            writer.send_with(now, bytes.len(), |buf| buf.extend_from_slice(&bytes));
        }

        let raw_writer = &app.outputs.raw_out;
        if raw_writer.connections() > 0 {
            let line = ascii::encode_line(mm, mm.timestamp_12mhz != 0);
            raw_writer.send_with(now, line.len(), |buf| buf.extend_from_slice(&line));
        }
    }

    // reduced-rate Beast output carries only messages that refreshed
    // something
    if mm.reduce_forward && mm.raw_len > 0 && reduce_out.connections() > 0 {
        let id = beast_receiver_id(app, reduce_out, mm);
        let bytes = beast::encode(mm, id);
        reduce_out.send_with(now, bytes.len(), |buf| buf.extend_from_slice(&bytes));
    }

    // SBS output needs the aircraft for the geometry delta
    if let Some(slot) = &slot {
        let writer = &app.outputs.sbs_out;
        if writer.connections() > 0 && !mm.sbs_in {
            let guard = slot.lock().unwrap();
            if let Some(line) = sbs::encode_line(mm, &guard.ac, now_ms()) {
                writer.send_with(now, line.len(), |buf| buf.extend_from_slice(&line));
            }
        }
    }
}

fn beast_receiver_id(app: &App, writer: &NetWriter, mm: &Message) -> Option<u64> {
    if app.config.net_receiver_id && writer.swap_receiver_id(mm.receiver_id) {
        Some(mm.receiver_id)
    } else {
        None
    }
}

/// Forward an inbound SBS line verbatim to the matching replay output.
fn sbs_passthrough(app: &App, service: ServiceKind, line: &str, now: u64) {
    let writer = match service {
        ServiceKind::SbsInMlat => &app.outputs.sbs_out_mlat,
        ServiceKind::SbsInJaero => &app.outputs.sbs_out_jaero,
        ServiceKind::SbsInPrio => &app.outputs.sbs_out_prio,
        _ => &app.outputs.sbs_out,
    };
    if writer.connections() > 0 && line.len() < 200 {
        writer.send_with(now, line.len() + 2, |buf| {
            buf.extend_from_slice(line.as_bytes());
            buf.extend_from_slice(b"\r\n");
        });
    }
}

/// The framed read loop for one inbound connection. Returns when the
/// peer disconnects, errors, goes silent past the heartbeat deadline, or
/// turns out to be a garbage source.
pub async fn run_input_client(
    app: Arc<App>,
    service: ServiceKind,
    mut stream: TcpStream,
    host: String,
    port: u16,
    initiated: bool,
) -> io::Result<()> {
    let stats = Arc::new(ClientStats::new(service, host.clone(), port, now_ms()));
    stats.receiver_id.store(receiver_id_of(&host, port), Ordering::Relaxed);
    app.register_client(&stats);

    info!(service = service.descr(), host = %host, port, "connection established");

    let read_mode = service.read_mode();
    let mut buf: Vec<u8> = Vec::with_capacity(CLIENT_BUF_SIZE);
    let mut chunk = vec![0u8; 16 * 1024];
    let mut overload_spam = AntiSpam::new(30 * SECONDS);
    let mut proxy_checked = false;

    // a connection we initiated must carry data or heartbeats
    let read_deadline = if initiated && app.heartbeat_interval() > 0 {
        Some(Duration::from_millis(app.heartbeat_interval() + 5 * SECONDS))
    } else {
        None
    };

    loop {
        if app.exiting() {
            return Ok(());
        }

        let n = match read_deadline {
            Some(deadline) => match timeout(deadline, stream.read(&mut chunk)).await {
                Ok(res) => res?,
                Err(_) => {
                    warn!(service = service.descr(), host = %host, port,
                        "no data within the heartbeat window, reconnecting");
                    return Ok(());
                }
            },
            None => stream.read(&mut chunk).await?,
        };
        if n == 0 {
            if app.config.debug_net {
                info!(service = service.descr(), host = %host, port, "peer closed");
            } else {
                debug!(service = service.descr(), host = %host, port, "peer closed");
            }
            return Ok(());
        }

        let now = now_ms();
        stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        app.stats.with_current(|s| s.bytes_in += n as u64);

        // a full buffer without a complete message is garbage
        if buf.len() + n > CLIENT_BUF_SIZE {
            stats.garbage_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
            app.stats.with_current(|s| s.remote_malformed_beast += buf.len() as u64);
            buf.clear();
        }
        buf.extend_from_slice(&chunk[..n]);

        // PROXY v1 header on ingest connections
        if !proxy_checked && app.config.net_ingest {
            proxy_checked = true;
            if buf.starts_with(b"PROXY ") {
                if let Some(eol) = buf.windows(2).position(|w| w == b"\r\n") {
                    let header = String::from_utf8_lossy(&buf[..eol]).into_owned();
                    let mut h = DefaultHasher::new();
                    header.hash(&mut h);
                    stats.receiver_id.store(h.finish().max(1), Ordering::Relaxed);
                    buf.drain(..eol + 2);
                }
            }
        }

        let watch = crate::clock::Watch::start();
        let closed = match read_mode {
            ReadMode::Beast => drain_beast(&app, service, &stats, &mut buf, now),
            ReadMode::Ascii => drain_ascii(&app, service, &stats, &mut buf, now),
            _ => {
                buf.clear();
                false
            }
        };
        if closed {
            return Ok(());
        }

        // if one pass kept us busy too long the feed outpaces the CPU;
        // shed the backlog instead of stalling every other client
        if watch.elapsed_ms() > 200 {
            if overload_spam.allow(now) {
                warn!(service = service.descr(), host = %host, port,
                    "not enough CPU, discarding input (suppressing for 30s)");
            }
            buf.clear();
        }
    }
}

/// Process buffered Beast bytes. Returns true when the client must be
/// dropped.
fn drain_beast(
    app: &App,
    _service: ServiceKind,
    stats: &Arc<ClientStats>,
    buf: &mut Vec<u8>,
    now: u64,
) -> bool {
    let res = beast::scan(buf);

    if res.garbage > 0 {
        stats.garbage_bytes.fetch_add(res.garbage as u64, Ordering::Relaxed);
        app.stats.with_current(|s| s.remote_malformed_beast += res.garbage as u64);
    }

    for event in res.events {
        match event {
            beast::BeastEvent::Uuid(uuid) => {
                *stats.uuid.lock().unwrap() = Some(uuid);
            }
            beast::BeastEvent::Frame { msg_type, timestamp, signal, payload, receiver_id } => {
                // upstream receiver ids are honored except in ingest
                // mode, where the connection identity wins
                if let (Some(id), false) = (receiver_id, app.config.net_ingest) {
                    stats.receiver_id.store(id, Ordering::Relaxed);
                }

                if msg_type == beast::TYPE_MODEAC {
                    app.stats.with_current(|s| s.remote_received_modeac += 1);
                } else {
                    app.stats.with_current(|s| s.remote_received_modes += 1);
                }

                match beast::decode_event(
                    msg_type,
                    timestamp,
                    signal,
                    &payload,
                    app.config.mode_ac,
                    now,
                    true,
                ) {
                    Some(mut mm) => {
                        app.stats.with_current(|s| {
                            s.remote_accepted += 1;
                            if signal > 0.0 {
                                s.record_signal(signal);
                            }
                        });
                        mm.receiver_id = stats.receiver_id.load(Ordering::Relaxed);
                        mm.client = Some(Arc::clone(stats));
                        process_message(app, &mut mm);

                        // valid traffic slowly forgives earlier noise
                        let garbage = stats.garbage_bytes.load(Ordering::Relaxed);
                        if garbage > 128 {
                            stats.garbage_bytes.store(garbage - 128, Ordering::Relaxed);
                        }
                    }
                    None => {
                        if msg_type != beast::TYPE_MODEAC {
                            app.stats.with_current(|s| s.remote_rejected_bad += 1);
                        }
                    }
                }
            }
        }
    }

    buf.drain(..res.consumed);

    if stats.garbage_bytes.load(Ordering::Relaxed) > GARBAGE_LIMIT {
        warn!(host = %stats.host, port = stats.port, "dropping client: persistent garbage");
        return true;
    }
    false
}

/// Process buffered ASCII lines. Returns true when the client must be
/// dropped.
fn drain_ascii(
    app: &App,
    service: ServiceKind,
    stats: &Arc<ClientStats>,
    buf: &mut Vec<u8>,
    now: u64,
) -> bool {
    while let Some(nl) = buf.iter().position(|&b| b == b'\n') {
        let line_bytes: Vec<u8> = buf.drain(..=nl).collect();
        let line = match std::str::from_utf8(&line_bytes[..nl]) {
            Ok(s) => s.trim_end_matches('\r'),
            Err(_) => {
                stats.garbage_bytes.fetch_add(nl as u64 + 1, Ordering::Relaxed);
                continue;
            }
        };

        match service {
            ServiceKind::RawIn => {
                if line.trim().is_empty() {
                    continue;
                }
                app.stats.with_current(|s| s.remote_received_modes += 1);
                match ascii::decode_line(line, app.config.mode_ac, now) {
                    Some(mut mm) => {
                        app.stats.with_current(|s| s.remote_accepted += 1);
                        mm.receiver_id = stats.receiver_id.load(Ordering::Relaxed);
                        mm.client = Some(Arc::clone(stats));
                        process_message(app, &mut mm);
                    }
                    None => {
                        app.stats.with_current(|s| s.remote_rejected_bad += 1);
                    }
                }
            }
            ServiceKind::SbsIn
            | ServiceKind::SbsInMlat
            | ServiceKind::SbsInJaero
            | ServiceKind::SbsInPrio => match sbs::decode_line(line, service.sbs_source(), now) {
                Ok(mut mm) => {
                    app.stats.with_current(|s| s.remote_received_basestation_valid += 1);
                    sbs_passthrough(app, service, line, now);
                    mm.receiver_id = stats.receiver_id.load(Ordering::Relaxed);
                    mm.client = Some(Arc::clone(stats));
                    process_message(app, &mut mm);
                }
                Err(sbs::SbsError::Heartbeat) => {}
                Err(sbs::SbsError::Invalid) => {
                    app.stats.with_current(|s| s.remote_received_basestation_invalid += 1);
                    if app.config.debug_garbage {
                        debug!(line, "invalid SBS line");
                    }
                }
            },
            _ => {}
        }
    }

    // an over-long line without a newline is garbage
    if buf.len() > 1024 {
        stats.garbage_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        buf.clear();
    }

    stats.garbage_bytes.load(Ordering::Relaxed) > GARBAGE_LIMIT
}

/// Pump one output connection: chunks from the service writer go to the
/// socket. A lagging or stuck peer is dropped.
pub async fn run_output_client(
    app: Arc<App>,
    service: ServiceKind,
    mut stream: TcpStream,
    host: String,
    port: u16,
) -> io::Result<()> {
    let writer = match service {
        ServiceKind::BeastOut => &app.outputs.beast_out,
        ServiceKind::BeastReduceOut => &app.outputs.beast_reduce_out,
        ServiceKind::RawOut => &app.outputs.raw_out,
        ServiceKind::SbsOut => &app.outputs.sbs_out,
        ServiceKind::JsonOut => &app.outputs.json_out,
        ServiceKind::VrsOut => &app.outputs.vrs_out,
        _ => return Ok(()),
    };

    let stats = Arc::new(ClientStats::new(service, host.clone(), port, now_ms()));
    app.register_client(&stats);
    info!(service = service.descr(), host = %host, port, "output client connected");

    let mut sub = writer.subscribe();
    loop {
        if app.exiting() {
            return Ok(());
        }
        match sub.recv().await {
            Ok(data) => match timeout(SEND_DEADLINE, stream.write_all(&data)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    info!(service = service.descr(), host = %host, port, error = %e,
                        "output client write failed");
                    return Ok(());
                }
                Err(_) => {
                    warn!(service = service.descr(), host = %host, port,
                        "dropping client: send queue stuck for 5s");
                    return Ok(());
                }
            },
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(service = service.descr(), host = %host, port, skipped,
                    "dropping client: send queue overran");
                return Ok(());
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
