// Shared outbound buffers. Producers append into a writer's buffer; when
// the buffer crosses the flush threshold (or the flush interval passes)
// the contents fan out over a broadcast channel to every client of the
// service. A client that cannot keep up sees a lagged receiver and is
// dropped by its own task.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

/// Output buffer size; a single write may not exceed this.
pub const OUT_BUF_SIZE: usize = 16 * 1024;
/// Broadcast depth in flushed chunks: the 128 KiB per-client send queue
/// budget divided by the buffer size.
const CHANNEL_CHUNKS: usize = 8;

struct WriterBuf {
    data: Vec<u8>,
    last_flush: u64,
    last_write: u64,
    last_receiver_id: u64,
}

pub struct NetWriter {
    name: &'static str,
    tx: broadcast::Sender<Vec<u8>>,
    buf: Mutex<WriterBuf>,
    flush_size: usize,
    flush_interval: u64,
    connections: Arc<AtomicUsize>,
    pub bytes_out: AtomicU64,
}

impl NetWriter {
    pub fn new(name: &'static str, flush_size: usize, flush_interval: u64) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CHUNKS);
        NetWriter {
            name,
            tx,
            buf: Mutex::new(WriterBuf {
                data: Vec::with_capacity(OUT_BUF_SIZE),
                last_flush: 0,
                last_write: 0,
                last_receiver_id: 0,
            }),
            flush_size: flush_size.min(OUT_BUF_SIZE),
            flush_interval,
            connections: Arc::new(AtomicUsize::new(0)),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Subscribe a client. The returned receiver yields flushed chunks;
    /// a Lagged error means the client fell behind its queue budget.
    pub fn subscribe(&self) -> WriterSubscription {
        self.connections.fetch_add(1, Ordering::Relaxed);
        WriterSubscription { rx: self.tx.subscribe(), connections: Arc::clone(&self.connections) }
    }

    /// Append to the writer's buffer via `fill`. Skipped entirely (false)
    /// when nobody is connected or the producer overshoots the buffer.
    pub fn send_with(&self, now: u64, max_len: usize, fill: impl FnOnce(&mut Vec<u8>)) -> bool {
        if self.connections() == 0 || max_len > OUT_BUF_SIZE {
            return false;
        }
        let mut buf = self.buf.lock().unwrap();
        if buf.data.len() + max_len >= OUT_BUF_SIZE {
            self.flush_locked(&mut buf, now);
        }
        if buf.data.is_empty() {
            // the interval flush counts from the first buffered byte
            buf.last_flush = now;
        }
        let before = buf.data.len();
        fill(&mut buf.data);
        debug_assert!(buf.data.len() - before <= max_len);
        buf.last_write = now;
        if buf.data.len() >= self.flush_size {
            self.flush_locked(&mut buf, now);
        }
        true
    }

    /// The receiver id most recently tagged onto this writer's stream;
    /// emitting an id record only on change keeps the overhead out of
    /// the steady state.
    pub fn swap_receiver_id(&self, id: u64) -> bool {
        let mut buf = self.buf.lock().unwrap();
        if buf.last_receiver_id == id {
            false
        } else {
            buf.last_receiver_id = id;
            true
        }
    }

    /// Interval flush and idle heartbeat, driven by the periodic task.
    /// `heartbeat` supplies the service's keep-alive bytes.
    pub fn periodic(&self, now: u64, heartbeat_interval: u64, heartbeat: &[u8]) {
        if self.connections() == 0 {
            return;
        }
        let mut buf = self.buf.lock().unwrap();
        if !buf.data.is_empty() && now >= buf.last_flush + self.flush_interval {
            self.flush_locked(&mut buf, now);
        } else if heartbeat_interval > 0
            && !heartbeat.is_empty()
            && buf.data.is_empty()
            && now >= buf.last_write.max(buf.last_flush) + heartbeat_interval
        {
            buf.data.extend_from_slice(heartbeat);
            buf.last_write = now;
            self.flush_locked(&mut buf, now);
        }
    }

    pub fn flush(&self, now: u64) {
        let mut buf = self.buf.lock().unwrap();
        if !buf.data.is_empty() {
            self.flush_locked(&mut buf, now);
        }
    }

    fn flush_locked(&self, buf: &mut WriterBuf, now: u64) {
        if buf.data.is_empty() {
            buf.last_flush = now;
            return;
        }
        let chunk = std::mem::replace(&mut buf.data, Vec::with_capacity(OUT_BUF_SIZE));
        self.bytes_out.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        // send fails only with zero receivers; nothing to do then
        let _ = self.tx.send(chunk);
        buf.last_flush = now;
    }
}

/// A client's view of a writer; decrements the connection count on drop.
pub struct WriterSubscription {
    rx: broadcast::Receiver<Vec<u8>>,
    connections: Arc<AtomicUsize>,
}

impl WriterSubscription {
    pub async fn recv(&mut self) -> Result<Vec<u8>, broadcast::error::RecvError> {
        self.rx.recv().await
    }
}

impl Drop for WriterSubscription {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}
