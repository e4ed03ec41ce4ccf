use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::fs::{Error, ReadChunk, Result, StreamReader};

/// Writer chunk size. Size configuration values are divided by this to get
/// the number of chunks held in buffers.
pub const CHUNK_SIZE: usize = 64 * 1024;

pub const DEFAULT_RING_CHUNKS: usize = 16;
pub const DEFAULT_CHANNEL_CHUNKS: usize = 16;

/// A one-writer/many-reader pipe. Recent chunks are kept in a circular ring
/// buffer so late joiners can replay history; live chunks are fanned out to
/// every registered reader over bounded channels without ever blocking the
/// writer on a slow consumer.
pub struct Stream {
    name: String,
    channel_buffer: usize,
    state: RwLock<State>,
    next_reader_id: AtomicU64,
}

struct State {
    ring: Vec<Bytes>,
    ring_size: usize,
    write_index: usize,
    total_chunks: u64,
    /// Total bytes ever written; backs stat.size.
    offset: i64,
    closed: bool,
    mod_time: SystemTime,
    readers: HashMap<u64, ReaderHandle>,
}

#[derive(Clone)]
struct ReaderHandle {
    id: u64,
    tx: mpsc::Sender<Bytes>,
    #[allow(dead_code)]
    registered: SystemTime,
    dropped: Arc<AtomicU64>,
}

impl Stream {
    pub fn new<N: Into<String>>(name: N, ring_chunks: usize, channel_chunks: usize) -> Arc<Self> {
        let ring_size = ring_chunks.max(1);
        Arc::new(Self {
            name: name.into(),
            channel_buffer: channel_chunks.max(1),
            state: RwLock::new(State {
                ring: vec![Bytes::new(); ring_size],
                ring_size,
                write_index: 0,
                total_chunks: 0,
                offset: 0,
                closed: false,
                mod_time: SystemTime::now(),
                readers: HashMap::new(),
            }),
            next_reader_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_bytes(&self) -> i64 {
        self.state.read().unwrap().offset
    }

    pub fn total_chunks(&self) -> u64 {
        self.state.read().unwrap().total_chunks
    }

    pub fn mod_time(&self) -> SystemTime {
        self.state.read().unwrap().mod_time
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().unwrap().closed
    }

    pub fn reader_count(&self) -> usize {
        self.state.read().unwrap().readers.len()
    }

    /// Chunks dropped so far for a registered reader.
    pub fn dropped(&self, reader_id: u64) -> Option<u64> {
        self.state
            .read()
            .unwrap()
            .readers
            .get(&reader_id)
            .map(|r| r.dropped.load(Ordering::Relaxed))
    }

    /// Appends a chunk: stores it in the ring buffer and fans it out to every
    /// registered reader with a non-blocking send. A full reader channel
    /// drops the chunk for that reader only.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let chunk = Bytes::copy_from_slice(data);
        let handles: Vec<ReaderHandle>;
        {
            let mut state = self.state.write().unwrap();
            if state.closed {
                return Err(Error::io("write", &self.name, "stream is closed"));
            }

            let idx = state.write_index % state.ring_size;
            state.ring[idx] = chunk.clone();
            state.write_index = state.write_index.wrapping_add(1);
            state.total_chunks += 1;
            state.offset += data.len() as i64;
            state.mod_time = SystemTime::now();

            handles = state.readers.values().cloned().collect();
        }

        for handle in handles {
            match handle.tx.try_send(chunk.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let dropped = handle.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        "stream {}: reader {} is slow, dropped {} chunks",
                        self.name, handle.id, dropped
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        Ok(data.len())
    }

    /// Registers a new reader positioned at the oldest chunk still held in
    /// the ring buffer. A background task replays the history into the
    /// reader's channel; if the channel fills mid-replay the catch-up stops
    /// and the reader only sees live data from that point on.
    pub fn register(self: &Arc<Self>) -> Reader {
        let id = self.next_reader_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.channel_buffer);

        let history: Vec<Bytes>;
        {
            let mut state = self.state.write().unwrap();
            let start = state.total_chunks.saturating_sub(state.ring_size as u64);
            history = (start..state.total_chunks)
                .map(|i| state.ring[(i % state.ring_size as u64) as usize].clone())
                .collect();

            if !state.closed {
                state.readers.insert(
                    id,
                    ReaderHandle {
                        id,
                        tx: tx.clone(),
                        registered: SystemTime::now(),
                        dropped: Arc::new(AtomicU64::new(0)),
                    },
                );
            }
        }

        if !history.is_empty() {
            let name = self.name.clone();
            tokio::spawn(async move {
                for chunk in history {
                    if let Err(err) = tx.try_send(chunk) {
                        match err {
                            TrySendError::Full(_) => {
                                debug!("stream {}: reader {} history replay stopped, channel full", name, id)
                            }
                            TrySendError::Closed(_) => {}
                        }
                        break;
                    }
                }
            });
        }

        Reader {
            stream: Arc::clone(self),
            id,
            rx,
        }
    }

    fn unregister(&self, reader_id: u64) {
        self.state.write().unwrap().readers.remove(&reader_id);
    }

    /// Concatenation of the chunks still held in the ring buffer, oldest
    /// first. This is what a non-streaming read of the pipe observes.
    pub fn buffered_bytes(&self) -> Vec<u8> {
        let state = self.state.read().unwrap();
        let start = state.total_chunks.saturating_sub(state.ring_size as u64);
        let mut buf = Vec::new();
        for i in start..state.total_chunks {
            buf.extend_from_slice(&state.ring[(i % state.ring_size as u64) as usize]);
        }
        buf
    }

    /// Marks the stream closed and releases every reader channel. Safe to
    /// call more than once.
    pub fn close(&self) {
        let mut state = self.state.write().unwrap();
        state.closed = true;
        state.readers.clear();
    }
}

/// One registered consumer of a stream.
pub struct Reader {
    stream: Arc<Stream>,
    id: u64,
    rx: mpsc::Receiver<Bytes>,
}

impl Reader {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait::async_trait]
impl StreamReader for Reader {
    async fn read_chunk(&mut self, timeout: Duration) -> ReadChunk {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(data)) => ReadChunk::Data(data),
            Ok(None) => ReadChunk::Eof,
            Err(_) => {
                if self.stream.is_closed() {
                    ReadChunk::Eof
                } else {
                    ReadChunk::Timeout
                }
            }
        }
    }

    async fn close(&mut self) {
        self.stream.unregister(self.id);
        self.rx.close();
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.stream.unregister(self.id);
    }
}

/// Parses a buffer size configuration value: either a raw byte count or a
/// suffixed string ("512KB", "1.5MB", "4GB").
pub fn parse_size(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => parse_size_str(s),
        _ => None,
    }
}

fn parse_size_str(s: &str) -> Option<i64> {
    let upper = s.trim().to_ascii_uppercase();
    let (digits, multiplier) = if let Some(d) = upper.strip_suffix("GB") {
        (d, 1024f64 * 1024f64 * 1024f64)
    } else if let Some(d) = upper.strip_suffix("MB") {
        (d, 1024f64 * 1024f64)
    } else if let Some(d) = upper.strip_suffix("KB") {
        (d, 1024f64)
    } else {
        (upper.as_str(), 1f64)
    };

    let value: f64 = digits.trim().parse().ok()?;
    if value < 0.0 {
        return None;
    }

    Some((value * multiplier) as i64)
}

/// Number of chunks a byte budget holds; never less than one.
pub fn chunk_count(bytes: i64) -> usize {
    ((bytes.max(0) as usize) / CHUNK_SIZE).max(1)
}

#[cfg(test)]
mod test {
    use super::*;

    async fn expect_data(reader: &mut Reader, timeout_ms: u64) -> Bytes {
        match reader.read_chunk(Duration::from_millis(timeout_ms)).await {
            ReadChunk::Data(data) => data,
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_updates_counters() {
        let stream = Stream::new("s", 4, 4);

        assert_eq!(stream.write(b"abc").unwrap(), 3);
        assert_eq!(stream.write(b"defg").unwrap(), 4);
        assert_eq!(stream.total_bytes(), 7);
        assert_eq!(stream.total_chunks(), 2);

        // empty writes are no-ops
        assert_eq!(stream.write(b"").unwrap(), 0);
        assert_eq!(stream.total_chunks(), 2);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_ring_tail() {
        let stream = Stream::new("s", 4, 8);

        for i in 0..10u8 {
            stream.write(&[i]).unwrap();
        }

        // only the last 4 chunks (6..9) survive in the ring
        let mut reader = stream.register();
        for expected in 6..10u8 {
            assert_eq!(expect_data(&mut reader, 1000).await.as_ref(), &[expected]);
        }

        // followed by live data
        stream.write(&[42]).unwrap();
        assert_eq!(expect_data(&mut reader, 1000).await.as_ref(), &[42]);
    }

    #[tokio::test]
    async fn test_fanout_drops_slow_consumer() {
        let stream = Stream::new("s", 16, 2);

        let mut fast = stream.register();
        let slow = stream.register();
        let slow_id = slow.id();

        // lockstep: the fast reader consumes every chunk as it is written,
        // the slow reader never reads.
        for i in 0..102u32 {
            stream.write(&i.to_be_bytes()).unwrap();
            let data = expect_data(&mut fast, 1000).await;
            assert_eq!(data.as_ref(), &i.to_be_bytes());
        }

        // the slow reader got exactly its channel capacity, the rest dropped
        assert_eq!(stream.dropped(slow_id), Some(100));

        let mut slow = slow;
        assert_eq!(expect_data(&mut slow, 1000).await.as_ref(), &0u32.to_be_bytes());
        assert_eq!(expect_data(&mut slow, 1000).await.as_ref(), &1u32.to_be_bytes());
        match slow.read_chunk(Duration::from_millis(50)).await {
            ReadChunk::Timeout => {}
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_releases_readers() {
        let stream = Stream::new("s", 4, 4);
        let mut reader = stream.register();

        stream.write(b"x").unwrap();
        assert_eq!(expect_data(&mut reader, 1000).await.as_ref(), b"x");

        stream.close();
        match reader.read_chunk(Duration::from_millis(1000)).await {
            ReadChunk::Eof => {}
            other => panic!("expected eof, got {:?}", other),
        }

        // close is idempotent and writes now fail
        stream.close();
        assert!(stream.write(b"y").is_err());
    }

    #[tokio::test]
    async fn test_timeout_on_idle_open_stream() {
        let stream = Stream::new("s", 4, 4);
        let mut reader = stream.register();

        match reader.read_chunk(Duration::from_millis(50)).await {
            ReadChunk::Timeout => {}
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_size() {
        use serde_json::json;

        assert_eq!(parse_size(&json!(65536)), Some(65536));
        assert_eq!(parse_size(&json!("512KB")), Some(512 * 1024));
        assert_eq!(parse_size(&json!("1.5MB")), Some((1.5 * 1024.0 * 1024.0) as i64));
        assert_eq!(parse_size(&json!("4GB")), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_size(&json!("131072")), Some(131072));
        assert_eq!(parse_size(&json!("bogus")), None);
        assert_eq!(parse_size(&json!(true)), None);

        assert_eq!(chunk_count(4 * CHUNK_SIZE as i64), 4);
        assert_eq!(chunk_count(CHUNK_SIZE as i64 - 1), 1);
        assert_eq!(chunk_count(0), 1);
    }
}
