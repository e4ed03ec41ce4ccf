pub mod sql;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fs::{Error, Result};

/// Queue control operations, exposed as virtual files under each queue
/// directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Enqueue,
    Dequeue,
    Peek,
    Size,
    Clear,
}

impl Op {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "enqueue" => Some(Op::Enqueue),
            "dequeue" => Some(Op::Dequeue),
            "peek" => Some(Op::Peek),
            "size" => Some(Op::Size),
            "clear" => Some(Op::Clear),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Enqueue => "enqueue",
            Op::Dequeue => "dequeue",
            Op::Peek => "peek",
            Op::Size => "size",
            Op::Clear => "clear",
        }
    }

    pub fn all() -> [Op; 5] {
        [Op::Enqueue, Op::Dequeue, Op::Peek, Op::Size, Op::Clear]
    }

    /// enqueue and clear are write-only, the rest read-only.
    pub fn writable(&self) -> bool {
        matches!(self, Op::Enqueue | Op::Clear)
    }
}

/// What a path under a queue mount addresses.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Root,
    Queue(String),
    Control(String, Op),
}

/// Splits a queue path: if the final segment names a control operation the
/// prefix is the queue (queue names may span multiple segments), otherwise
/// the whole path is a queue name. An operation with no queue prefix is
/// rejected.
pub fn parse_path(path: &str) -> Result<Target> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Target::Root);
    }

    let (prefix, last) = match trimmed.rsplit_once('/') {
        Some((prefix, last)) => (prefix, last),
        None => ("", trimmed),
    };

    match Op::from_name(last) {
        Some(op) if !prefix.is_empty() => Ok(Target::Control(prefix.to_string(), op)),
        Some(op) => Err(Error::invalid_argument(
            "parse",
            path,
            format!("operation '{}' requires a queue name", op.name()),
        )),
        None => Ok(Target::Queue(trimmed.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    /// Unix nanoseconds.
    pub timestamp: i64,
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Advances a last-enqueue cursor: wall clock when it moved forward,
/// otherwise one tick past the previous value. This keeps the poll cursor
/// strictly increasing even for back-to-back enqueues.
pub fn next_enqueue_time(last: i64) -> i64 {
    let now = now_nanos();
    if now > last {
        now
    } else {
        last + 1
    }
}

/// Queue persistence contract. The broker addresses queues by flat name
/// (which may contain slashes); hierarchy is derived from name prefixes.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Appends a message and returns it. Creates the queue if missing.
    async fn enqueue(&self, queue: &str, data: Vec<u8>) -> Result<Message>;
    /// Removes and returns the head, or None when empty.
    async fn dequeue(&self, queue: &str) -> Result<Option<Message>>;
    /// Returns the head without removing it.
    async fn peek(&self, queue: &str) -> Result<Option<Message>>;
    async fn size(&self, queue: &str) -> Result<u64>;
    /// Drops every message and resets the enqueue cursor.
    async fn clear(&self, queue: &str) -> Result<()>;
    /// Queues whose name equals `prefix` or starts with `prefix + "/"`;
    /// every queue when `prefix` is empty.
    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>>;
    /// Unix-nanosecond cursor of the last enqueue; None when the queue has
    /// never received a message.
    async fn last_enqueue_time(&self, queue: &str) -> Result<Option<i64>>;
    async fn remove_queue(&self, queue: &str) -> Result<()>;
    async fn create_queue(&self, queue: &str) -> Result<()>;
    async fn queue_exists(&self, queue: &str) -> Result<bool>;
}

/// In-memory queue store: a top-level map lock plus one lock per queue.
#[derive(Default)]
pub struct MemoryBackend {
    queues: RwLock<HashMap<String, Arc<Mutex<QueueState>>>>,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Message>,
    last_enqueue: i64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Option<Arc<Mutex<QueueState>>> {
        self.queues.read().unwrap().get(name).cloned()
    }

    fn queue_or_create(&self, name: &str) -> Arc<Mutex<QueueState>> {
        if let Some(q) = self.queue(name) {
            return q;
        }
        let mut queues = self.queues.write().unwrap();
        queues
            .entry(name.to_string())
            .or_insert_with(Default::default)
            .clone()
    }

    fn require(&self, operation: &str, name: &str) -> Result<Arc<Mutex<QueueState>>> {
        self.queue(name)
            .ok_or_else(|| Error::not_found(operation, name))
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn enqueue(&self, queue: &str, data: Vec<u8>) -> Result<Message> {
        let q = self.queue_or_create(queue);
        let mut state = q.lock().unwrap();

        let ts = next_enqueue_time(state.last_enqueue);
        state.last_enqueue = ts;

        let message = Message {
            id: ts.to_string(),
            data,
            timestamp: ts,
        };
        state.messages.push_back(message.clone());
        Ok(message)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Message>> {
        let q = self.require("dequeue", queue)?;
        let mut state = q.lock().unwrap();
        Ok(state.messages.pop_front())
    }

    async fn peek(&self, queue: &str) -> Result<Option<Message>> {
        let q = self.require("peek", queue)?;
        let state = q.lock().unwrap();
        Ok(state.messages.front().cloned())
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        let q = self.require("size", queue)?;
        let state = q.lock().unwrap();
        Ok(state.messages.len() as u64)
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        let q = self.require("clear", queue)?;
        let mut state = q.lock().unwrap();
        state.messages.clear();
        state.last_enqueue = 0;
        Ok(())
    }

    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>> {
        let queues = self.queues.read().unwrap();
        let nested = format!("{}/", prefix);
        Ok(queues
            .keys()
            .filter(|name| prefix.is_empty() || *name == prefix || name.starts_with(&nested))
            .cloned()
            .collect())
    }

    async fn last_enqueue_time(&self, queue: &str) -> Result<Option<i64>> {
        let q = self.require("stat", queue)?;
        let state = q.lock().unwrap();
        Ok(if state.last_enqueue == 0 {
            None
        } else {
            Some(state.last_enqueue)
        })
    }

    async fn remove_queue(&self, queue: &str) -> Result<()> {
        let mut queues = self.queues.write().unwrap();
        queues
            .remove(queue)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("remove", queue))
    }

    async fn create_queue(&self, queue: &str) -> Result<()> {
        let mut queues = self.queues.write().unwrap();
        if queues.contains_key(queue) {
            return Err(Error::already_exists("mkdir", queue));
        }
        queues.insert(queue.to_string(), Default::default());
        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        Ok(self.queues.read().unwrap().contains_key(queue))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("").unwrap(), Target::Root);
        assert_eq!(parse_path("/").unwrap(), Target::Root);
        assert_eq!(
            parse_path("/logs").unwrap(),
            Target::Queue("logs".to_string())
        );
        assert_eq!(
            parse_path("/logs/errors").unwrap(),
            Target::Queue("logs/errors".to_string())
        );
        assert_eq!(
            parse_path("/logs/enqueue").unwrap(),
            Target::Control("logs".to_string(), Op::Enqueue)
        );
        assert_eq!(
            parse_path("/logs/errors/dequeue").unwrap(),
            Target::Control("logs/errors".to_string(), Op::Dequeue)
        );
        // a bare operation has no queue to act on
        assert!(parse_path("/peek").is_err());
    }

    #[test]
    fn test_message_json() {
        let message = Message {
            id: "123".to_string(),
            data: b"hello".to_vec(),
            timestamp: 123,
        };

        let encoded = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, message);
        assert!(encoded.contains("aGVsbG8="));
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_order() {
        let backend = MemoryBackend::new();

        for data in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
            backend.enqueue("q", data.to_vec()).await.unwrap();
        }

        assert_eq!(backend.size("q").await.unwrap(), 3);
        assert_eq!(
            backend.peek("q").await.unwrap().unwrap().data,
            b"a".to_vec()
        );
        assert_eq!(backend.size("q").await.unwrap(), 3);

        for expected in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
            let message = backend.dequeue("q").await.unwrap().unwrap();
            assert_eq!(message.data, expected.to_vec());
        }
        assert!(backend.dequeue("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_monotonic_cursor() {
        let backend = MemoryBackend::new();

        let mut last = 0;
        for _ in 0..100 {
            backend.enqueue("q", b"x".to_vec()).await.unwrap();
            let cursor = backend.last_enqueue_time("q").await.unwrap().unwrap();
            assert!(cursor > last, "cursor must be strictly increasing");
            last = cursor;
        }
    }

    #[tokio::test]
    async fn test_message_ids_unique() {
        let backend = MemoryBackend::new();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let message = backend.enqueue("q", b"x".to_vec()).await.unwrap();
            assert!(seen.insert(message.id.clone()), "duplicate id {}", message.id);
        }
    }

    #[tokio::test]
    async fn test_clear_resets_cursor() {
        let backend = MemoryBackend::new();

        backend.enqueue("q", b"x".to_vec()).await.unwrap();
        backend.clear("q").await.unwrap();

        assert_eq!(backend.size("q").await.unwrap(), 0);
        assert!(backend.last_enqueue_time("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_queues_prefix() {
        let backend = MemoryBackend::new();

        for name in ["logs", "logs/errors", "logs/errors/fatal", "metrics", "logserver"] {
            backend.create_queue(name).await.unwrap();
        }

        let mut all = backend.list_queues("").await.unwrap();
        all.sort();
        assert_eq!(all.len(), 5);

        let mut under_logs = backend.list_queues("logs").await.unwrap();
        under_logs.sort();
        // prefix matching is segment-aware: "logserver" stays out
        assert_eq!(under_logs, vec!["logs", "logs/errors", "logs/errors/fatal"]);
    }

    #[tokio::test]
    async fn test_missing_queue_errors() {
        let backend = MemoryBackend::new();

        assert!(backend.dequeue("nope").await.is_err());
        assert!(backend.peek("nope").await.is_err());
        assert!(backend.size("nope").await.is_err());
        assert!(!backend.queue_exists("nope").await.unwrap());

        backend.create_queue("q").await.unwrap();
        assert!(backend.create_queue("q").await.is_err());
    }
}
