pub mod path;

pub use self::path::normalize;

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

/// The error kinds a filesystem operation can fail with. The HTTP surface is
/// the only layer that collapses these into status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidArgument,
    IsDirectory,
    NotDirectory,
    ReadOnly,
    IO,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::IsDirectory => "is a directory",
            ErrorKind::NotDirectory => "not a directory",
            ErrorKind::ReadOnly => "read only",
            ErrorKind::IO => "io error",
            ErrorKind::Other => "error",
        };
        f.write_str(s)
    }
}

/// A tagged filesystem error. Plugins construct these at their boundary,
/// preserving the underlying error text in `message`; the router passes them
/// through untouched so callers always see the originating kind.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{operation} {path}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub operation: String,
    pub path: String,
    pub message: String,
}

impl Error {
    pub fn new<O, P, M>(kind: ErrorKind, operation: O, path: P, message: M) -> Self
    where
        O: Into<String>,
        P: Into<String>,
        M: Into<String>,
    {
        Self {
            kind,
            operation: operation.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn not_found<O, P>(operation: O, path: P) -> Self
    where
        O: Into<String>,
        P: Into<String>,
    {
        Self::new(ErrorKind::NotFound, operation, path, "file does not exist")
    }

    pub fn permission_denied<O, P, M>(operation: O, path: P, message: M) -> Self
    where
        O: Into<String>,
        P: Into<String>,
        M: Into<String>,
    {
        Self::new(ErrorKind::PermissionDenied, operation, path, message)
    }

    pub fn already_exists<O, P>(operation: O, path: P) -> Self
    where
        O: Into<String>,
        P: Into<String>,
    {
        Self::new(ErrorKind::AlreadyExists, operation, path, "file exists")
    }

    pub fn invalid_argument<O, P, M>(operation: O, path: P, message: M) -> Self
    where
        O: Into<String>,
        P: Into<String>,
        M: Into<String>,
    {
        Self::new(ErrorKind::InvalidArgument, operation, path, message)
    }

    pub fn is_directory<O, P>(operation: O, path: P) -> Self
    where
        O: Into<String>,
        P: Into<String>,
    {
        Self::new(ErrorKind::IsDirectory, operation, path, "is a directory")
    }

    pub fn not_directory<O, P>(operation: O, path: P) -> Self
    where
        O: Into<String>,
        P: Into<String>,
    {
        Self::new(ErrorKind::NotDirectory, operation, path, "not a directory")
    }

    pub fn read_only<O, P>(operation: O, path: P) -> Self
    where
        O: Into<String>,
        P: Into<String>,
    {
        Self::new(ErrorKind::ReadOnly, operation, path, "read-only filesystem")
    }

    pub fn io<O, P, M>(operation: O, path: P, message: M) -> Self
    where
        O: Into<String>,
        P: Into<String>,
        M: Into<String>,
    {
        Self::new(ErrorKind::IO, operation, path, message)
    }

    pub fn other<O, P, M>(operation: O, path: P, message: M) -> Self
    where
        O: Into<String>,
        P: Into<String>,
        M: Into<String>,
    {
        Self::new(ErrorKind::Other, operation, path, message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Plugin-provided metadata attached to a directory entry. `name` identifies
/// the producing plugin, `kind` is a plugin-scoped tag ("mount-point",
/// "queue", "control", "stream", "doc", ...).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Meta {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub content: HashMap<String, String>,
}

impl Meta {
    pub fn new<N, K>(name: N, kind: K) -> Self
    where
        N: Into<String>,
        K: Into<String>,
    {
        Self {
            name: name.into(),
            kind: kind.into(),
            content: HashMap::new(),
        }
    }
}

fn epoch() -> SystemTime {
    SystemTime::UNIX_EPOCH
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FileInfo {
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub mode: u32,
    #[serde(rename = "modTime", with = "rfc3339", default = "epoch")]
    pub mod_time: SystemTime,
    #[serde(rename = "isDir", default)]
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl FileInfo {
    pub fn file<N>(name: N, size: i64, mode: u32, mod_time: SystemTime) -> Self
    where
        N: Into<String>,
    {
        Self {
            name: name.into(),
            size,
            mode,
            mod_time,
            is_dir: false,
            meta: None,
        }
    }

    pub fn dir<N>(name: N, mode: u32, mod_time: SystemTime) -> Self
    where
        N: Into<String>,
    {
        Self {
            name: name.into(),
            size: 0,
            mode,
            mod_time,
            is_dir: true,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// modTime is carried as RFC3339 with nanosecond precision on the wire.
mod rfc3339 {
    use std::time::SystemTime;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(t: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let dt: chrono::DateTime<chrono::Utc> = (*t).into();
        serializer.serialize_str(&dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        chrono::DateTime::parse_from_rfc3339(&s)
            .map(SystemTime::from)
            .map_err(serde::de::Error::custom)
    }
}

/// apply_range_read slices `buf` at `offset` for up to `size` bytes, with
/// `size < 0` meaning "to the end". Reading at or past the end is not an
/// error: it returns an empty slice with eof set. The second return value is
/// true when the slice reaches the end of the buffer.
pub fn apply_range_read(buf: &[u8], offset: i64, size: i64) -> (Vec<u8>, bool) {
    let offset = offset.max(0) as usize;
    if offset >= buf.len() {
        return (Vec::new(), true);
    }

    let end = if size < 0 {
        buf.len()
    } else {
        buf.len().min(offset + size as usize)
    };

    (buf[offset..end].to_vec(), end == buf.len())
}

/// The filesystem contract every plugin exposes. Paths handed in are always
/// normalized and relative to the plugin's mount point ("/" is the mount
/// root). Implementations are responsible for their own concurrency safety.
#[async_trait::async_trait]
pub trait FileSystem: Send + Sync {
    async fn create(&self, path: &str) -> Result<()>;
    async fn mkdir(&self, path: &str, perm: u32) -> Result<()>;
    async fn read(&self, path: &str, offset: i64, size: i64) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, data: &[u8]) -> Result<String>;
    async fn remove(&self, path: &str) -> Result<()>;
    async fn remove_all(&self, path: &str) -> Result<()>;
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>>;
    async fn stat(&self, path: &str) -> Result<FileInfo>;
    async fn rename(&self, old: &str, new: &str) -> Result<()>;
    async fn chmod(&self, path: &str, mode: u32) -> Result<()>;

    /// Optional capabilities. The router probes these instead of inspecting
    /// concrete types; the default is "not supported".
    fn as_streamer(&self) -> Option<&dyn Streamer> {
        None
    }

    fn as_toucher(&self) -> Option<&dyn Toucher> {
        None
    }

    fn as_root_setter(&self) -> Option<&dyn RootSetter> {
        None
    }
}

/// A non-owning handle on the whole namespace, injected into plugins that
/// serve arbitrary paths (the plugin holds a back-reference to the router
/// that owns it; Weak breaks the cycle).
pub type RootFs = std::sync::Weak<crate::router::Router>;

/// Chunked-read capability for streaming filesystems.
#[async_trait::async_trait]
pub trait Streamer: Send + Sync {
    async fn open_stream(&self, path: &str) -> Result<Box<dyn StreamReader>>;
}

/// Modtime update without a full rewrite.
#[async_trait::async_trait]
pub trait Toucher: Send + Sync {
    async fn touch(&self, path: &str) -> Result<()>;
}

/// Receives a reference to the whole namespace at mount time.
pub trait RootSetter: Send + Sync {
    fn set_root(&self, root: RootFs);
}

/// The outcome of a single chunked read on a stream.
#[derive(Debug)]
pub enum ReadChunk {
    Data(Bytes),
    Eof,
    /// The timeout expired with the stream still open; callers typically
    /// check liveness and loop.
    Timeout,
}

#[async_trait::async_trait]
pub trait StreamReader: Send {
    async fn read_chunk(&mut self, timeout: Duration) -> ReadChunk;
    async fn close(&mut self);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_range_read() {
        let buf = b"hello world";

        let (data, eof) = apply_range_read(buf, 0, -1);
        assert_eq!(data, buf);
        assert!(eof);

        let (data, eof) = apply_range_read(buf, 6, -1);
        assert_eq!(data, b"world");
        assert!(eof);

        let (data, eof) = apply_range_read(buf, 0, 5);
        assert_eq!(data, b"hello");
        assert!(!eof);

        let (data, eof) = apply_range_read(buf, 6, 100);
        assert_eq!(data, b"world");
        assert!(eof);

        let (data, eof) = apply_range_read(buf, 11, 10);
        assert!(data.is_empty());
        assert!(eof);

        let (data, eof) = apply_range_read(buf, 100, -1);
        assert!(data.is_empty());
        assert!(eof);

        let (data, eof) = apply_range_read(b"", 0, -1);
        assert!(data.is_empty());
        assert!(eof);
    }

    #[test]
    fn test_file_info_json() {
        let info = FileInfo::file("x", 3, 0o644, SystemTime::UNIX_EPOCH)
            .with_meta(Meta::new("memfs", "file"));

        let encoded = serde_json::to_value(&info).unwrap();
        assert_eq!(encoded["name"], "x");
        assert_eq!(encoded["isDir"], false);
        assert_eq!(encoded["modTime"], "1970-01-01T00:00:00Z");
        assert_eq!(encoded["meta"]["type"], "file");

        let back: FileInfo = serde_json::from_value(encoded).unwrap();
        assert_eq!(back.mod_time, SystemTime::UNIX_EPOCH);
        assert_eq!(back.meta.unwrap().name, "memfs");
    }

    #[test]
    fn test_error_display() {
        let err = Error::not_found("read", "/a/b");
        assert_eq!(err.to_string(), "read /a/b: file does not exist");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
