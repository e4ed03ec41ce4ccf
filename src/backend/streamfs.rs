use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::fs::{
    self, apply_range_read, Error, FileInfo, FileSystem, Meta, Result, StreamReader, Streamer,
};
use crate::plugin::{Config, Plugin};
use crate::stream::{self, Stream, DEFAULT_CHANNEL_CHUNKS, DEFAULT_RING_CHUNKS};

use super::reject_unknown_keys;

const README: &str = r#"streamfs - streaming pipes

Every file under this mount is a one-writer/many-reader pipe. Writers
append chunks; readers receive them live, and late joiners replay the
recent history kept in a ring buffer. Slow readers are never allowed to
block the writer: chunks they cannot keep up with are dropped for them
alone.

USAGE:
  write:  PUT /api/v1/files?path=/streams/events
  read:   GET /api/v1/files?path=/streams/events&stream=true

CONFIG:
  ring_buffer_size     bytes of history kept per stream ("512KB", "4MB", raw)
  channel_buffer_size  bytes buffered per reader before drops start

Streams are in-memory only and append-only.
"#;

struct Sizes {
    ring_chunks: usize,
    channel_chunks: usize,
}

/// Named streams addressed as files directly under the mount root.
pub struct StreamFs {
    streams: RwLock<HashMap<String, Arc<Stream>>>,
    sizes: RwLock<Sizes>,
}

impl StreamFs {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            sizes: RwLock::new(Sizes {
                ring_chunks: DEFAULT_RING_CHUNKS,
                channel_chunks: DEFAULT_CHANNEL_CHUNKS,
            }),
        }
    }

    fn stream(&self, path: &str) -> Option<Arc<Stream>> {
        self.streams.read().unwrap().get(path).cloned()
    }

    /// Streams are auto-created on first write or first reader.
    fn stream_or_create(&self, path: &str) -> Arc<Stream> {
        if let Some(s) = self.stream(path) {
            return s;
        }

        let (ring, channel) = {
            let sizes = self.sizes.read().unwrap();
            (sizes.ring_chunks, sizes.channel_chunks)
        };

        let mut streams = self.streams.write().unwrap();
        streams
            .entry(path.to_string())
            .or_insert_with(|| Stream::new(path, ring, channel))
            .clone()
    }

    fn stream_info(path: &str, stream: &Stream) -> FileInfo {
        FileInfo::file(
            fs::path::base(path),
            stream.total_bytes(),
            0o644,
            stream.mod_time(),
        )
        .with_meta(Meta::new("streamfs", "stream"))
    }

    fn readme_info() -> FileInfo {
        FileInfo::file("README", README.len() as i64, 0o444, SystemTime::UNIX_EPOCH)
            .with_meta(Meta::new("streamfs", "doc"))
    }
}

impl Default for StreamFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FileSystem for StreamFs {
    async fn create(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        if path == "/" {
            return Err(Error::is_directory("create", &path));
        }
        if path == "/README" {
            return Err(Error::already_exists("create", &path));
        }
        if self.stream(&path).is_some() {
            return Err(Error::already_exists("create", &path));
        }

        self.stream_or_create(&path);
        Ok(())
    }

    async fn mkdir(&self, path: &str, _perm: u32) -> Result<()> {
        let path = fs::normalize(path)?;
        Err(Error::invalid_argument(
            "mkdir",
            &path,
            "streamfs does not support directories",
        ))
    }

    async fn read(&self, path: &str, offset: i64, size: i64) -> Result<Vec<u8>> {
        let path = fs::normalize(path)?;
        if path == "/" {
            return Err(Error::is_directory("read", &path));
        }
        if path == "/README" {
            let (data, _) = apply_range_read(README.as_bytes(), offset, size);
            return Ok(data);
        }

        let stream = self
            .stream(&path)
            .ok_or_else(|| Error::not_found("read", &path))?;
        let (data, _) = apply_range_read(&stream.buffered_bytes(), offset, size);
        Ok(data)
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<String> {
        let path = fs::normalize(path)?;
        if path == "/" {
            return Err(Error::is_directory("write", &path));
        }
        if path == "/README" {
            return Err(Error::permission_denied("write", &path, "README is read-only"));
        }

        let stream = self.stream_or_create(&path);
        let written = stream.write(data)?;
        Ok(format!("{} bytes written", written))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        if path == "/" || path == "/README" {
            return Err(Error::permission_denied("remove", &path, "cannot remove"));
        }

        let mut streams = self.streams.write().unwrap();
        match streams.remove(&path) {
            Some(stream) => {
                stream.close();
                Ok(())
            }
            None => Err(Error::not_found("remove", &path)),
        }
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        if path == "/" {
            let mut streams = self.streams.write().unwrap();
            for stream in streams.values() {
                stream.close();
            }
            streams.clear();
            return Ok(());
        }
        self.remove(&path).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let path = fs::normalize(path)?;
        if path != "/" {
            if self.stream(&path).is_some() || path == "/README" {
                return Err(Error::not_directory("readdir", &path));
            }
            return Err(Error::not_found("readdir", &path));
        }

        let mut entries = vec![Self::readme_info()];
        let streams = self.streams.read().unwrap();
        for (name, stream) in streams.iter() {
            entries.push(Self::stream_info(name, stream));
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let path = fs::normalize(path)?;
        if path == "/" {
            return Ok(FileInfo::dir("/", 0o755, SystemTime::now())
                .with_meta(Meta::new("streamfs", "dir")));
        }
        if path == "/README" {
            return Ok(Self::readme_info());
        }

        let stream = self
            .stream(&path)
            .ok_or_else(|| Error::not_found("stat", &path))?;
        Ok(Self::stream_info(&path, &stream))
    }

    async fn rename(&self, old: &str, _new: &str) -> Result<()> {
        Err(Error::invalid_argument(
            "rename",
            old,
            "streams cannot be renamed",
        ))
    }

    async fn chmod(&self, path: &str, _mode: u32) -> Result<()> {
        Err(Error::permission_denied(
            "chmod",
            path,
            "stream modes are fixed",
        ))
    }

    fn as_streamer(&self) -> Option<&dyn Streamer> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Streamer for StreamFs {
    async fn open_stream(&self, path: &str) -> Result<Box<dyn StreamReader>> {
        let path = fs::normalize(path)?;
        if path == "/" || path == "/README" {
            return Err(Error::invalid_argument("open_stream", &path, "not a stream"));
        }

        let stream = self.stream_or_create(&path);
        Ok(Box::new(stream.register()))
    }
}

pub struct StreamFsPlugin {
    fs: Arc<StreamFs>,
}

impl StreamFsPlugin {
    pub fn new() -> Self {
        Self {
            fs: Arc::new(StreamFs::new()),
        }
    }
}

impl Default for StreamFsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_chunks(config: &Config, key: &str) -> Result<Option<usize>> {
    match config.get(key) {
        None => Ok(None),
        Some(value) => {
            let bytes = stream::parse_size(value).ok_or_else(|| {
                Error::invalid_argument(
                    "validate",
                    "streamfs",
                    format!("invalid {}: {}", key, value),
                )
            })?;
            Ok(Some(stream::chunk_count(bytes)))
        }
    }
}

#[async_trait::async_trait]
impl Plugin for StreamFsPlugin {
    fn name(&self) -> &str {
        "streamfs"
    }

    async fn validate(&self, config: &Config) -> Result<()> {
        reject_unknown_keys(
            "streamfs",
            config,
            &["channel_buffer_size", "ring_buffer_size"],
        )?;
        parse_chunks(config, "channel_buffer_size")?;
        parse_chunks(config, "ring_buffer_size")?;
        Ok(())
    }

    async fn initialize(&self, config: &Config) -> Result<()> {
        let mut sizes = self.fs.sizes.write().unwrap();
        if let Some(chunks) = parse_chunks(config, "ring_buffer_size")? {
            sizes.ring_chunks = chunks;
        }
        if let Some(chunks) = parse_chunks(config, "channel_buffer_size")? {
            sizes.channel_chunks = chunks;
        }
        Ok(())
    }

    fn filesystem(&self) -> Arc<dyn FileSystem> {
        self.fs.clone()
    }

    fn readme(&self) -> String {
        README.to_string()
    }

    async fn shutdown(&self) -> Result<()> {
        let mut streams = self.fs.streams.write().unwrap();
        for stream in streams.values() {
            stream.close();
        }
        streams.clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::fs::ReadChunk;
    use crate::stream::CHUNK_SIZE;

    async fn expect_data(reader: &mut Box<dyn StreamReader>, len: usize) -> bytes::Bytes {
        match reader.read_chunk(Duration::from_millis(1000)).await {
            ReadChunk::Data(data) => {
                assert_eq!(data.len(), len);
                data
            }
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_config_sets_buffer_sizes() {
        let plugin = StreamFsPlugin::new();

        let mut config = Config::new();
        config.insert(
            "ring_buffer_size".to_string(),
            serde_json::json!(format!("{}", 4 * CHUNK_SIZE)),
        );
        config.insert(
            "channel_buffer_size".to_string(),
            serde_json::json!(2 * CHUNK_SIZE as i64),
        );

        plugin.validate(&config).await.unwrap();
        plugin.initialize(&config).await.unwrap();

        let sizes = plugin.fs.sizes.read().unwrap();
        assert_eq!(sizes.ring_chunks, 4);
        assert_eq!(sizes.channel_chunks, 2);
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_size() {
        let plugin = StreamFsPlugin::new();

        let mut config = Config::new();
        config.insert("ring_buffer_size".to_string(), serde_json::json!("many"));
        assert!(plugin.validate(&config).await.is_err());

        let mut config = Config::new();
        config.insert("surprise".to_string(), serde_json::json!(1));
        assert!(plugin.validate(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_late_joiner_replays_ring() {
        let plugin = StreamFsPlugin::new();
        let mut config = Config::new();
        config.insert(
            "ring_buffer_size".to_string(),
            serde_json::json!(4 * CHUNK_SIZE as i64),
        );
        config.insert(
            "channel_buffer_size".to_string(),
            serde_json::json!(8 * CHUNK_SIZE as i64),
        );
        plugin.initialize(&config).await.unwrap();
        let fs = plugin.fs.clone();

        // ten full-size chunks, each filled with its index
        for i in 0..10u8 {
            fs.write("/events", &vec![i; CHUNK_SIZE]).await.unwrap();
        }

        let mut reader = fs.open_stream("/events").await.unwrap();
        for expected in 6..10u8 {
            let data = expect_data(&mut reader, CHUNK_SIZE).await;
            assert!(data.iter().all(|b| *b == expected));
        }

        // live chunk follows the replayed history
        fs.write("/events", &vec![42u8; CHUNK_SIZE]).await.unwrap();
        let data = expect_data(&mut reader, CHUNK_SIZE).await;
        assert!(data.iter().all(|b| *b == 42));

        // stat.size reflects total bytes ever written
        let info = fs.stat("/events").await.unwrap();
        assert_eq!(info.size, 11 * CHUNK_SIZE as i64);
        assert_eq!(info.meta.as_ref().unwrap().kind, "stream");

        reader.close().await;
    }

    #[tokio::test]
    async fn test_plain_read_sees_buffered_tail() {
        let fs = StreamFs::new();

        fs.write("/s", b"abc").await.unwrap();
        fs.write("/s", b"def").await.unwrap();
        assert_eq!(fs.read("/s", 0, -1).await.unwrap(), b"abcdef");
        assert_eq!(fs.read("/s", 2, 2).await.unwrap(), b"cd");
    }

    #[tokio::test]
    async fn test_readme_is_read_only() {
        let fs = StreamFs::new();

        assert!(fs.read("/README", 0, -1).await.unwrap().starts_with(b"streamfs"));
        assert!(fs.write("/README", b"x").await.is_err());
        assert!(fs.remove("/README").await.is_err());

        let entries = fs.read_dir("/").await.unwrap();
        assert!(entries.iter().any(|e| e.name == "README"));
    }

    #[tokio::test]
    async fn test_remove_closes_stream() {
        let fs = StreamFs::new();

        fs.write("/s", b"x").await.unwrap();
        let mut reader = fs.open_stream("/s").await.unwrap();
        fs.remove("/s").await.unwrap();

        // drain the replayed chunk, then the closed stream ends the reader
        match reader.read_chunk(Duration::from_millis(1000)).await {
            ReadChunk::Data(_) => {}
            other => panic!("expected buffered data, got {:?}", other),
        }
        match reader.read_chunk(Duration::from_millis(1000)).await {
            ReadChunk::Eof => {}
            other => panic!("expected eof, got {:?}", other),
        }
    }
}

