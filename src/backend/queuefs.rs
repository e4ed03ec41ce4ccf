use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use crate::fs::{
    self, apply_range_read, Error, FileInfo, FileSystem, Meta, Result,
};
use crate::plugin::{Config, Plugin};
use crate::queue::{parse_path, sql::SqlBackend, Backend, MemoryBackend, Op, Target};

use super::reject_unknown_keys;

const README: &str = r#"queuefs - message queues

Every directory under this mount is a queue; queue names may be nested
(a/b/c). Each queue exposes five virtual control files:

  enqueue   write a message body here to append it; the response is the
            message id
  dequeue   read to remove and receive the head message as JSON ("{}"
            when the queue is empty)
  peek      like dequeue but non-destructive
  size      read the number of queued messages
  clear     write anything here to drop all messages

Create queues with mkdir, delete them recursively with a recursive
remove. The modification time of "peek" advances strictly monotonically
with every enqueue and can be polled cheaply via stat.

CONFIG:
  backend   "memory" (default) or "sqlite"
  db_path   database file, required for the sqlite backend
"#;

fn nanos_to_time(ns: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_nanos(ns.max(0) as u64)
}

/// Next path segments of `names` below `parent`, deduplicated.
fn child_segments(names: &[String], parent: &str) -> Vec<String> {
    let prefix = if parent.is_empty() {
        String::new()
    } else {
        format!("{}/", parent)
    };

    let mut seen = HashSet::new();
    let mut segments = Vec::new();
    for name in names {
        if name.as_str() == parent {
            continue;
        }
        if let Some(rest) = name.strip_prefix(&prefix) {
            let segment = match rest.find('/') {
                Some(idx) => &rest[..idx],
                None => rest,
            };
            if !segment.is_empty() && seen.insert(segment.to_string()) {
                segments.push(segment.to_string());
            }
        }
    }
    segments
}

/// Multi-queue broker exposed through filesystem operations.
pub struct QueueFs {
    backend: RwLock<Arc<dyn Backend>>,
}

impl QueueFs {
    pub fn new() -> Self {
        Self {
            backend: RwLock::new(Arc::new(MemoryBackend::new())),
        }
    }

    fn backend(&self) -> Arc<dyn Backend> {
        self.backend.read().unwrap().clone()
    }

    /// A queue is visible if it exists outright or is an ancestor prefix of
    /// an existing queue.
    async fn queue_visible(&self, queue: &str) -> Result<bool> {
        let backend = self.backend();
        if backend.queue_exists(queue).await? {
            return Ok(true);
        }
        Ok(!backend.list_queues(queue).await?.is_empty())
    }

    async fn control_info(&self, queue: &str, op: Op) -> Result<FileInfo> {
        let backend = self.backend();

        let (mode, mod_time) = match op {
            Op::Peek => {
                // the poll cursor: strictly increasing across enqueues
                let cursor = backend.last_enqueue_time(queue).await?;
                (0o444, cursor.map(nanos_to_time).unwrap_or_else(SystemTime::now))
            }
            Op::Dequeue | Op::Size => (0o444, SystemTime::now()),
            Op::Enqueue | Op::Clear => (0o222, SystemTime::now()),
        };

        Ok(FileInfo::file(op.name(), 0, mode, mod_time)
            .with_meta(Meta::new("queuefs", "control")))
    }

    fn queue_info(name: &str) -> FileInfo {
        FileInfo::dir(name, 0o755, SystemTime::now()).with_meta(Meta::new("queuefs", "queue"))
    }

    fn readme_info() -> FileInfo {
        FileInfo::file("README", README.len() as i64, 0o444, SystemTime::UNIX_EPOCH)
            .with_meta(Meta::new("queuefs", "doc"))
    }
}

impl Default for QueueFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FileSystem for QueueFs {
    async fn create(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        match parse_path(&path)? {
            Target::Control(_, _) => Err(Error::permission_denied(
                "create",
                &path,
                "control files are virtual",
            )),
            _ => Err(Error::invalid_argument(
                "create",
                &path,
                "queues are created with mkdir",
            )),
        }
    }

    async fn mkdir(&self, path: &str, _perm: u32) -> Result<()> {
        let path = fs::normalize(path)?;
        match parse_path(&path)? {
            Target::Root => Err(Error::already_exists("mkdir", &path)),
            Target::Control(_, _) => Err(Error::permission_denied(
                "mkdir",
                &path,
                "control files are virtual",
            )),
            Target::Queue(queue) => self.backend().create_queue(&queue).await,
        }
    }

    async fn read(&self, path: &str, offset: i64, size: i64) -> Result<Vec<u8>> {
        let path = fs::normalize(path)?;
        if path == "/README" {
            let (data, _) = apply_range_read(README.as_bytes(), offset, size);
            return Ok(data);
        }

        let target = parse_path(&path)?;
        let (queue, op) = match target {
            Target::Control(queue, op) => (queue, op),
            Target::Root => return Err(Error::is_directory("read", &path)),
            Target::Queue(queue) => {
                return if self.queue_visible(&queue).await? {
                    Err(Error::is_directory("read", &path))
                } else {
                    Err(Error::not_found("read", &path))
                };
            }
        };

        let backend = self.backend();
        let body = match op {
            Op::Dequeue => match backend.dequeue(&queue).await? {
                Some(message) => serde_json::to_string(&message)
                    .map_err(|e| Error::io("dequeue", &path, e.to_string()))?,
                None => "{}".to_string(),
            },
            Op::Peek => match backend.peek(&queue).await? {
                Some(message) => serde_json::to_string(&message)
                    .map_err(|e| Error::io("peek", &path, e.to_string()))?,
                None => "{}".to_string(),
            },
            Op::Size => backend.size(&queue).await?.to_string(),
            Op::Enqueue | Op::Clear => {
                return Err(Error::permission_denied(
                    "read",
                    &path,
                    format!("{} is write-only", op.name()),
                ));
            }
        };

        let (data, _) = apply_range_read(body.as_bytes(), offset, size);
        Ok(data)
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<String> {
        let path = fs::normalize(path)?;
        if path == "/README" {
            return Err(Error::permission_denied("write", &path, "README is read-only"));
        }

        match parse_path(&path)? {
            Target::Control(queue, Op::Enqueue) => {
                let message = self.backend().enqueue(&queue, data.to_vec()).await?;
                Ok(message.id)
            }
            Target::Control(queue, Op::Clear) => {
                self.backend().clear(&queue).await?;
                Ok("queue cleared".to_string())
            }
            Target::Control(_, op) => Err(Error::permission_denied(
                "write",
                &path,
                format!("{} is read-only", op.name()),
            )),
            Target::Root | Target::Queue(_) => Err(Error::is_directory("write", &path)),
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        if path == "/README" {
            return Err(Error::permission_denied("remove", &path, "README is read-only"));
        }

        match parse_path(&path)? {
            Target::Root => Err(Error::permission_denied(
                "remove",
                &path,
                "cannot remove the mount root",
            )),
            Target::Control(_, _) => Err(Error::permission_denied(
                "remove",
                &path,
                "control files are virtual",
            )),
            Target::Queue(queue) => self.backend().remove_queue(&queue).await,
        }
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        let backend = self.backend();

        let queue = match parse_path(&path)? {
            Target::Root => String::new(),
            Target::Queue(queue) => queue,
            Target::Control(_, _) => {
                return Err(Error::permission_denied(
                    "remove",
                    &path,
                    "control files are virtual",
                ));
            }
        };

        let names = backend.list_queues(&queue).await?;
        if names.is_empty() && !queue.is_empty() {
            return Err(Error::not_found("remove", &path));
        }
        for name in names {
            backend.remove_queue(&name).await?;
        }
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let path = fs::normalize(path)?;
        let backend = self.backend();

        match parse_path(&path)? {
            Target::Root => {
                let names = backend.list_queues("").await?;
                let mut entries = vec![Self::readme_info()];
                for segment in child_segments(&names, "") {
                    entries.push(Self::queue_info(&segment));
                }
                Ok(entries)
            }
            Target::Queue(queue) => {
                let exists = backend.queue_exists(&queue).await?;
                let names = backend.list_queues(&queue).await?;
                if !exists && names.is_empty() {
                    return Err(Error::not_found("readdir", &path));
                }

                let mut entries = Vec::new();
                if exists {
                    for op in Op::all() {
                        entries.push(self.control_info(&queue, op).await?);
                    }
                }
                for segment in child_segments(&names, &queue) {
                    entries.push(Self::queue_info(&segment));
                }
                Ok(entries)
            }
            Target::Control(_, _) => Err(Error::not_directory("readdir", &path)),
        }
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let path = fs::normalize(path)?;
        if path == "/README" {
            return Ok(Self::readme_info());
        }

        match parse_path(&path)? {
            Target::Root => Ok(FileInfo::dir("/", 0o755, SystemTime::now())
                .with_meta(Meta::new("queuefs", "dir"))),
            Target::Queue(queue) => {
                if self.queue_visible(&queue).await? {
                    Ok(Self::queue_info(fs::path::base(&path)))
                } else {
                    Err(Error::not_found("stat", &path))
                }
            }
            Target::Control(queue, op) => {
                if !self.backend().queue_exists(&queue).await? {
                    return Err(Error::not_found("stat", &path));
                }
                self.control_info(&queue, op).await
            }
        }
    }

    async fn rename(&self, old: &str, _new: &str) -> Result<()> {
        Err(Error::invalid_argument(
            "rename",
            old,
            "queues cannot be renamed",
        ))
    }

    async fn chmod(&self, path: &str, _mode: u32) -> Result<()> {
        Err(Error::permission_denied(
            "chmod",
            path,
            "queue entries have fixed modes",
        ))
    }
}

pub struct QueueFsPlugin {
    fs: Arc<QueueFs>,
}

impl QueueFsPlugin {
    pub fn new() -> Self {
        Self {
            fs: Arc::new(QueueFs::new()),
        }
    }
}

impl Default for QueueFsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Plugin for QueueFsPlugin {
    fn name(&self) -> &str {
        "queuefs"
    }

    async fn validate(&self, config: &Config) -> Result<()> {
        reject_unknown_keys("queuefs", config, &["backend", "db_path"])?;

        match config.get("backend").and_then(|v| v.as_str()) {
            None | Some("memory") => Ok(()),
            Some("sqlite") => {
                if config.get("db_path").and_then(|v| v.as_str()).is_none() {
                    return Err(Error::invalid_argument(
                        "validate",
                        "queuefs",
                        "sqlite backend requires db_path",
                    ));
                }
                Ok(())
            }
            Some(other) => Err(Error::invalid_argument(
                "validate",
                "queuefs",
                format!("unknown backend '{}'", other),
            )),
        }
    }

    async fn initialize(&self, config: &Config) -> Result<()> {
        if let Some("sqlite") = config.get("backend").and_then(|v| v.as_str()) {
            let db_path = config
                .get("db_path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::invalid_argument("initialize", "queuefs", "sqlite backend requires db_path")
                })?;
            let backend = SqlBackend::new(db_path).await?;
            *self.fs.backend.write().unwrap() = Arc::new(backend);
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
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::queue::Message;

    #[tokio::test]
    async fn test_nested_queue_scenario() {
        let fs = QueueFs::new();

        fs.mkdir("/logs/errors", 0o755).await.unwrap();

        // the peek cursor advances strictly even for back-to-back enqueues
        let mut last = SystemTime::UNIX_EPOCH;
        for body in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
            fs.write("/logs/errors/enqueue", body).await.unwrap();
            let info = fs.stat("/logs/errors/peek").await.unwrap();
            assert!(info.mod_time > last, "cursor must advance");
            last = info.mod_time;
        }

        let size = fs.read("/logs/errors/size", 0, -1).await.unwrap();
        assert_eq!(size, b"3");

        for expected in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
            let body = fs.read("/logs/errors/dequeue", 0, -1).await.unwrap();
            let message: Message = serde_json::from_slice(&body).unwrap();
            assert_eq!(message.data, expected.to_vec());
        }

        let body = fs.read("/logs/errors/dequeue", 0, -1).await.unwrap();
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn test_enqueue_returns_message_id() {
        let fs = QueueFs::new();

        fs.mkdir("/q", 0o755).await.unwrap();
        let id = fs.write("/q/enqueue", b"payload").await.unwrap();

        let body = fs.read("/q/peek", 0, -1).await.unwrap();
        let message: Message = serde_json::from_slice(&body).unwrap();
        assert_eq!(message.id, id);
    }

    #[tokio::test]
    async fn test_control_file_permissions() {
        let fs = QueueFs::new();
        fs.mkdir("/q", 0o755).await.unwrap();

        // wrong direction
        assert!(fs.read("/q/enqueue", 0, -1).await.is_err());
        assert!(fs.write("/q/dequeue", b"x").await.is_err());

        // virtual files cannot be created, removed or chmod'd
        assert!(fs.create("/q/peek").await.is_err());
        assert!(fs.remove("/q/size").await.is_err());
        assert!(fs.chmod("/q/clear", 0o777).await.is_err());
    }

    #[tokio::test]
    async fn test_readdir_shows_controls_and_children() {
        let fs = QueueFs::new();

        fs.mkdir("/logs", 0o755).await.unwrap();
        fs.mkdir("/logs/errors", 0o755).await.unwrap();

        let entries = fs.read_dir("/logs").await.unwrap();
        let mut names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["clear", "dequeue", "enqueue", "errors", "peek", "size"]
        );

        let errors = entries.iter().find(|e| e.name == "errors").unwrap();
        assert!(errors.is_dir);
        assert_eq!(errors.meta.as_ref().unwrap().kind, "queue");

        let root = fs.read_dir("/").await.unwrap();
        assert!(root.iter().any(|e| e.name == "README"));
        assert!(root.iter().any(|e| e.name == "logs"));
    }

    #[tokio::test]
    async fn test_remove_all_is_recursive() {
        let fs = QueueFs::new();

        fs.mkdir("/a", 0o755).await.unwrap();
        fs.mkdir("/a/b", 0o755).await.unwrap();
        fs.mkdir("/a/b/c", 0o755).await.unwrap();
        fs.mkdir("/ax", 0o755).await.unwrap();

        fs.remove_all("/a").await.unwrap();

        assert!(fs.stat("/a/b").await.is_err());
        assert!(fs.stat("/a").await.is_err());
        // the sibling sharing a name prefix survives
        assert!(fs.stat("/ax").await.is_ok());
    }

    #[tokio::test]
    async fn test_clear_via_write() {
        let fs = QueueFs::new();

        fs.mkdir("/q", 0o755).await.unwrap();
        fs.write("/q/enqueue", b"one").await.unwrap();
        fs.write("/q/enqueue", b"two").await.unwrap();
        fs.write("/q/clear", b"").await.unwrap();

        assert_eq!(fs.read("/q/size", 0, -1).await.unwrap(), b"0");
    }

    #[tokio::test]
    async fn test_implicit_ancestors_visible() {
        let fs = QueueFs::new();

        fs.mkdir("/a/b/c", 0o755).await.unwrap();

        // "/a" and "/a/b" exist only as prefixes, still stat as directories
        assert!(fs.stat("/a").await.unwrap().is_dir);
        let entries = fs.read_dir("/a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");

        // but they expose no control files
        assert!(fs.stat("/a/peek").await.is_err());
    }

    #[tokio::test]
    async fn test_bare_operation_rejected() {
        let fs = QueueFs::new();

        let err = fs.read("/dequeue", 0, -1).await.unwrap_err();
        assert_eq!(err.kind, crate::fs::ErrorKind::InvalidArgument);
    }
}
