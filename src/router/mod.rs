use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::fs::{
    self, Error, ErrorKind, FileInfo, FileSystem, Meta, Result, StreamReader, Toucher,
};
use crate::plugin::{Config, Plugin};

/// A binding of a virtual path to a plugin instance.
pub struct MountPoint {
    pub path: String,
    pub plugin: Arc<dyn Plugin>,
    pub config: Config,
}

#[derive(Default)]
struct MountTable {
    by_path: HashMap<String, Arc<MountPoint>>,
    /// Sorted by decreasing path length; the first match wins, so the most
    /// specific mount shadows its ancestors.
    ordered: Vec<Arc<MountPoint>>,
    /// Insertion order, used for reverse-order shutdown.
    sequence: Vec<String>,
}

/// Routes every filesystem operation to the owning mount by longest-prefix
/// match, synthesizing directory entries for mount-point ancestors that no
/// plugin serves.
#[derive(Default)]
pub struct Router {
    mounts: RwLock<MountTable>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts a mount. The path must already be normalized.
    pub fn add(&self, mount: MountPoint) -> Result<()> {
        let mut table = self.mounts.write().unwrap();
        if table.by_path.contains_key(&mount.path) {
            return Err(Error::already_exists("mount", &mount.path));
        }

        let mount = Arc::new(mount);
        table.by_path.insert(mount.path.clone(), mount.clone());
        table.sequence.push(mount.path.clone());
        table.ordered.push(mount);
        table.ordered.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Ok(())
    }

    pub fn remove(&self, path: &str) -> Result<Arc<MountPoint>> {
        let mut table = self.mounts.write().unwrap();
        let mount = table
            .by_path
            .remove(path)
            .ok_or_else(|| Error::not_found("unmount", path))?;
        table.ordered.retain(|m| m.path != path);
        table.sequence.retain(|p| p != path);
        Ok(mount)
    }

    pub fn is_mounted(&self, path: &str) -> bool {
        self.mounts.read().unwrap().by_path.contains_key(path)
    }

    /// All mounts in mount order.
    pub fn mounts(&self) -> Vec<Arc<MountPoint>> {
        let table = self.mounts.read().unwrap();
        table
            .sequence
            .iter()
            .filter_map(|p| table.by_path.get(p).cloned())
            .collect()
    }

    /// Longest-prefix resolution: a mount at M matches P iff P == M or P
    /// starts with M + "/". Returns the owning mount and the path relative
    /// to it ("/" for an exact match). The lock is released before the
    /// caller talks to the plugin.
    pub fn resolve(&self, path: &str) -> Option<(Arc<MountPoint>, String)> {
        let table = self.mounts.read().unwrap();
        for mount in &table.ordered {
            if path == mount.path {
                return Some((mount.clone(), "/".to_string()));
            }
            if mount.path == "/" {
                return Some((mount.clone(), path.to_string()));
            }
            let prefix = format!("{}/", mount.path);
            if path.starts_with(&prefix) {
                return Some((mount.clone(), path[mount.path.len()..].to_string()));
            }
        }
        None
    }

    /// Distinct next path segments of mounts strictly below `path`.
    fn child_mount_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        let table = self.mounts.read().unwrap();
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for mount in &table.ordered {
            if mount.path == path || !mount.path.starts_with(&prefix) {
                continue;
            }
            let name = fs::path::first_segment(&mount.path[prefix.len() - 1..]);
            if !name.is_empty() && seen.insert(name.to_string()) {
                names.push(name.to_string());
            }
        }
        names
    }

    fn synthetic_dir(name: &str) -> FileInfo {
        FileInfo::dir(name, 0o755, SystemTime::now()).with_meta(Meta::new("router", "mount-point"))
    }

    /// Updates a file's modtime. Delegates to the plugin when it supports the
    /// capability, otherwise falls back to a read + rewrite (or an empty
    /// write for a missing file).
    pub async fn touch(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        let (mount, rel) = self
            .resolve(&path)
            .ok_or_else(|| Error::not_found("touch", &path))?;
        let fsys = mount.plugin.filesystem();

        if let Some(toucher) = fsys.as_toucher() {
            return Toucher::touch(toucher, &rel).await;
        }

        match fsys.stat(&rel).await {
            Ok(info) if info.is_dir => Err(Error::invalid_argument(
                "touch",
                &path,
                "cannot touch a directory",
            )),
            Ok(_) => {
                let data = fsys.read(&rel, 0, -1).await?;
                fsys.write(&rel, &data).await.map(|_| ())
            }
            Err(err) if err.kind == ErrorKind::NotFound => {
                fsys.write(&rel, &[]).await.map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    /// Opens a chunked reader on a stream path. Fails unless the resolved
    /// plugin supports streaming.
    pub async fn open_stream(&self, path: &str) -> Result<Box<dyn StreamReader>> {
        let path = fs::normalize(path)?;
        let (mount, rel) = self
            .resolve(&path)
            .ok_or_else(|| Error::not_found("open_stream", &path))?;
        let fsys = mount.plugin.filesystem();

        match fsys.as_streamer() {
            Some(streamer) => streamer.open_stream(&rel).await,
            None => Err(Error::invalid_argument(
                "open_stream",
                &path,
                "filesystem does not support streaming",
            )),
        }
    }
}

#[async_trait::async_trait]
impl FileSystem for Router {
    async fn create(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        match self.resolve(&path) {
            Some((mount, rel)) => mount.plugin.filesystem().create(&rel).await,
            None => Err(Error::permission_denied(
                "create",
                &path,
                "no filesystem mounted at this path",
            )),
        }
    }

    async fn mkdir(&self, path: &str, perm: u32) -> Result<()> {
        let path = fs::normalize(path)?;
        match self.resolve(&path) {
            Some((mount, rel)) => mount.plugin.filesystem().mkdir(&rel, perm).await,
            None => Err(Error::permission_denied(
                "mkdir",
                &path,
                "no filesystem mounted at this path",
            )),
        }
    }

    async fn read(&self, path: &str, offset: i64, size: i64) -> Result<Vec<u8>> {
        let path = fs::normalize(path)?;
        match self.resolve(&path) {
            Some((mount, rel)) => mount.plugin.filesystem().read(&rel, offset, size).await,
            None => Err(Error::not_found("read", &path)),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<String> {
        let path = fs::normalize(path)?;
        match self.resolve(&path) {
            Some((mount, rel)) => mount.plugin.filesystem().write(&rel, data).await,
            None => Err(Error::not_found("write", &path)),
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        match self.resolve(&path) {
            Some((mount, rel)) => mount.plugin.filesystem().remove(&rel).await,
            None => Err(Error::not_found("remove", &path)),
        }
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        match self.resolve(&path) {
            Some((mount, rel)) => mount.plugin.filesystem().remove_all(&rel).await,
            None => Err(Error::not_found("remove", &path)),
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let path = fs::normalize(path)?;

        match self.resolve(&path) {
            Some((mount, rel)) => {
                let mut entries = mount.plugin.filesystem().read_dir(&rel).await?;

                // mounts nested inside this plugin's namespace appear as
                // extra directory entries
                let present: HashSet<String> =
                    entries.iter().map(|e| e.name.clone()).collect();
                for child in self.child_mount_names(&path) {
                    if !present.contains(&child) {
                        entries.push(Self::synthetic_dir(&child));
                    }
                }
                Ok(entries)
            }
            None => {
                let children = self.child_mount_names(&path);
                if children.is_empty() && path != "/" {
                    return Err(Error::not_found("readdir", &path));
                }
                Ok(children
                    .iter()
                    .map(|name| Self::synthetic_dir(name))
                    .collect())
            }
        }
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let path = fs::normalize(path)?;

        match self.resolve(&path) {
            Some((mount, rel)) => mount.plugin.filesystem().stat(&rel).await,
            None => {
                if path == "/" || !self.child_mount_names(&path).is_empty() {
                    let name = if path == "/" {
                        "/".to_string()
                    } else {
                        fs::path::base(&path).to_string()
                    };
                    Ok(Self::synthetic_dir(&name))
                } else {
                    Err(Error::not_found("stat", &path))
                }
            }
        }
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = fs::normalize(old)?;
        let new = fs::normalize(new)?;

        let (old_mount, old_rel) = self
            .resolve(&old)
            .ok_or_else(|| Error::not_found("rename", &old))?;
        let (new_mount, new_rel) = self
            .resolve(&new)
            .ok_or_else(|| Error::not_found("rename", &new))?;

        if !Arc::ptr_eq(&old_mount, &new_mount) {
            return Err(Error::invalid_argument(
                "rename",
                &old,
                "cannot rename across different mounts",
            ));
        }

        old_mount
            .plugin
            .filesystem()
            .rename(&old_rel, &new_rel)
            .await
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let path = fs::normalize(path)?;
        match self.resolve(&path) {
            Some((mount, rel)) => mount.plugin.filesystem().chmod(&rel, mode).await,
            None => Err(Error::not_found("chmod", &path)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memfs::MemFsPlugin;
    use crate::backend::streamfs::StreamFsPlugin;

    fn mount_memfs(router: &Arc<Router>, path: &str) {
        router
            .add(MountPoint {
                path: path.to_string(),
                plugin: Arc::new(MemFsPlugin::new()),
                config: Config::new(),
            })
            .unwrap();
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = Router::new();
        mount_memfs(&router, "/m");
        mount_memfs(&router, "/m/nested");

        let (mount, rel) = router.resolve("/m/nested/x").unwrap();
        assert_eq!(mount.path, "/m/nested");
        assert_eq!(rel, "/x");

        let (mount, rel) = router.resolve("/m/nested").unwrap();
        assert_eq!(mount.path, "/m/nested");
        assert_eq!(rel, "/");

        let (mount, rel) = router.resolve("/m/other").unwrap();
        assert_eq!(mount.path, "/m");
        assert_eq!(rel, "/other");

        // "/m/nestedx" is not under "/m/nested"
        let (mount, _) = router.resolve("/m/nestedx").unwrap();
        assert_eq!(mount.path, "/m");

        assert!(router.resolve("/elsewhere").is_none());
    }

    #[test]
    fn test_mount_at_root_catches_all() {
        let router = Router::new();
        mount_memfs(&router, "/");

        let (mount, rel) = router.resolve("/any/path").unwrap();
        assert_eq!(mount.path, "/");
        assert_eq!(rel, "/any/path");
    }

    #[test]
    fn test_duplicate_mount_rejected() {
        let router = Router::new();
        mount_memfs(&router, "/m");

        let err = router
            .add(MountPoint {
                path: "/m".to_string(),
                plugin: Arc::new(MemFsPlugin::new()),
                config: Config::new(),
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_synthetic_mount_parents() {
        let router = Router::new();
        mount_memfs(&router, "/mnt/mem");
        mount_memfs(&router, "/mnt/kv/keys");

        let root = router.read_dir("/").await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "mnt");
        assert!(root[0].is_dir);

        let mnt = router.read_dir("/mnt").await.unwrap();
        let mut names: Vec<&str> = mnt.iter().map(|e| e.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["kv", "mem"]);

        let info = router.stat("/mnt/kv").await.unwrap();
        assert!(info.is_dir);
        assert_eq!(info.mode, 0o755);
        assert_eq!(info.meta.as_ref().unwrap().kind, "mount-point");

        // root always stats as a directory, even with nothing below a path
        assert!(router.stat("/").await.unwrap().is_dir);
        let err = router.stat("/nope").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_readdir_unions_nested_mounts() {
        let router = Router::new();
        mount_memfs(&router, "/a");
        mount_memfs(&router, "/a/inner");

        router.write("/a/file", b"x").await.unwrap();

        let entries = router.read_dir("/a").await.unwrap();
        let mut names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["file", "inner"]);

        let inner = entries.iter().find(|e| e.name == "inner").unwrap();
        assert_eq!(inner.meta.as_ref().unwrap().kind, "mount-point");
    }

    #[tokio::test]
    async fn test_cross_mount_rename_rejected() {
        let router = Router::new();
        mount_memfs(&router, "/a");
        mount_memfs(&router, "/b");

        router.write("/a/x", b"data").await.unwrap();

        let err = router.rename("/a/x", "/b/x").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(err.message.contains("different mounts"));

        // neither side was modified
        assert_eq!(router.read("/a/x", 0, -1).await.unwrap(), b"data");
        assert_eq!(
            router.read("/b/x", 0, -1).await.unwrap_err().kind,
            ErrorKind::NotFound
        );

        router.rename("/a/x", "/a/y").await.unwrap();
        assert_eq!(router.read("/a/y", 0, -1).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_touch_fallback() {
        let router = Router::new();
        mount_memfs(&router, "/m");

        // missing file: an empty write
        router.touch("/m/new").await.unwrap();
        assert_eq!(router.read("/m/new", 0, -1).await.unwrap(), b"");

        // existing file: content survives the rewrite
        router.write("/m/f", b"keep").await.unwrap();
        router.touch("/m/f").await.unwrap();
        assert_eq!(router.read("/m/f", 0, -1).await.unwrap(), b"keep");

        // directories cannot be touched
        router.mkdir("/m/d", 0o755).await.unwrap();
        let err = router.touch("/m/d").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_open_stream_probes_capability() {
        let router = Router::new();
        mount_memfs(&router, "/mem");
        router
            .add(MountPoint {
                path: "/streams".to_string(),
                plugin: Arc::new(StreamFsPlugin::new()),
                config: Config::new(),
            })
            .unwrap();

        let err = router.open_stream("/mem/x").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(err.message.contains("does not support streaming"));

        router.write("/streams/s", b"x").await.unwrap();
        let mut reader = router.open_stream("/streams/s").await.unwrap();
        match reader
            .read_chunk(std::time::Duration::from_millis(1000))
            .await
        {
            crate::fs::ReadChunk::Data(data) => assert_eq!(data.as_ref(), b"x"),
            other => panic!("expected data, got {:?}", other),
        }
        reader.close().await;
    }

    #[tokio::test]
    async fn test_unmatched_operations() {
        let router = Router::new();
        mount_memfs(&router, "/m");

        assert_eq!(
            router.read("/other/f", 0, -1).await.unwrap_err().kind,
            ErrorKind::NotFound
        );
        assert_eq!(
            router.create("/other/f").await.unwrap_err().kind,
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            router.mkdir("/other", 0o755).await.unwrap_err().kind,
            ErrorKind::PermissionDenied
        );
    }

    #[tokio::test]
    async fn test_remove_routes_to_mount() {
        let router = Router::new();
        mount_memfs(&router, "/m");

        router.write("/m/f", b"x").await.unwrap();
        FileSystem::remove(&**router, "/m/f").await.unwrap();
        assert_eq!(
            router.stat("/m/f").await.unwrap_err().kind,
            ErrorKind::NotFound
        );
    }
}
