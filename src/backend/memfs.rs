use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::fs::{
    self, apply_range_read, Error, ErrorKind, FileInfo, FileSystem, Meta, Result,
};
use crate::plugin::{Config, Plugin};

use super::reject_unknown_keys;

const README: &str = r#"memfs - in-memory filesystem

A hierarchical filesystem held entirely in memory. Files and directories
behave like their POSIX counterparts but nothing survives a restart.

USAGE:
  write:  PUT  /api/v1/files?path=/mem/notes.txt
  read:   GET  /api/v1/files?path=/mem/notes.txt
  list:   GET  /api/v1/directories?path=/mem
"#;

struct FileNode {
    data: Vec<u8>,
    mode: u32,
    mod_time: SystemTime,
}

struct DirNode {
    mode: u32,
    mod_time: SystemTime,
}

struct Tree {
    files: HashMap<String, FileNode>,
    dirs: HashMap<String, DirNode>,
}

impl Tree {
    fn new() -> Self {
        let mut dirs = HashMap::new();
        dirs.insert(
            "/".to_string(),
            DirNode {
                mode: 0o755,
                mod_time: SystemTime::now(),
            },
        );
        Self {
            files: HashMap::new(),
            dirs,
        }
    }

    fn require_parent(&self, operation: &str, path: &str) -> Result<()> {
        let parent = fs::path::parent(path);
        if self.files.contains_key(parent) {
            return Err(Error::not_directory(operation, parent));
        }
        if !self.dirs.contains_key(parent) {
            return Err(Error::not_found(operation, parent));
        }
        Ok(())
    }

    /// Direct children of `dir`: keys with exactly one more segment.
    fn children(&self, dir: &str) -> Vec<(String, bool)> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };

        let mut children = Vec::new();
        for key in self.files.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    children.push((key.clone(), false));
                }
            }
        }
        for key in self.dirs.keys() {
            if key == dir {
                continue;
            }
            if let Some(rest) = key.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    children.push((key.clone(), true));
                }
            }
        }
        children
    }

    fn has_children(&self, dir: &str) -> bool {
        let prefix = format!("{}/", dir);
        self.files.keys().any(|k| k.starts_with(&prefix))
            || self.dirs.keys().any(|k| k.starts_with(&prefix))
    }
}

/// In-memory hierarchical filesystem, the reference mountable backend.
pub struct MemFs {
    state: RwLock<Tree>,
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Tree::new()),
        }
    }

    fn file_info(path: &str, node: &FileNode) -> FileInfo {
        FileInfo::file(
            fs::path::base(path),
            node.data.len() as i64,
            node.mode,
            node.mod_time,
        )
        .with_meta(Meta::new("memfs", "file"))
    }

    fn dir_info(path: &str, node: &DirNode) -> FileInfo {
        FileInfo::dir(fs::path::base(path), node.mode, node.mod_time)
            .with_meta(Meta::new("memfs", "dir"))
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FileSystem for MemFs {
    async fn create(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        if path == "/" {
            return Err(Error::is_directory("create", &path));
        }

        let mut tree = self.state.write().unwrap();
        if tree.dirs.contains_key(&path) {
            return Err(Error::is_directory("create", &path));
        }
        if tree.files.contains_key(&path) {
            return Err(Error::already_exists("create", &path));
        }
        tree.require_parent("create", &path)?;

        tree.files.insert(
            path,
            FileNode {
                data: Vec::new(),
                mode: 0o644,
                mod_time: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn mkdir(&self, path: &str, perm: u32) -> Result<()> {
        let path = fs::normalize(path)?;
        if path == "/" {
            return Err(Error::already_exists("mkdir", &path));
        }

        let mut tree = self.state.write().unwrap();
        if tree.dirs.contains_key(&path) || tree.files.contains_key(&path) {
            return Err(Error::already_exists("mkdir", &path));
        }
        tree.require_parent("mkdir", &path)?;

        tree.dirs.insert(
            path,
            DirNode {
                mode: perm,
                mod_time: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn read(&self, path: &str, offset: i64, size: i64) -> Result<Vec<u8>> {
        let path = fs::normalize(path)?;
        let tree = self.state.read().unwrap();

        if tree.dirs.contains_key(&path) {
            return Err(Error::is_directory("read", &path));
        }
        let node = tree
            .files
            .get(&path)
            .ok_or_else(|| Error::not_found("read", &path))?;

        let (data, _) = apply_range_read(&node.data, offset, size);
        Ok(data)
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<String> {
        let path = fs::normalize(path)?;
        let mut tree = self.state.write().unwrap();

        if tree.dirs.contains_key(&path) {
            return Err(Error::is_directory("write", &path));
        }
        if !tree.files.contains_key(&path) {
            tree.require_parent("write", &path)?;
        }

        let mode = tree.files.get(&path).map(|f| f.mode).unwrap_or(0o644);
        tree.files.insert(
            path,
            FileNode {
                data: data.to_vec(),
                mode,
                mod_time: SystemTime::now(),
            },
        );
        Ok(format!("{} bytes written", data.len()))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        if path == "/" {
            return Err(Error::permission_denied(
                "remove",
                &path,
                "cannot remove the root",
            ));
        }

        let mut tree = self.state.write().unwrap();
        if tree.files.remove(&path).is_some() {
            return Ok(());
        }
        if tree.dirs.contains_key(&path) {
            if tree.has_children(&path) {
                return Err(Error::io("remove", &path, "directory not empty"));
            }
            tree.dirs.remove(&path);
            return Ok(());
        }
        Err(Error::not_found("remove", &path))
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        let mut tree = self.state.write().unwrap();

        if path == "/" {
            tree.files.clear();
            tree.dirs.retain(|k, _| k == "/");
            return Ok(());
        }

        if !tree.files.contains_key(&path) && !tree.dirs.contains_key(&path) {
            return Err(Error::not_found("remove", &path));
        }

        let prefix = format!("{}/", path);
        tree.files.remove(&path);
        tree.dirs.remove(&path);
        tree.files.retain(|k, _| !k.starts_with(&prefix));
        tree.dirs.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let path = fs::normalize(path)?;
        let tree = self.state.read().unwrap();

        if tree.files.contains_key(&path) {
            return Err(Error::not_directory("readdir", &path));
        }
        if !tree.dirs.contains_key(&path) {
            return Err(Error::not_found("readdir", &path));
        }

        let mut entries = Vec::new();
        for (child, is_dir) in tree.children(&path) {
            if is_dir {
                entries.push(Self::dir_info(&child, &tree.dirs[&child]));
            } else {
                entries.push(Self::file_info(&child, &tree.files[&child]));
            }
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let path = fs::normalize(path)?;
        let tree = self.state.read().unwrap();

        if let Some(node) = tree.files.get(&path) {
            return Ok(Self::file_info(&path, node));
        }
        if let Some(node) = tree.dirs.get(&path) {
            return Ok(Self::dir_info(&path, node));
        }
        Err(Error::not_found("stat", &path))
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = fs::normalize(old)?;
        let new = fs::normalize(new)?;
        if old == "/" || new == "/" {
            return Err(Error::invalid_argument("rename", &old, "cannot rename the root"));
        }

        let mut tree = self.state.write().unwrap();
        if tree.files.contains_key(&new) || tree.dirs.contains_key(&new) {
            return Err(Error::already_exists("rename", &new));
        }
        tree.require_parent("rename", &new)?;

        if let Some(node) = tree.files.remove(&old) {
            tree.files.insert(new, node);
            return Ok(());
        }

        if let Some(node) = tree.dirs.remove(&old) {
            // move the subtree along with the directory
            let prefix = format!("{}/", old);
            let moved_files: Vec<String> = tree
                .files
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            for key in moved_files {
                let node = tree.files.remove(&key).unwrap();
                tree.files
                    .insert(format!("{}{}", new, &key[old.len()..]), node);
            }
            let moved_dirs: Vec<String> = tree
                .dirs
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            for key in moved_dirs {
                let node = tree.dirs.remove(&key).unwrap();
                tree.dirs
                    .insert(format!("{}{}", new, &key[old.len()..]), node);
            }
            tree.dirs.insert(new, node);
            return Ok(());
        }

        Err(Error::not_found("rename", &old))
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let path = fs::normalize(path)?;
        let mut tree = self.state.write().unwrap();

        if let Some(node) = tree.files.get_mut(&path) {
            node.mode = mode;
            return Ok(());
        }
        if let Some(node) = tree.dirs.get_mut(&path) {
            node.mode = mode;
            return Ok(());
        }
        Err(Error::not_found("chmod", &path))
    }
}

pub struct MemFsPlugin {
    fs: Arc<MemFs>,
}

impl MemFsPlugin {
    pub fn new() -> Self {
        Self {
            fs: Arc::new(MemFs::new()),
        }
    }
}

impl Default for MemFsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Plugin for MemFsPlugin {
    fn name(&self) -> &str {
        "memfs"
    }

    async fn validate(&self, config: &Config) -> Result<()> {
        reject_unknown_keys("memfs", config, &[])
    }

    async fn initialize(&self, _config: &Config) -> Result<()> {
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
