//! Native plugin loading: shared objects exposing a C-ABI function table.
//!
//! Convention: error-returning functions return null on success, otherwise a
//! C string owned by the callee (copied here, never freed). `FSRead` hands
//! back `(pointer, length)` through an out-parameter, with length -1 as the
//! error sentinel and 0 a legal empty read. `FSStat` and `FSReadDir` return
//! JSON-encoded FileInfo values.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::fs::{Error, FileInfo, FileSystem, Result};
use crate::plugin::{Config, Plugin};

pub struct LoadOutcome {
    pub key: String,
    pub plugin: Arc<dyn Plugin>,
    /// False when the load only bumped the refcount of an already-loaded
    /// library.
    pub fresh: bool,
}

type PluginNewFn = unsafe extern "C" fn() -> *mut c_void;
type PluginNameFn = unsafe extern "C" fn(*mut c_void) -> *const c_char;
type PluginFreeFn = unsafe extern "C" fn(*mut c_void);
/// validate/initialize: opaque handle + JSON config.
type LifecycleFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *const c_char;
type SimpleFn = unsafe extern "C" fn(*mut c_void) -> *const c_char;
type PathFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *const c_char;
type PathModeFn = unsafe extern "C" fn(*mut c_void, *const c_char, u32) -> *const c_char;
type ReadFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, i64, i64, *mut i64) -> *const u8;
type WriteFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, *const u8, usize) -> *const c_char;
type ReadDirFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, *mut i64) -> *const *const c_char;
type RenameFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> *const c_char;

struct VTable {
    plugin_new: PluginNewFn,
    plugin_name: PluginNameFn,
    plugin_free: Option<PluginFreeFn>,
    plugin_validate: Option<LifecycleFn>,
    plugin_initialize: Option<LifecycleFn>,
    plugin_shutdown: Option<SimpleFn>,
    plugin_get_readme: Option<SimpleFn>,
    fs_create: Option<PathFn>,
    fs_mkdir: Option<PathModeFn>,
    fs_remove: Option<PathFn>,
    fs_remove_all: Option<PathFn>,
    fs_read: Option<ReadFn>,
    fs_write: Option<WriteFn>,
    fs_read_dir: Option<ReadDirFn>,
    fs_stat: Option<PathFn>,
    fs_rename: Option<RenameFn>,
    fs_chmod: Option<PathModeFn>,
}

unsafe fn required<T: Copy>(lib: &libloading::Library, name: &[u8], path: &str) -> Result<T> {
    match lib.get::<T>(name) {
        Ok(symbol) => Ok(*symbol),
        Err(_) => Err(Error::io(
            "load",
            path,
            format!(
                "missing required symbol {}",
                String::from_utf8_lossy(&name[..name.len() - 1])
            ),
        )),
    }
}

unsafe fn optional<T: Copy>(lib: &libloading::Library, name: &[u8]) -> Option<T> {
    lib.get::<T>(name).ok().map(|symbol| *symbol)
}

impl VTable {
    unsafe fn bind(lib: &libloading::Library, path: &str) -> Result<Self> {
        Ok(Self {
            plugin_new: required(lib, b"PluginNew\0", path)?,
            plugin_name: required(lib, b"PluginName\0", path)?,
            plugin_free: optional(lib, b"PluginFree\0"),
            plugin_validate: optional(lib, b"PluginValidate\0"),
            plugin_initialize: optional(lib, b"PluginInitialize\0"),
            plugin_shutdown: optional(lib, b"PluginShutdown\0"),
            plugin_get_readme: optional(lib, b"PluginGetReadme\0"),
            fs_create: optional(lib, b"FSCreate\0"),
            fs_mkdir: optional(lib, b"FSMkdir\0"),
            fs_remove: optional(lib, b"FSRemove\0"),
            fs_remove_all: optional(lib, b"FSRemoveAll\0"),
            fs_read: optional(lib, b"FSRead\0"),
            fs_write: optional(lib, b"FSWrite\0"),
            fs_read_dir: optional(lib, b"FSReadDir\0"),
            fs_stat: optional(lib, b"FSStat\0"),
            fs_rename: optional(lib, b"FSRename\0"),
            fs_chmod: optional(lib, b"FSChmod\0"),
        })
    }
}

#[cfg(unix)]
fn open_library(path: &str) -> Result<libloading::Library> {
    use libloading::os::unix::{Library, RTLD_LOCAL, RTLD_NOW};
    unsafe {
        Library::open(Some(path), RTLD_NOW | RTLD_LOCAL)
            .map(Into::into)
            .map_err(|e| Error::io("load", path, e.to_string()))
    }
}

#[cfg(not(unix))]
fn open_library(path: &str) -> Result<libloading::Library> {
    unsafe { libloading::Library::new(path).map_err(|e| Error::io("load", path, e.to_string())) }
}

fn c_path(operation: &str, path: &str) -> Result<CString> {
    CString::new(path)
        .map_err(|_| Error::invalid_argument(operation, path, "path contains a NUL byte"))
}

/// Copies a callee-owned error string; null means success.
unsafe fn check(operation: &str, path: &str, ret: *const c_char) -> Result<()> {
    if ret.is_null() {
        Ok(())
    } else {
        Err(Error::io(
            operation,
            path,
            CStr::from_ptr(ret).to_string_lossy().into_owned(),
        ))
    }
}

fn unsupported(operation: &str, path: &str) -> Error {
    Error::invalid_argument(operation, path, "operation not supported by plugin")
}

/// Filesystem view over the vtable. The underlying plugin code must be
/// thread-safe: calls arrive from arbitrary worker threads, exactly as they
/// would from arbitrary request handlers.
struct NativeFs {
    handle: *mut c_void,
    vt: VTable,
}

unsafe impl Send for NativeFs {}
unsafe impl Sync for NativeFs {}

#[async_trait::async_trait]
impl FileSystem for NativeFs {
    async fn create(&self, path: &str) -> Result<()> {
        let f = self.vt.fs_create.ok_or_else(|| unsupported("create", path))?;
        let cpath = c_path("create", path)?;
        unsafe { check("create", path, f(self.handle, cpath.as_ptr())) }
    }

    async fn mkdir(&self, path: &str, perm: u32) -> Result<()> {
        let f = self.vt.fs_mkdir.ok_or_else(|| unsupported("mkdir", path))?;
        let cpath = c_path("mkdir", path)?;
        unsafe { check("mkdir", path, f(self.handle, cpath.as_ptr(), perm)) }
    }

    async fn read(&self, path: &str, offset: i64, size: i64) -> Result<Vec<u8>> {
        let f = self.vt.fs_read.ok_or_else(|| unsupported("read", path))?;
        let cpath = c_path("read", path)?;

        let mut out_len: i64 = -1;
        let ptr = unsafe { f(self.handle, cpath.as_ptr(), offset, size, &mut out_len) };
        if out_len < 0 {
            return Err(Error::io("read", path, "plugin read failed"));
        }
        if out_len == 0 {
            return Ok(Vec::new());
        }
        if ptr.is_null() {
            return Err(Error::io("read", path, "plugin returned no data"));
        }
        Ok(unsafe { std::slice::from_raw_parts(ptr, out_len as usize) }.to_vec())
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<String> {
        let f = self.vt.fs_write.ok_or_else(|| unsupported("write", path))?;
        let cpath = c_path("write", path)?;
        unsafe { check("write", path, f(self.handle, cpath.as_ptr(), data.as_ptr(), data.len()))? };
        // the C write slot has no data return; the HTTP layer supplies its
        // generic success message
        Ok(String::new())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let f = self.vt.fs_remove.ok_or_else(|| unsupported("remove", path))?;
        let cpath = c_path("remove", path)?;
        unsafe { check("remove", path, f(self.handle, cpath.as_ptr())) }
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let f = self
            .vt
            .fs_remove_all
            .ok_or_else(|| unsupported("remove", path))?;
        let cpath = c_path("remove", path)?;
        unsafe { check("remove", path, f(self.handle, cpath.as_ptr())) }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let f = self
            .vt
            .fs_read_dir
            .ok_or_else(|| unsupported("readdir", path))?;
        let cpath = c_path("readdir", path)?;

        let mut count: i64 = -1;
        let array = unsafe { f(self.handle, cpath.as_ptr(), &mut count) };
        if count < 0 {
            return Err(Error::io("readdir", path, "plugin readdir failed"));
        }
        if count == 0 || array.is_null() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let item = unsafe { *array.add(i) };
            if item.is_null() {
                continue;
            }
            let json = unsafe { CStr::from_ptr(item) }.to_string_lossy();
            let info: FileInfo = serde_json::from_str(&json)
                .map_err(|e| Error::io("readdir", path, format!("invalid entry: {}", e)))?;
            entries.push(info);
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let f = self.vt.fs_stat.ok_or_else(|| unsupported("stat", path))?;
        let cpath = c_path("stat", path)?;

        let ret = unsafe { f(self.handle, cpath.as_ptr()) };
        if ret.is_null() {
            return Err(Error::not_found("stat", path));
        }
        let json = unsafe { CStr::from_ptr(ret) }.to_string_lossy();
        serde_json::from_str(&json)
            .map_err(|e| Error::io("stat", path, format!("invalid stat entry: {}", e)))
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let f = self.vt.fs_rename.ok_or_else(|| unsupported("rename", old))?;
        let cold = c_path("rename", old)?;
        let cnew = c_path("rename", new)?;
        unsafe { check("rename", old, f(self.handle, cold.as_ptr(), cnew.as_ptr())) }
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let f = self.vt.fs_chmod.ok_or_else(|| unsupported("chmod", path))?;
        let cpath = c_path("chmod", path)?;
        unsafe { check("chmod", path, f(self.handle, cpath.as_ptr(), mode)) }
    }
}

pub struct NativePlugin {
    name: String,
    library_path: String,
    fs: Arc<NativeFs>,
    down: AtomicBool,
}

#[async_trait::async_trait]
impl Plugin for NativePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, config: &Config) -> Result<()> {
        let f = match self.fs.vt.plugin_validate {
            Some(f) => f,
            None => return Ok(()),
        };

        let json = serde_json::to_string(config)
            .map_err(|e| Error::io("validate", &self.library_path, e.to_string()))?;
        let cjson = c_path("validate", &json)?;
        let ret = unsafe { f(self.fs.handle, cjson.as_ptr()) };
        if ret.is_null() {
            return Ok(());
        }
        Err(Error::invalid_argument(
            "validate",
            &self.library_path,
            unsafe { CStr::from_ptr(ret) }.to_string_lossy().into_owned(),
        ))
    }

    async fn initialize(&self, config: &Config) -> Result<()> {
        let f = match self.fs.vt.plugin_initialize {
            Some(f) => f,
            None => return Ok(()),
        };

        let json = serde_json::to_string(config)
            .map_err(|e| Error::io("initialize", &self.library_path, e.to_string()))?;
        let cjson = c_path("initialize", &json)?;
        unsafe { check("initialize", &self.library_path, f(self.fs.handle, cjson.as_ptr())) }
    }

    fn filesystem(&self) -> Arc<dyn FileSystem> {
        self.fs.clone()
    }

    fn readme(&self) -> String {
        match self.fs.vt.plugin_get_readme {
            Some(f) => {
                let ret = unsafe { f(self.fs.handle) };
                if ret.is_null() {
                    String::new()
                } else {
                    unsafe { CStr::from_ptr(ret) }.to_string_lossy().into_owned()
                }
            }
            None => String::new(),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        // unmount and process shutdown can both land here
        if self.down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.fs.vt.plugin_shutdown {
            Some(f) => unsafe { check("shutdown", &self.library_path, f(self.fs.handle)) },
            None => Ok(()),
        }
    }
}

impl NativePlugin {
    /// Final release of the plugin handle. Only called by the loader once
    /// the last reference is unloaded; the plugin must be unmounted first.
    fn free(&self) {
        if let Some(f) = self.fs.vt.plugin_free {
            unsafe { f(self.fs.handle) };
        }
    }
}

struct LoadedNative {
    plugin: Arc<NativePlugin>,
    refs: Mutex<u32>,
}

/// Tracks loaded shared libraries by absolute path with a refcount. The
/// library itself is never unmapped, even after the last unload: a portable
/// unmap is not guaranteed, so loading two versions from the same path is
/// undefined and operators must use distinct paths per version.
pub struct Loader {
    plugins: Mutex<HashMap<String, Arc<LoadedNative>>>,
}

impl Loader {
    pub fn new() -> Self {
        Self {
            plugins: Mutex::new(HashMap::new()),
        }
    }

    fn abs_path(path: &str) -> String {
        std::fs::canonicalize(path)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string())
    }

    pub fn load(&self, path: &str) -> Result<LoadOutcome> {
        let abs = Self::abs_path(path);
        let mut plugins = self.plugins.lock().unwrap();

        if let Some(entry) = plugins.get(&abs) {
            *entry.refs.lock().unwrap() += 1;
            return Ok(LoadOutcome {
                key: abs,
                plugin: entry.plugin.clone(),
                fresh: false,
            });
        }

        let lib = open_library(&abs)?;
        let vt = unsafe { VTable::bind(&lib, &abs)? };
        // keep the object mapped for the process lifetime; the vtable holds
        // raw pointers into it
        std::mem::forget(lib);

        let handle = unsafe { (vt.plugin_new)() };
        if handle.is_null() {
            return Err(Error::io("load", &abs, "PluginNew returned null"));
        }

        let name_ptr = unsafe { (vt.plugin_name)(handle) };
        if name_ptr.is_null() {
            return Err(Error::io("load", &abs, "PluginName returned null"));
        }
        let name = unsafe { CStr::from_ptr(name_ptr) }
            .to_string_lossy()
            .into_owned();

        let plugin = Arc::new(NativePlugin {
            name,
            library_path: abs.clone(),
            fs: Arc::new(NativeFs { handle, vt }),
            down: AtomicBool::new(false),
        });

        plugins.insert(
            abs.clone(),
            Arc::new(LoadedNative {
                plugin: plugin.clone(),
                refs: Mutex::new(1),
            }),
        );

        Ok(LoadOutcome {
            key: abs,
            plugin,
            fresh: true,
        })
    }

    /// Decrements the refcount; at zero the plugin is shut down, freed and
    /// untracked. Returns the removed key, or None while references remain.
    pub async fn unload(&self, path: &str) -> Result<Option<String>> {
        let abs = Self::abs_path(path);

        // the decrement and the zero-case removal happen in one critical
        // section on the loader lock, so a concurrent load either sees the
        // entry with its reference intact or does not see it at all - it can
        // never revive an entry whose handle is about to be freed
        let entry = {
            let mut plugins = self.plugins.lock().unwrap();
            let entry = plugins
                .get(&abs)
                .cloned()
                .ok_or_else(|| Error::not_found("unload", path))?;

            let remaining = {
                let mut refs = entry.refs.lock().unwrap();
                *refs = refs.saturating_sub(1);
                *refs
            };
            if remaining > 0 {
                return Ok(None);
            }

            plugins.remove(&abs);
            entry
        };

        // the entry is no longer reachable through the loader
        let result = entry.plugin.shutdown().await;
        entry.plugin.free();
        result.map(|_| Some(abs))
    }

    pub fn loaded(&self) -> Vec<String> {
        self.plugins.lock().unwrap().keys().cloned().collect()
    }

    pub async fn shutdown_all(&self) {
        let entries: Vec<Arc<LoadedNative>> = {
            let mut plugins = self.plugins.lock().unwrap();
            plugins.drain().map(|(_, v)| v).collect()
        };
        for entry in entries {
            if let Err(err) = entry.plugin.shutdown().await {
                error!("failed to shut down native plugin: {}", err);
            }
            entry.plugin.free();
        }
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_load_missing_library() {
        let loader = Loader::new();
        let err = loader.load("/no/such/library.so").unwrap_err();
        assert_eq!(err.kind, crate::fs::ErrorKind::IO);
    }

    #[tokio::test]
    async fn test_unload_unknown_path() {
        let loader = Loader::new();
        let err = loader.unload("/no/such/library.so").await.unwrap_err();
        assert_eq!(err.kind, crate::fs::ErrorKind::NotFound);
    }
}
