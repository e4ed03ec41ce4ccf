pub mod native;
pub mod wasm;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::backend::{memfs::MemFsPlugin, queuefs::QueueFsPlugin, streamfs::StreamFsPlugin};
use crate::fs::{self, Error, FileSystem, Result};
use crate::router::{MountPoint, Router};

/// Opaque per-plugin configuration. Validation is structural and per-plugin:
/// recognized keys are enumerated, unknown ones rejected.
pub type Config = serde_json::Map<String, serde_json::Value>;

/// The mount path the registry injects into every plugin's config.
pub const MOUNT_PATH_KEY: &str = "mount_path";

/// A named backend: a filesystem plus lifecycle hooks. `shutdown` must be
/// safe to call twice (unmount and process termination can both reach it).
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// The name the plugin declared before any collision renaming.
    fn original_name(&self) -> &str {
        self.name()
    }

    async fn validate(&self, config: &Config) -> Result<()>;
    async fn initialize(&self, config: &Config) -> Result<()>;
    fn filesystem(&self) -> Arc<dyn FileSystem>;
    fn readme(&self) -> String;
    async fn shutdown(&self) -> Result<()>;
}

pub type Factory = Box<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Wraps an externally loaded plugin whose declared name collided with an
/// already registered one.
struct Renamed {
    inner: Arc<dyn Plugin>,
    name: String,
}

#[async_trait::async_trait]
impl Plugin for Renamed {
    fn name(&self) -> &str {
        &self.name
    }

    fn original_name(&self) -> &str {
        self.inner.name()
    }

    async fn validate(&self, config: &Config) -> Result<()> {
        self.inner.validate(config).await
    }

    async fn initialize(&self, config: &Config) -> Result<()> {
        self.inner.initialize(config).await
    }

    fn filesystem(&self) -> Arc<dyn FileSystem> {
        self.inner.filesystem()
    }

    fn readme(&self) -> String {
        self.inner.readme()
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
}

/// Owns the factory table, the loaders for external code and the router, and
/// orchestrates the mount/unmount/load/unload lifecycle.
pub struct Registry {
    router: Arc<Router>,
    factories: RwLock<HashMap<String, Factory>>,
    /// Per-base collision counters; never reset so repeated loads produce a
    /// stable -1, -2, ... sequence for the process lifetime.
    counters: Mutex<HashMap<String, u32>>,
    native: native::Loader,
    wasm: wasm::Loader,
    /// Loader key (library path, or path#N for WASM) to registered factory
    /// name.
    loaded_names: Mutex<HashMap<String, String>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        let mut factories: HashMap<String, Factory> = HashMap::new();
        factories.insert(
            "memfs".to_string(),
            Box::new(|| Arc::new(MemFsPlugin::new()) as Arc<dyn Plugin>),
        );
        factories.insert(
            "streamfs".to_string(),
            Box::new(|| Arc::new(StreamFsPlugin::new()) as Arc<dyn Plugin>),
        );
        factories.insert(
            "queuefs".to_string(),
            Box::new(|| Arc::new(QueueFsPlugin::new()) as Arc<dyn Plugin>),
        );

        Arc::new(Self {
            router: Router::new(),
            factories: RwLock::new(factories),
            counters: Mutex::new(HashMap::new()),
            native: native::Loader::new(),
            wasm: wasm::Loader::new(),
            loaded_names: Mutex::new(HashMap::new()),
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn register_factory(&self, name: &str, factory: Factory) -> Result<()> {
        let mut factories = self.factories.write().unwrap();
        if factories.contains_key(name) {
            return Err(Error::already_exists("register", name));
        }
        factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn factory_names(&self) -> Vec<String> {
        self.factories.read().unwrap().keys().cloned().collect()
    }

    /// Picks a registration name for `base`, appending -1, -2, ... while the
    /// name is taken.
    fn unique_name(&self, base: &str) -> String {
        let factories = self.factories.read().unwrap();
        if !factories.contains_key(base) {
            return base.to_string();
        }

        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(base.to_string()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{}-{}", base, counter);
            if !factories.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Instantiates a plugin of `fstype` and attaches it at `path`.
    pub async fn mount(&self, fstype: &str, path: &str, config: Config) -> Result<()> {
        let path = fs::normalize(path)?;
        if self.router.is_mounted(&path) {
            return Err(Error::already_exists("mount", &path));
        }

        let plugin = {
            let factories = self.factories.read().unwrap();
            let factory = factories.get(fstype).ok_or_else(|| {
                Error::invalid_argument(
                    "mount",
                    &path,
                    format!("unknown filesystem type '{}'", fstype),
                )
            })?;
            factory()
        };

        // plugins that serve the whole namespace get a handle on the router
        // before their lifecycle starts
        let fsys = plugin.filesystem();
        if let Some(setter) = fsys.as_root_setter() {
            setter.set_root(Arc::downgrade(&self.router));
        }

        let mut config = config;
        config.insert(
            MOUNT_PATH_KEY.to_string(),
            serde_json::Value::String(path.clone()),
        );

        plugin
            .validate(&config)
            .await
            .map_err(|e| Error::invalid_argument("mount", &path, e.message))?;
        plugin
            .initialize(&config)
            .await
            .map_err(|e| Error::io("mount", &path, e.message))?;

        info!("mounted {} at {}", plugin.name(), path);
        self.router.add(MountPoint {
            path,
            plugin,
            config,
        })
    }

    /// Detaches the mount at `path`. The plugin's shutdown error is
    /// propagated but the mount is removed regardless.
    pub async fn unmount(&self, path: &str) -> Result<()> {
        let path = fs::normalize(path)?;
        let mount = self.router.remove(&path)?;
        info!("unmounted {} from {}", mount.plugin.name(), path);
        mount.plugin.shutdown().await
    }

    /// Loads an external plugin (shared library or WASM module) and registers
    /// it under a collision-free name. Returns the registered name.
    pub async fn load(&self, library_path: &str) -> Result<String> {
        let loaded = if library_path.ends_with(".wasm") {
            let (key, plugin) = self
                .wasm
                .load(library_path, Arc::downgrade(&self.router))
                .await?;
            native::LoadOutcome {
                key,
                plugin,
                fresh: true,
            }
        } else {
            self.native.load(library_path)?
        };

        if !loaded.fresh {
            // refcount bump on an already-loaded library: the factory is
            // already registered
            let names = self.loaded_names.lock().unwrap();
            if let Some(name) = names.get(&loaded.key) {
                return Ok(name.clone());
            }
        }

        let declared = loaded.plugin.name().to_string();
        let name = self.unique_name(&declared);
        let plugin: Arc<dyn Plugin> = if name != declared {
            debug!("plugin name '{}' taken, registering as '{}'", declared, name);
            Arc::new(Renamed {
                inner: loaded.plugin,
                name: name.clone(),
            })
        } else {
            loaded.plugin
        };

        {
            let mut factories = self.factories.write().unwrap();
            let shared = plugin.clone();
            factories.insert(name.clone(), Box::new(move || shared.clone()));
        }
        self.loaded_names
            .lock()
            .unwrap()
            .insert(loaded.key, name.clone());

        info!("loaded external plugin {} from {}", name, library_path);
        Ok(name)
    }

    /// Drops one reference on a loaded plugin; the last unload shuts the
    /// plugin down and unregisters its factory.
    pub async fn unload(&self, library_path: &str) -> Result<()> {
        let removed_key = if library_path.contains(".wasm") {
            Some(self.wasm.unload(library_path).await?)
        } else {
            self.native.unload(library_path).await?
        };

        if let Some(key) = removed_key {
            if let Some(name) = self.loaded_names.lock().unwrap().remove(&key) {
                self.factories.write().unwrap().remove(&name);
            }
        }
        Ok(())
    }

    /// Keys of every loaded external plugin (library paths, path#N for WASM).
    pub fn loaded(&self) -> Vec<String> {
        let mut keys = self.native.loaded();
        keys.extend(self.wasm.loaded());
        keys
    }

    /// Shuts every plugin down in reverse mount order, then releases the
    /// loaders.
    pub async fn shutdown(&self) {
        for mount in self.router.mounts().into_iter().rev() {
            if let Err(err) = mount.plugin.shutdown().await {
                error!(
                    "failed to shut down plugin {}: {}",
                    mount.plugin.name(),
                    err
                );
            }
        }

        self.native.shutdown_all().await;
        self.wasm.shutdown_all().await;
    }
}
