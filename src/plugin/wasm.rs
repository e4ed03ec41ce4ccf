//! WASM plugin loading: one isolated wasmtime runtime per load, a minimal
//! POSIX shim for guest stdout/stderr and randomness, and an `env` host
//! module that re-exposes the whole namespace back into the sandbox.
//!
//! Calling convention: pointers are offsets into guest linear memory.
//! Variable-length values travel as a packed 64-bit result, pointer in the
//! low 32 bits and length in the high 32; a zero means empty (or success for
//! error-style returns). Data-returning calls take a secondary error slot: a
//! guest pointer to 8 bytes where the host (or guest) stores a packed error
//! string, 0 on success. Marshaling buffers are allocated with the guest's
//! `wasm_malloc`/`wasm_free`. Structured values (FileInfo, config) are JSON.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use wasmtime::{Caller, Engine, Extern, Linker, Memory, Module, Store, TypedFunc};

use crate::fs::{Error, FileInfo, FileSystem, Result, RootFs};
use crate::plugin::{Config, Plugin};

pub fn pack(ptr: u32, len: u32) -> u64 {
    ((len as u64) << 32) | ptr as u64
}

pub fn unpack(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

struct HostState {
    root: RootFs,
}

fn wasm_err<O, P>(operation: O, path: P, err: wasmtime::Error) -> Error
where
    O: Into<String>,
    P: Into<String>,
{
    Error::io(operation, path, format!("{:#}", err))
}

fn unsupported(operation: &str, path: &str) -> Error {
    Error::invalid_argument(operation, path, "operation not supported by plugin")
}

// ---- host side of the bridge -------------------------------------------

fn caller_memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("guest does not export memory"))
}

fn read_caller(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> wasmtime::Result<Vec<u8>> {
    let memory = caller_memory(caller)?;
    let data = memory.data(&caller);
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| anyhow!("guest pointer overflow"))?;
    if end > data.len() {
        bail!("guest pointer out of bounds");
    }
    Ok(data[start..end].to_vec())
}

fn read_caller_str(
    caller: &mut Caller<'_, HostState>,
    ptr: u32,
    len: u32,
) -> wasmtime::Result<String> {
    String::from_utf8(read_caller(caller, ptr, len)?).map_err(|_| anyhow!("invalid utf-8 from guest"))
}

fn write_caller_u64(
    caller: &mut Caller<'_, HostState>,
    at: u32,
    value: u64,
) -> wasmtime::Result<()> {
    let memory = caller_memory(caller)?;
    let data = memory.data_mut(&mut *caller);
    let start = at as usize;
    if start + 8 > data.len() {
        bail!("guest error slot out of bounds");
    }
    data[start..start + 8].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn write_caller_u32(
    caller: &mut Caller<'_, HostState>,
    at: u32,
    value: u32,
) -> wasmtime::Result<()> {
    let memory = caller_memory(caller)?;
    let data = memory.data_mut(&mut *caller);
    let start = at as usize;
    if start + 4 > data.len() {
        bail!("guest pointer out of bounds");
    }
    data[start..start + 4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Copies `data` into a guest buffer obtained from `wasm_malloc` and returns
/// the packed (pointer, length).
async fn alloc_caller(caller: &mut Caller<'_, HostState>, data: &[u8]) -> wasmtime::Result<u64> {
    if data.is_empty() {
        return Ok(0);
    }

    let malloc = caller
        .get_export("wasm_malloc")
        .and_then(Extern::into_func)
        .ok_or_else(|| anyhow!("guest does not export wasm_malloc"))?;
    let malloc = malloc.typed::<u32, u32>(&mut *caller)?;
    let ptr = malloc.call_async(&mut *caller, data.len() as u32).await?;

    let memory = caller_memory(caller)?;
    let mem = memory.data_mut(&mut *caller);
    let start = ptr as usize;
    if start + data.len() > mem.len() {
        bail!("guest allocation out of bounds");
    }
    mem[start..start + data.len()].copy_from_slice(data);
    Ok(pack(ptr, data.len() as u32))
}

fn caller_root(caller: &Caller<'_, HostState>) -> Result<Arc<crate::router::Router>> {
    caller
        .data()
        .root
        .upgrade()
        .ok_or_else(|| Error::io("host", "/", "host filesystem not available"))
}

/// Finishes a data-returning host call: stores the packed error (or 0) in
/// the guest error slot and returns the packed payload.
async fn finish_data(
    caller: &mut Caller<'_, HostState>,
    err_out: u32,
    result: Result<Vec<u8>>,
) -> wasmtime::Result<u64> {
    match result {
        Ok(data) => {
            write_caller_u64(caller, err_out, 0)?;
            alloc_caller(caller, &data).await
        }
        Err(err) => {
            let packed = alloc_caller(caller, err.to_string().as_bytes()).await?;
            write_caller_u64(caller, err_out, packed)?;
            Ok(0)
        }
    }
}

/// Finishes a status-returning host call: 0 on success, packed error string
/// otherwise.
async fn finish_status(
    caller: &mut Caller<'_, HostState>,
    result: Result<()>,
) -> wasmtime::Result<u64> {
    match result {
        Ok(()) => Ok(0),
        Err(err) => alloc_caller(caller, err.to_string().as_bytes()).await,
    }
}

/// The `env` module: the full filesystem bridge. Calls are forwarded to the
/// router handed to the loader; if the namespace is gone every call returns
/// an error while keeping the ABI shape.
fn add_host_fns(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap_async(
        "env",
        "host_fs_read",
        |mut caller: Caller<'_, HostState>,
         (path_ptr, path_len, offset, size, err_out): (u32, u32, i64, i64, u32)| {
            Box::new(async move {
                let path = read_caller_str(&mut caller, path_ptr, path_len)?;
                let result = match caller_root(&caller) {
                    Ok(root) => root.read(&path, offset, size).await,
                    Err(err) => Err(err),
                };
                finish_data(&mut caller, err_out, result).await
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "host_fs_write",
        |mut caller: Caller<'_, HostState>,
         (path_ptr, path_len, data_ptr, data_len): (u32, u32, u32, u32)| {
            Box::new(async move {
                let path = read_caller_str(&mut caller, path_ptr, path_len)?;
                let data = read_caller(&mut caller, data_ptr, data_len)?;
                let result = match caller_root(&caller) {
                    Ok(root) => root.write(&path, &data).await.map(|_| ()),
                    Err(err) => Err(err),
                };
                finish_status(&mut caller, result).await
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "host_fs_stat",
        |mut caller: Caller<'_, HostState>, (path_ptr, path_len, err_out): (u32, u32, u32)| {
            Box::new(async move {
                let path = read_caller_str(&mut caller, path_ptr, path_len)?;
                let result = match caller_root(&caller) {
                    Ok(root) => root.stat(&path).await.and_then(|info| {
                        serde_json::to_vec(&info)
                            .map_err(|e| Error::io("stat", &path, e.to_string()))
                    }),
                    Err(err) => Err(err),
                };
                finish_data(&mut caller, err_out, result).await
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "host_fs_readdir",
        |mut caller: Caller<'_, HostState>, (path_ptr, path_len, err_out): (u32, u32, u32)| {
            Box::new(async move {
                let path = read_caller_str(&mut caller, path_ptr, path_len)?;
                let result = match caller_root(&caller) {
                    Ok(root) => root.read_dir(&path).await.and_then(|entries| {
                        serde_json::to_vec(&entries)
                            .map_err(|e| Error::io("readdir", &path, e.to_string()))
                    }),
                    Err(err) => Err(err),
                };
                finish_data(&mut caller, err_out, result).await
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "host_fs_create",
        |mut caller: Caller<'_, HostState>, (path_ptr, path_len): (u32, u32)| {
            Box::new(async move {
                let path = read_caller_str(&mut caller, path_ptr, path_len)?;
                let result = match caller_root(&caller) {
                    Ok(root) => root.create(&path).await,
                    Err(err) => Err(err),
                };
                finish_status(&mut caller, result).await
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "host_fs_mkdir",
        |mut caller: Caller<'_, HostState>, (path_ptr, path_len, perm): (u32, u32, u32)| {
            Box::new(async move {
                let path = read_caller_str(&mut caller, path_ptr, path_len)?;
                let result = match caller_root(&caller) {
                    Ok(root) => root.mkdir(&path, perm).await,
                    Err(err) => Err(err),
                };
                finish_status(&mut caller, result).await
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "host_fs_remove",
        |mut caller: Caller<'_, HostState>, (path_ptr, path_len): (u32, u32)| {
            Box::new(async move {
                let path = read_caller_str(&mut caller, path_ptr, path_len)?;
                let result = match caller_root(&caller) {
                    Ok(root) => FileSystem::remove(&*root, &path).await,
                    Err(err) => Err(err),
                };
                finish_status(&mut caller, result).await
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "host_fs_remove_all",
        |mut caller: Caller<'_, HostState>, (path_ptr, path_len): (u32, u32)| {
            Box::new(async move {
                let path = read_caller_str(&mut caller, path_ptr, path_len)?;
                let result = match caller_root(&caller) {
                    Ok(root) => root.remove_all(&path).await,
                    Err(err) => Err(err),
                };
                finish_status(&mut caller, result).await
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "host_fs_rename",
        |mut caller: Caller<'_, HostState>,
         (old_ptr, old_len, new_ptr, new_len): (u32, u32, u32, u32)| {
            Box::new(async move {
                let old = read_caller_str(&mut caller, old_ptr, old_len)?;
                let new = read_caller_str(&mut caller, new_ptr, new_len)?;
                let result = match caller_root(&caller) {
                    Ok(root) => root.rename(&old, &new).await,
                    Err(err) => Err(err),
                };
                finish_status(&mut caller, result).await
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "host_fs_chmod",
        |mut caller: Caller<'_, HostState>, (path_ptr, path_len, mode): (u32, u32, u32)| {
            Box::new(async move {
                let path = read_caller_str(&mut caller, path_ptr, path_len)?;
                let result = match caller_root(&caller) {
                    Ok(root) => root.chmod(&path, mode).await,
                    Err(err) => Err(err),
                };
                finish_status(&mut caller, result).await
            })
        },
    )?;

    Ok(())
}

/// A minimal wasi_snapshot_preview1 surface: enough for guests built against
/// standard toolchains to print and to seed randomness. Everything else the
/// module imports is wired to trap.
fn add_wasi_shim(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "fd_write",
        |mut caller: Caller<'_, HostState>,
         fd: i32,
         iovs: u32,
         iovs_len: u32,
         nwritten: u32|
         -> wasmtime::Result<i32> {
            let mut total: u32 = 0;
            let mut out = Vec::new();
            for i in 0..iovs_len {
                let iov = read_caller(&mut caller, iovs + i * 8, 8)?;
                let ptr = u32::from_le_bytes([iov[0], iov[1], iov[2], iov[3]]);
                let len = u32::from_le_bytes([iov[4], iov[5], iov[6], iov[7]]);
                out.extend_from_slice(&read_caller(&mut caller, ptr, len)?);
                total += len;
            }
            write_caller_u32(&mut caller, nwritten, total)?;

            let text = String::from_utf8_lossy(&out);
            let text = text.trim_end();
            if !text.is_empty() {
                if fd == 2 {
                    warn!("wasm guest: {}", text);
                } else {
                    info!("wasm guest: {}", text);
                }
            }
            Ok(0)
        },
    )?;

    linker.func_wrap(
        "wasi_snapshot_preview1",
        "random_get",
        |mut caller: Caller<'_, HostState>, buf: u32, len: u32| -> wasmtime::Result<i32> {
            use rand::RngCore;

            let mut bytes = vec![0u8; len as usize];
            rand::thread_rng().fill_bytes(&mut bytes);

            let memory = caller_memory(&mut caller)?;
            let mem = memory.data_mut(&mut caller);
            let start = buf as usize;
            if start + bytes.len() > mem.len() {
                bail!("random_get buffer out of bounds");
            }
            mem[start..start + bytes.len()].copy_from_slice(&bytes);
            Ok(0)
        },
    )?;

    linker.func_wrap(
        "wasi_snapshot_preview1",
        "proc_exit",
        |_caller: Caller<'_, HostState>, code: i32| -> wasmtime::Result<()> {
            Err(anyhow!("guest called proc_exit({})", code))
        },
    )?;

    linker.func_wrap(
        "wasi_snapshot_preview1",
        "environ_sizes_get",
        |mut caller: Caller<'_, HostState>, count: u32, size: u32| -> wasmtime::Result<i32> {
            write_caller_u32(&mut caller, count, 0)?;
            write_caller_u32(&mut caller, size, 0)?;
            Ok(0)
        },
    )?;

    linker.func_wrap(
        "wasi_snapshot_preview1",
        "environ_get",
        |_caller: Caller<'_, HostState>, _environ: u32, _buf: u32| -> wasmtime::Result<i32> {
            Ok(0)
        },
    )?;

    Ok(())
}

// ---- guest side ---------------------------------------------------------

struct Guest {
    memory: Memory,
    wasm_malloc: TypedFunc<u32, u32>,
    wasm_free: Option<TypedFunc<(u32, u32), ()>>,
    plugin_validate: Option<TypedFunc<(i32, u32, u32), u64>>,
    plugin_initialize: Option<TypedFunc<(i32, u32, u32), u64>>,
    plugin_shutdown: Option<TypedFunc<i32, u64>>,
    fs_create: Option<TypedFunc<(i32, u32, u32), u64>>,
    fs_mkdir: Option<TypedFunc<(i32, u32, u32, u32), u64>>,
    fs_read: Option<TypedFunc<(i32, u32, u32, i64, i64, u32), u64>>,
    fs_write: Option<TypedFunc<(i32, u32, u32, u32, u32, u32), u64>>,
    fs_remove: Option<TypedFunc<(i32, u32, u32), u64>>,
    fs_remove_all: Option<TypedFunc<(i32, u32, u32), u64>>,
    fs_readdir: Option<TypedFunc<(i32, u32, u32, u32), u64>>,
    fs_stat: Option<TypedFunc<(i32, u32, u32, u32), u64>>,
    fs_rename: Option<TypedFunc<(i32, u32, u32, u32, u32), u64>>,
    fs_chmod: Option<TypedFunc<(i32, u32, u32, u32), u64>>,
}

/// Everything needed to talk to one instantiated module. The store is not
/// Sync, so all guest traffic is serialized behind one async mutex.
struct Ctx {
    store: Store<HostState>,
    guest: Guest,
    handle: i32,
}

impl Ctx {
    /// Copies host data into a guest buffer. Returns (0, 0) for empty input.
    async fn copy_in(&mut self, operation: &str, path: &str, data: &[u8]) -> Result<(u32, u32)> {
        if data.is_empty() {
            return Ok((0, 0));
        }

        let ptr = self
            .guest
            .wasm_malloc
            .call_async(&mut self.store, data.len() as u32)
            .await
            .map_err(|e| wasm_err(operation, path, e))?;

        let mem = self.guest.memory.data_mut(&mut self.store);
        let start = ptr as usize;
        if start + data.len() > mem.len() {
            return Err(Error::io(operation, path, "guest allocation out of bounds"));
        }
        mem[start..start + data.len()].copy_from_slice(data);
        Ok((ptr, data.len() as u32))
    }

    async fn free_in(&mut self, ptr: u32, len: u32) {
        if ptr == 0 || len == 0 {
            return;
        }
        if let Some(free) = &self.guest.wasm_free {
            let _ = free.call_async(&mut self.store, (ptr, len)).await;
        }
    }

    /// Copies a packed guest value out and releases the guest buffer.
    async fn take(&mut self, operation: &str, path: &str, packed: u64) -> Result<Vec<u8>> {
        let (ptr, len) = unpack(packed);
        if len == 0 {
            return Ok(Vec::new());
        }

        let mem = self.guest.memory.data(&self.store);
        let start = ptr as usize;
        let end = start + len as usize;
        if end > mem.len() {
            return Err(Error::io(operation, path, "guest result out of bounds"));
        }
        let data = mem[start..end].to_vec();
        self.free_in(ptr, len).await;
        Ok(data)
    }

    /// Allocates a zeroed 8-byte error slot in guest memory.
    async fn alloc_err_slot(&mut self, operation: &str, path: &str) -> Result<u32> {
        let ptr = self
            .guest
            .wasm_malloc
            .call_async(&mut self.store, 8)
            .await
            .map_err(|e| wasm_err(operation, path, e))?;

        let mem = self.guest.memory.data_mut(&mut self.store);
        let start = ptr as usize;
        if start + 8 > mem.len() {
            return Err(Error::io(operation, path, "guest error slot out of bounds"));
        }
        mem[start..start + 8].copy_from_slice(&0u64.to_le_bytes());
        Ok(ptr)
    }

    /// Reads (and consumes) the error slot; Some(message) when the guest
    /// reported a failure.
    async fn check_err_slot(
        &mut self,
        operation: &str,
        path: &str,
        slot: u32,
    ) -> Result<Option<String>> {
        let mem = self.guest.memory.data(&self.store);
        let start = slot as usize;
        if start + 8 > mem.len() {
            return Err(Error::io(operation, path, "guest error slot out of bounds"));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&mem[start..start + 8]);
        let packed = u64::from_le_bytes(raw);

        self.free_in(slot, 8).await;
        if packed == 0 {
            return Ok(None);
        }
        let message = self.take(operation, path, packed).await?;
        Ok(Some(String::from_utf8_lossy(&message).into_owned()))
    }

    /// Interprets a packed status return: 0 is success, anything else an
    /// error string.
    async fn check_status(&mut self, operation: &str, path: &str, packed: u64) -> Result<()> {
        if packed == 0 {
            return Ok(());
        }
        let message = self.take(operation, path, packed).await?;
        Err(Error::io(
            operation,
            path,
            String::from_utf8_lossy(&message).into_owned(),
        ))
    }
}

struct WasmFs {
    inner: tokio::sync::Mutex<Ctx>,
}

impl WasmFs {
    /// Shared body for the status-returning single-path operations.
    async fn path_op(
        &self,
        operation: &str,
        path: &str,
        f: Option<TypedFunc<(i32, u32, u32), u64>>,
    ) -> Result<()> {
        let f = f.ok_or_else(|| unsupported(operation, path))?;
        let mut ctx = self.inner.lock().await;
        let (p, plen) = ctx.copy_in(operation, path, path.as_bytes()).await?;
        let handle = ctx.handle;
        let packed = f
            .call_async(&mut ctx.store, (handle, p, plen))
            .await
            .map_err(|e| wasm_err(operation, path, e))?;
        ctx.free_in(p, plen).await;
        ctx.check_status(operation, path, packed).await
    }
}

#[async_trait::async_trait]
impl FileSystem for WasmFs {
    async fn create(&self, path: &str) -> Result<()> {
        let f = self.inner.lock().await.guest.fs_create.clone();
        self.path_op("create", path, f).await
    }

    async fn mkdir(&self, path: &str, perm: u32) -> Result<()> {
        let mut ctx = self.inner.lock().await;
        let f = ctx.guest.fs_mkdir.clone().ok_or_else(|| unsupported("mkdir", path))?;
        let (p, plen) = ctx.copy_in("mkdir", path, path.as_bytes()).await?;
        let handle = ctx.handle;
        let packed = f
            .call_async(&mut ctx.store, (handle, p, plen, perm))
            .await
            .map_err(|e| wasm_err("mkdir", path, e))?;
        ctx.free_in(p, plen).await;
        ctx.check_status("mkdir", path, packed).await
    }

    async fn read(&self, path: &str, offset: i64, size: i64) -> Result<Vec<u8>> {
        let mut ctx = self.inner.lock().await;
        let f = ctx.guest.fs_read.clone().ok_or_else(|| unsupported("read", path))?;
        let (p, plen) = ctx.copy_in("read", path, path.as_bytes()).await?;
        let slot = ctx.alloc_err_slot("read", path).await?;
        let handle = ctx.handle;

        let packed = f
            .call_async(&mut ctx.store, (handle, p, plen, offset, size, slot))
            .await
            .map_err(|e| wasm_err("read", path, e))?;
        ctx.free_in(p, plen).await;

        if let Some(message) = ctx.check_err_slot("read", path, slot).await? {
            return Err(Error::io("read", path, message));
        }
        ctx.take("read", path, packed).await
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<String> {
        let mut ctx = self.inner.lock().await;
        let f = ctx.guest.fs_write.clone().ok_or_else(|| unsupported("write", path))?;
        let (p, plen) = ctx.copy_in("write", path, path.as_bytes()).await?;
        let (d, dlen) = ctx.copy_in("write", path, data).await?;
        let slot = ctx.alloc_err_slot("write", path).await?;
        let handle = ctx.handle;

        let packed = f
            .call_async(&mut ctx.store, (handle, p, plen, d, dlen, slot))
            .await
            .map_err(|e| wasm_err("write", path, e))?;
        ctx.free_in(p, plen).await;
        ctx.free_in(d, dlen).await;

        if let Some(message) = ctx.check_err_slot("write", path, slot).await? {
            return Err(Error::io("write", path, message));
        }
        let message = ctx.take("write", path, packed).await?;
        Ok(String::from_utf8_lossy(&message).into_owned())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let f = self.inner.lock().await.guest.fs_remove.clone();
        self.path_op("remove", path, f).await
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let f = self.inner.lock().await.guest.fs_remove_all.clone();
        self.path_op("remove", path, f).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let mut ctx = self.inner.lock().await;
        let f = ctx
            .guest
            .fs_readdir
            .clone()
            .ok_or_else(|| unsupported("readdir", path))?;
        let (p, plen) = ctx.copy_in("readdir", path, path.as_bytes()).await?;
        let slot = ctx.alloc_err_slot("readdir", path).await?;
        let handle = ctx.handle;

        let packed = f
            .call_async(&mut ctx.store, (handle, p, plen, slot))
            .await
            .map_err(|e| wasm_err("readdir", path, e))?;
        ctx.free_in(p, plen).await;

        if let Some(message) = ctx.check_err_slot("readdir", path, slot).await? {
            return Err(Error::io("readdir", path, message));
        }
        let json = ctx.take("readdir", path, packed).await?;
        serde_json::from_slice(&json)
            .map_err(|e| Error::io("readdir", path, format!("invalid entries: {}", e)))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let mut ctx = self.inner.lock().await;
        let f = ctx.guest.fs_stat.clone().ok_or_else(|| unsupported("stat", path))?;
        let (p, plen) = ctx.copy_in("stat", path, path.as_bytes()).await?;
        let slot = ctx.alloc_err_slot("stat", path).await?;
        let handle = ctx.handle;

        let packed = f
            .call_async(&mut ctx.store, (handle, p, plen, slot))
            .await
            .map_err(|e| wasm_err("stat", path, e))?;
        ctx.free_in(p, plen).await;

        if let Some(message) = ctx.check_err_slot("stat", path, slot).await? {
            return Err(Error::io("stat", path, message));
        }
        let json = ctx.take("stat", path, packed).await?;
        serde_json::from_slice(&json)
            .map_err(|e| Error::io("stat", path, format!("invalid stat entry: {}", e)))
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut ctx = self.inner.lock().await;
        let f = ctx.guest.fs_rename.clone().ok_or_else(|| unsupported("rename", old))?;
        let (op, oplen) = ctx.copy_in("rename", old, old.as_bytes()).await?;
        let (np, nplen) = ctx.copy_in("rename", new, new.as_bytes()).await?;
        let handle = ctx.handle;

        let packed = f
            .call_async(&mut ctx.store, (handle, op, oplen, np, nplen))
            .await
            .map_err(|e| wasm_err("rename", old, e))?;
        ctx.free_in(op, oplen).await;
        ctx.free_in(np, nplen).await;
        ctx.check_status("rename", old, packed).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let mut ctx = self.inner.lock().await;
        let f = ctx.guest.fs_chmod.clone().ok_or_else(|| unsupported("chmod", path))?;
        let (p, plen) = ctx.copy_in("chmod", path, path.as_bytes()).await?;
        let handle = ctx.handle;

        let packed = f
            .call_async(&mut ctx.store, (handle, p, plen, mode))
            .await
            .map_err(|e| wasm_err("chmod", path, e))?;
        ctx.free_in(p, plen).await;
        ctx.check_status("chmod", path, packed).await
    }
}

pub struct WasmPlugin {
    name: String,
    key: String,
    readme: String,
    fs: Arc<WasmFs>,
    down: AtomicBool,
}

#[async_trait::async_trait]
impl Plugin for WasmPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, config: &Config) -> Result<()> {
        let f = {
            let ctx = self.fs.inner.lock().await;
            ctx.guest.plugin_validate.clone()
        };
        let f = match f {
            Some(f) => f,
            None => return Ok(()),
        };

        let json = serde_json::to_vec(config)
            .map_err(|e| Error::io("validate", &self.key, e.to_string()))?;
        let mut ctx = self.fs.inner.lock().await;
        let (p, plen) = ctx.copy_in("validate", &self.key, &json).await?;
        let handle = ctx.handle;
        let packed = f
            .call_async(&mut ctx.store, (handle, p, plen))
            .await
            .map_err(|e| wasm_err("validate", &self.key, e))?;
        ctx.free_in(p, plen).await;
        ctx.check_status("validate", &self.key, packed)
            .await
            .map_err(|e| Error::invalid_argument("validate", &self.key, e.message))
    }

    async fn initialize(&self, config: &Config) -> Result<()> {
        let f = {
            let ctx = self.fs.inner.lock().await;
            ctx.guest.plugin_initialize.clone()
        };
        let f = match f {
            Some(f) => f,
            None => return Ok(()),
        };

        let json = serde_json::to_vec(config)
            .map_err(|e| Error::io("initialize", &self.key, e.to_string()))?;
        let mut ctx = self.fs.inner.lock().await;
        let (p, plen) = ctx.copy_in("initialize", &self.key, &json).await?;
        let handle = ctx.handle;
        let packed = f
            .call_async(&mut ctx.store, (handle, p, plen))
            .await
            .map_err(|e| wasm_err("initialize", &self.key, e))?;
        ctx.free_in(p, plen).await;
        ctx.check_status("initialize", &self.key, packed).await
    }

    fn filesystem(&self) -> Arc<dyn FileSystem> {
        self.fs.clone()
    }

    fn readme(&self) -> String {
        self.readme.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        if self.down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let f = {
            let ctx = self.fs.inner.lock().await;
            ctx.guest.plugin_shutdown.clone()
        };
        let f = match f {
            Some(f) => f,
            None => return Ok(()),
        };

        let mut ctx = self.fs.inner.lock().await;
        let handle = ctx.handle;
        let packed = f
            .call_async(&mut ctx.store, handle)
            .await
            .map_err(|e| wasm_err("shutdown", &self.key, e))?;
        ctx.check_status("shutdown", &self.key, packed).await
    }
}

/// Tracks loaded WASM plugins. Loading the same path again never bumps a
/// refcount: every load gets a fresh runtime under a unique `path#N` key, so
/// an operator can replace a running plugin without touching the others.
pub struct Loader {
    plugins: Mutex<HashMap<String, Arc<WasmPlugin>>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl Loader {
    pub fn new() -> Self {
        Self {
            plugins: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(&self, path: &str, root: RootFs) -> Result<(String, Arc<dyn Plugin>)> {
        let abs = std::fs::canonicalize(path)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string());
        let key = {
            let mut counters = self.counters.lock().unwrap();
            let counter = counters.entry(abs.clone()).or_insert(0);
            *counter += 1;
            format!("{}#{}", abs, counter)
        };

        let mut config = wasmtime::Config::new();
        config.async_support(true);
        let engine =
            Engine::new(&config).map_err(|e| wasm_err("load", path, e))?;
        let module = Module::from_file(&engine, &abs).map_err(|e| wasm_err("load", path, e))?;

        let mut linker: Linker<HostState> = Linker::new(&engine);
        add_wasi_shim(&mut linker).map_err(|e| wasm_err("load", path, e))?;
        add_host_fns(&mut linker).map_err(|e| wasm_err("load", path, e))?;
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(|e| wasm_err("load", path, e))?;

        let mut store = Store::new(&engine, HostState { root });
        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(|e| wasm_err("load", path, e))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Error::io("load", path, "guest does not export memory"))?;
        let wasm_malloc = instance
            .get_typed_func::<u32, u32>(&mut store, "wasm_malloc")
            .map_err(|_| Error::io("load", path, "guest does not export wasm_malloc"))?;
        let plugin_new = instance
            .get_typed_func::<(), i32>(&mut store, "plugin_new")
            .map_err(|_| Error::io("load", path, "guest does not export plugin_new"))?;
        let plugin_name = instance
            .get_typed_func::<i32, u64>(&mut store, "plugin_name")
            .map_err(|_| Error::io("load", path, "guest does not export plugin_name"))?;
        let plugin_get_readme = instance
            .get_typed_func::<i32, u64>(&mut store, "plugin_get_readme")
            .ok();

        let guest = Guest {
            memory,
            wasm_malloc,
            wasm_free: instance.get_typed_func(&mut store, "wasm_free").ok(),
            plugin_validate: instance.get_typed_func(&mut store, "plugin_validate").ok(),
            plugin_initialize: instance
                .get_typed_func(&mut store, "plugin_initialize")
                .ok(),
            plugin_shutdown: instance.get_typed_func(&mut store, "plugin_shutdown").ok(),
            fs_create: instance.get_typed_func(&mut store, "fs_create").ok(),
            fs_mkdir: instance.get_typed_func(&mut store, "fs_mkdir").ok(),
            fs_read: instance.get_typed_func(&mut store, "fs_read").ok(),
            fs_write: instance.get_typed_func(&mut store, "fs_write").ok(),
            fs_remove: instance.get_typed_func(&mut store, "fs_remove").ok(),
            fs_remove_all: instance.get_typed_func(&mut store, "fs_remove_all").ok(),
            fs_readdir: instance.get_typed_func(&mut store, "fs_readdir").ok(),
            fs_stat: instance.get_typed_func(&mut store, "fs_stat").ok(),
            fs_rename: instance.get_typed_func(&mut store, "fs_rename").ok(),
            fs_chmod: instance.get_typed_func(&mut store, "fs_chmod").ok(),
        };

        let handle = plugin_new
            .call_async(&mut store, ())
            .await
            .map_err(|e| wasm_err("load", path, e))?;

        let mut ctx = Ctx {
            store,
            guest,
            handle,
        };

        let packed = plugin_name
            .call_async(&mut ctx.store, handle)
            .await
            .map_err(|e| wasm_err("load", path, e))?;
        let name_bytes = ctx.take("load", path, packed).await?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();
        if name.is_empty() {
            return Err(Error::io("load", path, "plugin declared an empty name"));
        }

        let readme = match plugin_get_readme {
            Some(f) => {
                let packed = f
                    .call_async(&mut ctx.store, handle)
                    .await
                    .map_err(|e| wasm_err("load", path, e))?;
                let bytes = ctx.take("load", path, packed).await?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            None => String::new(),
        };

        let plugin = Arc::new(WasmPlugin {
            name,
            key: key.clone(),
            readme,
            fs: Arc::new(WasmFs {
                inner: tokio::sync::Mutex::new(ctx),
            }),
            down: AtomicBool::new(false),
        });

        self.plugins
            .lock()
            .unwrap()
            .insert(key.clone(), plugin.clone());

        Ok((key, plugin))
    }

    /// Unloads by exact `path#N` key, or by library path (which picks the
    /// most recent load of that path). Returns the removed key.
    pub async fn unload(&self, key_or_path: &str) -> Result<String> {
        let plugin = {
            let plugins = self.plugins.lock().unwrap();
            match plugins.get(key_or_path) {
                Some(plugin) => plugin.clone(),
                None => {
                    let prefix = format!("{}#", key_or_path);
                    plugins
                        .iter()
                        .filter(|(k, _)| k.starts_with(&prefix))
                        .max_by_key(|(k, _)| {
                            k.as_str()[prefix.len()..].parse::<u64>().unwrap_or(0)
                        })
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| Error::not_found("unload", key_or_path))?
                }
            }
        };

        // plugin shutdown first, then the runtime goes away with the entry
        let result = plugin.shutdown().await;
        self.plugins.lock().unwrap().remove(&plugin.key);
        result.map(|_| plugin.key.clone())
    }

    pub fn loaded(&self) -> Vec<String> {
        self.plugins.lock().unwrap().keys().cloned().collect()
    }

    pub async fn shutdown_all(&self) {
        let plugins: Vec<Arc<WasmPlugin>> = {
            let mut map = self.plugins.lock().unwrap();
            map.drain().map(|(_, v)| v).collect()
        };
        for plugin in plugins {
            if let Err(err) = plugin.shutdown().await {
                error!("failed to shut down wasm plugin {}: {}", plugin.key, err);
            }
        }
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}
