use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::fs::{Error, FileInfo, FileSystem, ReadChunk};
use crate::plugin::{Config, Registry};
use crate::stream::CHUNK_SIZE;

use super::response::{ApiError, ApiResult, MessageResponse};

/// How long a chunked read blocks before the transport re-checks liveness.
/// Timeouts are not cancellation: readers wait for data indefinitely.
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
pub struct FileQuery {
    pub path: Option<String>,
    pub offset: Option<i64>,
    pub size: Option<i64>,
    pub stream: Option<bool>,
    pub recursive: Option<bool>,
    pub mode: Option<String>,
    pub touch: Option<bool>,
}

fn require_path(query: &FileQuery) -> ApiResult<String> {
    query
        .path
        .clone()
        .ok_or_else(|| ApiError(Error::invalid_argument("request", "/", "missing path parameter")))
}

fn parse_octal(operation: &str, path: &str, mode: &str) -> ApiResult<u32> {
    u32::from_str_radix(mode, 8).map_err(|_| {
        ApiError(Error::invalid_argument(
            operation,
            path,
            format!("invalid octal mode '{}'", mode),
        ))
    })
}

pub async fn create_file(
    State(registry): State<Arc<Registry>>,
    Query(query): Query<FileQuery>,
) -> ApiResult<impl IntoResponse> {
    let path = require_path(&query)?;

    if query.touch.unwrap_or(false) {
        registry.router().touch(&path).await?;
        return Ok((
            StatusCode::CREATED,
            Json(MessageResponse::new("file touched successfully")),
        ));
    }

    registry.router().create(&path).await?;
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new("file created successfully")),
    ))
}

pub async fn read_file(
    State(registry): State<Arc<Registry>>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    let path = require_path(&query)?;

    if query.stream.unwrap_or(false) {
        return stream_response(registry, path).await;
    }

    let offset = query.offset.unwrap_or(0);
    let size = query.size.unwrap_or(-1);
    let data = registry.router().read(&path, offset, size).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(data))
        .map_err(|e| ApiError(Error::io("read", &path, e.to_string())))
}

/// Chunked streaming transport: a drain task pulls chunks off the stream
/// reader and hands them to the connection in sub-slices of at most one
/// writer chunk; a closed receiver means the client disconnected, which is a
/// normal way for a stream to end.
async fn stream_response(registry: Arc<Registry>, path: String) -> ApiResult<Response> {
    let mut reader = registry.router().open_stream(&path).await?;
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(1);

    tokio::spawn(async move {
        loop {
            match reader.read_chunk(STREAM_READ_TIMEOUT).await {
                ReadChunk::Data(data) => {
                    let mut offset = 0;
                    while offset < data.len() {
                        let end = data.len().min(offset + CHUNK_SIZE);
                        if tx.send(Ok(data.slice(offset..end))).await.is_err() {
                            debug!("stream {}: client disconnected", path);
                            reader.close().await;
                            return;
                        }
                        offset = end;
                    }
                }
                ReadChunk::Eof => break,
                ReadChunk::Timeout => {
                    debug!(
                        "stream {}: no data for {:?}, still waiting",
                        path, STREAM_READ_TIMEOUT
                    );
                }
            }
        }
        reader.close().await;
    });

    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("X-Content-Type-Options", "nosniff")
        .body(body)
        .map_err(|e| ApiError(Error::io("stream", "/", e.to_string())))
}

pub async fn write_file(
    State(registry): State<Arc<Registry>>,
    Query(query): Query<FileQuery>,
    body: Bytes,
) -> ApiResult<Json<MessageResponse>> {
    let path = require_path(&query)?;
    let message = registry.router().write(&path, &body).await?;

    let message = if message.is_empty() {
        "file written successfully".to_string()
    } else {
        message
    };
    Ok(Json(MessageResponse::new(message)))
}

pub async fn delete_file(
    State(registry): State<Arc<Registry>>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<MessageResponse>> {
    let path = require_path(&query)?;

    if query.recursive.unwrap_or(false) {
        registry.router().remove_all(&path).await?;
    } else {
        FileSystem::remove(&**registry.router(), &path).await?;
    }
    Ok(Json(MessageResponse::new("file removed successfully")))
}

pub async fn list_dir(
    State(registry): State<Arc<Registry>>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let path = require_path(&query)?;
    let files = registry.router().read_dir(&path).await?;
    Ok(Json(serde_json::json!({ "files": files })))
}

pub async fn make_dir(
    State(registry): State<Arc<Registry>>,
    Query(query): Query<FileQuery>,
) -> ApiResult<impl IntoResponse> {
    let path = require_path(&query)?;
    let mode = match &query.mode {
        Some(mode) => parse_octal("mkdir", &path, mode)?,
        None => 0o755,
    };

    registry.router().mkdir(&path, mode).await?;
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new("directory created successfully")),
    ))
}

pub async fn get_stat(
    State(registry): State<Arc<Registry>>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<FileInfo>> {
    let path = require_path(&query)?;
    let info = registry.router().stat(&path).await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    #[serde(rename = "newPath")]
    pub new_path: String,
}

pub async fn rename(
    State(registry): State<Arc<Registry>>,
    Query(query): Query<FileQuery>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let path = require_path(&query)?;
    registry.router().rename(&path, &request.new_path).await?;
    Ok(Json(MessageResponse::new("file renamed successfully")))
}

#[derive(Debug, Deserialize)]
pub struct ChmodRequest {
    pub mode: String,
}

pub async fn chmod(
    State(registry): State<Arc<Registry>>,
    Query(query): Query<FileQuery>,
    Json(request): Json<ChmodRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let path = require_path(&query)?;
    let mode = parse_octal("chmod", &path, &request.mode)?;
    registry.router().chmod(&path, mode).await?;
    Ok(Json(MessageResponse::new("mode changed successfully")))
}

#[derive(serde::Serialize)]
struct MountEntry {
    path: String,
    #[serde(rename = "pluginName")]
    plugin_name: String,
    config: Config,
}

pub async fn list_mounts(
    State(registry): State<Arc<Registry>>,
) -> Json<serde_json::Value> {
    let mounts: Vec<MountEntry> = registry
        .router()
        .mounts()
        .into_iter()
        .map(|m| MountEntry {
            path: m.path.clone(),
            plugin_name: m.plugin.name().to_string(),
            config: m.config.clone(),
        })
        .collect();
    Json(serde_json::json!({ "mounts": mounts }))
}

#[derive(Debug, Deserialize)]
pub struct MountRequest {
    pub fstype: String,
    pub path: String,
    #[serde(default)]
    pub config: Config,
}

pub async fn mount(
    State(registry): State<Arc<Registry>>,
    Json(request): Json<MountRequest>,
) -> ApiResult<Json<MessageResponse>> {
    registry
        .mount(&request.fstype, &request.path, request.config)
        .await?;
    Ok(Json(MessageResponse::new("filesystem mounted successfully")))
}

#[derive(Debug, Deserialize)]
pub struct UnmountRequest {
    pub path: String,
}

pub async fn unmount(
    State(registry): State<Arc<Registry>>,
    Json(request): Json<UnmountRequest>,
) -> ApiResult<Json<MessageResponse>> {
    registry.unmount(&request.path).await?;
    Ok(Json(MessageResponse::new(
        "filesystem unmounted successfully",
    )))
}

pub async fn list_plugins(State(registry): State<Arc<Registry>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "loaded_plugins": registry.loaded() }))
}

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub library_path: String,
}

pub async fn load_plugin(
    State(registry): State<Arc<Registry>>,
    Json(request): Json<LoadRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = registry.load(&request.library_path).await?;
    Ok(Json(serde_json::json!({ "plugin_name": name })))
}

pub async fn unload_plugin(
    State(registry): State<Arc<Registry>>,
    Json(request): Json<LoadRequest>,
) -> ApiResult<Json<MessageResponse>> {
    registry.unload(&request.library_path).await?;
    Ok(Json(MessageResponse::new("plugin unloaded successfully")))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "gitCommit": env!("GIT_VERSION"),
        "buildTime": env!("BUILD_TIME"),
    }))
}
