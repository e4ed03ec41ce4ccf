use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use unifs::plugin::Registry;
use unifs::server;

async fn send(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let (status, bytes) = send_raw(app, method, uri, body).await;
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

async fn send_raw(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&value).unwrap())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn put_bytes(app: &axum::Router, uri: &str, data: &[u8]) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::PUT)
                .uri(uri)
                .body(Body::from(data.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
}

fn test_app() -> axum::Router {
    server::app(Registry::new())
}

#[tokio::test]
async fn test_health() {
    let app = test_app();

    let (status, body) = send(&app, Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert!(body["gitCommit"].is_string());
    assert!(body["buildTime"].is_string());
}

#[tokio::test]
async fn test_file_roundtrip_over_http() {
    let app = test_app();

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/mount",
        Some(serde_json::json!({"fstype": "memfs", "path": "/mem"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = put_bytes(&app, "/api/v1/files?path=/mem/hello.txt", b"hello world").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].is_string());

    let (status, bytes) = send_raw(&app, Method::GET, "/api/v1/files?path=/mem/hello.txt", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"hello world");

    // ranged read
    let (status, bytes) = send_raw(
        &app,
        Method::GET,
        "/api/v1/files?path=/mem/hello.txt&offset=6&size=5",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"world");

    // reading past the end succeeds with an empty body
    let (status, bytes) = send_raw(
        &app,
        Method::GET,
        "/api/v1/files?path=/mem/hello.txt&offset=100",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(bytes.is_empty());

    let (status, body) = send(&app, Method::GET, "/api/v1/stat?path=/mem/hello.txt", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "hello.txt");
    assert_eq!(body["size"], 11);
    assert_eq!(body["isDir"], false);

    let (status, body) = send(&app, Method::GET, "/api/v1/directories?path=/mem", None).await;
    assert_eq!(status, StatusCode::OK);
    let files = body["files"].as_array().unwrap();
    assert!(files.iter().any(|f| f["name"] == "hello.txt"));

    let (status, _) = send(
        &app,
        Method::DELETE,
        "/api/v1/files?path=/mem/hello.txt",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, Method::GET, "/api/v1/files?path=/mem/hello.txt", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_directories_and_rename() {
    let app = test_app();

    send(
        &app,
        Method::POST,
        "/api/v1/mount",
        Some(serde_json::json!({"fstype": "memfs", "path": "/mem"})),
    )
    .await;

    let (status, _) = send(&app, Method::POST, "/api/v1/directories?path=/mem/docs&mode=750", None).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, Method::GET, "/api/v1/stat?path=/mem/docs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isDir"], true);
    assert_eq!(body["mode"], 0o750);

    put_bytes(&app, "/api/v1/files?path=/mem/docs/a.txt", b"a").await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/rename?path=/mem/docs/a.txt",
        Some(serde_json::json!({"newPath": "/mem/docs/b.txt"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, bytes) = send_raw(&app, Method::GET, "/api/v1/files?path=/mem/docs/b.txt", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"a");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/chmod?path=/mem/docs/b.txt",
        Some(serde_json::json!({"mode": "600"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, Method::GET, "/api/v1/stat?path=/mem/docs/b.txt", None).await;
    assert_eq!(body["mode"], 0o600);
}

#[tokio::test]
async fn test_error_status_mapping() {
    let app = test_app();

    // missing path parameter
    let (status, body) = send(&app, Method::GET, "/api/v1/files", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    // unknown filesystem type
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/mount",
        Some(serde_json::json!({"fstype": "nope", "path": "/x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // occupied mount path
    send(
        &app,
        Method::POST,
        "/api/v1/mount",
        Some(serde_json::json!({"fstype": "memfs", "path": "/mem"})),
    )
    .await;
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/mount",
        Some(serde_json::json!({"fstype": "memfs", "path": "/mem"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // nothing mounted at the path
    let (status, _) = send(&app, Method::GET, "/api/v1/files?path=/nowhere/f", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_mounts_listing_and_unmount() {
    let app = test_app();

    send(
        &app,
        Method::POST,
        "/api/v1/mount",
        Some(serde_json::json!({"fstype": "memfs", "path": "/mem"})),
    )
    .await;

    let (status, body) = send(&app, Method::GET, "/api/v1/mounts", None).await;
    assert_eq!(status, StatusCode::OK);
    let mounts = body["mounts"].as_array().unwrap();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0]["path"], "/mem");
    assert_eq!(mounts[0]["pluginName"], "memfs");
    assert_eq!(mounts[0]["config"]["mount_path"], "/mem");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/unmount",
        Some(serde_json::json!({"path": "/mem"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, Method::GET, "/api/v1/mounts", None).await;
    assert_eq!(body["mounts"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_queue_over_http() {
    let app = test_app();

    send(
        &app,
        Method::POST,
        "/api/v1/mount",
        Some(serde_json::json!({"fstype": "queuefs", "path": "/q"})),
    )
    .await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/directories?path=/q/logs/errors",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let mut last_mod_time = String::new();
    for body in ["a", "b", "c"] {
        let (status, response) = put_bytes(
            &app,
            "/api/v1/files?path=/q/logs/errors/enqueue",
            body.as_bytes(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        // the write response is the message id
        assert!(response["message"].as_str().unwrap().parse::<i64>().is_ok());

        let (_, stat) = send(
            &app,
            Method::GET,
            "/api/v1/stat?path=/q/logs/errors/peek",
            None,
        )
        .await;
        let mod_time = stat["modTime"].as_str().unwrap().to_string();
        let current = chrono::DateTime::parse_from_rfc3339(&mod_time).unwrap();
        if !last_mod_time.is_empty() {
            let previous = chrono::DateTime::parse_from_rfc3339(&last_mod_time).unwrap();
            assert!(current > previous, "poll cursor must advance strictly");
        }
        last_mod_time = mod_time;
    }

    let (_, bytes) = send_raw(&app, Method::GET, "/api/v1/files?path=/q/logs/errors/size", None).await;
    assert_eq!(bytes, b"3");

    for expected in ["a", "b", "c"] {
        let (status, bytes) = send_raw(
            &app,
            Method::GET,
            "/api/v1/files?path=/q/logs/errors/dequeue",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let message: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        use base64::Engine;
        let data = base64::engine::general_purpose::STANDARD
            .decode(message["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(data, expected.as_bytes());
    }

    let (_, bytes) = send_raw(
        &app,
        Method::GET,
        "/api/v1/files?path=/q/logs/errors/dequeue",
        None,
    )
    .await;
    assert_eq!(bytes, b"{}");
}

#[tokio::test]
async fn test_stream_over_http() {
    use futures::StreamExt;

    let app = test_app();

    send(
        &app,
        Method::POST,
        "/api/v1/mount",
        Some(serde_json::json!({
            "fstype": "streamfs",
            "path": "/streams",
            "config": {"ring_buffer_size": 262144, "channel_buffer_size": 131072}
        })),
    )
    .await;

    put_bytes(&app, "/api/v1/files?path=/streams/events", b"first").await;
    put_bytes(&app, "/api/v1/files?path=/streams/events", b"second").await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/api/v1/files?path=/streams/events&stream=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/octet-stream"
    );
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );

    let mut stream = response.into_body().into_data_stream();

    let mut received = Vec::new();
    for _ in 0..2 {
        let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for chunk")
            .unwrap()
            .unwrap();
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"firstsecond");

    // live chunk after the replayed history
    put_bytes(&app, "/api/v1/files?path=/streams/events", b"live").await;
    let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for live chunk")
        .unwrap()
        .unwrap();
    assert_eq!(&chunk[..], b"live");

    // dropping the body is a normal client disconnect
    drop(stream);
}

#[tokio::test]
async fn test_plugins_endpoints() {
    let app = test_app();

    let (status, body) = send(&app, Method::GET, "/api/v1/plugins", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["loaded_plugins"].as_array().unwrap().len(), 0);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/plugins/load",
        Some(serde_json::json!({"library_path": "/no/such/plugin.so"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_synthetic_parents_over_http() {
    let app = test_app();

    send(
        &app,
        Method::POST,
        "/api/v1/mount",
        Some(serde_json::json!({"fstype": "memfs", "path": "/mnt/mem"})),
    )
    .await;
    send(
        &app,
        Method::POST,
        "/api/v1/mount",
        Some(serde_json::json!({"fstype": "memfs", "path": "/mnt/kv/keys"})),
    )
    .await;

    let (_, body) = send(&app, Method::GET, "/api/v1/directories?path=/", None).await;
    let files = body["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["name"], "mnt");

    let (_, body) = send(&app, Method::GET, "/api/v1/directories?path=/mnt", None).await;
    let mut names: Vec<&str> = body["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["kv", "mem"]);

    let (_, body) = send(&app, Method::GET, "/api/v1/stat?path=/mnt/kv", None).await;
    assert_eq!(body["isDir"], true);
    assert_eq!(body["meta"]["type"], "mount-point");
}
