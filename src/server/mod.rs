mod handlers;
mod response;

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{BoxError, Router};
use hyper::{
    header::{ACCEPT, CONTENT_TYPE},
    Method,
};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::plugin::Registry;

/// Builds the full /api/v1 surface over a registry.
pub fn app(registry: Arc<Registry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([ACCEPT, CONTENT_TYPE]);

    let v1_routes = Router::new()
        .route(
            "/api/v1/files",
            post(handlers::create_file)
                .get(handlers::read_file)
                .put(handlers::write_file)
                .delete(handlers::delete_file),
        )
        .route(
            "/api/v1/directories",
            get(handlers::list_dir).post(handlers::make_dir),
        )
        .route("/api/v1/stat", get(handlers::get_stat))
        .route("/api/v1/rename", post(handlers::rename))
        .route("/api/v1/chmod", post(handlers::chmod))
        .route("/api/v1/mounts", get(handlers::list_mounts))
        .route("/api/v1/mount", post(handlers::mount))
        .route("/api/v1/unmount", post(handlers::unmount))
        .route("/api/v1/plugins", get(handlers::list_plugins))
        .route("/api/v1/plugins/load", post(handlers::load_plugin))
        .route("/api/v1/plugins/unload", post(handlers::unload_plugin))
        .route("/api/v1/health", get(handlers::health));

    // no request deadline here: streaming responses stay open as long as the
    // client does
    Router::new()
        .merge(v1_routes)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_error))
                .load_shed()
                .concurrency_limit(1024)
                .layer(TraceLayer::new_for_http()),
        )
        .with_state(registry)
        .layer(cors)
}

pub async fn serve(registry: Arc<Registry>, host: &str, port: u16) -> Result<()> {
    let app = app(registry);

    let address = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .context("failed to bind address")?;

    info!("server started successfully at {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("failed to serve listener")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_error(error: BoxError) -> impl IntoResponse {
    if error.is::<tower::load_shed::error::Overloaded>() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Cow::from("service is overloaded, try again later"),
        );
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Cow::from(format!("Unhandled internal error: {}", error)),
    )
}
