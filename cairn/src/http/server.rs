use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, head, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::http::api::{
    abort_session, commit_session, fetch_file, health, issue_nonce, probe_file, probe_store,
    start_upload, upload_file, AppState,
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/upload/:store_id", post(start_upload))
        .route(
            "/upload/:store_id/:session_id/*filename",
            head(issue_nonce).put(upload_file),
        )
        .route("/commit/:store_id/:session_id", post(commit_session))
        .route("/abort/:store_id/:session_id", post(abort_session))
        .route("/fetch/:store_id/*path", head(probe_file).get(fetch_file))
        .route("/:store_id", head(probe_store))
        // snapshots are arbitrarily large; uploads are streamed, not buffered
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs the propagation listener until shutdown.
///
/// With a configured certificate/key pair the listener terminates TLS
/// itself; unloadable material is a startup error. Without one it serves
/// plain HTTP for deployments that front the node with their own
/// terminator.
pub async fn run_http_server(config: &Config, state: AppState) -> Result<()> {
    let host: IpAddr = config
        .bind_host
        .parse()
        .context("parsing bind host address")?;
    let addr = SocketAddr::new(host, config.bind_port);
    let app = build_router(state);

    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .context("loading TLS certificate and key")?;
            let handle = Handle::new();
            tokio::spawn({
                let handle = handle.clone();
                async move {
                    shutdown_signal().await;
                    handle.graceful_shutdown(Some(Duration::from_secs(5)));
                }
            });
            info!("listening on https://{addr}");
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .context("HTTPS serving")?;
        }
        (None, None) => {
            let listener = TcpListener::bind(addr)
                .await
                .context("TCP listener binding")?;
            info!("listening on http://{addr}");
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP serving")?;
        }
        _ => bail!("tls_cert and tls_key must be configured together"),
    }
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
}
