//! # HTTP Server
//!
//! Binds the listener and serves the application router with graceful
//! shutdown: in-flight requests drain before the caller proceeds to stop the
//! background services.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::api::{router, AppState};

pub async fn serve<F>(state: AppState, listen_addr: &str, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("cannot bind {listen_addr}"))?;
    info!("HTTP server listening on {listen_addr}");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("http server failed")?;

    info!("HTTP server drained");
    Ok(())
}
