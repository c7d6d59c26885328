//! Drop box server binary.
//!
//! Anonymous visitors upload a file or pasted text; a single administrator
//! signs in to list, download and delete uploads and to change the admin
//! password. This module parses configuration, prepares the data
//! directory, and runs the HTTP(S) listener until shutdown.

mod app;
mod atomic;
mod auth;
mod background;
mod config;
mod credentials;
mod error;
mod files;
mod flash;
mod frontend;
mod http;
mod logging;
mod pages;
mod storage;
mod tls;
mod upload;

use axum::Router;
use axum::extract::Extension;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::app::{AppContext, build_router};
use crate::auth::SessionStore;
use crate::background::spawn_background_tasks;
use crate::config::{Args, DataLayout};
use crate::credentials::CredentialStore;
use crate::http::RequestScheme;
use crate::storage::Storage;

shadow!(build);

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let data_root = args.data_root();
    let layout = DataLayout::new(&data_root);
    info!(data_root = %data_root.display(), "using data directory");

    let storage = Arc::new(Storage::new(layout.upload_dir.clone()));
    storage.ensure_root().await?;
    let credentials = Arc::new(CredentialStore::new(layout.admin_file.clone()));
    let admin = credentials.load().await;
    info!(
        uploads = %storage.root_path().display(),
        admin_record = %credentials.path().display(),
        "storage ready"
    );
    if admin.must_change_password {
        warn!(username = %admin.username, "admin still uses the default password");
    }
    let sessions = Arc::new(SessionStore::new(Duration::from_secs(args.session_ttl_secs)));

    let app = build_router(AppContext {
        storage,
        credentials,
        sessions: sessions.clone(),
    });

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let tls_config = tls::load_rustls_config(&args).await?;
    let handle = Handle::new();

    spawn_background_tasks(sessions);
    let server = serve(app, addr, tls_config, handle.clone());
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => return result,
        _ = shutdown_signal(handle) => {}
    }

    // Keep polling the listener so open connections drain.
    server.await
}

async fn serve(
    app: Router,
    addr: SocketAddr,
    tls_config: Option<RustlsConfig>,
    handle: Handle,
) -> Result<(), std::io::Error> {
    match tls_config {
        Some(tls_config) => {
            info!("Starting HTTPS server at {}", addr);
            let app = app.layer(Extension(RequestScheme::Https));
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
        }
        None => {
            info!("Starting HTTP server at {}", addr);
            let app = app.layer(Extension(RequestScheme::Http));
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
        }
    }
}

async fn shutdown_signal(handle: Handle) {
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

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
