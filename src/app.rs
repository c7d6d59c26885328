//! Router assembly.

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth::{self, SessionStore};
use crate::config::{CHANGE_PASSWORD_PATH, DASHBOARD_PATH, LOGIN_PATH, MAX_UPLOAD_SIZE};
use crate::credentials::CredentialStore;
use crate::files;
use crate::frontend;
use crate::http;
use crate::storage::Storage;
use crate::upload;

/// Shared services handed to every request.
#[derive(Clone)]
pub struct AppContext {
    pub storage: Arc<Storage>,
    pub credentials: Arc<CredentialStore>,
    pub sessions: Arc<SessionStore>,
}

/// Builds the full router with guard, headers, tracing and shared services.
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(upload::index))
        .route(
            "/upload",
            post(upload::upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE)),
        )
        .route(LOGIN_PATH, get(auth::login_page).post(auth::login))
        .route("/admin/logout", get(auth::logout))
        .route(
            CHANGE_PASSWORD_PATH,
            get(auth::change_password_page).post(auth::change_password),
        )
        .route(DASHBOARD_PATH, get(files::dashboard))
        .route("/admin/download/{name}", get(files::download_file))
        .route("/admin/delete/{name}", get(files::delete_file))
        .route("/static/{*path}", get(frontend::serve_asset))
        .layer(middleware::from_fn(auth::admin_guard))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = http::resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(ctx.storage))
        .layer(Extension(ctx.credentials))
        .layer(Extension(ctx.sessions))
}
