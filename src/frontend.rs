//! Embedded static assets.

use axum::body::Body as AxumBody;
use axum::extract::Path;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

use crate::error::ApiError;

/// Files under `assets/`, compiled into the binary.
#[derive(RustEmbed)]
#[folder = "assets"]
pub struct StaticAssets;

/// Serves `/static/{*path}` from the embedded asset folder.
pub async fn serve_asset(Path(path): Path<String>) -> Result<Response, ApiError> {
    let Some(asset) = StaticAssets::get(&path) else {
        return Err(ApiError::NotFound("not found".into()));
    };
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    Ok((headers, AxumBody::from(asset.data.into_owned())).into_response())
}
