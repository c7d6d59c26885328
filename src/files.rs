//! Admin dashboard, download and delete handlers.

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;
use httpdate::fmt_http_date;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::auth::SessionContext;
use crate::config::DASHBOARD_PATH;
use crate::error::ApiError;
use crate::flash::Flash;
use crate::pages::{DashboardPage, render};
use crate::storage::{Storage, StorageError};

/// Lists every stored object with its size.
pub async fn dashboard(
    Extension(storage): Extension<Arc<Storage>>,
    session: SessionContext,
) -> Result<Response, ApiError> {
    let files = storage.list_files().await?;
    debug!(count = files.len(), "list uploads");
    let flashes = session.take_flashes().await;
    render(&DashboardPage { flashes, files })
}

/// Streams a stored file as an attachment. Unknown or invalid names go
/// back to the dashboard without further detail.
pub async fn download_file(
    Path(name): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = match storage.resolve_file(&name).await {
        Ok(target) => target,
        Err(err) if is_missing(&err) => {
            debug!(name, "download of unknown file");
            return Ok(Redirect::to(DASHBOARD_PATH).into_response());
        }
        Err(err) => return Err(err.into()),
    };
    let file = match File::open(&target).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(Redirect::to(DASHBOARD_PATH).into_response());
        }
        Err(err) => return Err(ApiError::Internal(err.to_string())),
    };
    let metadata = fs::metadata(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let size = metadata.len();
    let mime = mime_guess::from_path(&name).first_or_octet_stream();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    headers.insert(header::CONTENT_DISPOSITION, attachment_header(&name));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Ok(modified) = metadata.modified()
        && let Ok(value) = HeaderValue::from_str(&fmt_http_date(modified))
    {
        headers.insert(header::LAST_MODIFIED, value);
    }

    info!(name, size, "download file");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Removes a stored file if it exists.
pub async fn delete_file(
    Path(name): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
    mut session: SessionContext,
) -> Result<(CookieJar, Redirect), ApiError> {
    match storage.delete_file(&name).await {
        Ok(true) => {
            info!(name, "delete file");
            session.flash(Flash::success("File deleted!")).await;
        }
        Ok(false) | Err(StorageError::InvalidName) => {
            debug!(name, "delete of unknown file");
        }
        Err(err) => return Err(err.into()),
    }
    Ok(session.redirect(DASHBOARD_PATH))
}

fn is_missing(err: &StorageError) -> bool {
    match err {
        StorageError::InvalidName => true,
        StorageError::Io(err) => err.kind() == ErrorKind::NotFound,
    }
}

fn attachment_header(name: &str) -> HeaderValue {
    let escaped: String = name
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .flat_map(|c| match c {
            '"' | '\\' => vec!['\\', c],
            _ => vec![c],
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{escaped}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
