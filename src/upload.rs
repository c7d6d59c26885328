//! Public upload form and the multipart upload handler.

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Extension, Multipart};
use axum::http::StatusCode;
use axum::response::{Redirect, Response};
use axum_extra::extract::CookieJar;
use chrono::{Local, NaiveDateTime};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::SessionContext;
use crate::config::MAX_UPLOAD_SIZE;
use crate::error::ApiError;
use crate::flash::Flash;
use crate::pages::{IndexPage, render};
use crate::storage::{PendingUpload, Storage, StorageError, StoredFile};

const FILE_FIELD: &str = "file";
const TEXT_FIELD: &str = "text_content";

/// Upload form.
pub async fn index(session: SessionContext) -> Result<Response, ApiError> {
    let flashes = session.take_flashes().await;
    render(&IndexPage { flashes })
}

/// Stores the submitted file, or the pasted text when no acceptable file
/// came with the form. The outcome is reported as a flash on `/`.
pub async fn upload(
    Extension(storage): Extension<Arc<Storage>>,
    mut session: SessionContext,
    multipart: Multipart,
) -> Result<(CookieJar, Redirect), ApiError> {
    let now = Local::now().naive_local();
    let flash = match receive(&storage, now, multipart).await {
        Ok(Submission {
            file: Some(stored), ..
        }) => {
            info!(name = %stored.name, bytes = stored.size, "file uploaded");
            Flash::success("File uploaded successfully!")
        }
        Ok(Submission {
            text, rejected_file, ..
        }) => {
            let text = text.trim();
            if !text.is_empty() {
                let stored = storage.store_text(now, text).await?;
                info!(name = %stored.name, bytes = stored.size, "text saved");
                Flash::success("Text saved successfully!")
            } else if rejected_file {
                Flash::error("File type not allowed!")
            } else {
                Flash::error("No file or text provided!")
            }
        }
        Err(ReceiveError::TooLarge) => {
            warn!(limit = MAX_UPLOAD_SIZE, "upload exceeds size limit");
            Flash::error(format!(
                "Upload too large! The limit is {} MB.",
                MAX_UPLOAD_SIZE / (1024 * 1024)
            ))
        }
        Err(ReceiveError::Malformed(msg)) => return Err(ApiError::BadRequest(msg)),
        Err(ReceiveError::Storage(err)) => return Err(err.into()),
    };
    session.flash(flash).await;
    Ok(session.redirect("/"))
}

#[derive(Default)]
struct Submission {
    file: Option<StoredFile>,
    rejected_file: bool,
    text: String,
}

enum ReceiveError {
    TooLarge,
    Malformed(String),
    Storage(StorageError),
}

impl From<MultipartError> for ReceiveError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ReceiveError::TooLarge
        } else {
            ReceiveError::Malformed(err.body_text())
        }
    }
}

impl From<StorageError> for ReceiveError {
    fn from(err: StorageError) -> Self {
        ReceiveError::Storage(err)
    }
}

/// Drains the form. A file stored before a later field fails is removed
/// again so a failed request leaves nothing behind.
async fn receive(
    storage: &Storage,
    now: NaiveDateTime,
    mut multipart: Multipart,
) -> Result<Submission, ReceiveError> {
    let mut submission = Submission::default();
    let result = read_fields(storage, now, &mut multipart, &mut submission).await;
    if result.is_err()
        && let Some(stored) = submission.file.take()
    {
        let _ = storage.delete_file(&stored.name).await;
    }
    result.map(|()| submission)
}

async fn read_fields(
    storage: &Storage,
    now: NaiveDateTime,
    multipart: &mut Multipart,
    submission: &mut Submission,
) -> Result<(), ReceiveError> {
    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            FILE_FIELD if submission.file.is_none() => {
                let original = field.file_name().unwrap_or_default().to_string();
                if original.is_empty() {
                    continue;
                }
                match storage.begin_upload(now, &original).await? {
                    Some(pending) => {
                        submission.file = Some(stream_field(pending, &mut field).await?);
                    }
                    None => {
                        info!(original, "rejected upload with disallowed extension");
                        submission.rejected_file = true;
                    }
                }
            }
            TEXT_FIELD => submission.text = field.text().await?,
            _ => {}
        }
    }
    Ok(())
}

async fn stream_field(
    mut pending: PendingUpload,
    field: &mut Field<'_>,
) -> Result<StoredFile, ReceiveError> {
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                pending.abort().await;
                return Err(err.into());
            }
        };
        if let Err(err) = pending.write(&chunk).await {
            pending.abort().await;
            return Err(err.into());
        }
    }
    Ok(pending.commit().await?)
}
