//! HTML page templates.

use askama::Template;
use axum::response::{Html, IntoResponse, Response};

use crate::error::ApiError;
use crate::flash::Flash;
use crate::storage::FileEntry;

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexPage {
    pub flashes: Vec<Flash>,
}

#[derive(Template)]
#[template(path = "login.html")]
pub struct LoginPage {
    pub flashes: Vec<Flash>,
}

/// Admin listing of stored files.
#[derive(Template)]
#[template(path = "dashboard.html")]
pub struct DashboardPage {
    pub flashes: Vec<Flash>,
    pub files: Vec<FileEntry>,
}

#[derive(Template)]
#[template(path = "change_password.html")]
pub struct ChangePasswordPage {
    pub flashes: Vec<Flash>,
}

/// Renders a page into an HTML response.
pub fn render<T: Template>(page: &T) -> Result<Response, ApiError> {
    Ok(Html(page.render()?).into_response())
}
