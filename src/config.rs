//! CLI arguments, storage layout and server defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::path::{Path, PathBuf};

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

/// Largest accepted request body for `/upload`.
pub const MAX_UPLOAD_SIZE: usize = 16 * 1024 * 1024;
/// Upload extensions accepted, compared case-insensitively.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "txt", "pdf", "png", "jpg", "jpeg", "gif", "doc", "docx", "zip",
];
/// Seeded administrator account.
pub const DEFAULT_ADMIN_USER: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
/// Cookie holding the session token.
pub const SESSION_COOKIE_NAME: &str = "DROPBOX_SESSION";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
/// Upper bound on the lifetime of a session without admin rights.
pub const ANONYMOUS_SESSION_TTL_SECS: u64 = 600;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;
/// Persistent disk mount on the hosted platform.
pub const HOSTED_DATA_DIR: &str = "/var/data";
pub const LOCAL_DATA_DIR: &str = "data";
pub const UPLOAD_DIR_NAME: &str = "uploads";
pub const ADMIN_FILE_NAME: &str = "admin_data.json";

pub const LOGIN_PATH: &str = "/admin/login";
pub const DASHBOARD_PATH: &str = "/admin/dashboard";
pub const CHANGE_PASSWORD_PATH: &str = "/admin/change-password";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "drop-box", version = VERSION_INFO, about = "Self-hosted file and text drop box")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "DROPBOX_DATA_DIR",
        help = "Persistent data directory (defaults depend on the hosting environment)"
    )]
    pub data_dir: Option<String>,
    #[arg(
        short = 'b',
        long = "bind",
        env = "DROPBOX_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(short = 'p', long, env = "PORT", default_value_t = 5000, help = "Listen port")]
    pub port: u16,
    #[arg(
        long,
        env = "DROPBOX_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session expiration in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(short = 'c', long, env = "DROPBOX_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "DROPBOX_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
}

impl Args {
    /// Root directory holding the upload directory and the credential record.
    pub fn data_root(&self) -> PathBuf {
        resolve_data_root(self.data_dir.as_deref(), |key| std::env::var(key).ok())
    }
}

/// Paths derived from the persistent root.
#[derive(Clone, Debug)]
pub struct DataLayout {
    pub upload_dir: PathBuf,
    pub admin_file: PathBuf,
}

impl DataLayout {
    /// Derives the upload directory and credential file under `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            upload_dir: root.join(UPLOAD_DIR_NAME),
            admin_file: root.join(ADMIN_FILE_NAME),
        }
    }
}

/// Picks the persistent root: explicit setting first, then the hosted
/// location when a hosting platform is detected, else a local directory.
pub fn resolve_data_root<F>(explicit: Option<&str>, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = explicit.map(str::trim).filter(|dir| !dir.is_empty()) {
        return PathBuf::from(dir);
    }
    if is_hosted(&lookup) {
        PathBuf::from(HOSTED_DATA_DIR)
    } else {
        PathBuf::from(LOCAL_DATA_DIR)
    }
}

fn is_hosted<F>(lookup: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup("RENDER").is_some()
        || lookup("RENDER_EXTERNAL_URL").is_some_and(|value| !value.is_empty())
}
