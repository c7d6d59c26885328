//! Sessions, the admin access guard, and the login, logout and
//! password change handlers.
//!
//! A session is server-side state keyed by a random token held in a
//! cookie. Any visitor can own one (flash messages ride on it); only a
//! session with the `admin` flag passes the guard. Anonymous sessions
//! are short lived and disappear once their flashes are shown.

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Form, FromRequestParts};
use axum::http::Request;
use axum::http::request::Parts;
use axum::middleware;
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use cookie::time::Duration as CookieDuration;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{
    ANONYMOUS_SESSION_TTL_SECS, CHANGE_PASSWORD_PATH, DASHBOARD_PATH, LOGIN_PATH,
    SESSION_COOKIE_NAME,
};
use crate::credentials::{CredentialStore, constant_time_eq, is_default_password};
use crate::error::ApiError;
use crate::flash::Flash;
use crate::http::{ClientIp, RequestScheme, is_https_request};
use crate::pages::{ChangePasswordPage, LoginPage, render};

/// State held for one session token.
#[derive(Debug)]
pub struct SessionEntry {
    pub admin: bool,
    pub flashes: Vec<Flash>,
    pub expires_at: Instant,
}

impl SessionEntry {
    /// The `admin` flag alone decides privilege.
    pub fn is_authenticated(&self) -> bool {
        self.admin
    }
}

/// In-memory session table shared by every request.
#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    ttl: Duration,
    anonymous_ttl: Duration,
}

impl SessionStore {
    /// `ttl` bounds admin sessions; anonymous ones never outlive it.
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            anonymous_ttl: ttl.min(Duration::from_secs(ANONYMOUS_SESSION_TTL_SECS)),
        }
    }

    /// Lifetime of a session with the given privilege.
    pub fn ttl_for(&self, admin: bool) -> Duration {
        if admin { self.ttl } else { self.anonymous_ttl }
    }

    /// Starts a session and returns its token.
    pub async fn create(&self, admin: bool, flashes: Vec<Flash>) -> String {
        let token = Uuid::new_v4().to_string();
        let entry = SessionEntry {
            admin,
            flashes,
            expires_at: Instant::now() + self.ttl_for(admin),
        };
        self.sessions.lock().await.insert(token.clone(), entry);
        token
    }

    /// True only for a live session carrying the admin flag.
    pub async fn is_authenticated(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        live_entry(&mut sessions, token).is_some_and(|entry| entry.is_authenticated())
    }

    /// Queues a flash on a live session, handing it back otherwise.
    pub async fn push_flash(&self, token: &str, flash: Flash) -> Result<(), Flash> {
        let mut sessions = self.sessions.lock().await;
        match live_entry(&mut sessions, token) {
            Some(entry) => {
                entry.flashes.push(flash);
                Ok(())
            }
            None => Err(flash),
        }
    }

    /// Drains queued flashes. An anonymous session has nothing left to
    /// carry afterwards and is dropped.
    pub async fn take_flashes(&self, token: &str) -> Vec<Flash> {
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = live_entry(&mut sessions, token) else {
            return Vec::new();
        };
        let flashes = std::mem::take(&mut entry.flashes);
        if !entry.admin {
            sessions.remove(token);
        }
        flashes
    }

    /// Grants or revokes the admin flag. Revoking also shortens the
    /// remaining lifetime to the anonymous TTL.
    pub async fn set_admin(&self, token: &str, admin: bool) -> bool {
        let anonymous_expiry = Instant::now() + self.anonymous_ttl;
        let mut sessions = self.sessions.lock().await;
        match live_entry(&mut sessions, token) {
            Some(entry) => {
                entry.admin = admin;
                if !admin {
                    entry.expires_at = entry.expires_at.min(anonymous_expiry);
                }
                true
            }
            None => false,
        }
    }

    /// Removes a session, returning it if it was still live.
    pub async fn remove(&self, token: &str) -> Option<SessionEntry> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .remove(token)
            .filter(|entry| entry.expires_at > Instant::now())
    }

    /// Drops every expired session.
    pub async fn prune_expired(&self) {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        sessions.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of stored sessions, expired ones included until pruned.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn live_entry<'a>(
    sessions: &'a mut HashMap<String, SessionEntry>,
    token: &str,
) -> Option<&'a mut SessionEntry> {
    let now = Instant::now();
    if sessions
        .get(token)
        .is_some_and(|entry| entry.expires_at <= now)
    {
        sessions.remove(token);
        return None;
    }
    sessions.get_mut(token)
}

/// Per-request view of the caller's session and cookie jar.
pub struct SessionContext {
    store: Arc<SessionStore>,
    jar: CookieJar,
    secure: bool,
}

impl<S> FromRequestParts<S> for SessionContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let store = parts
            .extensions
            .get::<Arc<SessionStore>>()
            .cloned()
            .ok_or_else(|| ApiError::Internal("session store not configured".into()))?;
        let scheme = parts
            .extensions
            .get::<RequestScheme>()
            .copied()
            .unwrap_or(RequestScheme::Http);
        Ok(Self {
            store,
            jar: CookieJar::from_headers(&parts.headers),
            secure: is_https_request(&parts.headers, scheme),
        })
    }
}

impl SessionContext {
    fn token(&self) -> Option<String> {
        self.jar
            .get(SESSION_COOKIE_NAME)
            .map(|cookie| cookie.value().to_string())
    }

    /// Whether the cookie names a live admin session.
    pub async fn is_authenticated(&self) -> bool {
        match self.token() {
            Some(token) => self.store.is_authenticated(&token).await,
            None => false,
        }
    }

    /// Queues a message for the next rendered page, starting an
    /// anonymous session when the caller has none.
    pub async fn flash(&mut self, flash: Flash) {
        let flash = match self.token() {
            Some(token) => match self.store.push_flash(&token, flash).await {
                Ok(()) => return,
                Err(flash) => flash,
            },
            None => flash,
        };
        let token = self.store.create(false, vec![flash]).await;
        self.set_cookie(token, false);
    }

    /// Drains the messages queued for this caller.
    pub async fn take_flashes(&self) -> Vec<Flash> {
        match self.token() {
            Some(token) => self.store.take_flashes(&token).await,
            None => Vec::new(),
        }
    }

    /// Marks the caller as admin under a fresh token.
    pub async fn login(&mut self) {
        let carried = match self.token() {
            Some(token) => self
                .store
                .remove(&token)
                .await
                .map(|entry| entry.flashes)
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let token = self.store.create(true, carried).await;
        self.set_cookie(token, true);
    }

    /// Revokes admin rights on the current session.
    pub async fn logout(&mut self) {
        if let Some(token) = self.token() {
            self.store.set_admin(&token, false).await;
        }
    }

    /// Redirect response carrying any cookie set during the request.
    pub fn redirect(self, to: &str) -> (CookieJar, Redirect) {
        (self.jar, Redirect::to(to))
    }

    fn set_cookie(&mut self, token: String, admin: bool) {
        let cookie = Cookie::build((SESSION_COOKIE_NAME, token))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Strict)
            .max_age(CookieDuration::seconds(
                i64::try_from(self.store.ttl_for(admin).as_secs()).unwrap_or(i64::MAX),
            ))
            .build();
        self.jar = std::mem::take(&mut self.jar).add(cookie);
    }
}

/// Redirects to the login page unless the caller holds an admin session.
pub async fn admin_guard(
    Extension(sessions): Extension<Arc<SessionStore>>,
    jar: CookieJar,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    if !is_guarded_path(req.uri().path()) {
        return next.run(req).await;
    }

    if let Some(cookie) = jar.get(SESSION_COOKIE_NAME)
        && sessions.is_authenticated(cookie.value()).await
    {
        return next.run(req).await;
    }

    debug!(path = req.uri().path(), "admin route without session");
    Redirect::to(LOGIN_PATH).into_response()
}

fn is_guarded_path(path: &str) -> bool {
    path.starts_with("/admin/") && path != LOGIN_PATH
}

/// Body of the login form.
#[derive(Deserialize)]
pub(crate) struct LoginForm {
    username: String,
    password: String,
}

/// Login form; signed-in admins go straight to the dashboard.
pub async fn login_page(session: SessionContext) -> Result<Response, ApiError> {
    if session.is_authenticated().await {
        return Ok(Redirect::to(DASHBOARD_PATH).into_response());
    }
    let flashes = session.take_flashes().await;
    render(&LoginPage { flashes })
}

/// Checks the submitted pair against the credential record. Failures
/// never reveal whether the username or the password was wrong.
pub async fn login(
    Extension(credentials): Extension<Arc<CredentialStore>>,
    client_ip: ClientIp,
    mut session: SessionContext,
    Form(form): Form<LoginForm>,
) -> (CookieJar, Redirect) {
    if session.is_authenticated().await {
        return session.redirect(DASHBOARD_PATH);
    }

    let record = credentials.load().await;
    let username_ok = constant_time_eq(form.username.as_bytes(), record.username.as_bytes());
    let password_ok = credentials.verify(&form.password, &record).await;
    if !(username_ok && password_ok) {
        warn!(%client_ip, "admin login failed");
        session.flash(Flash::error("Invalid credentials!")).await;
        return session.redirect(LOGIN_PATH);
    }

    let record = if record.has_legacy_hash() {
        match credentials
            .upgrade_legacy(&form.password, record.clone())
            .await
        {
            Ok(upgraded) => upgraded,
            Err(err) => {
                warn!(error = %err, "failed to upgrade legacy admin hash");
                record
            }
        }
    } else {
        record
    };

    session.login().await;
    info!(%client_ip, username = %record.username, "admin logged in");
    session.flash(Flash::success("Login successful!")).await;

    if record.must_change_password || is_default_password(&form.password) {
        session
            .flash(Flash::warning(
                "You are still using the default password. Please change it now.",
            ))
            .await;
        return session.redirect(CHANGE_PASSWORD_PATH);
    }
    session.redirect(DASHBOARD_PATH)
}

/// Ends the admin session and returns to the upload page.
pub async fn logout(mut session: SessionContext) -> (CookieJar, Redirect) {
    session.logout().await;
    info!("admin logged out");
    session.flash(Flash::success("Logged out!")).await;
    session.redirect("/")
}

/// Body of the change-password form.
#[derive(Deserialize)]
pub(crate) struct ChangePasswordForm {
    current_password: String,
    new_password: String,
    confirm_password: String,
}

/// Change-password form.
pub async fn change_password_page(session: SessionContext) -> Result<Response, ApiError> {
    let flashes = session.take_flashes().await;
    render(&ChangePasswordPage { flashes })
}

/// Verifies the current password and stores the new one.
pub async fn change_password(
    Extension(credentials): Extension<Arc<CredentialStore>>,
    mut session: SessionContext,
    Form(form): Form<ChangePasswordForm>,
) -> (CookieJar, Redirect) {
    let record = credentials.load().await;

    let rejection = if !credentials.verify(&form.current_password, &record).await {
        Some("Incorrect current password!")
    } else if form.new_password != form.confirm_password {
        Some("Passwords do not match!")
    } else if form.new_password.is_empty() {
        Some("New password must not be empty!")
    } else {
        None
    };
    if let Some(message) = rejection {
        session.flash(Flash::error(message)).await;
        return session.redirect(CHANGE_PASSWORD_PATH);
    }

    match credentials.update(&form.new_password, record).await {
        Ok(_) => {
            session.flash(Flash::success("Password updated!")).await;
            session.redirect(DASHBOARD_PATH)
        }
        Err(err) => {
            warn!(error = %err, "failed to persist new admin password");
            session
                .flash(Flash::error("Could not save the new password!"))
                .await;
            session.redirect(CHANGE_PASSWORD_PATH)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_covers_admin_routes_except_login() {
        assert!(is_guarded_path("/admin/dashboard"));
        assert!(is_guarded_path("/admin/delete/a.txt"));
        assert!(is_guarded_path("/admin/logout"));
        assert!(!is_guarded_path("/admin/login"));
        assert!(!is_guarded_path("/"));
        assert!(!is_guarded_path("/upload"));
    }

    #[tokio::test]
    async fn anonymous_session_is_not_authenticated() {
        let store = SessionStore::new(Duration::from_secs(60));
        let token = store.create(false, vec![Flash::success("hi")]).await;

        assert!(!store.is_authenticated(&token).await);
        assert!(!store.is_authenticated("missing").await);
        assert_eq!(store.take_flashes(&token).await, vec![Flash::success("hi")]);
        assert!(store.take_flashes(&token).await.is_empty());
    }

    #[tokio::test]
    async fn admin_flag_toggles_authentication() {
        let store = SessionStore::new(Duration::from_secs(60));
        let token = store.create(true, Vec::new()).await;
        assert!(store.is_authenticated(&token).await);

        assert!(store.set_admin(&token, false).await);
        assert!(!store.is_authenticated(&token).await);
    }

    #[tokio::test]
    async fn expired_sessions_are_dropped() {
        let store = SessionStore::new(Duration::ZERO);
        let token = store.create(true, Vec::new()).await;

        assert!(!store.is_authenticated(&token).await);
        assert_eq!(store.len().await, 0);
        assert_eq!(
            store.push_flash(&token, Flash::error("late")).await,
            Err(Flash::error("late"))
        );
    }

    #[tokio::test]
    async fn drained_anonymous_sessions_are_released() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let anonymous = store.create(false, vec![Flash::error("nope")]).await;
        let admin = store.create(true, vec![Flash::success("hi")]).await;
        assert_eq!(store.len().await, 2);

        assert_eq!(store.take_flashes(&anonymous).await.len(), 1);
        assert_eq!(store.take_flashes(&admin).await.len(), 1);
        assert_eq!(store.len().await, 1);
        assert!(store.is_authenticated(&admin).await);
    }

    #[test]
    fn anonymous_ttl_is_capped() {
        let store = SessionStore::new(Duration::from_secs(24 * 3600));
        assert_eq!(store.ttl_for(true), Duration::from_secs(24 * 3600));
        assert_eq!(
            store.ttl_for(false),
            Duration::from_secs(ANONYMOUS_SESSION_TTL_SECS)
        );

        let short = SessionStore::new(Duration::from_secs(5));
        assert_eq!(short.ttl_for(false), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn prune_keeps_live_sessions() {
        let live = SessionStore::new(Duration::from_secs(60));
        live.create(false, Vec::new()).await;
        live.prune_expired().await;
        assert_eq!(live.len().await, 1);

        let stale = SessionStore::new(Duration::ZERO);
        stale.create(false, Vec::new()).await;
        stale.prune_expired().await;
        assert_eq!(stale.len().await, 0);
    }
}
