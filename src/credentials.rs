//! Single-record administrator credential store.
//!
//! The record lives in one JSON file. Reads never fail the caller: a
//! missing or unreadable record is replaced by the seeded default. Writes
//! go through [`AtomicFile`] and are serialized by a mutex so concurrent
//! password changes cannot interleave.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::config::{DEFAULT_ADMIN_PASSWORD, DEFAULT_ADMIN_USER};

const LEGACY_DIGEST_HEX_LEN: usize = 64;

/// The persisted administrator record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminCredential {
    pub username: String,
    /// Argon2id PHC string, or a bare SHA-256 hex digest for records
    /// written before salted hashing.
    #[serde(rename = "password")]
    pub password_hash: String,
    #[serde(default)]
    pub must_change_password: bool,
}

impl AdminCredential {
    fn seeded() -> Self {
        let password_hash = hash_password(DEFAULT_ADMIN_PASSWORD).unwrap_or_else(|err| {
            warn!(error = %err, "argon2 hashing failed, seeding legacy digest");
            legacy_digest(DEFAULT_ADMIN_PASSWORD)
        });
        Self {
            username: DEFAULT_ADMIN_USER.to_string(),
            password_hash,
            must_change_password: true,
        }
    }

    fn is_well_formed(&self) -> bool {
        !self.username.is_empty() && !self.password_hash.is_empty()
    }

    /// Whether the stored hash is an unsalted SHA-256 digest.
    pub fn has_legacy_hash(&self) -> bool {
        is_legacy_digest(&self.password_hash)
    }
}

/// File-backed store for the administrator record.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    /// Store backed by the JSON file at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the record, seeding and persisting the default when it is
    /// missing or corrupt.
    pub async fn load(&self) -> AdminCredential {
        let _guard = self.write_lock.lock().await;
        match self.read_record().await {
            Ok(record) => return record,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no admin record, seeding default");
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "admin record unreadable, regenerating default");
            }
        }

        let record = run_blocking(AdminCredential::seeded).await;
        if let Err(err) = self.write_record(&record).await {
            warn!(path = %self.path.display(), error = %err, "failed to persist default admin record");
        }
        record
    }

    /// Checks `candidate` against the record's hash.
    pub async fn verify(&self, candidate: &str, record: &AdminCredential) -> bool {
        let candidate = candidate.to_string();
        let hash = record.password_hash.clone();
        run_blocking(move || verify_password(&candidate, &hash)).await
    }

    /// Replaces the password, persisting the whole record.
    pub async fn update(
        &self,
        new_password: &str,
        record: AdminCredential,
    ) -> io::Result<AdminCredential> {
        let updated = AdminCredential {
            password_hash: self.hash_blocking(new_password).await?,
            must_change_password: false,
            ..record
        };
        let _guard = self.write_lock.lock().await;
        self.write_record(&updated).await?;
        info!(username = %updated.username, "admin password updated");
        Ok(updated)
    }

    /// Re-hashes a legacy unsalted record with the already verified
    /// password. Legacy records predate the change flag, so it is set
    /// here when the password is still the default.
    pub async fn upgrade_legacy(
        &self,
        password: &str,
        record: AdminCredential,
    ) -> io::Result<AdminCredential> {
        let upgraded = AdminCredential {
            password_hash: self.hash_blocking(password).await?,
            must_change_password: record.must_change_password
                || is_default_password(password),
            ..record
        };
        let _guard = self.write_lock.lock().await;
        self.write_record(&upgraded).await?;
        info!(username = %upgraded.username, "legacy admin hash upgraded");
        Ok(upgraded)
    }

    async fn hash_blocking(&self, password: &str) -> io::Result<String> {
        let password = password.to_string();
        run_blocking(move || hash_password(&password))
            .await
            .map_err(|err| io::Error::other(err.to_string()))
    }

    async fn read_record(&self) -> io::Result<AdminCredential> {
        let bytes = fs::read(&self.path).await?;
        let record: AdminCredential = serde_json::from_slice(&bytes)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        if !record.is_well_formed() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "admin record has empty fields",
            ));
        }
        Ok(record)
    }

    async fn write_record(&self, record: &AdminCredential) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec(record).map_err(io::Error::other)?;
        let mut atomic = AtomicFile::new(&self.path).await?;
        if let Err(err) = atomic.write_all(&content).await {
            atomic.cleanup().await;
            return Err(err);
        }
        atomic.finalize().await?;
        Ok(())
    }
}

async fn run_blocking<T, F>(task: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(value) => value,
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}

/// Hashes with Argon2id and a random salt.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
}

/// Checks a password against an Argon2 PHC string or a legacy digest.
pub fn verify_password(candidate: &str, stored: &str) -> bool {
    if is_legacy_digest(stored) {
        let digest = legacy_digest(candidate);
        return constant_time_eq(
            digest.as_bytes(),
            stored.to_ascii_lowercase().as_bytes(),
        );
    }
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Whether `password` is the seeded default.
pub fn is_default_password(password: &str) -> bool {
    constant_time_eq(password.as_bytes(), DEFAULT_ADMIN_PASSWORD.as_bytes())
}

fn legacy_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn is_legacy_digest(stored: &str) -> bool {
    stored.len() == LEGACY_DIGEST_HEX_LEN && stored.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Equality whose running time depends only on the lengths.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
