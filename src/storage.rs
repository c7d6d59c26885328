use chrono::NaiveDateTime;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::ErrorKind;

use crate::atomic::AtomicFile;
use crate::config::ALLOWED_EXTENSIONS;

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_NAME_ATTEMPTS: u32 = 1000;
const FALLBACK_STEM: &str = "upload";
/// Room for the stamp, a counter and the temp-file affixes under the
/// 255 byte file name limit.
const MAX_SANITIZED_LEN: usize = 180;
const WINDOWS_DEVICE_NAMES: &[&str] = &[
    "CON", "AUX", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3", "PRN", "NUL",
];

/// Flat directory of uploaded objects.
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Storage rooted at `root`; nothing is touched on disk yet.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Creates the upload directory if needed.
    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Maps a stored name to its path. Only a single plain, non-hidden
    /// component is accepted and symlinks are refused.
    pub async fn resolve_file(&self, name: &str) -> Result<PathBuf, StorageError> {
        if !is_plain_name(name) {
            return Err(StorageError::InvalidName);
        }
        let target = self.root.join(name);
        let metadata = fs::symlink_metadata(&target).await?;
        if metadata.file_type().is_symlink() || !metadata.is_file() {
            return Err(StorageError::InvalidName);
        }
        Ok(target)
    }

    /// Regular files in the upload directory, sorted by name.
    pub async fn list_files(&self) -> Result<Vec<FileEntry>, StorageError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let metadata = entry.metadata().await?;
            entries.push(FileEntry {
                name,
                size: metadata.len(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Removes a stored file. Returns `false` when there was nothing to remove.
    pub async fn delete_file(&self, name: &str) -> Result<bool, StorageError> {
        let target = match self.resolve_file(name).await {
            Ok(target) => target,
            Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        match fs::remove_file(target).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Reserves a name for an uploaded file and opens a temp file for its
    /// contents. `None` when the extension is not accepted.
    pub async fn begin_upload(
        &self,
        now: NaiveDateTime,
        original_name: &str,
    ) -> Result<Option<PendingUpload>, StorageError> {
        let Some(preferred) = upload_name(now, original_name) else {
            return Ok(None);
        };
        let (name, path) = self.reserve(&preferred).await?;
        match AtomicFile::new(&path).await {
            Ok(file) => Ok(Some(PendingUpload { name, path, file })),
            Err(err) => {
                let _ = fs::remove_file(&path).await;
                Err(err.into())
            }
        }
    }

    /// Stores pasted text as `text_<stamp>.txt`.
    pub async fn store_text(
        &self,
        now: NaiveDateTime,
        text: &str,
    ) -> Result<StoredFile, StorageError> {
        let (name, path) = self.reserve(&text_name(now)).await?;
        let mut pending = match AtomicFile::new(&path).await {
            Ok(file) => PendingUpload { name, path, file },
            Err(err) => {
                let _ = fs::remove_file(&path).await;
                return Err(err.into());
            }
        };
        if let Err(err) = pending.write(text.as_bytes()).await {
            pending.abort().await;
            return Err(err);
        }
        pending.commit().await
    }

    /// Claims the first free variant of `preferred` with create-new
    /// semantics, so two writers never end up with the same name.
    async fn reserve(&self, preferred: &str) -> Result<(String, PathBuf), StorageError> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = if attempt == 0 {
                preferred.to_string()
            } else {
                with_counter(preferred, attempt)
            };
            let path = self.root.join(&candidate);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok((candidate, path)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StorageError::Io(io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free name for {preferred}"),
        )))
    }
}

/// An upload whose name is reserved and whose bytes are still arriving.
pub struct PendingUpload {
    name: String,
    path: PathBuf,
    file: AtomicFile,
}

impl PendingUpload {
    /// Appends a chunk of the upload.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        self.file.write_all(chunk).await.map_err(StorageError::Io)
    }

    /// Moves the data into place under the reserved name.
    pub async fn commit(self) -> Result<StoredFile, StorageError> {
        match self.file.finalize().await {
            Ok(size) => Ok(StoredFile {
                name: self.name,
                size,
            }),
            Err(err) => {
                let _ = fs::remove_file(&self.path).await;
                Err(err.into())
            }
        }
    }

    /// Discards the data and releases the reserved name.
    pub async fn abort(self) {
        self.file.cleanup().await;
        let _ = fs::remove_file(&self.path).await;
    }
}

/// Name and size of a committed upload.
#[derive(Debug, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
}

/// Whether the extension is on the upload whitelist.
pub fn is_allowed_file(name: &str) -> bool {
    extension_of(name)
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn extension_of(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(_, ext)| ext)
}

/// `<stamp>_<sanitized>` for an accepted upload name.
pub fn upload_name(now: NaiveDateTime, original_name: &str) -> Option<String> {
    if !is_allowed_file(original_name) {
        return None;
    }
    let mut sanitized = sanitize_filename(original_name);
    if !is_allowed_file(&sanitized) {
        let ext = extension_of(original_name)
            .unwrap_or_default()
            .to_ascii_lowercase();
        sanitized = format!("{FALLBACK_STEM}.{ext}");
    }
    let sanitized = truncate_name(&sanitized, MAX_SANITIZED_LEN);
    Some(format!("{}_{sanitized}", now.format(STAMP_FORMAT)))
}

/// Shortens the stem of an ASCII name to fit `max` bytes, keeping the
/// extension.
fn truncate_name(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if ext.len() < max => {
            let keep = (max - ext.len() - 1).min(stem.len());
            format!("{}.{ext}", &stem[..keep])
        }
        _ => name[..max].to_string(),
    }
}

/// Name for pasted text stored at `now`.
pub fn text_name(now: NaiveDateTime) -> String {
    format!("text_{}.txt", now.format(STAMP_FORMAT))
}

/// Inserts `-<n>` before the extension.
fn with_counter(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{n}.{ext}"),
        _ => format!("{name}-{n}"),
    }
}

/// Reduces a client supplied file name to a safe ASCII name.
pub fn sanitize_filename(name: &str) -> String {
    let spaced: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let filtered: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = filtered.trim_matches(|c| c == '.' || c == '_').to_string();

    let stem = trimmed.split('.').next().unwrap_or_default();
    if WINDOWS_DEVICE_NAMES
        .iter()
        .any(|device| device.eq_ignore_ascii_case(stem))
    {
        return format!("_{trimmed}");
    }
    trimmed
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && Path::new(name).file_name().map(|n| n == name).unwrap_or(false)
}

/// Failures of storage operations.
#[derive(Debug)]
pub enum StorageError {
    InvalidName,
    Io(io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::InvalidName => write!(f, "invalid file name"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

/// One row of the dashboard listing.
#[derive(Debug)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .expect("valid time")
    }

    fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("uploads");
        std::fs::create_dir_all(&root).expect("create root");
        (temp, Storage::new(root))
    }

    async fn upload(storage: &Storage, now: NaiveDateTime, name: &str, data: &[u8]) -> StoredFile {
        let mut pending = storage
            .begin_upload(now, name)
            .await
            .expect("begin")
            .expect("accepted");
        pending.write(data).await.expect("write");
        pending.commit().await.expect("commit")
    }

    #[test]
    fn whitelist_is_case_insensitive() {
        assert!(is_allowed_file("notes.TXT"));
        assert!(is_allowed_file("photo.JpEg"));
        assert!(is_allowed_file("archive.tar.zip"));
        assert!(!is_allowed_file("setup.exe"));
        assert!(!is_allowed_file("txt"));
        assert!(!is_allowed_file("report.pdf.exe"));
    }

    #[test]
    fn sanitize_matches_expected_shapes() {
        assert_eq!(sanitize_filename("My cool movie.mov"), "My_cool_movie.mov");
        assert_eq!(sanitize_filename("../../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("i contain cool \u{fc}ml\u{e4}uts.txt"), "i_contain_cool_mluts.txt");
        assert_eq!(sanitize_filename("__.hidden.txt"), "hidden.txt");
        assert_eq!(sanitize_filename("con.txt"), "_con.txt");
        assert_eq!(sanitize_filename("\u{444}\u{430}\u{439}\u{43b}"), "");
    }

    #[test]
    fn upload_names_carry_timestamp() {
        let now = at(14, 5, 9);
        assert_eq!(
            upload_name(now, "a b.txt").as_deref(),
            Some("20240309_140509_a_b.txt")
        );
        assert_eq!(upload_name(now, "virus.exe"), None);
        assert_eq!(
            upload_name(now, "\u{444}\u{430}\u{439}\u{43b}.PDF").as_deref(),
            Some("20240309_140509_upload.pdf")
        );
        assert_eq!(text_name(now), "text_20240309_140509.txt");
    }

    #[test]
    fn long_names_keep_their_extension() {
        let long = format!("{}.txt", "a".repeat(300));
        let name = upload_name(at(9, 0, 0), &long).expect("accepted");
        assert!(name.ends_with("aaa.txt"));
        assert_eq!(name.len(), "20240309_090000_".len() + MAX_SANITIZED_LEN);

        assert_eq!(truncate_name("short.pdf", 20), "short.pdf");
        assert_eq!(truncate_name("abcdefgh.pdf", 8), "abcd.pdf");
    }

    #[tokio::test]
    async fn long_upload_name_is_stored() {
        let (_temp, storage) = make_storage();
        let long = format!("{}.txt", "b".repeat(300));
        let now = at(9, 0, 0);
        let first = upload(&storage, now, &long, b"one").await;
        let second = upload(&storage, now, &long, b"two").await;

        assert!(first.name.ends_with(".txt"));
        assert!(second.name.ends_with("-1.txt"));
        assert_eq!(storage.list_files().await.expect("list").len(), 2);
    }

    #[test]
    fn counter_goes_before_extension() {
        assert_eq!(with_counter("a.txt", 1), "a-1.txt");
        assert_eq!(with_counter("archive.tar.zip", 2), "archive.tar-2.zip");
        assert_eq!(with_counter("plain", 3), "plain-3");
    }

    #[tokio::test]
    async fn upload_writes_exact_bytes() {
        let (_temp, storage) = make_storage();
        let stored = upload(&storage, at(9, 0, 0), "a.txt", b"hello world").await;

        assert_eq!(stored.name, "20240309_090000_a.txt");
        assert_eq!(stored.size, 11);
        let files = storage.list_files().await.expect("list");
        assert_eq!(
            files.iter().map(|f| (f.name.as_str(), f.size)).collect::<Vec<_>>(),
            vec![("20240309_090000_a.txt", 11)]
        );
    }

    #[tokio::test]
    async fn disallowed_extension_writes_nothing() {
        let (_temp, storage) = make_storage();
        let pending = storage
            .begin_upload(at(9, 0, 0), "tool.exe")
            .await
            .expect("begin");
        assert!(pending.is_none());
        assert!(storage.list_files().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn uploads_a_second_apart_get_distinct_names() {
        let (_temp, storage) = make_storage();
        let first = upload(&storage, at(9, 0, 0), "a.txt", b"one").await;
        let second = upload(&storage, at(9, 0, 1), "a.txt", b"two").await;

        assert_eq!(first.name, "20240309_090000_a.txt");
        assert_eq!(second.name, "20240309_090001_a.txt");
        assert_eq!(storage.list_files().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn same_second_uploads_do_not_overwrite() {
        let (_temp, storage) = make_storage();
        let now = at(9, 0, 0);
        let first = upload(&storage, now, "a.txt", b"first").await;
        let second = upload(&storage, now, "a.txt", b"second!").await;

        assert_eq!(first.name, "20240309_090000_a.txt");
        assert_eq!(second.name, "20240309_090000_a-1.txt");
        let root = storage.root_path();
        assert_eq!(std::fs::read(root.join(&first.name)).expect("read"), b"first");
        assert_eq!(std::fs::read(root.join(&second.name)).expect("read"), b"second!");
    }

    #[tokio::test]
    async fn same_second_text_gets_counter() {
        let (_temp, storage) = make_storage();
        let now = at(12, 30, 0);
        let first = storage.store_text(now, "alpha").await.expect("store");
        let second = storage.store_text(now, "beta").await.expect("store");

        assert_eq!(first.name, "text_20240309_123000.txt");
        assert_eq!(second.name, "text_20240309_123000-1.txt");
        assert_eq!(second.size, 4);
    }

    #[tokio::test]
    async fn aborted_upload_releases_name() {
        let (_temp, storage) = make_storage();
        let mut pending = storage
            .begin_upload(at(9, 0, 0), "a.txt")
            .await
            .expect("begin")
            .expect("accepted");
        pending.write(b"partial").await.expect("write");
        pending.abort().await;

        let leftovers = std::fs::read_dir(storage.root_path()).expect("read dir").count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn listing_skips_hidden_and_directories() {
        let (_temp, storage) = make_storage();
        let root = storage.root_path();
        std::fs::write(root.join("b.txt"), b"bb").expect("write");
        std::fs::write(root.join("a.txt"), b"a").expect("write");
        std::fs::write(root.join(".a.txt.tmp.1"), b"tmp").expect("write");
        std::fs::create_dir(root.join("nested")).expect("mkdir");

        let names: Vec<_> = storage
            .list_files()
            .await
            .expect("list")
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn missing_root_lists_empty() {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::new(temp.path().join("absent"));
        assert!(storage.list_files().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn resolve_rejects_traversal_and_hidden() {
        let (_temp, storage) = make_storage();
        for name in ["../secret", "a/b.txt", ".hidden", "", "..", "a\\b"] {
            assert!(
                matches!(storage.resolve_file(name).await, Err(StorageError::InvalidName)),
                "{name} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn delete_reports_missing() {
        let (_temp, storage) = make_storage();
        std::fs::write(storage.root_path().join("x.txt"), b"x").expect("write");

        assert!(storage.delete_file("x.txt").await.expect("delete"));
        assert!(!storage.delete_file("x.txt").await.expect("delete again"));
        assert!(matches!(
            storage.delete_file("../x.txt").await,
            Err(StorageError::InvalidName)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let (temp, storage) = make_storage();
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        symlink(&outside, storage.root_path().join("link.txt")).expect("symlink");

        let result = storage.resolve_file("link.txt").await;
        assert!(matches!(result, Err(StorageError::InvalidName)));
    }
}
