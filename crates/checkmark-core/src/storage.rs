use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Asynchronous string key-value backend. Each key holds one opaque string.
pub trait KvStore: Send + Sync {
    /// Returns `Ok(None)` when nothing has been stored under `key`.
    fn get(&self, key: &str) -> impl Future<Output = anyhow::Result<Option<String>>> + Send;

    fn set(&self, key: &str, value: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Copies whatever `from` holds into `to`. Returns `false` when `from` is
    /// empty.
    fn copy(&self, from: &str, to: &str) -> impl Future<Output = anyhow::Result<bool>> + Send {
        async move {
            match self.get(from).await? {
                Some(raw) => {
                    self.set(to, &raw).await?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }
}

/// A slot holds bytes that are not UTF-8 text.
#[derive(Debug)]
pub struct NotText {
    pub key: String,
}

impl fmt::Display for NotText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage slot {} does not hold UTF-8 text", self.key)
    }
}

impl std::error::Error for NotText {}

/// Keys become file names, so they are limited to `[A-Za-z0-9._-]` and may
/// not start with a dot.
pub fn validate_key(key: &str) -> anyhow::Result<()> {
    if key.is_empty() {
        return Err(anyhow!("storage key cannot be empty"));
    }
    if key.starts_with('.') {
        return Err(anyhow!("storage key cannot start with '.': {key}"));
    }
    if let Some(bad) = key
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')))
    {
        return Err(anyhow!("storage key {key:?} contains invalid character {bad:?}"));
    }
    Ok(())
}

/// One JSON file per key inside a data directory.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    data_dir: PathBuf,
}

impl FileKvStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        info!(data_dir = %data_dir.display(), "opened file storage");
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn slot_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        validate_key(key)?;
        Ok(self.data_dir.join(format!("{key}.json")))
    }
}

impl KvStore for FileKvStore {
    #[tracing::instrument(skip(self))]
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.slot_path(key)?;
        debug!(file = %path.display(), "reading slot");

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", path.display()));
            }
        };

        match String::from_utf8(bytes) {
            Ok(raw) => Ok(Some(raw)),
            Err(_) => Err(NotText {
                key: key.to_string(),
            }
            .into()),
        }
    }

    #[tracing::instrument(skip(self, value), fields(bytes = value.len()))]
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let path = self.slot_path(key)?;
        let payload = value.to_string();

        tokio::task::spawn_blocking(move || write_atomic(&path, &payload))
            .await
            .context("storage writer task did not complete")??;
        Ok(())
    }

    /// Copies the raw file, so slots that are not valid text survive intact.
    #[tracing::instrument(skip(self))]
    async fn copy(&self, from: &str, to: &str) -> anyhow::Result<bool> {
        let source = self.slot_path(from)?;
        let target = self.slot_path(to)?;

        match tokio::fs::copy(&source, &target).await {
            Ok(bytes) => {
                debug!(bytes, file = %target.display(), "copied slot");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| {
                format!("failed copying {} to {}", source.display(), target.display())
            }),
        }
    }
}

#[tracing::instrument(skip(path, payload))]
fn write_atomic(path: &Path, payload: &str) -> anyhow::Result<()> {
    debug!(file = %path.display(), bytes = payload.len(), "saving slot atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(payload.as_bytes())?;
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}

/// Shared in-memory backend. Clones see the same slots.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    slots: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }
}

impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        validate_key(key)?;
        Ok(self.slots.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        validate_key(key)?;
        self.slots
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{FileKvStore, KvStore, MemoryKvStore, NotText, validate_key};

    #[test]
    fn keys_are_restricted_to_file_safe_names() {
        assert!(validate_key("todos").is_ok());
        assert!(validate_key("todos.malformed").is_ok());
        assert!(validate_key("theme_v-2").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(".hidden").is_err());
        assert!(validate_key("../escape").is_err());
        assert!(validate_key("a b").is_err());
    }

    #[tokio::test]
    async fn file_store_reads_back_and_reports_missing_slots() {
        let temp = tempdir().expect("tempdir");
        let store = FileKvStore::open(&temp.path().join("nested")).expect("open store");

        assert_eq!(store.get("todos").await.expect("get missing"), None);

        store.set("todos", "[]").await.expect("first write");
        store.set("todos", "[1]").await.expect("overwrite");
        assert_eq!(
            store.get("todos").await.expect("get"),
            Some("[1]".to_string())
        );
        assert!(store.data_dir().join("todos.json").exists());
        assert!(store.set("../x", "1").await.is_err());
    }

    #[tokio::test]
    async fn memory_store_clones_share_slots() {
        let store = MemoryKvStore::new();
        let other = store.clone();
        store.set("theme", "dark").await.expect("set");

        assert_eq!(other.get("theme").await.expect("get"), Some("dark".to_string()));
        assert_eq!(other.len().await, 1);
    }

    #[tokio::test]
    async fn file_store_flags_binary_slots_and_copies_them_raw() {
        let temp = tempdir().expect("tempdir");
        let store = FileKvStore::open(temp.path()).expect("open store");
        let raw = b"[{\"id\":\"1\",\"title\":\"caf\xE9\"}]";
        std::fs::write(temp.path().join("todos.json"), raw).expect("seed");

        let err = store.get("todos").await.expect_err("not text");
        assert!(err.downcast_ref::<NotText>().is_some());

        assert!(store.copy("todos", "todos.malformed").await.expect("copy"));
        let copied = std::fs::read(temp.path().join("todos.malformed.json")).expect("read copy");
        assert_eq!(copied, raw.to_vec());
        assert!(!store.copy("absent", "absent.malformed").await.expect("copy"));
    }

    #[tokio::test]
    async fn memory_store_copies_slots() {
        let store = MemoryKvStore::new();
        store.set("todos", "{bad").await.expect("set");

        assert!(store.copy("todos", "todos.malformed").await.expect("copy"));
        assert_eq!(
            store.get("todos.malformed").await.expect("get"),
            Some("{bad".to_string())
        );
        assert!(!store.copy("missing", "missing.malformed").await.expect("copy"));
    }
}
