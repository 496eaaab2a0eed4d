use crate::error::{Result, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A small named-document store: each document is one UTF-8 JSON file,
/// rewritten in full on every mutation.
///
/// Abstracting the files behind this trait keeps the evaluator independent
/// of the persistence medium; an embedded database could be substituted
/// without touching it.
pub trait DurableStore: Send + Sync {
    /// Read a document, `None` if it has never been written.
    fn read(&self, name: &str) -> Result<Option<String>>;

    /// Replace a document's contents.
    fn write(&self, name: &str, contents: &str) -> Result<()>;
}

/// Deserialize a stored document, `None` if absent.
pub fn load_document<T: DeserializeOwned>(
    store: &dyn DurableStore,
    name: &str,
) -> Result<Option<T>> {
    match store.read(name)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and persist a document in one full rewrite.
pub fn save_document<T: Serialize>(store: &dyn DurableStore, name: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string_pretty(value)?;
    store.write(name, &raw)
}

/// Directory-backed [`DurableStore`]. Writes go to a temp file first and are
/// renamed into place so a crash mid-write never truncates a document.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl DurableStore for FileStore {
    fn read(&self, name: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path(name)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn write(&self, name: &str, contents: &str) -> Result<()> {
        let target = self.path(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &target)?;
        tracing::debug!(file = %target.display(), bytes = contents.len(), "Persisted document");
        Ok(())
    }
}

/// In-memory [`DurableStore`] for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryStore {
    fn read(&self, name: &str) -> Result<Option<String>> {
        Ok(self.docs.lock().unwrap().get(name).cloned())
    }

    fn write(&self, name: &str, contents: &str) -> Result<()> {
        self.docs
            .lock()
            .unwrap()
            .insert(name.to_string(), contents.to_string());
        Ok(())
    }
}

/// Last-modified time of a file, if it exists.
pub fn mtime_of(path: &Path) -> Option<std::time::SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
