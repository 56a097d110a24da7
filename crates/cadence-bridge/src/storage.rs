//! Per-resolver key/value storage.
//!
//! Each resolver owns one namespace directory under the storage root. Every
//! key is a file in that directory and the file content is the raw value,
//! with no metadata or encoding wrapper. Writes replace the whole file
//! atomically, so concurrent readers see either the old or the new value.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::BridgeError;

/// Maximum key length in bytes (common filesystem name limit).
const MAX_KEY_LEN: usize = 255;

/// Prefix of in-flight temporary files; hidden from listings.
const TEMP_PREFIX: &str = ".tmp-";

/// Validate that a key can be used as a file name inside the namespace.
///
/// Rejects empty keys, path separators, NUL, and leading dots (which also
/// rules out `.` and `..`).
pub fn validate_key(key: &str) -> Result<(), BridgeError> {
    if key.is_empty() {
        return Err(BridgeError::InvalidKey("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(BridgeError::InvalidKey(format!(
            "key must be at most {MAX_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    if key.starts_with('.') {
        return Err(BridgeError::InvalidKey(format!(
            "key must not start with '.': '{key}'"
        )));
    }
    if key.contains(['/', '\\', '\0']) {
        return Err(BridgeError::InvalidKey(format!(
            "key contains a path separator or NUL: '{key}'"
        )));
    }
    Ok(())
}

/// File-backed string store scoped to one resolver instance.
#[derive(Debug, Clone)]
pub struct KeyValueStore {
    dir: PathBuf,
}

impl KeyValueStore {
    /// Open the namespace `root/namespace`. The directory is created lazily
    /// on the first write.
    pub fn open(root: &Path, namespace: &str) -> Result<Self, BridgeError> {
        validate_key(namespace)?;
        Ok(Self {
            dir: root.join(namespace),
        })
    }

    /// The namespace directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BridgeError> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }

    /// Store `value` under `key`, fully replacing any prior content.
    pub fn set(&self, key: &str, value: &str) -> Result<(), BridgeError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)?;
        tmp.write_all(value.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| BridgeError::Io(e.error))?;
        Ok(())
    }

    /// Read the value stored under `key`. `Ok(None)` if it does not exist.
    pub fn get(&self, key: &str) -> Result<Option<String>, BridgeError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete `key`. Removing a missing key succeeds.
    pub fn remove(&self, key: &str) -> Result<(), BridgeError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List every key in the namespace. Empty if the namespace was never
    /// written to.
    pub fn list_keys(&self) -> Result<Vec<String>, BridgeError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Non UTF-8 names can't have been written through this store
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }

    /// Values for [`list_keys`](Self::list_keys), positionally aligned.
    ///
    /// A key that disappears or can't be read between listing and reading
    /// yields `None` in its slot instead of failing the whole call.
    pub fn list_values(&self) -> Result<Vec<Option<String>>, BridgeError> {
        let keys = self.list_keys()?;
        Ok(keys
            .iter()
            .map(|key| match self.get(key) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        namespace = %self.dir.display(),
                        key = %key,
                        "failed to read value while listing: {e}"
                    );
                    None
                }
            })
            .collect())
    }
}
