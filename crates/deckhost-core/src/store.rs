//! Durable key/value JSON persistence.
//!
//! Each key maps to one document under the store root: `registry` is
//! `registry.json`, `data/weather` is `data/weather.json`. Documents are
//! rewritten wholesale through a temp file and a rename, so a reader never
//! sees a half-written file. There is no transaction across keys.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// JSON document store rooted at a directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys are `/`-separated segments of `[A-Za-z0-9._-]`, none starting
    /// with a dot.
    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let segments: Vec<&str> = key.split('/').collect();
        let valid = segments.iter().all(|segment| {
            !segment.is_empty()
                && !segment.starts_with('.')
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        });
        let Some((file, dirs)) = segments.split_last().filter(|_| valid) else {
            return Err(StoreError::InvalidKey(key.to_string()));
        };

        let mut path = self.root.clone();
        path.extend(dirs);
        path.push(format!("{}.json", file));
        Ok(path)
    }

    /// Read and decode a document.
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let path = self.path_for(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => {
                return Err(StoreError::Io {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Parse {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Read a document, or `None` if it does not exist.
    pub async fn read_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.read(key).await {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read a document, falling back to `default()` on any failure.
    ///
    /// The fallback is written immediately so the document exists after the
    /// first access. A failed write is logged; the default is still returned.
    pub async fn read_or_init<T, F>(&self, key: &str, default: F) -> T
    where
        T: DeserializeOwned + Serialize,
        F: FnOnce() -> T,
    {
        match self.read(key).await {
            Ok(value) => value,
            Err(e) => {
                if !matches!(e, StoreError::NotFound(_)) {
                    tracing::warn!("Replacing store document '{}' with default: {}", key, e);
                }
                let value = default();
                if let Err(e) = self.write(key, &value).await {
                    tracing::error!("Failed to persist default for '{}': {}", key, e);
                }
                value
            }
        }
    }

    /// Encode and write a document atomically.
    pub async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let io_err = |e: std::io::Error| StoreError::Io {
            key: key.to_string(),
            message: e.to_string(),
        };

        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Parse {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }

        tracing::debug!("Wrote store document '{}'", key);
        Ok(())
    }

    /// Delete a document. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.path_for(key) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}
