//! Staging storage for document sources.
//!
//! A staged file lives under the configured directory until its TTL elapses
//! or the component that staged it deletes it. Deletion refuses any path
//! outside the staging directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use thiserror::Error;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

#[derive(Envconfig, Clone)]
pub struct StorageConfig {
    #[envconfig(from = "STORAGE_TEMP_DIR", default = "/tmp/job-staging")]
    pub temp_dir: String,

    /// Largest file the staging layer will accept, in bytes.
    #[envconfig(from = "STORAGE_MAX_SIZE", default = "10485760")]
    pub max_size: usize,

    /// How long staged files and cached payloads/results live, in seconds.
    #[envconfig(from = "STORAGE_TTL", default = "3600")]
    pub ttl_seconds: u64,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to create staging directory {path}: {error}")]
    CreateDir { path: String, error: std::io::Error },
    #[error("failed to download {url}: {error}")]
    Download { url: String, error: reqwest::Error },
    #[error("file exceeds the configured maximum staging size")]
    TooLarge,
    #[error("failed to write staged file {path}: {error}")]
    Write { path: String, error: std::io::Error },
    #[error("refusing to delete {0}: not inside the staging directory")]
    OutsideStagingDir(String),
    #[error("failed to delete staged file {path}: {error}")]
    Delete { path: String, error: std::io::Error },
}

pub struct Storage {
    dir: PathBuf,
    max_size: usize,
    ttl: Duration,
    client: reqwest::Client,
}

impl Storage {
    /// Open the staging directory, creating it if missing.
    pub async fn new(dir: &Path, max_size: usize, ttl: Duration) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|error| StorageError::CreateDir {
                path: dir.display().to_string(),
                error,
            })?;
        let dir = fs::canonicalize(dir)
            .await
            .map_err(|error| StorageError::CreateDir {
                path: dir.display().to_string(),
                error,
            })?;

        Ok(Self {
            dir,
            max_size,
            ttl,
            client: reqwest::Client::new(),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Download a source into the staging directory. Fails on non-2xx
    /// status, network errors, or an oversized body.
    pub async fn store_from_url(&self, url: &str) -> Result<PathBuf, StorageError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|error| StorageError::Download {
                url: url.to_owned(),
                error,
            })?;

        let body = response
            .bytes()
            .await
            .map_err(|error| StorageError::Download {
                url: url.to_owned(),
                error,
            })?;

        self.store_from_bytes(&body).await
    }

    /// Write raw bytes into the staging directory under a fresh name.
    pub async fn store_from_bytes(&self, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        if bytes.len() > self.max_size {
            return Err(StorageError::TooLarge);
        }

        let path = self.dir.join(format!("{}.pdf", Uuid::now_v7()));
        fs::write(&path, bytes)
            .await
            .map_err(|error| StorageError::Write {
                path: path.display().to_string(),
                error,
            })?;

        Ok(path)
    }

    /// Remove a previously staged file. Idempotent; refuses paths outside
    /// the staging directory.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        if !self.is_confined(path) {
            return Err(StorageError::OutsideStagingDir(
                path.display().to_string(),
            ));
        }

        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StorageError::Delete {
                path: path.display().to_string(),
                error,
            }),
        }
    }

    fn is_confined(&self, path: &Path) -> bool {
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return false;
        }
        path.starts_with(&self.dir)
    }

    /// Best-effort removal of a staged file once the staging TTL elapses.
    pub fn schedule_cleanup(self: &Arc<Self>, path: PathBuf) {
        let storage = Arc::clone(self);
        _ = tokio::spawn(async move {
            tokio::time::sleep(storage.ttl).await;
            if let Err(err) = storage.delete(&path).await {
                warn!("staged file cleanup failed: {}", err);
            }
        });
    }
}
