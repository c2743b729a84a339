//! JSON-file storage: a `papers.json` index next to a `files/` directory
//! of PDFs, plus a `config.json` for workspace settings.
//!
//! All index mutations go through one async mutex and land via a
//! temp-file rename, so a crash mid-write leaves the previous index
//! intact.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use papershelf_core::bridge::{StoredPaper, DATA_URI_PREFIX};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt index: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WorkspaceConfig {
    banner: Option<String>,
}

pub struct FileStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("files")).await?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("papers.json")
    }

    fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn file_path(&self, id: &str) -> PathBuf {
        self.root.join("files").join(format!("{id}.pdf"))
    }

    async fn read_index(&self) -> Result<Vec<StoredPaper>, StoreError> {
        match tokio::fs::read(self.index_path()).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<StoredPaper>, StoreError> {
        let _guard = self.lock.lock().await;
        self.read_index().await
    }

    /// Upsert keyed by id. A data-URI payload is decoded and written to
    /// `files/<id>.pdf`; a reference means "metadata only", leaving the
    /// stored PDF untouched. Returns the server-relative file path.
    pub async fn upsert(&self, mut paper: StoredPaper) -> Result<String, StoreError> {
        let _guard = self.lock.lock().await;

        let reference = if let Some(b64) = paper.content.strip_prefix(DATA_URI_PREFIX) {
            let bytes = BASE64.decode(b64)?;
            tokio::fs::write(self.file_path(&paper.id), bytes).await?;
            format!("files/{}.pdf", paper.id)
        } else {
            paper.content.clone()
        };
        paper.content = reference.clone();

        let mut index = self.read_index().await?;
        match index.iter_mut().find(|p| p.id == paper.id) {
            Some(existing) => *existing = paper,
            None => index.push(paper),
        }
        self.write_json(&self.index_path(), &index).await?;
        Ok(reference)
    }

    /// Remove a paper from the index and drop its PDF. Missing entries
    /// and missing files are not errors.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;

        let mut index = self.read_index().await?;
        let before = index.len();
        index.retain(|p| p.id != id);
        let removed = index.len() < before;
        if removed {
            self.write_json(&self.index_path(), &index).await?;
        }
        let _ = tokio::fs::remove_file(self.file_path(id)).await;
        Ok(removed)
    }

    pub async fn banner(&self) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path()).await {
            Ok(bytes) => {
                let config: WorkspaceConfig = serde_json::from_slice(&bytes)?;
                Ok(config.banner)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_banner(&self, banner: Option<String>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.write_json(&self.config_path(), &WorkspaceConfig { banner })
            .await
    }

    /// Round-trip a scratch file so "healthy" means "writable", not
    /// just "process is up".
    pub async fn probe_writable(&self) -> bool {
        let scratch = self.root.join(".healthcheck");
        if tokio::fs::write(&scratch, b"ok").await.is_err() {
            return false;
        }
        tokio::fs::remove_file(&scratch).await.is_ok()
    }
}
