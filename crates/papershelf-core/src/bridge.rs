//! Persistence bridge: the client side of the thin papers backend.
//!
//! Failures here are recoverable by design. Saves are idempotent upserts
//! keyed by id; deletes are best-effort and never surface an error to
//! the caller.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use papershelf_llm::PaperContent;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AnalysisStatus, Annotation, PaperRecord, SyncStatus};

pub const DATA_URI_PREFIX: &str = "data:application/pdf;base64,";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("could not decode backend response: {0}")]
    Decode(String),
    #[error("backend could not persist the paper: {0}")]
    StorageWriteFailed(String),
}

/// Wire shape of one paper as the backend stores it. `content` is either
/// a base64 data URI (fresh upload) or a server-relative file reference,
/// which tells the server "no file change".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPaper {
    pub id: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub uploaded_at: u64,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<papershelf_llm::AnalysisSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl StoredPaper {
    /// Encode a record for the wire, base64-encoding raw bytes.
    pub fn from_record(record: &PaperRecord) -> Self {
        let content = match &record.content {
            PaperContent::Bytes(bytes) => format!("{DATA_URI_PREFIX}{}", BASE64.encode(bytes)),
            PaperContent::Reference(r) => r.clone(),
        };
        Self {
            id: record.id.clone(),
            file_name: record.file_name.clone(),
            file_size_bytes: record.file_size_bytes,
            uploaded_at: record.uploaded_at,
            content,
            analysis: record.analysis.clone(),
            error_message: record.error_message.clone(),
            tags: record.tags.clone(),
            annotations: record.annotations.clone(),
        }
    }

    /// Rebuild a client record from stored state. Content listed by the
    /// backend is always a reference; analysis presence decides the
    /// status, and the record counts as already synced.
    pub fn into_record(self) -> PaperRecord {
        let analysis_status = if self.analysis.is_some() {
            AnalysisStatus::Succeeded
        } else if self.error_message.is_some() {
            AnalysisStatus::Failed
        } else {
            AnalysisStatus::Idle
        };
        PaperRecord {
            id: self.id,
            content: PaperContent::Reference(self.content),
            file_name: self.file_name,
            file_size_bytes: self.file_size_bytes,
            uploaded_at: self.uploaded_at,
            analysis_status,
            sync_status: SyncStatus::Saved,
            analysis: self.analysis,
            error_message: self.error_message,
            tags: self.tags,
            annotations: self.annotations,
            write_seq: 0,
        }
    }
}

/// Outcome of a successful save.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaveOutcome {
    /// Server-relative path of the stored PDF, used to swap raw bytes
    /// for a reference after the first upload.
    pub file_path: Option<String>,
}

/// The backend the sync coordinator talks to.
#[async_trait::async_trait]
pub trait PersistenceBridge: Send + Sync {
    async fn list_papers(&self) -> Result<Vec<StoredPaper>, BridgeError>;

    /// Idempotent upsert keyed by id.
    async fn save_paper(&self, paper: &StoredPaper) -> Result<SaveOutcome, BridgeError>;

    /// Best-effort removal; logs and swallows failures.
    async fn delete_paper(&self, id: &str);

    /// Fast reachability probe; any failure counts as unhealthy.
    async fn get_health(&self) -> bool;

    async fn get_banner(&self) -> Result<Option<String>, BridgeError>;

    async fn set_banner(&self, banner: &str) -> Result<(), BridgeError>;
}

// ── HTTP implementation ─────────────────────────────────────────────────

pub struct HttpBridge {
    client: reqwest::Client,
    base_url: String,
    health_timeout: Duration,
}

impl HttpBridge {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, health_timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BridgeError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BridgeError::Status {
            code: status.as_u16(),
            body,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SaveResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BannerBody {
    banner: Option<String>,
}

#[async_trait::async_trait]
impl PersistenceBridge for HttpBridge {
    async fn list_papers(&self) -> Result<Vec<StoredPaper>, BridgeError> {
        let resp = self.client.get(self.url("papers")).send().await?;
        let resp = Self::check_status(resp).await?;
        resp.json().await.map_err(|e| BridgeError::Decode(e.to_string()))
    }

    async fn save_paper(&self, paper: &StoredPaper) -> Result<SaveOutcome, BridgeError> {
        let resp = self
            .client
            .post(self.url("papers"))
            .json(paper)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        let body: SaveResponse = resp
            .json()
            .await
            .map_err(|e| BridgeError::Decode(e.to_string()))?;
        if !body.success {
            return Err(BridgeError::StorageWriteFailed(
                body.error.unwrap_or_else(|| "save rejected".into()),
            ));
        }
        Ok(SaveOutcome {
            file_path: body.file.or_else(|| Some(format!("files/{}.pdf", paper.id))),
        })
    }

    async fn delete_paper(&self, id: &str) {
        let result = self
            .client
            .delete(self.url(&format!("papers/{id}")))
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(id, status = %resp.status(), "remote delete failed");
            }
            Err(e) => tracing::warn!(id, error = %e, "remote delete failed"),
            Ok(_) => {}
        }
    }

    async fn get_health(&self) -> bool {
        let probe = self
            .client
            .get(self.url("health"))
            .timeout(self.health_timeout)
            .send();
        match probe.await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn get_banner(&self) -> Result<Option<String>, BridgeError> {
        let resp = self.client.get(self.url("config/banner")).send().await?;
        let resp = Self::check_status(resp).await?;
        let body: BannerBody = resp
            .json()
            .await
            .map_err(|e| BridgeError::Decode(e.to_string()))?;
        Ok(body.banner)
    }

    async fn set_banner(&self, banner: &str) -> Result<(), BridgeError> {
        let resp = self
            .client
            .post(self.url("config/banner"))
            .json(&BannerBody {
                banner: Some(banner.to_string()),
            })
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }
}

// ── Mock implementation for tests ───────────────────────────────────────

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Scriptable in-memory bridge. Records every save so tests can assert
/// serialization, coalescing, and last-write-wins without a backend.
pub struct MockBridge {
    seeded: Mutex<Vec<StoredPaper>>,
    saved: Mutex<Vec<StoredPaper>>,
    deleted: Mutex<Vec<String>>,
    healthy: AtomicBool,
    fail_saves: AtomicBool,
    save_delay: Mutex<Duration>,
    health_probes: AtomicUsize,
    active_saves: dashmap::DashMap<String, usize>,
    max_active_saves: dashmap::DashMap<String, usize>,
}

impl Default for MockBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBridge {
    pub fn new() -> Self {
        Self {
            seeded: Mutex::new(Vec::new()),
            saved: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            fail_saves: AtomicBool::new(false),
            save_delay: Mutex::new(Duration::ZERO),
            health_probes: AtomicUsize::new(0),
            active_saves: dashmap::DashMap::new(),
            max_active_saves: dashmap::DashMap::new(),
        }
    }

    pub fn seed(&self, papers: Vec<StoredPaper>) {
        *self.seeded.lock().unwrap() = papers;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock().unwrap() = delay;
    }

    /// All saves in arrival order.
    pub fn saved(&self) -> Vec<StoredPaper> {
        self.saved.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saved.lock().unwrap().len()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn health_probe_count(&self) -> usize {
        self.health_probes.load(Ordering::SeqCst)
    }

    /// Highest number of save calls that were in flight at once for one id.
    pub fn max_concurrent_saves(&self, id: &str) -> usize {
        self.max_active_saves.get(id).map(|v| *v).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl PersistenceBridge for MockBridge {
    async fn list_papers(&self) -> Result<Vec<StoredPaper>, BridgeError> {
        Ok(self.seeded.lock().unwrap().clone())
    }

    async fn save_paper(&self, paper: &StoredPaper) -> Result<SaveOutcome, BridgeError> {
        {
            let mut active = self.active_saves.entry(paper.id.clone()).or_insert(0);
            *active += 1;
            let mut max = self.max_active_saves.entry(paper.id.clone()).or_insert(0);
            if *active > *max {
                *max = *active;
            }
        }

        let delay = *self.save_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        if let Some(mut active) = self.active_saves.get_mut(&paper.id) {
            *active -= 1;
        }

        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(BridgeError::Status {
                code: 500,
                body: "scripted failure".into(),
            });
        }
        // an unreachable backend fails writes too, like the real one
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(BridgeError::Status {
                code: 503,
                body: "unavailable".into(),
            });
        }

        self.saved.lock().unwrap().push(paper.clone());
        Ok(SaveOutcome {
            file_path: Some(format!("files/{}.pdf", paper.id)),
        })
    }

    async fn delete_paper(&self, id: &str) {
        self.deleted.lock().unwrap().push(id.to_string());
    }

    async fn get_health(&self) -> bool {
        self.health_probes.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }

    async fn get_banner(&self) -> Result<Option<String>, BridgeError> {
        Ok(None)
    }

    async fn set_banner(&self, _banner: &str) -> Result<(), BridgeError> {
        Ok(())
    }
}
