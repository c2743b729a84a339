//! Workspace session: the facade that wires the store, queue, sync
//! coordinator, and health monitor together and exposes the operations
//! a frontend calls.

use std::sync::Arc;
use std::time::Duration;

use papershelf_llm::{
    AnalysisBackend, AnalysisError, AnalysisSettings, ComparisonResult,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeError, PersistenceBridge};
use crate::health::HealthMonitor;
use crate::queue::AnalysisQueue;
use crate::store::PaperStore;
use crate::sync::SyncCoordinator;
use crate::{unix_millis, Annotation, AnnotationKind, PaperRecord};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Analyses running at once.
    pub max_parallel: usize,
    /// Background health poll interval.
    pub health_interval: Duration,
    pub settings: AnalysisSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            health_interval: Duration::from_secs(30),
            settings: AnalysisSettings::Managed,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("storage backend is unreachable")]
    BackendUnavailable,
    #[error("unknown paper: {0}")]
    UnknownPaper(String),
    #[error("paper has no completed analysis: {0}")]
    PaperNotAnalyzed(String),
    #[error("comparison needs at least 2 analyzed papers, got {0}")]
    NotEnoughPapers(usize),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

pub struct Session {
    store: Arc<PaperStore>,
    queue: Arc<AnalysisQueue>,
    sync: Arc<SyncCoordinator>,
    health: Arc<HealthMonitor>,
    bridge: Arc<dyn PersistenceBridge>,
    backend: Arc<dyn AnalysisBackend>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        bridge: Arc<dyn PersistenceBridge>,
        backend: Arc<dyn AnalysisBackend>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let store = Arc::new(PaperStore::new());
        let health = Arc::new(HealthMonitor::new(Arc::clone(&bridge)));
        let sync = Arc::new(SyncCoordinator::new(
            Arc::clone(&bridge),
            Arc::clone(&store),
            Arc::clone(&health),
        ));
        let queue = AnalysisQueue::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&sync),
            config.settings,
            config.max_parallel,
        );
        let cancel = CancellationToken::new();
        health.spawn_poller(config.health_interval, cancel.clone());

        Arc::new(Self {
            store,
            queue,
            sync,
            health,
            bridge,
            backend,
            cancel,
        })
    }

    /// Hydrate the store from the backend. Papers come back as synced
    /// references; nothing is re-analyzed.
    pub async fn load_existing(&self) -> Result<usize, SessionError> {
        let stored = self.bridge.list_papers().await?;
        let count = stored.len();
        for paper in stored {
            self.store.insert_existing(paper.into_record());
        }
        tracing::info!(count, "loaded existing papers");
        Ok(count)
    }

    /// Upload a PDF: insert it, persist it, queue its analysis. Gated
    /// on backend health so a dead backend fails fast, before any
    /// bytes move.
    pub async fn upload(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<PaperRecord, SessionError> {
        if !self.health.ensure_healthy().await {
            return Err(SessionError::BackendUnavailable);
        }
        let record = self.store.insert(file_name, bytes);
        self.sync.schedule(record.clone());
        self.queue.enqueue(&record.id);
        Ok(record)
    }

    /// Queue an analysis for an existing paper. Idempotent while one is
    /// already queued or running.
    pub fn analyze(&self, id: &str) -> Result<(), SessionError> {
        if !self.store.contains(id) {
            return Err(SessionError::UnknownPaper(id.to_string()));
        }
        self.queue.enqueue(id);
        Ok(())
    }

    /// Retry after a failure. Same path as [`Session::analyze`]; the
    /// enqueue clears the previous error.
    pub fn retry(&self, id: &str) -> Result<(), SessionError> {
        self.analyze(id)
    }

    /// Remove a paper everywhere: store, queued analysis, queued sync,
    /// and (best-effort, off the caller's path) the backend.
    pub fn delete(&self, id: &str) -> Result<PaperRecord, SessionError> {
        let removed = self
            .store
            .remove(id)
            .ok_or_else(|| SessionError::UnknownPaper(id.to_string()))?;
        self.queue.purge(id);
        self.sync.discard(id);

        let bridge = Arc::clone(&self.bridge);
        let id = id.to_string();
        tokio::spawn(async move {
            bridge.delete_paper(&id).await;
        });
        Ok(removed)
    }

    pub fn papers(&self) -> Vec<PaperRecord> {
        self.store.snapshot()
    }

    pub fn paper(&self, id: &str) -> Option<PaperRecord> {
        self.store.get(id)
    }

    pub fn add_tag(&self, id: &str, tag: &str) -> Result<PaperRecord, SessionError> {
        let updated = self
            .store
            .add_tag(id, tag)
            .ok_or_else(|| SessionError::UnknownPaper(id.to_string()))?;
        self.sync.schedule(updated.clone());
        Ok(updated)
    }

    pub fn remove_tag(&self, id: &str, tag: &str) -> Result<PaperRecord, SessionError> {
        let updated = self
            .store
            .remove_tag(id, tag)
            .ok_or_else(|| SessionError::UnknownPaper(id.to_string()))?;
        self.sync.schedule(updated.clone());
        Ok(updated)
    }

    pub fn annotate(
        &self,
        id: &str,
        kind: AnnotationKind,
        payload: &str,
    ) -> Result<PaperRecord, SessionError> {
        let annotation = Annotation {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload: payload.to_string(),
            created_at: unix_millis(),
        };
        let updated = self
            .store
            .add_annotation(id, annotation)
            .ok_or_else(|| SessionError::UnknownPaper(id.to_string()))?;
        self.sync.schedule(updated.clone());
        Ok(updated)
    }

    pub fn remove_annotation(
        &self,
        id: &str,
        annotation_id: &str,
    ) -> Result<PaperRecord, SessionError> {
        let updated = self
            .store
            .remove_annotation(id, annotation_id)
            .ok_or_else(|| SessionError::UnknownPaper(id.to_string()))?;
        self.sync.schedule(updated.clone());
        Ok(updated)
    }

    /// Cross-paper comparison over already-completed analyses. Runs
    /// directly against the backend, outside the analysis queue's cap,
    /// since it reads summaries rather than PDFs.
    pub async fn compare(&self, ids: &[String]) -> Result<ComparisonResult, SessionError> {
        if ids.len() < 2 {
            return Err(SessionError::NotEnoughPapers(ids.len()));
        }
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            let record = self
                .store
                .get(id)
                .ok_or_else(|| SessionError::UnknownPaper(id.clone()))?;
            let summary = record
                .analysis
                .ok_or_else(|| SessionError::PaperNotAnalyzed(id.clone()))?;
            summaries.push(summary);
        }
        let settings = self.queue.settings();
        Ok(self.backend.compare(&summaries, &settings).await?)
    }

    pub fn set_settings(&self, settings: AnalysisSettings) {
        self.queue.set_settings(settings);
    }

    pub fn settings(&self) -> AnalysisSettings {
        self.queue.settings()
    }

    pub async fn banner(&self) -> Result<Option<String>, SessionError> {
        Ok(self.bridge.get_banner().await?)
    }

    pub async fn set_banner(&self, banner: &str) -> Result<(), SessionError> {
        Ok(self.bridge.set_banner(banner).await?)
    }

    pub fn is_backend_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// True while an analysis or save is still pending for this id.
    pub fn is_busy(&self, id: &str) -> bool {
        self.queue.is_active(id) || self.sync.is_busy(id)
    }

    /// Stop the health poller and the queue workers. In-flight saves
    /// finish on their own tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.queue.shutdown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
