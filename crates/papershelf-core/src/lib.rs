use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod bridge;
pub mod health;
pub mod queue;
pub mod session;
pub mod store;
pub mod sync;

// Re-export for convenience
pub use bridge::{BridgeError, HttpBridge, MockBridge, PersistenceBridge, SaveOutcome, StoredPaper};
pub use health::HealthMonitor;
pub use papershelf_llm::{
    AnalysisBackend, AnalysisError, AnalysisSettings, AnalysisSummary, ComparisonResult,
    ComparisonRow, ExternalSettings, PaperContent,
};
pub use queue::AnalysisQueue;
pub use session::{Session, SessionConfig, SessionError};
pub use store::PaperStore;
pub use sync::SyncCoordinator;

/// Lifecycle of the LLM analysis for one paper. Transitions happen only
/// inside the analysis queue's task for that id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Idle,
    Analyzing,
    Succeeded,
    Failed,
}

/// Backend persistence state for one paper. Independent of
/// [`AnalysisStatus`]; tracks the sync coordinator, not analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Unset,
    Saving,
    Saved,
    Error,
}

/// A user-added screenshot or highlight attached to a paper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub kind: AnnotationKind,
    /// Image data URI for screenshots, page/region descriptor for highlights.
    pub payload: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Screenshot,
    Highlight,
}

/// Full client-side state for one uploaded paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: String,
    pub content: PaperContent,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub uploaded_at: u64,
    pub analysis_status: AnalysisStatus,
    pub sync_status: SyncStatus,
    /// Present iff `analysis_status == Succeeded`.
    pub analysis: Option<AnalysisSummary>,
    /// Present iff `analysis_status == Failed`; a classified message.
    pub error_message: Option<String>,
    pub tags: Vec<String>,
    pub annotations: Vec<Annotation>,
    /// Monotonic mutation counter. The sync coordinator compares it
    /// against the store's current value to discard stale in-flight
    /// writes. Bumped by content mutations, not by sync bookkeeping.
    #[serde(default)]
    pub write_seq: u64,
}

impl PaperRecord {
    /// Fresh record for an uploaded file: `Idle`, unsynced, no analysis.
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: PaperContent::Bytes(bytes),
            file_name: file_name.into(),
            file_size_bytes: size,
            uploaded_at: unix_millis(),
            analysis_status: AnalysisStatus::Idle,
            sync_status: SyncStatus::Unset,
            analysis: None,
            error_message: None,
            tags: Vec::new(),
            annotations: Vec::new(),
            write_seq: 0,
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
