//! Scriptable in-memory analysis backend for tests. No HTTP calls.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::{
    AnalysisBackend, AnalysisError, AnalysisSettings, AnalysisSummary, ComparisonResult,
    ComparisonRow, PaperContent,
};

/// Mock backend that resolves responses by a label derived from the
/// content: a `Reference` is keyed by its path, `Bytes` by their UTF-8
/// text. Tracks call counts and the high-water mark of concurrent
/// in-flight calls so tests can assert the queue's concurrency cap.
pub struct MockAnalysisBackend {
    responses: Mutex<HashMap<String, Result<AnalysisSummary, AnalysisError>>>,
    default_response: Mutex<Result<AnalysisSummary, AnalysisError>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    labels: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for MockAnalysisBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAnalysisBackend {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            default_response: Mutex::new(Ok(AnalysisSummary::with_title("Untitled"))),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            labels: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Label used to look up a scripted response.
    pub fn label(content: &PaperContent) -> String {
        match content {
            PaperContent::Reference(r) => r.clone(),
            PaperContent::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// Script the response for a specific content label.
    pub fn script(&self, label: &str, response: Result<AnalysisSummary, AnalysisError>) {
        self.responses
            .lock()
            .unwrap()
            .insert(label.to_string(), response);
    }

    /// Response used when no label-specific script matches.
    pub fn set_default(&self, response: Result<AnalysisSummary, AnalysisError>) {
        *self.default_response.lock().unwrap() = response;
    }

    /// Delay applied before every response. Pairs with
    /// `#[tokio::test(start_paused = true)]` to keep tasks in flight
    /// deterministically.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Content labels of analyze calls, in start order.
    pub fn call_labels(&self) -> Vec<String> {
        self.labels.lock().unwrap().clone()
    }

    /// Highest number of analyze calls that were in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AnalysisBackend for MockAnalysisBackend {
    async fn analyze(
        &self,
        content: &PaperContent,
        _settings: &AnalysisSettings,
    ) -> Result<AnalysisSummary, AnalysisError> {
        let label = Self::label(content);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.labels.lock().unwrap().push(label.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let response = self
            .responses
            .lock()
            .unwrap()
            .get(&label)
            .cloned()
            .unwrap_or_else(|| self.default_response.lock().unwrap().clone());

        self.active.fetch_sub(1, Ordering::SeqCst);
        response
    }

    async fn compare(
        &self,
        summaries: &[AnalysisSummary],
        _settings: &AnalysisSettings,
    ) -> Result<ComparisonResult, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ComparisonResult {
            summary: format!("compared {} papers", summaries.len()),
            rows: summaries
                .iter()
                .map(|s| ComparisonRow {
                    title: s.title.clone(),
                    strengths: String::new(),
                    weaknesses: String::new(),
                })
                .collect(),
        })
    }
}
