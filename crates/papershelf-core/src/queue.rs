//! Bounded-concurrency analysis queue.
//!
//! A fixed pool of workers drains a FIFO channel of paper ids, so at
//! most `max_parallel` analyses run at once no matter how many papers
//! are enqueued. An id already queued or running is not enqueued
//! again. Purged ids stay in the channel but are skipped when a worker
//! picks them up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::{DashMap, DashSet};
use papershelf_llm::{AnalysisBackend, AnalysisSettings};
use tokio_util::sync::CancellationToken;

use crate::store::PaperStore;
use crate::sync::SyncCoordinator;
use crate::AnalysisStatus;

pub struct AnalysisQueue {
    tx: async_channel::Sender<(String, u64)>,
    /// Enqueued ids mapped to the epoch of their live channel entry.
    /// A purge (or purge plus re-enqueue) leaves a stale entry in the
    /// channel; workers run only the entry whose epoch still matches.
    pending: DashMap<String, u64>,
    epoch: AtomicU64,
    /// Currently being analyzed.
    running: DashSet<String>,
    backend: Arc<dyn AnalysisBackend>,
    store: Arc<PaperStore>,
    sync: Arc<SyncCoordinator>,
    settings: Mutex<AnalysisSettings>,
    cancel: CancellationToken,
}

impl AnalysisQueue {
    pub fn new(
        backend: Arc<dyn AnalysisBackend>,
        store: Arc<PaperStore>,
        sync: Arc<SyncCoordinator>,
        settings: AnalysisSettings,
        max_parallel: usize,
    ) -> Arc<Self> {
        let (tx, rx) = async_channel::unbounded();
        let queue = Arc::new(Self {
            tx,
            pending: DashMap::new(),
            epoch: AtomicU64::new(0),
            running: DashSet::new(),
            backend,
            store,
            sync,
            settings: Mutex::new(settings),
            cancel: CancellationToken::new(),
        });

        for worker in 0..max_parallel.max(1) {
            let queue = Arc::clone(&queue);
            let rx = rx.clone();
            tokio::spawn(async move {
                queue.worker_loop(worker, rx).await;
            });
        }

        queue
    }

    /// Queue a paper for analysis. Returns false if the id is unknown
    /// or already queued or running. The record goes back to `Idle`
    /// until a worker picks it up, which also resets a prior failure.
    pub fn enqueue(&self, id: &str) -> bool {
        if self.pending.contains_key(id) || self.running.contains(id) {
            return false;
        }
        let Some(updated) = self.store.update(id, |record| {
            record.analysis_status = AnalysisStatus::Idle;
            record.error_message = None;
        }) else {
            return false;
        };
        self.sync.schedule(updated);

        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(id.to_string(), epoch);
        if self.tx.try_send((id.to_string(), epoch)).is_err() {
            // channel closed during shutdown
            self.pending.remove(id);
            return false;
        }
        true
    }

    /// Drop a queued (not yet running) analysis, e.g. after a delete.
    /// A running analysis finishes; its result is discarded when the
    /// record is gone.
    pub fn purge(&self, id: &str) {
        self.pending.remove(id);
    }

    pub fn queued_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// True while this id is queued or being analyzed.
    pub fn is_active(&self, id: &str) -> bool {
        self.pending.contains_key(id) || self.running.contains(id)
    }

    pub fn set_settings(&self, settings: AnalysisSettings) {
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub fn settings(&self) -> AnalysisSettings {
        self.settings.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.tx.close();
    }

    async fn worker_loop(&self, worker: usize, rx: async_channel::Receiver<(String, u64)>) {
        loop {
            let (id, epoch) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(entry) => entry,
                    Err(_) => break,
                },
            };
            // Stale entries (purged, or superseded by a re-enqueue that
            // took a fresh tail position) are skipped, leaving any live
            // entry for the id untouched.
            if self.pending.get(&id).map(|e| *e) != Some(epoch) {
                continue;
            }
            self.pending.remove(&id);
            self.running.insert(id.clone());
            self.run_one(worker, &id).await;
            self.running.remove(&id);
        }
    }

    async fn run_one(&self, worker: usize, id: &str) {
        let Some(record) = self.store.get(id) else {
            return;
        };
        if let Some(updated) = self.store.update(id, |record| {
            record.analysis_status = AnalysisStatus::Analyzing;
        }) {
            self.sync.schedule(updated);
        }
        let settings = self.settings();
        tracing::debug!(worker, id, file = %record.file_name, "analysis started");

        let result = self.backend.analyze(&record.content, &settings).await;

        if !self.store.contains(id) {
            tracing::debug!(worker, id, "paper deleted mid-analysis, result dropped");
            return;
        }
        let updated = match result {
            Ok(summary) => {
                tracing::info!(worker, id, title = %summary.title, "analysis succeeded");
                self.store.update(id, |record| {
                    record.analysis_status = AnalysisStatus::Succeeded;
                    record.analysis = Some(summary.clone());
                    record.error_message = None;
                })
            }
            Err(e) => {
                tracing::warn!(worker, id, error = %e, "analysis failed");
                self.store.update(id, |record| {
                    record.analysis_status = AnalysisStatus::Failed;
                    record.analysis = None;
                    record.error_message = Some(e.to_string());
                })
            }
        };
        if let Some(updated) = updated {
            self.sync.schedule(updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{MockBridge, PersistenceBridge};
    use crate::health::HealthMonitor;
    use papershelf_llm::mock::MockAnalysisBackend;
    use papershelf_llm::AnalysisSummary;
    use std::time::Duration;

    fn setup(
        backend: Arc<MockAnalysisBackend>,
        max_parallel: usize,
    ) -> (Arc<PaperStore>, Arc<AnalysisQueue>) {
        let bridge = Arc::new(MockBridge::new()) as Arc<dyn PersistenceBridge>;
        let store = Arc::new(PaperStore::new());
        let health = Arc::new(HealthMonitor::new(Arc::clone(&bridge)));
        let sync = Arc::new(SyncCoordinator::new(bridge, Arc::clone(&store), health));
        let queue = AnalysisQueue::new(
            backend,
            Arc::clone(&store),
            sync,
            AnalysisSettings::Managed,
            max_parallel,
        );
        (store, queue)
    }

    async fn wait_idle(queue: &AnalysisQueue) {
        while queue.queued_len() > 0 || queue.running_len() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_runs_and_records_success() {
        let backend = Arc::new(MockAnalysisBackend::new());
        backend.set_default(Ok(AnalysisSummary::with_title("Attention Is All You Need")));
        let (store, queue) = setup(Arc::clone(&backend), 2);

        let record = store.insert("a.pdf", b"paper-a".to_vec());
        assert!(queue.enqueue(&record.id));
        wait_idle(&queue).await;

        let got = store.get(&record.id).unwrap();
        assert_eq!(got.analysis_status, AnalysisStatus::Succeeded);
        assert_eq!(got.analysis.unwrap().title, "Attention Is All You Need");
        assert!(got.error_message.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn double_enqueue_analyzes_once() {
        let backend = Arc::new(MockAnalysisBackend::new());
        backend.set_delay(Duration::from_millis(50));
        let (store, queue) = setup(Arc::clone(&backend), 2);

        let record = store.insert("a.pdf", b"paper-a".to_vec());
        assert!(queue.enqueue(&record.id));
        assert!(!queue.enqueue(&record.id));
        tokio::time::sleep(Duration::from_millis(10)).await;
        // also rejected while running
        assert!(!queue.enqueue(&record.id));
        wait_idle(&queue).await;

        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_cap() {
        let backend = Arc::new(MockAnalysisBackend::new());
        backend.set_delay(Duration::from_millis(50));
        let (store, queue) = setup(Arc::clone(&backend), 2);

        for i in 0..6u8 {
            let record = store.insert(format!("p{i}.pdf").as_str(), vec![i]);
            queue.enqueue(&record.id);
        }
        wait_idle(&queue).await;

        assert_eq!(backend.call_count(), 6);
        assert!(backend.max_concurrent() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_isolated_to_its_paper() {
        let backend = Arc::new(MockAnalysisBackend::new());
        backend.script("paper-bad", Err(papershelf_llm::AnalysisError::RateLimited));
        backend.script("paper-good", Ok(AnalysisSummary::with_title("Good")));
        let (store, queue) = setup(Arc::clone(&backend), 2);

        let bad = store.insert("bad.pdf", b"paper-bad".to_vec());
        let good = store.insert("good.pdf", b"paper-good".to_vec());
        queue.enqueue(&bad.id);
        queue.enqueue(&good.id);
        wait_idle(&queue).await;

        let bad = store.get(&bad.id).unwrap();
        assert_eq!(bad.analysis_status, AnalysisStatus::Failed);
        assert!(bad.error_message.is_some());
        assert!(bad.analysis.is_none());

        let good = store.get(&good.id).unwrap();
        assert_eq!(good.analysis_status, AnalysisStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn purged_id_is_skipped() {
        let backend = Arc::new(MockAnalysisBackend::new());
        backend.set_delay(Duration::from_millis(50));
        let (store, queue) = setup(Arc::clone(&backend), 1);

        let first = store.insert("a.pdf", b"paper-a".to_vec());
        let second = store.insert("b.pdf", b"paper-b".to_vec());
        queue.enqueue(&first.id);
        queue.enqueue(&second.id);
        tokio::time::sleep(Duration::from_millis(10)).await;
        // second is still queued behind the single worker
        queue.purge(&second.id);
        wait_idle(&queue).await;

        assert_eq!(backend.call_count(), 1);
        // never picked up, so never left Idle
        assert_eq!(
            store.get(&second.id).unwrap().analysis_status,
            AnalysisStatus::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_paper_result_is_dropped() {
        let backend = Arc::new(MockAnalysisBackend::new());
        backend.set_delay(Duration::from_millis(50));
        let (store, queue) = setup(Arc::clone(&backend), 1);

        let record = store.insert("a.pdf", b"paper-a".to_vec());
        queue.enqueue(&record.id);
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.remove(&record.id);
        wait_idle(&queue).await;

        assert_eq!(backend.call_count(), 1);
        assert!(store.get(&record.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_order_with_single_worker() {
        let backend = Arc::new(MockAnalysisBackend::new());
        backend.set_delay(Duration::from_millis(10));
        let (store, queue) = setup(Arc::clone(&backend), 1);

        for label in ["paper-a", "paper-b", "paper-c", "paper-d"] {
            let record = store.insert(&format!("{label}.pdf"), label.as_bytes().to_vec());
            queue.enqueue(&record.id);
        }
        wait_idle(&queue).await;
        assert_eq!(
            backend.call_labels(),
            vec!["paper-a", "paper-b", "paper-c", "paper-d"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reenqueue_after_purge_waits_its_turn() {
        let backend = Arc::new(MockAnalysisBackend::new());
        backend.set_delay(Duration::from_millis(30));
        let (store, queue) = setup(Arc::clone(&backend), 1);

        let a = store.insert("a.pdf", b"paper-a".to_vec());
        let b = store.insert("b.pdf", b"paper-b".to_vec());
        let c = store.insert("c.pdf", b"paper-c".to_vec());
        queue.enqueue(&a.id);
        queue.enqueue(&b.id);
        queue.enqueue(&c.id);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // b leaves the queue and comes back; its old channel entry is
        // stale, so it must now run after c, not in b's old slot
        queue.purge(&b.id);
        assert!(queue.enqueue(&b.id));
        wait_idle(&queue).await;

        assert_eq!(
            backend.call_labels(),
            vec!["paper-a", "paper-c", "paper-b"]
        );
    }
}
