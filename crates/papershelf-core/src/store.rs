//! In-memory paper state store: the single shared mutable structure.
//!
//! Every component reads a full record snapshot and writes back a full
//! updated record through [`PaperStore::update`], never a partial patch.
//! Sync bookkeeping (`sync_status`, the bytes-to-reference swap) goes
//! through dedicated setters that do not bump `write_seq`, so the sync
//! coordinator's staleness check only sees content mutations.

use std::sync::Mutex;

use dashmap::DashMap;
use papershelf_llm::PaperContent;

use crate::{Annotation, PaperRecord, SyncStatus};

pub struct PaperStore {
    records: DashMap<String, PaperRecord>,
    /// Insertion order for grid display.
    order: Mutex<Vec<String>>,
}

impl Default for PaperStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            order: Mutex::new(Vec::new()),
        }
    }

    /// Create a fresh record for an uploaded file and insert it.
    pub fn insert(&self, file_name: &str, bytes: Vec<u8>) -> PaperRecord {
        let record = PaperRecord::new(file_name, bytes);
        self.insert_existing(record.clone());
        record
    }

    /// Insert a record as-is (used when hydrating from the backend).
    pub fn insert_existing(&self, record: PaperRecord) {
        let id = record.id.clone();
        if self.records.insert(id.clone(), record).is_none() {
            self.order.lock().unwrap_or_else(|e| e.into_inner()).push(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<PaperRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Current write sequence for an id, if present.
    pub fn write_seq(&self, id: &str) -> Option<u64> {
        self.records.get(id).map(|r| r.write_seq)
    }

    /// All records in insertion order.
    pub fn snapshot(&self) -> Vec<PaperRecord> {
        let order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        order
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.clone()))
            .collect()
    }

    /// The single content-mutation path: read-modify-write under the
    /// shard lock, bumping `write_seq`. Returns the updated snapshot so
    /// the caller can hand it to the sync coordinator.
    pub fn update(
        &self,
        id: &str,
        f: impl FnOnce(&mut PaperRecord),
    ) -> Option<PaperRecord> {
        let mut entry = self.records.get_mut(id)?;
        f(entry.value_mut());
        entry.write_seq += 1;
        Some(entry.clone())
    }

    /// Sync bookkeeping: does not bump `write_seq`.
    pub fn set_sync_status(&self, id: &str, status: SyncStatus) {
        if let Some(mut entry) = self.records.get_mut(id) {
            entry.sync_status = status;
        }
    }

    /// Swap raw bytes for a server reference after a successful save, so
    /// later syncs skip the payload. Does not bump `write_seq`.
    pub fn set_content_reference(&self, id: &str, reference: String) {
        if let Some(mut entry) = self.records.get_mut(id) {
            entry.content = PaperContent::Reference(reference);
        }
    }

    pub fn remove(&self, id: &str) -> Option<PaperRecord> {
        let removed = self.records.remove(id).map(|(_, r)| r);
        if removed.is_some() {
            self.order
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|existing| existing != id);
        }
        removed
    }

    /// Add a tag, deduplicated case-sensitively.
    pub fn add_tag(&self, id: &str, tag: &str) -> Option<PaperRecord> {
        self.update(id, |record| {
            if !record.tags.iter().any(|t| t == tag) {
                record.tags.push(tag.to_string());
            }
        })
    }

    pub fn remove_tag(&self, id: &str, tag: &str) -> Option<PaperRecord> {
        self.update(id, |record| record.tags.retain(|t| t != tag))
    }

    pub fn add_annotation(&self, id: &str, annotation: Annotation) -> Option<PaperRecord> {
        self.update(id, |record| record.annotations.push(annotation))
    }

    pub fn remove_annotation(&self, id: &str, annotation_id: &str) -> Option<PaperRecord> {
        self.update(id, |record| {
            record.annotations.retain(|a| a.id != annotation_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AnnotationKind;

    #[test]
    fn insert_and_get() {
        let store = PaperStore::new();
        let record = store.insert("a.pdf", vec![1, 2]);
        let got = store.get(&record.id).unwrap();
        assert_eq!(got.file_name, "a.pdf");
        assert_eq!(got.file_size_bytes, 2);
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let store = PaperStore::new();
        let a = store.insert("a.pdf", vec![]);
        let b = store.insert("b.pdf", vec![]);
        let c = store.insert("c.pdf", vec![]);
        let ids: Vec<_> = store.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn update_bumps_write_seq() {
        let store = PaperStore::new();
        let record = store.insert("a.pdf", vec![]);
        assert_eq!(store.write_seq(&record.id), Some(0));

        let updated = store
            .update(&record.id, |r| r.tags.push("x".into()))
            .unwrap();
        assert_eq!(updated.write_seq, 1);
        assert_eq!(store.write_seq(&record.id), Some(1));
    }

    #[test]
    fn sync_bookkeeping_does_not_bump_seq() {
        let store = PaperStore::new();
        let record = store.insert("a.pdf", vec![1]);
        store.set_sync_status(&record.id, SyncStatus::Saved);
        store.set_content_reference(&record.id, "files/a.pdf".into());

        let got = store.get(&record.id).unwrap();
        assert_eq!(got.write_seq, 0);
        assert_eq!(got.sync_status, SyncStatus::Saved);
        assert_eq!(got.content, PaperContent::Reference("files/a.pdf".into()));
    }

    #[test]
    fn tags_dedup_case_sensitively() {
        let store = PaperStore::new();
        let record = store.insert("a.pdf", vec![]);
        store.add_tag(&record.id, "ml");
        store.add_tag(&record.id, "ml");
        store.add_tag(&record.id, "ML");
        assert_eq!(store.get(&record.id).unwrap().tags, vec!["ml", "ML"]);
    }

    #[test]
    fn annotations_append_and_remove() {
        let store = PaperStore::new();
        let record = store.insert("a.pdf", vec![]);
        store.add_annotation(
            &record.id,
            Annotation {
                id: "ann-1".into(),
                kind: AnnotationKind::Screenshot,
                payload: "data:image/png;base64,xyz".into(),
                created_at: 1,
            },
        );
        assert_eq!(store.get(&record.id).unwrap().annotations.len(), 1);

        store.remove_annotation(&record.id, "ann-1");
        assert!(store.get(&record.id).unwrap().annotations.is_empty());
    }

    #[test]
    fn remove_drops_record_and_order() {
        let store = PaperStore::new();
        let a = store.insert("a.pdf", vec![]);
        let b = store.insert("b.pdf", vec![]);
        store.remove(&a.id);
        assert!(!store.contains(&a.id));
        let ids: Vec<_> = store.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[test]
    fn update_missing_id_is_none() {
        let store = PaperStore::new();
        assert!(store.update("nope", |_| {}).is_none());
    }
}
