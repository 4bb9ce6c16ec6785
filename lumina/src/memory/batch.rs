//! Retrieval-side batch tracking: which episodic memories were handed to the
//! LLM during chat, as candidate inputs for a later re-consolidation pass.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::normalize_character_id;

/// Batch lifecycle. Transitions: pending → processing → (completed | failed);
/// terminal batches are garbage-collected after the retention period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

/// Tracks one retrieval-consolidation cycle's memory ids.
#[derive(Clone, Debug)]
pub struct ConsolidationBatch {
    pub batch_id: String,
    pub character_id: String,
    /// Memory ids returned by retrieval.
    pub retrieved_ids: Vec<i64>,
    /// Memory ids actually sent to the LLM (to archive or merge afterwards).
    pub sent_to_llm_ids: Vec<i64>,
    pub status: BatchStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Set when the batch reaches a terminal status; drives GC.
    finished_at: Option<Instant>,
}

/// In-memory registry of batches across all characters.
#[derive(Default)]
pub struct BatchManager {
    batches: DashMap<String, ConsolidationBatch>,
}

impl BatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_batch(&self, character_id: &str, retrieved_ids: Vec<i64>) -> ConsolidationBatch {
        let batch = ConsolidationBatch {
            batch_id: format!("batch_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            character_id: normalize_character_id(character_id),
            retrieved_ids,
            sent_to_llm_ids: Vec::new(),
            status: BatchStatus::Pending,
            created_at: chrono::Utc::now(),
            finished_at: None,
        };
        info!(
            batch_id = %batch.batch_id,
            character_id = %batch.character_id,
            retrieved = batch.retrieved_ids.len(),
            "created consolidation batch"
        );
        self.batches.insert(batch.batch_id.clone(), batch.clone());
        batch
    }

    /// Records the ids actually sent to the LLM and moves the batch to
    /// `processing`.
    pub fn mark_sent_to_llm(&self, batch_id: &str, sent_ids: Vec<i64>) {
        if let Some(mut batch) = self.batches.get_mut(batch_id) {
            if batch.status != BatchStatus::Pending {
                warn!(batch_id, status = ?batch.status, "mark_sent_to_llm on non-pending batch");
                return;
            }
            batch.sent_to_llm_ids = sent_ids;
            batch.status = BatchStatus::Processing;
            debug!(batch_id, sent = batch.sent_to_llm_ids.len(), "batch processing");
        }
    }

    pub fn get(&self, batch_id: &str) -> Option<ConsolidationBatch> {
        self.batches.get(batch_id).map(|b| b.clone())
    }

    pub fn complete(&self, batch_id: &str) {
        if let Some(mut batch) = self.batches.get_mut(batch_id) {
            batch.status = BatchStatus::Completed;
            batch.finished_at = Some(Instant::now());
            info!(batch_id, "batch completed");
        }
    }

    pub fn fail(&self, batch_id: &str, reason: &str) {
        if let Some(mut batch) = self.batches.get_mut(batch_id) {
            batch.status = BatchStatus::Failed;
            batch.finished_at = Some(Instant::now());
            warn!(batch_id, reason, "batch failed");
        }
    }

    /// Pending batches for a character, oldest first.
    pub fn pending_for(&self, character_id: &str) -> Vec<ConsolidationBatch> {
        let character_id = normalize_character_id(character_id);
        let mut pending: Vec<ConsolidationBatch> = self
            .batches
            .iter()
            .filter(|b| b.character_id == character_id && b.status == BatchStatus::Pending)
            .map(|b| b.clone())
            .collect();
        pending.sort_by_key(|b| b.created_at);
        pending
    }

    pub fn oldest_pending(&self, character_id: &str) -> Option<ConsolidationBatch> {
        self.pending_for(character_id).into_iter().next()
    }

    /// Drops terminal batches older than `retention`. Returns how many were
    /// purged.
    pub fn purge_expired(&self, retention: Duration) -> usize {
        let expired: Vec<String> = self
            .batches
            .iter()
            .filter(|b| {
                b.status.is_terminal()
                    && b.finished_at
                        .map(|t| t.elapsed() >= retention)
                        .unwrap_or(false)
            })
            .map(|b| b.batch_id.clone())
            .collect();
        for batch_id in &expired {
            self.batches.remove(batch_id);
            debug!(batch_id = %batch_id, "purged terminal batch");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_lifecycle() {
        let manager = BatchManager::new();
        let batch = manager.create_batch("Alice", vec![1, 2, 3]);
        assert_eq!(batch.character_id, "alice");
        assert_eq!(batch.status, BatchStatus::Pending);

        manager.mark_sent_to_llm(&batch.batch_id, vec![1, 2]);
        let batch = manager.get(&batch.batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::Processing);
        assert_eq!(batch.sent_to_llm_ids, vec![1, 2]);

        manager.complete(&batch.batch_id);
        assert_eq!(
            manager.get(&batch.batch_id).unwrap().status,
            BatchStatus::Completed
        );
    }

    #[test]
    fn oldest_pending_orders_by_creation() {
        let manager = BatchManager::new();
        let first = manager.create_batch("alice", vec![1]);
        let _second = manager.create_batch("alice", vec![2]);
        let oldest = manager.oldest_pending("alice").unwrap();
        assert_eq!(oldest.batch_id, first.batch_id);
    }

    #[test]
    fn purge_removes_only_expired_terminal_batches() {
        let manager = BatchManager::new();
        let done = manager.create_batch("alice", vec![1]);
        manager.complete(&done.batch_id);
        let live = manager.create_batch("alice", vec![2]);

        assert_eq!(manager.purge_expired(Duration::ZERO), 1);
        assert!(manager.get(&done.batch_id).is_none());
        assert!(manager.get(&live.batch_id).is_some());

        // A terminal batch inside the retention window survives.
        let recent = manager.create_batch("alice", vec![3]);
        manager.fail(&recent.batch_id, "test");
        assert_eq!(manager.purge_expired(Duration::from_secs(3600)), 0);
        assert!(manager.get(&recent.batch_id).is_some());
    }
}
