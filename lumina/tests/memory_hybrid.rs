//! Integration tests for the SQLite memory store: hybrid search, hit counts,
//! status transitions, and fact uniqueness.

use std::sync::Arc;

use async_trait::async_trait;
use lumina::memory::{
    Embedder, EpisodicStatus, MemoryError, MemoryStore, NewFact, SearchParams, TargetTable,
};

struct MockEmbedder {
    dimension: usize,
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, MemoryError> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0f32; self.dimension];
                for (i, b) in t.bytes().enumerate() {
                    v[i % self.dimension] += b as f32 / 256.0;
                }
                v
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn store(dir: &tempfile::TempDir) -> MemoryStore {
    let embedder = Arc::new(MockEmbedder { dimension: 8 });
    MemoryStore::open(dir.path().join("lumina.db"), Some(embedder), 8).unwrap()
}

async fn embed_one(store: &MemoryStore, text: &str) -> Vec<f32> {
    store.embedder().unwrap().embed(&[text]).await.unwrap()[0].clone()
}

#[tokio::test]
async fn added_memory_is_found_by_its_own_vector() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let vector = embed_one(&store, "user loves jazz").await;
    let id = store
        .add_episodic_memory("Alice", "user loves jazz", &vector, EpisodicStatus::Active)
        .await
        .unwrap();

    // Same query vector, threshold below 1.0: the record must come back.
    let hits = store
        .search_hybrid("jazz", &vector, "alice", SearchParams::default())
        .await
        .unwrap();
    assert!(hits.iter().any(|h| h.id == id));
    assert!(hits.iter().all(|h| h.hybrid_score > 0.0));
}

#[tokio::test]
async fn hit_count_increments_once_per_retrieval() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let vector = embed_one(&store, "user loves jazz").await;
    let id = store
        .add_episodic_memory("alice", "user loves jazz", &vector, EpisodicStatus::Active)
        .await
        .unwrap();

    for _ in 0..3 {
        let hits = store
            .search_hybrid("jazz", &vector, "alice", SearchParams::default())
            .await
            .unwrap();
        assert!(hits.iter().any(|h| h.id == id));
    }
    assert_eq!(store.hit_count(id).await.unwrap(), Some(3));
}

#[tokio::test]
async fn character_scoping_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let vector = embed_one(&store, "secret plan").await;
    store
        .add_episodic_memory("alice", "secret plan", &vector, EpisodicStatus::Active)
        .await
        .unwrap();

    let hits = store
        .search_hybrid("secret", &vector, "bob", SearchParams::default())
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn min_results_zero_does_not_relax_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let vector = embed_one(&store, "the weather in tokyo").await;
    store
        .add_episodic_memory("alice", "the weather in tokyo", &vector, EpisodicStatus::Active)
        .await
        .unwrap();

    // A query vector concentrated on two dimensions scores well below the
    // threshold against the near-uniform stored vector; with no text match,
    // one pass finds nothing.
    let other = embed_one(&store, "zz").await;
    let params = SearchParams {
        min_results: 0,
        initial_threshold: 0.99,
        ..SearchParams::default()
    };
    let hits = store
        .search_hybrid("nomatchinghere", &other, "alice", params)
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn threshold_relaxation_recovers_weak_matches() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let vector = embed_one(&store, "user loves jazz").await;
    let id = store
        .add_episodic_memory("alice", "user loves jazz", &vector, EpisodicStatus::Active)
        .await
        .unwrap();

    // A related but non-identical vector: below the strict threshold, found
    // after relaxation down to the floor.
    let query = embed_one(&store, "user loves jazz!").await;
    let params = SearchParams {
        min_results: 1,
        initial_threshold: 0.999,
        ..SearchParams::default()
    };
    let hits = store
        .search_hybrid("jazz", &query, "alice", params)
        .await
        .unwrap();
    assert!(hits.iter().any(|h| h.id == id));
}

#[tokio::test]
async fn status_transitions_are_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let vector = embed_one(&store, "old memory").await;
    let id = store
        .add_episodic_memory("alice", "old memory", &vector, EpisodicStatus::Active)
        .await
        .unwrap();

    assert_eq!(store.archive_memories(&[id]).await.unwrap(), 1);
    assert_eq!(store.episodic_status(id).await.unwrap().as_deref(), Some("archived"));
    // Archiving again is a no-op; archived rows never go back to active.
    assert_eq!(store.archive_memories(&[id]).await.unwrap(), 0);

    assert_eq!(store.delete_memories(&[id]).await.unwrap(), 1);
    assert_eq!(store.episodic_status(id).await.unwrap().as_deref(), Some("deleted"));
    // Deleted is terminal.
    assert_eq!(store.archive_memories(&[id]).await.unwrap(), 0);
    assert_eq!(store.delete_memories(&[id]).await.unwrap(), 0);

    // Archived/deleted rows are invisible to search.
    let hits = store
        .search_hybrid("old", &vector, "alice", SearchParams::default())
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn duplicate_fact_reinforces_instead_of_duplicating() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let fact = NewFact {
        subject: "user".to_string(),
        relation: "likes".to_string(),
        object: "jazz".to_string(),
        weight: 0.5,
        emotion: "joy".to_string(),
        context: "music talk".to_string(),
    };
    let first = store.upsert_fact("alice", &fact).await.unwrap();
    let second = store.upsert_fact("alice", &fact).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(store.fact_count("alice").await.unwrap(), 1);

    let facts = store.facts_for("alice", "user", "likes").await.unwrap();
    assert_eq!(facts.len(), 1);
    assert!(facts[0].weight > 0.5);
    assert!(facts[0].weight <= 1.0);
}

#[tokio::test]
async fn conversation_log_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let id = store
        .log_conversation("Alice", "alice: I love jazz\nbot: noted")
        .await
        .unwrap();

    let pending = store.unprocessed_logs("alice", 20).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert!(!pending[0].is_processed);

    // The log table is searchable through the same hybrid contract.
    let vector = embed_one(&store, "alice: I love jazz\nbot: noted").await;
    let params = SearchParams {
        target: TargetTable::ConversationLog,
        ..SearchParams::default()
    };
    let hits = store
        .search_hybrid("jazz", &vector, "alice", params)
        .await
        .unwrap();
    assert!(hits.iter().any(|h| h.id == id && h.hybrid_score > 0.0));

    // Once processed, never read again.
    store.mark_processed(&[id]).await.unwrap();
    assert!(store.unprocessed_logs("alice", 20).await.unwrap().is_empty());
    assert!(store
        .characters_with_unprocessed()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn evidence_links_insights_to_facts() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let fact = store
        .upsert_fact(
            "alice",
            &NewFact {
                subject: "user".to_string(),
                relation: "likes".to_string(),
                object: "jazz".to_string(),
                weight: 0.8,
                emotion: "joy".to_string(),
                context: String::new(),
            },
        )
        .await
        .unwrap();
    let insight = store
        .insert_insight("alice", "music_lover", "cares about music", 0.8, 0.7)
        .await
        .unwrap();

    store.link_evidence(insight, fact).await.unwrap();
    store.link_evidence(insight, fact).await.unwrap();

    assert_eq!(store.evidence_for(insight).await.unwrap(), vec![fact]);
}
