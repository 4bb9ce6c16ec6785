//! Integration tests for the consolidation engine: forced cycles, parse
//! failures, and LLM-mediated conflict resolution.

use std::sync::Arc;

use async_trait::async_trait;
use lumina::bus::EventBus;
use lumina::consolidation::ConsolidationEngine;
use lumina::llm::{LlmManager, MockDriver, ScriptedTurn};
use lumina::memory::{BatchManager, Embedder, MemoryError, MemoryStore, NewFact};

/// Every text embeds to the same unit vector, so any two objects count as
/// similar (similarity 1.0) — handy for forcing conflict detection.
struct ConstEmbedder;

#[async_trait]
impl Embedder for ConstEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, MemoryError> {
        Ok(texts
            .iter()
            .map(|_| {
                let mut v = vec![0f32; 4];
                v[0] = 1.0;
                v
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        4
    }
}

struct Fixture {
    bus: Arc<EventBus>,
    memory: Arc<MemoryStore>,
    engine: Arc<ConsolidationEngine>,
}

fn fixture(dir: &tempfile::TempDir, script: Vec<ScriptedTurn>) -> Fixture {
    let bus = Arc::new(EventBus::new());
    lumina::bus::events::register_builtin_schemas(&bus);

    let memory = Arc::new(
        MemoryStore::open(dir.path().join("lumina.db"), Some(Arc::new(ConstEmbedder)), 4).unwrap(),
    );

    let mut llm_config = config::LlmConfig::default();
    llm_config.routes.insert(
        "dreaming".to_string(),
        config::RouteConfig {
            provider: "mock".to_string(),
            model: "mock-1".to_string(),
            temperature: 0.2,
            top_p: None,
            presence_penalty: None,
            frequency_penalty: None,
        },
    );
    let llm = Arc::new(LlmManager::new(&llm_config));
    llm.register_driver("mock", Arc::new(MockDriver::new(script)));

    let mut consolidation_config = config::ConsolidationConfig::default();
    consolidation_config.batch_size = 20;
    let engine = Arc::new(ConsolidationEngine::new(
        Arc::clone(&memory),
        llm,
        Arc::clone(&bus),
        Arc::new(BatchManager::new()),
        consolidation_config,
    ));

    Fixture { bus, memory, engine }
}

const DREAM_JSON: &str = r#"{
    "facts": [
        {"subject": "alice", "relation": "loves", "object": "jazz",
         "weight": 0.9, "emotion": "joy", "context": "music talk"}
    ],
    "insights": [
        {"label": "music_lover", "description": "Alice cares about music",
         "confidence": 0.8, "weight": 0.7}
    ],
    "evidence_chain": [
        {"insight": "music_lover", "facts": ["alice|loves|jazz"]}
    ]
}"#;

#[tokio::test]
async fn forced_cycle_distills_and_marks_processed() {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture(&dir, vec![ScriptedTurn::text(DREAM_JSON)]);

    f.memory
        .log_conversation("alice", "alice: I love jazz\nbot: noted")
        .await
        .unwrap();

    let completed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let completed_clone = Arc::clone(&completed);
    f.bus.subscribe_fn("consolidation.completed", move |event| {
        let completed = Arc::clone(&completed_clone);
        async move {
            assert_eq!(event.data["character_id"], "alice");
            assert_eq!(event.data["facts_added"], 1);
            assert_eq!(event.data["insights_added"], 1);
            completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    });

    let report = f.engine.run_cycle("alice", true).await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.processed, 1);
    assert_eq!(report.facts_added, 1);
    assert_eq!(report.insights_added, 1);

    // Entries are consumed exactly once.
    assert!(f.memory.unprocessed_logs("alice", 20).await.unwrap().is_empty());
    let again = f.engine.run_cycle("alice", true).await.unwrap();
    assert!(again.skipped);

    assert_eq!(f.memory.fact_count("alice").await.unwrap(), 1);
    let facts = f.memory.facts_for("alice", "alice", "loves").await.unwrap();
    assert_eq!(facts[0].object, "jazz");

    // The fact also became a retrievable episodic memory.
    let recent = f.memory.recent_episodic("alice", 10).await.unwrap();
    assert!(recent.iter().any(|m| m.content.contains("jazz")));

    assert_eq!(completed.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn partial_batch_accumulates_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture(&dir, vec![ScriptedTurn::text(DREAM_JSON)]);

    f.memory
        .log_conversation("alice", "alice: hello")
        .await
        .unwrap();

    let report = f.engine.run_cycle("alice", false).await.unwrap();
    assert!(report.skipped);
    assert_eq!(f.memory.unprocessed_logs("alice", 20).await.unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_extraction_aborts_without_marking() {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture(&dir, vec![ScriptedTurn::text("sorry, I cannot do that")]);

    f.memory
        .log_conversation("alice", "alice: I love jazz")
        .await
        .unwrap();

    let result = f.engine.run_cycle("alice", true).await;
    assert!(result.is_err());
    // The cycle failed validation; entries stay unprocessed for a retry.
    assert_eq!(f.memory.unprocessed_logs("alice", 20).await.unwrap().len(), 1);
    assert_eq!(f.memory.fact_count("alice").await.unwrap(), 0);
}

#[tokio::test]
async fn conflicting_fact_is_merged_through_the_llm() {
    let dir = tempfile::tempdir().unwrap();
    // First LLM call: extraction producing (user, likes, red).
    // Second LLM call: the merge decision keeping only red.
    let f = fixture(
        &dir,
        vec![
            ScriptedTurn::text(
                r#"{"facts": [{"subject": "user", "relation": "likes", "object": "red"}]}"#,
            ),
            ScriptedTurn::text(
                r#"[{"subject": "user", "relation": "likes", "object": "red", "weight": 0.8}]"#,
            ),
        ],
    );

    // Pre-existing contradictory fact.
    f.memory
        .upsert_fact(
            "alice",
            &NewFact {
                subject: "user".to_string(),
                relation: "likes".to_string(),
                object: "blue".to_string(),
                weight: 0.6,
                emotion: "neutral".to_string(),
                context: String::new(),
            },
        )
        .await
        .unwrap();

    f.memory
        .log_conversation("alice", "user: my favourite colour is red now")
        .await
        .unwrap();

    let report = f.engine.run_cycle("alice", true).await.unwrap();
    assert!(!report.skipped);

    // Exactly one of {blue, red} survives, per the LLM's merge decision.
    let facts = f.memory.facts_for("alice", "user", "likes").await.unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].object, "red");
}
