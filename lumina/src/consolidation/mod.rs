//! Background distillation of raw conversation logs into knowledge facts,
//! insights, and episodic memory.
//!
//! Triggered when the host is idle (no `input_text` for the configured
//! threshold, observed via minute ticks) or forced. One pass per character at
//! a time, serialized by an async mutex; a pass runs to completion or LLM
//! timeout and is never cancelled mid-cycle.

mod extraction;

pub use extraction::{
    dream_prompt, merge_prompt, parse_extraction, DreamExtraction, EvidenceLink, ExtractedFact,
    ExtractedInsight,
};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use event_packet::event_type;

use crate::bus::EventBus;
use crate::llm::{collect_text, ChatMessage, LlmError, LlmManager, FEATURE_DREAMING};
use crate::memory::{
    cosine_similarity, BatchManager, EpisodicStatus, MemoryError, MemoryStore, NewFact,
};

const LLM_TIMEOUT: Duration = Duration::from_secs(60);

/// Vector similarity above which two fact objects on the same
/// (subject, relation) count as contradictory.
const CONFLICT_SIMILARITY: f32 = 0.75;

#[derive(Debug, Error)]
pub enum ConsolidationError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("extraction payload invalid: {0}")]
    Validation(String),
}

/// Outcome of one consolidation cycle.
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    pub processed: usize,
    pub facts_added: u32,
    pub insights_added: u32,
    /// True when the cycle did nothing (no logs, partial batch, or lock held).
    pub skipped: bool,
}

/// The background distiller. Created at bootstrap; [`start`] wires its
/// triggers onto the bus.
///
/// [`start`]: ConsolidationEngine::start
pub struct ConsolidationEngine {
    memory: Arc<MemoryStore>,
    llm: Arc<LlmManager>,
    bus: Arc<EventBus>,
    batches: Arc<BatchManager>,
    config: config::ConsolidationConfig,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    last_input: Mutex<Instant>,
}

impl ConsolidationEngine {
    pub fn new(
        memory: Arc<MemoryStore>,
        llm: Arc<LlmManager>,
        bus: Arc<EventBus>,
        batches: Arc<BatchManager>,
        config: config::ConsolidationConfig,
    ) -> Self {
        Self {
            memory,
            llm,
            bus,
            batches,
            config,
            locks: DashMap::new(),
            last_input: Mutex::new(Instant::now()),
        }
    }

    pub fn batches(&self) -> Arc<BatchManager> {
        Arc::clone(&self.batches)
    }

    /// Wires triggers: `input_text` resets the idle clock; minute ticks check
    /// idleness and kick per-character cycles.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        self.bus.subscribe_fn(event_type::INPUT_TEXT, move |_event| {
            let engine = Arc::clone(&engine);
            async move {
                if let Ok(mut last) = engine.last_input.lock() {
                    *last = Instant::now();
                }
                Ok(())
            }
        });

        let engine = Arc::clone(self);
        self.bus
            .subscribe_fn(event_type::SYSTEM_TICK_MINUTE, move |_event| {
                let engine = Arc::clone(&engine);
                async move {
                    engine.on_minute_tick().await;
                    Ok(())
                }
            });
        info!(
            enabled = self.config.enabled,
            idle_secs = self.config.idle_secs,
            "consolidation engine started"
        );
    }

    fn idle_for(&self) -> Duration {
        self.last_input
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    async fn on_minute_tick(&self) {
        self.batches
            .purge_expired(Duration::from_secs(self.config.batch_retention_secs));

        // Lazy embedding backfill for log entries written without an
        // embedder in the hot path.
        match self.memory.backfill_embeddings(100).await {
            Ok(0) => {}
            Ok(count) => debug!(count, "backfilled log embeddings"),
            Err(e) => warn!(error = %e, "embedding backfill failed"),
        }

        if !self.config.enabled {
            return;
        }
        if self.idle_for() < Duration::from_secs(self.config.idle_secs) {
            return;
        }

        let characters = match self.memory.characters_with_unprocessed().await {
            Ok(characters) => characters,
            Err(e) => {
                warn!(error = %e, "could not list characters for consolidation");
                return;
            }
        };
        for character_id in characters {
            if let Err(e) = self.run_cycle(&character_id, false).await {
                error!(character_id = %character_id, error = %e, "consolidation cycle failed");
            }
        }
    }

    /// Runs one cycle for a character. With `force = false` a partial batch
    /// is left to accumulate. Only one cycle per character runs at a time;
    /// a held lock skips instead of queueing.
    pub async fn run_cycle(
        &self,
        character_id: &str,
        force: bool,
    ) -> Result<CycleReport, ConsolidationError> {
        let lock = self
            .locks
            .entry(crate::normalize_character_id(character_id))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let Ok(_guard) = lock.try_lock() else {
            debug!(character_id, "consolidation already running; skipped");
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::default()
            });
        };

        let logs = self
            .memory
            .unprocessed_logs(character_id, self.config.batch_size)
            .await?;
        if logs.is_empty() {
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::default()
            });
        }
        if logs.len() < self.config.batch_size && !force {
            debug!(
                character_id,
                pending = logs.len(),
                batch_size = self.config.batch_size,
                "partial batch; accumulating"
            );
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::default()
            });
        }

        let context: Vec<String> = logs
            .iter()
            .map(|entry| format!("- [{}] {}", entry.created_at, entry.narrative))
            .collect();
        let prompt = dream_prompt(&context.join("\n"));
        let raw = self.llm_call(prompt).await?;

        let extraction = match parse_extraction(&raw) {
            Ok(extraction) => extraction,
            Err(e) => {
                // Entries stay unprocessed; the next cycle retries.
                error!(character_id, error = %e, raw = %raw, "dream extraction parse failed");
                return Err(ConsolidationError::Validation(e.to_string()));
            }
        };

        let mut facts_added = 0u32;
        let mut fact_ids: std::collections::HashMap<String, i64> =
            std::collections::HashMap::new();
        for fact in &extraction.facts {
            let new_fact = NewFact {
                subject: fact.subject.clone(),
                relation: fact.relation.clone(),
                object: fact.object.clone(),
                weight: fact.weight,
                emotion: fact.emotion.clone(),
                context: fact.context.clone(),
            };
            match self.reconcile_fact(character_id, new_fact).await {
                Ok(id) => {
                    facts_added += 1;
                    fact_ids.insert(fact.key(), id);
                }
                Err(e) => warn!(character_id, error = %e, "fact reconciliation failed"),
            }

            // Each fact also becomes a retrievable episodic memory.
            if let Some(embedder) = self.memory.embedder() {
                let content = if fact.context.is_empty() {
                    format!("{} {} {}", fact.subject, fact.relation, fact.object)
                } else {
                    format!(
                        "{} {} {} ({})",
                        fact.subject, fact.relation, fact.object, fact.context
                    )
                };
                match embedder.embed(&[&content]).await {
                    Ok(vectors) if !vectors.is_empty() => {
                        if let Err(e) = self
                            .memory
                            .add_episodic_memory(
                                character_id,
                                &content,
                                &vectors[0],
                                EpisodicStatus::Active,
                            )
                            .await
                        {
                            warn!(error = %e, "episodic write failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "episodic embedding failed"),
                }
            }
        }

        let mut insights_added = 0u32;
        let mut insight_ids: std::collections::HashMap<String, i64> =
            std::collections::HashMap::new();
        for insight in &extraction.insights {
            match self
                .memory
                .insert_insight(
                    character_id,
                    &insight.label,
                    &insight.description,
                    insight.confidence,
                    insight.weight,
                )
                .await
            {
                Ok(id) => {
                    insights_added += 1;
                    insight_ids.insert(insight.label.clone(), id);
                }
                Err(e) => warn!(character_id, error = %e, "insight insert failed"),
            }
        }
        for link in &extraction.evidence_chain {
            let Some(&insight_id) = insight_ids.get(&link.insight) else {
                continue;
            };
            for fact_key in &link.facts {
                if let Some(&fact_id) = fact_ids.get(fact_key) {
                    if let Err(e) = self.memory.link_evidence(insight_id, fact_id).await {
                        warn!(error = %e, "evidence link failed");
                    }
                }
            }
        }

        let ids: Vec<i64> = logs.iter().map(|entry| entry.id).collect();
        self.memory.mark_processed(&ids).await?;

        info!(
            character_id,
            processed = ids.len(),
            facts_added,
            insights_added,
            "consolidation cycle completed"
        );
        self.bus
            .emit(
                event_type::CONSOLIDATION_COMPLETED,
                serde_json::json!({
                    "character_id": crate::normalize_character_id(character_id),
                    "facts_added": facts_added,
                    "insights_added": insights_added,
                }),
                "consolidation",
            )
            .await;

        Ok(CycleReport {
            processed: ids.len(),
            facts_added,
            insights_added,
            skipped: false,
        })
    }

    async fn llm_call(&self, prompt: String) -> Result<String, LlmError> {
        let driver = self.llm.driver(FEATURE_DREAMING)?;
        let request = self
            .llm
            .request_for(FEATURE_DREAMING, vec![ChatMessage::user(prompt)], None)?;
        let stream = tokio::time::timeout(LLM_TIMEOUT, driver.chat_completion(request))
            .await
            .map_err(|_| LlmError::Timeout(LLM_TIMEOUT))??;
        tokio::time::timeout(LLM_TIMEOUT, collect_text(stream))
            .await
            .map_err(|_| LlmError::Timeout(LLM_TIMEOUT))?
    }

    /// Upserts a fact, first resolving contradictions: an existing fact with
    /// the same subject/relation, a different object, and object similarity
    /// above the bar is merged with the new one through the LLM. On LLM
    /// failure both originals are kept.
    async fn reconcile_fact(
        &self,
        character_id: &str,
        fact: NewFact,
    ) -> Result<i64, ConsolidationError> {
        let existing = self
            .memory
            .facts_for(character_id, &fact.subject, &fact.relation)
            .await?;
        let candidates: Vec<_> = existing
            .into_iter()
            .filter(|record| record.object != fact.object)
            .collect();

        let embedder = self.memory.embedder();
        let (Some(embedder), false) = (embedder, candidates.is_empty()) else {
            return Ok(self.memory.upsert_fact(character_id, &fact).await?);
        };

        let mut texts: Vec<&str> = vec![fact.object.as_str()];
        texts.extend(candidates.iter().map(|record| record.object.as_str()));
        let vectors = match embedder.embed(&texts).await {
            Ok(vectors) if vectors.len() == texts.len() => vectors,
            _ => return Ok(self.memory.upsert_fact(character_id, &fact).await?),
        };

        let conflicting: Vec<_> = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| cosine_similarity(&vectors[0], &vectors[i + 1]) > CONFLICT_SIMILARITY)
            .map(|(_, record)| record.clone())
            .collect();
        if conflicting.is_empty() {
            return Ok(self.memory.upsert_fact(character_id, &fact).await?);
        }

        info!(
            character_id,
            subject = %fact.subject,
            relation = %fact.relation,
            conflicts = conflicting.len(),
            "fact conflict detected; delegating merge to LLM"
        );

        let prompt = merge_prompt(&fact, &conflicting);
        let merged = match self.llm_call(prompt).await {
            Ok(raw) => extraction::parse_merged_facts(&raw),
            Err(e) => Err(e.to_string()),
        };

        match merged {
            Ok(replacements) if !replacements.is_empty() => {
                let delete_ids: Vec<i64> = conflicting.iter().map(|record| record.id).collect();
                let inserted = self
                    .memory
                    .replace_facts(character_id, &delete_ids, &replacements)
                    .await?;
                inserted
                    .first()
                    .copied()
                    .ok_or_else(|| ConsolidationError::Validation("empty merge result".into()))
            }
            Ok(_) | Err(_) => {
                // Merge failed: keep the originals and the new fact.
                warn!(character_id, "fact merge failed; keeping both facts");
                Ok(self.memory.upsert_fact(character_id, &fact).await?)
            }
        }
    }
}
