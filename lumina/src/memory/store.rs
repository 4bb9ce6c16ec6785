//! SQLite-backed memory store with vector search. Persistent, with semantic
//! search via sqlite-vec.
//!
//! Dual-table design per embedded table: a plain meta table for rows
//! (`episodic_memory`, `conversation_log`) and a vec0 virtual table for
//! embeddings keyed by rowid. Hybrid search runs a cosine KNN leg and a
//! substring full-text leg, then fuses with RRF.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::normalize_character_id;

use super::fusion::rrf_fuse;
use super::{Embedder, MemoryError};

static SQLITE_VEC_INIT: Once = Once::new();

/// Formats a vector as JSON for sqlite-vec (e.g. "[0.1,0.2]").
fn vector_to_json(v: &[f32]) -> String {
    let parts: Vec<String> = v.iter().map(|f| f.to_string()).collect();
    format!("[{}]", parts.join(","))
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Which table a search targets. `conversation_log` has no status column, so
/// the SQL adapts per table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetTable {
    EpisodicMemory,
    ConversationLog,
}

impl TargetTable {
    fn meta_table(self) -> &'static str {
        match self {
            TargetTable::EpisodicMemory => "episodic_memory",
            TargetTable::ConversationLog => "conversation_log",
        }
    }

    fn vec_table(self) -> &'static str {
        match self {
            TargetTable::EpisodicMemory => "episodic_vec",
            TargetTable::ConversationLog => "log_vec",
        }
    }

    fn content_column(self) -> &'static str {
        match self {
            TargetTable::EpisodicMemory => "content",
            TargetTable::ConversationLog => "narrative",
        }
    }

    fn has_status(self) -> bool {
        matches!(self, TargetTable::EpisodicMemory)
    }
}

/// Episodic memory lifecycle. Transitions are monotonic:
/// active → archived → deleted, no resurrection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpisodicStatus {
    Active,
    Archived,
    Deleted,
}

impl EpisodicStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EpisodicStatus::Active => "active",
            EpisodicStatus::Archived => "archived",
            EpisodicStatus::Deleted => "deleted",
        }
    }
}

/// One search result row. `hybrid_score` is filled by hybrid search; plain
/// vector search fills `similarity` only.
#[derive(Clone, Debug)]
pub struct MemoryHit {
    pub id: i64,
    pub content: String,
    pub created_at: String,
    pub status: Option<String>,
    pub hit_count: Option<u64>,
    pub similarity: Option<f32>,
    pub hybrid_score: f64,
}

/// Tunables for one hybrid search call.
#[derive(Clone, Debug)]
pub struct SearchParams {
    pub limit: usize,
    pub vector_weight: f32,
    pub initial_threshold: f32,
    pub min_results: usize,
    pub target: TargetTable,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            limit: 10,
            vector_weight: 0.4,
            initial_threshold: 0.6,
            min_results: 3,
            target: TargetTable::EpisodicMemory,
        }
    }
}

/// Raw conversation log row.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub id: i64,
    pub character_id: String,
    pub narrative: String,
    pub created_at: String,
    pub is_processed: bool,
}

/// A fact to insert; duplicates on (subject, relation, object) reinforce the
/// existing row's weight instead of adding a second row.
#[derive(Clone, Debug)]
pub struct NewFact {
    pub subject: String,
    pub relation: String,
    pub object: String,
    pub weight: f32,
    pub emotion: String,
    pub context: String,
}

#[derive(Clone, Debug)]
pub struct FactRecord {
    pub id: i64,
    pub character_id: String,
    pub subject: String,
    pub relation: String,
    pub object: String,
    pub weight: f32,
    pub emotion: String,
    pub context: String,
}

#[derive(Clone, Debug)]
pub struct InsightRecord {
    pub id: i64,
    pub label: String,
    pub description: String,
    pub confidence: f32,
    pub weight: f32,
}

/// SQLite memory store. One file owns all per-character rows; every public
/// method normalizes `character_id` to lowercase at the boundary.
///
/// **Interaction**: shared as `Arc<MemoryStore>`; the chat pipeline only
/// reads (search), the consolidation engine reads logs and writes distilled
/// rows, the bridge appends raw logs.
pub struct MemoryStore {
    db_path: PathBuf,
    embedder: Option<Arc<dyn Embedder>>,
    dimension: usize,
}

impl MemoryStore {
    /// Opens (or creates) the database and its tables. The vec0 tables are
    /// created with the embedder's dimension, or `fallback_dimension` when no
    /// embedder is configured.
    pub fn open(
        path: impl AsRef<Path>,
        embedder: Option<Arc<dyn Embedder>>,
        fallback_dimension: usize,
    ) -> Result<Self, MemoryError> {
        SQLITE_VEC_INIT.call_once(|| unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        });

        let dimension = embedder
            .as_ref()
            .map(|e| e.dimension())
            .unwrap_or(fallback_dimension);
        let db_path = path.as_ref().to_path_buf();

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_log (
                id INTEGER PRIMARY KEY,
                character_id TEXT NOT NULL,
                narrative TEXT NOT NULL,
                created_at TEXT NOT NULL,
                is_processed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_log_unprocessed
                ON conversation_log(character_id, is_processed, created_at);

            CREATE TABLE IF NOT EXISTS episodic_memory (
                id INTEGER PRIMARY KEY,
                character_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                hit_count INTEGER NOT NULL DEFAULT 0,
                last_hit_at TEXT,
                batch_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_episodic_scope
                ON episodic_memory(character_id, status);

            CREATE TABLE IF NOT EXISTS knowledge_fact (
                id INTEGER PRIMARY KEY,
                character_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                relation TEXT NOT NULL,
                object TEXT NOT NULL,
                weight REAL NOT NULL DEFAULT 0.5,
                emotion TEXT NOT NULL DEFAULT 'neutral',
                context TEXT NOT NULL DEFAULT '',
                UNIQUE(character_id, subject, relation, object)
            );

            CREATE TABLE IF NOT EXISTS insight (
                id INTEGER PRIMARY KEY,
                character_id TEXT NOT NULL,
                label TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                confidence REAL NOT NULL DEFAULT 0.5,
                weight REAL NOT NULL DEFAULT 0.5
            );

            CREATE TABLE IF NOT EXISTS evidence (
                insight_id INTEGER NOT NULL,
                fact_id INTEGER NOT NULL,
                PRIMARY KEY (insight_id, fact_id)
            );
            "#,
        )?;
        for vec_table in ["episodic_vec", "log_vec"] {
            conn.execute(
                &format!(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS {vec_table} \
                     USING vec0(embedding float[{dimension}] distance_metric=cosine)"
                ),
                [],
            )?;
        }

        Ok(Self {
            db_path,
            embedder,
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embedder(&self) -> Option<Arc<dyn Embedder>> {
        self.embedder.clone()
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, MemoryError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            f(&conn)
        })
        .await
        .map_err(|e| MemoryError::Storage(e.to_string()))?
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<(), MemoryError> {
        if embedding.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                got: embedding.len(),
                expected: self.dimension,
            });
        }
        Ok(())
    }

    /// Adds a distilled memory row; returns the new id.
    pub async fn add_episodic_memory(
        &self,
        character_id: &str,
        content: &str,
        embedding: &[f32],
        status: EpisodicStatus,
    ) -> Result<i64, MemoryError> {
        self.check_dimension(embedding)?;
        let character_id = normalize_character_id(character_id);
        let content = content.to_string();
        let vec_json = vector_to_json(embedding);
        let created_at = now_rfc3339();
        let status = status.as_str();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO episodic_memory (character_id, content, created_at, status) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![character_id, content, created_at, status],
            )?;
            let id = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO episodic_vec (rowid, embedding) VALUES (?1, ?2)",
                params![id, vec_json],
            )?;
            Ok(id)
        })
        .await
    }

    /// Appends a raw conversation narrative. When an embedder is configured
    /// the embedding is computed inline; otherwise it is left for
    /// [`backfill_embeddings`](MemoryStore::backfill_embeddings).
    pub async fn log_conversation(
        &self,
        character_id: &str,
        narrative: &str,
    ) -> Result<i64, MemoryError> {
        let embedding = match &self.embedder {
            Some(embedder) => {
                let vectors = embedder.embed(&[narrative]).await?;
                let vector = vectors
                    .into_iter()
                    .next()
                    .ok_or_else(|| MemoryError::Embedding("embedder returned no vector".into()))?;
                self.check_dimension(&vector)?;
                Some(vector)
            }
            None => None,
        };

        let character_id = normalize_character_id(character_id);
        let narrative = narrative.to_string();
        let created_at = now_rfc3339();
        let vec_json = embedding.as_deref().map(vector_to_json);

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversation_log (character_id, narrative, created_at) \
                 VALUES (?1, ?2, ?3)",
                params![character_id, narrative, created_at],
            )?;
            let id = conn.last_insert_rowid();
            if let Some(vec_json) = vec_json {
                conn.execute(
                    "INSERT INTO log_vec (rowid, embedding) VALUES (?1, ?2)",
                    params![id, vec_json],
                )?;
            }
            Ok(id)
        })
        .await
    }

    /// Embeds up to `limit` log entries that have no embedding yet. Returns
    /// how many were backfilled. No-op without an embedder.
    pub async fn backfill_embeddings(&self, limit: usize) -> Result<usize, MemoryError> {
        let Some(embedder) = self.embedder.clone() else {
            return Ok(0);
        };

        let pending: Vec<(i64, String)> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT l.id, l.narrative FROM conversation_log l \
                     LEFT JOIN log_vec v ON v.rowid = l.id \
                     WHERE v.rowid IS NULL ORDER BY l.id LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        if pending.is_empty() {
            return Ok(0);
        }

        let texts: Vec<&str> = pending.iter().map(|(_, n)| n.as_str()).collect();
        let vectors = embedder.embed(&texts).await?;
        let rows: Vec<(i64, String)> = pending
            .iter()
            .zip(vectors.iter())
            .map(|((id, _), v)| (*id, vector_to_json(v)))
            .collect();
        let count = rows.len();

        self.with_conn(move |conn| {
            for (id, vec_json) in rows {
                conn.execute(
                    "INSERT INTO log_vec (rowid, embedding) VALUES (?1, ?2)",
                    params![id, vec_json],
                )?;
            }
            Ok(())
        })
        .await?;
        Ok(count)
    }

    /// Cosine KNN over `target`, filtered by character, active status (where
    /// the table has one), and similarity threshold.
    pub async fn search_vector(
        &self,
        query_vector: &[f32],
        character_id: &str,
        limit: usize,
        threshold: f32,
        target: TargetTable,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        self.check_dimension(query_vector)?;
        let character_id = normalize_character_id(character_id);
        let vec_json = vector_to_json(query_vector);
        // KNN is global; over-fetch so per-character filtering still fills the limit.
        let knn_limit = (limit.max(50) * 3) as i64;

        self.with_conn(move |conn| {
            let knn_sql = format!(
                "SELECT rowid, distance FROM {} WHERE embedding MATCH ?1 AND k = ?2",
                target.vec_table()
            );
            let mut stmt = conn.prepare(&knn_sql)?;
            let rows = stmt.query_map(params![vec_json, knn_limit], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?;
            let neighbors: Vec<(i64, f64)> = rows.collect::<Result<Vec<_>, _>>()?;
            if neighbors.is_empty() {
                return Ok(Vec::new());
            }

            let dist_map: std::collections::HashMap<i64, f64> =
                neighbors.iter().copied().collect();
            let ids: Vec<i64> = neighbors.into_iter().map(|(id, _)| id).collect();
            let placeholders: String = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");

            let (select_cols, status_clause) = if target.has_status() {
                (
                    "id, content, created_at, status, hit_count",
                    "AND status = 'active'",
                )
            } else {
                ("id, narrative, created_at, NULL, NULL", "")
            };
            let meta_sql = format!(
                "SELECT {select_cols} FROM {} WHERE id IN ({placeholders}) \
                 AND character_id = ? {status_clause}",
                target.meta_table()
            );
            let mut stmt = conn.prepare(&meta_sql)?;
            let mut bound: Vec<Box<dyn rusqlite::ToSql>> = ids
                .iter()
                .map(|id| Box::new(*id) as Box<dyn rusqlite::ToSql>)
                .collect();
            bound.push(Box::new(character_id.clone()));
            let rows = stmt.query_map(
                rusqlite::params_from_iter(bound.iter().map(|b| b.as_ref())),
                |row| {
                    Ok(MemoryHit {
                        id: row.get(0)?,
                        content: row.get(1)?,
                        created_at: row.get(2)?,
                        status: row.get::<_, Option<String>>(3)?,
                        hit_count: row.get::<_, Option<i64>>(4)?.map(|c| c as u64),
                        similarity: None,
                        hybrid_score: 0.0,
                    })
                },
            )?;

            let mut hits: Vec<MemoryHit> = rows
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .filter_map(|mut hit| {
                    let distance = dist_map.get(&hit.id).copied()?;
                    let similarity = 1.0 - distance as f32;
                    if similarity <= threshold {
                        return None;
                    }
                    hit.similarity = Some(similarity);
                    Some(hit)
                })
                .collect();

            hits.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            hits.truncate(limit);
            Ok(hits)
        })
        .await
    }

    /// Substring full-text search over content, most recent first.
    pub async fn search_fulltext(
        &self,
        query: &str,
        character_id: &str,
        limit: usize,
        target: TargetTable,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        let character_id = normalize_character_id(character_id);
        let query = query.to_lowercase();

        self.with_conn(move |conn| {
            let (select_cols, status_clause) = if target.has_status() {
                (
                    "id, content, created_at, status, hit_count",
                    "AND status = 'active'",
                )
            } else {
                ("id, narrative, created_at, NULL, NULL", "")
            };
            let sql = format!(
                "SELECT {select_cols} FROM {} \
                 WHERE character_id = ?1 {status_clause} \
                 AND lower({}) LIKE '%' || ?2 || '%' \
                 ORDER BY created_at DESC LIMIT ?3",
                target.meta_table(),
                target.content_column()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![character_id, query, limit as i64], |row| {
                Ok(MemoryHit {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    created_at: row.get(2)?,
                    status: row.get::<_, Option<String>>(3)?,
                    hit_count: row.get::<_, Option<i64>>(4)?.map(|c| c as u64),
                    similarity: None,
                    hybrid_score: 0.0,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Hybrid search with adaptive threshold and RRF fusion.
    ///
    /// Runs a vector leg and a text leg (each over-fetching `2 * limit`),
    /// fuses with RRF (k = 60, `vector_weight` / `1 - vector_weight`), and,
    /// when fewer than `min_results` survive, relaxes the threshold by 0.1
    /// and retries, down to a floor of 0.2 or at most 5 passes. With
    /// `min_results = 0` exactly one pass runs. Every id in the final result
    /// set gets its hit count bumped (best-effort).
    pub async fn search_hybrid(
        &self,
        query_text: &str,
        query_vector: &[f32],
        character_id: &str,
        params: SearchParams,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        let mut threshold = params.initial_threshold;
        const FLOOR: f32 = 0.2;
        const STEP: f32 = 0.1;
        let mut fused: Vec<MemoryHit> = Vec::new();

        for pass in 0..5 {
            let vector_hits = self
                .search_vector(
                    query_vector,
                    character_id,
                    params.limit * 2,
                    threshold,
                    params.target,
                )
                .await?;
            let text_hits = self
                .search_fulltext(query_text, character_id, params.limit * 2, params.target)
                .await?;

            fused = rrf_fuse(vector_hits, text_hits, params.vector_weight, params.limit);

            if fused.len() >= params.min_results || threshold <= FLOOR {
                break;
            }
            threshold = (threshold - STEP).max(FLOOR);
            debug!(pass, threshold, "hybrid search relaxing threshold");
        }

        if params.target.has_status() && !fused.is_empty() {
            let ids: Vec<i64> = fused.iter().map(|h| h.id).collect();
            self.mark_hits(&ids).await;
        }

        Ok(fused)
    }

    /// Best-effort hit-count bump: one increment per id, failures logged.
    async fn mark_hits(&self, ids: &[i64]) {
        let ids = ids.to_vec();
        let now = now_rfc3339();
        let result = self
            .with_conn(move |conn| {
                for id in ids {
                    if let Err(e) = conn.execute(
                        "UPDATE episodic_memory \
                         SET hit_count = hit_count + 1, last_hit_at = ?1 WHERE id = ?2",
                        params![now, id],
                    ) {
                        warn!(memory_id = id, error = %e, "failed to mark memory hit");
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "hit-count update pass failed");
        }
    }

    pub async fn hit_count(&self, id: i64) -> Result<Option<u64>, MemoryError> {
        self.with_conn(move |conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT hit_count FROM episodic_memory WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .ok();
            Ok(count.map(|c| c as u64))
        })
        .await
    }

    pub async fn episodic_status(&self, id: i64) -> Result<Option<String>, MemoryError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT status FROM episodic_memory WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .ok())
        })
        .await
    }

    /// Archives active memories. The guard keeps transitions monotonic:
    /// only `active` rows move to `archived`.
    pub async fn archive_memories(&self, ids: &[i64]) -> Result<usize, MemoryError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let mut changed = 0usize;
            for id in ids {
                changed += conn.execute(
                    "UPDATE episodic_memory SET status = 'archived' \
                     WHERE id = ?1 AND status = 'active'",
                    params![id],
                )?;
            }
            Ok(changed)
        })
        .await
    }

    /// Marks memories deleted. `deleted` is terminal; rows never leave it.
    pub async fn delete_memories(&self, ids: &[i64]) -> Result<usize, MemoryError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let mut changed = 0usize;
            for id in ids {
                changed += conn.execute(
                    "UPDATE episodic_memory SET status = 'deleted' \
                     WHERE id = ?1 AND status IN ('active', 'archived')",
                    params![id],
                )?;
            }
            Ok(changed)
        })
        .await
    }

    /// Most recent active memories for a character (evolution input).
    pub async fn recent_episodic(
        &self,
        character_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        let character_id = normalize_character_id(character_id);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content, created_at, status, hit_count FROM episodic_memory \
                 WHERE character_id = ?1 AND status = 'active' \
                 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![character_id, limit as i64], |row| {
                Ok(MemoryHit {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    created_at: row.get(2)?,
                    status: row.get::<_, Option<String>>(3)?,
                    hit_count: row.get::<_, Option<i64>>(4)?.map(|c| c as u64),
                    similarity: None,
                    hybrid_score: 0.0,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    // --- Consolidation support ---

    /// Oldest unprocessed log entries for a character.
    pub async fn unprocessed_logs(
        &self,
        character_id: &str,
        limit: usize,
    ) -> Result<Vec<LogEntry>, MemoryError> {
        let character_id = normalize_character_id(character_id);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, character_id, narrative, created_at, is_processed \
                 FROM conversation_log \
                 WHERE character_id = ?1 AND is_processed = 0 \
                 ORDER BY created_at ASC, id ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![character_id, limit as i64], |row| {
                Ok(LogEntry {
                    id: row.get(0)?,
                    character_id: row.get(1)?,
                    narrative: row.get(2)?,
                    created_at: row.get(3)?,
                    is_processed: row.get::<_, i64>(4)? != 0,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Flips `is_processed` for the given entries in one transaction. The
    /// transition is one-way; processed entries are never re-read.
    pub async fn mark_processed(&self, ids: &[i64]) -> Result<(), MemoryError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for id in &ids {
                tx.execute(
                    "UPDATE conversation_log SET is_processed = 1 WHERE id = ?1",
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Characters that currently have unprocessed log entries.
    pub async fn characters_with_unprocessed(&self) -> Result<Vec<String>, MemoryError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT character_id FROM conversation_log WHERE is_processed = 0",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    // --- Knowledge facts & insights ---

    /// Inserts a fact, or reinforces the existing row's weight on a duplicate
    /// (character_id, subject, relation, object) key. Returns the row id.
    pub async fn upsert_fact(
        &self,
        character_id: &str,
        fact: &NewFact,
    ) -> Result<i64, MemoryError> {
        let character_id = normalize_character_id(character_id);
        let fact = fact.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO knowledge_fact \
                 (character_id, subject, relation, object, weight, emotion, context) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(character_id, subject, relation, object) DO UPDATE SET \
                 weight = min(1.0, weight + (1.0 - weight) * 0.1), \
                 emotion = excluded.emotion, \
                 context = excluded.context",
                params![
                    character_id,
                    fact.subject,
                    fact.relation,
                    fact.object,
                    fact.weight.clamp(0.0, 1.0),
                    fact.emotion,
                    fact.context
                ],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM knowledge_fact \
                 WHERE character_id = ?1 AND subject = ?2 AND relation = ?3 AND object = ?4",
                params![character_id, fact.subject, fact.relation, fact.object],
                |row| row.get(0),
            )?;
            Ok(id)
        })
        .await
    }

    /// All facts with the given subject/relation for conflict detection.
    pub async fn facts_for(
        &self,
        character_id: &str,
        subject: &str,
        relation: &str,
    ) -> Result<Vec<FactRecord>, MemoryError> {
        let character_id = normalize_character_id(character_id);
        let subject = subject.to_string();
        let relation = relation.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, character_id, subject, relation, object, weight, emotion, context \
                 FROM knowledge_fact \
                 WHERE character_id = ?1 AND subject = ?2 AND relation = ?3",
            )?;
            let rows = stmt.query_map(params![character_id, subject, relation], |row| {
                Ok(FactRecord {
                    id: row.get(0)?,
                    character_id: row.get(1)?,
                    subject: row.get(2)?,
                    relation: row.get(3)?,
                    object: row.get(4)?,
                    weight: row.get(5)?,
                    emotion: row.get(6)?,
                    context: row.get(7)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn fact_count(&self, character_id: &str) -> Result<u64, MemoryError> {
        let character_id = normalize_character_id(character_id);
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM knowledge_fact WHERE character_id = ?1",
                params![character_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    /// Replaces conflicting facts with a consolidated set in one transaction.
    /// Returns the ids of the inserted replacements.
    pub async fn replace_facts(
        &self,
        character_id: &str,
        delete_ids: &[i64],
        new_facts: &[NewFact],
    ) -> Result<Vec<i64>, MemoryError> {
        let character_id = normalize_character_id(character_id);
        let delete_ids = delete_ids.to_vec();
        let new_facts = new_facts.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for id in &delete_ids {
                tx.execute("DELETE FROM evidence WHERE fact_id = ?1", params![id])?;
                tx.execute("DELETE FROM knowledge_fact WHERE id = ?1", params![id])?;
            }
            let mut inserted = Vec::with_capacity(new_facts.len());
            for fact in &new_facts {
                tx.execute(
                    "INSERT INTO knowledge_fact \
                     (character_id, subject, relation, object, weight, emotion, context) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(character_id, subject, relation, object) DO UPDATE SET \
                     weight = min(1.0, weight + (1.0 - weight) * 0.1)",
                    params![
                        character_id,
                        fact.subject,
                        fact.relation,
                        fact.object,
                        fact.weight.clamp(0.0, 1.0),
                        fact.emotion,
                        fact.context
                    ],
                )?;
                let id: i64 = tx.query_row(
                    "SELECT id FROM knowledge_fact \
                     WHERE character_id = ?1 AND subject = ?2 AND relation = ?3 AND object = ?4",
                    params![character_id, fact.subject, fact.relation, fact.object],
                    |row| row.get(0),
                )?;
                inserted.push(id);
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    pub async fn insert_insight(
        &self,
        character_id: &str,
        label: &str,
        description: &str,
        confidence: f32,
        weight: f32,
    ) -> Result<i64, MemoryError> {
        let character_id = normalize_character_id(character_id);
        let label = label.to_string();
        let description = description.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO insight (character_id, label, description, confidence, weight) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![character_id, label, description, confidence, weight],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Links an insight to an evidencing fact. Duplicate links are ignored.
    pub async fn link_evidence(&self, insight_id: i64, fact_id: i64) -> Result<(), MemoryError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO evidence (insight_id, fact_id) VALUES (?1, ?2)",
                params![insight_id, fact_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn evidence_for(&self, insight_id: i64) -> Result<Vec<i64>, MemoryError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT fact_id FROM evidence WHERE insight_id = ?1 ORDER BY fact_id")?;
            let rows = stmt.query_map(params![insight_id], |row| row.get::<_, i64>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}
