//! World Model - persistent experiment memory
//!
//! One SQLite file holds every design session. Each `WorldModel` handle opens a
//! fresh design session and scopes its reads (experiment counts, history,
//! frontiers) to it.
//!
//! | Table               | Unit                                              |
//! |---------------------|---------------------------------------------------|
//! | `designs`           | One run of the loop; global summary, token total  |
//! | `plans`             | One cycle of a design; per-kind token accounting  |
//! | `experiments`       | Config/metrics/artifacts blobs keyed by id        |
//! | `pareto_frontiers`  | Ranked frontier entries per stratum               |
//! | `pareto_history`    | Pareto ids reported at the end of each cycle      |
//! | `llm_analyses`      | Raw and parsed LLM analysis responses             |
//! | `analysis_links`    | analysis -> experiment edges with a role          |
//! | `experiment_memory` | Narrative index for similarity retrieval          |
//!
//! All methods are synchronous. Async callers go through [`WorldModel::blocking`],
//! which runs the closure on `tokio::task::spawn_blocking`.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use shared_types::{Artifacts, ExperimentConfig, ExperimentResult, ExperimentStatus, Metrics};

#[derive(Debug, thiserror::Error)]
pub enum WorldModelError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("world model lock poisoned")]
    Poisoned,
    #[error("blocking task failed: {0}")]
    Join(String),
}

// ─── Supporting types ────────────────────────────────────────────────────────

/// Which part of a cycle spent the tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Plan,
    Analysis,
    GlobalSummary,
}

impl TokenKind {
    fn column(&self) -> &'static str {
        match self {
            TokenKind::Plan => "token_plan_used",
            TokenKind::Analysis => "token_analysis_used",
            TokenKind::GlobalSummary => "token_global_summary_used",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanTokens {
    pub total: u64,
    pub plan: u64,
    pub analysis: u64,
    pub global_summary: u64,
}

/// Adjective cut-offs used when writing experiment narratives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeThresholds {
    /// PSNR (dB) above which quality is "excellent"
    pub quality_excellent: f64,
    /// PSNR (dB) above which quality is "good"
    pub quality_good: f64,
    /// Latency (ms) below which speed is "ultra-fast"
    pub speed_ultra_fast: f64,
    /// Latency (ms) below which speed is "fast"
    pub speed_fast: f64,
}

impl Default for NarrativeThresholds {
    fn default() -> Self {
        Self {
            quality_excellent: 32.0,
            quality_good: 28.0,
            speed_ultra_fast: 20.0,
            speed_fast: 50.0,
        }
    }
}

/// One ranked entry of a stratum's frontier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrontierEntry {
    pub experiment_id: String,
    pub rank: u32,
    pub strata: String,
    pub config: ExperimentConfig,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisLink {
    pub experiment_id: String,
    pub role: String,
}

/// Input to [`WorldModel::save_llm_analysis`].
#[derive(Debug, Clone)]
pub struct LlmAnalysisRecord {
    pub cycle: u32,
    pub kind: String,
    pub prompt: String,
    pub raw_response: String,
    pub parsed: serde_json::Value,
    pub model: String,
    pub tokens: u64,
    pub links: Vec<AnalysisLink>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Stats {
    fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Self { min, max, mean }
    }
}

/// Aggregate view of the current design session, fed to planner prompts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorldModelSummary {
    pub total_experiments: usize,
    pub successful_experiments: usize,
    pub failed_experiments: usize,
    pub psnr_stats: Stats,
    pub ssim_stats: Stats,
    pub latency_stats: Stats,
    pub best_experiment_id: Option<String>,
    pub global_summary: Option<String>,
    pub token_used: u64,
}

// ─── Store ───────────────────────────────────────────────────────────────────

struct WorldModelInner {
    conn: Connection,
    design_id: i64,
    thresholds: NarrativeThresholds,
}

/// Cloneable handle over a single SQLite connection.
#[derive(Clone)]
pub struct WorldModel {
    inner: Arc<Mutex<WorldModelInner>>,
    design_id: i64,
}

impl WorldModel {
    /// Open (or create) the store at `path` and start a new design session.
    /// Use `":memory:"` for in-process test stores.
    pub fn open(path: &str, thresholds: NarrativeThresholds) -> Result<Self, WorldModelError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        conn.execute("INSERT INTO designs (token_used) VALUES (0)", [])?;
        let design_id = conn.last_insert_rowid();

        tracing::info!(path = %path, design_id, "World model opened");

        Ok(Self {
            inner: Arc::new(Mutex::new(WorldModelInner {
                conn,
                design_id,
                thresholds,
            })),
            design_id,
        })
    }

    pub fn design_id(&self) -> i64 {
        self.design_id
    }

    fn lock(&self) -> Result<MutexGuard<'_, WorldModelInner>, WorldModelError> {
        self.inner.lock().map_err(|_| WorldModelError::Poisoned)
    }

    /// Run a synchronous store operation on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, WorldModelError>
    where
        T: Send + 'static,
        F: FnOnce(&WorldModel) -> Result<T, WorldModelError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| WorldModelError::Join(e.to_string()))?
    }

    // ─── Plans ───────────────────────────────────────────────────────────────

    /// Plan row id for `cycle`, created on first use.
    pub fn plan_for_cycle(&self, cycle: u32) -> Result<i64, WorldModelError> {
        let inner = self.lock()?;
        plan_id_for(&inner.conn, inner.design_id, cycle)
    }

    /// Add `tokens` to the cycle's plan (total + per-kind column) and to the
    /// design total. Increments are applied in place, never read-modify-write.
    pub fn record_tokens(
        &self,
        cycle: u32,
        kind: TokenKind,
        tokens: u64,
    ) -> Result<(), WorldModelError> {
        if tokens == 0 {
            return Ok(());
        }
        let mut inner = self.lock()?;
        let design_id = inner.design_id;
        let tx = inner.conn.transaction()?;
        let plan_id = plan_id_for(&tx, design_id, cycle)?;
        let sql = format!(
            "UPDATE plans SET token_total_used = token_total_used + ?1, {col} = {col} + ?1 WHERE id = ?2",
            col = kind.column()
        );
        tx.execute(&sql, params![tokens as i64, plan_id])?;
        tx.execute(
            "UPDATE designs SET token_used = token_used + ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![tokens as i64, design_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn plan_tokens(&self, cycle: u32) -> Result<PlanTokens, WorldModelError> {
        let inner = self.lock()?;
        let row = inner
            .conn
            .query_row(
                "SELECT token_total_used, token_plan_used, token_analysis_used, token_global_summary_used
                 FROM plans WHERE design_id = ?1 AND cycle = ?2",
                params![inner.design_id, cycle],
                |row| {
                    Ok(PlanTokens {
                        total: row.get::<_, i64>(0)? as u64,
                        plan: row.get::<_, i64>(1)? as u64,
                        analysis: row.get::<_, i64>(2)? as u64,
                        global_summary: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_default())
    }

    pub fn design_tokens(&self) -> Result<u64, WorldModelError> {
        let inner = self.lock()?;
        let used: i64 = inner.conn.query_row(
            "SELECT token_used FROM designs WHERE id = ?1",
            params![inner.design_id],
            |row| row.get(0),
        )?;
        Ok(used as u64)
    }

    pub fn update_plan_summary(&self, cycle: u32, summary: &str) -> Result<(), WorldModelError> {
        let inner = self.lock()?;
        let plan_id = plan_id_for(&inner.conn, inner.design_id, cycle)?;
        inner.conn.execute(
            "UPDATE plans SET summary = ?1 WHERE id = ?2",
            params![summary, plan_id],
        )?;
        Ok(())
    }

    pub fn plan_summary(&self, cycle: u32) -> Result<Option<String>, WorldModelError> {
        let inner = self.lock()?;
        let summary = inner
            .conn
            .query_row(
                "SELECT summary FROM plans WHERE design_id = ?1 AND cycle = ?2",
                params![inner.design_id, cycle],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(summary.flatten())
    }

    /// Replace the design's global summary and remember which plan it covers.
    pub fn update_global_summary(&self, summary: &str) -> Result<(), WorldModelError> {
        let inner = self.lock()?;
        let latest_plan: Option<i64> = inner.conn.query_row(
            "SELECT MAX(id) FROM plans WHERE design_id = ?1",
            params![inner.design_id],
            |row| row.get(0),
        )?;
        inner.conn.execute(
            "UPDATE designs SET global_summary = ?1, last_summary_plan_id = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?3",
            params![summary, latest_plan, inner.design_id],
        )?;
        Ok(())
    }

    pub fn global_summary(&self) -> Result<Option<String>, WorldModelError> {
        let inner = self.lock()?;
        global_summary_of(&inner.conn, inner.design_id)
    }

    // ─── Experiments ─────────────────────────────────────────────────────────

    /// Persist one result. Saving the same experiment id twice in a design
    /// session keeps the first row and returns its id.
    pub fn save_experiment(&self, result: &ExperimentResult) -> Result<i64, WorldModelError> {
        let mut inner = self.lock()?;
        let design_id = inner.design_id;
        let narrative = create_experiment_narrative(result, &inner.thresholds);
        let tx = inner.conn.transaction()?;

        if let Some(existing) = tx
            .query_row(
                "SELECT id FROM experiments WHERE design_id = ?1 AND experiment_id = ?2",
                params![design_id, result.experiment_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            tracing::debug!(
                experiment_id = %result.experiment_id,
                "Experiment already persisted; keeping first result"
            );
            return Ok(existing);
        }

        let plan_id = plan_id_for(&tx, design_id, result.cycle)?;
        let metrics = match &result.metrics {
            Some(m) => Some(serde_json::to_string(m)?),
            None => None,
        };
        tx.execute(
            "INSERT INTO experiments (
                experiment_id, plan_id, design_id, cycle, fingerprint, config, metrics,
                artifacts, status, error_message, started_at, completed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                result.experiment_id,
                plan_id,
                design_id,
                result.cycle,
                result.config.fingerprint(),
                serde_json::to_string(&result.config)?,
                metrics,
                serde_json::to_string(&result.artifacts)?,
                result.status.as_str(),
                result.error_message,
                result.started_at.to_rfc3339(),
                result.completed_at.to_rfc3339(),
            ],
        )?;
        let row_id = tx.last_insert_rowid();

        let hash = chunk_hash(&narrative);
        tx.execute(
            "INSERT INTO experiment_memory (experiment_id, design_id, narrative, metadata, chunk_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                result.experiment_id,
                design_id,
                narrative,
                serde_json::json!({
                    "status": result.status.as_str(),
                    "cycle": result.cycle,
                    "compression_ratio": result.config.forward_config.compression_ratio,
                })
                .to_string(),
                hash,
            ],
        )?;
        tx.commit()?;

        tracing::debug!(
            experiment_id = %result.experiment_id,
            cycle = result.cycle,
            status = result.status.as_str(),
            "Experiment persisted"
        );
        Ok(row_id)
    }

    /// Experiments persisted in this design session, any status.
    pub fn count_experiments(&self) -> Result<usize, WorldModelError> {
        let inner = self.lock()?;
        let count: i64 = inner.conn.query_row(
            "SELECT COUNT(*) FROM experiments WHERE design_id = ?1",
            params![inner.design_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// All results of this design session in persistence order.
    pub fn get_all_experiments(&self) -> Result<Vec<ExperimentResult>, WorldModelError> {
        let inner = self.lock()?;
        let mut stmt = inner.conn.prepare(
            "SELECT experiment_id, cycle, config, metrics, artifacts, status, error_message,
                    started_at, completed_at
             FROM experiments WHERE design_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![inner.design_id], |row| {
                Ok(ExperimentRow {
                    experiment_id: row.get(0)?,
                    cycle: row.get(1)?,
                    config: row.get(2)?,
                    metrics: row.get(3)?,
                    artifacts: row.get(4)?,
                    status: row.get(5)?,
                    error_message: row.get(6)?,
                    started_at: row.get(7)?,
                    completed_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(ExperimentRow::into_result).collect()
    }

    /// Whether an experiment with this configuration fingerprint exists.
    pub fn contains_fingerprint(&self, fingerprint: &str) -> Result<bool, WorldModelError> {
        let inner = self.lock()?;
        let found = inner
            .conn
            .query_row(
                "SELECT 1 FROM experiments WHERE design_id = ?1 AND fingerprint = ?2 LIMIT 1",
                params![inner.design_id, fingerprint],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ─── Pareto ──────────────────────────────────────────────────────────────

    pub fn save_pareto_front(
        &self,
        cycle: u32,
        experiment_ids: &[String],
    ) -> Result<(), WorldModelError> {
        let inner = self.lock()?;
        inner.conn.execute(
            "INSERT INTO pareto_history (design_id, cycle, experiment_ids) VALUES (?1, ?2, ?3)",
            params![inner.design_id, cycle, serde_json::to_string(experiment_ids)?],
        )?;
        Ok(())
    }

    pub fn pareto_history(&self) -> Result<Vec<(u32, Vec<String>)>, WorldModelError> {
        let inner = self.lock()?;
        let mut stmt = inner.conn.prepare(
            "SELECT cycle, experiment_ids FROM pareto_history WHERE design_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![inner.design_id], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(cycle, ids)| Ok((cycle, serde_json::from_str(&ids)?)))
            .collect()
    }

    /// Replace the stored frontier for `strata` in one transaction.
    pub fn update_pareto_frontiers(
        &self,
        strata: &str,
        entries: &[FrontierEntry],
    ) -> Result<(), WorldModelError> {
        let mut inner = self.lock()?;
        let design_id = inner.design_id;
        let tx = inner.conn.transaction()?;
        tx.execute(
            "DELETE FROM pareto_frontiers WHERE design_id = ?1 AND strata = ?2",
            params![design_id, strata],
        )?;
        for entry in entries {
            tx.execute(
                "INSERT INTO pareto_frontiers (design_id, experiment_id, rank, strata, config, metrics)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    design_id,
                    entry.experiment_id,
                    entry.rank,
                    strata,
                    serde_json::to_string(&entry.config)?,
                    serde_json::to_string(&entry.metrics)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Frontier entries ordered by stratum then rank, optionally for one stratum.
    pub fn get_pareto_frontiers(
        &self,
        strata: Option<&str>,
    ) -> Result<Vec<FrontierEntry>, WorldModelError> {
        let inner = self.lock()?;
        let mut stmt = inner.conn.prepare(
            "SELECT experiment_id, rank, strata, config, metrics FROM pareto_frontiers
             WHERE design_id = ?1 AND (?2 IS NULL OR strata = ?2)
             ORDER BY strata, rank, id",
        )?;
        let rows = stmt
            .query_map(params![inner.design_id, strata], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(experiment_id, rank, strata, config, metrics)| {
                Ok(FrontierEntry {
                    experiment_id,
                    rank,
                    strata,
                    config: serde_json::from_str(&config)?,
                    metrics: serde_json::from_str(&metrics)?,
                })
            })
            .collect()
    }

    // ─── LLM analyses ────────────────────────────────────────────────────────

    pub fn save_llm_analysis(&self, record: &LlmAnalysisRecord) -> Result<i64, WorldModelError> {
        let mut inner = self.lock()?;
        let design_id = inner.design_id;
        let tx = inner.conn.transaction()?;
        tx.execute(
            "INSERT INTO llm_analyses (design_id, cycle, kind, prompt, raw_response, parsed, model, tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                design_id,
                record.cycle,
                record.kind,
                record.prompt,
                record.raw_response,
                record.parsed.to_string(),
                record.model,
                record.tokens as i64,
            ],
        )?;
        let analysis_id = tx.last_insert_rowid();
        for link in &record.links {
            tx.execute(
                "INSERT INTO analysis_links (analysis_id, experiment_id, role) VALUES (?1, ?2, ?3)",
                params![analysis_id, link.experiment_id, link.role],
            )?;
        }
        tx.commit()?;
        Ok(analysis_id)
    }

    /// `(kind, parsed)` of every analysis stored for `cycle`.
    pub fn llm_analyses_for_cycle(
        &self,
        cycle: u32,
    ) -> Result<Vec<(String, serde_json::Value)>, WorldModelError> {
        let inner = self.lock()?;
        let mut stmt = inner.conn.prepare(
            "SELECT kind, parsed FROM llm_analyses WHERE design_id = ?1 AND cycle = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![inner.design_id, cycle], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(kind, parsed)| Ok((kind, serde_json::from_str(&parsed)?)))
            .collect()
    }

    // ─── Summaries and retrieval ─────────────────────────────────────────────

    pub fn summarize(&self) -> Result<WorldModelSummary, WorldModelError> {
        let experiments = self.get_all_experiments()?;
        let global_summary = self.global_summary()?;
        let token_used = self.design_tokens()?;

        let successful: Vec<(&str, &Metrics)> = experiments
            .iter()
            .filter(|r| r.is_success())
            .filter_map(|r| r.metrics.as_ref().map(|m| (r.experiment_id.as_str(), m)))
            .collect();

        let psnr: Vec<f64> = successful.iter().map(|(_, m)| m.psnr).collect();
        let ssim: Vec<f64> = successful.iter().map(|(_, m)| m.ssim).collect();
        let latency: Vec<f64> = successful.iter().map(|(_, m)| m.latency).collect();
        let best_experiment_id = successful
            .iter()
            .max_by(|a, b| {
                a.1.psnr
                    .partial_cmp(&b.1.psnr)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, _)| id.to_string());

        Ok(WorldModelSummary {
            total_experiments: experiments.len(),
            successful_experiments: successful.len(),
            failed_experiments: experiments.len() - successful.len(),
            psnr_stats: Stats::of(&psnr),
            ssim_stats: Stats::of(&ssim),
            latency_stats: Stats::of(&latency),
            best_experiment_id,
            global_summary,
            token_used,
        })
    }

    /// Up to `k` distinct experiment narratives ranked by lexical relevance to
    /// `query`. Identical narratives (same `chunk_hash`) are returned once.
    pub fn retrieve_relevant_experiments(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, WorldModelError> {
        let inner = self.lock()?;
        let mut stmt = inner.conn.prepare(
            "SELECT MAX(rowid), narrative FROM experiment_memory
             WHERE design_id = ?1 GROUP BY chunk_hash",
        )?;
        let mut hits = stmt
            .query_map(params![inner.design_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(rowid, narrative)| (lexical_relevance(query, &narrative), rowid, narrative))
            .filter(|(score, _, _)| *score > 0.0)
            .collect::<Vec<_>>();

        hits.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });
        hits.truncate(k);
        Ok(hits.into_iter().map(|(_, _, narrative)| narrative).collect())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS designs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    global_summary TEXT,
    last_summary_plan_id INTEGER,
    token_used INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS plans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    design_id INTEGER NOT NULL REFERENCES designs(id),
    cycle INTEGER NOT NULL,
    summary TEXT,
    token_total_used INTEGER NOT NULL DEFAULT 0,
    token_plan_used INTEGER NOT NULL DEFAULT 0,
    token_analysis_used INTEGER NOT NULL DEFAULT 0,
    token_global_summary_used INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(design_id, cycle)
);
CREATE TABLE IF NOT EXISTS experiments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id TEXT NOT NULL,
    plan_id INTEGER NOT NULL REFERENCES plans(id),
    design_id INTEGER NOT NULL REFERENCES designs(id),
    cycle INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    config TEXT NOT NULL,
    metrics TEXT,
    artifacts TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'completed',
    error_message TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(design_id, experiment_id)
);
CREATE TABLE IF NOT EXISTS pareto_frontiers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    design_id INTEGER NOT NULL REFERENCES designs(id),
    experiment_id TEXT NOT NULL,
    rank INTEGER NOT NULL,
    strata TEXT NOT NULL,
    config TEXT NOT NULL,
    metrics TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS pareto_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    design_id INTEGER NOT NULL REFERENCES designs(id),
    cycle INTEGER NOT NULL,
    experiment_ids TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS llm_analyses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    design_id INTEGER NOT NULL REFERENCES designs(id),
    cycle INTEGER NOT NULL,
    kind TEXT NOT NULL,
    prompt TEXT NOT NULL,
    raw_response TEXT NOT NULL,
    parsed TEXT NOT NULL,
    model TEXT NOT NULL,
    tokens INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS analysis_links (
    analysis_id INTEGER NOT NULL REFERENCES llm_analyses(id),
    experiment_id TEXT NOT NULL,
    role TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS experiment_memory (
    rowid INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id TEXT NOT NULL,
    design_id INTEGER NOT NULL,
    narrative TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    chunk_hash TEXT NOT NULL,
    UNIQUE(design_id, experiment_id)
);
CREATE INDEX IF NOT EXISTS idx_plans_design ON plans(design_id);
CREATE INDEX IF NOT EXISTS idx_experiments_design ON experiments(design_id);
CREATE INDEX IF NOT EXISTS idx_experiments_fingerprint ON experiments(fingerprint);
CREATE INDEX IF NOT EXISTS idx_pareto_strata ON pareto_frontiers(strata);
CREATE INDEX IF NOT EXISTS idx_pareto_rank ON pareto_frontiers(rank);
CREATE INDEX IF NOT EXISTS idx_memory_design_hash ON experiment_memory(design_id, chunk_hash);
"#;

fn plan_id_for(conn: &Connection, design_id: i64, cycle: u32) -> Result<i64, WorldModelError> {
    conn.execute(
        "INSERT OR IGNORE INTO plans (design_id, cycle) VALUES (?1, ?2)",
        params![design_id, cycle],
    )?;
    let id = conn.query_row(
        "SELECT id FROM plans WHERE design_id = ?1 AND cycle = ?2",
        params![design_id, cycle],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn global_summary_of(conn: &Connection, design_id: i64) -> Result<Option<String>, WorldModelError> {
    let summary = conn.query_row(
        "SELECT global_summary FROM designs WHERE id = ?1",
        params![design_id],
        |row| row.get::<_, Option<String>>(0),
    )?;
    Ok(summary)
}

struct ExperimentRow {
    experiment_id: String,
    cycle: u32,
    config: String,
    metrics: Option<String>,
    artifacts: String,
    status: String,
    error_message: Option<String>,
    started_at: String,
    completed_at: String,
}

impl ExperimentRow {
    fn into_result(self) -> Result<ExperimentResult, WorldModelError> {
        let status: ExperimentStatus = self.status.parse().map_err(WorldModelError::Corrupt)?;
        let metrics: Option<Metrics> = match self.metrics {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        let artifacts: Artifacts = serde_json::from_str(&self.artifacts)?;
        Ok(ExperimentResult {
            experiment_id: self.experiment_id,
            cycle: self.cycle,
            config: serde_json::from_str(&self.config)?,
            metrics,
            artifacts,
            status,
            error_message: self.error_message,
            started_at: parse_timestamp(&self.started_at)?,
            completed_at: parse_timestamp(&self.completed_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, WorldModelError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| WorldModelError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

/// Cause-and-effect sentence describing one experiment, used for retrieval.
pub fn create_experiment_narrative(
    result: &ExperimentResult,
    thresholds: &NarrativeThresholds,
) -> String {
    let config = &result.config;
    let fc = &config.forward_config;
    let rp = &config.recon_params;
    let setup = format!(
        "{} algorithm with {} stages, {} features and {} blocks ({} activation, learning rate {:e}, \
         physics prior {}) at compression ratio {} using {} mask, sensor noise {}, \
         {}x{} at {} fps, uncertainty {}.",
        config.recon_family.as_str(),
        rp.num_stages,
        rp.num_features,
        rp.num_blocks,
        rp.activation,
        rp.learning_rate,
        if rp.use_physics_prior { "on" } else { "off" },
        fc.compression_ratio,
        fc.mask_type,
        fc.sensor_noise,
        fc.resolution[0],
        fc.resolution[1],
        fc.frame_rate,
        config.uq_scheme.as_str(),
    );

    match (&result.metrics, result.status.is_success()) {
        (Some(m), true) => {
            let quality = if m.psnr > thresholds.quality_excellent {
                "excellent"
            } else if m.psnr > thresholds.quality_good {
                "good"
            } else {
                "poor"
            };
            let speed = if m.latency < thresholds.speed_ultra_fast {
                "ultra-fast"
            } else if m.latency < thresholds.speed_fast {
                "fast"
            } else {
                "slow"
            };
            format!(
                "A {quality} quality (PSNR {:.2}dB) and {speed} speed ({:.1}ms) result. Achieved by {setup}",
                m.psnr, m.latency
            )
        }
        _ => format!(
            "A {} result ({}). Attempted with {setup}",
            result.status.as_str().replace('_', " "),
            result.error_message.as_deref().unwrap_or("no metrics"),
        ),
    }
}

/// Hex SHA-256 used for narrative dedup.
pub fn chunk_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn lexical_relevance(query: &str, content: &str) -> f64 {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return 0.0;
    }

    let content_tokens = tokenize(content);
    let overlap = query_tokens.intersection(&content_tokens).count() as f64;
    let mut score = overlap / query_tokens.len() as f64;

    let q = query.trim().to_ascii_lowercase();
    if !q.is_empty() && content.to_ascii_lowercase().contains(&q) {
        score += 0.2;
    }

    score.clamp(0.0, 1.0)
}

fn tokenize(text: &str) -> std::collections::HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{config_with, metrics, result_ok};

    fn store() -> WorldModel {
        WorldModel::open(":memory:", NarrativeThresholds::default()).unwrap()
    }

    #[test]
    fn test_save_and_reload_experiments_in_order() {
        let wm = store();
        let a = result_ok(config_with("exp_a", 8, 5), 0, metrics(30.0, 0.9, 50.0));
        let b = result_ok(config_with("exp_b", 16, 7), 0, metrics(32.0, 0.85, 60.0));
        wm.save_experiment(&a).unwrap();
        wm.save_experiment(&b).unwrap();

        let all = wm.get_all_experiments().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].experiment_id, "exp_a");
        assert_eq!(all[1].metrics.as_ref().unwrap().psnr, 32.0);
        assert_eq!(wm.count_experiments().unwrap(), 2);
    }

    #[test]
    fn test_duplicate_experiment_id_is_not_counted_twice() {
        let wm = store();
        let a = result_ok(config_with("exp_a", 8, 5), 0, metrics(30.0, 0.9, 50.0));
        let first = wm.save_experiment(&a).unwrap();
        let second = wm.save_experiment(&a).unwrap();
        assert_eq!(first, second);
        assert_eq!(wm.count_experiments().unwrap(), 1);
    }

    #[test]
    fn test_same_id_in_a_new_session_is_saved_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wm.db");
        let path = path.to_str().unwrap();
        let a = result_ok(config_with("exp_a", 8, 5), 0, metrics(30.0, 0.9, 50.0));

        let first = WorldModel::open(path, NarrativeThresholds::default()).unwrap();
        first.save_experiment(&a).unwrap();
        drop(first);

        let second = WorldModel::open(path, NarrativeThresholds::default()).unwrap();
        second.save_experiment(&a).unwrap();
        assert_eq!(second.count_experiments().unwrap(), 1);
        assert_eq!(second.get_all_experiments().unwrap()[0].experiment_id, "exp_a");
    }

    #[test]
    fn test_memory_keeps_failures_that_differ_only_in_blocks() {
        let wm = store();
        let mut a = config_with("exp_a", 8, 5);
        a.recon_params.num_blocks = 2;
        let mut b = config_with("exp_b", 8, 5);
        b.recon_params.num_blocks = 4;
        for config in [a, b] {
            wm.save_experiment(&ExperimentResult::failed(
                config,
                0,
                ExperimentStatus::TimedOut,
                "timeout",
                Utc::now(),
            ))
            .unwrap();
        }

        let rows: i64 = {
            let inner = wm.lock().unwrap();
            inner
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM experiment_memory WHERE design_id = ?1",
                    params![wm.design_id()],
                    |row| row.get(0),
                )
                .unwrap()
        };
        assert_eq!(rows, 2);

        let hits = wm.retrieve_relevant_experiments("timed out blocks", 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().any(|n| n.contains("2 blocks")));
        assert!(hits.iter().any(|n| n.contains("4 blocks")));
    }

    #[test]
    fn test_identical_narratives_are_retrieved_once() {
        let wm = store();
        for id in ["exp_a", "exp_b"] {
            wm.save_experiment(&ExperimentResult::failed(
                config_with(id, 8, 5),
                0,
                ExperimentStatus::Failed,
                "boom",
                Utc::now(),
            ))
            .unwrap();
        }

        let hits = wm.retrieve_relevant_experiments("failed boom", 5).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_failed_experiment_roundtrips_without_metrics() {
        let wm = store();
        let failed = ExperimentResult::failed(
            config_with("exp_f", 24, 9),
            1,
            ExperimentStatus::TimedOut,
            "deadline exceeded",
            Utc::now(),
        );
        wm.save_experiment(&failed).unwrap();

        let all = wm.get_all_experiments().unwrap();
        assert_eq!(all[0].status, ExperimentStatus::TimedOut);
        assert!(all[0].metrics.is_none());
        assert_eq!(all[0].error_message.as_deref(), Some("deadline exceeded"));
    }

    #[test]
    fn test_contains_fingerprint() {
        let wm = store();
        let cfg = config_with("exp_a", 8, 5);
        let fp = cfg.fingerprint();
        assert!(!wm.contains_fingerprint(&fp).unwrap());
        wm.save_experiment(&result_ok(cfg, 0, metrics(30.0, 0.9, 50.0)))
            .unwrap();
        assert!(wm.contains_fingerprint(&fp).unwrap());
    }

    #[test]
    fn test_sessions_are_isolated_in_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wm.db");
        let path = path.to_str().unwrap();

        let first = WorldModel::open(path, NarrativeThresholds::default()).unwrap();
        first
            .save_experiment(&result_ok(config_with("exp_a", 8, 5), 0, metrics(30.0, 0.9, 50.0)))
            .unwrap();
        drop(first);

        let second = WorldModel::open(path, NarrativeThresholds::default()).unwrap();
        assert_eq!(second.count_experiments().unwrap(), 0);
        assert!(second.design_id() > 1);
    }

    #[test]
    fn test_record_tokens_accumulates_per_kind() {
        let wm = store();
        wm.record_tokens(1, TokenKind::Plan, 100).unwrap();
        wm.record_tokens(1, TokenKind::Plan, 50).unwrap();
        wm.record_tokens(1, TokenKind::Analysis, 30).unwrap();
        wm.record_tokens(2, TokenKind::GlobalSummary, 7).unwrap();

        let tokens = wm.plan_tokens(1).unwrap();
        assert_eq!(
            tokens,
            PlanTokens {
                total: 180,
                plan: 150,
                analysis: 30,
                global_summary: 0
            }
        );
        assert_eq!(wm.design_tokens().unwrap(), 187);
    }

    #[test]
    fn test_plan_for_cycle_is_get_or_create() {
        let wm = store();
        let a = wm.plan_for_cycle(3).unwrap();
        let b = wm.plan_for_cycle(3).unwrap();
        let c = wm.plan_for_cycle(4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_update_pareto_frontiers_replaces_stratum() {
        let wm = store();
        let entry = |id: &str, rank| FrontierEntry {
            experiment_id: id.to_string(),
            rank,
            strata: "cr=8".to_string(),
            config: config_with(id, 8, 5),
            metrics: metrics(30.0, 0.9, 50.0),
        };
        wm.update_pareto_frontiers("cr=8", &[entry("a", 0), entry("b", 1)])
            .unwrap();
        wm.update_pareto_frontiers("all", &[entry("a", 0)]).unwrap();
        wm.update_pareto_frontiers("cr=8", &[entry("c", 0)]).unwrap();

        let cr8 = wm.get_pareto_frontiers(Some("cr=8")).unwrap();
        assert_eq!(cr8.len(), 1);
        assert_eq!(cr8[0].experiment_id, "c");
        assert_eq!(wm.get_pareto_frontiers(None).unwrap().len(), 2);
    }

    #[test]
    fn test_llm_analysis_and_summaries() {
        let wm = store();
        wm.save_llm_analysis(&LlmAnalysisRecord {
            cycle: 1,
            kind: "trends".to_string(),
            prompt: "p".to_string(),
            raw_response: "{}".to_string(),
            parsed: serde_json::json!({"key_findings": []}),
            model: "offline".to_string(),
            tokens: 12,
            links: vec![AnalysisLink {
                experiment_id: "exp_a".to_string(),
                role: "pareto".to_string(),
            }],
        })
        .unwrap();
        let analyses = wm.llm_analyses_for_cycle(1).unwrap();
        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].0, "trends");

        wm.update_plan_summary(1, "cycle one").unwrap();
        wm.update_global_summary("overall").unwrap();
        assert_eq!(wm.plan_summary(1).unwrap().as_deref(), Some("cycle one"));
        assert_eq!(wm.global_summary().unwrap().as_deref(), Some("overall"));
    }

    #[test]
    fn test_summarize_stats() {
        let wm = store();
        wm.save_experiment(&result_ok(config_with("a", 8, 5), 0, metrics(30.0, 0.9, 50.0)))
            .unwrap();
        wm.save_experiment(&result_ok(config_with("b", 16, 7), 0, metrics(34.0, 0.8, 70.0)))
            .unwrap();
        wm.save_experiment(&ExperimentResult::failed(
            config_with("c", 24, 9),
            0,
            ExperimentStatus::Failed,
            "boom",
            Utc::now(),
        ))
        .unwrap();

        let summary = wm.summarize().unwrap();
        assert_eq!(summary.total_experiments, 3);
        assert_eq!(summary.successful_experiments, 2);
        assert_eq!(summary.failed_experiments, 1);
        assert_eq!(summary.psnr_stats.max, 34.0);
        assert_eq!(summary.psnr_stats.min, 30.0);
        assert_eq!(summary.latency_stats.mean, 60.0);
        assert_eq!(summary.best_experiment_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_narrative_adjectives() {
        let thresholds = NarrativeThresholds::default();
        let r = result_ok(config_with("a", 16, 7), 0, metrics(33.1, 0.9, 15.0));
        let narrative = create_experiment_narrative(&r, &thresholds);
        assert!(narrative.starts_with(
            "A excellent quality (PSNR 33.10dB) and ultra-fast speed (15.0ms) result."
        ));
        assert!(narrative.contains("compression ratio 16 using random mask"));
        assert!(narrative.contains("3 blocks (ReLU activation, learning rate 1e-4"));
        assert!(narrative.contains("uncertainty None."));
    }

    #[test]
    fn test_retrieve_relevant_experiments_ranks_by_overlap() {
        let wm = store();
        wm.save_experiment(&result_ok(config_with("a", 8, 5), 0, metrics(25.0, 0.7, 90.0)))
            .unwrap();
        wm.save_experiment(&result_ok(config_with("b", 16, 7), 0, metrics(33.0, 0.9, 10.0)))
            .unwrap();

        let hits = wm
            .retrieve_relevant_experiments("excellent ultra-fast", 5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].contains("excellent"));

        assert!(wm.retrieve_relevant_experiments("", 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocking_runs_off_runtime() {
        let wm = store();
        let count = wm
            .blocking(|wm| {
                wm.save_experiment(&result_ok(config_with("a", 8, 5), 0, metrics(30.0, 0.9, 50.0)))?;
                wm.count_experiments()
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
