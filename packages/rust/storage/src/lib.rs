//! libSQL storage layer for IdeaForge (embedded, offline).
//!
//! The [`Storage`] struct wraps a libSQL database holding batches and their
//! stage checkpoints, idea candidates, append-only score and validation
//! history, the validation cache, the persisted budget ledger, and usage
//! events.
//!
//! **Access rules:**
//! - Pipeline and CLI commands that mutate state: read-write via [`Storage::open`]
//! - Reporting commands: read-only via [`Storage::open_readonly`]
//!
//! Writes are serialized through one async lock so multi-statement
//! transactions never interleave with writes from concurrent tasks.

mod migrations;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Value, params, params_from_iter};
use tokio::sync::Mutex;

use ideaforge_shared::{
    BatchId, BatchRecord, BatchStage, BatchStatus, IdeaCandidate, IdeaForgeError, IdeaId,
    IdeaStatus, LedgerSnapshot, Result, ScoreBreakdown, ValidationRecord, ValidationTask,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_lock: Mutex<()>,
}

// ---------------------------------------------------------------------------
// Query and result types
// ---------------------------------------------------------------------------

/// Filter for ranked idea listings.
#[derive(Debug, Clone, Default)]
pub struct IdeaQuery {
    pub status: Option<IdeaStatus>,
    pub batch_id: Option<BatchId>,
    /// Only ideas whose latest composite is at least this value.
    pub min_score: Option<f64>,
    pub limit: Option<u32>,
}

/// An idea with its latest ranking fields.
#[derive(Debug, Clone)]
pub struct RankedIdea {
    pub idea: IdeaCandidate,
    /// Latest composite, `None` before the first scoring.
    pub composite: Option<f64>,
    pub synthesis_degree: Option<f64>,
    pub score_version: Option<u32>,
}

/// A live validation-cache entry.
#[derive(Debug, Clone)]
pub struct CachedValidation {
    pub payload_json: String,
    pub expires_at: DateTime<Utc>,
}

/// One paid provider call.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub provider: String,
    pub period: String,
    pub batch_id: Option<BatchId>,
    /// What the call was for, e.g. `synthesis` or `novelty_check`.
    pub kind: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

/// Aggregated usage for one provider in one period.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageTotal {
    pub provider: String,
    pub calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IdeaForgeError::io(parent, e))?;
        }

        let storage = Self::connect(path, false).await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(IdeaForgeError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }
        Self::connect(path, true).await
    }

    async fn connect(path: &Path, readonly: bool) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;
        Ok(Self {
            db,
            conn,
            readonly,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    IdeaForgeError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(IdeaForgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Batches and checkpoints
    // -----------------------------------------------------------------------

    pub async fn insert_batch(&self, batch: &BatchRecord) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let paper_ids = to_json(&batch.paper_ids)?;
        self.conn
            .execute(
                "INSERT INTO batches (id, domain, paper_ids_json, status, stage, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    batch.id.to_string(),
                    batch.domain.as_str(),
                    paper_ids,
                    batch.status.as_str(),
                    batch.stage.map(|s| s.as_str()),
                    batch.error.as_deref(),
                    ts(batch.created_at),
                    ts(batch.updated_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_batch(&self, id: BatchId) -> Result<Option<BatchRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, domain, paper_ids_json, status, stage, error, created_at, updated_at
                 FROM batches WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_batch(&row)?)),
            None => Ok(None),
        }
    }

    /// List batches, newest first, optionally filtered by status.
    pub async fn list_batches(&self, status: Option<BatchStatus>) -> Result<Vec<BatchRecord>> {
        let mut rows = match status {
            Some(status) => {
                self.conn
                    .query(
                        "SELECT id, domain, paper_ids_json, status, stage, error, created_at, updated_at
                         FROM batches WHERE status = ?1 ORDER BY created_at DESC",
                        params![status.as_str()],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        "SELECT id, domain, paper_ids_json, status, stage, error, created_at, updated_at
                         FROM batches ORDER BY created_at DESC",
                        params![],
                    )
                    .await
            }
        }
        .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_batch(&row)?);
        }
        Ok(results)
    }

    /// Set batch status. `error` replaces any previous error text.
    pub async fn update_batch_status(
        &self,
        id: BatchId,
        status: BatchStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE batches SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), error, ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Err(IdeaForgeError::validation(format!("unknown batch {id}")));
        }
        Ok(())
    }

    /// Persist a stage payload and advance the batch's last completed stage.
    pub async fn save_checkpoint(
        &self,
        batch_id: BatchId,
        stage: BatchStage,
        payload_json: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        write_checkpoint(&tx, batch_id, stage, payload_json).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Payload stored for a completed stage, if any.
    pub async fn load_checkpoint(
        &self,
        batch_id: BatchId,
        stage: BatchStage,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload_json FROM batch_checkpoints WHERE batch_id = ?1 AND stage = ?2",
                params![batch_id.to_string(), stage.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<String>(0).ok()),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Ideas
    // -----------------------------------------------------------------------

    /// Insert a batch's filtered ideas and mark the FILTERED checkpoint, atomically.
    pub async fn store_filtered_ideas(
        &self,
        batch_id: BatchId,
        ideas: &[IdeaCandidate],
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        for idea in ideas {
            insert_idea(&tx, idea).await?;
        }
        write_checkpoint(&tx, batch_id, BatchStage::Filtered, None).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Insert a single idea outside any batch checkpoint.
    pub async fn insert_idea(&self, idea: &IdeaCandidate) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        insert_idea(&self.conn, idea).await
    }

    pub async fn get_idea(&self, id: IdeaId) -> Result<Option<IdeaCandidate>> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload_json, status FROM ideas WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_idea(&row, 0)?)),
            None => Ok(None),
        }
    }

    /// The idea that absorbed `alias_id` during deduplication, if any.
    pub async fn resolve_alias(&self, alias_id: IdeaId) -> Result<Option<IdeaId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT idea_id FROM idea_aliases WHERE alias_id = ?1",
                params![alias_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let id: String = row.get(0).map_err(db_err)?;
                Ok(Some(parse_idea_id(&id)?))
            }
            None => Ok(None),
        }
    }

    /// All ideas of a batch, in creation order.
    pub async fn list_batch_ideas(&self, batch_id: BatchId) -> Result<Vec<IdeaCandidate>> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload_json, status FROM ideas WHERE batch_id = ?1 ORDER BY created_at, id",
                params![batch_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_idea(&row, 0)?);
        }
        Ok(results)
    }

    /// Ideas by rank: latest composite desc, synthesis degree desc, creation asc.
    /// Unscored ideas sort last.
    pub async fn list_ideas(&self, query: &IdeaQuery) -> Result<Vec<RankedIdea>> {
        let mut sql = String::from(
            "SELECT payload_json, status, composite, synthesis_degree, score_version FROM ideas WHERE 1 = 1",
        );
        let mut args: Vec<Value> = Vec::new();

        if let Some(status) = query.status {
            args.push(Value::Text(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(batch_id) = query.batch_id {
            args.push(Value::Text(batch_id.to_string()));
            sql.push_str(&format!(" AND batch_id = ?{}", args.len()));
        }
        if let Some(min) = query.min_score {
            args.push(Value::Real(min));
            sql.push_str(&format!(" AND composite >= ?{}", args.len()));
        }
        sql.push_str(
            " ORDER BY composite IS NULL, composite DESC, synthesis_degree DESC, created_at ASC, id ASC",
        );
        if let Some(limit) = query.limit {
            args.push(Value::Integer(i64::from(limit)));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let mut rows = self
            .conn
            .query(&sql, params_from_iter(args))
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(RankedIdea {
                idea: row_to_idea(&row, 0)?,
                composite: row.get::<f64>(2).ok(),
                synthesis_degree: row.get::<f64>(3).ok(),
                score_version: row.get::<u32>(4).ok(),
            });
        }
        Ok(results)
    }

    pub async fn update_idea_status(&self, id: IdeaId, status: IdeaStatus) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE ideas SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Err(IdeaForgeError::validation(format!("unknown idea {id}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Score history (append-only)
    // -----------------------------------------------------------------------

    /// Append a new score version. The store assigns `max(version) + 1`.
    pub async fn append_score_version(&self, breakdown: &ScoreBreakdown) -> Result<u32> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        let version = append_score(&tx, breakdown).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(version)
    }

    /// Append one version per breakdown and mark the SCORED checkpoint, atomically.
    pub async fn record_batch_scores(
        &self,
        batch_id: BatchId,
        breakdowns: &[ScoreBreakdown],
    ) -> Result<Vec<ScoreBreakdown>> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        let mut stored = Vec::with_capacity(breakdowns.len());
        for breakdown in breakdowns {
            let version = append_score(&tx, breakdown).await?;
            stored.push(ScoreBreakdown {
                version,
                ..breakdown.clone()
            });
        }
        write_checkpoint(&tx, batch_id, BatchStage::Scored, None).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(stored)
    }

    pub async fn latest_score(&self, idea_id: IdeaId) -> Result<Option<ScoreBreakdown>> {
        let mut rows = self
            .conn
            .query(
                "SELECT breakdown_json, version FROM score_breakdowns
                 WHERE idea_id = ?1 ORDER BY version DESC LIMIT 1",
                params![idea_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_breakdown(&row)?)),
            None => Ok(None),
        }
    }

    /// Every version of an idea's score, oldest first.
    pub async fn score_history(&self, idea_id: IdeaId) -> Result<Vec<ScoreBreakdown>> {
        let mut rows = self
            .conn
            .query(
                "SELECT breakdown_json, version FROM score_breakdowns
                 WHERE idea_id = ?1 ORDER BY version ASC",
                params![idea_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_breakdown(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Validation records (append-only) and cache
    // -----------------------------------------------------------------------

    pub async fn append_validation(&self, record: &ValidationRecord) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let json = to_json(record)?;
        self.conn
            .execute(
                "INSERT INTO validation_records (idea_id, task, verdict, confidence, record_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.idea_id.to_string(),
                    record.task.as_str(),
                    record.verdict.as_str(),
                    record.confidence,
                    json,
                    ts(record.created_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Validation history of an idea, oldest first.
    pub async fn validation_records(&self, idea_id: IdeaId) -> Result<Vec<ValidationRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM validation_records WHERE idea_id = ?1 ORDER BY id ASC",
                params![idea_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let json: String = row.get(0).map_err(db_err)?;
            results.push(from_json(&json)?);
        }
        Ok(results)
    }

    /// Unexpired cache entry for `(key, task)` as of `now`.
    pub async fn get_cached_validation(
        &self,
        cache_key: &str,
        task: ValidationTask,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedValidation>> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload_json, expires_at FROM validation_cache
                 WHERE cache_key = ?1 AND task = ?2",
                params![cache_key, task.as_str()],
            )
            .await
            .map_err(db_err)?;

        let Some(row) = rows.next().await.map_err(db_err)? else {
            return Ok(None);
        };
        let expires_at = parse_ts(&row.get::<String>(1).map_err(db_err)?)?;
        if expires_at <= now {
            return Ok(None);
        }
        Ok(Some(CachedValidation {
            payload_json: row.get(0).map_err(db_err)?,
            expires_at,
        }))
    }

    /// Store (or replace) a cache entry.
    pub async fn put_cached_validation(
        &self,
        cache_key: &str,
        task: ValidationTask,
        payload_json: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO validation_cache (cache_key, task, payload_json, expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(cache_key, task) DO UPDATE SET
                   payload_json = excluded.payload_json,
                   expires_at = excluded.expires_at,
                   updated_at = excluded.updated_at",
                params![cache_key, task.as_str(), payload_json, ts(expires_at), ts(Utc::now())],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Extend a cache entry's expiry without touching its payload.
    pub async fn touch_cached_validation(
        &self,
        cache_key: &str,
        task: ValidationTask,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "UPDATE validation_cache SET expires_at = ?1, updated_at = ?2
                 WHERE cache_key = ?3 AND task = ?4",
                params![ts(expires_at), ts(Utc::now()), cache_key, task.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Budget ledger and usage
    // -----------------------------------------------------------------------

    /// Persisted spend for `(provider, period)`. Reservations are never persisted.
    pub async fn load_ledger(&self, provider: &str, period: &str) -> Result<Option<LedgerSnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT provider, period, cap, spent FROM budget_ledger
                 WHERE provider = ?1 AND period = ?2",
                params![provider, period],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_ledger(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn upsert_ledger(&self, provider: &str, period: &str, cap: f64, spent: f64) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO budget_ledger (provider, period, cap, spent, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(provider, period) DO UPDATE SET
                   cap = excluded.cap,
                   spent = excluded.spent,
                   updated_at = excluded.updated_at",
                params![provider, period, cap, spent, ts(Utc::now())],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// All persisted ledger rows for a period, by provider.
    pub async fn list_ledger(&self, period: &str) -> Result<Vec<LedgerSnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT provider, period, cap, spent FROM budget_ledger
                 WHERE period = ?1 ORDER BY provider",
                params![period],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_ledger(&row)?);
        }
        Ok(results)
    }

    pub async fn record_usage(&self, event: &UsageEvent) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO usage_events (provider, period, batch_id, kind, tokens_in, tokens_out, cost, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.provider.as_str(),
                    event.period.as_str(),
                    event.batch_id.map(|b| b.to_string()),
                    event.kind.as_str(),
                    event.tokens_in as i64,
                    event.tokens_out as i64,
                    event.cost,
                    ts(event.created_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Per-provider totals of recorded usage in a period.
    pub async fn usage_totals(&self, period: &str) -> Result<Vec<UsageTotal>> {
        let mut rows = self
            .conn
            .query(
                "SELECT provider, COUNT(*), SUM(tokens_in), SUM(tokens_out), SUM(cost)
                 FROM usage_events WHERE period = ?1
                 GROUP BY provider ORDER BY provider",
                params![period],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(UsageTotal {
                provider: row.get(0).map_err(db_err)?,
                calls: row.get::<i64>(1).map_err(db_err)? as u64,
                tokens_in: row.get::<i64>(2).unwrap_or(0) as u64,
                tokens_out: row.get::<i64>(3).unwrap_or(0) as u64,
                cost: row.get::<f64>(4).unwrap_or(0.0),
            });
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Statement helpers shared by single writes and transactions
// ---------------------------------------------------------------------------

async fn write_checkpoint(
    conn: &Connection,
    batch_id: BatchId,
    stage: BatchStage,
    payload_json: Option<&str>,
) -> Result<()> {
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO batch_checkpoints (batch_id, stage, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(batch_id, stage) DO UPDATE SET
           payload_json = excluded.payload_json,
           created_at = excluded.created_at",
        params![batch_id.to_string(), stage.as_str(), payload_json, now.as_str()],
    )
    .await
    .map_err(db_err)?;

    let changed = conn
        .execute(
            "UPDATE batches SET stage = ?1, updated_at = ?2 WHERE id = ?3",
            params![stage.as_str(), now.as_str(), batch_id.to_string()],
        )
        .await
        .map_err(db_err)?;
    if changed == 0 {
        return Err(IdeaForgeError::validation(format!("unknown batch {batch_id}")));
    }
    Ok(())
}

async fn insert_idea(conn: &Connection, idea: &IdeaCandidate) -> Result<()> {
    let payload = to_json(idea)?;
    let created = ts(idea.created_at);
    conn.execute(
        "INSERT INTO ideas (id, batch_id, title, status, payload_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            idea.id.to_string(),
            idea.batch_id.to_string(),
            idea.title.as_str(),
            idea.status.as_str(),
            payload,
            created.as_str(),
            created.as_str(),
        ],
    )
    .await
    .map_err(db_err)?;

    for alias in &idea.aliases {
        conn.execute(
            "INSERT INTO idea_aliases (alias_id, idea_id) VALUES (?1, ?2)
             ON CONFLICT(alias_id) DO UPDATE SET idea_id = excluded.idea_id",
            params![alias.to_string(), idea.id.to_string()],
        )
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

async fn append_score(conn: &Connection, breakdown: &ScoreBreakdown) -> Result<u32> {
    let json = to_json(breakdown)?;
    let idea_id = breakdown.idea_id.to_string();
    let mut rows = conn
        .query(
            "INSERT INTO score_breakdowns (idea_id, version, composite, breakdown_json, scored_at)
             SELECT ?1, COALESCE(MAX(version), 0) + 1, ?2, ?3, ?4
             FROM score_breakdowns WHERE idea_id = ?1
             RETURNING version",
            params![
                idea_id.as_str(),
                breakdown.composite,
                json,
                ts(breakdown.scored_at)
            ],
        )
        .await
        .map_err(db_err)?;

    let version = match rows.next().await.map_err(db_err)? {
        Some(row) => row.get::<u32>(0).map_err(db_err)?,
        None => {
            return Err(IdeaForgeError::Storage(
                "score insert returned no version".into(),
            ));
        }
    };
    drop(rows);

    let changed = conn
        .execute(
            "UPDATE ideas SET composite = ?1, synthesis_degree = ?2, score_version = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                breakdown.composite,
                breakdown.components.synthesis_degree,
                version,
                ts(Utc::now()),
                idea_id.as_str(),
            ],
        )
        .await
        .map_err(db_err)?;
    if changed == 0 {
        return Err(IdeaForgeError::validation(format!(
            "unknown idea {}",
            breakdown.idea_id
        )));
    }
    Ok(version)
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> IdeaForgeError {
    IdeaForgeError::Storage(e.to_string())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| IdeaForgeError::Storage(format!("encode: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| IdeaForgeError::Storage(format!("decode: {e}")))
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IdeaForgeError::Storage(format!("invalid date '{s}': {e}")))
}

fn parse_idea_id(s: &str) -> Result<IdeaId> {
    IdeaId::from_str(s).map_err(|e| IdeaForgeError::Storage(format!("invalid idea id '{s}': {e}")))
}

fn row_to_batch(row: &libsql::Row) -> Result<BatchRecord> {
    let id: String = row.get(0).map_err(db_err)?;
    let paper_ids: String = row.get(2).map_err(db_err)?;
    let status: String = row.get(3).map_err(db_err)?;
    Ok(BatchRecord {
        id: BatchId::from_str(&id)
            .map_err(|e| IdeaForgeError::Storage(format!("invalid batch id '{id}': {e}")))?,
        domain: row.get(1).map_err(db_err)?,
        paper_ids: from_json(&paper_ids)?,
        status: status.parse()?,
        stage: row
            .get::<String>(4)
            .ok()
            .map(|s| s.parse::<BatchStage>())
            .transpose()?,
        error: row.get::<String>(5).ok(),
        created_at: parse_ts(&row.get::<String>(6).map_err(db_err)?)?,
        updated_at: parse_ts(&row.get::<String>(7).map_err(db_err)?)?,
    })
}

/// Decode `(payload_json, status)` starting at column `offset`.
/// The status column is authoritative over the payload copy.
fn row_to_idea(row: &libsql::Row, offset: i32) -> Result<IdeaCandidate> {
    let payload: String = row.get(offset).map_err(db_err)?;
    let status: String = row.get(offset + 1).map_err(db_err)?;
    let mut idea: IdeaCandidate = from_json(&payload)?;
    idea.status = status.parse()?;
    Ok(idea)
}

fn row_to_breakdown(row: &libsql::Row) -> Result<ScoreBreakdown> {
    let json: String = row.get(0).map_err(db_err)?;
    let mut breakdown: ScoreBreakdown = from_json(&json)?;
    breakdown.version = row.get::<u32>(1).map_err(db_err)?;
    Ok(breakdown)
}

fn row_to_ledger(row: &libsql::Row) -> Result<LedgerSnapshot> {
    Ok(LedgerSnapshot {
        provider: row.get(0).map_err(db_err)?,
        period: row.get(1).map_err(db_err)?,
        cap: row.get(2).map_err(db_err)?,
        reserved: 0.0,
        spent: row.get(3).map_err(db_err)?,
    })
}
