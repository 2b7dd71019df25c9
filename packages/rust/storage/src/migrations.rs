//! SQL migration definitions for the IdeaForge database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: batches, checkpoints, ideas, scores, validations",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS batches (
    id             TEXT PRIMARY KEY,
    domain         TEXT NOT NULL,
    paper_ids_json TEXT NOT NULL,
    status         TEXT NOT NULL,
    stage          TEXT,
    error          TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status);

-- One payload per completed stage, so resume never repeats finished work
CREATE TABLE IF NOT EXISTS batch_checkpoints (
    batch_id     TEXT NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    stage        TEXT NOT NULL,
    payload_json TEXT,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (batch_id, stage)
);

CREATE TABLE IF NOT EXISTS ideas (
    id               TEXT PRIMARY KEY,
    batch_id         TEXT NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    title            TEXT NOT NULL,
    status           TEXT NOT NULL,
    composite        REAL,
    synthesis_degree REAL,
    score_version    INTEGER,
    payload_json     TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ideas_batch ON ideas(batch_id);
CREATE INDEX IF NOT EXISTS idx_ideas_rank ON ideas(composite DESC, synthesis_degree DESC, created_at);

-- Collapsed near-duplicates point at the record that absorbed them
CREATE TABLE IF NOT EXISTS idea_aliases (
    alias_id TEXT PRIMARY KEY,
    idea_id  TEXT NOT NULL REFERENCES ideas(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_idea_aliases_idea ON idea_aliases(idea_id);

-- Append-only score history
CREATE TABLE IF NOT EXISTS score_breakdowns (
    idea_id        TEXT NOT NULL REFERENCES ideas(id) ON DELETE CASCADE,
    version        INTEGER NOT NULL,
    composite      REAL NOT NULL,
    breakdown_json TEXT NOT NULL,
    scored_at      TEXT NOT NULL,
    PRIMARY KEY (idea_id, version)
);

-- Append-only validation history
CREATE TABLE IF NOT EXISTS validation_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    idea_id     TEXT NOT NULL REFERENCES ideas(id) ON DELETE CASCADE,
    task        TEXT NOT NULL,
    verdict     TEXT NOT NULL,
    confidence  REAL NOT NULL,
    record_json TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_validation_records_idea ON validation_records(idea_id);

CREATE TABLE IF NOT EXISTS validation_cache (
    cache_key    TEXT NOT NULL,
    task         TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    expires_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    PRIMARY KEY (cache_key, task)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Budget ledger and usage events",
            sql: r#"
CREATE TABLE IF NOT EXISTS budget_ledger (
    provider   TEXT NOT NULL,
    period     TEXT NOT NULL,
    cap        REAL NOT NULL,
    spent      REAL NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (provider, period)
);

CREATE TABLE IF NOT EXISTS usage_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    provider   TEXT NOT NULL,
    period     TEXT NOT NULL,
    batch_id   TEXT,
    kind       TEXT NOT NULL,
    tokens_in  INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    cost       REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usage_events_period ON usage_events(period, provider);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
