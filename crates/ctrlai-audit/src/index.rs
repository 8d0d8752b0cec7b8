//! SQLite query index over the audit log.
//!
//! The JSONL files are the source of truth; this index is a queryable
//! projection that can be rebuilt from them at any time. Insert failures
//! are logged and never affect the primary append.

use crate::chain::AuditEntry;
use crate::log::QueryParams;
use ctrlai_core::{CtrlAiError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::error;

// WAL mode for concurrent read/write: the proxy appends while queries run.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS entries (
        seq        INTEGER PRIMARY KEY,
        ts         TEXT NOT NULL,
        agent      TEXT NOT NULL DEFAULT '',
        provider   TEXT NOT NULL DEFAULT '',
        model      TEXT NOT NULL DEFAULT '',
        type       TEXT NOT NULL DEFAULT '',
        tool       TEXT NOT NULL DEFAULT '',
        arguments  TEXT NOT NULL DEFAULT '',
        decision   TEXT NOT NULL DEFAULT '',
        rule       TEXT NOT NULL DEFAULT '',
        latency_us INTEGER NOT NULL DEFAULT 0,
        hash       TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_entries_agent ON entries(agent)",
    "CREATE INDEX IF NOT EXISTS idx_entries_decision ON entries(decision)",
    "CREATE INDEX IF NOT EXISTS idx_entries_ts ON entries(ts)",
    "CREATE INDEX IF NOT EXISTS idx_entries_type ON entries(type)",
];

pub(crate) struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Open (or create) the index database and ensure the schema exists.
    pub(crate) async fn open(path: &Path) -> Result<SqliteIndex> {
        let connect_opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(connect_opts)
            .await
            .map_err(|e| {
                CtrlAiError::Audit(format!("opening sqlite index {}: {e}", path.display()))
            })?;

        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| CtrlAiError::Audit(format!("creating sqlite schema: {e}")))?;
        }

        Ok(SqliteIndex { pool })
    }

    /// Insert an entry. Best-effort: errors are logged and swallowed so
    /// index trouble never rolls back the primary JSONL append.
    pub(crate) async fn insert(&self, entry: &AuditEntry) {
        let arguments = entry
            .arguments
            .as_ref()
            .and_then(|v| serde_json::to_string(v).ok())
            .unwrap_or_default();

        let result = sqlx::query(
            "INSERT OR REPLACE INTO entries \
             (seq, ts, agent, provider, model, type, tool, arguments, decision, rule, latency_us, hash) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.seq as i64)
        .bind(&entry.timestamp)
        .bind(&entry.agent)
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(&entry.kind)
        .bind(&entry.tool)
        .bind(arguments)
        .bind(&entry.decision)
        .bind(&entry.rule)
        .bind(entry.latency_us)
        .bind(&entry.hash)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            error!(seq = entry.seq, error = %e, "sqlite index insert failed");
        }
    }

    /// Query entries matching the given params. `since` must already be
    /// resolved to an RFC 3339 timestamp by the caller.
    pub(crate) async fn query(&self, params: &QueryParams) -> Result<Vec<AuditEntry>> {
        let mut sql = String::from(
            "SELECT seq, ts, agent, provider, model, type, tool, arguments, decision, rule, \
             latency_us, hash FROM entries WHERE 1=1",
        );
        let mut binds: Vec<String> = Vec::new();

        if let Some(agent) = &params.agent {
            sql.push_str(" AND agent = ?");
            binds.push(agent.clone());
        }
        if let Some(decision) = &params.decision {
            sql.push_str(" AND decision = ?");
            binds.push(decision.clone());
        }
        if let Some(since) = &params.since {
            sql.push_str(" AND ts >= ?");
            binds.push(since.clone());
        }

        sql.push_str(" ORDER BY seq DESC");
        if let Some(limit) = params.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind.as_str());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CtrlAiError::Audit(format!("querying sqlite index: {e}")))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let arguments_json: String = row.get("arguments");
            let arguments = if arguments_json.is_empty() || arguments_json == "null" {
                None
            } else {
                serde_json::from_str(&arguments_json).ok()
            };
            entries.push(AuditEntry {
                seq: row.get::<i64, _>("seq") as u64,
                timestamp: row.get("ts"),
                agent: row.get("agent"),
                provider: row.get("provider"),
                model: row.get("model"),
                kind: row.get("type"),
                tool: row.get("tool"),
                arguments,
                decision: row.get("decision"),
                rule: row.get("rule"),
                message: String::new(),
                latency_us: row.get("latency_us"),
                prev_hash: String::new(),
                hash: row.get("hash"),
            });
        }
        Ok(entries)
    }

    /// The highest sequence number present, or 0 when empty.
    pub(crate) async fn last_seq(&self) -> u64 {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) FROM entries")
            .fetch_one(&self.pool)
            .await;
        match row {
            Ok(row) => row.get::<i64, _>(0) as u64,
            Err(e) => {
                error!(error = %e, "sqlite index max(seq) failed");
                0
            }
        }
    }

    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }
}
