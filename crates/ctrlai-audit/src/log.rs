//! The append-only audit log: daily JSONL files, a genesis chain root,
//! fsync'd appends, recovery, queries, follow, verification, and export.
//!
//! Storage layout:
//!
//! ```text
//! <state-dir>/audit/
//! ├── genesis.json        # chain root (seq 0)
//! ├── 2026-02-10.jsonl    # one file per UTC day, append-only
//! └── index.db            # SQLite query index (rebuildable projection)
//! ```

use crate::chain::{
    compute_hash, verify_entries, AuditEntry, VerifyResult, GENESIS_PREV_HASH, KIND_KILL,
    KIND_LIFECYCLE, KIND_TOOL_CALL,
};
use crate::index::SqliteIndex;
use chrono::{SecondsFormat, Utc};
use ctrlai_core::{CtrlAiError, Decision, Result};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Filters for querying the audit log. Unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    /// Agent ID, exact match.
    pub agent: Option<String>,
    /// Decision: `allow` or `block`.
    pub decision: Option<String>,
    /// RFC 3339 timestamp, or a duration string (`1h`, `30m`, `24h`)
    /// resolved against now.
    pub since: Option<String>,
    /// Maximum entries to return (newest first).
    pub limit: Option<usize>,
}

/// Mutable chain state, guarded by the append lock.
struct ChainState {
    /// Sequence number of the last committed entry.
    seq: u64,
    /// Hash of the last committed entry.
    last_hash: String,
    /// Currently open daily file.
    file: Option<File>,
    /// Date (YYYY-MM-DD) of the open file.
    file_date: String,
}

/// The hash-chained, append-only audit log.
///
/// Appends are serialized under a single lock; seq reflects that order and
/// the hash chain witnesses it. Each append is flushed to stable storage —
/// durability of a single line outweighs throughput here.
pub struct AuditLog {
    dir: PathBuf,
    index: Option<SqliteIndex>,
    state: Mutex<ChainState>,
}

impl AuditLog {
    /// Open or create an audit log in the given directory.
    ///
    /// Creates the directory and genesis root if absent, recovers the
    /// chain position from the tail of the most recent daily file, and
    /// re-indexes any entries the SQLite index is missing.
    pub async fn new(dir: &Path) -> Result<AuditLog> {
        std::fs::create_dir_all(dir)
            .map_err(|e| CtrlAiError::Audit(format!("creating audit dir {}: {e}", dir.display())))?;

        // Index trouble must not take the audit log down — queries fall
        // back to a linear file scan.
        let index = match SqliteIndex::open(&dir.join("index.db")).await {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(error = %e, "audit index unavailable, queries will scan files");
                None
            }
        };

        let genesis = load_or_create_genesis(dir)?;
        let mut state = ChainState {
            seq: genesis.seq,
            last_hash: genesis.hash,
            file: None,
            file_date: String::new(),
        };

        // Resume the chain from the tail of the newest daily file.
        let files = list_jsonl_files(dir)?;
        if let Some(last_file) = files.last() {
            if let Some(last_entry) = read_last_entry(last_file)? {
                state.seq = last_entry.seq;
                state.last_hash = last_entry.hash;
            }
        }

        let log = AuditLog {
            dir: dir.to_path_buf(),
            index,
            state: Mutex::new(state),
        };

        if let Some(index) = &log.index {
            log.reindex(index, &files).await;
        }

        let seq = log.last_seq().await;
        info!(dir = %dir.display(), seq, "audit log initialized");
        Ok(log)
    }

    /// Record a tool-call evaluation.
    pub async fn log_tool_call(
        &self,
        agent: &str,
        provider: &str,
        model: &str,
        tool: &str,
        arguments: Option<Value>,
        decision: &Decision,
        latency_us: i64,
    ) -> Option<AuditEntry> {
        self.append(AuditEntry {
            agent: agent.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            kind: KIND_TOOL_CALL.to_string(),
            tool: tool.to_string(),
            arguments,
            decision: decision.action.to_string(),
            rule: decision.rule.clone(),
            message: decision.message.clone(),
            latency_us,
            ..AuditEntry::default()
        })
        .await
    }

    /// Record a kill-switch trigger.
    pub async fn log_kill(&self, agent: &str, reason: &str) -> Option<AuditEntry> {
        self.append(AuditEntry {
            agent: agent.to_string(),
            kind: KIND_KILL.to_string(),
            decision: "block".to_string(),
            message: reason.to_string(),
            ..AuditEntry::default()
        })
        .await
    }

    /// Record a proxy lifecycle event (start, stop, reload).
    pub async fn log_lifecycle(&self, event: &str, metadata: Option<Value>) -> Option<AuditEntry> {
        self.append(AuditEntry {
            kind: KIND_LIFECYCLE.to_string(),
            tool: event.to_string(),
            decision: "info".to_string(),
            arguments: metadata,
            ..AuditEntry::default()
        })
        .await
    }

    /// The sequence number of the last committed entry.
    pub async fn last_seq(&self) -> u64 {
        self.state.lock().await.seq
    }

    /// The N most recent entries, newest first.
    pub async fn tail(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.query(QueryParams {
            limit: Some(limit),
            ..QueryParams::default()
        })
        .await
    }

    /// Entries matching the given filters, newest first.
    pub async fn query(&self, mut params: QueryParams) -> Result<Vec<AuditEntry>> {
        if let Some(since) = &params.since {
            params.since = Some(resolve_since(since)?);
        }

        if let Some(index) = &self.index {
            return index.query(&params).await;
        }

        // Fallback: linear scan of the JSONL files.
        let mut entries = self.read_all_entries()?;
        entries.retain(|e| {
            params.agent.as_ref().is_none_or(|a| &e.agent == a)
                && params.decision.as_ref().is_none_or(|d| &e.decision == d)
                && params.since.as_ref().is_none_or(|s| e.timestamp.as_str() >= s.as_str())
        });
        entries.reverse(); // newest first, matching the index ordering
        if let Some(limit) = params.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Deliver new entries (seq greater than last-seen) to the callback by
    /// polling the current day's file, until the token is cancelled.
    pub async fn follow<F>(&self, token: CancellationToken, mut on_entry: F)
    where
        F: FnMut(AuditEntry),
    {
        let mut last_seen = self.last_seq().await;
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let today_path = self.dir.join(format!("{}.jsonl", today_utc()));
            let entries = match read_entries_from_path(&today_path) {
                Ok(entries) => entries,
                Err(e) => {
                    error!(error = %e, "follow: error reading entries");
                    continue;
                }
            };
            for entry in entries {
                if entry.seq > last_seen {
                    last_seen = entry.seq;
                    on_entry(entry);
                }
            }
        }
    }

    /// Read all entries in order and verify the hash chain.
    pub fn verify_chain(&self) -> Result<VerifyResult> {
        let entries = self.read_all_entries()?;
        Ok(verify_entries(&entries))
    }

    /// Export all entries as `jsonl` (default), an indented `json` array,
    /// or `csv` with the fixed column set.
    pub fn export(&self, format: &str) -> Result<String> {
        let entries = self.read_all_entries()?;

        match format {
            "jsonl" | "" => {
                let mut out = String::new();
                for entry in &entries {
                    out.push_str(&serde_json::to_string(entry)?);
                    out.push('\n');
                }
                Ok(out)
            }
            "json" => Ok(serde_json::to_string_pretty(&entries)?),
            "csv" => {
                let mut out = String::from(
                    "seq,ts,agent,provider,model,type,tool,decision,rule,latency_us,hash\n",
                );
                for e in &entries {
                    let fields = [
                        e.seq.to_string(),
                        e.timestamp.clone(),
                        e.agent.clone(),
                        e.provider.clone(),
                        e.model.clone(),
                        e.kind.clone(),
                        e.tool.clone(),
                        e.decision.clone(),
                        e.rule.clone(),
                        e.latency_us.to_string(),
                        e.hash.clone(),
                    ];
                    let row: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
                    out.push_str(&row.join(","));
                    out.push('\n');
                }
                Ok(out)
            }
            other => Err(CtrlAiError::Audit(format!(
                "unsupported export format: {other} (use json, jsonl, or csv)"
            ))),
        }
    }

    /// Flush and close the log file and index.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(file) = state.file.take() {
            if let Err(e) = file.sync_all() {
                error!(error = %e, "closing audit file");
            }
        }
        if let Some(index) = &self.index {
            index.close().await;
        }
    }

    /// Append an entry: advance seq, stamp the time, chain the hash, write
    /// + fsync, then mirror into the index (best-effort).
    ///
    /// Returns the completed entry, or `None` if the write failed — the
    /// request still completes; operators detect omissions via chain
    /// verification.
    async fn append(&self, mut entry: AuditEntry) -> Option<AuditEntry> {
        let mut state = self.state.lock().await;

        entry.seq = state.seq + 1;
        entry.timestamp = now_rfc3339_nanos();
        entry.prev_hash = state.last_hash.clone();
        entry.hash = compute_hash(&entry);

        if let Err(e) = write_entry(&self.dir, &mut state, &entry) {
            error!(seq = entry.seq, error = %e, "audit write failed");
            return None;
        }

        state.seq = entry.seq;
        state.last_hash = entry.hash.clone();

        if let Some(index) = &self.index {
            index.insert(&entry).await;
        }

        Some(entry)
    }

    /// Insert any entries the index is missing. Called on startup to
    /// recover from a crash between file append and index insert.
    async fn reindex(&self, index: &SqliteIndex, files: &[PathBuf]) {
        let index_last_seq = index.last_seq().await;
        for file in files {
            let entries = match read_entries_from_path(file) {
                Ok(entries) => entries,
                Err(e) => {
                    error!(file = %file.display(), error = %e, "reindex: error reading file");
                    continue;
                }
            };
            for entry in entries {
                if entry.seq > index_last_seq {
                    index.insert(&entry).await;
                }
            }
        }
    }

    /// All entries from all daily files, in chronological order.
    fn read_all_entries(&self) -> Result<Vec<AuditEntry>> {
        let mut all = Vec::new();
        for file in list_jsonl_files(&self.dir)? {
            all.extend(read_entries_from_path(&file)?);
        }
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Genesis
// ---------------------------------------------------------------------------

/// Load the chain root, creating it on first run.
fn load_or_create_genesis(dir: &Path) -> Result<AuditEntry> {
    let path = dir.join("genesis.json");
    match std::fs::read_to_string(&path) {
        Ok(data) => serde_json::from_str(&data)
            .map_err(|e| CtrlAiError::Audit(format!("parsing genesis: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut genesis = AuditEntry {
                seq: 0,
                timestamp: now_rfc3339_nanos(),
                kind: KIND_LIFECYCLE.to_string(),
                tool: "genesis".to_string(),
                decision: "info".to_string(),
                prev_hash: GENESIS_PREV_HASH.to_string(),
                ..AuditEntry::default()
            };
            genesis.hash = compute_hash(&genesis);
            std::fs::write(&path, serde_json::to_string_pretty(&genesis)?)
                .map_err(|e| CtrlAiError::Audit(format!("writing genesis: {e}")))?;
            info!(hash = %genesis.hash, "audit genesis created");
            Ok(genesis)
        }
        Err(e) => Err(CtrlAiError::Audit(format!("reading genesis: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn now_rfc3339_nanos() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Append one entry to today's file, rotating when the UTC date changes,
/// and flush it to stable storage.
fn write_entry(dir: &Path, state: &mut ChainState, entry: &AuditEntry) -> Result<()> {
    let today = today_utc();
    if state.file.is_none() || state.file_date != today {
        let path = dir.join(format!("{today}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CtrlAiError::Audit(format!("opening audit file {}: {e}", path.display())))?;
        state.file = Some(file);
        state.file_date = today;
    }

    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');

    if let Some(file) = state.file.as_mut() {
        file.write_all(&line)
            .map_err(|e| CtrlAiError::Audit(format!("writing audit entry: {e}")))?;
        // Entries must survive crashes.
        file.sync_all()
            .map_err(|e| CtrlAiError::Audit(format!("syncing audit file: {e}")))?;
    }
    Ok(())
}

/// Daily JSONL files in lexicographic (= chronological) order.
fn list_jsonl_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let read_dir = std::fs::read_dir(dir)
        .map_err(|e| CtrlAiError::Audit(format!("listing audit files: {e}")))?;
    for dir_entry in read_dir {
        let path = dir_entry
            .map_err(|e| CtrlAiError::Audit(format!("listing audit files: {e}")))?
            .path();
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parse newline-delimited entries, skipping blank and malformed lines.
/// Also the import half of the export→import→verify round trip.
pub fn parse_jsonl(text: &str) -> Vec<AuditEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(error = %e, "skipping malformed audit entry"),
        }
    }
    entries
}

fn read_entries_from_path(path: &Path) -> Result<Vec<AuditEntry>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CtrlAiError::Audit(format!(
                "reading {}: {e}",
                path.display()
            )))
        }
    };
    Ok(parse_jsonl(&text))
}

/// The last non-empty line of a JSONL file, parsed. `None` when empty.
fn read_last_entry(path: &Path) -> Result<Option<AuditEntry>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CtrlAiError::Audit(format!("reading {}: {e}", path.display())))?;
    let last_line = text.lines().rev().find(|l| !l.trim().is_empty());
    match last_line {
        None => Ok(None),
        Some(line) => serde_json::from_str(line)
            .map(Some)
            .map_err(|e| CtrlAiError::Audit(format!("parsing tail of {}: {e}", path.display()))),
    }
}

/// Resolve a `since` parameter: an RFC 3339 timestamp passes through, a
/// duration string (`1h`, `30m`) resolves against now.
fn resolve_since(since: &str) -> Result<String> {
    if since.contains('T') {
        return Ok(since.to_string());
    }
    let duration = humantime::parse_duration(since)
        .map_err(|e| CtrlAiError::Audit(format!("invalid since duration {since:?}: {e}")))?;
    let delta = chrono::Duration::from_std(duration)
        .map_err(|e| CtrlAiError::Audit(format!("invalid since duration {since:?}: {e}")))?;
    Ok((Utc::now() - delta).to_rfc3339_opts(SecondsFormat::Nanos, true))
}

/// Quote a CSV field when it contains a delimiter, quote, or newline.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
