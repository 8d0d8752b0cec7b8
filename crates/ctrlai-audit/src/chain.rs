//! Audit entry schema, hash computation, and chain verification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// The fixed predecessor hash of the chain root.
pub const GENESIS_PREV_HASH: &str = "sha256:genesis";

/// Entry kind: a tool-call evaluation.
pub const KIND_TOOL_CALL: &str = "tool_call";
/// Entry kind: a kill-switch trigger.
pub const KIND_KILL: &str = "kill";
/// Entry kind: a proxy lifecycle event (start, stop, reload).
pub const KIND_LIFECYCLE: &str = "lifecycle";

/// A single audit log record.
///
/// The hash chain links entries: each entry's `hash` covers the previous
/// entry's hash, so the log is tamper-evident. Once appended and synced an
/// entry is immutable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    /// UTC RFC 3339 with nanosecond precision.
    #[serde(rename = "ts")]
    pub timestamp: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    /// `tool_call`, `kill`, or `lifecycle`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    pub decision: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub latency_us: i64,
    pub prev_hash: String,
    pub hash: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Compute the SHA-256 chain hash for an entry.
///
/// The hash covers the previous entry's hash, so modifying any entry
/// invalidates all subsequent entries:
///
/// ```text
/// sha256(prev_hash | seq | ts | agent | tool | decision)
/// ```
///
/// Rendered as `sha256:<hex>`.
pub fn compute_hash(entry: &AuditEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}|{}|{}",
            entry.prev_hash,
            entry.seq,
            entry.timestamp,
            entry.agent,
            entry.tool,
            entry.decision
        )
        .as_bytes(),
    );
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Outcome of a hash-chain verification.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerifyResult {
    pub valid: bool,
    pub entries_checked: usize,
    /// Index of the first entry that failed, when invalid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<usize>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub expected_hash: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub actual_hash: String,
}

/// Verify a sequence of entries in order.
///
/// Rejects at the first `i` where the stored hash does not match the
/// computed hash, or (for `i > 0`) where `prev_hash` does not match the
/// previous entry's hash. A free function so exported entries can be
/// re-imported and verified without a live log.
pub fn verify_entries(entries: &[AuditEntry]) -> VerifyResult {
    for (i, entry) in entries.iter().enumerate() {
        let expected = compute_hash(entry);
        if entry.hash != expected {
            return VerifyResult {
                valid: false,
                entries_checked: i + 1,
                broken_at: Some(i),
                expected_hash: expected,
                actual_hash: entry.hash.clone(),
            };
        }
        if i > 0 && entry.prev_hash != entries[i - 1].hash {
            return VerifyResult {
                valid: false,
                entries_checked: i + 1,
                broken_at: Some(i),
                expected_hash: entries[i - 1].hash.clone(),
                actual_hash: entry.prev_hash.clone(),
            };
        }
    }
    VerifyResult {
        valid: true,
        entries_checked: entries.len(),
        ..VerifyResult::default()
    }
}
