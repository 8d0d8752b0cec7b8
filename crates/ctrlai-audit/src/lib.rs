//! Tamper-evident, hash-chained audit log for CtrlAI.
//!
//! Every tool-call evaluation, kill-switch trigger, and proxy lifecycle
//! event is recorded as an [`AuditEntry`] in an append-only daily JSONL
//! file. Each entry's hash is
//! `SHA-256(prev_hash | seq | ts | agent | tool | decision)`, forming a
//! chain where tampering with any entry breaks verification from that
//! point forward. A SQLite index mirrors the entries for filtered queries;
//! the JSONL files remain the source of truth.

mod chain;
mod index;
mod log;

pub use chain::{compute_hash, verify_entries, AuditEntry, VerifyResult, GENESIS_PREV_HASH};
pub use chain::{KIND_KILL, KIND_LIFECYCLE, KIND_TOOL_CALL};
pub use log::{parse_jsonl, AuditLog, QueryParams};
