//! Guardrail rule evaluation engine for CtrlAI.
//!
//! Loads custom rules from `rules.yaml`, merges them with the built-in
//! security catalogue, and evaluates extracted tool calls against the
//! combined set in order — first match wins, no match means allow.
//!
//! Rule matching supports:
//!   - tool name (case-insensitive)
//!   - `action` argument field (case-insensitive)
//!   - agent ID (exact)
//!   - `path` argument glob patterns
//!   - argument substrings (case-insensitive, over the raw JSON)
//!   - `command` argument regex
//!   - `url`/`targetUrl` argument regex

mod builtin;
mod engine;
mod matcher;
mod rules;

pub use builtin::{builtin_rules, default_builtin_toggles};
pub use engine::{Engine, RuleInfo};
pub use matcher::CompiledMatcher;
pub use rules::{load_rules_from_file, save_rules_to_file, write_default_rules};
pub use rules::{Rule, RuleMatch, StringOrList};
