//! Core types, configuration, and errors for CtrlAI
//!
//! This crate contains the foundational types shared across all CtrlAI
//! components: the normalized tool-call representation, rule decisions,
//! wire-format identification, and the proxy configuration schema.

mod config;
mod error;
mod types;

pub use config::{
    default_state_dir, Config, LoggingConfig, ProviderConfig, ServerConfig, StreamingConfig,
};
pub use error::{CtrlAiError, Result};
pub use types::{Decision, RequestMeta, RuleAction, ToolCall, WireFormat};
