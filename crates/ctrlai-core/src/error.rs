//! Error types shared across CtrlAI crates.

/// Core error type.
#[derive(thiserror::Error, Debug)]
pub enum CtrlAiError {
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rule error: {0}")]
    Rule(String),

    #[error("audit error: {0}")]
    Audit(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CtrlAiError>;
