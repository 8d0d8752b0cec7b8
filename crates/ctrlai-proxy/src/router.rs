//! Request URL parsing.
//!
//! URL grammar: `/provider/{providerKey}/[agent/{agentID}/]{downstreamPath}`.
//! The wire format is inferred from the downstream path prefix alone — the
//! router never consults headers or bodies.

use ctrlai_core::{CtrlAiError, Result, WireFormat};

/// Parsed components of an incoming proxy request URL.
///
/// Derived once per request and read-only afterwards.
///
/// ```text
/// /provider/anthropic/agent/main/v1/messages
///   → provider_key="anthropic", agent_id="main",
///     api_path="/v1/messages", wire_format=AnthropicMessages
///
/// /provider/openai/v1/chat/completions
///   → provider_key="openai", agent_id="default",
///     api_path="/v1/chat/completions", wire_format=OpenAiChat
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub provider_key: String,
    pub agent_id: String,
    /// Forwarded verbatim to the upstream.
    pub api_path: String,
    pub wire_format: WireFormat,
}

/// Parse a request URL path into its route components.
///
/// The `/agent/{id}` segment is optional and defaults to `default`.
/// Fails when the path does not begin with `/provider/`.
pub fn parse_route(path: &str) -> Result<RouteInfo> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let parts: Vec<&str> = trimmed.split('/').collect();

    if parts.len() < 2 || parts[0] != "provider" || parts[1].is_empty() {
        return Err(CtrlAiError::InvalidRoute(
            "path must start with /provider/{key}".to_string(),
        ));
    }

    let provider_key = parts[1].to_string();
    let mut remaining = &parts[2..];
    let mut agent_id = "default".to_string();

    if remaining.len() >= 2 && remaining[0] == "agent" {
        agent_id = remaining[1].to_string();
        remaining = &remaining[2..];
    }

    let api_path = if remaining.is_empty() {
        String::new()
    } else {
        format!("/{}", remaining.join("/"))
    };

    Ok(RouteInfo {
        provider_key,
        agent_id,
        wire_format: detect_wire_format(&api_path),
        api_path,
    })
}

/// Infer the wire format from the downstream path. Deterministic — no
/// guessing from headers or bodies.
fn detect_wire_format(api_path: &str) -> WireFormat {
    if api_path.starts_with("/v1/messages") {
        WireFormat::AnthropicMessages
    } else if api_path.starts_with("/v1/chat/completions") {
        WireFormat::OpenAiChat
    } else if api_path.starts_with("/v1/responses") {
        WireFormat::OpenAiResponses
    } else {
        WireFormat::Unknown
    }
}
