//! The request handler: route → kill gate → forward → buffer → evaluate →
//! rewrite → emit.

use crate::agents::Registry;
use crate::buffer::{buffer_events, reconstruct};
use crate::events::EventBroadcaster;
use crate::extract::{extract_request_meta, extract_tool_calls};
use crate::killswitch::KillSwitch;
use crate::rewrite::{build_killed_response, format_block_notice, rewrite_body};
use crate::router::{parse_route, RouteInfo};
use crate::sse::write_event;
use crate::stream_rewrite::rewrite_stream;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use ctrlai_audit::AuditLog;
use ctrlai_core::{Config, Decision, RequestMeta, ToolCall};
use ctrlai_engine::Engine;
use futures_util::TryStreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Requests larger than this are rejected; LLM request bodies rarely
/// exceed a few hundred KB even with long conversations.
const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

/// Headers that must not be forwarded through a proxy hop.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Shared state threaded through axum handlers via [`State`].
pub struct AppState {
    pub config: Config,
    /// Upstream HTTP client. Connect timeout only — long reasoning chains
    /// are legitimate, so there is no total request deadline.
    pub client: reqwest::Client,
    pub engine: Engine,
    pub audit: AuditLog,
    pub registry: Registry,
    pub kill_switch: KillSwitch,
    pub events: EventBroadcaster,
    /// Path of `rules.yaml`, for persisting rule mutations.
    pub rules_path: PathBuf,
}

/// Axum handler for all `/provider/…` traffic.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    // --- Step 1: parse the route ---
    let route = match parse_route(req.uri().path()) {
        Ok(route) => route,
        Err(e) => {
            warn!(path = req.uri().path(), error = %e, "invalid route");
            return error_response(StatusCode::BAD_REQUEST, "invalid proxy path");
        }
    };

    debug!(
        provider = %route.provider_key,
        agent = %route.agent_id,
        api_path = %route.api_path,
        method = %req.method(),
        "proxy request"
    );

    // --- Step 2: kill switch gate ---
    if state.kill_switch.is_killed(&route.agent_id) {
        warn!(agent = %route.agent_id, "request from killed agent");
        if let Some(entry) = state
            .audit
            .log_kill(&route.agent_id, "request from killed agent")
            .await
        {
            state.events.publish(entry);
        }
        return killed_response(&route);
    }

    // --- Step 3: read the request body, extract metadata ---
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };
    let meta = extract_request_meta(&body_bytes);

    // --- Step 4: registry touch ---
    state
        .registry
        .touch(&route.agent_id, &route.provider_key, &meta.model);

    // --- Step 5: resolve the upstream ---
    let Some(provider) = state.config.providers.get(&route.provider_key) else {
        warn!(provider = %route.provider_key, "unknown provider");
        return error_response(
            StatusCode::BAD_GATEWAY,
            &format!("unknown provider: {}", route.provider_key),
        );
    };
    let mut upstream_url = format!(
        "{}{}",
        provider.upstream.trim_end_matches('/'),
        route.api_path
    );
    if let Some(query) = parts.uri.query() {
        upstream_url.push('?');
        upstream_url.push_str(query);
    }

    // --- Step 6: forward upstream, body byte-identical ---
    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::POST);
    let mut upstream_req = state
        .client
        .request(method, &upstream_url)
        .body(body_bytes.to_vec());
    upstream_req = upstream_req.headers(forwardable_headers(&parts.headers));

    let mut upstream_resp = match upstream_req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!(upstream = %upstream_url, error = %e, "upstream request failed");
            return error_response(StatusCode::BAD_GATEWAY, "upstream request failed");
        }
    };

    // --- Step 7: unknown wire formats pass through verbatim ---
    if !route.wire_format.is_inspected() {
        return pass_through(upstream_resp);
    }

    // --- Step 8: buffered inspection, streaming or not ---
    if meta.stream {
        if state.config.streaming.buffer {
            handle_streaming(&state, upstream_resp, &route, &meta).await
        } else {
            // Buffering disabled: tool calls arriving incrementally cannot
            // be inspected, so the stream passes through untouched.
            pass_through(upstream_resp)
        }
    } else {
        handle_non_streaming(&state, &mut upstream_resp, &route, &meta).await
    }
}

/// Non-streaming: read the whole body, evaluate, rewrite if anything was
/// blocked, emit.
async fn handle_non_streaming(
    state: &Arc<AppState>,
    upstream_resp: &mut reqwest::Response,
    route: &RouteInfo,
    meta: &RequestMeta,
) -> Response<Body> {
    let status = upstream_resp.status().as_u16();
    let headers = upstream_resp.headers().clone();

    let body = match collect_body(upstream_resp).await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to read upstream response");
            return error_response(StatusCode::BAD_GATEWAY, "failed to read upstream response");
        }
    };

    let tool_calls = extract_tool_calls(&body, route.wire_format);
    if tool_calls.is_empty() {
        // A body we cannot parse is forwarded verbatim and assumed to
        // contain no enforceable tool calls (the SDK will also fail to
        // parse it) — but the failure itself goes on the record.
        if !body.is_empty() && serde_json::from_slice::<Value>(&body).is_err() {
            warn!(agent = %route.agent_id, "unparseable upstream response, forwarding verbatim");
            if let Some(entry) = state
                .audit
                .log_lifecycle(
                    "response extraction failed",
                    Some(serde_json::json!({
                        "agent": route.agent_id,
                        "provider": route.provider_key,
                    })),
                )
                .await
            {
                state.events.publish(entry);
            }
        }
        return upstream_response(status, &headers, Body::from(body));
    }

    let (blocked, decisions) = evaluate_calls(state, route, meta, &tool_calls).await;

    let body = if blocked.is_empty() {
        body
    } else {
        rewrite_body(&body, route.wire_format, &blocked, &decisions)
    };
    upstream_response(status, &headers, Body::from(body))
}

/// Streaming: buffer events to the terminal marker or deadline,
/// reconstruct, evaluate, rewrite the event sequence if anything was
/// blocked, and replay as an event stream.
async fn handle_streaming(
    state: &Arc<AppState>,
    mut upstream_resp: reqwest::Response,
    route: &RouteInfo,
    meta: &RequestMeta,
) -> Response<Body> {
    let status = upstream_resp.status().as_u16();
    let headers = upstream_resp.headers().clone();

    let timeout = std::time::Duration::from_millis(state.config.streaming.buffer_timeout_ms);
    let events = buffer_events(&mut upstream_resp, timeout).await;
    let message = reconstruct(&events, route.wire_format);

    let (blocked, decisions) = evaluate_calls(state, route, meta, &message.tool_calls).await;

    let replay = if blocked.is_empty() {
        events
    } else {
        let notices: Vec<String> = blocked
            .iter()
            .zip(&decisions)
            .map(|(tc, d)| format_block_notice(&tc.name, &d.rule, &d.message))
            .collect();
        rewrite_stream(&events, route.wire_format, &blocked, &notices)
    };

    // One chunk per event so each event flushes to the SDK as written.
    let chunks: Vec<Result<Bytes, std::io::Error>> = replay
        .iter()
        .map(|event| {
            let mut wire = String::new();
            write_event(&mut wire, event);
            Ok(Bytes::from(wire))
        })
        .collect();

    let mut builder = Response::builder().status(axum_status(status));
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) || name.as_str() == "content-length" {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder = builder
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache");

    builder
        .body(Body::from_stream(futures_util::stream::iter(chunks)))
        .unwrap_or_else(|_| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response")
        })
}

/// Evaluate every invocation in provider order, auditing and broadcasting
/// each decision and bumping the agent counters. Returns the blocked calls
/// with their decisions, in order.
async fn evaluate_calls(
    state: &Arc<AppState>,
    route: &RouteInfo,
    meta: &RequestMeta,
    tool_calls: &[ToolCall],
) -> (Vec<ToolCall>, Vec<Decision>) {
    let mut blocked = Vec::new();
    let mut decisions = Vec::new();

    for tc in tool_calls {
        let eval_start = Instant::now();
        let decision = state.engine.evaluate(&route.agent_id, tc);
        let latency_us = eval_start.elapsed().as_micros() as i64;

        let arguments = tc.arguments.clone().map(Value::Object);
        if let Some(entry) = state
            .audit
            .log_tool_call(
                &route.agent_id,
                &route.provider_key,
                &meta.model,
                &tc.name,
                arguments,
                &decision,
                latency_us,
            )
            .await
        {
            state.events.publish(entry);
        }

        state
            .registry
            .record_tool_call(&route.agent_id, decision.is_block());

        if decision.is_block() {
            warn!(
                agent = %route.agent_id,
                tool = %tc.name,
                rule = %decision.rule,
                "tool call blocked"
            );
            blocked.push(tc.clone());
            decisions.push(decision);
        } else {
            debug!(agent = %route.agent_id, tool = %tc.name, "tool call allowed");
        }
    }

    (blocked, decisions)
}

// ---------------------------------------------------------------------------
// Response builders
// ---------------------------------------------------------------------------

/// A wire-format-appropriate terminal response for a killed agent. 200 so
/// the SDK treats it as a normal end of turn, not a retryable failure.
fn killed_response(route: &RouteInfo) -> Response<Body> {
    let body = build_killed_response(route.wire_format);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response")
        })
}

/// Stream the upstream body to the client without inspection.
fn pass_through(upstream_resp: reqwest::Response) -> Response<Body> {
    let status = upstream_resp.status().as_u16();
    let headers = upstream_resp.headers().clone();
    let stream = upstream_resp.bytes_stream().map_err(std::io::Error::other);

    let mut builder = Response::builder().status(axum_status(status));
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder.body(Body::from_stream(stream)).unwrap_or_else(|_| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response")
    })
}

/// Emit a fully-buffered upstream response with its headers, minus the
/// hop-by-hop set and the now-stale content-length.
fn upstream_response(status: u16, headers: &reqwest::header::HeaderMap, body: Body) -> Response<Body> {
    let mut builder = Response::builder().status(axum_status(status));
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) || name.as_str() == "content-length" {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder.body(body).unwrap_or_else(|_| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response")
    })
}

fn axum_status(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Request headers to forward upstream: everything except hop-by-hop and
/// `Host` (the HTTP client derives it from the URL).
fn forwardable_headers(src: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut dst = reqwest::header::HeaderMap::new();
    for (name, value) in src.iter() {
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        if let Ok(header_name) =
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
        {
            if let Ok(header_value) = reqwest::header::HeaderValue::from_bytes(value.as_bytes()) {
                dst.append(header_name, header_value);
            }
        }
    }
    dst
}

async fn collect_body(resp: &mut reqwest::Response) -> Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Build a JSON error response.
pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "proxy_error",
        }
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from(message.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_hop_by_hop() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("Keep-Alive"));
        assert!(!is_hop_by_hop("authorization"));
        assert!(!is_hop_by_hop("x-api-key"));
    }

    #[test]
    fn test_forwardable_headers_strips_hop_and_host() {
        let mut src = HeaderMap::new();
        src.insert("authorization", "Bearer sk-test".parse().unwrap());
        src.insert("host", "localhost:3100".parse().unwrap());
        src.insert("connection", "keep-alive".parse().unwrap());
        src.insert("x-api-key", "key".parse().unwrap());

        let dst = forwardable_headers(&src);
        assert!(dst.contains_key("authorization"));
        assert!(dst.contains_key("x-api-key"));
        assert!(!dst.contains_key("host"));
        assert!(!dst.contains_key("connection"));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = error_response(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_axum_status_invalid_maps_to_bad_gateway() {
        assert_eq!(axum_status(200), StatusCode::OK);
        assert_eq!(axum_status(42), StatusCode::BAD_GATEWAY);
    }
}
