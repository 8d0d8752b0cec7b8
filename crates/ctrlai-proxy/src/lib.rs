//! CtrlAI transparent guardrail proxy.
//!
//! Sits between an agent SDK and an LLM provider:
//!
//!  1. Parses the URL to extract provider key, agent ID, and API path
//!  2. Checks the kill switch before forwarding
//!  3. Forwards the request to the upstream LLM unchanged
//!  4. Buffers the response (SSE or single body)
//!  5. Extracts tool invocations
//!  6. Evaluates each invocation against the rule engine
//!  7. Rewrites blocked responses (strips invocations, downgrades the
//!     terminal state, injects a notice)
//!  8. Replays the response (modified or original) to the SDK

pub mod agents;
pub mod api;
pub mod buffer;
pub mod events;
pub mod extract;
pub mod killswitch;
pub mod proxy;
pub mod rewrite;
pub mod router;
pub mod server;
pub mod sse;
pub mod stream_rewrite;
pub mod watcher;
