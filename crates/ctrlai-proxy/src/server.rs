//! Application wiring: shared state, the axum router, and hot reload.

use crate::agents::Registry;
use crate::api;
use crate::events::EventBroadcaster;
use crate::killswitch::KillSwitch;
use crate::proxy::{proxy_handler, AppState};
use crate::watcher::{spawn_watcher, WatchTargets};
use axum::routing::{delete, get, post};
use axum::Router;
use ctrlai_audit::AuditLog;
use ctrlai_core::{Config, Result};
use ctrlai_engine::Engine;
use std::path::Path;
use std::sync::Arc;
use tracing::error;

/// Build the shared [`AppState`] from the configuration and state
/// directory (`rules.yaml`, `agents.yaml`, `killed.yaml`, `audit/`).
pub async fn build_state(config: Config, state_dir: &Path) -> Result<Arc<AppState>> {
    std::fs::create_dir_all(state_dir)?;

    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| ctrlai_core::CtrlAiError::Config(format!("building HTTP client: {e}")))?;

    let rules_path = state_dir.join("rules.yaml");
    let engine = Engine::new(&rules_path)?;
    let audit = AuditLog::new(&state_dir.join("audit")).await?;
    let registry = Registry::load(&state_dir.join("agents.yaml"))?;
    let kill_switch = KillSwitch::load(&state_dir.join("killed.yaml"))?;

    Ok(Arc::new(AppState {
        config,
        client,
        engine,
        audit,
        registry,
        kill_switch,
        events: EventBroadcaster::new(),
        rules_path,
    }))
}

/// Build the axum router: health + admin API, with everything else
/// falling through to the proxy handler.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/v1/agents", get(api::list_agents))
        .route("/api/v1/agents/:id", get(api::get_agent))
        .route("/api/v1/agents/:id/kill", post(api::kill_agent))
        .route("/api/v1/agents/:id/revive", post(api::revive_agent))
        .route("/api/v1/rules", get(api::list_rules).post(api::add_rule))
        .route("/api/v1/rules/test", post(api::test_rule))
        .route("/api/v1/rules/:name", delete(api::remove_rule))
        .route("/api/v1/audit", get(api::query_audit))
        .route("/api/v1/audit/verify", get(api::verify_audit))
        .route("/api/v1/audit/export", get(api::export_audit))
        .fallback(proxy_handler)
        .with_state(state)
}

/// Spawn the hot-reload watcher: `rules.yaml` edits rebuild the ruleset,
/// `killed.yaml` edits replace the killed set. A failed rules reload logs
/// and retains the previous active set.
pub fn spawn_hot_reload(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let state_dir = state
        .rules_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let rules_state = Arc::clone(&state);
    let kill_state = Arc::clone(&state);

    spawn_watcher(
        state_dir,
        WatchTargets {
            on_rules_change: Arc::new(move || {
                if let Err(e) = rules_state.engine.reload(&rules_state.rules_path) {
                    error!(error = %e, "rules reload failed, keeping previous ruleset");
                }
            }),
            on_kill_switch_change: Arc::new(move || {
                if let Err(e) = kill_state.kill_switch.reload() {
                    error!(error = %e, "kill switch reload failed");
                }
            }),
        },
    )
}
