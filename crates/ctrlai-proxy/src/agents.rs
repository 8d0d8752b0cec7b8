//! Agent identity and tracking.
//!
//! Agents are auto-discovered when their first request passes through the
//! proxy; the ID comes from the URL path and defaults to `default`. The
//! registry tracks per-agent counters and persists to `agents.yaml` at
//! graceful shutdown — losing a few counter increments on crash is
//! acceptable.

use chrono::{DateTime, Utc};
use ctrlai_core::{CtrlAiError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Killed,
}

/// Cumulative per-agent counters. Monotonically increasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_requests: u64,
    pub total_tool_calls: u64,
    pub blocked_tool_calls: u64,
}

/// A tracked agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// The ID doubles as the map key in `agents.yaml`.
    #[serde(skip)]
    pub id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: AgentStatus,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub stats: AgentStats,
}

/// YAML envelope for `agents.yaml`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    agents: BTreeMap<String, Agent>,
}

/// The set of known agents and their stats.
///
/// Thread-safe: the proxy calls [`Registry::touch`] and
/// [`Registry::record_tool_call`] concurrently from request handlers.
pub struct Registry {
    agents: RwLock<BTreeMap<String, Agent>>,
    path: PathBuf,
}

impl Registry {
    /// Load the registry from a YAML file. A missing or empty file yields
    /// an empty registry.
    pub fn load(path: &Path) -> Result<Registry> {
        let mut agents = BTreeMap::new();

        match std::fs::read_to_string(path) {
            Ok(data) if !data.trim().is_empty() => {
                let file: RegistryFile = serde_yaml::from_str(&data).map_err(|e| {
                    CtrlAiError::Config(format!("parsing agent registry {}: {e}", path.display()))
                })?;
                for (id, mut agent) in file.agents {
                    agent.id = id.clone();
                    agents.insert(id, agent);
                }
                info!(agents = agents.len(), path = %path.display(), "agent registry loaded");
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Registry {
            agents: RwLock::new(agents),
            path: path.to_path_buf(),
        })
    }

    /// All registered agents, sorted by ID.
    pub fn list(&self) -> Vec<Agent> {
        self.read().values().cloned().collect()
    }

    /// One agent by ID.
    pub fn get(&self, id: &str) -> Option<Agent> {
        self.read().get(id).cloned()
    }

    /// Update last-seen/provider/model and bump the request counter,
    /// auto-registering the agent on first sight. Called on every request.
    pub fn touch(&self, agent_id: &str, provider: &str, model: &str) {
        let mut agents = self.write();
        let now = Utc::now();
        let agent = agents.entry(agent_id.to_string()).or_insert_with(|| {
            info!(agent = agent_id, provider, model, "new agent registered");
            Agent {
                id: agent_id.to_string(),
                first_seen: now,
                last_seen: now,
                status: AgentStatus::Active,
                provider: String::new(),
                model: String::new(),
                stats: AgentStats::default(),
            }
        });
        agent.last_seen = now;
        agent.provider = provider.to_string();
        agent.model = model.to_string();
        agent.stats.total_requests += 1;
    }

    /// Bump the tool-call counters after an evaluation.
    pub fn record_tool_call(&self, agent_id: &str, blocked: bool) {
        let mut agents = self.write();
        // Touch runs first on the request path, but don't assume it.
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.stats.total_tool_calls += 1;
            if blocked {
                agent.stats.blocked_tool_calls += 1;
            }
        }
    }

    /// Reflect kill/revive in the registry record.
    pub fn set_status(&self, agent_id: &str, status: AgentStatus) {
        if let Some(agent) = self.write().get_mut(agent_id) {
            agent.status = status;
        }
    }

    /// Persist the registry. Called at graceful shutdown.
    pub fn save(&self) -> Result<()> {
        let file = RegistryFile {
            agents: self.read().clone(),
        };
        let data = serde_yaml::to_string(&file)?;
        std::fs::write(&self.path, data)
            .map_err(|e| CtrlAiError::Config(format!("writing agent registry: {e}")))?;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Agent>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Agent>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }
}
