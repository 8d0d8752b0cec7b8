//! The kill switch: a persistent set of agents whose requests are answered
//! with a synthetic terminal response instead of being forwarded.
//!
//! `is_killed` runs on every proxy request and must stay an O(1) lookup
//! under a read lock. The CLI writes `killed.yaml`, the file watcher fires
//! [`KillSwitch::reload`], and the kill takes effect without restarting
//! the proxy.

use chrono::{DateTime, Utc};
use ctrlai_core::{CtrlAiError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

/// One kill record: who killed the agent, when, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KilledEntry {
    pub agent: String,
    pub killed_at: DateTime<Utc>,
    pub reason: String,
    pub killed_by: String,
}

struct Inner {
    /// O(1) membership for the request hot path.
    killed: HashMap<String, KilledEntry>,
    /// Insertion-ordered list for serialization.
    entries: Vec<KilledEntry>,
}

/// The set of killed agents, persisted to `killed.yaml`.
pub struct KillSwitch {
    inner: RwLock<Inner>,
    path: PathBuf,
}

impl KillSwitch {
    /// Load the kill switch from a YAML file. A missing or empty file
    /// means no agents are killed.
    pub fn load(path: &Path) -> Result<KillSwitch> {
        let ks = KillSwitch {
            inner: RwLock::new(Inner {
                killed: HashMap::new(),
                entries: Vec::new(),
            }),
            path: path.to_path_buf(),
        };
        {
            let mut inner = ks.write();
            load_into(&ks.path, &mut inner)?;
        }
        Ok(ks)
    }

    /// Whether the agent is currently killed. Hot path — called on every
    /// request.
    pub fn is_killed(&self, agent_id: &str) -> bool {
        self.read().killed.contains_key(agent_id)
    }

    /// All kill records, in kill order.
    pub fn killed_agents(&self) -> Vec<KilledEntry> {
        self.read().entries.clone()
    }

    /// Add an agent to the kill list and persist. Idempotent.
    pub fn kill(&self, agent_id: &str, reason: &str, killed_by: &str) -> Result<()> {
        let mut inner = self.write();
        if inner.killed.contains_key(agent_id) {
            return Ok(());
        }
        let entry = KilledEntry {
            agent: agent_id.to_string(),
            killed_at: Utc::now(),
            reason: reason.to_string(),
            killed_by: killed_by.to_string(),
        };
        inner.killed.insert(agent_id.to_string(), entry.clone());
        inner.entries.push(entry);
        warn!(agent = agent_id, reason, by = killed_by, "agent killed");
        save_to(&self.path, &inner.entries)
    }

    /// Remove an agent from the kill list and persist. Idempotent.
    pub fn revive(&self, agent_id: &str) -> Result<()> {
        let mut inner = self.write();
        if inner.killed.remove(agent_id).is_none() {
            return Ok(());
        }
        inner.entries.retain(|e| e.agent != agent_id);
        info!(agent = agent_id, "agent revived");
        save_to(&self.path, &inner.entries)
    }

    /// Re-read `killed.yaml` and replace the in-memory set. Called by the
    /// file watcher when another process edits the file.
    pub fn reload(&self) -> Result<()> {
        let mut inner = self.write();
        inner.killed.clear();
        inner.entries.clear();
        load_into(&self.path, &mut inner)?;
        info!(killed_agents = inner.killed.len(), "kill switch reloaded");
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_into(path: &Path, inner: &mut Inner) -> Result<()> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if data.trim().is_empty() {
        return Ok(());
    }

    let entries: Vec<KilledEntry> = serde_yaml::from_str(&data)
        .map_err(|e| CtrlAiError::Config(format!("parsing kill switch {}: {e}", path.display())))?;
    for entry in &entries {
        inner.killed.insert(entry.agent.clone(), entry.clone());
    }
    inner.entries = entries;
    Ok(())
}

/// Persist atomically enough for a single-writer file: write the whole
/// list in one call. An empty list writes an empty file, not `[]`.
fn save_to(path: &Path, entries: &[KilledEntry]) -> Result<()> {
    let data = if entries.is_empty() {
        String::new()
    } else {
        serde_yaml::to_string(entries)?
    };
    std::fs::write(path, data)
        .map_err(|e| CtrlAiError::Config(format!("writing kill switch: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_switch() -> (tempfile::TempDir, KillSwitch) {
        let dir = tempfile::tempdir().unwrap();
        let ks = KillSwitch::load(&dir.path().join("killed.yaml")).unwrap();
        (dir, ks)
    }

    #[test]
    fn test_kill_then_is_killed() {
        let (_dir, ks) = temp_switch();
        assert!(!ks.is_killed("main"));
        ks.kill("main", "going rogue", "user").unwrap();
        assert!(ks.is_killed("main"));
    }

    #[test]
    fn test_revive_clears_killed() {
        let (_dir, ks) = temp_switch();
        ks.kill("main", "x", "user").unwrap();
        ks.revive("main").unwrap();
        assert!(!ks.is_killed("main"));
    }

    #[test]
    fn test_kill_is_idempotent() {
        let (_dir, ks) = temp_switch();
        ks.kill("main", "first", "user").unwrap();
        ks.kill("main", "second", "admin").unwrap();
        let entries = ks.killed_agents();
        assert_eq!(entries.len(), 1);
        // The original record wins.
        assert_eq!(entries[0].reason, "first");
    }

    #[test]
    fn test_revive_is_idempotent() {
        let (_dir, ks) = temp_switch();
        ks.revive("never_killed").unwrap();
        ks.kill("main", "x", "user").unwrap();
        ks.revive("main").unwrap();
        ks.revive("main").unwrap();
        assert!(!ks.is_killed("main"));
        assert!(ks.killed_agents().is_empty());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("killed.yaml");

        let ks = KillSwitch::load(&path).unwrap();
        ks.kill("rogue", "exfiltrating", "operator").unwrap();

        let reloaded = KillSwitch::load(&path).unwrap();
        assert!(reloaded.is_killed("rogue"));
        let entries = reloaded.killed_agents();
        assert_eq!(entries[0].killed_by, "operator");
        assert_eq!(entries[0].reason, "exfiltrating");
    }

    #[test]
    fn test_empty_list_writes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("killed.yaml");
        let ks = KillSwitch::load(&path).unwrap();
        ks.kill("a", "x", "u").unwrap();
        ks.revive("a").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        // An empty file loads cleanly.
        assert!(KillSwitch::load(&path).unwrap().killed_agents().is_empty());
    }

    #[test]
    fn test_reload_picks_up_external_edit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("killed.yaml");
        let ks = KillSwitch::load(&path).unwrap();
        assert!(!ks.is_killed("main"));

        // Another process (the CLI) writes the file.
        let writer = KillSwitch::load(&path).unwrap();
        writer.kill("main", "via cli", "user").unwrap();

        ks.reload().unwrap();
        assert!(ks.is_killed("main"));
    }

    #[test]
    fn test_reload_replaces_set_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("killed.yaml");
        let ks = KillSwitch::load(&path).unwrap();
        ks.kill("old", "x", "u").unwrap();

        // External truncation revives everyone.
        std::fs::write(&path, "").unwrap();
        ks.reload().unwrap();
        assert!(!ks.is_killed("old"));
    }

    #[test]
    fn test_load_malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("killed.yaml");
        std::fs::write(&path, "- agent: [broken").unwrap();
        assert!(KillSwitch::load(&path).is_err());
    }
}
