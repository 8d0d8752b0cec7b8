//! Hot-reload file watching for the state directory.
//!
//! Watches for write-or-create events on `rules.yaml` and `killed.yaml`
//! and invokes the matching reload callback. Remove and rename events are
//! ignored. Rapid successive edits are coalesced by a short drain; one or
//! two reloads for a double edit are both harmless.

use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Which watched file changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Target {
    Rules,
    KillSwitch,
}

/// Reload callbacks fired on file changes.
#[derive(Clone)]
pub struct WatchTargets {
    /// Fired when `rules.yaml` is written or created.
    pub on_rules_change: Arc<dyn Fn() + Send + Sync>,
    /// Fired when `killed.yaml` is written or created.
    pub on_kill_switch_change: Arc<dyn Fn() + Send + Sync>,
}

/// Spawn a watcher on the state directory. The returned task owns the OS
/// watcher; aborting it stops watching.
pub fn spawn_watcher(dir: PathBuf, targets: WatchTargets) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::channel::<Target>(16);

        let mut watcher =
            match notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
                let Ok(event) = result else { return };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                for path in &event.paths {
                    let target = match path.file_name().and_then(|n| n.to_str()) {
                        Some("rules.yaml") => Target::Rules,
                        Some("killed.yaml") => Target::KillSwitch,
                        _ => continue,
                    };
                    let _ = tx.try_send(target);
                }
            }) {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!(error = %e, "failed to create file watcher, hot reload disabled");
                    return;
                }
            };

        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!(error = %e, dir = %dir.display(), "failed to watch state directory");
            return;
        }
        info!(dir = %dir.display(), "watching state directory for changes");

        while let Some(first) = rx.recv().await {
            // Coalesce the burst an editor save produces.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            let mut fired: HashSet<Target> = HashSet::from([first]);
            while let Ok(target) = rx.try_recv() {
                fired.insert(target);
            }

            if fired.contains(&Target::Rules) {
                info!("rules.yaml changed, triggering reload");
                (targets.on_rules_change)();
            }
            if fired.contains(&Target::KillSwitch) {
                info!("killed.yaml changed, triggering reload");
                (targets.on_kill_switch_change)();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn wait_for(counter: &AtomicUsize) -> bool {
        for _ in 0..60 {
            if counter.load(Ordering::SeqCst) > 0 {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rules_change_fires_callback() {
        let dir = tempfile::tempdir().unwrap();
        let rules_fired = Arc::new(AtomicUsize::new(0));
        let kill_fired = Arc::new(AtomicUsize::new(0));

        let rules_counter = Arc::clone(&rules_fired);
        let kill_counter = Arc::clone(&kill_fired);
        let handle = spawn_watcher(
            dir.path().to_path_buf(),
            WatchTargets {
                on_rules_change: Arc::new(move || {
                    rules_counter.fetch_add(1, Ordering::SeqCst);
                }),
                on_kill_switch_change: Arc::new(move || {
                    kill_counter.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );

        // Give the watcher a moment to register.
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        std::fs::write(dir.path().join("rules.yaml"), "rules: []\n").unwrap();

        assert!(wait_for(&rules_fired).await, "rules callback did not fire");
        assert_eq!(kill_fired.load(Ordering::SeqCst), 0);
        handle.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill_switch_change_fires_callback() {
        let dir = tempfile::tempdir().unwrap();
        let kill_fired = Arc::new(AtomicUsize::new(0));

        let kill_counter = Arc::clone(&kill_fired);
        let handle = spawn_watcher(
            dir.path().to_path_buf(),
            WatchTargets {
                on_rules_change: Arc::new(|| {}),
                on_kill_switch_change: Arc::new(move || {
                    kill_counter.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        std::fs::write(dir.path().join("killed.yaml"), "").unwrap();

        assert!(wait_for(&kill_fired).await, "kill callback did not fire");
        handle.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let bump = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handle = spawn_watcher(
            dir.path().to_path_buf(),
            WatchTargets {
                on_rules_change: bump.clone(),
                on_kill_switch_change: bump,
            },
        );

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        std::fs::write(dir.path().join("notes.txt"), "nothing to see").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        handle.abort();
    }
}
