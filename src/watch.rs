//! `vf index watch`: rebuild the vault index whenever a note changes.
//!
//! Filesystem events are debounced by `notify-debouncer-full` on its own
//! thread and forwarded over a tokio channel. Each batch that touches an
//! indexable note triggers one rebuild that reuses the vectors of the
//! in-memory index.

use anyhow::{Context, Result};
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::embedding;
use crate::index::{load_index, rebuild};
use crate::vault::Vault;

/// Vault-relative note paths touched by an event, if it is a
/// create/modify/remove.
pub fn changed_notes(vault: &Vault, kind: &EventKind, paths: &[PathBuf]) -> Vec<String> {
    if !matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return Vec::new();
    }
    paths
        .iter()
        .filter_map(|p| vault.relative(p))
        .filter(|rel| vault.is_note_path(rel))
        .collect()
}

pub async fn run_index_watch(config: &Config) -> Result<()> {
    let vault = Vault::open(&config.vault)?;
    let provider = embedding::create_provider(&config.openai);

    let mut current = match load_index(&config.index.path) {
        Some(snap) => snap,
        None => {
            info!("No index snapshot; building");
            let (snap, report) = rebuild(config, &vault, provider.as_ref(), None, false).await?;
            println!("index build");
            println!("  entries: {}", report.entries);
            snap
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<String>>();
    let root = vault.root().to_path_buf();
    let filter_vault = Vault::open(&config.vault)?;
    let mut debouncer = new_debouncer(
        Duration::from_millis(config.index.debounce_ms),
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                let notes: Vec<String> = events
                    .iter()
                    .flat_map(|e| changed_notes(&filter_vault, &e.event.kind, &e.event.paths))
                    .collect();
                if !notes.is_empty() && tx.send(notes).is_err() {
                    debug!("Watch channel closed");
                }
            }
            Err(errors) => {
                for e in errors {
                    error!("Watch error: {:?}", e);
                }
            }
        },
    )
    .context("Failed to create file watcher")?;
    debouncer
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;

    println!("Watching {} (Ctrl-C to stop)", root.display());

    loop {
        tokio::select! {
            batch = rx.recv() => {
                let Some(mut notes) = batch else { break };
                notes.sort();
                notes.dedup();
                info!("{} note(s) changed: {}", notes.len(), notes.join(", "));
                match rebuild(config, &vault, provider.as_ref(), Some(&current), false).await {
                    Ok((snap, report)) => {
                        println!(
                            "index rebuilt: {} entries ({} embedded, {} reused, {} failed)",
                            report.entries, report.embedded, report.reused, report.failed
                        );
                        current = snap;
                    }
                    Err(e) => warn!("Rebuild failed: {:#}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watcher");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};
    use tempfile::TempDir;

    #[test]
    fn test_changed_notes_filters_kind_and_path() {
        let tmp = TempDir::new().unwrap();
        let vault = Vault::open(&VaultConfig {
            root: tmp.path().to_path_buf(),
            ..VaultConfig::default()
        })
        .unwrap();
        let paths = vec![
            tmp.path().join("NPCs/Mira.md"),
            tmp.path().join("art/map.png"),
            tmp.path().join(".obsidian/workspace.md"),
        ];

        let kinds = [
            EventKind::Create(CreateKind::File),
            EventKind::Modify(ModifyKind::Any),
            EventKind::Remove(RemoveKind::File),
        ];
        for kind in kinds {
            assert_eq!(changed_notes(&vault, &kind, &paths), vec!["NPCs/Mira.md"]);
        }
        assert!(changed_notes(&vault, &EventKind::Access(AccessKind::Any), &paths).is_empty());
    }
}
