//! Vault index builder.
//!
//! Walks every markdown note in the vault, extracts frontmatter, tags, and
//! headings, cuts the body into chunks, and requests one embedding per
//! chunk. The result is a flat `Vec<IndexEntry>` that is rebuilt wholesale
//! on every run and optionally persisted as a JSON snapshot.
//!
//! # Hash Gating
//!
//! A chunk whose `(path, sha256)` pair matches an entry of the previous
//! index that carries a vector from the same embedding model reuses that
//! vector without a request. `full = true` ignores the cache.
//!
//! # Failure Policy
//!
//! Embedding failures are logged and the entry is stored with an empty
//! vector; the build continues. Such entries are skipped by semantic
//! ranking but still take part in literal matching.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::chunk::{chunk_body, hash_text, Chunk};
use crate::config::{Config, IndexConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::markdown::parse_note;
use crate::models::{IndexEntry, IndexSnapshot, SNAPSHOT_VERSION};
use crate::vault::Vault;

/// Counters reported after a build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub files: usize,
    pub entries: usize,
    pub embedded: usize,
    pub reused: usize,
    pub failed: usize,
}

/// Build the index for every note in the vault.
///
/// `previous` is the last known index (in memory or loaded from disk); its
/// vectors are reused only when it was built with `provider`'s model.
pub async fn build_vault_index(
    vault: &Vault,
    config: &IndexConfig,
    provider: &dyn EmbeddingProvider,
    previous: Option<&IndexSnapshot>,
    full: bool,
) -> Result<(Vec<IndexEntry>, BuildReport)> {
    let cache = if full {
        HashMap::new()
    } else {
        embedding_cache(previous, provider.model_name())
    };

    let files = vault.markdown_files()?;
    let mut report = BuildReport {
        files: files.len(),
        ..BuildReport::default()
    };
    let mut entries = Vec::new();

    for file in &files {
        let content = match vault.read(&file.path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Skipping {}: {:#}", file.path, e);
                continue;
            }
        };
        let meta = parse_note(&content);

        let mut chunks = chunk_body(&meta.body, config);
        if chunks.is_empty() {
            // Frontmatter-only or empty note: keep it findable by path, yaml and tags.
            chunks.push(Chunk {
                index: 0,
                text: String::new(),
                hash: hash_text(""),
            });
        }

        for chunk in chunks {
            let mut entry = IndexEntry {
                path: file.path.clone(),
                yaml: meta.yaml.clone(),
                tags: meta.tags.clone(),
                headings: meta.headings.clone(),
                text: chunk.text.clone(),
                embedding: Vec::new(),
                last_hash: Some(chunk.hash.clone()),
                related: Vec::new(),
            };

            if let Some(vector) = cache.get(&(file.path.clone(), chunk.hash.clone())) {
                entry.embedding = vector.to_vec();
                report.reused += 1;
            } else if !chunk.text.trim().is_empty() {
                match embedding::embed_query(provider, &chunk.text).await {
                    Ok(vector) => {
                        entry.embedding = vector;
                        report.embedded += 1;
                    }
                    Err(e) => {
                        warn!(
                            "Embedding failed for {} (chunk {}): {:#}",
                            file.path, chunk.index, e
                        );
                        report.failed += 1;
                    }
                }
            }

            entries.push(entry);
        }
    }

    link_related(&mut entries);
    report.entries = entries.len();
    debug!("Index build: {:?}", report);
    Ok((entries, report))
}

/// `(path, hash) -> vector` for reusable vectors of the previous index.
fn embedding_cache<'a>(
    previous: Option<&'a IndexSnapshot>,
    model: &str,
) -> HashMap<(String, String), &'a [f32]> {
    let mut cache = HashMap::new();
    let Some(snapshot) = previous else {
        return cache;
    };
    if snapshot.model != model {
        info!(
            "Embedding model changed ({} -> {}); re-embedding all chunks",
            snapshot.model, model
        );
        return cache;
    }
    for entry in &snapshot.entries {
        if let (Some(hash), true) = (entry.last_hash.as_deref(), entry.has_embedding()) {
            cache.insert((entry.path.clone(), hash.to_string()), entry.embedding.as_slice());
        }
    }
    cache
}

/// Fill `related` with the paths (without `.md`) of other notes sharing at
/// least one tag, deduplicated, in order of first appearance.
pub fn link_related(entries: &mut [IndexEntry]) {
    let links: Vec<Vec<String>> = entries
        .iter()
        .map(|entry| {
            let mut related: Vec<String> = Vec::new();
            for other in entries.iter() {
                if other.path == entry.path {
                    continue;
                }
                if !other.tags.iter().any(|t| entry.tags.contains(t)) {
                    continue;
                }
                let link = other
                    .path
                    .strip_suffix(".md")
                    .unwrap_or(&other.path)
                    .to_string();
                if !related.contains(&link) {
                    related.push(link);
                }
            }
            related
        })
        .collect();

    for (entry, related) in entries.iter_mut().zip(links) {
        entry.related = related;
    }
}

/// Load a snapshot. A missing file yields `None`; an unreadable or corrupt
/// one is logged and also yields `None`.
pub fn load_index(path: &Path) -> Option<IndexSnapshot> {
    if !path.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Cannot read index {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<IndexSnapshot>(&content) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("Ignoring corrupt index {}: {}", path.display(), e);
            None
        }
    }
}

/// Write a snapshot as pretty JSON, creating parent folders.
pub fn save_index(path: &Path, snapshot: &IndexSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write index: {}", path.display()))
}

pub fn snapshot(model: &str, entries: Vec<IndexEntry>) -> IndexSnapshot {
    IndexSnapshot {
        version: SNAPSHOT_VERSION,
        model: model.to_string(),
        built_at: Utc::now(),
        entries,
    }
}

/// Build, persist when configured, and return the new snapshot.
pub async fn rebuild(
    config: &Config,
    vault: &Vault,
    provider: &dyn EmbeddingProvider,
    previous: Option<&IndexSnapshot>,
    full: bool,
) -> Result<(IndexSnapshot, BuildReport)> {
    let (entries, report) =
        build_vault_index(vault, &config.index, provider, previous, full).await?;
    let snap = snapshot(provider.model_name(), entries);
    if config.index.persist {
        save_index(&config.index.path, &snap)?;
    }
    Ok((snap, report))
}

/// `vf index build`
pub async fn run_index_build(config: &Config, full: bool) -> Result<()> {
    let vault = Vault::open(&config.vault)?;
    let provider = embedding::create_provider(&config.openai);
    let previous = load_index(&config.index.path);

    let (_, report) = rebuild(config, &vault, provider.as_ref(), previous.as_ref(), full).await?;

    println!("index build{}", if full { " (full)" } else { "" });
    println!("  files: {}", report.files);
    println!("  entries: {}", report.entries);
    println!("  embedded: {}", report.embedded);
    println!("  reused: {}", report.reused);
    println!("  failed: {}", report.failed);
    if config.index.persist {
        println!("  written: {}", config.index.path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Granularity, VaultConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Deterministic provider that counts requests.
    struct CountingProvider {
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            "fake-model"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(needle) = self.fail_on {
                if texts.iter().any(|t| t.contains(needle)) {
                    anyhow::bail!("simulated outage");
                }
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0])
                .collect())
        }
    }

    fn vault_with(files: &[(&str, &str)]) -> (TempDir, Vault) {
        let tmp = TempDir::new().unwrap();
        for (rel, body) in files {
            let path = tmp.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        let vault = Vault::open(&VaultConfig {
            root: tmp.path().to_path_buf(),
            ..VaultConfig::default()
        })
        .unwrap();
        (tmp, vault)
    }

    fn file_config() -> IndexConfig {
        IndexConfig {
            granularity: Granularity::File,
            ..IndexConfig::default()
        }
    }

    #[tokio::test]
    async fn test_builds_entries_with_metadata() {
        let (_tmp, vault) = vault_with(&[
            ("NPCs/Mira.md", "---\nfaction: Harpers\n---\n# Mira\nInnkeeper #npc\n"),
            ("Places/Inn.md", "# The Yawning Portal\nRun by Durnan. #npc\n"),
        ]);
        let provider = CountingProvider::new();
        let (entries, report) = build_vault_index(&vault, &file_config(), &provider, None, false)
            .await
            .unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(report.entries, 2);
        assert_eq!(report.embedded, 2);
        assert_eq!(entries[0].path, "NPCs/Mira.md");
        assert_eq!(entries[0].headings, vec!["Mira"]);
        assert!(entries[0].has_embedding());
        assert_eq!(entries[0].related, vec!["Places/Inn"]);
        assert_eq!(entries[1].related, vec!["NPCs/Mira"]);
    }

    #[tokio::test]
    async fn test_unchanged_file_reuses_cached_embedding() {
        let (_tmp, vault) = vault_with(&[("a.md", "alpha text"), ("b.md", "beta text")]);
        let provider = CountingProvider::new();
        let (entries, _) = build_vault_index(&vault, &file_config(), &provider, None, false)
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        std::fs::write(vault.root().join("b.md"), "beta text, edited").unwrap();
        let previous = snapshot("fake-model", entries);
        let (_, report) =
            build_vault_index(&vault, &file_config(), &provider, Some(&previous), false)
                .await
                .unwrap();

        assert_eq!(report.reused, 1);
        assert_eq!(report.embedded, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_full_rebuild_and_model_change_skip_cache() {
        let (_tmp, vault) = vault_with(&[("a.md", "alpha text")]);
        let provider = CountingProvider::new();
        let (entries, _) = build_vault_index(&vault, &file_config(), &provider, None, false)
            .await
            .unwrap();

        let same_model = snapshot("fake-model", entries.clone());
        let (_, report) =
            build_vault_index(&vault, &file_config(), &provider, Some(&same_model), true)
                .await
                .unwrap();
        assert_eq!(report.reused, 0);

        let other_model = snapshot("other-model", entries);
        let (_, report) =
            build_vault_index(&vault, &file_config(), &provider, Some(&other_model), false)
                .await
                .unwrap();
        assert_eq!(report.reused, 0);
        assert_eq!(report.embedded, 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_stores_empty_vector() {
        let (_tmp, vault) = vault_with(&[("ok.md", "fine"), ("bad.md", "explode here")]);
        let provider = CountingProvider {
            calls: AtomicUsize::new(0),
            fail_on: Some("explode"),
        };
        let (entries, report) = build_vault_index(&vault, &file_config(), &provider, None, false)
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(entries.len(), 2);
        let bad = entries.iter().find(|e| e.path == "bad.md").unwrap();
        assert!(!bad.has_embedding());
        assert_eq!(bad.text, "explode here");
    }

    #[tokio::test]
    async fn test_chunk_granularity_splits_body() {
        let (_tmp, vault) = vault_with(&[("long.md", "---\ntags: [lore]\n---\nabcdefghij")]);
        let cfg = IndexConfig {
            chunk_size: 4,
            ..IndexConfig::default()
        };
        let provider = CountingProvider::new();
        let (entries, _) = build_vault_index(&vault, &cfg, &provider, None, false)
            .await
            .unwrap();
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "efgh", "ij"]);
        assert!(entries.iter().all(|e| e.tags == vec!["lore"]));
        // Chunks of the same file are not related to each other.
        assert!(entries.iter().all(|e| e.related.is_empty()));
    }

    #[tokio::test]
    async fn test_frontmatter_only_note_gets_an_entry() {
        let (_tmp, vault) = vault_with(&[
            ("Players/Bram.md", "---\nclass: Fighter\ntags: [party]\n---\n"),
            ("Log.md", "Bram joined. #party\n"),
            ("Empty.md", ""),
        ]);
        let provider = CountingProvider::new();
        for cfg in [file_config(), IndexConfig::default()] {
            let (entries, report) = build_vault_index(&vault, &cfg, &provider, None, false)
                .await
                .unwrap();
            assert_eq!(report.files, 3);
            assert_eq!(report.entries, 3);
            assert_eq!(report.embedded, 1);
            assert_eq!(report.failed, 0);

            let bram = entries.iter().find(|e| e.path == "Players/Bram.md").unwrap();
            assert_eq!(bram.text, "");
            assert!(!bram.has_embedding());
            assert_eq!(bram.related, vec!["Log"]);

            let hits = crate::retrieve::literal_matches(&entries, "fighter");
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].path, "Players/Bram.md");
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_link_related_dedups_in_order() {
        let make = |path: &str, tags: &[&str]| IndexEntry {
            path: path.to_string(),
            yaml: Default::default(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            headings: vec![],
            text: String::new(),
            embedding: vec![],
            last_hash: None,
            related: vec![],
        };
        let mut entries = vec![
            make("a.md", &["x", "y"]),
            make("b.md", &["y"]),
            make("b.md", &["y"]),
            make("c.md", &["x"]),
            make("d.md", &[]),
        ];
        link_related(&mut entries);
        assert_eq!(entries[0].related, vec!["b", "c"]);
        assert_eq!(entries[1].related, vec!["a"]);
        assert!(entries[4].related.is_empty());
    }

    #[test]
    fn test_load_missing_and_corrupt_index() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.json");
        assert!(load_index(&path).is_none());

        std::fs::write(&path, "{not json").unwrap();
        assert!(load_index(&path).is_none());

        let snap = snapshot("m", vec![]);
        save_index(&path, &snap).unwrap();
        let loaded = load_index(&path).unwrap();
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
        assert_eq!(loaded.model, "m");
    }
}
