//! Vault retrieval (`ask_vault`).
//!
//! Three phases, each only consulted when the previous one found nothing:
//!
//! 1. **Literal**: case-insensitive substring match against frontmatter
//!    keys/values, tags (either direction), path, and text. Index order.
//! 2. **Semantic**: embed the query and rank every entry that has a vector
//!    by cosine similarity, descending. Ties keep index order.
//! 3. **Fallback**: the first `max_results` entries of the index.
//!
//! Hits are rendered as markdown blocks joined by `\n---\n`, the context
//! format consumed by the chat wrapper and the NPC simulator.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{self, cosine_similarity, EmbeddingProvider};
use crate::index::load_index;
use crate::markdown::display_value;
use crate::models::IndexEntry;

static NEWLINE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n+").expect("newline regex"));

/// Which phase produced the hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    Literal,
    Semantic,
    Fallback,
    /// Blank query.
    None,
}

#[derive(Debug)]
pub struct Retrieval<'a> {
    pub phase: MatchPhase,
    pub hits: Vec<&'a IndexEntry>,
}

/// Entries matching the query literally, in index order.
pub fn literal_matches<'a>(entries: &'a [IndexEntry], query: &str) -> Vec<&'a IndexEntry> {
    let q = query.to_lowercase();
    entries
        .iter()
        .filter(|entry| {
            let yaml_match = entry.yaml.iter().any(|(k, v)| {
                k.to_lowercase().contains(&q) || display_value(v).to_lowercase().contains(&q)
            });
            let tag_match = entry.tags.iter().any(|t| {
                let t = t.to_lowercase();
                !t.is_empty() && (q.contains(&t) || t.contains(&q))
            });
            yaml_match
                || tag_match
                || entry.path.to_lowercase().contains(&q)
                || entry.text.to_lowercase().contains(&q)
        })
        .collect()
}

/// Rank entries with a vector against a query vector, best first.
pub fn rank_by_similarity<'a>(
    entries: &'a [IndexEntry],
    query_vec: &[f32],
    limit: usize,
) -> Vec<&'a IndexEntry> {
    let mut scored: Vec<(f32, &IndexEntry)> = entries
        .iter()
        .filter(|e| e.has_embedding())
        .map(|e| (cosine_similarity(&e.embedding, query_vec), e))
        .collect();

    // Stable: equal scores keep index order.
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored.into_iter().map(|(_, e)| e).collect()
}

/// Run the three retrieval phases.
pub async fn retrieve<'a>(
    entries: &'a [IndexEntry],
    query: &str,
    provider: &dyn EmbeddingProvider,
    max_results: usize,
) -> Retrieval<'a> {
    if query.trim().is_empty() {
        return Retrieval {
            phase: MatchPhase::None,
            hits: Vec::new(),
        };
    }

    let literal = literal_matches(entries, query);
    debug!("Literal matches for {:?}: {}", query, literal.len());
    if !literal.is_empty() {
        return Retrieval {
            phase: MatchPhase::Literal,
            hits: literal,
        };
    }

    match embedding::embed_query(provider, query).await {
        Ok(query_vec) => {
            let ranked = rank_by_similarity(entries, &query_vec, max_results);
            debug!("Semantic matches for {:?}: {}", query, ranked.len());
            if !ranked.is_empty() {
                return Retrieval {
                    phase: MatchPhase::Semantic,
                    hits: ranked,
                };
            }
        }
        Err(e) => warn!("Semantic search failed: {:#}", e),
    }

    Retrieval {
        phase: MatchPhase::Fallback,
        hits: entries.iter().take(max_results).collect(),
    }
}

/// Render one hit as a context block.
pub fn render_entry(entry: &IndexEntry, config: &RetrievalConfig) -> String {
    let yaml_preview = entry
        .yaml
        .iter()
        .map(|(k, v)| format!("{}: {}", k, display_value(v)))
        .collect::<Vec<_>>()
        .join(", ");

    let heading_preview = entry
        .headings
        .iter()
        .take(config.max_headings)
        .cloned()
        .collect::<Vec<_>>()
        .join(" | ");

    let head: String = entry.text.chars().take(config.excerpt_chars).collect();
    let excerpt = NEWLINE_RUNS.replace_all(&head, " ");

    let related = if entry.related.is_empty() {
        "None".to_string()
    } else {
        entry
            .related
            .iter()
            .map(|r| format!("- [[{}]]", r))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "**{}**\nYAML: {}\nHeadings: {}\n\nExcerpt:\n{}...\n\n**Related Files**\n{}",
        entry.path, yaml_preview, heading_preview, excerpt, related
    )
}

/// Render at most `max_results` hits, joined by `\n---\n`.
pub fn render_context(hits: &[&IndexEntry], config: &RetrievalConfig) -> String {
    hits.iter()
        .take(config.max_results)
        .map(|e| render_entry(e, config))
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Reduce a full context to the first block's header and excerpt.
pub fn concise(detailed: &str) -> String {
    let first = detailed.split("\n---\n").next().unwrap_or(detailed);
    let lines: Vec<&str> = first.split('\n').collect();

    let header = lines
        .iter()
        .find(|l| l.starts_with("**"))
        .copied()
        .unwrap_or("");
    let excerpt = lines
        .iter()
        .position(|l| l.starts_with("Excerpt:"))
        .map(|i| lines[i..(i + 3).min(lines.len())].join("\n"))
        .unwrap_or_default();

    [header.to_string(), excerpt]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Loaded index plus the provider used to embed queries.
pub struct Retriever {
    entries: Vec<IndexEntry>,
    provider: Box<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        entries: Vec<IndexEntry>,
        provider: Box<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            entries,
            provider,
            config,
        }
    }

    /// Load the persisted index and build the configured provider.
    pub fn open(config: &Config) -> Self {
        let entries = load_index(&config.index.path)
            .map(|s| s.entries)
            .unwrap_or_default();
        if entries.is_empty() {
            warn!(
                "Vault index is empty ({}); run `vf index build`",
                config.index.path.display()
            );
        }
        Self::new(
            entries,
            embedding::create_provider(&config.openai),
            config.retrieval.clone(),
        )
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.config.max_results = max_results.max(1);
        self
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn replace_entries(&mut self, entries: Vec<IndexEntry>) {
        self.entries = entries;
    }

    pub async fn retrieve(&self, query: &str) -> Retrieval<'_> {
        retrieve(
            &self.entries,
            query,
            self.provider.as_ref(),
            self.config.max_results,
        )
        .await
    }

    /// Full context for a query; empty for a blank query.
    pub async fn ask_vault(&self, query: &str) -> String {
        let result = self.retrieve(query).await;
        let context = render_context(&result.hits, &self.config);
        debug!(
            "ask_vault {:?}: {:?}, {} chars",
            query,
            result.phase,
            context.len()
        );
        context
    }

    /// Header and excerpt of the best hit.
    pub async fn ask_vault_concise(&self, query: &str) -> String {
        concise(&self.ask_vault(query).await)
    }
}

/// `vf ask`
pub async fn run_ask(
    config: &Config,
    query: &str,
    concise_mode: bool,
    limit: Option<usize>,
) -> Result<()> {
    let mut retriever = Retriever::open(config);
    if let Some(limit) = limit {
        retriever = retriever.with_max_results(limit);
    }

    let output = if concise_mode {
        retriever.ask_vault_concise(query).await
    } else {
        retriever.ask_vault(query).await
    };

    if output.is_empty() {
        println!("No results.");
    } else {
        println!("{}", output);
    }
    Ok(())
}
