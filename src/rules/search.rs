//! Searching and exporting rules records.
//!
//! [`RulesCatalog`] keeps every table it has read in memory until
//! [`RulesCatalog::refresh`] drops it. Uid lookups go through the master
//! index, loaded from disk when configured and built on first use otherwise.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::normalize::{spell_class_names, NormalizedRecord};
use super::table::{
    build_master_index, load_master_index, read_table, resolve_category, save_master_index,
    MasterIndex,
};
use super::{compact, tokens, truthy};
use crate::config::{Config, RulesConfig};
use crate::markdown::display_value;

/// Categories searched by `all`.
pub const ALL_CATEGORIES: &[&str] = &["spells", "items", "bestiary", "races", "classes", "feats"];

/// Maximum hits shown for an `all` search.
const INTERLEAVE_CAP: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub category: String,
    #[serde(flatten)]
    pub record: NormalizedRecord,
}

pub struct RulesCatalog {
    data_path: PathBuf,
    master_path: Option<PathBuf>,
    cache: HashMap<String, Vec<NormalizedRecord>>,
    master: Option<MasterIndex>,
}

impl RulesCatalog {
    pub fn new(data_path: impl Into<PathBuf>, master_path: Option<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            master_path,
            cache: HashMap::new(),
            master: None,
        }
    }

    pub fn from_config(config: &RulesConfig) -> Self {
        Self::new(config.data_path.clone(), config.master_index.clone())
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Records of a category, read on first access.
    pub fn table(&mut self, category: &str) -> &[NormalizedRecord] {
        let table = resolve_category(category);
        self.cache
            .entry(table.to_string())
            .or_insert_with(|| read_table(&self.data_path, table))
    }

    /// Re-read one category, or drop every cached category.
    pub fn refresh(&mut self, category: Option<&str>) {
        match category {
            Some(category) => {
                let table = resolve_category(category);
                let rows = read_table(&self.data_path, table);
                debug!("Refreshed {} ({} rows)", table, rows.len());
                self.cache.insert(table.to_string(), rows);
            }
            None => self.cache.clear(),
        }
    }

    /// The master index, loaded or built on first use.
    pub fn master_index(&mut self) -> Result<&MasterIndex> {
        if self.master.is_none() {
            let loaded = self.master_path.as_deref().and_then(load_master_index);
            let index = match loaded {
                Some(index) => index,
                None => self.build_index()?,
            };
            self.master = Some(index);
        }
        Ok(self.master.get_or_insert_with(MasterIndex::new))
    }

    /// Rebuild the master index, writing it to `out` (or the configured
    /// path) when one is given.
    pub fn rebuild_master_index(&mut self, out: Option<&Path>) -> Result<&MasterIndex> {
        let index = build_master_index(&self.data_path);
        if let Some(path) = out.or(self.master_path.as_deref()) {
            save_master_index(path, &index)?;
            info!("Wrote master index to {}", path.display());
        }
        Ok(self.master.insert(index))
    }

    fn build_index(&self) -> Result<MasterIndex> {
        let index = build_master_index(&self.data_path);
        if let Some(path) = &self.master_path {
            save_master_index(path, &index)?;
        }
        Ok(index)
    }

    pub fn get_by_uid(&mut self, uid: &str) -> Result<Option<NormalizedRecord>> {
        let table = self.master_index()?.values().find_map(|bucket| {
            bucket.get(uid).map(|loc| {
                if loc.category == "class" {
                    "classes".to_string()
                } else {
                    loc.category.clone()
                }
            })
        });
        let Some(table) = table else {
            return Ok(None);
        };
        Ok(self.table(&table).iter().find(|r| r.uid == uid).cloned())
    }

    /// Flat JSON for a character sheet.
    pub fn export_for_sheet(&mut self, uid: &str) -> Result<Option<Value>> {
        Ok(self.get_by_uid(uid)?.map(|record| sheet_payload(&record)))
    }

    /// Records matching `query` in `category` (`all` for the common ones).
    pub fn search(&mut self, query: &str, category: &str) -> Vec<SearchHit> {
        let query_tokens = tokens(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let compact_query = query_tokens.concat();

        let categories: Vec<&str> = if category == "all" {
            ALL_CATEGORIES.to_vec()
        } else {
            vec![resolve_category(category)]
        };

        let mut hits = Vec::new();
        for cat in categories {
            for record in self.table(cat) {
                if record_matches(record, &query_tokens, &compact_query) {
                    hits.push(SearchHit {
                        category: cat.to_string(),
                        record: record.clone(),
                    });
                }
            }
        }
        hits.sort_by_key(|hit| rank(&hit.record, &compact_query));
        hits
    }
}

/// One query token must equal a blob token or sit inside the name or
/// parent; several tokens must appear together in the compacted blob,
/// name, or parent.
pub fn record_matches(record: &NormalizedRecord, query_tokens: &[String], compact_query: &str) -> bool {
    let name = compact(&record.name);
    let parent = record.parent.as_deref().map(compact).unwrap_or_default();

    if let [token] = query_tokens {
        record.search.split(' ').any(|t| t == token)
            || name.contains(token.as_str())
            || parent.contains(token.as_str())
    } else {
        compact(&record.search).contains(compact_query)
            || name.contains(compact_query)
            || parent.contains(compact_query)
    }
}

/// 0 for exact name matches, 1 for name prefixes, 2 otherwise.
fn rank(record: &NormalizedRecord, compact_query: &str) -> u8 {
    let name = compact(&record.name);
    if name == compact_query {
        0
    } else if name.starts_with(compact_query) {
        1
    } else {
        2
    }
}

/// Round-robin hits across categories (first-seen order) so one large
/// category does not crowd out the rest.
pub fn interleave(hits: Vec<SearchHit>, cap: usize) -> Vec<SearchHit> {
    let mut groups: Vec<(String, std::collections::VecDeque<SearchHit>)> = Vec::new();
    for hit in hits {
        match groups.iter_mut().find(|(c, _)| *c == hit.category) {
            Some((_, group)) => group.push_back(hit),
            None => groups.push((hit.category.clone(), std::collections::VecDeque::from([hit]))),
        }
    }

    let mut out = Vec::new();
    loop {
        let mut added = false;
        for (_, group) in groups.iter_mut() {
            if out.len() >= cap {
                return out;
            }
            if let Some(hit) = group.pop_front() {
                out.push(hit);
                added = true;
            }
        }
        if !added {
            return out;
        }
    }
}

fn or_null(value: Option<&Value>) -> Value {
    value.cloned().unwrap_or(Value::Null)
}

fn text_or_null(text: &str) -> Value {
    if text.is_empty() {
        Value::Null
    } else {
        Value::String(text.to_string())
    }
}

pub fn sheet_payload(record: &NormalizedRecord) -> Value {
    let classes = record
        .raw
        .as_object()
        .map(spell_class_names)
        .unwrap_or_default();
    json!({
        "uid": record.uid,
        "name": record.name,
        "type": record.kind.as_str(),
        "source": text_or_null(&record.source),
        "description": text_or_null(&record.description),
        "rarity": text_or_null(&record.rarity),
        "level": or_null(record.level.as_ref()),
        "school": or_null(record.school.as_ref().filter(|v| truthy(Some(*v)))),
        "weight": or_null(record.weight.as_ref()),
        "attunement": or_null(record.attunement.as_ref()),
        "traits": record.traits,
        "classes": classes,
        "race": record.race,
        "speed": record.speed,
        "value": record.value,
        "raw": record.raw,
    })
}

/// Markdown preview of a record.
pub fn format_preview(record: &NormalizedRecord) -> String {
    let mut lines: Vec<String> = Vec::new();
    if !record.description.is_empty() {
        lines.push(record.description.clone());
    }
    if !record.traits.is_empty() {
        lines.push(format!("**Traits:** {}", record.traits.join(", ")));
    }
    for (label, value) in [
        ("Race", &record.race),
        ("Creature Type", &record.creature_type),
        ("Size", &record.size),
        ("Speed", &record.speed),
    ] {
        if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
            lines.push(format!("**{}:** {}", label, v));
        }
    }

    let shown = |v: &Option<Value>| v.as_ref().filter(|v| truthy(Some(*v))).map(display_value);
    let meta: [(&str, Option<String>); 10] = [
        ("Type", Some(record.kind.as_str().to_string())),
        ("Rarity", Some(record.rarity.clone()).filter(|s| !s.is_empty())),
        ("Source", Some(record.source.clone()).filter(|s| !s.is_empty())),
        ("Requirements", record.requirements.clone()),
        ("Weight", shown(&record.weight)),
        ("Attunement", shown(&record.attunement)),
        ("Level", shown(&record.level)),
        ("School", shown(&record.school)),
        ("Strength", Some(record.strength.to_string())),
        ("Value", (record.value != 0.0).then(|| record.value.to_string())),
    ];
    for (label, value) in meta {
        if let Some(v) = value {
            lines.push(format!("**{}:** {}", label, v));
        }
    }

    if let Some(class) = &record.class {
        lines.push(format!("**Class:** {}", class));
    }
    if let Some(sub) = record.raw.get("subclass").filter(|v| truthy(Some(*v))) {
        lines.push(format!("**Subclass:** {}", display_value(sub)));
    }

    format!("### {}\n\n{}\n", record.name, lines.join("\n\n"))
}

/// `vf rules search`
pub fn run_rules_search(config: &Config, query: &str, category: &str, limit: usize) -> Result<()> {
    let mut catalog = RulesCatalog::from_config(&config.rules);
    let mut hits = catalog.search(query, category);
    if category == "all" {
        hits = interleave(hits, INTERLEAVE_CAP);
    }

    if hits.is_empty() {
        println!("No results for \"{}\".", query);
        return Ok(());
    }
    println!("rules search");
    println!("  query: {}", query);
    println!("  hits: {}", hits.len());
    for hit in hits.iter().take(limit) {
        println!("  {}: {} ({})", hit.category, hit.record.name, hit.record.source);
    }
    Ok(())
}

/// `vf rules get`
pub fn run_rules_get(config: &Config, uid: &str) -> Result<()> {
    let mut catalog = RulesCatalog::from_config(&config.rules);
    match catalog.get_by_uid(uid)? {
        Some(record) => print!("{}", format_preview(&record)),
        None => bail!("No rules record with uid {}", uid),
    }
    Ok(())
}

/// `vf rules export`
pub fn run_rules_export(config: &Config, uid: &str) -> Result<()> {
    let mut catalog = RulesCatalog::from_config(&config.rules);
    match catalog.export_for_sheet(uid)? {
        Some(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
        None => bail!("No rules record with uid {}", uid),
    }
    Ok(())
}

/// `vf rules index`
pub fn run_rules_index(config: &Config, out: Option<&Path>) -> Result<()> {
    let mut catalog = RulesCatalog::from_config(&config.rules);
    let index = catalog.rebuild_master_index(out)?;
    println!("rules index");
    for (category, bucket) in index.iter().filter(|(_, b)| !b.is_empty()) {
        println!("  {}: {}", category, bucket.len());
    }
    println!("  total: {}", index.values().map(|b| b.len()).sum::<usize>());
    Ok(())
}
