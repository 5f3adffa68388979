//! Reading categories ("tables") out of a 5etools `data/` folder.
//!
//! A category's files come from, in order of preference:
//!
//! 1. the category folder's `index.json` (values are file names),
//! 2. the known item files for `items`,
//! 3. a recursive scan for `*.json` whose resolved table name matches.
//!
//! Files with `foundry` in their name are always skipped. Rows sharing a
//! uid (`name|source`) across files are deep-merged in file order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::merge::deep_merge_raw;
use super::normalize::{normalize_row, NormalizedRecord};
use super::truthy;
use crate::markdown::display_value;

/// Categories covered by the master index.
pub const MASTER_CATEGORIES: &[&str] = &[
    "items",
    "spells",
    "classes",
    "races",
    "backgrounds",
    "feats",
    "monsters",
    "vehicles",
    "optionalFeatures",
    "variantRules",
    "conditionsDiseases",
    "traps",
    "hazards",
    "tables",
    "cults",
    "deities",
    "psionics",
    "maneuvers",
    "invocations",
    "adventures",
    "books",
    "languages",
    "skills",
    "loot",
    "generated",
];

const ITEM_FILES: &[&str] = &["items-base.json", "items.json", "fluff-items.json"];

/// Canonical table name for a category alias.
pub fn resolve_category(category: &str) -> &str {
    match category {
        "monsters" => "bestiary",
        "class" => "classes",
        other => other,
    }
}

/// Folder holding a category's `index.json`, if it has one.
fn index_folder(table: &str) -> Option<&'static str> {
    match table {
        "spells" => Some("spells"),
        "bestiary" => Some("bestiary"),
        "classes" => Some("class"),
        _ => None,
    }
}

/// Keys that hold a category's rows inside a data file.
fn row_keys(table: &str) -> &'static [&'static str] {
    match table {
        "spells" => &["spell", "spells"],
        "bestiary" => &["monster", "monsters"],
        "items" => &["item", "items", "baseitem"],
        "classes" => &["class"],
        "races" => &["race", "races"],
        "feats" => &["feat", "feats"],
        "backgrounds" => &["background", "backgrounds"],
        _ => &[],
    }
}

/// Table a data file belongs to, judged from its path.
pub fn resolve_table_name(data_path: &Path, file: &Path) -> String {
    let base = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let parent = file.parent().unwrap_or(data_path);

    if parent == data_path {
        for (needle, table) in [
            ("item", "items"),
            ("spell", "spells"),
            ("bestiary", "bestiary"),
            ("class", "classes"),
            ("adventure", "adventure"),
            ("book", "book"),
            ("race", "races"),
        ] {
            if base.contains(needle) {
                return table.to_string();
            }
        }
        return safe_table_name(&base);
    }

    let folder = parent
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    resolve_category(&safe_table_name(&folder)).to_string()
}

fn safe_table_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn is_foundry(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase().contains("foundry"))
        .unwrap_or(false)
}

/// Data files to read for a table.
pub fn files_for_table(data_path: &Path, table: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();

    if let Some(folder) = index_folder(table) {
        let index_path = data_path.join(folder).join("index.json");
        if index_path.is_file() {
            match read_json(&index_path) {
                Ok(Value::Object(index)) => {
                    for name in index.values().map(display_value) {
                        let path = data_path.join(folder).join(&name);
                        if !is_foundry(&path) && !files.contains(&path) {
                            files.push(path);
                        }
                    }
                }
                Ok(_) => warn!("{} is not an object", index_path.display()),
                Err(e) => warn!("Failed to read {}: {:#}", index_path.display(), e),
            }
        }
    }

    if table == "items" {
        for name in ITEM_FILES {
            let path = data_path.join(name);
            if path.is_file() && !files.contains(&path) {
                files.push(path);
            }
        }
    }

    if files.is_empty() {
        for entry in WalkDir::new(data_path).sort_by_file_name() {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("json")
                || is_foundry(path)
            {
                continue;
            }
            if resolve_table_name(data_path, path) == table {
                files.push(path.to_path_buf());
            }
        }
    }

    files
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Rows of a category inside one parsed file.
pub fn extract_rows(table: &str, file: &Value) -> Vec<Value> {
    match file {
        Value::Array(rows) => rows.clone(),
        Value::Object(obj) => {
            for key in row_keys(table) {
                if let Some(Value::Array(rows)) = obj.get(*key) {
                    return rows.clone();
                }
            }
            if !row_keys(table).is_empty() {
                return Vec::new();
            }
            obj.values()
                .find_map(|v| v.as_array().cloned())
                .unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

struct MergedRow {
    raw: Value,
    files: Vec<String>,
}

/// Read, merge, and normalize every row of a category.
///
/// Unreadable files and unnormalizable rows are logged and skipped.
pub fn read_table(data_path: &Path, category: &str) -> Vec<NormalizedRecord> {
    if !data_path.is_dir() {
        warn!("Rules data folder not found: {}", data_path.display());
        return Vec::new();
    }
    let table = resolve_category(category);

    let mut order: Vec<String> = Vec::new();
    let mut rows: HashMap<String, MergedRow> = HashMap::new();

    for file in files_for_table(data_path, table) {
        let parsed = match read_json(&file) {
            Ok(v) => v,
            Err(e) => {
                warn!("Skipping rules file: {:#}", e);
                continue;
            }
        };
        let rel = file
            .strip_prefix(data_path)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");

        for row in extract_rows(table, &parsed) {
            let Some(obj) = row.as_object() else { continue };
            let name = obj
                .get("name")
                .filter(|v| truthy(Some(*v)))
                .or_else(|| obj.get("title").filter(|v| truthy(Some(*v))));
            let Some(name) = name.map(display_value) else { continue };
            let source = obj
                .get("source")
                .filter(|v| truthy(Some(*v)))
                .map(display_value)
                .unwrap_or_else(|| "Unknown".to_string());
            let uid = format!("{}|{}", name, source);

            match rows.get_mut(&uid) {
                Some(merged) => {
                    merged.raw = deep_merge_raw(&merged.raw, &row);
                    if !merged.files.contains(&rel) {
                        merged.files.push(rel.clone());
                    }
                }
                None => {
                    let mut raw = row.clone();
                    // Rows keyed by `title` still need a name to normalize.
                    if let Value::Object(o) = &mut raw {
                        o.entry("name").or_insert_with(|| Value::String(name.clone()));
                    }
                    order.push(uid.clone());
                    rows.insert(
                        uid,
                        MergedRow {
                            raw,
                            files: vec![rel.clone()],
                        },
                    );
                }
            }
        }
    }

    let mut results = Vec::new();
    for uid in order {
        let Some(merged) = rows.remove(&uid) else { continue };
        let file = merged.files.join(",");

        let Some(mut record) = normalize_row(&merged.raw, Some(table)) else {
            warn!("Could not normalize {}", uid);
            continue;
        };
        record.uid = uid;
        record.file = Some(file.clone());

        let subs = match table {
            "races" => sub_records(&merged.raw, &["subraces", "subrace"], table, &record.name),
            "classes" => sub_records(&merged.raw, &["subclasses", "subclass"], table, &record.name),
            _ => Vec::new(),
        };
        results.push(record);
        for mut sub in subs {
            sub.file = Some(file.clone());
            results.push(sub);
        }
    }

    debug!("Read {} rows for {}", results.len(), table);
    results
}

/// Subraces/subclasses of a merged row as standalone records.
///
/// Each one starts from the parent row (minus its sub-lists), with the
/// sub-entry's own fields merged on top.
fn sub_records(raw: &Value, keys: &[&str], table: &str, parent: &str) -> Vec<NormalizedRecord> {
    let Some(obj) = raw.as_object() else {
        return Vec::new();
    };
    let Some(list) = keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_array)) else {
        return Vec::new();
    };

    let mut base: Map<String, Value> = obj.clone();
    for key in keys {
        base.remove(*key);
    }
    let parent_source = obj.get("source").filter(|v| truthy(Some(*v))).cloned();

    let mut out = Vec::new();
    for sub in list {
        let (name, overlay) = match sub {
            Value::String(s) => (s.clone(), Map::new()),
            Value::Object(o) => {
                let name = o
                    .get("name")
                    .or_else(|| o.get("subclass"))
                    .filter(|v| truthy(Some(*v)))
                    .map(display_value);
                match name {
                    Some(n) => (n, o.clone()),
                    None => continue,
                }
            }
            _ => continue,
        };

        let mut merged = deep_merge_raw(&Value::Object(base.clone()), &Value::Object(overlay));
        if let Value::Object(m) = &mut merged {
            m.insert("name".to_string(), Value::String(name));
            if !truthy(m.get("source")) {
                if let Some(src) = &parent_source {
                    m.insert("source".to_string(), src.clone());
                }
            }
        }

        if let Some(mut record) = normalize_row(&merged, Some(table)) {
            record.parent = Some(parent.to_string());
            out.push(record);
        }
    }
    out
}

/// Where a uid lives: `{category, file}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexLocation {
    pub category: String,
    pub file: String,
}

/// `{category: {uid: location}}`.
pub type MasterIndex = BTreeMap<String, BTreeMap<String, IndexLocation>>;

/// Index every uid of every known category.
pub fn build_master_index(data_path: &Path) -> MasterIndex {
    let mut index = MasterIndex::new();
    for category in MASTER_CATEGORIES {
        let table = resolve_category(category);
        let location_category = if table == "classes" { "class" } else { table };
        let bucket = index.entry(category.to_string()).or_default();
        for record in read_table(data_path, table) {
            bucket.insert(
                record.uid.clone(),
                IndexLocation {
                    category: location_category.to_string(),
                    file: record.file.clone().unwrap_or_default(),
                },
            );
        }
    }
    index
}

pub fn save_master_index(path: &Path, index: &MasterIndex) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(index)?)
        .with_context(|| format!("Failed to write master index: {}", path.display()))
}

pub fn load_master_index(path: &Path) -> Option<MasterIndex> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(index) => Some(index),
        Err(e) => {
            warn!("Ignoring corrupt master index {}: {}", path.display(), e);
            None
        }
    }
}
