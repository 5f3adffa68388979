//! Frontmatter, tag, and heading extraction for markdown notes.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::warn;

static INLINE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)#([\p{L}\p{N}_/\-]+)").expect("inline tag regex")
});

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+(.+?)\s*#*\s*$").expect("heading regex"));

/// Parsed view of a note.
#[derive(Debug, Clone, Default)]
pub struct NoteMeta {
    pub yaml: Map<String, Value>,
    pub tags: Vec<String>,
    pub headings: Vec<String>,
    pub body: String,
}

/// Split a leading `---` frontmatter block from the body.
///
/// Returns `(Some(yaml), body)` when the note opens with a closed block.
pub fn split_frontmatter(content: &str) -> (Option<&str>, &str) {
    let rest = match content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
    {
        Some(rest) => rest,
        None => return (None, content),
    };

    // Empty block: closing fence immediately.
    if let Some(body) = strip_closing_fence(rest) {
        return (Some(""), body);
    }

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if offset > 0 && trimmed == "---" {
            let yaml = rest[..offset].trim_end_matches(['\n', '\r']);
            let body = &rest[offset + line.len()..];
            return (Some(yaml), body);
        }
        offset += line.len();
    }

    (None, content)
}

fn strip_closing_fence(rest: &str) -> Option<&str> {
    if rest == "---" {
        return Some("");
    }
    rest.strip_prefix("---\n")
        .or_else(|| rest.strip_prefix("---\r\n"))
}

/// Parse a YAML frontmatter block into a JSON object.
///
/// Malformed YAML or a non-mapping document yields an empty map.
pub fn parse_yaml_block(yaml: &str) -> Map<String, Value> {
    match try_parse_yaml_block(yaml) {
        Ok(map) => map,
        Err(e) => {
            warn!("Ignoring malformed frontmatter: {:#}", e);
            Map::new()
        }
    }
}

/// Strict form of [`parse_yaml_block`]: only a blank block is empty.
pub fn try_parse_yaml_block(yaml: &str) -> Result<Map<String, Value>> {
    if yaml.trim().is_empty() {
        return Ok(Map::new());
    }
    let value = serde_yaml::from_str::<serde_yaml::Value>(yaml)
        .context("Malformed frontmatter")?;
    match yaml_to_json(value) {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => bail!("Frontmatter is not a mapping"),
    }
}

/// Frontmatter of a note as a JSON object (empty when absent).
pub fn frontmatter(content: &str) -> Map<String, Value> {
    match split_frontmatter(content) {
        (Some(yaml), _) => parse_yaml_block(yaml),
        (None, _) => Map::new(),
    }
}

/// Frontmatter for a read-modify-write: errors instead of dropping a
/// block it cannot parse.
pub fn try_frontmatter(content: &str) -> Result<Map<String, Value>> {
    match split_frontmatter(content) {
        (Some(yaml), _) => try_parse_yaml_block(yaml),
        (None, _) => Ok(Map::new()),
    }
}

/// Replace (or insert) the frontmatter block, keeping the body.
pub fn replace_frontmatter(content: &str, data: &Map<String, Value>) -> Result<String> {
    let (_, body) = split_frontmatter(content);
    let yaml = if data.is_empty() {
        String::new()
    } else {
        serde_yaml::to_string(data).context("Failed to serialize frontmatter")?
    };
    Ok(format!("---\n{}---\n{}", yaml, body))
}

/// Convert YAML into JSON, stringifying non-string keys and dropping tags.
pub fn yaml_to_json(value: serde_yaml::Value) -> Value {
    use serde_yaml::Value as Y;
    match value {
        Y::Null => Value::Null,
        Y::Bool(b) => Value::Bool(b),
        Y::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        Y::String(s) => Value::String(s),
        Y::Sequence(items) => Value::Array(items.into_iter().map(yaml_to_json).collect()),
        Y::Mapping(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                let key = match k {
                    Y::String(s) => s,
                    other => match yaml_to_json(other) {
                        Value::String(s) => s,
                        v => v.to_string(),
                    },
                };
                out.insert(key, yaml_to_json(v));
            }
            Value::Object(out)
        }
        Y::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

/// Tags from inline `#tag` tokens and the frontmatter `tags`/`tag` field.
pub fn extract_tags(body: &str, yaml: &Map<String, Value>) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        let tag = raw.trim().trim_start_matches('#').trim();
        if tag.is_empty() || tag.chars().all(|c| c.is_ascii_digit()) {
            return;
        }
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    };

    for key in ["tags", "tag"] {
        match yaml.get(key) {
            Some(Value::Array(items)) => {
                for item in items {
                    if let Some(s) = item.as_str() {
                        push(s);
                    }
                }
            }
            Some(Value::String(s)) => {
                for part in s.split([',', ' ']) {
                    push(part);
                }
            }
            _ => {}
        }
    }

    for line in prose_lines(body) {
        if HEADING.is_match(line) {
            // "# Title" is a heading, but "## Log #session" still carries a tag.
            let after_marks = line.trim_start_matches('#');
            for cap in INLINE_TAG.captures_iter(after_marks) {
                push(&cap[1]);
            }
            continue;
        }
        for cap in INLINE_TAG.captures_iter(line) {
            push(&cap[1]);
        }
    }

    tags
}

/// ATX headings outside fenced code blocks.
pub fn extract_headings(body: &str) -> Vec<String> {
    prose_lines(body)
        .filter_map(|line| HEADING.captures(line).map(|c| c[1].to_string()))
        .collect()
}

/// Split a note and extract everything the index needs.
pub fn parse_note(content: &str) -> NoteMeta {
    let (yaml_block, body) = split_frontmatter(content);
    let yaml = yaml_block.map(parse_yaml_block).unwrap_or_default();
    let tags = extract_tags(body, &yaml);
    let headings = extract_headings(body);
    NoteMeta {
        yaml,
        tags,
        headings,
        body: body.to_string(),
    }
}

/// Lines of the body that are not inside ``` or ~~~ fences.
fn prose_lines(body: &str) -> impl Iterator<Item = &str> {
    let mut fence: Option<&'static str> = None;
    body.lines().filter(move |line| {
        let trimmed = line.trim_start();
        match fence {
            Some(marker) => {
                if trimmed.starts_with(marker) {
                    fence = None;
                }
                false
            }
            None => {
                if trimmed.starts_with("```") {
                    fence = Some("```");
                    false
                } else if trimmed.starts_with("~~~") {
                    fence = Some("~~~");
                    false
                } else {
                    true
                }
            }
        }
    })
}

/// Render a JSON value the way frontmatter values are shown to users.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => value.to_string(),
    }
}
