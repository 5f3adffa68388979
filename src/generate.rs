//! Note generation from vault context.
//!
//! `vf generate npc|location|item` asks the chat model for a JSON object
//! with a fixed set of fields, fills a `{{field}}` template with it and
//! appends the result to `{folder}/{slug}.md`. References to locations,
//! factions and NPCs are rendered as wikilinks.
//!
//! `vf expand <topic>` asks the model whether the vault already covers a
//! topic. A covered topic with a note gets an `## Added Context` section
//! (or a model-rewritten body); an uncovered one is created from a note
//! template in `[generate].templates_folder`.

use anyhow::{bail, Result};
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::chat::{ChatModel, OpenAIChat};
use crate::config::{Config, GenerateConfig};
use crate::markdown::{frontmatter, split_frontmatter};
use crate::models::ChatMessage;
use crate::retrieve::Retriever;
use crate::vault::Vault;

/// Used when no template note exists for a kind.
pub const DEFAULT_TEMPLATE: &str = "# {{name}}\n\n## Description\n{{description}}";

const UNKNOWN: &str = "Unknown";
const MAX_SLUG_CHARS: usize = 120;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(\w+)\}\}").expect("placeholder regex"));

static SLUG_UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[/\\:*?"<>|#^\[\]]+"#).expect("slug regex"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Npc,
    Location,
    Item,
}

impl EntityKind {
    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Npc => "NPC",
            EntityKind::Location => "Location",
            EntityKind::Item => "Item",
        }
    }

    /// Fields requested from the model, in template order.
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::Npc => &[
                "name",
                "aliases",
                "race",
                "gender",
                "age",
                "role",
                "faction",
                "location",
                "alignment",
                "status",
                "voice",
                "tone",
                "accent",
                "description",
                "personality",
                "abilities",
            ],
            EntityKind::Location => &[
                "name",
                "region",
                "population",
                "government",
                "faction",
                "alignment",
                "status",
                "description",
                "npcs",
                "history",
            ],
            EntityKind::Item => &[
                "name",
                "rarity",
                "material",
                "origin",
                "faction",
                "value",
                "status",
                "description",
                "abilities",
                "lore",
            ],
        }
    }

    /// Folder a linked field points into, `None` for plain fields.
    fn link_folder(self, field: &str, config: &GenerateConfig) -> Option<String> {
        let folder = match (self, field) {
            (_, "faction") => &config.faction_folder,
            (EntityKind::Npc, "location") | (EntityKind::Item, "origin") => {
                &config.location_folder
            }
            (EntityKind::Location, "npcs") => &config.npc_folder,
            _ => return None,
        };
        Some(folder.trim_matches('/').to_string())
    }

    pub fn folder(self, config: &GenerateConfig) -> &str {
        match self {
            EntityKind::Npc => &config.npc_folder,
            EntityKind::Location => &config.location_folder,
            EntityKind::Item => &config.item_folder,
        }
    }

    fn context_query(self, name: &str) -> String {
        match self {
            EntityKind::Npc => format!(
                "Provide relevant lore, history, or notes about NPCs, factions, and locations related to: {}",
                or_default(name, "this NPC")
            ),
            EntityKind::Location => format!(
                "Provide relevant lore, history, and connections for {}, including factions and NPCs.",
                or_default(name, "this location")
            ),
            EntityKind::Item => format!(
                "Provide relevant lore, history, or notes about items, locations, and factions related to: {}",
                or_default(name, "this item")
            ),
        }
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "npc" => Ok(EntityKind::Npc),
            "location" => Ok(EntityKind::Location),
            "item" => Ok(EntityKind::Item),
            other => Err(format!("unknown kind '{}' (expected npc, location or item)", other)),
        }
    }
}

fn or_default<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

/// Parse a JSON object from a model reply, tolerating a code fence.
pub fn parse_json_reply(reply: &str) -> Option<Map<String, Value>> {
    let mut text = reply.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest
            .strip_prefix("json")
            .or_else(|| rest.strip_prefix("JSON"))
            .unwrap_or(rest);
        text = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            warn!("Model reply is JSON but not an object");
            None
        }
        Err(e) => {
            warn!("Model reply is not JSON: {}", e);
            None
        }
    }
}

/// File name for a note title: unsafe characters dropped, spaces as `_`.
pub fn safe_slug(name: &str) -> String {
    let cleaned = SLUG_UNSAFE.replace_all(name, " ");
    let collapsed = WHITESPACE.replace_all(cleaned.trim(), "_");
    let slug: String = collapsed.chars().take(MAX_SLUG_CHARS).collect();
    if slug.is_empty() {
        "Untitled".to_string()
    } else {
        slug
    }
}

/// Text of a field value; blank values are `None`.
fn field_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| field_text(Some(v)))
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

/// `[[folder/Name]]` for each name of a string or list value.
fn link_text(folder: &str, value: Option<&Value>) -> Option<String> {
    let link = |name: &str| {
        let name = name.trim().trim_start_matches("[[").trim_end_matches("]]");
        if folder.is_empty() {
            format!("[[{}]]", name)
        } else {
            format!("[[{}/{}]]", folder, name)
        }
    };
    let names: Vec<String> = match value? {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().filter_map(|v| field_text(Some(v))).collect(),
        other => return field_text(Some(other)),
    };
    let links: Vec<String> = names
        .iter()
        .filter(|n| !n.trim().is_empty() && !n.trim().eq_ignore_ascii_case(UNKNOWN))
        .map(|n| link(n.as_str()))
        .collect();
    (!links.is_empty()).then(|| links.join(", "))
}

/// Replace every `{{key}}` with its value; unknown keys become `Unknown`.
pub fn fill_template(template: &str, values: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            field_text(values.get(&caps[1])).unwrap_or_else(|| UNKNOWN.to_string())
        })
        .into_owned()
}

/// Append to a note, or create it.
pub fn upsert_append(vault: &Vault, rel: &str, content: &str) -> Result<bool> {
    if vault.exists(rel) {
        let current = vault.read(rel)?;
        vault.write(rel, &format!("{}\n{}", current, content))?;
        Ok(true)
    } else {
        vault.write(rel, content)?;
        Ok(false)
    }
}

fn note_path(folder: &str, name: &str) -> String {
    let folder = folder.trim_matches('/');
    let slug = safe_slug(name);
    if folder.is_empty() {
        format!("{}.md", slug)
    } else {
        format!("{}/{}.md", folder, slug)
    }
}

/// Result of `generate`.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub name: String,
    pub path: String,
    /// True when the note existed and the entry was appended.
    pub appended: bool,
}

/// What the model thinks the vault knows about a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicStatus {
    Exists,
    Partial,
    Missing,
}

impl TopicStatus {
    fn from_reply(reply: &str) -> Option<Self> {
        let map = parse_json_reply(reply)?;
        match map.get("status")?.as_str()?.trim().to_ascii_lowercase().as_str() {
            "exists" => Some(TopicStatus::Exists),
            "partial" => Some(TopicStatus::Partial),
            "missing" => Some(TopicStatus::Missing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExpandOptions {
    /// Text to add to an existing note.
    pub addition: Option<String>,
    /// Let the model work the addition into the body.
    pub integrate: bool,
    /// Template name (basename in the templates folder) for a new note.
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expansion {
    /// Note exists but there was nothing to add.
    Unchanged { path: String },
    Updated { path: String, integrated: bool },
    Created { path: String, template: String },
}

pub struct Generator<'a> {
    pub vault: &'a Vault,
    pub config: &'a GenerateConfig,
    pub retriever: Option<&'a Retriever>,
    pub chat: &'a dyn ChatModel,
}

impl Generator<'_> {
    async fn context(&self, query: &str) -> String {
        match self.retriever {
            Some(retriever) => retriever.ask_vault(query).await,
            None => String::new(),
        }
    }

    fn template_for(&self, kind: EntityKind) -> Result<String> {
        let rel = format!(
            "{}/{}.md",
            self.config.templates_folder.trim_matches('/'),
            kind.label()
        );
        if self.vault.exists(&rel) {
            debug!("Using template {}", rel);
            return self.vault.read(&rel);
        }
        Ok(DEFAULT_TEMPLATE.to_string())
    }

    /// Generate a note of `kind`. A blank `name` lets the model pick one.
    pub async fn generate(
        &self,
        kind: EntityKind,
        name: &str,
        prompt: &str,
    ) -> Result<Generated> {
        if prompt.trim().is_empty() {
            bail!("A description is required to generate {}", kind.label());
        }
        let name = name.trim();
        let context = self.context(&kind.context_query(name)).await;

        let messages = vec![
            ChatMessage::system(format!(
                "Reply ONLY with valid JSON. JSON must include ALL fields: {}. If unsure, use 'Unknown'.",
                kind.fields().join(", ")
            )),
            ChatMessage::user(format!(
                "{} Name: {}\nPrompt: {}\n\nRelevant context from vault:\n{}",
                kind.label(),
                or_default(name, "Generate a fitting name"),
                prompt.trim(),
                context
            )),
        ];
        let reply = self.chat.complete(&messages, None).await?;

        let mut fields = parse_json_reply(&reply).unwrap_or_else(|| {
            let mut fallback = Map::new();
            fallback.insert("description".to_string(), Value::from(reply.trim()));
            fallback
        });
        if !name.is_empty() {
            fields.insert("name".to_string(), Value::from(name));
        }
        let name = match field_text(fields.get("name")) {
            Some(name) => name,
            None => {
                let generated = format!(
                    "Generated_{}_{}",
                    kind.label(),
                    chrono::Utc::now().timestamp_millis()
                );
                fields.insert("name".to_string(), Value::from(generated.clone()));
                generated
            }
        };

        let mut values = Map::new();
        for &field in kind.fields() {
            let text = match kind.link_folder(field, self.config) {
                Some(folder) => link_text(&folder, fields.get(field)),
                None => field_text(fields.get(field)),
            };
            let text = text.unwrap_or_else(|| UNKNOWN.to_string());
            values.insert(field.to_string(), Value::from(text));
        }
        let content = fill_template(&self.template_for(kind)?, &values);

        let path = note_path(kind.folder(self.config), &name);
        let appended = upsert_append(self.vault, &path, &content)?;
        info!("Generated {} {} at {}", kind.label(), name, path);
        Ok(Generated {
            name,
            path,
            appended,
        })
    }

    /// Note whose basename matches `topic`, ignoring case and templates.
    fn find_topic_note(&self, topic: &str) -> Result<Option<String>> {
        let templates = format!("{}/", self.config.templates_folder.trim_matches('/'));
        let wanted = topic.trim().to_lowercase();
        Ok(self
            .vault
            .markdown_files()?
            .into_iter()
            .filter(|f| !f.path.starts_with(&templates))
            .find(|f| f.basename().to_lowercase() == wanted)
            .map(|f| f.path))
    }

    pub async fn expand(&self, topic: &str, options: &ExpandOptions) -> Result<Expansion> {
        let topic = topic.trim();
        if topic.is_empty() {
            bail!("Topic must not be empty");
        }
        let context = self
            .context(&format!("Provide all known details about: {}", topic))
            .await;

        let messages = vec![
            ChatMessage::system(
                "Reply ONLY with JSON of the form {\"status\": \"exists\" | \"partial\" | \"missing\"}.",
            ),
            ChatMessage::user(format!("Topic: {}\nVault context:\n{}", topic, context)),
        ];
        let reply = self.chat.complete(&messages, None).await?;
        let Some(status) = TopicStatus::from_reply(&reply) else {
            bail!("Model did not return a topic status: {}", reply.trim());
        };
        debug!("Topic {:?}: {:?}", topic, status);

        if status != TopicStatus::Missing {
            if let Some(path) = self.find_topic_note(topic)? {
                return self.add_to_note(path, options).await;
            }
            debug!("No note named {:?}; creating one", topic);
        }
        self.create_from_template(topic, &context, options).await
    }

    async fn add_to_note(&self, path: String, options: &ExpandOptions) -> Result<Expansion> {
        let Some(addition) = options
            .addition
            .as_deref()
            .filter(|a| !a.trim().is_empty())
        else {
            return Ok(Expansion::Unchanged { path });
        };
        let content = self.vault.read(&path)?;
        let (yaml, body) = split_frontmatter(&content);
        let header = match yaml {
            Some(_) => &content[..content.len() - body.len()],
            None => "",
        };

        let new_body = if options.integrate {
            let messages = vec![
                ChatMessage::system(
                    "Expand the note body. Do NOT touch YAML frontmatter. Return ONLY updated body content.",
                ),
                ChatMessage::user(format!("Current body:\n{}\n\nAddition:\n{}", body, addition)),
            ];
            self.chat.complete(&messages, None).await?
        } else {
            format!("{}\n\n## Added Context\n{}", body.trim_end(), addition.trim())
        };

        self.vault.write(&path, &format!("{}{}\n", header, new_body.trim()))?;
        info!("Expanded {}", path);
        Ok(Expansion::Updated {
            path,
            integrated: options.integrate,
        })
    }

    async fn create_from_template(
        &self,
        topic: &str,
        context: &str,
        options: &ExpandOptions,
    ) -> Result<Expansion> {
        let folder = self.config.templates_folder.trim_matches('/');
        let templates = self.vault.list_folder(folder)?;
        if templates.is_empty() {
            bail!("No templates found in {}", folder);
        }
        let template = match options.template.as_deref() {
            Some(wanted) => match templates.iter().find(|t| t.eq_ignore_ascii_case(wanted)) {
                Some(t) => t.clone(),
                None => bail!(
                    "Template not found: {} (available: {})",
                    wanted,
                    templates.join(", ")
                ),
            },
            None if templates.len() == 1 => templates[0].clone(),
            None => bail!(
                "Several templates available ({}); choose one with --template",
                templates.join(", ")
            ),
        };

        let source = self.vault.read(&format!("{}/{}.md", folder, template))?;
        let (_, body) = split_frontmatter(&source);
        let output_folder = frontmatter(&source)
            .get("folder")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}s", template));

        let messages = vec![
            ChatMessage::system(
                "You are an assistant generating structured Obsidian markdown notes.\n\
                 Rules:\n\
                 - Reply ONLY with JSON.\n\
                 - JSON keys must match placeholders in the template.\n\
                 - For any references to other entities (NPCs, Factions, Guilds, Locations, Items), \
                 always format them as Obsidian wiki links: [[Entity Name]].\n\
                 - Fill all placeholders. If no info, use \"Unknown\".",
            ),
            ChatMessage::user(format!(
                "Topic: {}\nContext:\n{}\nTemplate:\n{}",
                topic, context, body
            )),
        ];
        let reply = self.chat.complete(&messages, None).await?;
        let fields = parse_json_reply(&reply).unwrap_or_default();
        let content = fill_template(body, &fields);

        let path = note_path(&output_folder, topic);
        upsert_append(self.vault, &path, &content)?;
        info!("Created {} from template {}", path, template);
        Ok(Expansion::Created { path, template })
    }
}

/// `vf generate`
pub async fn run_generate(
    config: &Config,
    kind: EntityKind,
    name: &str,
    prompt: &str,
) -> Result<()> {
    let vault = Vault::open(&config.vault)?;
    let retriever = Retriever::open(config);
    let chat = OpenAIChat::new(&config.openai)?;
    let generator = Generator {
        vault: &vault,
        config: &config.generate,
        retriever: Some(&retriever),
        chat: &chat,
    };
    let generated = generator.generate(kind, name, prompt).await?;

    println!("generate {}", kind.label().to_lowercase());
    println!("  name: {}", generated.name);
    println!(
        "  note: {} ({})",
        generated.path,
        if generated.appended { "appended" } else { "created" }
    );
    Ok(())
}

/// `vf expand`
pub async fn run_expand(config: &Config, topic: &str, options: &ExpandOptions) -> Result<()> {
    let vault = Vault::open(&config.vault)?;
    let retriever = Retriever::open(config);
    let chat = OpenAIChat::new(&config.openai)?;
    let generator = Generator {
        vault: &vault,
        config: &config.generate,
        retriever: Some(&retriever),
        chat: &chat,
    };

    println!("expand: {}", topic);
    match generator.expand(topic, options).await? {
        Expansion::Unchanged { path } => {
            println!("  note: {} (exists)", path);
            println!("  pass --add \"...\" to add to it");
        }
        Expansion::Updated { path, integrated } => {
            println!(
                "  note: {} ({})",
                path,
                if integrated { "body rewritten" } else { "added context" }
            );
        }
        Expansion::Created { path, template } => {
            println!("  note: {} (created from {})", path, template);
        }
    }
    Ok(())
}
