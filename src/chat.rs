//! Chat-completion wrapper and chat notes.
//!
//! [`ChatModel`] is the seam to the completion endpoint; [`OpenAIChat`]
//! implements it over `POST {base_url}/chat/completions`.
//!
//! A chat note is a markdown file under `[chat].folder` holding a running
//! conversation:
//!
//! ```text
//! **You:** Who runs the Yawning Portal?
//! **GPT:** Durnan, a retired adventurer.
//! And who drinks there?
//! ```
//!
//! Responding to a note tags a trailing plain line as `**You:**`, turns
//! the recent lines into messages, adds vault context for the question,
//! and appends the reply as a `**GPT:**` line. A note whose last line is
//! already a reply is left alone.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{ChatConfig, Config, OpenAiConfig, VaultMode};
use crate::models::ChatMessage;
use crate::openai::OpenAiClient;
use crate::retrieve::Retriever;
use crate::vault::Vault;

const YOU: &str = "**You:**";
const GPT: &str = "**GPT:**";

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete a conversation. `model_override` replaces the default model.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model_override: Option<&str>,
    ) -> Result<String>;
}

pub struct OpenAIChat {
    client: OpenAiClient,
    model: String,
}

impl OpenAIChat {
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        Ok(Self {
            client: OpenAiClient::from_config(config)?,
            model: config.chat_model.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model_override: Option<&str>,
    ) -> Result<String> {
        let model = model_override.unwrap_or(&self.model);
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
        });
        debug!("chat/completions: model={} messages={}", model, messages.len());
        let json = self.client.post_json("chat/completions", &body).await?;
        Ok(json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

/// Prepend `Relevant vault info:` as a system message when there is context.
pub fn with_context(messages: Vec<ChatMessage>, context: &str) -> Vec<ChatMessage> {
    if context.is_empty() {
        return messages;
    }
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(ChatMessage::system(format!(
        "Relevant vault info:\n{}",
        context
    )));
    out.extend(messages);
    out
}

pub async fn chat_with_context(
    model: &dyn ChatModel,
    messages: Vec<ChatMessage>,
    context: &str,
    model_override: Option<&str>,
) -> Result<String> {
    model
        .complete(&with_context(messages, context), model_override)
        .await
}

/// A chat note ready to be answered.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTurn {
    /// Note content after tagging the last line.
    pub content: String,
    /// True when the last line was tagged and the note must be rewritten.
    pub rewritten: bool,
    pub question: String,
    pub messages: Vec<ChatMessage>,
}

/// Inspect a chat note. `None` when there is nothing to answer.
pub fn pending_turn(content: &str, max_lines: usize) -> Option<PendingTurn> {
    let all: Vec<&str> = content.split('\n').collect();
    let start = all.len().saturating_sub(max_lines);
    let mut lines: Vec<String> = all[start..]
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.to_string())
        .collect();

    let last = lines.last()?.clone();
    let mut rewritten = false;
    let mut new_content = content.to_string();

    if !last.starts_with(YOU) && !last.starts_with(GPT) {
        let tagged = format!("{} {}", YOU, last.trim());
        new_content = replace_last_line(content, &last, &tagged);
        if let Some(slot) = lines.last_mut() {
            *slot = tagged;
        }
        rewritten = true;
    }

    let last = lines.last()?;
    if !last.starts_with(YOU) {
        return None;
    }
    let question = last[YOU.len()..].trim().to_string();

    let messages = lines
        .iter()
        .map(|line| {
            if let Some(rest) = line.strip_prefix(YOU) {
                ChatMessage::user(rest.trim())
            } else if let Some(rest) = line.strip_prefix(GPT) {
                ChatMessage::assistant(rest.trim())
            } else {
                ChatMessage::user(line.as_str())
            }
        })
        .collect();

    Some(PendingTurn {
        content: new_content,
        rewritten,
        question,
        messages,
    })
}

/// Replace the last occurrence of the line `old` with `new`.
fn replace_last_line(content: &str, old: &str, new: &str) -> String {
    match content.rfind(old) {
        Some(pos) => format!("{}{}{}", &content[..pos], new, &content[pos + old.len()..]),
        None => format!("{}\n{}", content.trim_end(), new),
    }
}

/// Vault context for a question according to the chat settings.
pub async fn vault_context(
    config: &ChatConfig,
    retriever: Option<&Retriever>,
    query: &str,
) -> String {
    let Some(retriever) = retriever else {
        return String::new();
    };
    if !config.use_vault_context {
        return String::new();
    }
    match config.vault_mode {
        VaultMode::Full => retriever.ask_vault(query).await,
        VaultMode::Concise => retriever.ask_vault_concise(query).await,
    }
}

/// Answer a chat note. Returns the reply, or `None` if nothing was asked.
pub async fn respond_to_note(
    vault: &Vault,
    rel: &str,
    config: &ChatConfig,
    retriever: Option<&Retriever>,
    model: &dyn ChatModel,
) -> Result<Option<String>> {
    let content = vault.read(rel)?;
    let Some(turn) = pending_turn(&content, config.max_context_lines) else {
        debug!("{}: no pending question", rel);
        return Ok(None);
    };

    if turn.rewritten {
        vault.write(rel, &turn.content)?;
    }

    let context = vault_context(config, retriever, &turn.question).await;
    debug!("Vault context for {:?}: {} chars", turn.question, context.len());

    let reply = chat_with_context(model, turn.messages, &context, None).await?;
    vault.write(rel, &format!("{}\n{} {}\n", turn.content, GPT, reply))?;
    info!("Answered {}", rel);
    Ok(Some(reply))
}

/// True for markdown notes inside the chat folder.
pub fn is_chat_note(config: &ChatConfig, rel: &str) -> bool {
    let folder = config.folder.trim_matches('/');
    rel.ends_with(".md")
        && (folder.is_empty() || rel.starts_with(&format!("{}/", folder)))
}

/// `vf chat respond`
pub async fn run_chat_respond(config: &Config, note: &str) -> Result<()> {
    let vault = Vault::open(&config.vault)?;
    let rel = if note.ends_with(".md") {
        note.to_string()
    } else {
        format!("{}.md", note)
    };
    if !vault.exists(&rel) {
        return Err(anyhow!("Chat note not found: {}", rel));
    }
    if !is_chat_note(&config.chat, &rel) {
        warn!("{} is outside the chat folder {}", rel, config.chat.folder);
    }

    let model = OpenAIChat::new(&config.openai)?;
    let retriever = Retriever::open(config);

    match respond_to_note(&vault, &rel, &config.chat, Some(&retriever), &model).await? {
        Some(reply) => {
            println!("chat respond");
            println!("  note: {}", rel);
            println!("  reply: {} chars", reply.chars().count());
        }
        None => println!("No pending question in {}.", rel),
    }
    Ok(())
}
