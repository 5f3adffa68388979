//! Transcript narration.
//!
//! A transcript note marks who speaks with `[[Name]]` or `**[Name]:**`:
//!
//! ```text
//! [[Mira]]: Welcome back, travellers.
//! **[Durnan]:** Keep it down.
//! ```
//!
//! Acting a note voices the lines added since the last run. Each speaker
//! is looked up by note basename; only notes whose frontmatter says
//! `type: npc` are voiced, with their `voice` and `style` keys. Audio is
//! written as MP3 files under `[speech].audio_dir`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use crate::config::{Config, OpenAiConfig, SpeechConfig};
use crate::markdown::{display_value, frontmatter};
use crate::openai::OpenAiClient;
use crate::vault::Vault;

#[async_trait]
pub trait SpeechSynth: Send + Sync {
    /// Synthesize `input` with `voice`, returning MP3 bytes.
    async fn synthesize(&self, voice: &str, input: &str) -> Result<Vec<u8>>;
}

pub struct OpenAISpeech {
    client: OpenAiClient,
    model: String,
}

impl OpenAISpeech {
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        Ok(Self {
            client: OpenAiClient::from_config(config)?,
            model: config.speech_model.clone(),
        })
    }
}

#[async_trait]
impl SpeechSynth for OpenAISpeech {
    async fn synthesize(&self, voice: &str, input: &str) -> Result<Vec<u8>> {
        let body = json!({
            "model": self.model,
            "voice": voice,
            "input": input,
            "response_format": "mp3",
        });
        debug!("audio/speech: voice={} chars={}", voice, input.chars().count());
        self.client.post_bytes("audio/speech", &body).await
    }
}

/// Writes synthesized audio to numbered MP3 files.
pub struct AudioSink {
    dir: PathBuf,
    seq: AtomicUsize,
}

impl AudioSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicUsize::new(0),
        }
    }

    pub fn save(&self, label: &str, bytes: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create audio dir: {}", self.dir.display()))?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let path = self
            .dir
            .join(format!("{}-{:03}-{}.mp3", stamp, seq, slug(label)));
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write audio: {}", path.display()))?;
        Ok(path)
    }
}

fn slug(label: &str) -> String {
    let s: String = label
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let s = s.trim_matches('-').to_string();
    if s.is_empty() {
        "line".to_string()
    } else {
        s
    }
}

/// Prompt sent to the speech model for a transcript line.
pub fn voice_prompt(text: &str, voice: &str, style: &str) -> String {
    format!(
        "Render this line with the following voice profile:\n- Voice preset: {}\n- Speaking style: {}\nLine: {}",
        voice, style, text
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub speaker: String,
    pub dialogue: String,
}

/// A speaker marker at `at`: its name and where the marker ends.
fn marker_at(text: &str, at: usize) -> Option<(&str, usize)> {
    let rest = &text[at..];
    if let Some(inner) = rest.strip_prefix("[[") {
        let close = inner.find(']')?;
        if close == 0 || !inner[close..].starts_with("]]") {
            return None;
        }
        return Some((&inner[..close], at + 2 + close + 2));
    }
    if let Some(inner) = rest.strip_prefix("**[") {
        let close = inner.find(']')?;
        if close == 0 || !inner[close..].starts_with("]:**") {
            return None;
        }
        return Some((&inner[..close], at + 3 + close + 4));
    }
    None
}

/// Start of the next marker candidate at or after `from`.
fn next_candidate(text: &str, from: usize) -> Option<usize> {
    let a = text[from..].find("[[").map(|i| i + from);
    let b = text[from..].find("**[").map(|i| i + from);
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Split a transcript into speaker lines. A line's dialogue runs until the
/// next line that starts with a marker, or the end of the text.
pub fn parse_transcript(text: &str) -> Vec<TranscriptLine> {
    let mut lines = Vec::new();
    let mut pos = 0;

    while let Some(at) = next_candidate(text, pos) {
        let Some((name, after)) = marker_at(text, at) else {
            pos = at + 1;
            continue;
        };

        // `\s*:?\s*` between marker and dialogue.
        let mut start = after + (text[after..].len() - text[after..].trim_start().len());
        if text[start..].starts_with(':') {
            start += 1;
            start += text[start..].len() - text[start..].trim_start().len();
        }
        if start >= text.len() {
            break;
        }

        let search_from = start + text[start..].chars().next().map_or(1, char::len_utf8);
        let end = [text[search_from..].find("\n[["), text[search_from..].find("\n**[")]
            .into_iter()
            .flatten()
            .min()
            .map(|i| i + search_from)
            .unwrap_or(text.len());

        let speaker = name.trim();
        let dialogue = text[start..end].trim();
        if !speaker.is_empty() && !dialogue.is_empty() {
            lines.push(TranscriptLine {
                speaker: speaker.to_string(),
                dialogue: dialogue.to_string(),
            });
        }
        pos = end;
    }

    lines
}

/// Per-note byte offsets of text already acted, persisted as JSON.
#[derive(Debug, Default)]
pub struct OffsetStore {
    path: Option<PathBuf>,
    offsets: BTreeMap<String, usize>,
}

impl OffsetStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load offsets from `path` (missing file → empty).
    pub fn load(path: &Path) -> Result<Self> {
        let offsets = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Invalid offsets file: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            offsets,
        })
    }

    pub fn get(&self, note: &str) -> usize {
        self.offsets.get(note).copied().unwrap_or(0)
    }

    pub fn set(&mut self, note: &str, offset: usize) {
        self.offsets.insert(note.to_string(), offset);
    }

    pub fn reset(&mut self, note: &str) {
        self.offsets.insert(note.to_string(), 0);
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.offsets)?)
            .with_context(|| format!("Failed to write offsets: {}", path.display()))
    }
}

/// A line that will be voiced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedLine {
    pub speaker: String,
    pub dialogue: String,
    pub voice: String,
    pub style: String,
}

fn lowercase_keys(map: serde_json::Map<String, Value>) -> serde_json::Map<String, Value> {
    map.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect()
}

/// Keep lines whose speaker resolves to an NPC note, with its voice.
pub fn queue_lines(
    vault: &Vault,
    lines: Vec<TranscriptLine>,
    default_voice: &str,
) -> Result<Vec<QueuedLine>> {
    let mut queue = Vec::new();
    for line in lines {
        let Some(note) = vault.find_by_basename(&line.speaker)? else {
            warn!("Could not resolve note for [{}]", line.speaker);
            continue;
        };
        let fm = lowercase_keys(frontmatter(&vault.read(&note.path)?));
        if fm.get("type").and_then(Value::as_str) != Some("npc") {
            debug!("Skipping {} (not an npc note)", line.speaker);
            continue;
        }
        let field = |key: &str, default: &str| {
            fm.get(key)
                .filter(|v| !v.is_null())
                .map(display_value)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        queue.push(QueuedLine {
            voice: field("voice", default_voice),
            style: field("style", "neutral"),
            speaker: line.speaker,
            dialogue: line.dialogue,
        });
    }
    Ok(queue)
}

#[derive(Debug, Default)]
pub struct ActReport {
    pub found: usize,
    pub queued: usize,
    pub files: Vec<PathBuf>,
    pub failed: usize,
}

/// Voice the new part of a transcript note and advance its offset.
pub async fn act_note(
    vault: &Vault,
    rel: &str,
    config: &SpeechConfig,
    offsets: &mut OffsetStore,
    synth: &dyn SpeechSynth,
    sink: &AudioSink,
) -> Result<ActReport> {
    let content = vault.read(rel)?;
    let mut offset = offsets.get(rel);
    if offset > content.len() || !content.is_char_boundary(offset) {
        warn!("{} changed under its stored offset; starting over", rel);
        offset = 0;
    }

    let new_text = &content[offset..];
    let mut report = ActReport::default();
    if new_text.trim().is_empty() {
        debug!("{}: no new transcript text", rel);
        return Ok(report);
    }

    let lines = parse_transcript(new_text);
    report.found = lines.len();
    let queue = queue_lines(vault, lines, &config.default_voice)?;
    report.queued = queue.len();
    offsets.set(rel, content.len());

    for line in &queue {
        info!("Acting {} ({}, {})", line.speaker, line.voice, line.style);
        let input = voice_prompt(&line.dialogue, &line.voice, &line.style);
        match synth.synthesize(&line.voice, &input).await {
            Ok(bytes) => report.files.push(sink.save(&line.speaker, &bytes)?),
            Err(e) => {
                warn!("Speech failed for {}: {:#}", line.speaker, e);
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

fn note_rel(note: &str) -> String {
    if note.ends_with(".md") {
        note.to_string()
    } else {
        format!("{}.md", note)
    }
}

/// `vf voice act`
pub async fn run_voice_act(config: &Config, note: &str) -> Result<()> {
    let vault = Vault::open(&config.vault)?;
    let rel = note_rel(note);
    let mut offsets = OffsetStore::load(&config.speech.offsets_path)?;
    let synth = OpenAISpeech::new(&config.openai)?;
    let sink = AudioSink::new(&config.speech.audio_dir);

    let report = act_note(&vault, &rel, &config.speech, &mut offsets, &synth, &sink).await?;
    offsets.save()?;

    println!("voice act");
    println!("  note: {}", rel);
    println!("  lines found: {}", report.found);
    println!("  npc lines: {}", report.queued);
    println!("  voiced: {}", report.files.len());
    if report.failed > 0 {
        println!("  failed: {}", report.failed);
    }
    for file in &report.files {
        println!("  -> {}", file.display());
    }
    Ok(())
}

/// `vf voice reset`
pub fn run_voice_reset(config: &Config, note: &str) -> Result<()> {
    let rel = note_rel(note);
    let mut offsets = OffsetStore::load(&config.speech.offsets_path)?;
    offsets.reset(&rel);
    offsets.save()?;
    println!("Reset act position for {}", rel);
    Ok(())
}
