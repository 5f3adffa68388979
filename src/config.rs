use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub talk: TalkConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub generate: GenerateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    #[serde(default = "default_vault_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: default_vault_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_vault_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

/// How note bodies are cut into index entries.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One entry (and one embedding) per file.
    File,
    /// Fixed-size character windows.
    #[default]
    Chunk,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub chunk_overlap: usize,
    #[serde(default = "default_true")]
    pub persist: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            granularity: Granularity::Chunk,
            chunk_size: default_chunk_size(),
            chunk_overlap: 0,
            persist: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from("./data/index.json")
}
fn default_chunk_size() -> usize {
    500
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
    #[serde(default = "default_max_headings")]
    pub max_headings: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            excerpt_chars: default_excerpt_chars(),
            max_headings: default_max_headings(),
        }
    }
}

fn default_max_results() -> usize {
    5
}
fn default_excerpt_chars() -> usize {
    500
}
fn default_max_headings() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_speech_model")]
    pub speech_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            embedding_model: default_embedding_model(),
            chat_model: default_chat_model(),
            speech_model: default_speech_model(),
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o".to_string()
}
fn default_speech_model() -> String {
    "gpt-4o-mini-tts".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_input_chars() -> usize {
    7000
}

impl OpenAiConfig {
    /// API key from the config file, else from `OPENAI_API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VaultMode {
    Full,
    #[default]
    Concise,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_folder")]
    pub folder: String,
    #[serde(default = "default_max_context_lines")]
    pub max_context_lines: usize,
    #[serde(default = "default_true")]
    pub use_vault_context: bool,
    #[serde(default)]
    pub vault_mode: VaultMode,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            folder: default_chat_folder(),
            max_context_lines: default_max_context_lines(),
            use_vault_context: true,
            vault_mode: VaultMode::Concise,
        }
    }
}

fn default_chat_folder() -> String {
    "Chats".to_string()
}
fn default_max_context_lines() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_players_path")]
    pub players_path: String,
    #[serde(default)]
    pub frontend_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            players_path: default_players_path(),
            frontend_dir: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_players_path() -> String {
    "Players".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RulesConfig {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default)]
    pub master_index: Option<PathBuf>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            master_index: None,
        }
    }
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./5etools/data")
}

/// Where NPC dialogue gets recorded.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptMode {
    Npc,
    #[default]
    Transcript,
    Both,
    None,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TalkConfig {
    #[serde(default = "default_talk_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub default_voice: String,
    #[serde(default)]
    pub autoplay: bool,
    #[serde(default)]
    pub transcript_mode: TranscriptMode,
    #[serde(default = "default_transcripts_folder")]
    pub transcripts_folder: String,
    #[serde(default = "default_npcs_folder")]
    pub npcs_folder: String,
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
}

impl Default for TalkConfig {
    fn default() -> Self {
        Self {
            model: default_talk_model(),
            default_voice: default_voice(),
            autoplay: false,
            transcript_mode: TranscriptMode::Transcript,
            transcripts_folder: default_transcripts_folder(),
            npcs_folder: default_npcs_folder(),
            registry_path: default_registry_path(),
        }
    }
}

fn default_talk_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_voice() -> String {
    "alloy".to_string()
}
fn default_transcripts_folder() -> String {
    "Transcripts".to_string()
}
fn default_npcs_folder() -> String {
    "NPCs".to_string()
}
fn default_registry_path() -> PathBuf {
    PathBuf::from("./data/npcs.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpeechConfig {
    #[serde(default = "default_voice")]
    pub default_voice: String,
    #[serde(default = "default_audio_dir")]
    pub audio_dir: PathBuf,
    #[serde(default = "default_offsets_path")]
    pub offsets_path: PathBuf,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            default_voice: default_voice(),
            audio_dir: default_audio_dir(),
            offsets_path: default_offsets_path(),
        }
    }
}

fn default_audio_dir() -> PathBuf {
    PathBuf::from("./data/audio")
}
fn default_offsets_path() -> PathBuf {
    PathBuf::from("./data/voice-offsets.json")
}

/// Folders used by `vf generate` and `vf expand`.
#[derive(Debug, Deserialize, Clone)]
pub struct GenerateConfig {
    #[serde(default = "default_npcs_folder")]
    pub npc_folder: String,
    #[serde(default = "default_location_folder")]
    pub location_folder: String,
    #[serde(default = "default_item_folder")]
    pub item_folder: String,
    /// Link target folder for factions.
    #[serde(default = "default_faction_folder")]
    pub faction_folder: String,
    /// `NPC.md`, `Location.md` and `Item.md` here replace the built-in
    /// template; every note here is offered to `vf expand`.
    #[serde(default = "default_templates_folder")]
    pub templates_folder: String,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            npc_folder: default_npcs_folder(),
            location_folder: default_location_folder(),
            item_folder: default_item_folder(),
            faction_folder: default_faction_folder(),
            templates_folder: default_templates_folder(),
        }
    }
}

fn default_location_folder() -> String {
    "Locations".to_string()
}
fn default_item_folder() -> String {
    "Items".to_string()
}
fn default_faction_folder() -> String {
    "Factions".to_string()
}
fn default_templates_folder() -> String {
    "Templates".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Verbose (`debug`) logging, same as `-v`.
    #[serde(default)]
    pub developer_mode: bool,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.index.chunk_size == 0 {
        anyhow::bail!("index.chunk_size must be > 0");
    }
    if config.index.chunk_overlap >= config.index.chunk_size {
        anyhow::bail!(
            "index.chunk_overlap ({}) must be smaller than index.chunk_size ({})",
            config.index.chunk_overlap,
            config.index.chunk_size
        );
    }
    if config.retrieval.max_results == 0 {
        anyhow::bail!("retrieval.max_results must be >= 1");
    }
    if config.openai.base_url.trim().is_empty() {
        anyhow::bail!("openai.base_url must not be empty");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.index.chunk_size, 500);
        assert_eq!(cfg.index.granularity, Granularity::Chunk);
        assert_eq!(cfg.retrieval.max_results, 5);
        assert_eq!(cfg.openai.embedding_model, "text-embedding-3-small");
        assert_eq!(cfg.chat.vault_mode, VaultMode::Concise);
        assert_eq!(cfg.talk.transcript_mode, TranscriptMode::Transcript);
        assert_eq!(cfg.server.players_path, "Players");
        assert_eq!(cfg.generate.item_folder, "Items");
        assert_eq!(cfg.generate.templates_folder, "Templates");
        assert!(cfg.index.persist);
    }

    #[test]
    fn test_sections_override_defaults() {
        let cfg = parse_config(
            r#"
[vault]
root = "/tmp/vault"

[index]
granularity = "file"
chunk_size = 200

[chat]
vault_mode = "full"

[talk]
transcript_mode = "both"
"#,
        )
        .unwrap();
        assert_eq!(cfg.vault.root, PathBuf::from("/tmp/vault"));
        assert_eq!(cfg.index.granularity, Granularity::File);
        assert_eq!(cfg.index.chunk_size, 200);
        assert_eq!(cfg.chat.vault_mode, VaultMode::Full);
        assert_eq!(cfg.talk.transcript_mode, TranscriptMode::Both);
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let err = parse_config("[index]\nchunk_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_size() {
        let err = parse_config("[index]\nchunk_size = 10\nchunk_overlap = 10\n").unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_rejects_unknown_granularity() {
        assert!(parse_config("[index]\ngranularity = \"paragraph\"\n").is_err());
    }

    #[test]
    fn test_configured_api_key_wins() {
        let cfg = parse_config("[openai]\napi_key = \" sk-test \"\n").unwrap();
        assert_eq!(cfg.openai.resolve_api_key().as_deref(), Some("sk-test"));
    }
}
