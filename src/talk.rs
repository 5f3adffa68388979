//! NPC dialogue.
//!
//! An NPC answers a player line in character, with what the vault knows
//! about it as context. Voice, style, persona and speech settings live in
//! a JSON registry keyed by NPC name; unknown NPCs get the default voice.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::chat::{ChatModel, OpenAIChat};
use crate::config::{Config, TalkConfig, TranscriptMode};
use crate::models::ChatMessage;
use crate::retrieve::Retriever;
use crate::speech::{AudioSink, OpenAISpeech, SpeechSynth};
use crate::vault::Vault;

/// Line used by `npc preview`.
pub const PREVIEW_LINE: &str = "Vault Forge, can be EXPRESSIVE!";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch: Option<String>,
    #[serde(default, alias = "prePauseMs", skip_serializing_if = "Option::is_none")]
    pub pre_pause_ms: Option<u64>,
    #[serde(default, alias = "postPauseMs", skip_serializing_if = "Option::is_none")]
    pub post_pause_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcProfile {
    pub id: String,
    pub voice: String,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub persona: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsSettings>,
}

impl NpcProfile {
    pub fn new(id: &str, voice: &str) -> Self {
        Self {
            id: id.to_string(),
            voice: voice.to_string(),
            style: String::new(),
            persona: String::new(),
            tts: None,
        }
    }
}

pub struct NpcRegistry {
    path: Option<PathBuf>,
    npcs: BTreeMap<String, NpcProfile>,
}

impl NpcRegistry {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            npcs: BTreeMap::new(),
        }
    }

    /// Load the registry (a missing file is an empty registry).
    pub fn load(path: &Path) -> Result<Self> {
        let npcs = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Invalid NPC registry: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            npcs,
        })
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
        std::fs::write(path, serde_json::to_string_pretty(&self.npcs)?)
            .with_context(|| format!("Failed to write NPC registry: {}", path.display()))
    }

    /// Stored profile, or a blank one with `default_voice`.
    pub fn profile(&self, id: &str, default_voice: &str) -> NpcProfile {
        self.npcs
            .get(id)
            .cloned()
            .unwrap_or_else(|| NpcProfile::new(id, default_voice))
    }

    pub fn set_profile(&mut self, mut profile: NpcProfile) {
        profile.id = profile.id.trim().to_string();
        self.npcs.insert(profile.id.clone(), profile);
    }

    pub fn iter(&self) -> impl Iterator<Item = &NpcProfile> {
        self.npcs.values()
    }
}

/// Basenames of NPC notes: under a top-level `npcs`/`npc` folder or any
/// nested `/npcs/` folder.
pub fn list_npc_notes(vault: &Vault) -> Result<Vec<String>> {
    let mut names: Vec<String> = vault
        .markdown_files()?
        .iter()
        .filter(|f| {
            let lower = f.path.to_lowercase();
            let top = lower.split('/').next().unwrap_or("");
            lower.contains('/') && (top == "npcs" || top == "npc") || lower.contains("/npcs/")
        })
        .map(|f| f.basename().to_string())
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Speech input for an NPC line: SSML when the profile has speech
/// settings, the plain text otherwise.
pub fn speech_input(text: &str, tts: Option<&TtsSettings>) -> String {
    let Some(tts) = tts else {
        return text.to_string();
    };
    let pause = |ms: Option<u64>| match ms {
        Some(ms) if ms > 0 => format!("<break time=\"{}ms\"/>", ms),
        _ => String::new(),
    };
    format!(
        "<speak>{}<prosody rate=\"{}\" pitch=\"{}\">{}</prosody>{}</speak>",
        pause(tts.pre_pause_ms),
        tts.rate.as_deref().filter(|r| !r.is_empty()).unwrap_or("1.0"),
        tts.pitch.as_deref().filter(|p| !p.is_empty()).unwrap_or("0%"),
        escape_xml(text),
        pause(tts.post_pause_ms),
    )
}

pub fn system_prompt(profile: &NpcProfile, context: &str) -> String {
    let mut prompt = format!("You are {}. Stay in character at all times.\n", profile.id);
    if !profile.persona.is_empty() {
        prompt.push_str(&format!("Persona: {}\n", profile.persona));
    }
    if !profile.style.is_empty() {
        prompt.push_str(&format!("Style: {}\n", profile.style));
    }
    prompt.push_str("Here is what you know about yourself and the world:\n");
    prompt.push_str(context);
    prompt
}

/// Speech backend and where its audio goes.
pub struct Voice<'a> {
    pub synth: &'a dyn SpeechSynth,
    pub sink: &'a AudioSink,
}

/// Everything an NPC reply needs.
pub struct Talk<'a> {
    pub vault: &'a Vault,
    pub config: &'a TalkConfig,
    pub registry: &'a NpcRegistry,
    pub retriever: Option<&'a Retriever>,
    pub chat: &'a dyn ChatModel,
    pub voice: Option<Voice<'a>>,
}

#[derive(Debug)]
pub struct NpcReply {
    pub reply: String,
    pub audio: Option<PathBuf>,
}

impl Talk<'_> {
    pub async fn respond(&self, npc: &str, player_line: &str) -> Result<NpcReply> {
        let context = match self.retriever {
            Some(r) => r.ask_vault(npc).await,
            None => String::new(),
        };
        debug!("Context for {}: {} chars", npc, context.len());

        let profile = self.registry.profile(npc, &self.config.default_voice);
        let messages = vec![
            ChatMessage::system(system_prompt(&profile, &context)),
            ChatMessage::user(player_line),
        ];
        let reply = self
            .chat
            .complete(&messages, Some(&self.config.model))
            .await?;

        self.record(npc, player_line, &reply)?;

        let audio = if self.config.autoplay {
            self.speak(&profile, &reply).await
        } else {
            None
        };
        Ok(NpcReply { reply, audio })
    }

    /// Synthesize a line for a profile. Failures are logged, not returned.
    pub async fn speak(&self, profile: &NpcProfile, text: &str) -> Option<PathBuf> {
        let Some(voice) = &self.voice else {
            warn!("Speech unavailable for {}", profile.id);
            return None;
        };
        let input = speech_input(text, profile.tts.as_ref());
        let result = match voice.synth.synthesize(&profile.voice, &input).await {
            Ok(bytes) => voice.sink.save(&profile.id, &bytes),
            Err(e) => Err(e),
        };
        match result {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Speech failed for {}: {:#}", profile.id, e);
                None
            }
        }
    }

    /// Append the exchange to the transcript and/or the NPC note.
    pub fn record(&self, npc: &str, player_line: &str, reply: &str) -> Result<()> {
        let mode = self.config.transcript_mode;
        let exchange = format!("Player: {}\n{}: {}\n\n", player_line, npc, reply);

        if matches!(mode, TranscriptMode::Transcript | TranscriptMode::Both) {
            let rel = format!("{}/{}.md", self.config.transcripts_folder.trim_matches('/'), npc);
            self.vault
                .create_if_missing(&rel, &format!("# Transcript: {}\n\n", npc))?;
            self.vault.append(&rel, &exchange)?;
        }

        if matches!(mode, TranscriptMode::Npc | TranscriptMode::Both) {
            let rel = format!("{}/{}.md", self.config.npcs_folder.trim_matches('/'), npc);
            if self.vault.exists(&rel) {
                self.vault
                    .append(&rel, &format!("\n## Dialogue Log\n{}", exchange))?;
            } else {
                debug!("No NPC note at {}; dialogue not logged there", rel);
            }
        }
        Ok(())
    }
}

fn open_voice(config: &Config) -> Option<(OpenAISpeech, AudioSink)> {
    match OpenAISpeech::new(&config.openai) {
        Ok(synth) => Some((synth, AudioSink::new(&config.speech.audio_dir))),
        Err(e) => {
            warn!("Speech disabled: {:#}", e);
            None
        }
    }
}

/// `vf npc say`
pub async fn run_npc_say(config: &Config, npc: &str, line: &str) -> Result<()> {
    let vault = Vault::open(&config.vault)?;
    let registry = NpcRegistry::load(&config.talk.registry_path)?;
    let retriever = Retriever::open(config);
    let chat = OpenAIChat::new(&config.openai)?;
    let speech = if config.talk.autoplay {
        open_voice(config)
    } else {
        None
    };

    let talk = Talk {
        vault: &vault,
        config: &config.talk,
        registry: &registry,
        retriever: Some(&retriever),
        chat: &chat,
        voice: speech.as_ref().map(|(synth, sink)| Voice { synth, sink }),
    };
    let reply = talk.respond(npc, line).await?;

    println!("{}: {}", npc, reply.reply);
    if let Some(path) = reply.audio {
        println!("  audio: {}", path.display());
    }
    Ok(())
}

/// `vf npc list`
pub fn run_npc_list(config: &Config) -> Result<()> {
    let vault = Vault::open(&config.vault)?;
    let registry = NpcRegistry::load(&config.talk.registry_path)?;
    let notes = list_npc_notes(&vault)?;

    println!("npcs");
    println!("  notes: {}", notes.len());
    for name in &notes {
        let profile = registry.profile(name, &config.talk.default_voice);
        println!("  {} (voice: {})", name, profile.voice);
    }
    let extra: Vec<&NpcProfile> = registry.iter().filter(|p| !notes.contains(&p.id)).collect();
    if !extra.is_empty() {
        println!("  registry only:");
        for p in extra {
            println!("    {} (voice: {})", p.id, p.voice);
        }
    }
    Ok(())
}

/// Changes for `vf npc set`; `None` fields keep their stored value.
#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub voice: Option<String>,
    pub style: Option<String>,
    pub persona: Option<String>,
    pub rate: Option<String>,
    pub pitch: Option<String>,
    pub pre_pause_ms: Option<u64>,
    pub post_pause_ms: Option<u64>,
}

impl ProfileUpdate {
    pub fn apply(self, mut profile: NpcProfile) -> NpcProfile {
        if let Some(v) = self.voice {
            profile.voice = v;
        }
        if let Some(s) = self.style {
            profile.style = s;
        }
        if let Some(p) = self.persona {
            profile.persona = p;
        }
        let touches_tts = self.rate.is_some()
            || self.pitch.is_some()
            || self.pre_pause_ms.is_some()
            || self.post_pause_ms.is_some();
        if touches_tts {
            let tts = profile.tts.get_or_insert_with(TtsSettings::default);
            if self.rate.is_some() {
                tts.rate = self.rate;
            }
            if self.pitch.is_some() {
                tts.pitch = self.pitch;
            }
            if self.pre_pause_ms.is_some() {
                tts.pre_pause_ms = self.pre_pause_ms;
            }
            if self.post_pause_ms.is_some() {
                tts.post_pause_ms = self.post_pause_ms;
            }
        }
        profile
    }
}

/// `vf npc set`
pub fn run_npc_set(config: &Config, npc: &str, update: ProfileUpdate) -> Result<()> {
    let mut registry = NpcRegistry::load(&config.talk.registry_path)?;
    let profile = update.apply(registry.profile(npc, &config.talk.default_voice));
    println!("npc set");
    println!("  id: {}", profile.id);
    println!("  voice: {}", profile.voice);
    if !profile.style.is_empty() {
        println!("  style: {}", profile.style);
    }
    registry.set_profile(profile);
    registry.save()?;
    info!("Saved NPC registry to {}", config.talk.registry_path.display());
    Ok(())
}

/// `vf npc preview`
pub async fn run_npc_preview(config: &Config, npc: &str) -> Result<()> {
    let vault = Vault::open(&config.vault)?;
    let registry = NpcRegistry::load(&config.talk.registry_path)?;
    let chat = OpenAIChat::new(&config.openai)?;
    let synth = OpenAISpeech::new(&config.openai)?;
    let sink = AudioSink::new(&config.speech.audio_dir);

    let talk = Talk {
        vault: &vault,
        config: &config.talk,
        registry: &registry,
        retriever: None,
        chat: &chat,
        voice: Some(Voice {
            synth: &synth,
            sink: &sink,
        }),
    };
    let profile = registry.profile(npc, &config.talk.default_voice);
    match talk.speak(&profile, PREVIEW_LINE).await {
        Some(path) => println!("Preview for {}: {}", npc, path.display()),
        None => anyhow::bail!("Preview failed for {}", npc),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedChat {
        reply: String,
        seen: Mutex<Vec<(Vec<ChatMessage>, Option<String>)>>,
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn complete(&self, messages: &[ChatMessage], model_override: Option<&str>) -> Result<String> {
            self.seen
                .lock()
                .unwrap()
                .push((messages.to_vec(), model_override.map(str::to_string)));
            Ok(self.reply.clone())
        }
    }

    struct RecordingSynth(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl SpeechSynth for RecordingSynth {
        async fn synthesize(&self, voice: &str, input: &str) -> Result<Vec<u8>> {
            self.0.lock().unwrap().push((voice.to_string(), input.to_string()));
            Ok(vec![1, 2, 3])
        }
    }

    fn scripted(reply: &str) -> ScriptedChat {
        ScriptedChat {
            reply: reply.to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn vault() -> (TempDir, Vault) {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("NPCs")).unwrap();
        std::fs::write(tmp.path().join("NPCs/Mira.md"), "# Mira\n").unwrap();
        std::fs::create_dir_all(tmp.path().join("World/npcs")).unwrap();
        std::fs::write(tmp.path().join("World/npcs/Durnan.md"), "# Durnan\n").unwrap();
        std::fs::write(tmp.path().join("npc.md"), "not an npc folder\n").unwrap();
        let vault = Vault::open(&VaultConfig {
            root: tmp.path().to_path_buf(),
            ..VaultConfig::default()
        })
        .unwrap();
        (tmp, vault)
    }

    #[test]
    fn test_list_npc_notes() {
        let (_tmp, vault) = vault();
        let mut names = list_npc_notes(&vault).unwrap();
        names.sort();
        assert_eq!(names, vec!["Durnan", "Mira"]);
    }

    #[test]
    fn test_unknown_profile_uses_default_voice() {
        let registry = NpcRegistry::in_memory();
        assert_eq!(registry.profile("Mira", "alloy"), NpcProfile::new("Mira", "alloy"));
    }

    #[test]
    fn test_registry_round_trip_and_camel_case_aliases() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("npcs.json");
        std::fs::write(
            &path,
            r#"{"Mira": {"id": "Mira", "voice": "fable", "tts": {"rate": "0.9", "prePauseMs": 200}}}"#,
        )
        .unwrap();
        let mut registry = NpcRegistry::load(&path).unwrap();
        let mira = registry.profile("Mira", "alloy");
        assert_eq!(mira.tts.as_ref().unwrap().pre_pause_ms, Some(200));

        let update = ProfileUpdate {
            style: Some("warm".into()),
            pitch: Some("+5%".into()),
            ..ProfileUpdate::default()
        };
        registry.set_profile(update.apply(mira));
        registry.save().unwrap();

        let reloaded = NpcRegistry::load(&path).unwrap().profile("Mira", "alloy");
        assert_eq!(reloaded.voice, "fable");
        assert_eq!(reloaded.style, "warm");
        let tts = reloaded.tts.unwrap();
        assert_eq!(tts.rate.as_deref(), Some("0.9"));
        assert_eq!(tts.pitch.as_deref(), Some("+5%"));
    }

    #[test]
    fn test_speech_input_ssml() {
        assert_eq!(speech_input("a < b", None), "a < b");
        let tts = TtsSettings {
            pre_pause_ms: Some(250),
            ..TtsSettings::default()
        };
        assert_eq!(
            speech_input("Salt & <steel>", Some(&tts)),
            "<speak><break time=\"250ms\"/><prosody rate=\"1.0\" pitch=\"0%\">Salt &amp; &lt;steel&gt;</prosody></speak>"
        );
    }

    #[test]
    fn test_system_prompt() {
        let mut p = NpcProfile::new("Mira", "alloy");
        p.persona = "Retired adventurer".into();
        assert_eq!(
            system_prompt(&p, "ctx"),
            "You are Mira. Stay in character at all times.\nPersona: Retired adventurer\n\
             Here is what you know about yourself and the world:\nctx"
        );
    }

    #[tokio::test]
    async fn test_respond_records_both_transcripts_and_speaks() {
        let (tmp, vault) = vault();
        let config = TalkConfig {
            transcript_mode: TranscriptMode::Both,
            autoplay: true,
            ..TalkConfig::default()
        };
        let registry = NpcRegistry::in_memory();
        let chat = scripted("Welcome, friend.");
        let synth = RecordingSynth(Mutex::new(Vec::new()));
        let sink = AudioSink::new(tmp.path().join("audio"));
        let talk = Talk {
            vault: &vault,
            config: &config,
            registry: &registry,
            retriever: None,
            chat: &chat,
            voice: Some(Voice { synth: &synth, sink: &sink }),
        };

        let reply = talk.respond("Mira", "Any rooms?").await.unwrap();
        assert_eq!(reply.reply, "Welcome, friend.");
        assert!(reply.audio.unwrap().is_file());

        let (messages, model) = chat.seen.lock().unwrap()[0].clone();
        assert_eq!(model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(messages[1], ChatMessage::user("Any rooms?"));
        assert!(messages[0].content.starts_with("You are Mira."));

        assert_eq!(
            vault.read("Transcripts/Mira.md").unwrap(),
            "# Transcript: Mira\n\nPlayer: Any rooms?\nMira: Welcome, friend.\n\n"
        );
        assert_eq!(
            vault.read("NPCs/Mira.md").unwrap(),
            "# Mira\n\n## Dialogue Log\nPlayer: Any rooms?\nMira: Welcome, friend.\n\n"
        );
        assert_eq!(synth.0.lock().unwrap()[0], ("alloy".to_string(), "Welcome, friend.".to_string()));
    }

    #[tokio::test]
    async fn test_npc_mode_skips_missing_note() {
        let (_tmp, vault) = vault();
        let config = TalkConfig {
            transcript_mode: TranscriptMode::Npc,
            ..TalkConfig::default()
        };
        let registry = NpcRegistry::in_memory();
        let chat = scripted("Hm.");
        let talk = Talk {
            vault: &vault,
            config: &config,
            registry: &registry,
            retriever: None,
            chat: &chat,
            voice: None,
        };
        let reply = talk.respond("Stranger", "Hello").await.unwrap();
        assert!(reply.audio.is_none());
        assert!(!vault.exists("NPCs/Stranger.md"));
        assert!(!vault.exists("Transcripts/Stranger.md"));
    }
}
