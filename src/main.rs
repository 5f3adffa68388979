//! # VaultForge CLI (`vf`)
//!
//! ## Usage
//!
//! ```bash
//! vf --config ./config/vf.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vf index build` | Build the vault embedding index |
//! | `vf index watch` | Rebuild the index whenever a note changes |
//! | `vf ask "<query>"` | Print vault context for a query |
//! | `vf chat respond <note>` | Answer the last question of a chat note |
//! | `vf generate <kind> "<prompt>"` | Write an NPC, location, or item note |
//! | `vf expand <topic>` | Add to or create the note for a topic |
//! | `vf check` | Show which parts of the setup are usable |
//! | `vf rules ...` | Search, inspect, and export 5e data |
//! | `vf npc ...` | Talk to NPCs and manage their voices |
//! | `vf voice ...` | Narrate NPC lines of a transcript note |
//! | `vf player ...` | Inspect and edit character sheets |
//! | `vf serve` | Start the character-sheet HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! vf index build --full
//! vf ask "Who runs the Yawning Portal?" --concise
//! vf rules search "fire bolt" --category spells
//! vf npc say Mira "Any rooms free tonight?"
//! vf generate npc "a nervous dockhand" --name Tobin
//! vf expand "Ember Guild" --template Guild
//! vf voice act "Sessions/Session 12"
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use vaultforge::generate::{EntityKind, ExpandOptions};
use vaultforge::talk::ProfileUpdate;
use vaultforge::{
    chat, check, config, generate, index, players, retrieve, rules, server, speech, talk, watch,
};

/// VaultForge: campaign tools for a markdown vault.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/vf.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "vf",
    about = "VaultForge: retrieval, 5e rules, NPC dialogue and narration for a markdown vault",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vf.toml")]
    config: PathBuf,

    /// Debug logging (same as `[logging].developer_mode`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or watch the vault index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Print the vault context retrieved for a query.
    Ask {
        query: String,

        /// Only the best hit's header and excerpt.
        #[arg(long)]
        concise: bool,

        /// Maximum number of hits.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Chat notes.
    Chat {
        #[command(subcommand)]
        action: ChatAction,
    },

    /// Check vault, index, API key, rules data, and players folder.
    Check,

    /// Generate an NPC, location, or item note from a description.
    Generate {
        /// npc, location, or item.
        kind: EntityKind,

        /// What to generate.
        prompt: String,

        /// Note title (the model picks one when omitted).
        #[arg(long, default_value = "")]
        name: String,
    },

    /// Add to the note for a topic, or create it from a template.
    Expand {
        topic: String,

        /// Text to add when the note exists.
        #[arg(long)]
        add: Option<String>,

        /// Let the model work the text into the body instead of appending.
        #[arg(long, requires = "add")]
        integrate: bool,

        /// Template for a new note (basename in `[generate].templates_folder`).
        #[arg(long)]
        template: Option<String>,
    },

    /// 5e rules data.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// NPC dialogue.
    Npc {
        #[command(subcommand)]
        action: NpcAction,
    },

    /// Transcript narration.
    Voice {
        #[command(subcommand)]
        action: VoiceAction,
    },

    /// Character sheets.
    Player {
        #[command(subcommand)]
        action: PlayerAction,
    },

    /// Start the character-sheet HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Build the index once.
    Build {
        /// Re-embed every chunk, ignoring cached vectors.
        #[arg(long)]
        full: bool,
    },
    /// Keep the index up to date until interrupted.
    Watch,
}

#[derive(Subcommand)]
enum ChatAction {
    /// Answer the pending question at the end of a chat note.
    Respond { note: String },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Search records by name and text.
    Search {
        query: String,

        /// `all`, `spells`, `items`, `bestiary`, `races`, `classes`, `feats`, ...
        #[arg(long, default_value = "all")]
        category: String,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one record by uid (`Name|Source`).
    Get { uid: String },
    /// Print the character-sheet payload for a record.
    Export { uid: String },
    /// Rebuild the master index of all categories.
    Index {
        /// Output path (defaults to `[rules].master_index`).
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Export class progression tables from a class JSON file.
    Classes {
        file: PathBuf,

        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum NpcAction {
    /// Say a line to an NPC and print the reply.
    Say { npc: String, line: String },
    /// List NPC notes and their voices.
    List,
    /// Update an NPC's voice profile.
    Set {
        npc: String,
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        style: Option<String>,
        #[arg(long)]
        persona: Option<String>,
        #[arg(long)]
        rate: Option<String>,
        #[arg(long)]
        pitch: Option<String>,
        #[arg(long)]
        pre_pause_ms: Option<u64>,
        #[arg(long)]
        post_pause_ms: Option<u64>,
    },
    /// Synthesize a sample line with the NPC's voice.
    Preview { npc: String },
}

#[derive(Subcommand)]
enum VoiceAction {
    /// Voice new NPC lines of a transcript note.
    Act { note: String },
    /// Forget how far a note has been voiced.
    Reset { note: String },
}

#[derive(Subcommand)]
enum PlayerAction {
    /// List player notes.
    List,
    /// Print skill modifiers for a player.
    Skills { name: String },
    /// Set one skill to none, proficient, or expertise.
    SetSkill {
        name: String,
        skill: String,
        level: String,
    },
}

fn init_logging(debug: bool) {
    let default = if debug { "vaultforge=debug,vf=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    init_logging(cli.verbose || cfg.logging.developer_mode);

    match cli.command {
        Commands::Index { action } => match action {
            IndexAction::Build { full } => index::run_index_build(&cfg, full).await?,
            IndexAction::Watch => watch::run_index_watch(&cfg).await?,
        },
        Commands::Ask {
            query,
            concise,
            limit,
        } => {
            retrieve::run_ask(&cfg, &query, concise, limit).await?;
        }
        Commands::Chat { action } => match action {
            ChatAction::Respond { note } => chat::run_chat_respond(&cfg, &note).await?,
        },
        Commands::Check => check::run_check(&cfg)?,
        Commands::Generate { kind, prompt, name } => {
            generate::run_generate(&cfg, kind, &name, &prompt).await?
        }
        Commands::Expand {
            topic,
            add,
            integrate,
            template,
        } => {
            let options = ExpandOptions {
                addition: add,
                integrate,
                template,
            };
            generate::run_expand(&cfg, &topic, &options).await?;
        }
        Commands::Rules { action } => match action {
            RulesAction::Search {
                query,
                category,
                limit,
            } => rules::search::run_rules_search(&cfg, &query, &category, limit)?,
            RulesAction::Get { uid } => rules::search::run_rules_get(&cfg, &uid)?,
            RulesAction::Export { uid } => rules::search::run_rules_export(&cfg, &uid)?,
            RulesAction::Index { out } => rules::search::run_rules_index(&cfg, out.as_deref())?,
            RulesAction::Classes { file, out } => {
                rules::class_export::run_rules_classes(&cfg, &file, out.as_deref())?
            }
        },
        Commands::Npc { action } => match action {
            NpcAction::Say { npc, line } => talk::run_npc_say(&cfg, &npc, &line).await?,
            NpcAction::List => talk::run_npc_list(&cfg)?,
            NpcAction::Set {
                npc,
                voice,
                style,
                persona,
                rate,
                pitch,
                pre_pause_ms,
                post_pause_ms,
            } => {
                let update = ProfileUpdate {
                    voice,
                    style,
                    persona,
                    rate,
                    pitch,
                    pre_pause_ms,
                    post_pause_ms,
                };
                talk::run_npc_set(&cfg, &npc, update)?;
            }
            NpcAction::Preview { npc } => talk::run_npc_preview(&cfg, &npc).await?,
        },
        Commands::Voice { action } => match action {
            VoiceAction::Act { note } => speech::run_voice_act(&cfg, &note).await?,
            VoiceAction::Reset { note } => speech::run_voice_reset(&cfg, &note)?,
        },
        Commands::Player { action } => match action {
            PlayerAction::List => players::run_player_list(&cfg)?,
            PlayerAction::Skills { name } => players::run_player_skills(&cfg, &name)?,
            PlayerAction::SetSkill { name, skill, level } => {
                players::run_player_set_skill(&cfg, &name, &skill, &level)?
            }
        },
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}
