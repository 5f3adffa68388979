//! # VaultForge
//!
//! Campaign tools for a tabletop RPG run out of a markdown vault.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌────────────┐
//! │  Vault   │──▶│ Index build │──▶│ index.json │
//! │ (.md)    │   │ chunk+embed │   └─────┬──────┘
//! └──────────┘   └─────────────┘         │
//!                                        ▼
//!            ┌───────────┬──────────┬──────────┐
//!            │  ask/chat │ npc talk │ voice act│
//!            │  generate │          │          │
//!            └───────────┴──────────┴──────────┘
//!
//! ┌──────────────┐   ┌───────────┐   ┌──────────────┐
//! │ 5e JSON data │──▶│ normalize │──▶│ search/export│
//! └──────────────┘   │ + merge   │   └──────────────┘
//!                    └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`vault`] | Note enumeration and path-safe I/O |
//! | [`markdown`] | Frontmatter, tags, headings |
//! | [`chunk`] | Body chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vault index build and snapshot |
//! | [`watch`] | Rebuild on file changes |
//! | [`retrieve`] | Literal, semantic, and fallback retrieval |
//! | [`chat`] | Chat notes answered with vault context |
//! | [`generate`] | NPC, location and item notes from templates |
//! | [`rules`] | 5e data normalizer, merge, search, class export |
//! | [`players`] | Character sheets and skill modifiers |
//! | [`server`] | Character-sheet HTTP API |
//! | [`talk`] | NPC dialogue |
//! | [`speech`] | Text-to-speech narration of transcripts |

pub mod chat;
pub mod check;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod generate;
pub mod index;
pub mod markdown;
pub mod models;
pub mod openai;
pub mod players;
pub mod retrieve;
pub mod rules;
pub mod server;
pub mod speech;
pub mod talk;
pub mod vault;
pub mod watch;
