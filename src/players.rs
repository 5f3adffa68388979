//! Player character sheets stored as frontmatter on `{players_path}/{name}.md`.
//!
//! A sheet is plain YAML frontmatter. The keys read here are
//! `abilities.{strength,...}`, `skills.{skill}` (`none`, `proficient`,
//! `expertise`) and `proficiency_bonus`; everything else is passed through.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::Config;
use crate::markdown::{frontmatter, replace_frontmatter, try_frontmatter};
use crate::vault::Vault;

/// The 18 standard skills and the ability each one uses.
pub const SKILLS: [(&str, &str); 18] = [
    ("acrobatics", "dexterity"),
    ("animal_handling", "wisdom"),
    ("arcana", "intelligence"),
    ("athletics", "strength"),
    ("deception", "charisma"),
    ("history", "intelligence"),
    ("insight", "wisdom"),
    ("intimidation", "charisma"),
    ("investigation", "intelligence"),
    ("medicine", "wisdom"),
    ("nature", "intelligence"),
    ("perception", "wisdom"),
    ("performance", "charisma"),
    ("persuasion", "charisma"),
    ("religion", "intelligence"),
    ("sleight_of_hand", "dexterity"),
    ("stealth", "dexterity"),
    ("survival", "wisdom"),
];

const DEFAULT_ABILITY: i64 = 10;
const DEFAULT_PROFICIENCY_BONUS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Proficiency {
    None,
    Proficient,
    Expertise,
}

impl Proficiency {
    fn from_value(value: Option<&Value>) -> Self {
        value
            .and_then(Value::as_str)
            .and_then(Self::parse)
            .unwrap_or(Proficiency::None)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Proficiency::None),
            "proficient" => Some(Proficiency::Proficient),
            "expertise" => Some(Proficiency::Expertise),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Proficiency::None => "none",
            Proficiency::Proficient => "proficient",
            Proficiency::Expertise => "expertise",
        }
    }
}

/// Ability used by a skill, `None` for an unknown skill name.
pub fn skill_ability(skill: &str) -> Option<&'static str> {
    SKILLS
        .iter()
        .find(|(name, _)| *name == skill)
        .map(|&(_, ability)| ability)
}

pub fn ability_modifier(score: i64) -> i64 {
    (score - 10).div_euclid(2)
}

pub fn skill_modifier(score: i64, proficiency_bonus: i64, level: Proficiency) -> i64 {
    let base = ability_modifier(score);
    match level {
        Proficiency::None => base,
        Proficiency::Proficient => base + proficiency_bonus,
        Proficiency::Expertise => base + proficiency_bonus * 2,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillScore {
    pub skill: &'static str,
    pub ability: &'static str,
    pub proficiency: Proficiency,
    pub modifier: i64,
}

fn as_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Modifiers for every skill of a sheet.
pub fn skill_scores(sheet: &Map<String, Value>) -> Vec<SkillScore> {
    let bonus = as_int(sheet.get("proficiency_bonus")).unwrap_or(DEFAULT_PROFICIENCY_BONUS);
    let abilities = sheet.get("abilities");
    let skills = sheet.get("skills");

    SKILLS
        .iter()
        .map(|&(skill, ability)| {
            let score = as_int(abilities.and_then(|a| a.get(ability))).unwrap_or(DEFAULT_ABILITY);
            let proficiency = Proficiency::from_value(skills.and_then(|s| s.get(skill)));
            SkillScore {
                skill,
                ability,
                proficiency,
                modifier: skill_modifier(score, bonus, proficiency),
            }
        })
        .collect()
}

/// Player names may not contain path separators or `..`, and may not
/// start or end with whitespace.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name == name.trim()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && !name.starts_with('.')
}

pub struct Players {
    vault: Vault,
    folder: String,
}

impl Players {
    pub fn new(vault: Vault, folder: impl Into<String>) -> Self {
        Self {
            vault,
            folder: folder.into().trim_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            Vault::open(&config.vault)?,
            config.server.players_path.clone(),
        ))
    }

    fn note_path(&self, name: &str) -> String {
        if self.folder.is_empty() {
            format!("{}.md", name)
        } else {
            format!("{}/{}.md", self.folder, name)
        }
    }

    pub fn list(&self) -> Result<Vec<String>> {
        if self.folder.is_empty() {
            return self.vault.list_folder(".");
        }
        self.vault.list_folder(&self.folder)
    }

    /// A player's frontmatter, `None` when there is no such note.
    pub fn get(&self, name: &str) -> Result<Option<Map<String, Value>>> {
        let rel = self.note_path(name);
        if !self.vault.exists(&rel) {
            return Ok(None);
        }
        Ok(Some(frontmatter(&self.vault.read(&rel)?)))
    }

    /// Create a player note. Returns `false` if it already exists.
    pub fn create(&self, name: &str, data: &Map<String, Value>) -> Result<bool> {
        let rel = self.note_path(name);
        let content = replace_frontmatter(&format!("# {}\n", name), data)?;
        let created = self.vault.create_if_missing(&rel, &content)?;
        if created {
            debug!("Created player {}", rel);
        }
        Ok(created)
    }

    /// Shallow-merge `patch` into a player's frontmatter, keeping the body.
    /// Returns the new frontmatter, or `None` when the player is missing.
    pub fn update(
        &self,
        name: &str,
        patch: &Map<String, Value>,
    ) -> Result<Option<Map<String, Value>>> {
        let rel = self.note_path(name);
        if !self.vault.exists(&rel) {
            return Ok(None);
        }
        let content = self.vault.read(&rel)?;
        let mut data = try_frontmatter(&content)
            .map_err(|e| e.context(format!("Refusing to update {}", rel)))?;
        for (key, value) in patch {
            data.insert(key.clone(), value.clone());
        }
        self.vault.write(&rel, &replace_frontmatter(&content, &data)?)?;
        debug!("Updated player {} ({} keys)", rel, patch.len());
        Ok(Some(data))
    }

    /// Set one entry of `skills`, leaving the other skills untouched.
    pub fn set_skill(
        &self,
        name: &str,
        skill: &str,
        level: Proficiency,
    ) -> Result<Option<Map<String, Value>>> {
        if skill_ability(skill).is_none() {
            bail!("Unknown skill: {}", skill);
        }
        let rel = self.note_path(name);
        if !self.vault.exists(&rel) {
            return Ok(None);
        }
        let mut skills = match try_frontmatter(&self.vault.read(&rel)?)
            .map_err(|e| e.context(format!("Refusing to update {}", rel)))?
            .remove("skills")
        {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        skills.insert(skill.to_string(), Value::from(level.as_str()));
        let mut patch = Map::new();
        patch.insert("skills".to_string(), Value::Object(skills));
        self.update(name, &patch)
    }

    pub fn skills(&self, name: &str) -> Result<Option<Vec<SkillScore>>> {
        Ok(self.get(name)?.map(|sheet| skill_scores(&sheet)))
    }
}

/// `vf player list`
pub fn run_player_list(config: &Config) -> Result<()> {
    let players = Players::from_config(config)?;
    let names = players.list()?;
    println!("players ({})", config.server.players_path);
    if names.is_empty() {
        println!("  (none)");
    }
    for name in names {
        println!("  {}", name);
    }
    Ok(())
}

/// `vf player set-skill`
pub fn run_player_set_skill(config: &Config, name: &str, skill: &str, level: &str) -> Result<()> {
    if !valid_name(name) {
        bail!("Invalid player name: {}", name);
    }
    let Some(level) = Proficiency::parse(level) else {
        bail!("Invalid proficiency '{}' (expected none, proficient or expertise)", level);
    };
    let players = Players::from_config(config)?;
    if players.set_skill(name, skill, level)?.is_none() {
        bail!("Player not found: {}", name);
    }
    println!("{}: {} -> {}", name, skill, level.as_str());
    Ok(())
}

/// `vf player skills`
pub fn run_player_skills(config: &Config, name: &str) -> Result<()> {
    if !valid_name(name) {
        bail!("Invalid player name: {}", name);
    }
    let players = Players::from_config(config)?;
    let Some(scores) = players.skills(name)? else {
        bail!("Player not found: {}", name);
    };
    println!("skills: {}", name);
    for s in scores {
        println!(
            "  {:<16} {:+} ({}{})",
            s.skill,
            s.modifier,
            &s.ability[..3],
            match s.proficiency {
                Proficiency::None => "",
                Proficiency::Proficient => ", proficient",
                Proficiency::Expertise => ", expertise",
            }
        );
    }
    Ok(())
}
