//! Per-level class export for character sheets.
//!
//! Input is a 5etools class file (`{class: [...], subclass: [...]}`), a
//! list of classes, or a single class. Output maps
//! `"{class-name}|{source}"` (lowercase, spaces as dashes) to hit dice, a
//! bucket per class level, and the same per subclass. Subclass spell data
//! is folded into the base class levels without replacing what the class
//! already defines.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use super::truthy;
use crate::config::Config;
use crate::markdown::display_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HitDice {
    pub number: u64,
    pub faces: u64,
}

impl Default for HitDice {
    fn default() -> Self {
        Self {
            number: 1,
            faces: 10,
        }
    }
}

impl HitDice {
    fn from_raw(raw: Option<&Value>) -> Option<Self> {
        let hd = raw.filter(|v| truthy(Some(*v)))?;
        let default = Self::default();
        Some(Self {
            number: hd.get("number").and_then(Value::as_u64).unwrap_or(default.number),
            faces: hd.get("faces").and_then(Value::as_u64).unwrap_or(default.faces),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    pub level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain_subclass_feature: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Value>,
    /// Feature objects without a reference string are kept whole.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Spellcasting {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ability: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caster_progression: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cantrips_known: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spells_known: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepared: Option<bool>,
}

impl Spellcasting {
    /// Copy every field `other` sets.
    fn overlay(&mut self, other: &Spellcasting) {
        if other.ability.is_some() {
            self.ability = other.ability.clone();
        }
        if other.caster_progression.is_some() {
            self.caster_progression = other.caster_progression.clone();
        }
        if other.cantrips_known.is_some() {
            self.cantrips_known = other.cantrips_known.clone();
        }
        if other.spells_known.is_some() {
            self.spells_known = other.spells_known.clone();
        }
        if other.prepared.is_some() {
            self.prepared = other.prepared;
        }
    }

    /// Fill only the fields this one lacks.
    fn fill_from(&mut self, other: &Spellcasting) {
        if !truthy(self.ability.as_ref()) && truthy(other.ability.as_ref()) {
            self.ability = other.ability.clone();
        }
        if !truthy(self.caster_progression.as_ref()) && truthy(other.caster_progression.as_ref()) {
            self.caster_progression = other.caster_progression.clone();
        }
        if self.cantrips_known.is_none() {
            self.cantrips_known = other.cantrips_known.clone();
        }
        if self.spells_known.is_none() {
            self.spells_known = other.spells_known.clone();
        }
    }
}

/// Spells granted at a level by `additionalSpells`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpellGrant {
    Expanded(Value),
    Known(Value),
    Innate(Value),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelBucket {
    pub features: Vec<Feature>,
    /// Spell level → slot count.
    pub spell_slots: BTreeMap<u32, u64>,
    pub spells_known: u64,
    pub spellcasting: Option<Spellcasting>,
    pub spells: Vec<SpellGrant>,
    /// Subclass key → that subclass's spellcasting at this level.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub subclass_spellcasting: BTreeMap<String, Spellcasting>,
}

impl LevelBucket {
    fn spellcasting_mut(&mut self) -> &mut Spellcasting {
        self.spellcasting.get_or_insert_with(Spellcasting::default)
    }
}

pub type Levels = BTreeMap<u32, LevelBucket>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubclassExport {
    pub hd: HitDice,
    pub levels: Levels,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassExport {
    pub hd: HitDice,
    pub levels: Levels,
    pub subclasses: BTreeMap<String, SubclassExport>,
}

pub type ClassExportMap = BTreeMap<String, ClassExport>;

/// `"Path of the Totem Warrior"`, `"PHB"` → `"path-of-the-totem-warrior|phb"`.
pub fn export_key(name: &str, source: &str) -> String {
    let name = name
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    format!("{}|{}", name, source.to_lowercase())
}

fn text(value: Option<&Value>) -> String {
    value
        .filter(|v| truthy(Some(*v)))
        .map(display_value)
        .unwrap_or_default()
}

fn level_of(value: Option<&Value>) -> u32 {
    let level = match value {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as u32).unwrap_or(1),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(1),
        _ => 1,
    };
    level.max(1)
}

/// Class level from an `additionalSpells` key (`"3"`, `"s3"`).
fn grant_level(key: &str) -> Option<u32> {
    key.trim_start_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()
}

/// `name|class|classSource|level|source`, with empty parts skipped over.
fn parse_feature_ref(reference: &str, class_source: &Value, level_fallback: bool) -> Feature {
    let parts: Vec<&str> = reference.split('|').collect();
    let part = |i: usize| parts.get(i).copied().filter(|p| !p.is_empty());
    let name = part(0).unwrap_or(reference).to_string();
    let source = part(2)
        .map(|s| Value::String(s.to_string()))
        .or_else(|| Some(class_source.clone()).filter(|v| !v.is_null()));
    let level_text = if level_fallback {
        part(3).or_else(|| part(4))
    } else {
        part(3)
    };
    Feature {
        name: Some(name),
        source,
        level: level_text.and_then(|l| l.trim().parse().ok()).unwrap_or(1).max(1),
        ..Feature::default()
    }
}

fn class_levels(cls: &Value) -> Levels {
    let mut levels = Levels::new();
    let source = cls.get("source").cloned().unwrap_or(Value::Null);

    for f in cls.get("classFeatures").and_then(Value::as_array).into_iter().flatten() {
        match f {
            Value::String(reference) => {
                let feature = parse_feature_ref(reference, &source, true);
                levels.entry(feature.level).or_default().features.push(feature);
            }
            Value::Object(obj) => {
                let reference = obj.get("classFeature").or_else(|| obj.get("classfeature"));
                let feature = match reference {
                    Some(Value::String(reference)) => Feature {
                        gain_subclass_feature: Some(truthy(obj.get("gainSubclassFeature"))),
                        ..parse_feature_ref(reference, &source, false)
                    },
                    _ => Feature {
                        level: level_of(obj.get("level")),
                        raw: Some(f.clone()),
                        ..Feature::default()
                    },
                };
                levels.entry(feature.level).or_default().features.push(feature);
            }
            _ => {}
        }
    }

    for cf in cls.get("classFeature").and_then(Value::as_array).into_iter().flatten() {
        let level = level_of(cf.get("level"));
        levels.entry(level).or_default().features.push(Feature {
            name: cf.get("name").map(display_value),
            source: cf.get("source").cloned(),
            level,
            entries: cf.get("entries").cloned(),
            ..Feature::default()
        });
    }

    levels
}

fn write_spellcasting(levels: &mut Levels, level: u32, data: &Spellcasting) {
    levels.entry(level).or_default().spellcasting_mut().overlay(data);
}

fn each_row<'a>(value: Option<&'a Value>) -> impl Iterator<Item = (u32, &'a Value)> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(i, v)| (i as u32 + 1, v))
}

fn subclass_levels(sc: &Value) -> Levels {
    let mut levels = Levels::new();

    for (level, c) in each_row(sc.get("cantripProgression")) {
        let data = Spellcasting {
            cantrips_known: Some(c.clone()),
            ..Spellcasting::default()
        };
        write_spellcasting(&mut levels, level, &data);
    }
    for (level, c) in each_row(sc.get("spellsKnownProgression")) {
        let data = Spellcasting {
            spells_known: Some(c.clone()),
            ..Spellcasting::default()
        };
        write_spellcasting(&mut levels, level, &data);
    }
    for (level, c) in each_row(sc.get("preparedSpellsProgression")) {
        let data = Spellcasting {
            spells_known: Some(c.clone()),
            prepared: Some(true),
            ..Spellcasting::default()
        };
        write_spellcasting(&mut levels, level, &data);
    }
    if let Some(ability) = sc.get("spellcastingAbility").filter(|v| truthy(Some(*v))) {
        let data = Spellcasting {
            ability: Some(ability.clone()),
            caster_progression: sc.get("casterProgression").filter(|v| !v.is_null()).cloned(),
            ..Spellcasting::default()
        };
        write_spellcasting(&mut levels, 1, &data);
    }

    for add in sc.get("additionalSpells").and_then(Value::as_array).into_iter().flatten() {
        let kinds: [(&str, fn(Value) -> SpellGrant); 3] = [
            ("expanded", SpellGrant::Expanded),
            ("known", SpellGrant::Known),
            ("innate", SpellGrant::Innate),
        ];
        for (kind, grant) in kinds {
            let Some(map) = add.get(kind).and_then(Value::as_object) else {
                continue;
            };
            for (key, spells) in map {
                match grant_level(key) {
                    Some(level) => levels.entry(level).or_default().spells.push(grant(spells.clone())),
                    None => debug!("Skipping {} spells under key {:?}", kind, key),
                }
            }
        }
    }

    for group in sc.get("subclassTableGroups").and_then(Value::as_array).into_iter().flatten() {
        for (level, row) in each_row(group.get("rowsSpellProgression")) {
            let bucket = levels.entry(level).or_default();
            for (i, count) in row.as_array().into_iter().flatten().enumerate() {
                let n = count.as_u64().unwrap_or(0);
                if n > 0 {
                    bucket.spell_slots.insert(i as u32 + 1, n);
                }
            }
        }

        let Some(labels) = group.get("colLabels").and_then(Value::as_array) else {
            continue;
        };
        let columns: Vec<(usize, bool)> = labels
            .iter()
            .enumerate()
            .filter_map(|(col, label)| {
                let lower = display_value(label).to_lowercase();
                if lower.contains("cantrips") {
                    Some((col, true))
                } else if lower.contains("spells known")
                    || lower.contains("spellsknown")
                    || lower.contains("spells prepared")
                {
                    Some((col, false))
                } else {
                    None
                }
            })
            .collect();
        if columns.is_empty() {
            continue;
        }
        for (level, row) in each_row(group.get("rows")) {
            for &(col, cantrips) in &columns {
                let Some(value) = row.get(col) else { continue };
                let data = if cantrips {
                    Spellcasting {
                        cantrips_known: Some(value.clone()),
                        ..Spellcasting::default()
                    }
                } else {
                    Spellcasting {
                        spells_known: Some(value.clone()),
                        ..Spellcasting::default()
                    }
                };
                write_spellcasting(&mut levels, level, &data);
            }
        }
    }

    if levels.is_empty() {
        if let Some(progression) = sc.get("casterProgression").filter(|v| truthy(Some(*v))) {
            let data = Spellcasting {
                caster_progression: Some(progression.clone()),
                ..Spellcasting::default()
            };
            write_spellcasting(&mut levels, 1, &data);
        }
    }

    levels
}

/// Fold a subclass's per-level spell data into the class levels.
fn merge_into_class(class_levels: &mut Levels, key: &str, sub_levels: &Levels) {
    for (level, sub) in sub_levels {
        let base = class_levels.entry(*level).or_default();
        base.spell_slots
            .extend(sub.spell_slots.iter().map(|(k, v)| (*k, *v)));
        base.spells.extend(sub.spells.iter().cloned());

        let per_sub = base.subclass_spellcasting.entry(key.to_string()).or_default();
        if let Some(casting) = &sub.spellcasting {
            per_sub.overlay(casting);
            base.spellcasting_mut().fill_from(casting);
        }
        if sub.spells_known > 0 && base.spells_known == 0 {
            base.spells_known = sub.spells_known;
        }
    }
}

/// Build the export map from a class file, a class list, or one class.
/// `subclasses` is used when the input is not a whole file.
pub fn make_class_export_map(input: &Value, subclasses: &[Value]) -> ClassExportMap {
    let is_file = truthy(input.get("class"));
    let classes: Vec<&Value> = if is_file {
        input.get("class").and_then(Value::as_array).into_iter().flatten().collect()
    } else if let Value::Array(list) = input {
        list.iter().collect()
    } else {
        vec![input]
    };
    let all_subclasses: Vec<&Value> = if is_file {
        input.get("subclass").and_then(Value::as_array).into_iter().flatten().collect()
    } else {
        subclasses.iter().collect()
    };

    let mut result = ClassExportMap::new();
    for cls in classes {
        let name = text(cls.get("name"));
        let key = export_key(&name, &text(cls.get("source")));
        let hd = HitDice::from_raw(cls.get("hd")).unwrap_or_default();
        let mut levels = class_levels(cls);
        let mut subs = BTreeMap::new();

        for sc in all_subclasses.iter().filter(|s| text(s.get("className")) == name) {
            let sub_name = ["name", "shortName", "subclassShortName"]
                .iter()
                .map(|k| text(sc.get(*k)))
                .find(|n| !n.is_empty())
                .unwrap_or_else(|| "subclass".to_string());
            let sub_key = export_key(&sub_name, &text(sc.get("source")));
            let sub_levels = subclass_levels(sc);
            merge_into_class(&mut levels, &sub_key, &sub_levels);
            subs.insert(
                sub_key,
                SubclassExport {
                    hd: HitDice::from_raw(sc.get("hd")).unwrap_or(hd),
                    levels: sub_levels,
                },
            );
        }

        result.insert(
            key,
            ClassExport {
                hd,
                levels,
                subclasses: subs,
            },
        );
    }
    result
}

/// `vf rules classes`
pub fn run_rules_classes(config: &Config, file: &Path, out: Option<&Path>) -> Result<()> {
    let path = if file.is_file() {
        file.to_path_buf()
    } else {
        config.rules.data_path.join(file)
    };
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read class file: {}", path.display()))?;
    let input: Value = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;

    let map = make_class_export_map(&input, &[]);
    if map.is_empty() {
        warn!("No classes found in {}", path.display());
    }
    let json = serde_json::to_string_pretty(&map)?;

    match out {
        Some(out) => {
            std::fs::write(out, json)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("rules classes");
            println!("  input: {}", path.display());
            for (key, class) in &map {
                println!(
                    "  {}: {} levels, {} subclasses",
                    key,
                    class.levels.len(),
                    class.subclasses.len()
                );
            }
            println!("  output: {}", out.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
