//! Raw 5etools record → [`NormalizedRecord`].
//!
//! Classification is an ordered if/else chain on field presence, so a
//! record carrying both `rarity` and `prerequisite` is always an item.
//! Nothing here fails: a record that fits no kind lands in
//! [`RecordKind::Unknown`].

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::LazyLock;

use super::{field_text, tokens, truthy};
use crate::markdown::display_value;

static INLINE_MARKUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{@[^} ]+ ([^}]+)\}").expect("markup regex"));

/// Fields folded into the search blob, in order.
pub const SEARCH_FIELDS: &[&str] = &[
    "name",
    "description",
    "desc",
    "entries",
    "source",
    "creature_type",
    "size",
    "speed",
    "traits",
    "traitTags",
    "tags",
    "race",
    "subrace",
    "subraces",
    "subclass",
    "subclasses",
    "requirements",
    "school",
    "level",
    "classes",
    "type",
    "rarity",
    "weight",
    "attunement",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordKind {
    Item,
    Feat,
    Spell,
    ClassFeature,
    MonsterTrait,
    Unknown,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Item => "Item",
            RecordKind::Feat => "Feat",
            RecordKind::Spell => "Spell",
            RecordKind::ClassFeature => "ClassFeature",
            RecordKind::MonsterTrait => "MonsterTrait",
            RecordKind::Unknown => "Unknown",
        }
    }

    /// Classify a raw record by which fields it carries.
    pub fn classify(raw: &Map<String, Value>) -> Self {
        if truthy(raw.get("rarity")) || truthy(raw.get("reqAttune")) || raw.contains_key("weight")
        {
            RecordKind::Item
        } else if truthy(raw.get("prerequisite")) {
            RecordKind::Feat
        } else if raw.contains_key("level") && truthy(raw.get("school")) {
            RecordKind::Spell
        } else if truthy(raw.get("class")) || truthy(raw.get("subclass")) {
            RecordKind::ClassFeature
        } else if truthy(raw.get("entries")) && !truthy(raw.get("rarity")) && !truthy(raw.get("level"))
        {
            RecordKind::MonsterTrait
        } else {
            RecordKind::Unknown
        }
    }
}

/// Uniform view of a rules record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub uid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub rarity: String,
    pub source: String,
    pub description: String,
    pub requirements: Option<String>,
    /// Heuristic power score, 1..=100.
    pub strength: u32,
    pub value: f64,
    pub tags: Vec<Value>,
    pub weight: Option<Value>,
    pub attunement: Option<Value>,
    pub level: Option<Value>,
    pub school: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creature_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub race: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Base race or class for subraces and subclasses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Comma-joined data files that contributed to the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Lowercase alphanumeric tokens joined by single spaces.
    #[serde(rename = "__search")]
    pub search: String,
    pub raw: Value,
}

/// Normalize any raw record. `None` unless it is an object with a name.
pub fn normalize_any(raw: &Value) -> Option<NormalizedRecord> {
    normalize_row(raw, None)
}

/// Normalize a row read from `table` (e.g. `races`, `classes`).
pub fn normalize_row(raw: &Value, table: Option<&str>) -> Option<NormalizedRecord> {
    let obj = raw.as_object()?;
    if !truthy(obj.get("name")) {
        return None;
    }
    let name = display_value(obj.get("name")?);
    let kind = RecordKind::classify(obj);

    let rarity = non_empty(obj.get("rarity")).unwrap_or_else(|| "Common".to_string());
    let source = non_empty(obj.get("source")).unwrap_or_else(|| "Unknown".to_string());

    let description = match (obj.get("entries"), obj.get("desc")) {
        (Some(Value::Array(entries)), _) => flatten_entries(entries),
        (_, Some(Value::Array(desc))) => flatten_entries(desc),
        _ => String::new(),
    };

    let strength = score(&rarity, &description);
    let value = match kind {
        RecordKind::Item => item_value(obj.get("value")).unwrap_or(strength as f64 * 100.0),
        RecordKind::ClassFeature => strength as f64 * 75.0,
        _ => strength as f64 * 50.0,
    };

    let tags = match obj
        .get("tags")
        .filter(|v| !v.is_null())
        .or_else(|| obj.get("type").filter(|v| !v.is_null()))
        .or_else(|| obj.get("subtype").filter(|v| !v.is_null()))
    {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    };

    let is_race = table == Some("races")
        || truthy(obj.get("creatureTypes"))
        || truthy(obj.get("traitTags"))
        || truthy(obj.get("size"));
    let is_class = table == Some("classes")
        || truthy(obj.get("class"))
        || truthy(obj.get("subclasses"))
        || truthy(obj.get("subclass"));

    let mut record = NormalizedRecord {
        uid: format!("{}|{}", name, source),
        requirements: requirements(obj, kind),
        weight: present(obj.get("weight")),
        attunement: present(obj.get("reqAttune")),
        level: present(obj.get("level")),
        school: present(obj.get("school")),
        creature_type: obj
            .get("creatureTypes")
            .filter(|v| truthy(Some(*v)))
            .map(join_list),
        size: obj.get("size").filter(|v| truthy(Some(*v))).map(join_list),
        speed: obj.get("speed").filter(|v| !v.is_null()).map(render_speed),
        traits: traits(obj),
        race: is_race.then(|| name.clone()),
        class: is_class.then(|| name.clone()),
        parent: None,
        file: None,
        search: String::new(),
        raw: raw.clone(),
        name,
        kind,
        rarity,
        source,
        description,
        strength,
        value,
        tags,
    };
    record.search = search_blob(&record, obj);
    Some(record)
}

/// Replace `{@tag text}` markup with its text.
pub fn strip_markup(text: &str) -> String {
    INLINE_MARKUP.replace_all(text, "$1").into_owned()
}

/// Flatten nested `entries` into plain text.
pub fn flatten_entries(entries: &[Value]) -> String {
    let mut parts = Vec::new();
    for entry in entries {
        match entry {
            Value::String(s) => parts.push(strip_markup(s)),
            Value::Object(obj) if truthy(obj.get("entries")) => {
                if let Some(Value::Array(nested)) = obj.get("entries") {
                    parts.push(flatten_entries(nested));
                }
            }
            Value::Object(obj) if truthy(obj.get("name")) => {
                if let Some(name) = obj.get("name") {
                    parts.push(strip_markup(&display_value(name)));
                }
            }
            _ => {}
        }
    }
    parts.join(" ")
}

/// Heuristic power score from rarity and description keywords.
pub fn score(rarity: &str, description: &str) -> u32 {
    let base = match rarity.to_lowercase().as_str() {
        "common" => 5,
        "uncommon" => 15,
        "rare" => 30,
        "very rare" => 50,
        "legendary" => 75,
        "artifact" => 90,
        _ => 0,
    };

    let desc = description.to_lowercase();
    let bonuses: [(&[&str], u32); 9] = [
        (&["+1 to attack"], 10),
        (&["+2 to attack"], 20),
        (&["resistance"], 8),
        (&["immune"], 20),
        (&["flight", "fly speed"], 15),
        (&["invisible"], 15),
        (&["teleport"], 15),
        (&["advantage"], 5),
        (&["at will"], 10),
    ];
    let bonus: u32 = bonuses
        .iter()
        .filter(|(needles, _)| needles.iter().any(|n| desc.contains(n)))
        .map(|(_, points)| points)
        .sum();

    (base + bonus).clamp(1, 100)
}

/// Item value in gold from a copper `value`; `None` when absent or unparsable.
fn item_value(value: Option<&Value>) -> Option<f64> {
    if !truthy(value) {
        return None;
    }
    let copper = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    Some(copper / 100.0)
}

fn requirements(raw: &Map<String, Value>, kind: RecordKind) -> Option<String> {
    let mut reqs: Vec<String> = Vec::new();

    if kind == RecordKind::Feat {
        let prereqs: Vec<&Value> = match raw.get("prerequisite") {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(other) => vec![other],
            None => Vec::new(),
        };
        for req in prereqs.into_iter().filter_map(Value::as_object) {
            if let Some(Value::Array(abilities)) = req.get("ability") {
                for ab in abilities.iter().filter_map(Value::as_object) {
                    for (ability, min) in ab {
                        reqs.push(format!("{} {}+", ability.to_uppercase(), display_value(min)));
                    }
                }
            }
            if let Some(race) = req.get("race") {
                let races: Vec<&Value> = match race {
                    Value::Array(items) => items.iter().collect(),
                    other => vec![other],
                };
                let names: Vec<String> = races
                    .into_iter()
                    .map(|r| match r {
                        Value::Object(o) => {
                            let name = o.get("name").map(display_value).unwrap_or_default();
                            match o.get("subrace").filter(|s| truthy(Some(*s))) {
                                Some(sub) => format!("{} ({})", name, display_value(sub)),
                                None => name,
                            }
                        }
                        other => display_value(other),
                    })
                    .collect();
                reqs.push(format!("Race: {}", names.join(", ")));
            }
            if let Some(feat) = req.get("feat").filter(|f| truthy(Some(*f))) {
                reqs.push(format!("Feat: {}", display_value(feat)));
            }
            if let Some(Value::Object(class)) = req.get("class") {
                let name = class.get("name").map(display_value).unwrap_or_default();
                reqs.push(format!("{} level {}+", name, level_or_one(class.get("level"))));
            }
        }
    }

    if kind == RecordKind::ClassFeature {
        let level = level_or_one(raw.get("level"));
        if let Some(class) = raw.get("class").filter(|v| truthy(Some(*v))) {
            reqs.push(format!("{} level {}+", display_value(class), level));
        }
        if let Some(sub) = raw.get("subclass").filter(|v| truthy(Some(*v))) {
            reqs.push(format!("{} subclass, level {}+", display_value(sub), level));
        }
    }

    if kind == RecordKind::Spell {
        if let Some(level) = raw.get("level") {
            reqs.push(format!("Spell level {}", display_value(level)));
        }
        let names = spell_class_names(raw);
        if !names.is_empty() {
            reqs.push(format!("Available to: {}", names.join(", ")));
        }
    }

    if let Some(attune) = raw.get("reqAttune").filter(|v| truthy(Some(*v))) {
        reqs.push(format!("Attunement: {}", display_value(attune)));
    }

    (!reqs.is_empty()).then(|| reqs.join("; "))
}

/// Class names from a spell's `classes` (a list, or `{fromClassList: [...]}`).
pub fn spell_class_names(raw: &Map<String, Value>) -> Vec<String> {
    let list = match raw.get("classes") {
        Some(Value::Array(items)) => items,
        Some(Value::Object(obj)) => match obj.get("fromClassList") {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    list.iter()
        .map(|c| match c.get("name") {
            Some(name) => display_value(name),
            None => display_value(c),
        })
        .collect()
}

fn level_or_one(level: Option<&Value>) -> String {
    match level {
        Some(v) if truthy(Some(v)) => display_value(v),
        _ => "1".to_string(),
    }
}

/// `walk:30, fly:60` for speed objects, the plain value otherwise.
fn render_speed(speed: &Value) -> String {
    match speed {
        Value::Object(obj) => {
            let parts: Vec<String> = ["walk", "fly", "swim"]
                .iter()
                .filter_map(|mode| {
                    obj.get(*mode)
                        .filter(|v| truthy(Some(*v)))
                        .map(|v| format!("{}:{}", mode, display_value(v)))
                })
                .collect();
            if parts.is_empty() {
                speed.to_string()
            } else {
                parts.join(", ")
            }
        }
        other => display_value(other),
    }
}

/// Trait names from `traitTags` and named entries, first-seen order.
fn traits(raw: &Map<String, Value>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let tags: Vec<String> = match raw.get("traitTags") {
        Some(Value::Array(items)) => items.iter().map(display_value).collect(),
        _ => Vec::new(),
    };
    let named: Vec<String> = match raw.get("entries") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|e| e.get("name").filter(|n| truthy(Some(*n))).map(display_value))
            .collect(),
        _ => Vec::new(),
    };
    for t in tags.into_iter().chain(named) {
        if !t.is_empty() && !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

fn join_list(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => display_value(other),
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .filter(|v| truthy(Some(*v)))
        .map(display_value)
}

fn present(value: Option<&Value>) -> Option<Value> {
    value.filter(|v| !v.is_null()).cloned()
}

/// Value of a search field: the normalized one when the record defines
/// it, else the raw one.
fn search_value(record: &NormalizedRecord, raw: &Map<String, Value>, field: &str) -> Option<Value> {
    let opt = |v: &Option<Value>| Some(v.clone().unwrap_or(Value::Null));
    match field {
        "name" => Some(json!(record.name)),
        "description" => Some(json!(record.description)),
        "source" => Some(json!(record.source)),
        "rarity" => Some(json!(record.rarity)),
        "type" => Some(json!(record.kind.as_str())),
        "tags" => Some(Value::Array(record.tags.clone())),
        "requirements" => Some(record.requirements.clone().map(Value::String).unwrap_or(Value::Null)),
        "weight" => opt(&record.weight),
        "attunement" => opt(&record.attunement),
        "level" => opt(&record.level),
        "school" => opt(&record.school),
        "creature_type" => record.creature_type.clone().map(Value::String).or_else(|| raw.get(field).cloned()),
        "size" => record.size.clone().map(Value::String).or_else(|| raw.get(field).cloned()),
        "speed" => record.speed.clone().map(Value::String).or_else(|| raw.get(field).cloned()),
        "race" => record.race.clone().map(Value::String).or_else(|| raw.get(field).cloned()),
        "traits" if !record.traits.is_empty() => Some(json!(record.traits)),
        _ => raw.get(field).cloned(),
    }
}

fn search_blob(record: &NormalizedRecord, raw: &Map<String, Value>) -> String {
    let parts: Vec<String> = SEARCH_FIELDS
        .iter()
        .filter_map(|f| search_value(record, raw, f))
        .map(|v| field_text(&v))
        .filter(|s| !s.is_empty())
        .collect();
    tokens(&parts.join(" ")).join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_object_with_name() {
        assert!(normalize_any(&json!(null)).is_none());
        assert!(normalize_any(&json!("Longsword")).is_none());
        assert!(normalize_any(&json!({"name": ""})).is_none());
        assert!(normalize_any(&json!({"source": "PHB"})).is_none());
    }

    #[test]
    fn test_classification_order() {
        let kind = |v: Value| normalize_any(&v).unwrap().kind;
        assert_eq!(kind(json!({"name": "A", "rarity": "rare", "prerequisite": [{}]})), RecordKind::Item);
        assert_eq!(kind(json!({"name": "A", "weight": 0})), RecordKind::Item);
        assert_eq!(kind(json!({"name": "A", "prerequisite": [{"feat": "x"}]})), RecordKind::Feat);
        assert_eq!(kind(json!({"name": "A", "level": 0, "school": "V"})), RecordKind::Spell);
        assert_eq!(kind(json!({"name": "A", "class": "Wizard"})), RecordKind::ClassFeature);
        assert_eq!(kind(json!({"name": "A", "entries": ["x"]})), RecordKind::MonsterTrait);
        assert_eq!(kind(json!({"name": "A", "entries": ["x"], "level": 3})), RecordKind::Unknown);
        assert_eq!(kind(json!({"name": "A"})), RecordKind::Unknown);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let raw = json!({"name": "Cloak", "rarity": "uncommon", "reqAttune": true,
                         "entries": ["You have {@b advantage} on stealth."]});
        assert_eq!(normalize_any(&raw), normalize_any(&raw));
    }

    #[test]
    fn test_item_fields() {
        let raw = json!({
            "name": "Cloak of Elvenkind",
            "source": "DMG",
            "rarity": "uncommon",
            "reqAttune": true,
            "weight": 1,
            "value": 5000,
            "entries": ["While you wear it, you have {@dice advantage} on Stealth checks."]
        });
        let rec = normalize_any(&raw).unwrap();
        assert_eq!(rec.uid, "Cloak of Elvenkind|DMG");
        assert_eq!(rec.kind, RecordKind::Item);
        assert_eq!(rec.description, "While you wear it, you have advantage on Stealth checks.");
        assert_eq!(rec.strength, 20);
        assert_eq!(rec.value, 50.0);
        assert_eq!(rec.requirements.as_deref(), Some("Attunement: true"));
        assert_eq!(rec.weight, Some(json!(1)));
    }

    #[test]
    fn test_unparsable_item_value_falls_back_to_strength() {
        let rec = normalize_any(&json!({"name": "Gem", "rarity": "rare", "value": "lots"})).unwrap();
        assert_eq!(rec.value, 3000.0);
    }

    #[test]
    fn test_strength_is_clamped() {
        assert_eq!(score("", ""), 1);
        let loaded = "immune, flight, invisible, teleport, resistance, at will, +2 to attack";
        assert_eq!(score("artifact", loaded), 100);
    }

    #[test]
    fn test_feat_requirements() {
        let raw = json!({
            "name": "Elven Accuracy",
            "prerequisite": [{
                "race": [{"name": "elf"}, {"name": "half-elf", "subrace": "drow"}],
                "ability": [{"dex": 13}]
            }]
        });
        let rec = normalize_any(&raw).unwrap();
        assert_eq!(rec.kind, RecordKind::Feat);
        assert_eq!(
            rec.requirements.as_deref(),
            Some("DEX 13+; Race: elf, half-elf (drow)")
        );
    }

    #[test]
    fn test_spell_requirements_and_value() {
        let raw = json!({
            "name": "Misty Step",
            "level": 2,
            "school": "C",
            "classes": {"fromClassList": [{"name": "Sorcerer"}, {"name": "Wizard"}]},
            "entries": ["You {@b teleport} up to 30 feet."]
        });
        let rec = normalize_any(&raw).unwrap();
        assert_eq!(rec.kind, RecordKind::Spell);
        assert_eq!(
            rec.requirements.as_deref(),
            Some("Spell level 2; Available to: Sorcerer, Wizard")
        );
        assert_eq!(rec.strength, 20);
        assert_eq!(rec.value, 1000.0);
    }

    #[test]
    fn test_race_projection() {
        let raw = json!({
            "name": "Elf",
            "source": "PHB",
            "size": ["M"],
            "speed": {"walk": 30, "fly": 0},
            "traitTags": ["Darkvision"],
            "entries": [
                {"name": "Darkvision", "entries": ["You see in the dark."]},
                {"name": "Fey Ancestry", "entries": ["You have advantage against charm."]}
            ]
        });
        let rec = normalize_row(&raw, Some("races")).unwrap();
        assert_eq!(rec.race.as_deref(), Some("Elf"));
        assert_eq!(rec.size.as_deref(), Some("M"));
        assert_eq!(rec.speed.as_deref(), Some("walk:30"));
        assert_eq!(rec.traits, vec!["Darkvision", "Fey Ancestry"]);
        assert_eq!(rec.description, "You see in the dark. You have advantage against charm.");
        assert!(rec.class.is_none());
    }

    #[test]
    fn test_tags_fallback_chain() {
        let rec = normalize_any(&json!({"name": "Dagger", "weight": 1, "type": "M"})).unwrap();
        assert_eq!(rec.tags, vec![json!("M")]);
        let rec = normalize_any(&json!({"name": "X", "tags": ["a", "b"], "type": "M"})).unwrap();
        assert_eq!(rec.tags, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn test_search_blob_tokens() {
        let raw = json!({"name": "Half-Elf", "source": "PHB", "subraces": [{"name": "Drow"}]});
        let rec = normalize_row(&raw, Some("races")).unwrap();
        assert!(rec.search.starts_with("half elf "));
        assert!(rec.search.split(' ').any(|t| t == "drow"));
        assert!(rec.search.split(' ').any(|t| t == "phb"));
        assert!(!rec.search.contains("  "));
    }

    #[test]
    fn test_flatten_nested_entries() {
        let entries = json!([
            "Intro {@spell fireball} text.",
            {"type": "list", "entries": ["one", {"name": "Named"}]},
            {"name": "Header only"},
            42
        ]);
        let text = flatten_entries(entries.as_array().unwrap());
        assert_eq!(text, "Intro fireball text. one Named Header only");
    }
}
