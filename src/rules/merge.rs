//! Deep merge of raw records that describe the same entity in different
//! data files. `b` is the newer file and wins scalar conflicts.

use serde_json::{Map, Value};

use super::{compact, truthy};

/// Keys holding descriptive text lists.
const TEXT_KEYS: &[&str] = &["entries", "desc", "description"];
/// Keys always merged as lists, even when one side is a single value.
const LIST_KEYS: &[&str] = &["subraces", "subrace", "subclasses", "subclass"];

/// Merge two raw records.
///
/// - a missing (`null`) side yields a copy of the other;
/// - keys only in `b` are copied;
/// - text lists (`entries`/`desc`/`description`) are combined and
///   deduplicated by normalized name or text;
/// - `speed` is merged with [`merge_speed`];
/// - sub-race/sub-class fields and any other arrays are concatenated and
///   deduplicated by [`dedup_key`];
/// - nested objects merge recursively; other conflicts take `b`.
pub fn deep_merge_raw(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Null, _) => b.clone(),
        (_, Value::Null) => a.clone(),
        (Value::Object(left), Value::Object(right)) => Value::Object(merge_objects(left, right)),
        (Value::Array(left), Value::Array(right)) => Value::Array(concat_dedup(left, right)),
        _ => b.clone(),
    }
}

fn merge_objects(a: &Map<String, Value>, b: &Map<String, Value>) -> Map<String, Value> {
    let mut out = a.clone();

    for (key, bv) in b {
        if bv.is_null() {
            continue;
        }
        let Some(av) = out.get(key).filter(|v| !v.is_null()) else {
            out.insert(key.clone(), bv.clone());
            continue;
        };

        let merged = if TEXT_KEYS.contains(&key.as_str()) {
            Value::Array(merge_text(av, bv))
        } else if key == "speed" {
            merge_speed(av, bv)
        } else if LIST_KEYS.contains(&key.as_str()) {
            if !av.is_array() && !bv.is_array() && av == bv {
                av.clone()
            } else {
                Value::Array(concat_dedup(&as_list(av), &as_list(bv)))
            }
        } else if av.is_array() || bv.is_array() {
            Value::Array(concat_dedup(&as_list(av), &as_list(bv)))
        } else if av.is_object() && bv.is_object() {
            deep_merge_raw(av, bv)
        } else {
            bv.clone()
        };
        out.insert(key.clone(), merged);
    }

    out
}

/// Identity used when deduplicating list items: the normalized name for
/// named objects and strings, JSON otherwise.
pub fn dedup_key(item: &Value) -> String {
    match item {
        Value::Object(obj) if truthy(obj.get("name")) => match obj.get("name") {
            Some(Value::String(s)) => compact(s),
            Some(other) => compact(&other.to_string()),
            None => String::new(),
        },
        Value::String(s) => compact(s),
        other => other.to_string(),
    }
}

fn as_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

fn concat_dedup(a: &[Value], b: &[Value]) -> Vec<Value> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for item in a.iter().chain(b) {
        let key = dedup_key(item);
        if !seen.contains(&key) {
            seen.push(key);
            out.push(item.clone());
        }
    }
    out
}

/// Text entries of either side: a list, a single string, or an object
/// carrying its own `entries`.
fn text_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::String(_) => vec![value.clone()],
        Value::Object(obj) => match obj.get("entries") {
            Some(Value::Array(items)) => items.clone(),
            Some(other) if !other.is_null() => vec![other.clone()],
            _ => vec![value.clone()],
        },
        _ if truthy(Some(value)) => vec![value.clone()],
        _ => Vec::new(),
    }
}

fn merge_text(a: &Value, b: &Value) -> Vec<Value> {
    concat_dedup(&text_list(a), &text_list(b))
}

/// Merge two `speed` values: numbers prefer `b`; a number against
/// anything else becomes `b` as a string; strings keep the longer one
/// (ties prefer `b`); objects merge keys preferring `b`.
pub fn merge_speed(a: &Value, b: &Value) -> Value {
    if !truthy(Some(a)) {
        return b.clone();
    }
    if !truthy(Some(b)) {
        return a.clone();
    }
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => b.clone(),
        (Value::Number(_), _) | (_, Value::Number(_)) => Value::String(match b {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        (Value::String(sa), Value::String(sb)) => {
            if sb.chars().count() >= sa.chars().count() {
                b.clone()
            } else {
                a.clone()
            }
        }
        (Value::Object(oa), Value::Object(ob)) => {
            let mut out = oa.clone();
            for (k, v) in ob {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        _ => b.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn elf() -> Value {
        json!({
            "name": "Elf",
            "source": "PHB",
            "speed": {"walk": 30},
            "entries": [
                "Elves are a magical people.",
                {"name": "Darkvision", "entries": ["You see in dim light."]}
            ],
            "subraces": [{"name": "High Elf"}, {"name": "Wood Elf"}],
            "ability": [{"dex": 2}],
            "age": {"mature": 100}
        })
    }

    #[test]
    fn test_merge_with_self_is_idempotent() {
        let raw = elf();
        assert_eq!(deep_merge_raw(&raw, &raw), raw);

        let scalar_sub = json!({"name": "Champion", "subclass": "Champion", "speed": 30});
        assert_eq!(deep_merge_raw(&scalar_sub, &scalar_sub), scalar_sub);
    }

    #[test]
    fn test_null_side_copies_other() {
        assert_eq!(deep_merge_raw(&Value::Null, &elf()), elf());
        assert_eq!(deep_merge_raw(&elf(), &Value::Null), elf());
    }

    #[test]
    fn test_newer_scalars_win_and_new_keys_copied() {
        let a = json!({"name": "Elf", "source": "PHB", "size": "M"});
        let b = json!({"name": "Elf", "source": "PHB", "size": "S", "darkvision": 60});
        let merged = deep_merge_raw(&a, &b);
        assert_eq!(merged["size"], "S");
        assert_eq!(merged["darkvision"], 60);
    }

    #[test]
    fn test_entries_combined_and_deduplicated() {
        let a = json!({"entries": ["Elves are a magical people.", {"name": "Darkvision"}]});
        let b = json!({"entries": ["Elves are a MAGICAL people!", {"name": "Trance"}]});
        let merged = deep_merge_raw(&a, &b);
        assert_eq!(
            merged["entries"],
            json!(["Elves are a magical people.", {"name": "Darkvision"}, {"name": "Trance"}])
        );
    }

    #[test]
    fn test_desc_string_merges_into_list() {
        let a = json!({"desc": "Old text."});
        let b = json!({"desc": ["New text."]});
        assert_eq!(deep_merge_raw(&a, &b)["desc"], json!(["Old text.", "New text."]));
    }

    #[test]
    fn test_subraces_concatenated_by_name() {
        let a = json!({"subraces": [{"name": "High Elf", "source": "PHB"}]});
        let b = json!({"subraces": [{"name": "high elf", "source": "XPHB"}, {"name": "Drow"}]});
        let merged = deep_merge_raw(&a, &b);
        assert_eq!(
            merged["subraces"],
            json!([{"name": "High Elf", "source": "PHB"}, {"name": "Drow"}])
        );
    }

    #[test]
    fn test_nested_objects_merge_recursively() {
        let a = json!({"age": {"mature": 100, "max": 750}});
        let b = json!({"age": {"max": 700}});
        assert_eq!(deep_merge_raw(&a, &b)["age"], json!({"mature": 100, "max": 700}));
    }

    #[test]
    fn test_merge_speed_rules() {
        assert_eq!(merge_speed(&json!(30), &json!(35)), json!(35));
        assert_eq!(merge_speed(&json!(30), &json!({"walk": 30})), json!(r#"{"walk":30}"#));
        assert_eq!(merge_speed(&json!({"walk": 30}), &json!(25)), json!("25"));
        assert_eq!(merge_speed(&json!("30 ft., fly 60 ft."), &json!("30 ft.")), json!("30 ft., fly 60 ft."));
        assert_eq!(merge_speed(&json!("25 ft."), &json!("30 ft.")), json!("30 ft."));
        assert_eq!(
            merge_speed(&json!({"walk": 30, "swim": 30}), &json!({"walk": 25})),
            json!({"walk": 25, "swim": 30})
        );
        assert_eq!(merge_speed(&json!(0), &json!(30)), json!(30));
    }
}
