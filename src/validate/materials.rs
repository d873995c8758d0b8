//! Material list/mapping normalization.

use serde_json::{Map, Value};

use super::ValidationError;

/// Normalize `materials` to a name-keyed mapping.
///
/// Lists are keyed by `name`, falling back to `id` when the name is missing
/// or blank. Keys are trimmed; entries that are not objects or carry no key
/// are dropped. Within each entry `type` is copied
/// to `model` and `epsilon` to `eps` when the canonical key is absent.
/// Values are never coerced.
pub fn normalize_materials(materials: &Value) -> Result<Map<String, Value>, ValidationError> {
    let mut out = Map::new();
    match materials {
        Value::Array(items) => {
            for item in items {
                let Value::Object(entry) = item else {
                    continue;
                };
                let name = entry
                    .get("name")
                    .and_then(key_string)
                    .or_else(|| entry.get("id").and_then(key_string));
                let Some(name) = name else {
                    continue;
                };
                out.insert(name, Value::Object(with_canonical_keys(entry)));
            }
        }
        Value::Object(map) => {
            for (name, entry) in map {
                let normalized = match entry {
                    Value::Object(entry) => Value::Object(with_canonical_keys(entry)),
                    other => other.clone(),
                };
                out.insert(name.clone(), normalized);
            }
        }
        _ => return Err(ValidationError::MaterialsShape),
    }
    Ok(out)
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn with_canonical_keys(entry: &Map<String, Value>) -> Map<String, Value> {
    let mut entry = entry.clone();
    for (alias, canonical) in [("type", "model"), ("epsilon", "eps")] {
        if !entry.contains_key(canonical) {
            if let Some(value) = entry.get(alias).cloned() {
                entry.insert(canonical.to_string(), value);
            }
        }
    }
    entry
}

/// Material model after alias resolution. Constant-permittivity spellings
/// all mean `isotropic`.
pub fn resolved_model(entry: &Map<String, Value>) -> String {
    let raw = ["model", "type"]
        .iter()
        .filter_map(|k| entry.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Null | Value::Bool(false) => None,
            Value::String(_) => None,
            other => Some(other.to_string()),
        })
        .unwrap_or_default()
        .to_lowercase();
    match raw.as_str() {
        "" | "constant" | "isotropic" => "isotropic".to_string(),
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_keyed_by_name_then_id() {
        let materials = json!([
            {"name": "Si", "epsilon": 11.7},
            {"id": "gold", "type": "drude"},
            {"eps": 2.0},
            "not an object"
        ]);
        let map = normalize_materials(&materials).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["Si"]["eps"], 11.7);
        assert_eq!(map["Si"]["epsilon"], 11.7);
        assert_eq!(map["gold"]["model"], "drude");
    }

    #[test]
    fn blank_name_falls_back_to_id_and_keys_are_trimmed() {
        let materials = json!([
            {"name": "", "id": "gold", "type": "drude"},
            {"name": null, "id": " silver ", "type": "drude"},
            {"name": " Si ", "eps": 2.0},
            {"name": "   "}
        ]);
        let map = normalize_materials(&materials).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map["gold"]["model"], "drude");
        assert_eq!(map["silver"]["model"], "drude");
        assert_eq!(map["Si"]["eps"], 2.0);
        assert!(!map.contains_key(" Si "));
    }

    #[test]
    fn canonical_keys_win() {
        let materials = json!({"glass": {"model": "lorentz", "type": "constant", "eps": 2.25, "epsilon": 9}});
        let map = normalize_materials(&materials).unwrap();
        assert_eq!(map["glass"]["model"], "lorentz");
        assert_eq!(map["glass"]["eps"], 2.25);
    }

    #[test]
    fn scalar_materials_rejected() {
        assert!(matches!(
            normalize_materials(&json!("Si")),
            Err(ValidationError::MaterialsShape)
        ));
    }

    #[test]
    fn model_resolution() {
        let entry = |v: Value| v.as_object().unwrap().clone();
        assert_eq!(resolved_model(&entry(json!({}))), "isotropic");
        assert_eq!(resolved_model(&entry(json!({"type": "Constant"}))), "isotropic");
        assert_eq!(resolved_model(&entry(json!({"model": "Drude"}))), "drude");
        assert_eq!(resolved_model(&entry(json!({"model": "", "type": "debye"}))), "debye");
    }
}
