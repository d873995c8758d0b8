//! Layer merge for settings
//!
//! - Tables: deep-merge by key
//! - Arrays and scalars: replace (last wins)
//! - `null` clears whatever the lower layer set
//!
//! A table meeting a non-null scalar (either way round) is a conflict and
//! is reported with its dotted key path.

use serde_json::{Map, Value};

use super::settings::SettingsOrigin;

/// A table and a scalar given for the same settings key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{key}` is a table in one layer and a value in another")]
pub struct MergeConflict {
    pub key: String,
}

/// Deep merge `overlay` onto `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Result<Value, MergeConflict> {
    merge_at(&mut Vec::new(), base, overlay)
}

fn merge_at(path: &mut Vec<String>, base: Value, overlay: Value) -> Result<Value, MergeConflict> {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            merge_tables(path, base_map, overlay_map).map(Value::Object)
        }
        (Value::Null, overlay) | (_, overlay @ Value::Null) => Ok(overlay),
        (Value::Object(_), _) | (_, Value::Object(_)) => Err(MergeConflict {
            key: path.join("."),
        }),
        (_, overlay) => Ok(overlay),
    }
}

fn merge_tables(
    path: &mut Vec<String>,
    mut base: Map<String, Value>,
    overlay: Map<String, Value>,
) -> Result<Map<String, Value>, MergeConflict> {
    for (key, overlay_value) in overlay {
        let merged = match base.remove(&key) {
            Some(base_value) => {
                path.push(key.clone());
                let merged = merge_at(path, base_value, overlay_value);
                path.pop();
                merged?
            }
            None => overlay_value,
        };
        base.insert(key, merged);
    }
    Ok(base)
}

/// Merge layers in order; the last layer has the highest precedence.
/// A conflict names the layer that introduced it.
pub fn merge_layers<I>(layers: I) -> Result<Value, (SettingsOrigin, MergeConflict)>
where
    I: IntoIterator<Item = (SettingsOrigin, Value)>,
{
    layers
        .into_iter()
        .try_fold(Value::Null, |acc, (origin, layer)| {
            deep_merge(acc, layer).map_err(|conflict| (origin, conflict))
        })
}
