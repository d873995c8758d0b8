//! Submission validation
//!
//! Checks a run spec and backend options against the target backend's
//! capabilities before anything is launched. Validation is all-or-nothing:
//! the first violation rejects the whole submission and nothing is written.

mod materials;

pub use materials::{normalize_materials, resolved_model};

use serde_json::{Map, Value};

use crate::capabilities::{BackendCapabilities, OptionSchema};

pub const FACES: [&str; 6] = ["px", "nx", "py", "ny", "pz", "nz"];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("boundary_conditions must be an object or a list")]
    BoundaryShape,

    #[error("{field} must be an object with a \"type\"")]
    MissingType { field: String },

    #[error("Boundary type \"{value}\" not supported by backend {backend}")]
    UnsupportedBoundary { value: String, backend: String },

    #[error("boundary_conditions[{index}].face must be one of px,nx,py,ny,pz,nz")]
    InvalidFace { index: usize },

    #[error("materials must be an object or a list")]
    MaterialsShape,

    #[error("materials[\"{name}\"] must be an object")]
    MaterialEntry { name: String },

    #[error("Material \"{name}\" type \"{model}\" not supported by backend {backend}")]
    UnsupportedMaterial {
        name: String,
        model: String,
        backend: String,
    },

    #[error("sources must be a list")]
    SourcesShape,

    #[error("Source type \"{value}\" not supported by backend {backend}")]
    UnsupportedSource { value: String, backend: String },

    #[error("Unknown backend option: {0}")]
    UnknownOption(String),

    #[error("Option {key} {reason}")]
    InvalidOption { key: String, reason: String },
}

/// Result of a successful validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSubmission {
    /// The run spec with `materials` normalized to a mapping.
    pub spec: Value,
    /// Whether normalization changed the run spec.
    pub spec_changed: bool,
}

fn type_name(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn allows(list: &[String], value: &Value) -> bool {
    value.as_str().map_or(false, |v| list.iter().any(|a| a == v))
}

/// Validate `spec` and `options` for the backend described by `caps`.
pub fn validate_submission(
    caps: &BackendCapabilities,
    spec: &Value,
    options: Option<&Map<String, Value>>,
) -> Result<ValidatedSubmission, ValidationError> {
    let mut spec_out = spec.clone();

    if let Some(bcs) = spec.get("boundary_conditions") {
        validate_boundaries(caps, bcs)?;
    }

    if let Some(materials) = spec.get("materials") {
        let normalized = validate_materials(caps, materials)?;
        if let Value::Object(root) = &mut spec_out {
            root.insert("materials".to_string(), Value::Object(normalized));
        }
    }

    if let Some(sources) = spec.get("sources") {
        validate_sources(caps, sources)?;
    }

    if let Some(options) = options {
        validate_options(caps, options)?;
    }

    let spec_changed = &spec_out != spec;
    Ok(ValidatedSubmission {
        spec: spec_out,
        spec_changed,
    })
}

fn validate_boundaries(caps: &BackendCapabilities, bcs: &Value) -> Result<(), ValidationError> {
    let check_type = |bc_type: &Value| {
        if allows(&caps.boundary_types, bc_type) {
            Ok(())
        } else {
            Err(ValidationError::UnsupportedBoundary {
                value: type_name(bc_type),
                backend: caps.name.clone(),
            })
        }
    };

    match bcs {
        Value::Object(bc) => {
            let bc_type = bc.get("type").ok_or_else(|| ValidationError::MissingType {
                field: "boundary_conditions object".to_string(),
            })?;
            check_type(bc_type)
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                let bc_type = item
                    .as_object()
                    .and_then(|bc| bc.get("type"))
                    .ok_or_else(|| ValidationError::MissingType {
                        field: format!("boundary_conditions[{index}]"),
                    })?;
                check_type(bc_type)?;
                if let Some(face) = item.get("face") {
                    if !face.as_str().map_or(false, |f| FACES.contains(&f)) {
                        return Err(ValidationError::InvalidFace { index });
                    }
                }
            }
            Ok(())
        }
        _ => Err(ValidationError::BoundaryShape),
    }
}

fn validate_materials(
    caps: &BackendCapabilities,
    materials: &Value,
) -> Result<Map<String, Value>, ValidationError> {
    let normalized = normalize_materials(materials)?;
    for (name, entry) in &normalized {
        let Value::Object(entry) = entry else {
            return Err(ValidationError::MaterialEntry { name: name.clone() });
        };
        let model = resolved_model(entry);
        if !caps.material_models.iter().any(|m| *m == model) {
            return Err(ValidationError::UnsupportedMaterial {
                name: name.clone(),
                model,
                backend: caps.name.clone(),
            });
        }
    }
    Ok(normalized)
}

fn validate_sources(caps: &BackendCapabilities, sources: &Value) -> Result<(), ValidationError> {
    let Value::Array(items) = sources else {
        return Err(ValidationError::SourcesShape);
    };
    for (index, item) in items.iter().enumerate() {
        let src_type = item
            .as_object()
            .and_then(|s| s.get("type"))
            .ok_or_else(|| ValidationError::MissingType {
                field: format!("sources[{index}]"),
            })?;
        if !allows(&caps.source_types, src_type) {
            return Err(ValidationError::UnsupportedSource {
                value: type_name(src_type),
                backend: caps.name.clone(),
            });
        }
    }
    Ok(())
}

fn validate_options(
    caps: &BackendCapabilities,
    options: &Map<String, Value>,
) -> Result<(), ValidationError> {
    for (key, value) in options {
        let schema = caps
            .options
            .get(key)
            .ok_or_else(|| ValidationError::UnknownOption(key.clone()))?;
        let invalid = |reason: String| ValidationError::InvalidOption {
            key: key.clone(),
            reason,
        };
        match schema {
            OptionSchema::Number { min, max, .. } => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| invalid("must be numeric".to_string()))?;
                if let Some(min) = min {
                    if n < *min {
                        return Err(invalid(format!("must be >= {min}")));
                    }
                }
                if let Some(max) = max {
                    if n > *max {
                        return Err(invalid(format!("must be <= {max}")));
                    }
                }
            }
            OptionSchema::Enum { values, .. } => {
                if !allows(values, value) {
                    return Err(invalid(format!("must be one of {values:?}")));
                }
            }
            OptionSchema::Range { fields, .. } => {
                let complete = value
                    .as_object()
                    .map_or(false, |obj| fields.iter().all(|f| obj.contains_key(f)));
                if !complete {
                    return Err(invalid(format!(
                        "must be an object with fields {fields:?}"
                    )));
                }
            }
            OptionSchema::File { .. } | OptionSchema::String { .. } => {
                if !value.is_string() {
                    return Err(invalid("must be a string".to_string()));
                }
            }
            OptionSchema::Bool { .. } => {
                if !value.is_boolean() {
                    return Err(invalid("must be true or false".to_string()));
                }
            }
        }
    }
    Ok(())
}
