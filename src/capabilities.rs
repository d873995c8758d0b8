//! Backend capability catalog.
//!
//! Describes what each solver backend accepts: typed option schemas plus the
//! boundary, material and source type names a spec may use. The validator
//! only ever sees a [`CapabilityProvider`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::config::ConfigError;

/// Schema of one backend option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptionSchema {
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Enum {
        values: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Range {
        fields: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    File {
        #[serde(default)]
        accept: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Bool {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub supports_translation: bool,
    /// Option schemas keyed by option name.
    #[serde(rename = "capabilities", default)]
    pub options: BTreeMap<String, OptionSchema>,
    #[serde(default)]
    pub boundary_types: Vec<String>,
    #[serde(default)]
    pub material_models: Vec<String>,
    #[serde(default)]
    pub source_types: Vec<String>,
}

/// Short listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSummary {
    pub name: String,
    pub label: String,
}

pub trait CapabilityProvider: Send + Sync {
    /// Capabilities for `backend` (case-insensitive), if known.
    fn capabilities(&self, backend: &str) -> Option<BackendCapabilities>;

    fn backends(&self) -> Vec<BackendSummary>;
}

/// In-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: BTreeMap<String, BackendCapabilities>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn number(min: Option<f64>, max: Option<f64>, default: Option<f64>, label: &str) -> OptionSchema {
    OptionSchema::Number {
        min,
        max,
        default,
        label: Some(label.to_string()),
    }
}

fn choice(values: &[&str], default: &str, label: &str) -> OptionSchema {
    OptionSchema::Enum {
        values: strings(values),
        default: Some(default.to_string()),
        label: Some(label.to_string()),
    }
}

fn mesh_file() -> OptionSchema {
    OptionSchema::File {
        accept: strings(&[".msh", ".stl"]),
        label: Some("Precomputed mesh".to_string()),
    }
}

impl StaticCatalog {
    pub fn new(entries: impl IntoIterator<Item = BackendCapabilities>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|caps| (caps.name.to_ascii_lowercase(), caps))
                .collect(),
        }
    }

    /// Load a catalog from a JSON array of [`BackendCapabilities`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<BackendCapabilities> =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(Self::new(entries))
    }

    /// The backends Sunstone ships with.
    pub fn builtin() -> Self {
        let fdtd_boundaries = strings(&["pml", "periodic", "pec", "pmc", "bloch"]);
        let fdtd_sources = strings(&["gaussian_pulse", "continuous", "point", "plane_wave", "eigenmode"]);

        let dummy = BackendCapabilities {
            name: "dummy".to_string(),
            label: "Dummy".to_string(),
            supports_translation: false,
            options: BTreeMap::new(),
            boundary_types: fdtd_boundaries.clone(),
            material_models: strings(&["isotropic", "anisotropic", "drude", "lorentz", "debye", "tabulated"]),
            source_types: fdtd_sources.clone(),
        };

        let meep = BackendCapabilities {
            name: "meep".to_string(),
            label: "Meep (FDTD)".to_string(),
            supports_translation: false,
            options: BTreeMap::from([
                ("pml_thickness".to_string(), number(Some(0.0), Some(10.0), Some(0.0), "PML thickness")),
                ("max_time".to_string(), number(Some(0.0), None, Some(200.0), "Max time")),
            ]),
            boundary_types: fdtd_boundaries,
            material_models: strings(&["isotropic", "anisotropic", "drude", "lorentz", "debye"]),
            source_types: fdtd_sources,
        };

        let ceviche = BackendCapabilities {
            name: "ceviche".to_string(),
            label: "Ceviche (Spectral)".to_string(),
            supports_translation: true,
            options: BTreeMap::from([
                ("mode".to_string(), choice(&["scattering", "eigenmode"], "scattering", "Mode")),
                ("resolution".to_string(), number(Some(8.0), Some(500.0), Some(40.0), "Resolution")),
                ("wavelength_start".to_string(), number(Some(1e-9), Some(1e3), Some(0.4), "Wavelength start")),
                ("wavelength_stop".to_string(), number(Some(1e-9), Some(1e3), Some(0.8), "Wavelength stop")),
                ("wavelength_points".to_string(), number(Some(1.0), Some(1000.0), Some(10.0), "Wavelength points")),
            ]),
            boundary_types: strings(&["pml", "periodic"]),
            material_models: strings(&["isotropic"]),
            source_types: strings(&["continuous", "point", "plane_wave", "eigenmode"]),
        };

        let opal = BackendCapabilities {
            name: "opal".to_string(),
            label: "Opal (BEM)".to_string(),
            supports_translation: true,
            options: BTreeMap::from([
                ("mode".to_string(), choice(&["eigenmode", "scattering"], "scattering", "Mode")),
                ("mesh_target_size".to_string(), number(Some(1e-6), Some(1.0), Some(0.01), "Mesh target size")),
                ("solver_tolerance".to_string(), number(Some(1e-12), Some(1e-1), Some(1e-6), "Solver tolerance")),
                ("mesh_file".to_string(), mesh_file()),
            ]),
            boundary_types: strings(&["periodic", "pec"]),
            material_models: strings(&["isotropic", "drude", "lorentz", "tabulated"]),
            source_types: strings(&["plane_wave", "point"]),
        };

        let scuffem = BackendCapabilities {
            name: "scuffem".to_string(),
            label: "Scuff-EM".to_string(),
            supports_translation: true,
            options: BTreeMap::from([
                ("mesh_resolution".to_string(), number(Some(1.0), Some(100.0), Some(20.0), "Mesh resolution")),
                (
                    "frequency_sweep".to_string(),
                    OptionSchema::Range {
                        fields: strings(&["start", "stop", "points"]),
                        label: Some("Frequency sweep".to_string()),
                    },
                ),
                ("mesh_file".to_string(), mesh_file()),
            ]),
            boundary_types: strings(&["periodic"]),
            material_models: strings(&["isotropic", "drude", "lorentz", "tabulated"]),
            source_types: strings(&["plane_wave", "point"]),
        };

        let pygdm = BackendCapabilities {
            name: "pygdm".to_string(),
            label: "pyGDM".to_string(),
            supports_translation: true,
            options: BTreeMap::from([
                (
                    "particle_discretization".to_string(),
                    number(Some(1.0), Some(1000.0), Some(10.0), "Particle discretization"),
                ),
                (
                    "incident_polarization".to_string(),
                    choice(&["x", "y", "z"], "x", "Incident polarization"),
                ),
            ]),
            boundary_types: Vec::new(),
            material_models: strings(&["isotropic", "tabulated"]),
            source_types: strings(&["plane_wave", "point"]),
        };

        Self::new([dummy, meep, ceviche, opal, scuffem, pygdm])
    }
}

impl CapabilityProvider for StaticCatalog {
    fn capabilities(&self, backend: &str) -> Option<BackendCapabilities> {
        self.entries
            .get(&backend.trim().to_ascii_lowercase())
            .cloned()
    }

    fn backends(&self) -> Vec<BackendSummary> {
        self.entries
            .values()
            .map(|caps| BackendSummary {
                name: caps.name.clone(),
                label: caps.label.clone(),
            })
            .collect()
    }
}
