//! Solver backends the worker can run.
//!
//! A backend reads `spec.json` from the run directory and writes whatever it
//! produces under `outputs/`. Anything it returns as an error becomes the
//! `failed` detail.

use serde_json::{json, Value};
use std::f64::consts::PI;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sunstone_core::atomic;
use sunstone_core::records::now;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unknown backend: {0}")]
    Unknown(String),

    #[error("failed to read {path}: {source}")]
    ReadSpec {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("spec.json is not valid JSON: {0}")]
    InvalidSpec(#[from] serde_json::Error),

    #[error("failed to write output {path}: {source}")]
    WriteOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Solver(String),
}

pub trait Backend {
    fn name(&self) -> &'static str;

    fn run(&self, run_dir: &Path) -> Result<(), BackendError>;
}

/// Backends compiled into this worker.
pub fn available_backends() -> &'static [&'static str] {
    &[DummyBackend::NAME]
}

/// Look up a backend by (case-insensitive) name.
pub fn backend_for(name: &str) -> Result<Box<dyn Backend>, BackendError> {
    match name.trim().to_ascii_lowercase().as_str() {
        DummyBackend::NAME => Ok(Box::new(DummyBackend)),
        other => Err(BackendError::Unknown(other.to_string())),
    }
}

/// Synthetic backend: a decaying sinusoid at every point monitor and a
/// power spectrum for the first one.
pub struct DummyBackend;

impl DummyBackend {
    pub const NAME: &'static str = "dummy";

    const SAMPLES: usize = 2000;
    const DURATION_S: f64 = 2e-12;
    const DECAY_S: f64 = 7e-13;
    const DEFAULT_FREQ_HZ: f64 = 3.75e14;
}

fn write_output(path: &Path, value: &Value) -> Result<(), BackendError> {
    atomic::write_json(path, value).map_err(|source| BackendError::WriteOutput {
        path: path.to_path_buf(),
        source,
    })
}

fn power_spectrum(signal: &[f64], dt: f64) -> (Vec<f64>, Vec<f64>) {
    let n = signal.len();
    let bins = n / 2 + 1;
    let mut freqs = Vec::with_capacity(bins);
    let mut power = Vec::with_capacity(bins);
    for k in 0..bins {
        let (mut re, mut im) = (0.0, 0.0);
        for (i, x) in signal.iter().enumerate() {
            let angle = -2.0 * PI * (k * i) as f64 / n as f64;
            re += x * angle.cos();
            im += x * angle.sin();
        }
        freqs.push(k as f64 / (n as f64 * dt));
        power.push(re * re + im * im);
    }
    (freqs, power)
}

impl Backend for DummyBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, run_dir: &Path) -> Result<(), BackendError> {
        let spec_path = run_dir.join("spec.json");
        let text = fs::read_to_string(&spec_path).map_err(|source| BackendError::ReadSpec {
            path: spec_path.clone(),
            source,
        })?;
        let spec: Value = serde_json::from_str(&text)?;

        let point_monitors: Vec<String> = spec
            .get("monitors")
            .and_then(Value::as_array)
            .map(|monitors| {
                monitors
                    .iter()
                    .filter(|m| m.get("type").and_then(Value::as_str) == Some("point"))
                    .map(|m| {
                        m.get("id")
                            .and_then(Value::as_str)
                            .unwrap_or("point")
                            .to_string()
                    })
                    .collect()
            })
            .unwrap_or_default();

        let freq = spec
            .get("sources")
            .and_then(Value::as_array)
            .and_then(|s| s.first())
            .and_then(|s| s.get("center_freq"))
            .and_then(Value::as_f64)
            .unwrap_or(Self::DEFAULT_FREQ_HZ);

        let dt = Self::DURATION_S / (Self::SAMPLES - 1) as f64;
        let t: Vec<f64> = (0..Self::SAMPLES).map(|i| i as f64 * dt).collect();
        let signal: Vec<f64> = t
            .iter()
            .map(|&t| (2.0 * PI * freq * t).sin() * (-t / Self::DECAY_S).exp())
            .collect();

        let outputs = run_dir.join("outputs");
        for id in &point_monitors {
            write_output(
                &outputs.join("monitors").join(format!("{id}.json")),
                &json!({ "t": t, "Ez": signal }),
            )?;
        }

        if let Some(first) = point_monitors.first() {
            let (freq_hz, power) = power_spectrum(&signal, dt);
            write_output(
                &outputs.join("spectra").join(format!("{first}.json")),
                &json!({ "freq_hz": freq_hz, "power": power }),
            )?;
        }

        write_output(
            &outputs.join("summary.json"),
            &json!({
                "backend": Self::NAME,
                "created_at": now(),
                "monitors": { "point": point_monitors },
                "notes": "Synthetic data from the dummy backend.",
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_is_an_error() {
        assert!(matches!(
            backend_for("fdtd-9000"),
            Err(BackendError::Unknown(_))
        ));
        assert_eq!(backend_for(" Dummy ").unwrap().name(), "dummy");
    }

    #[test]
    fn dummy_writes_summary_and_monitor_series() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("spec.json"),
            r#"{"monitors":[{"id":"m1","type":"point"},{"id":"plane","type":"plane"}]}"#,
        )
        .unwrap();

        DummyBackend.run(tmp.path()).unwrap();

        let summary: Value = serde_json::from_str(
            &fs::read_to_string(tmp.path().join("outputs/summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary["backend"], "dummy");
        assert_eq!(summary["monitors"]["point"], json!(["m1"]));
        assert!(tmp.path().join("outputs/monitors/m1.json").is_file());
        assert!(tmp.path().join("outputs/spectra/m1.json").is_file());
        assert!(!tmp.path().join("outputs/monitors/plane.json").exists());
    }

    #[test]
    fn missing_spec_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            DummyBackend.run(tmp.path()),
            Err(BackendError::ReadSpec { .. })
        ));
    }

    #[test]
    fn spectrum_peaks_at_signal_frequency() {
        let n = 64;
        let dt = 1.0 / n as f64;
        let signal: Vec<f64> = (0..n).map(|i| (2.0 * PI * 8.0 * i as f64 * dt).sin()).collect();
        let (freqs, power) = power_spectrum(&signal, dt);
        let peak = power
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert!((freqs[peak] - 8.0).abs() < 1e-9);
    }
}
