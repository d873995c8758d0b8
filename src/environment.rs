//! One-shot host description written to `runtime/environment.json` at
//! submit time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::process::{Command, Stdio};
use std::thread;

use sunstone_core::host;
use sunstone_core::records::now;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub logical_cores: usize,
    pub ram_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub vendor: String,
    pub name: Option<String>,
    pub vram_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub detected_at: DateTime<Utc>,
    pub os: String,
    pub arch: String,
    pub kernel: Option<String>,
    pub hostname: Option<String>,
    pub is_wsl: bool,
    pub cpu: CpuInfo,
    pub gpu: Option<GpuInfo>,
}

fn read_trimmed(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Vendor guess from an `lspci` display-controller line.
pub fn classify_pci_vendor(line: &str) -> &'static str {
    let lower = line.to_ascii_lowercase();
    if lower.contains("nvidia") {
        "nvidia"
    } else if lower.contains("amd") || lower.contains("radeon") {
        "amd"
    } else if lower.contains("intel") {
        "intel"
    } else {
        "unknown"
    }
}

fn pci_display_controller() -> Option<GpuInfo> {
    let output = Command::new("lspci")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let line = text.lines().find(|l| {
        let lower = l.to_ascii_lowercase();
        lower.contains("vga") || lower.contains("3d") || lower.contains("display")
    })?;
    Some(GpuInfo {
        vendor: classify_pci_vendor(line).to_string(),
        name: Some(line.trim().to_string()),
        vram_bytes: None,
    })
}

fn detect_gpu() -> Option<GpuInfo> {
    if let Some(gpu) = host::query_gpus().into_iter().next() {
        return Some(GpuInfo {
            vendor: "nvidia".to_string(),
            name: Some(gpu.name),
            vram_bytes: gpu.memory_total_mb.map(|mb| (mb * 1024.0 * 1024.0) as u64),
        });
    }
    pci_display_controller()
}

impl EnvironmentSnapshot {
    pub fn detect() -> Self {
        let kernel = read_trimmed("/proc/sys/kernel/osrelease");
        let is_wsl = env::var_os("WSL_DISTRO_NAME").is_some()
            || kernel
                .as_deref()
                .is_some_and(|k| k.to_ascii_lowercase().contains("microsoft"));
        Self {
            detected_at: now(),
            os: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            kernel,
            hostname: read_trimmed("/proc/sys/kernel/hostname"),
            is_wsl,
            cpu: CpuInfo {
                logical_cores: thread::available_parallelism().map_or(1, |n| n.get()),
                ram_bytes: host::read_meminfo().total,
            },
            gpu: detect_gpu(),
        }
    }
}
