//! Host probes shared by the resource monitor and the environment snapshot.

use std::fs;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::records::GpuSample;

/// Memory totals in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total: Option<u64>,
    pub available: Option<u64>,
}

/// Parse `/proc/meminfo` content. Values there are in kB.
pub fn parse_meminfo(text: &str) -> MemInfo {
    let mut info = MemInfo::default();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|kb| kb * 1024);
        match key {
            "MemTotal" => info.total = value,
            "MemAvailable" => info.available = value,
            _ => {}
        }
    }
    info
}

pub fn read_meminfo() -> MemInfo {
    fs::read_to_string("/proc/meminfo")
        .map(|text| parse_meminfo(&text))
        .unwrap_or_default()
}

pub const NVIDIA_SMI_QUERY: &str = "--query-gpu=index,name,utilization.gpu,memory.total,memory.used";

fn parse_number(field: &str) -> Option<f64> {
    field.trim().parse::<f64>().ok()
}

/// Parse `nvidia-smi --format=csv,noheader,nounits` output.
pub fn parse_nvidia_smi(text: &str) -> Vec<GpuSample> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 5 {
                return None;
            }
            Some(GpuSample {
                index: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                load_percent: parse_number(fields[2]),
                memory_total_mb: parse_number(fields[3]),
                memory_used_mb: parse_number(fields[4]),
            })
        })
        .collect()
}

/// Query NVIDIA GPUs. Hosts without `nvidia-smi` report none.
pub fn query_gpus() -> Vec<GpuSample> {
    let output = Command::new("nvidia-smi")
        .arg(NVIDIA_SMI_QUERY)
        .arg("--format=csv,noheader,nounits")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(out) if out.status.success() => parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            debug!(status = ?out.status.code(), "nvidia-smi exited unsuccessfully");
            Vec::new()
        }
        Err(e) => {
            debug!(error = %e, "nvidia-smi unavailable");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_converts_kb() {
        let text = "MemTotal:       16384 kB\nMemFree:         1024 kB\nMemAvailable:    8192 kB\n";
        let info = parse_meminfo(text);
        assert_eq!(info.total, Some(16384 * 1024));
        assert_eq!(info.available, Some(8192 * 1024));
    }

    #[test]
    fn nvidia_smi_rows() {
        let text = "0, NVIDIA A100-SXM4-40GB, 37, 40960, 1200\n1, NVIDIA A100-SXM4-40GB, [N/A], 40960, 0\n";
        let gpus = parse_nvidia_smi(text);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].load_percent, Some(37.0));
        assert_eq!(gpus[1].index, 1);
        assert_eq!(gpus[1].load_percent, None);
    }

    #[test]
    fn nvidia_smi_skips_short_rows() {
        assert!(parse_nvidia_smi("garbage\n\n").is_empty());
    }
}
