//! Parsers for the Linux `/proc` files the sampler reads.
//!
//! Kept free of I/O so they can be tested against captured text.

/// Jiffy counters for one `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTicks {
    /// idle + iowait
    pub idle: u64,
    pub total: u64,
}

impl CpuTicks {
    /// Busy percentage between two readings, `None` if no time passed.
    pub fn busy_percent_since(&self, prev: &CpuTicks) -> Option<f64> {
        let total = self.total.checked_sub(prev.total)?;
        if total == 0 {
            return None;
        }
        let idle = self.idle.saturating_sub(prev.idle).min(total);
        Some((1.0 - idle as f64 / total as f64) * 100.0)
    }
}

/// `/proc/stat` cpu lines: the aggregate first, then one entry per core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuStat {
    pub aggregate: CpuTicks,
    pub cores: Vec<CpuTicks>,
}

pub fn parse_cpu_stat(text: &str) -> Option<CpuStat> {
    let mut aggregate = None;
    let mut cores = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else {
            continue;
        };
        if !label.starts_with("cpu") {
            continue;
        }
        let values: Vec<u64> = fields.filter_map(|v| v.parse().ok()).collect();
        if values.len() < 4 {
            continue;
        }
        // user nice system idle iowait irq softirq steal [guest guest_nice]
        // guest time is already counted in user.
        let counted = &values[..values.len().min(8)];
        let ticks = CpuTicks {
            idle: values[3] + values.get(4).copied().unwrap_or(0),
            total: counted.iter().sum(),
        };
        if label == "cpu" {
            aggregate = Some(ticks);
        } else {
            cores.push(ticks);
        }
    }
    aggregate.map(|aggregate| CpuStat { aggregate, cores })
}

/// Fields of `/proc/<pid>/stat` the sampler needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    pub ppid: u32,
    /// utime + stime, in clock ticks
    pub cpu_ticks: u64,
}

/// Parse `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
pub fn parse_proc_stat(text: &str) -> Option<ProcStat> {
    let rest = &text[text.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 13 {
        return None;
    }
    let utime: u64 = fields[11].parse().ok()?;
    let stime: u64 = fields[12].parse().ok()?;
    Some(ProcStat {
        state: fields[0].chars().next()?,
        ppid: fields[1].parse().ok()?,
        cpu_ticks: utime + stime,
    })
}

/// First numeric value of a `Key:` line in `/proc/<pid>/status`.
pub fn status_value(text: &str, key: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let (k, rest) = line.split_once(':')?;
        if k != key {
            return None;
        }
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// Sum of (sectors read, sectors written) × 512 over devices accepted by
/// `is_disk`.
pub fn parse_diskstats(text: &str, is_disk: impl Fn(&str) -> bool) -> (u64, u64) {
    const SECTOR: u64 = 512;
    let mut read = 0u64;
    let mut written = 0u64;
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || !is_disk(fields[2]) {
            continue;
        }
        read += fields[5].parse::<u64>().unwrap_or(0) * SECTOR;
        written += fields[9].parse::<u64>().unwrap_or(0) * SECTOR;
    }
    (read, written)
}

/// (bytes received, bytes sent) summed over non-loopback interfaces.
pub fn parse_net_dev(text: &str) -> (u64, u64) {
    let mut recv = 0u64;
    let mut sent = 0u64;
    for line in text.lines() {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() < 9 {
            continue;
        }
        recv += fields[0];
        sent += fields[8];
    }
    (recv, sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_A: &str = "cpu  100 0 100 700 100 0 0 0 0 0\n\
cpu0 50 0 50 350 50 0 0 0 0 0\n\
cpu1 50 0 50 350 50 0 0 0 0 0\n\
intr 12345\n";
    const STAT_B: &str = "cpu  200 0 200 1300 300 0 0 0 0 0\n\
cpu0 150 0 150 650 50 0 0 0 0 0\n\
cpu1 50 0 50 650 250 0 0 0 0 0\n";

    #[test]
    fn cpu_stat_counts_iowait_as_idle() {
        let a = parse_cpu_stat(STAT_A).unwrap();
        let b = parse_cpu_stat(STAT_B).unwrap();
        assert_eq!(a.cores.len(), 2);
        // delta total 1000, delta idle 800
        let busy = b.aggregate.busy_percent_since(&a.aggregate).unwrap();
        assert!((busy - 20.0).abs() < 1e-9);
        let core0 = b.cores[0].busy_percent_since(&a.cores[0]).unwrap();
        assert!((core0 - 40.0).abs() < 1e-9);
        let core1 = b.cores[1].busy_percent_since(&a.cores[1]).unwrap();
        assert!(core1.abs() < 1e-9);
    }

    #[test]
    fn no_elapsed_time_is_none() {
        let a = parse_cpu_stat(STAT_A).unwrap();
        assert_eq!(a.aggregate.busy_percent_since(&a.aggregate), None);
    }

    #[test]
    fn proc_stat_with_spaces_in_name() {
        let text = "4242 (sunstone (worker) x) S 4200 4242 4242 0 -1 4194304 100 0 0 0 120 30 0 0 20 0 3 0 100 0 0";
        let stat = parse_proc_stat(text).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.ppid, 4200);
        assert_eq!(stat.cpu_ticks, 150);
    }

    #[test]
    fn status_values() {
        let text = "Name:\tsunstone-worker\nThreads:\t7\nVmRSS:\t  20480 kB\n";
        assert_eq!(status_value(text, "Threads"), Some(7));
        assert_eq!(status_value(text, "VmRSS"), Some(20480));
        assert_eq!(status_value(text, "VmSwap"), None);
    }

    #[test]
    fn diskstats_whole_disks_only() {
        let text = "   8       0 sda 100 0 2000 0 50 0 4000 0 0 0 0\n\
   8       1 sda1 90 0 1800 0 40 0 3000 0 0 0 0\n";
        let (read, written) = parse_diskstats(text, |name| name == "sda");
        assert_eq!(read, 2000 * 512);
        assert_eq!(written, 4000 * 512);
    }

    #[test]
    fn net_dev_skips_loopback() {
        let text = "Inter-|   Receive |  Transmit\n\
 face |bytes packets errs drop fifo frame compressed multicast|bytes packets\n\
    lo: 5000 10 0 0 0 0 0 0 5000 10 0 0 0 0 0 0\n\
  eth0: 1200 8 0 0 0 0 0 0 3400 9 0 0 0 0 0 0\n";
        assert_eq!(parse_net_dev(text), (1200, 3400));
    }
}
