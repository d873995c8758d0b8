//! Background resource monitor.
//!
//! One thread per worker process. Each tick takes a [`ResourceSample`],
//! appends it to a bounded window and rewrites `runtime/resource.json`
//! atomically. Nothing in the loop propagates errors: the first failure of a
//! streak is logged as a warning, the rest at debug, and the next tick
//! proceeds.
//!
//! Sampling reads `/proc`, so [`ProcSampler`] only exists on Linux.
//! [`host_sampler`] returns `None` elsewhere.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sunstone_core::records::ResourceSample;
use sunstone_core::RunDir;
use tracing::{debug, info, warn};

#[cfg(target_os = "linux")]
pub use self::linux::ProcSampler;

pub const DEFAULT_WINDOW: usize = 200;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

const STOP_POLL: Duration = Duration::from_millis(25);

/// Source of resource samples.
pub trait Sampler {
    fn sample(&mut self) -> io::Result<ResourceSample>;
}

impl<S: Sampler + ?Sized> Sampler for Box<S> {
    fn sample(&mut self) -> io::Result<ResourceSample> {
        (**self).sample()
    }
}

/// Sampler for this process and its descendants, if the platform has one.
#[cfg(target_os = "linux")]
pub fn host_sampler() -> Option<Box<dyn Sampler + Send>> {
    Some(Box::new(ProcSampler::for_current_process()))
}

#[cfg(not(target_os = "linux"))]
pub fn host_sampler() -> Option<Box<dyn Sampler + Send>> {
    None
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Handle to a running monitor thread. Dropping it stops the thread.
pub struct ResourceMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ResourceMonitor {
    pub fn start<S>(run_dir: RunDir, sampler: S, config: MonitorConfig) -> io::Result<Self>
    where
        S: Sampler + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("resource-monitor".to_string())
            .spawn(move || monitor_loop(run_dir, sampler, config, flag))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the loop to end and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("resource monitor thread panicked");
            }
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn monitor_loop<S: Sampler>(
    run_dir: RunDir,
    mut sampler: S,
    config: MonitorConfig,
    stop: Arc<AtomicBool>,
) {
    let capacity = config.window.max(1);
    let mut window: VecDeque<ResourceSample> = VecDeque::with_capacity(capacity);
    let mut failures = FailureStreak::default();
    while !stop.load(Ordering::SeqCst) {
        match sampler.sample() {
            Ok(sample) => {
                failures.recovered();
                push_bounded(&mut window, sample, capacity);
                if let Err(e) = run_dir.write_resource_window(window.make_contiguous()) {
                    warn!(error = %e, "failed to write resource window");
                }
            }
            Err(e) => {
                failures.failed(&e);
            }
        }
        sleep_unless_stopped(config.interval, &stop);
    }
    debug!(samples = window.len(), "resource monitor stopped");
}

/// Consecutive sampler failures.
#[derive(Debug, Default)]
struct FailureStreak {
    count: u64,
}

impl FailureStreak {
    /// Returns true when this failure started a new streak.
    fn failed(&mut self, err: &io::Error) -> bool {
        self.count += 1;
        if self.count == 1 {
            warn!(error = %err, "resource sample failed");
            true
        } else {
            debug!(error = %err, streak = self.count, "resource sample failed");
            false
        }
    }

    fn recovered(&mut self) {
        if self.count > 0 {
            info!(failed_ticks = self.count, "resource sampling recovered");
            self.count = 0;
        }
    }
}

/// Append `sample`, dropping the oldest entries beyond `capacity`.
pub fn push_bounded(window: &mut VecDeque<ResourceSample>, sample: ResourceSample, capacity: usize) {
    window.push_back(sample);
    while window.len() > capacity {
        window.pop_front();
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let mut remaining = total;
    while !remaining.is_zero() && !stop.load(Ordering::SeqCst) {
        let step = remaining.min(STOP_POLL);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashMap;
    use std::fs;
    use std::io;
    use std::path::PathBuf;

    use sunstone_core::host;
    use sunstone_core::records::{now, ResourceSample};

    use super::Sampler;
    use crate::procfs::{self, CpuStat};

    /// Samples the host and the process tree rooted at `root_pid` from `/proc`.
    pub struct ProcSampler {
        root_pid: u32,
        proc_root: PathBuf,
        sys_block: PathBuf,
        query_gpus: bool,
        prev_cpu: Option<CpuStat>,
        prev_proc_ticks: Option<u64>,
    }

    impl ProcSampler {
        /// Sampler for this process and its descendants.
        pub fn for_current_process() -> Self {
            Self::new(std::process::id())
        }

        pub fn new(root_pid: u32) -> Self {
            Self {
                root_pid,
                proc_root: PathBuf::from("/proc"),
                sys_block: PathBuf::from("/sys/block"),
                query_gpus: true,
                prev_cpu: None,
                prev_proc_ticks: None,
            }
        }

        pub fn without_gpus(mut self) -> Self {
            self.query_gpus = false;
            self
        }

        fn read(&self, name: &str) -> Option<String> {
            fs::read_to_string(self.proc_root.join(name)).ok()
        }

        /// Pids of the root process and all of its descendants.
        fn process_tree(&self) -> Vec<(u32, procfs::ProcStat)> {
            let mut stats: HashMap<u32, procfs::ProcStat> = HashMap::new();
            let Ok(entries) = fs::read_dir(&self.proc_root) else {
                return Vec::new();
            };
            for entry in entries.flatten() {
                let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                    continue;
                };
                let Ok(text) = fs::read_to_string(entry.path().join("stat")) else {
                    continue;
                };
                if let Some(stat) = procfs::parse_proc_stat(&text) {
                    stats.insert(pid, stat);
                }
            }

            let mut tree = Vec::new();
            let mut queue = vec![self.root_pid];
            while let Some(pid) = queue.pop() {
                let Some(stat) = stats.get(&pid) else {
                    continue;
                };
                if stat.state != 'Z' {
                    tree.push((pid, *stat));
                }
                queue.extend(
                    stats
                        .iter()
                        .filter(|(_, s)| s.ppid == pid)
                        .map(|(child, _)| *child),
                );
            }
            tree
        }

        fn sample_processes(&mut self, sample: &mut ResourceSample, cpu: Option<&CpuStat>) {
            let tree = self.process_tree();
            if tree.is_empty() {
                return;
            }
            let mut ticks = 0u64;
            let mut rss = 0u64;
            let mut threads = 0u64;
            let mut open_files = 0u64;
            for (pid, stat) in &tree {
                ticks += stat.cpu_ticks;
                let pid_dir = self.proc_root.join(pid.to_string());
                if let Ok(status) = fs::read_to_string(pid_dir.join("status")) {
                    rss += procfs::status_value(&status, "VmRSS").unwrap_or(0) * 1024;
                    threads += procfs::status_value(&status, "Threads").unwrap_or(0);
                }
                if let Ok(fds) = fs::read_dir(pid_dir.join("fd")) {
                    open_files += fds.count() as u64;
                }
            }
            sample.proc_memory_rss = Some(rss);
            sample.threads = Some(threads);
            sample.open_files = Some(open_files);

            // Process CPU is relative to one core, like `top`.
            if let (Some(prev_ticks), Some(prev_cpu), Some(cpu)) =
                (self.prev_proc_ticks, self.prev_cpu.as_ref(), cpu)
            {
                let cores = cpu.cores.len().max(1) as f64;
                let elapsed = cpu.aggregate.total.saturating_sub(prev_cpu.aggregate.total) as f64 / cores;
                if elapsed > 0.0 {
                    sample.proc_cpu_percent =
                        Some(ticks.saturating_sub(prev_ticks) as f64 / elapsed * 100.0);
                }
            }
            self.prev_proc_ticks = Some(ticks);
        }
    }

    impl Sampler for ProcSampler {
        fn sample(&mut self) -> io::Result<ResourceSample> {
            let stat_text = fs::read_to_string(self.proc_root.join("stat"))?;
            let cpu = procfs::parse_cpu_stat(&stat_text);

            let mut sample = ResourceSample::empty();
            sample.timestamp = now();

            if let (Some(prev), Some(cur)) = (self.prev_cpu.as_ref(), cpu.as_ref()) {
                sample.cpu_system_percent = cur.aggregate.busy_percent_since(&prev.aggregate);
                sample.cpu_per_core = cur
                    .cores
                    .iter()
                    .zip(&prev.cores)
                    .map(|(c, p)| c.busy_percent_since(p).unwrap_or(0.0))
                    .collect();
            }

            self.sample_processes(&mut sample, cpu.as_ref());
            self.prev_cpu = cpu;

            if let Some(text) = self.read("meminfo") {
                let mem = host::parse_meminfo(&text);
                sample.memory_total = mem.total;
                sample.memory_available = mem.available;
            }
            if let Some(text) = self.read("diskstats") {
                let sys_block = self.sys_block.clone();
                let (read, written) =
                    procfs::parse_diskstats(&text, |name| sys_block.join(name).exists());
                sample.disk_read_bytes = Some(read);
                sample.disk_write_bytes = Some(written);
            }
            if let Some(text) = self.read("net/dev") {
                let (recv, sent) = procfs::parse_net_dev(&text);
                sample.net_bytes_recv = Some(recv);
                sample.net_bytes_sent = Some(sent);
            }
            if self.query_gpus {
                sample.gpus = host::query_gpus();
            }
            Ok(sample)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct CountingSampler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Sampler for CountingSampler {
        fn sample(&mut self) -> io::Result<ResourceSample> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "no /proc here"));
            }
            Ok(ResourceSample::empty())
        }
    }

    fn run_dir() -> (tempfile::TempDir, RunDir) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = RunDir::new(tmp.path());
        dir.create_skeleton().unwrap();
        (tmp, dir)
    }

    fn wait_for_calls(calls: &AtomicUsize, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn push_bounded_keeps_most_recent() {
        let mut window = VecDeque::new();
        for i in 0..10u64 {
            let mut s = ResourceSample::empty();
            s.threads = Some(i);
            push_bounded(&mut window, s, 3);
        }
        let threads: Vec<_> = window.iter().map(|s| s.threads.unwrap()).collect();
        assert_eq!(threads, vec![7, 8, 9]);
    }

    #[test]
    fn window_on_disk_never_exceeds_bound() {
        let (_tmp, dir) = run_dir();
        let calls = Arc::new(AtomicUsize::new(0));
        let monitor = ResourceMonitor::start(
            dir.clone(),
            CountingSampler {
                calls: Arc::clone(&calls),
                fail: false,
            },
            MonitorConfig {
                interval: Duration::from_millis(1),
                window: 3,
            },
        )
        .unwrap();
        wait_for_calls(&calls, 8);
        monitor.stop();

        let window = dir.read_resource_window();
        assert!(calls.load(Ordering::SeqCst) >= 8);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn sampler_errors_do_not_stop_the_loop() {
        let (_tmp, dir) = run_dir();
        let calls = Arc::new(AtomicUsize::new(0));
        let monitor = ResourceMonitor::start(
            dir.clone(),
            CountingSampler {
                calls: Arc::clone(&calls),
                fail: true,
            },
            MonitorConfig {
                interval: Duration::from_millis(1),
                window: 5,
            },
        )
        .unwrap();
        wait_for_calls(&calls, 3);
        drop(monitor);

        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert!(dir.read_resource_window().is_empty());
    }

    #[test]
    fn failure_streak_warns_once_per_streak() {
        let err = || io::Error::new(io::ErrorKind::Unsupported, "no /proc here");
        let mut streak = FailureStreak::default();
        assert!(streak.failed(&err()));
        assert!(!streak.failed(&err()));
        assert!(!streak.failed(&err()));
        streak.recovered();
        assert!(streak.failed(&err()));
    }

    #[test]
    fn host_sampler_matches_platform() {
        assert_eq!(host_sampler().is_some(), cfg!(target_os = "linux"));
    }

    #[test]
    fn boxed_sampler_drives_the_monitor() {
        let (_tmp, dir) = run_dir();
        let calls = Arc::new(AtomicUsize::new(0));
        let sampler: Box<dyn Sampler + Send> = Box::new(CountingSampler {
            calls: Arc::clone(&calls),
            fail: false,
        });
        let monitor = ResourceMonitor::start(
            dir.clone(),
            sampler,
            MonitorConfig {
                interval: Duration::from_millis(1),
                window: 2,
            },
        )
        .unwrap();
        wait_for_calls(&calls, 3);
        monitor.stop();
        assert_eq!(dir.read_resource_window().len(), 2);
    }
}
