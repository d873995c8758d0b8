//! Status and log streaming
//!
//! Everything here reads the run directory fresh on every call; a reader may
//! see state one write behind and is expected to poll again.

mod tail;

pub use tail::{tail_lines, tail_text};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use sunstone_core::records::now;
use sunstone_core::{JobMode, JobRecord, ResourceSample, RunDir};

use crate::runner::Runners;

/// Lower bound for the event interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(50);

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Set by the consumer when it goes away; the stream ends promptly after.
#[derive(Debug, Clone, Default)]
pub struct Disconnect(Arc<AtomicBool>);

impl Disconnect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One snapshot of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub timestamp: DateTime<Utc>,
    /// `None` if the Job Record could not be read at this instant.
    pub job: Option<JobRecord>,
    /// Remote liveness; `None` for local and batch jobs or an inconclusive probe.
    pub running: Option<bool>,
    pub resource: Vec<ResourceSample>,
}

impl JobEvent {
    /// Server-sent-event frame: `data: <json>\n\n`.
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub interval: Duration,
    pub max_events: Option<usize>,
}

impl StreamConfig {
    pub fn new(interval: Duration, max_events: Option<usize>) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            max_events,
        }
    }
}

/// Iterator of periodic [`JobEvent`]s.
///
/// Ends after `max_events` events or once the [`Disconnect`] is triggered.
/// The disconnect is checked before and after every sample, and sleeps are
/// sliced so it is noticed within a few milliseconds.
pub struct JobStream {
    run_dir: RunDir,
    runners: Arc<Runners>,
    config: StreamConfig,
    disconnect: Disconnect,
    sent: usize,
    done: bool,
}

impl JobStream {
    pub fn new(
        run_dir: RunDir,
        runners: Arc<Runners>,
        config: StreamConfig,
        disconnect: Disconnect,
    ) -> Self {
        Self {
            run_dir,
            runners,
            config,
            disconnect,
            sent: 0,
            done: false,
        }
    }

    fn sleep_interval(&self) {
        let mut remaining = self.config.interval;
        while !remaining.is_zero() && !self.disconnect.is_triggered() {
            let step = remaining.min(SLEEP_SLICE);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }

    fn sample(&self) -> JobEvent {
        let job = match self.run_dir.read_job() {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "job record unreadable during stream");
                None
            }
        };
        let running = job
            .as_ref()
            .filter(|job| job.mode == JobMode::Ssh)
            .and_then(|job| self.runners.for_mode(job.mode).probe(job).as_option());
        JobEvent {
            timestamp: now(),
            job,
            running,
            resource: self.run_dir.read_resource_window(),
        }
    }

    fn finish(&mut self) -> Option<JobEvent> {
        debug!(events = self.sent, "job stream ended");
        self.done = true;
        None
    }
}

impl Iterator for JobStream {
    type Item = JobEvent;

    fn next(&mut self) -> Option<JobEvent> {
        if self.done {
            return None;
        }
        if self.config.max_events.is_some_and(|max| self.sent >= max) {
            return self.finish();
        }
        if self.sent > 0 {
            self.sleep_interval();
        }
        if self.disconnect.is_triggered() {
            return self.finish();
        }
        let event = self.sample();
        if self.disconnect.is_triggered() {
            return self.finish();
        }
        self.sent += 1;
        Some(event)
    }
}
