//! Daily job runner for the digest, stale check and feed poll.
//!
//! All jobs share one time of day. The run loop polls the injected clock and
//! stops when the shutdown channel flips to `true`.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

type JobFn = Box<dyn FnMut() -> Result<()> + Send>;
type TimeSource = Box<dyn FnMut() -> Option<NaiveTime> + Send>;

struct Job {
    name: String,
    run: JobFn,
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    at: NaiveTime,
    next_run: NaiveDateTime,
    poll_interval: Duration,
    jobs: Vec<Job>,
    time_source: Option<TimeSource>,
}

impl Scheduler {
    /// Jobs first fire at the next occurrence of `at`; a time already passed
    /// today means tomorrow.
    pub fn new(clock: Arc<dyn Clock>, at: NaiveTime) -> Self {
        let next_run = next_occurrence(clock.now(), at);
        Self {
            clock,
            at,
            next_run,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jobs: Vec::new(),
            time_source: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn every_day(mut self, name: &str, run: impl FnMut() -> Result<()> + Send + 'static) -> Self {
        self.jobs.push(Job { name: name.to_string(), run: Box::new(run) });
        self
    }

    /// Consulted on every poll; a different time reschedules all jobs.
    /// `None` keeps the current time.
    pub fn with_time_source(mut self, source: impl FnMut() -> Option<NaiveTime> + Send + 'static) -> Self {
        self.time_source = Some(Box::new(source));
        self
    }

    pub fn at(&self) -> NaiveTime {
        self.at
    }

    pub fn next_run(&self) -> NaiveDateTime {
        self.next_run
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(|j| j.name.as_str())
    }

    /// Move every job to a new time of day, counted from now.
    pub fn reschedule(&mut self, at: NaiveTime) {
        self.at = at;
        self.next_run = next_occurrence(self.clock.now(), at);
        info!(at = %at.format("%H:%M"), next_run = %self.next_run, "rescheduled daily jobs");
    }

    /// Run every job if the scheduled time has been reached. Returns how many
    /// jobs ran. A failing job is logged and does not stop the others.
    pub fn run_pending(&mut self) -> usize {
        let wanted = self.time_source.as_mut().and_then(|source| source());
        if let Some(at) = wanted.filter(|at| *at != self.at) {
            self.reschedule(at);
        }

        let now = self.clock.now();
        if now < self.next_run {
            return 0;
        }
        for job in &mut self.jobs {
            debug!(job = %job.name, "running scheduled job");
            if let Err(e) = (job.run)() {
                warn!(job = %job.name, error = %e, "scheduled job failed");
            }
        }
        self.next_run = next_occurrence(now, self.at);
        info!(jobs = self.jobs.len(), next_run = %self.next_run, "daily jobs complete");
        self.jobs.len()
    }

    /// Poll until the shutdown signal is received. Jobs do blocking I/O, so
    /// this needs the multi-threaded runtime.
    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(next_run = %self.next_run, "scheduler started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::task::block_in_place(|| self.run_pending());

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        info!("scheduler stopped");
    }
}

fn next_occurrence(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now { today } else { today + ChronoDuration::days(1) }
}
