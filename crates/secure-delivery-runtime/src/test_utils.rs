//! Scripted jobs and collaborators for exercising the runtime.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::remediation::{CertificateRotator, PreKeyRotator};
use secure_delivery::{SenderCertificate, ServiceAddress};
use crate::{Job, JobContext, JobError, JobFactory, Result};

pub const COUNTING_JOB_FACTORY_KEY: &str = "CountingJob";

/// What one attempt of a [`CountingJob`] does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Ok,
    Network,
    ServerRejected,
    /// Rate limited with a server-provided delay in milliseconds.
    RetryAfter(u64),
    /// Sleeps for the given milliseconds, then succeeds.
    Block(u64),
}

#[derive(Debug, Clone)]
pub struct JobRun {
    pub name: String,
    pub attempt: u32,
    pub started: Instant,
    pub finished: Instant,
}

pub type RunLog = Arc<Mutex<Vec<JobRun>>>;

#[derive(Debug, Serialize, Deserialize)]
struct CountingJobData {
    name: String,
    outcomes: Vec<Outcome>,
    max_attempts: u32,
}

/// Plays back `outcomes`, one per attempt, and logs every run.
pub struct CountingJob {
    pub name: String,
    outcomes: Vec<Outcome>,
    max_attempts: u32,
    pub runs: Arc<AtomicUsize>,
    pub failures: Arc<AtomicUsize>,
    pub log: RunLog,
}

impl CountingJob {
    pub fn new(outcomes: Vec<Outcome>) -> Self {
        Self {
            name: "job".to_string(),
            outcomes,
            max_attempts: 5,
            runs: Arc::new(AtomicUsize::new(0)),
            failures: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_log(mut self, log: RunLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_runs(mut self, runs: Arc<AtomicUsize>) -> Self {
        self.runs = runs;
        self
    }
}

impl Job for CountingJob {
    fn factory_key(&self) -> &'static str {
        COUNTING_JOB_FACTORY_KEY
    }

    fn run(&mut self, ctx: &JobContext) -> Result<()> {
        let started = Instant::now();
        self.runs.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .get(ctx.attempt.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or(Outcome::Ok);

        let result = match outcome {
            Outcome::Ok => Ok(()),
            Outcome::Network => Err(JobError::NetworkFailure(1)),
            Outcome::ServerRejected => Err(JobError::Delivery(secure_delivery::Error::Transport(
                secure_delivery::TransportError::ServerRejected,
            ))),
            Outcome::RetryAfter(ms) => Err(JobError::RateLimited {
                retry_after_ms: Some(ms),
            }),
            Outcome::Block(ms) => {
                thread::sleep(Duration::from_millis(ms));
                Ok(())
            }
        };

        self.log.lock().unwrap().push(JobRun {
            name: self.name.clone(),
            attempt: ctx.attempt,
            started,
            finished: Instant::now(),
        });
        result
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn on_failure(&mut self, _error: &JobError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn serialize(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(CountingJobData {
            name: self.name.clone(),
            outcomes: self.outcomes.clone(),
            max_attempts: self.max_attempts,
        })?)
    }
}

/// Rebuilds [`CountingJob`]s that share one log and run counter.
#[derive(Default)]
pub struct CountingJobFactory {
    pub log: RunLog,
    pub runs: Arc<AtomicUsize>,
}

impl JobFactory for CountingJobFactory {
    fn create(&self, data: serde_json::Value) -> Result<Box<dyn Job>> {
        let data: CountingJobData = serde_json::from_value(data)?;
        Ok(Box::new(
            CountingJob::new(data.outcomes)
                .with_name(&data.name)
                .with_max_attempts(data.max_attempts)
                .with_log(self.log.clone())
                .with_runs(self.runs.clone()),
        ))
    }
}

/// Reports a fixed rotation time, optionally after a delay.
pub struct FixedRotator {
    rotated_at: u64,
    delay: Duration,
    calls: AtomicUsize,
}

impl FixedRotator {
    pub fn new(rotated_at: u64) -> Self {
        Self {
            rotated_at,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PreKeyRotator for FixedRotator {
    fn rotate_signed_pre_key(&self) -> secure_delivery::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(self.rotated_at)
    }
}

/// Hands out certificates for `sender` expiring at a fixed time.
pub struct FixedCertificates {
    sender: ServiceAddress,
    expires_at_ms: u64,
    delay: Duration,
    calls: AtomicUsize,
}

impl FixedCertificates {
    pub fn new(sender: ServiceAddress, expires_at_ms: u64) -> Self {
        Self {
            sender,
            expires_at_ms,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CertificateRotator for FixedCertificates {
    fn fetch_sender_certificate(&self) -> secure_delivery::Result<SenderCertificate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(secure_delivery::test_utils::sealed_access(self.sender.clone(), self.expires_at_ms)
            .certificate)
    }
}
