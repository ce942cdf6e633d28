use secure_delivery::CancellationToken;
use serde::{Deserialize, Serialize};

use crate::{JobError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Pending,
    Running,
    Retrying,
    /// Terminal: the job's work is done (for delivery jobs, "sent").
    Succeeded,
    PermanentlyFailed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::PermanentlyFailed)
    }
}

/// Handed to [`Job::run`] on every attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Canceled when the manager shuts down.
    pub cancel: CancellationToken,
}

/// A retryable unit of work. The manager owns scheduling, backoff and
/// persistence; the job owns what one attempt does and how it fails.
pub trait Job: Send {
    /// Key of the [`JobFactory`] that rebuilds this job from
    /// [`Job::serialize`] output.
    fn factory_key(&self) -> &'static str;

    fn run(&mut self, ctx: &JobContext) -> Result<()>;

    fn max_attempts(&self) -> u32;

    /// Called before waiting out the backoff for another attempt.
    fn on_retry(&mut self, _error: &JobError) {}

    /// Called once when the job ends in `PermanentlyFailed`.
    fn on_failure(&mut self, error: &JobError);

    fn serialize(&self) -> Result<serde_json::Value>;
}

pub trait JobFactory: Send + Sync {
    fn create(&self, data: serde_json::Value) -> Result<Box<dyn Job>>;
}
