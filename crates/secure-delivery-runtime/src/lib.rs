pub mod backoff;
pub mod classify;
pub mod context;
pub mod delivery_job;
pub mod error;
pub mod job;
pub mod job_store;
pub mod ledger;
pub mod manager;
pub mod recorder;
pub mod remediation;
pub mod test_utils;

pub use backoff::Backoff;
pub use classify::{classify, failure_kind, FailureKind, RetryDecision};
pub use context::{CertificatePrecondition, DeliveryContext, PreKeyPrecondition};
pub use delivery_job::{
    DeliveryJob, DeliveryJobData, DeliveryJobFactory, DeliveryServices, DELIVERY_JOB_FACTORY_KEY,
};
pub use error::{JobError, Result};
pub use job::{Job, JobContext, JobFactory, JobState};
pub use job_store::{JobRecord, JobStore};
pub use ledger::DeliveryLedger;
pub use manager::{JobHandle, JobManager, JobManagerOptions};
pub use recorder::{DeliveryRecorder, MemoryRecorder, Recorded};
pub use remediation::{
    CertificateRefreshJob, CertificateRotator, PreKeyRefreshJob, PreKeyRefreshJobFactory,
    PreKeyRotator,
};
