//! Retry classification for job failures.

use secure_delivery::{Error, TransportError};

use crate::JobError;

/// Closed set of failure kinds a job can end an attempt with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    ServerRejected,
    NotRegistered,
    Io,
    Network,
    RetryLater,
    ProofRequired,
    RateLimited,
    IdentityMismatch,
    ContentTooLarge,
    Unregistered,
    Canceled,
    Other,
}

impl FailureKind {
    pub const ALL: [FailureKind; 12] = [
        FailureKind::ServerRejected,
        FailureKind::NotRegistered,
        FailureKind::Io,
        FailureKind::Network,
        FailureKind::RetryLater,
        FailureKind::ProofRequired,
        FailureKind::RateLimited,
        FailureKind::IdentityMismatch,
        FailureKind::ContentTooLarge,
        FailureKind::Unregistered,
        FailureKind::Canceled,
        FailureKind::Other,
    ];

    pub fn is_retryable(self) -> bool {
        match self {
            FailureKind::ServerRejected | FailureKind::NotRegistered => false,
            FailureKind::Io
            | FailureKind::Network
            | FailureKind::RetryLater
            | FailureKind::ProofRequired
            | FailureKind::RateLimited => true,
            FailureKind::IdentityMismatch
            | FailureKind::ContentTooLarge
            | FailureKind::Unregistered
            | FailureKind::Canceled => false,
            FailureKind::Other => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry within the attempt budget. A server-provided delay replaces the
    /// computed backoff.
    Retry { backoff_override_ms: Option<u64> },
    Permanent,
}

fn transport_kind(error: &TransportError) -> FailureKind {
    match error {
        TransportError::ServerRejected => FailureKind::ServerRejected,
        TransportError::Unregistered(_) => FailureKind::Unregistered,
        TransportError::RateLimited { .. } => FailureKind::RateLimited,
        TransportError::ProofRequired { .. } => FailureKind::ProofRequired,
        TransportError::Network(_) | TransportError::PipeUnavailable => FailureKind::Network,
        TransportError::ServerError(_) => FailureKind::Io,
        TransportError::Unauthorized
        | TransportError::MismatchedDevices(_)
        | TransportError::StaleDevices(_)
        | TransportError::GroupMismatchedDevices(_)
        | TransportError::GroupStaleDevices(_) => FailureKind::Other,
    }
}

pub fn failure_kind(error: &JobError) -> FailureKind {
    match error {
        JobError::Delivery(e) => match e {
            Error::Transport(t) => transport_kind(t),
            Error::ContentTooLarge { .. } => FailureKind::ContentTooLarge,
            Error::UntrustedIdentity { .. } => FailureKind::IdentityMismatch,
            Error::ConflictRetriesExhausted(_) | Error::Storage(_) => FailureKind::Io,
            _ => FailureKind::Other,
        },
        JobError::RetryLater { .. } => FailureKind::RetryLater,
        JobError::NotRegistered => FailureKind::NotRegistered,
        JobError::ProofRequired { .. } => FailureKind::ProofRequired,
        JobError::RateLimited { .. } => FailureKind::RateLimited,
        JobError::NetworkFailure(_) => FailureKind::Network,
        JobError::IdentityMismatch(_) => FailureKind::IdentityMismatch,
        JobError::Undeliverable(_) => FailureKind::Unregistered,
        JobError::Canceled => FailureKind::Canceled,
        JobError::QueueFull { .. }
        | JobError::UnknownFactory(_)
        | JobError::Shutdown
        | JobError::Json(_) => FailureKind::Other,
    }
}

/// Delay the server asked for, if any. Negative hints are ignored.
fn server_backoff(error: &JobError) -> Option<u64> {
    match error {
        JobError::RetryLater { backoff_ms, .. } => *backoff_ms,
        JobError::ProofRequired { retry_after_ms } | JobError::RateLimited { retry_after_ms } => {
            *retry_after_ms
        }
        JobError::Delivery(Error::Transport(TransportError::RateLimited { retry_after_ms })) => {
            *retry_after_ms
        }
        JobError::Delivery(Error::Transport(TransportError::ProofRequired {
            retry_after_seconds,
            ..
        })) => seconds_to_ms(*retry_after_seconds),
        _ => None,
    }
}

pub fn seconds_to_ms(seconds: i64) -> Option<u64> {
    u64::try_from(seconds).ok().map(|s| s.saturating_mul(1000))
}

pub fn classify(error: &JobError) -> RetryDecision {
    if failure_kind(error).is_retryable() {
        RetryDecision::Retry {
            backoff_override_ms: server_backoff(error),
        }
    } else {
        RetryDecision::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_retried_kinds() {
        let permanent: Vec<FailureKind> = FailureKind::ALL
            .into_iter()
            .filter(|k| !k.is_retryable())
            .collect();
        assert_eq!(
            permanent,
            vec![
                FailureKind::ServerRejected,
                FailureKind::NotRegistered,
                FailureKind::IdentityMismatch,
                FailureKind::ContentTooLarge,
                FailureKind::Unregistered,
                FailureKind::Canceled,
            ]
        );
    }

    #[test]
    fn server_rejection_is_permanent() {
        let error = JobError::Delivery(Error::Transport(TransportError::ServerRejected));
        assert_eq!(classify(&error), RetryDecision::Permanent);
        assert_eq!(classify(&JobError::NotRegistered), RetryDecision::Permanent);
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let error = JobError::Delivery(Error::Transport(TransportError::ProofRequired {
            token: "t".to_string(),
            retry_after_seconds: 30,
        }));
        assert_eq!(
            classify(&error),
            RetryDecision::Retry {
                backoff_override_ms: Some(30_000)
            }
        );

        let negative = JobError::Delivery(Error::Transport(TransportError::ProofRequired {
            token: "t".to_string(),
            retry_after_seconds: -1,
        }));
        assert_eq!(
            classify(&negative),
            RetryDecision::Retry {
                backoff_override_ms: None
            }
        );

        assert_eq!(
            classify(&JobError::RateLimited {
                retry_after_ms: Some(1500)
            }),
            RetryDecision::Retry {
                backoff_override_ms: Some(1500)
            }
        );
    }

    #[test]
    fn conflict_exhaustion_is_io() {
        let error = JobError::Delivery(Error::ConflictRetriesExhausted(4));
        assert_eq!(failure_kind(&error), FailureKind::Io);
        assert!(matches!(classify(&error), RetryDecision::Retry { .. }));
    }

    #[test]
    fn unknown_errors_retry_within_budget() {
        let error = JobError::Delivery(Error::Decryption("bad".to_string()));
        assert_eq!(failure_kind(&error), FailureKind::Other);
        assert!(matches!(classify(&error), RetryDecision::Retry { .. }));
    }
}
