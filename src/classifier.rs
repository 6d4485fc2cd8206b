//! Failure classification for the visit retry loop
//!
//! [`classify`] is a pure function of (error kind, attempt, policy); the
//! worker performs whatever [`Recovery`] it returns.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pacing;
use crate::status::WorkerStatus;
use crate::types::ScanError;

/// A randomized pause range in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl Backoff {
    pub const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    pub fn sample(&self) -> Duration {
        pacing::secs(pacing::uniform(self.min_secs, self.max_secs))
    }

    pub async fn sleep(&self) {
        tokio::time::sleep(self.sample()).await;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// After the egress path was rejected
    pub egress_backoff: Backoff,
    /// Remote busy or offline
    pub busy_backoff: Backoff,
    pub throttle_backoff: Backoff,
    pub malformed_backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            egress_backoff: Backoff::new(25.0, 35.0),
            busy_backoff: Backoff::new(10.0, 14.0),
            throttle_backoff: Backoff::new(11.0, 30.0),
            malformed_backoff: Backoff::new(10.0, 14.0),
        }
    }
}

/// What the worker should do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// Try the coordinate again, after rotating egress and/or pausing.
    /// `backoff` is `None` when no attempts remain.
    Retry {
        backoff: Option<Backoff>,
        rotate_egress: bool,
    },
    /// Give up on the coordinate and swap the identity
    SwapIdentity,
    /// Mark the identity banned and replace it
    RemoveIdentity,
    /// Bench the identity for challenge resolution and replace it
    BenchIdentity,
    /// Give up on the coordinate; keep the identity
    Abandon,
}

impl Recovery {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Recovery::Retry { .. })
    }
}

/// Map a failure on `attempt` (zero based) to a recovery action
pub fn classify(error: &ScanError, attempt: u32, policy: &RetryPolicy) -> Recovery {
    let last = attempt + 1 >= policy.max_attempts;
    let retry = |backoff: Backoff, rotate_egress: bool| Recovery::Retry {
        backoff: (!last).then_some(backoff),
        rotate_egress,
    };

    match error {
        ScanError::EgressBanned => retry(policy.egress_backoff, true),
        ScanError::AuthRejected(_) | ScanError::NotAuthenticated => Recovery::SwapIdentity,
        ScanError::ServerBusy => retry(policy.busy_backoff, false),
        ScanError::Throttled => retry(policy.throttle_backoff, false),
        ScanError::AccountBanned => Recovery::RemoveIdentity,
        ScanError::ChallengeRequired(_) => Recovery::BenchIdentity,
        ScanError::MalformedResponse(_) => retry(policy.malformed_backoff, false),
        ScanError::Transport(_) | ScanError::Io(_) | ScanError::Internal(_) => Recovery::Abandon,
    }
}

/// Status code shown while recovering from `error`
pub fn status_for(error: &ScanError) -> WorkerStatus {
    match error {
        ScanError::EgressBanned => WorkerStatus::IpBanned,
        ScanError::AuthRejected(_) => WorkerStatus::FailedLogin,
        ScanError::NotAuthenticated => WorkerStatus::NotAuthenticated,
        ScanError::ServerBusy => WorkerStatus::Retrying,
        ScanError::Throttled => WorkerStatus::Throttle,
        ScanError::AccountBanned => WorkerStatus::Banned,
        ScanError::ChallengeRequired(_) => WorkerStatus::Captcha,
        ScanError::MalformedResponse(_) => WorkerStatus::Malformed,
        ScanError::Transport(_) | ScanError::Io(_) | ScanError::Internal(_) => {
            WorkerStatus::Exception
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        let policy = RetryPolicy::default();
        let cases = vec![
            (
                ScanError::EgressBanned,
                Recovery::Retry {
                    backoff: Some(policy.egress_backoff),
                    rotate_egress: true,
                },
            ),
            (ScanError::AuthRejected("bad".into()), Recovery::SwapIdentity),
            (ScanError::NotAuthenticated, Recovery::SwapIdentity),
            (
                ScanError::ServerBusy,
                Recovery::Retry {
                    backoff: Some(policy.busy_backoff),
                    rotate_egress: false,
                },
            ),
            (
                ScanError::Throttled,
                Recovery::Retry {
                    backoff: Some(Backoff::new(11.0, 30.0)),
                    rotate_egress: false,
                },
            ),
            (ScanError::AccountBanned, Recovery::RemoveIdentity),
            (ScanError::ChallengeRequired("u".into()), Recovery::BenchIdentity),
            (
                ScanError::MalformedResponse("x".into()),
                Recovery::Retry {
                    backoff: Some(policy.malformed_backoff),
                    rotate_egress: false,
                },
            ),
            (ScanError::Transport("reset".into()), Recovery::Abandon),
        ];

        for (error, expected) in cases {
            assert_eq!(classify(&error, 0, &policy), expected, "{:?}", error);
        }
    }

    #[test]
    fn test_no_backoff_on_final_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(
            classify(&ScanError::ServerBusy, 3, &policy),
            Recovery::Retry {
                backoff: None,
                rotate_egress: false
            }
        );
        assert_eq!(
            classify(&ScanError::EgressBanned, 3, &policy),
            Recovery::Retry {
                backoff: None,
                rotate_egress: true
            }
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_for(&ScanError::Throttled).token(), "THROTTLE");
        assert_eq!(status_for(&ScanError::AccountBanned).token(), "BANNED?");
        assert_eq!(status_for(&ScanError::ChallengeRequired("u".into())).token(), "CAPTCHA");
        assert_eq!(status_for(&ScanError::EgressBanned).token(), "IP BANNED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_within_range() {
        let backoff = Backoff::new(11.0, 30.0);
        let start = tokio::time::Instant::now();
        backoff.sleep().await;
        let elapsed = start.elapsed().as_secs_f64();
        assert!((11.0..=30.1).contains(&elapsed));
    }
}
