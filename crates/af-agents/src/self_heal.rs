//! Advisory remediation labels for tasks that exhausted their retries.
//!
//! The label is persisted on the task for an operator (or a later automated
//! pass) to act on. Nothing here retries anything.

use std::fmt;

use af_harness::execution::{ErrorKind, ExecutionError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingStrategy {
    RotateCredentials,
    IncreaseTimeout,
    BackoffAndRequeue,
    CheckConnectivity,
    ManualReview,
}

impl HealingStrategy {
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Authentication => HealingStrategy::RotateCredentials,
            ErrorKind::Timeout => HealingStrategy::IncreaseTimeout,
            ErrorKind::RateLimited => HealingStrategy::BackoffAndRequeue,
            ErrorKind::Network => HealingStrategy::CheckConnectivity,
            ErrorKind::InvalidInput | ErrorKind::Conflict | ErrorKind::Internal => {
                HealingStrategy::ManualReview
            }
        }
    }

    pub fn classify(error: &ExecutionError) -> Self {
        Self::for_kind(error.kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealingStrategy::RotateCredentials => "rotate_credentials",
            HealingStrategy::IncreaseTimeout => "increase_timeout",
            HealingStrategy::BackoffAndRequeue => "backoff_and_requeue",
            HealingStrategy::CheckConnectivity => "check_connectivity",
            HealingStrategy::ManualReview => "manual_review",
        }
    }
}

impl fmt::Display for HealingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
