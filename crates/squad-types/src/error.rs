//! Error classification shared across the workspace.
//!
//! Every component error enum implements [`Classify`] so retry and
//! escalation policy can be decided uniformly: transient errors are retried
//! with backoff, permanent errors are surfaced to the originator, semantic
//! errors feed the blocker/escalation path, external errors are reported by
//! the offending agent as a `status_update`.

use serde::{Deserialize, Serialize};

/// Policy class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retry with exponential backoff up to a bounded number of attempts,
    /// then escalate.
    Transient,
    /// Never retried; surfaced to the originator.
    Permanent,
    /// Recoverable at the orchestration layer via blocker/escalation.
    Semantic,
    /// Reported by the offending agent; orchestration takes it from there.
    External,
}

/// Classification surface implemented by component error enums.
pub trait Classify {
    /// Policy class of this error value.
    fn class(&self) -> ErrorClass;

    /// Whether retrying the failed operation may succeed.
    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
