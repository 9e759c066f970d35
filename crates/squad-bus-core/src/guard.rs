//! Publish guards.
//!
//! A guard is consulted before a message is stored or fanned out. The
//! orchestrator installs one per execution to enforce delegation rules:
//! a rejected message is never observable by its recipient.

use crate::BusMessage;

/// Verdict of a publish guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    /// Store and deliver the message.
    Allow,
    /// Suppress the message with the given reason.
    Reject {
        /// Machine-readable rejection reason.
        reason: String,
    },
}

impl GuardVerdict {
    /// Shorthand for a rejection verdict.
    pub fn reject(reason: impl Into<String>) -> Self {
        GuardVerdict::Reject {
            reason: reason.into(),
        }
    }
}

/// Review hook applied to every publish before storage.
///
/// Guards must be cheap and side-effect free on the allow path; rejection
/// handlers that need to react (e.g. send a system answer to the sender)
/// should hand the rejection to their own channel rather than publish from
/// inside the guard.
pub trait PublishGuard: Send + Sync {
    /// Review a message about to be published.
    fn review(&self, message: &BusMessage) -> GuardVerdict;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAll;

    impl PublishGuard for DenyAll {
        fn review(&self, _message: &BusMessage) -> GuardVerdict {
            GuardVerdict::reject("nothing gets through")
        }
    }

    #[test]
    fn verdict_shorthand() {
        let verdict = DenyAll.review(&crate::BusMessage::state(squad_types::StateChanged {
            execution_id: squad_types::ExecutionId::new(),
            from: squad_types::WorkflowState::Pending,
            to: squad_types::WorkflowState::Analyzing,
            progress_pct: 12,
            actor_id: squad_types::AgentId::new(),
            reason: None,
            at: squad_types::time::now_ms(),
        }));
        assert_eq!(
            verdict,
            GuardVerdict::Reject {
                reason: "nothing gets through".to_string()
            }
        );
    }
}
