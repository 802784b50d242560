//! Per-work-order finite state machine (`spec.md` §4.3).

use crate::audit::{AuditDetails, AuditLog};
use crate::models::WorkOrderStatus;
use serde::Serialize;
use std::sync::Arc;

/// Events that drive state transitions.
#[derive(Debug, Clone, Serialize)]
pub enum StateEvent {
    Claim,
    Ready,
    Complete,
    Fail { retryable: bool, reason: String },
    Cancel { reason: String },
    RetryDue,
}

impl StateEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Ready => "ready",
            Self::Complete => "complete",
            Self::Fail { .. } => "fail",
            Self::Cancel { .. } => "cancel",
            Self::RetryDue => "retryDue",
        }
    }
}

/// Transitions the work-order state machine, enforcing the table in
/// `spec.md` §4.3 and recording every transition (accepted or rejected)
/// to the Audit Log with `from`, `to`, `reason`.
pub struct StateMachine {
    audit: Arc<AuditLog>,
    retry_budget: u32,
}

impl StateMachine {
    pub fn new(audit: Arc<AuditLog>, retry_budget: u32) -> Self {
        Self { audit, retry_budget }
    }

    /// Computes the next state for `(current, event)` without mutating
    /// anything; returns `InvalidTransition` details (`from`, `event`) when
    /// the event isn't legal from `current`. `retries_used` gates whether a
    /// retryable failure goes to `WAITING_RETRY` or straight to `FAILED`.
    pub fn next_state(
        current: WorkOrderStatus,
        event: &StateEvent,
        retries_used: u32,
        retry_budget: u32,
    ) -> Result<WorkOrderStatus, (WorkOrderStatus, &'static str)> {
        use WorkOrderStatus::*;
        let invalid = || Err((current, event.name()));
        match (current, event) {
            (Pending, StateEvent::Claim) => Ok(Preparing),
            (Preparing, StateEvent::Ready) => Ok(Running),
            (Running, StateEvent::Complete) => Ok(Completed),
            (s, StateEvent::Fail { retryable, .. }) if !s.is_terminal() => {
                if *retryable && retries_used < retry_budget {
                    Ok(WaitingRetry)
                } else {
                    Ok(Failed)
                }
            }
            (s, StateEvent::Cancel { .. }) if !s.is_terminal() => Ok(Canceled),
            (WaitingRetry, StateEvent::RetryDue) => Ok(Pending),
            _ => invalid(),
        }
    }

    /// Applies `event` to `current`, recording the transition (or rejection)
    /// to the audit log, and returns the new state.
    pub async fn apply(
        &self,
        work_order_id: &str,
        current: WorkOrderStatus,
        event: StateEvent,
        retries_used: u32,
    ) -> crate::error::Result<WorkOrderStatus> {
        match Self::next_state(current, &event, retries_used, self.retry_budget) {
            Ok(next) => {
                self.audit
                    .record(
                        work_order_id,
                        "state_transition",
                        AuditDetails::Transition {
                            from: format!("{current:?}"),
                            to: format!("{next:?}"),
                            reason: Self::event_reason(&event),
                        },
                    )
                    .await;
                Ok(next)
            }
            Err((from, event_name)) => {
                self.audit
                    .record(
                        work_order_id,
                        "invalid_transition",
                        AuditDetails::InvalidTransition {
                            from: format!("{from:?}"),
                            event: event_name.to_string(),
                        },
                    )
                    .await;
                Err(crate::error::AgentGateError::InvalidTransition {
                    from: format!("{from:?}"),
                    event: event_name.to_string(),
                })
            }
        }
    }

    fn event_reason(event: &StateEvent) -> String {
        match event {
            StateEvent::Fail { reason, .. } => reason.clone(),
            StateEvent::Cancel { reason } => reason.clone(),
            other => other.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;

    fn log() -> Arc<AuditLog> {
        Arc::new(AuditLog::new(1_000))
    }

    #[test]
    fn happy_path_sequence() {
        use WorkOrderStatus::*;
        let mut s = Pending;
        for (event, expected) in [
            (StateEvent::Claim, Preparing),
            (StateEvent::Ready, Running),
            (StateEvent::Complete, Completed),
        ] {
            s = StateMachine::next_state(s, &event, 0, 3).unwrap();
            assert_eq!(s, expected);
        }
    }

    #[test]
    fn cancel_in_terminal_state_is_invalid() {
        let result = StateMachine::next_state(
            WorkOrderStatus::Completed,
            &StateEvent::Cancel { reason: "x".into() },
            0,
            3,
        );
        assert!(result.is_err());
    }

    #[test]
    fn retryable_failure_under_budget_waits_for_retry() {
        let result = StateMachine::next_state(
            WorkOrderStatus::Running,
            &StateEvent::Fail { retryable: true, reason: "oom".into() },
            0,
            3,
        );
        assert_eq!(result.unwrap(), WorkOrderStatus::WaitingRetry);
    }

    #[test]
    fn retryable_failure_over_budget_fails() {
        let result = StateMachine::next_state(
            WorkOrderStatus::Running,
            &StateEvent::Fail { retryable: true, reason: "oom".into() },
            3,
            3,
        );
        assert_eq!(result.unwrap(), WorkOrderStatus::Failed);
    }

    #[tokio::test]
    async fn apply_records_invalid_transition_without_mutating_state() {
        let sm = StateMachine::new(log(), 3);
        let result = sm
            .apply("wo-1", WorkOrderStatus::Completed, StateEvent::Claim, 0)
            .await;
        assert!(result.is_err());
        let timeline = sm.audit.get_work_order_timeline("wo-1").await;
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].event_type, "invalid_transition");
    }
}
