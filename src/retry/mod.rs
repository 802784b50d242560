//! Retry Manager (`spec.md` §4.6): classifies errors and schedules
//! delayed re-enqueues with exponential backoff and jitter.

use crate::config::RetryConfig;
use crate::error::{AgentGateError, ErrorClass};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::sync::mpsc;

/// Emitted when a scheduled retry comes due; the scheduler feeds this back
/// into the state machine as `retryDue` (`spec.md` §4.6).
#[derive(Debug, Clone)]
pub struct RetryDue {
    pub work_order_id: String,
    pub attempt: u32,
}

pub struct RetryManager {
    config: RetryConfig,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    sender: mpsc::UnboundedSender<RetryDue>,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<RetryDue>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                config,
                timers: Mutex::new(HashMap::new()),
                sender,
            }),
            receiver,
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exp = self.config.base_delay_ms as f64 * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = exp.min(self.config.max_delay_ms as f64);
        let jitter_span = capped * self.config.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        let final_ms = (capped + jitter).max(0.0) as u64;
        std::time::Duration::from_millis(final_ms)
    }

    /// Schedules a delayed retry for `work_order_id` if `error` is
    /// retryable and the attempt budget isn't exhausted. Returns `true`
    /// when a retry was scheduled.
    pub async fn maybe_schedule(&self, work_order_id: &str, attempt: u32, error: &AgentGateError) -> bool {
        if error.classify() != ErrorClass::Retryable {
            return false;
        }
        if attempt >= self.config.max_retries {
            return false;
        }
        let delay = self.delay_for_attempt(attempt);
        let sender = self.sender.clone();
        let work_order_id_owned = work_order_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(RetryDue { work_order_id: work_order_id_owned, attempt: attempt + 1 });
        });
        let mut timers = self.timers.lock().await;
        if let Some(previous) = timers.insert(work_order_id.to_string(), handle) {
            previous.abort();
        }
        true
    }

    pub async fn cancel(&self, work_order_id: &str) {
        if let Some(handle) = self.timers.lock().await.remove(work_order_id) {
            handle.abort();
        }
    }

    pub async fn cancel_all(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 5,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    #[tokio::test]
    async fn retryable_error_under_budget_schedules_a_retry() {
        let (manager, mut rx) = RetryManager::new(config(2));
        let scheduled = manager
            .maybe_schedule("wo-1", 0, &AgentGateError::Timeout { message: "slow".into() })
            .await;
        assert!(scheduled);
        let due = rx.recv().await.unwrap();
        assert_eq!(due.work_order_id, "wo-1");
        assert_eq!(due.attempt, 1);
    }

    #[tokio::test]
    async fn max_retries_zero_never_schedules() {
        let (manager, _rx) = RetryManager::new(config(0));
        let scheduled = manager
            .maybe_schedule("wo-1", 0, &AgentGateError::Timeout { message: "slow".into() })
            .await;
        assert!(!scheduled);
    }

    #[tokio::test]
    async fn non_retryable_error_never_schedules() {
        let (manager, _rx) = RetryManager::new(config(5));
        let scheduled = manager
            .maybe_schedule("wo-1", 0, &AgentGateError::InvalidWorkOrder("bad".into()))
            .await;
        assert!(!scheduled);
    }

    #[tokio::test]
    async fn cancel_all_clears_pending_timers() {
        let (manager, mut rx) = RetryManager::new(config(5));
        manager
            .maybe_schedule("wo-1", 0, &AgentGateError::Timeout { message: "slow".into() })
            .await;
        manager.cancel_all().await;
        let result = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err(), "no retry should have fired after cancel_all");
    }
}
