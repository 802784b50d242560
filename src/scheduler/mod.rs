//! Scheduler (`spec.md` §4.11): the background admission/dispatch loop,
//! stale/dead-process detection, and graceful shutdown.

use crate::audit::{AuditDetails, AuditLog};
use crate::config::SchedulerConfig;
use crate::events::{StreamEvent, StreamEventPayload};
use crate::models::{WorkOrder, WorkOrderStatus};
use crate::resource_monitor::{ResourceMonitor, SlotHandle};
use crate::state_machine::{StateEvent, StateMachine};
use crate::store::{ListFilter, WorkOrderStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Tracked purely by the scheduler to compute staleness; the Engine is the
/// source of truth for run state, this is just "when did we last hear
/// from it".
#[derive(Debug, Clone, Copy)]
struct LastActivity(DateTime<Utc>);

/// Invoked once per admitted work order, carrying the resource slot this
/// tick already reserved for it; typically bridges into the Engine's
/// `execute_with_slot` so admission strictly transfers the slot rather
/// than probing and releasing it.
pub type AdmissionCallback = Arc<dyn Fn(WorkOrder, SlotHandle) + Send + Sync>;
/// Invoked with the id of a work order the Scheduler force-cancelled.
pub type ForceCancelCallback = Arc<dyn Fn(String, String) + Send + Sync>;

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<WorkOrderStore>,
    resource_monitor: Arc<ResourceMonitor>,
    state_machine: Arc<StateMachine>,
    audit: Arc<AuditLog>,
    activity: Mutex<HashMap<String, LastActivity>>,
    shutting_down: AtomicBool,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    stale_task: Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<WorkOrderStore>,
        resource_monitor: Arc<ResourceMonitor>,
        state_machine: Arc<StateMachine>,
        audit: Arc<AuditLog>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                config,
                store,
                resource_monitor,
                state_machine,
                audit,
                activity: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
                tick_task: Mutex::new(None),
                stale_task: Mutex::new(None),
                event_tx,
            }),
            event_rx,
        )
    }

    pub async fn note_activity(&self, work_order_id: &str) {
        self.activity.lock().await.insert(work_order_id.to_string(), LastActivity(Utc::now()));
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.event_tx.send(event);
    }

    /// One admission tick: pulls PENDING work orders ordered by
    /// `(priority desc, createdAt asc)` — priority is currently uniform, so
    /// this degenerates to FIFO by `createdAt` — and admits as many as the
    /// Resource Monitor allows, staggering between admissions.
    async fn tick(&self, on_admit: &AdmissionCallback) {
        let pending = match self.store.list(ListFilter { status: Some(WorkOrderStatus::Pending), limit: None, offset: 0 }).await {
            Ok(mut list) => {
                list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                list
            }
            Err(e) => {
                tracing::warn!("scheduler tick: failed to list pending work orders: {e}");
                return;
            }
        };

        for work_order in pending {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            let Some(slot) = self.resource_monitor.acquire_slot(&work_order.id).await else {
                continue;
            };
            match self.state_machine.apply(&work_order.id, work_order.status, StateEvent::Claim, 0).await {
                Ok(next) => {
                    if let Err(e) = self.store.update_status(&work_order.id, next).await {
                        tracing::warn!("failed to persist claim for {}: {e}", work_order.id);
                        self.resource_monitor.release_slot(&slot).await;
                        continue;
                    }
                    self.note_activity(&work_order.id).await;
                    on_admit(work_order, slot);
                    if self.config.stagger_delay_ms > 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(self.config.stagger_delay_ms)).await;
                    }
                }
                Err(e) => {
                    tracing::warn!("scheduler could not claim {}: {e}", work_order.id);
                    self.resource_monitor.release_slot(&slot).await;
                }
            }
        }
    }

    /// Stale/dead-process sweep: a RUNNING work order is stale once
    /// `now - lastActivity > staleThresholdMs`, and forcibly cancelled once
    /// it also exceeds `maxRunningTimeMs`.
    async fn sweep_stale(&self, on_force_cancel: &ForceCancelCallback) {
        let running = match self.store.list(ListFilter { status: Some(WorkOrderStatus::Running), limit: None, offset: 0 }).await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!("stale sweep: failed to list running work orders: {e}");
                return;
            }
        };
        let now = Utc::now();
        let activity = self.activity.lock().await;
        for work_order in running {
            let last_activity = activity.get(&work_order.id).map(|a| a.0).unwrap_or(work_order.created_at);
            let idle_ms = (now - last_activity).num_milliseconds().max(0) as u64;
            let running_ms = (now - work_order.created_at).num_milliseconds().max(0) as u64;

            if idle_ms > self.config.stale_threshold_ms {
                self.audit
                    .record(
                        &work_order.id,
                        "stale_detected",
                        AuditDetails::StaleDetected { reason: format!("idle for {idle_ms}ms") },
                    )
                    .await;
                self.emit(StreamEvent::new(
                    work_order.id.clone(),
                    StreamEventPayload::WorkOrderUpdated { work_order_id: work_order.id.clone(), status: "stale".to_string() },
                ));
            }

            if running_ms > self.config.max_running_time_ms {
                self.audit
                    .record(
                        &work_order.id,
                        "dead_process_detected",
                        AuditDetails::StaleDetected { reason: format!("running for {running_ms}ms exceeds max") },
                    )
                    .await;
                let reason = format!("running for {running_ms}ms exceeds max_running_time_ms of {}", self.config.max_running_time_ms);
                on_force_cancel(work_order.id.clone(), reason.clone());
                self.audit
                    .record(&work_order.id, "stale_handled", AuditDetails::Generic(serde_json::json!({"action": "force_cancel"})))
                    .await;
                self.audit
                    .record(&work_order.id, "stale_cancelled", AuditDetails::StaleDetected { reason })
                    .await;
            }
        }
    }

    /// Spawns the tick loop and the stale-sweep loop as independent
    /// background tasks.
    pub fn start(self: &Arc<Self>, on_admit: AdmissionCallback, on_force_cancel: ForceCancelCallback) {
        let this = self.clone();
        let tick_interval = std::time::Duration::from_millis(this.config.tick_interval_ms);
        let tick_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                ticker.tick().await;
                if this.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                this.tick(&on_admit).await;
            }
        });

        let this2 = self.clone();
        let stale_interval = std::time::Duration::from_millis(this2.config.stale_check_interval_ms);
        let stale_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stale_interval);
            loop {
                ticker.tick().await;
                if this2.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                this2.sweep_stale(&on_force_cancel).await;
            }
        });

        let tick_task = self.tick_task.try_lock();
        if let Ok(mut slot) = tick_task {
            *slot = Some(tick_handle);
        }
        let stale_task = self.stale_task.try_lock();
        if let Ok(mut slot) = stale_task {
            *slot = Some(stale_handle);
        }
    }

    /// Stops accepting new work, waits up to `shutdown_grace_ms` for
    /// running work to reach a terminal state (polling the store), then
    /// aborts the background loops. Slot release and stream flushing are
    /// the caller's responsibility once this returns.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(self.config.shutdown_grace_ms);
        loop {
            let still_running = self
                .store
                .count(Some(WorkOrderStatus::Running))
                .await
                .unwrap_or(0);
            if still_running == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
        if let Some(handle) = self.tick_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.stale_task.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentType, WorkspaceSource};
    use std::sync::atomic::AtomicUsize;

    async fn build(stale_threshold_ms: u64, max_running_time_ms: u64) -> (Arc<Scheduler>, Arc<WorkOrderStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WorkOrderStore::new(dir.path()).await.unwrap());
        let monitor = ResourceMonitor::new(crate::config::ResourceMonitorConfig {
            max_concurrent_slots: 4,
            memory_per_slot_mb: 1,
            poll_interval_ms: 1_000,
        });
        let audit = Arc::new(AuditLog::new(1_000));
        let sm = Arc::new(StateMachine::new(audit.clone(), 3));
        let config = SchedulerConfig {
            tick_interval_ms: 50,
            stagger_delay_ms: 0,
            stale_check_interval_ms: 50,
            stale_threshold_ms,
            max_running_time_ms,
            shutdown_grace_ms: 100,
        };
        let (scheduler, _rx) = Scheduler::new(config, store.clone(), monitor, sm, audit);
        (scheduler, store)
    }

    #[tokio::test]
    async fn tick_admits_pending_work_orders_in_creation_order() {
        let (scheduler, store) = build(600_000, 14_400_000).await;
        let wo = WorkOrder::new(
            "do it".to_string(),
            WorkspaceSource::Local { path: "/tmp".into() },
            AgentType::ClaudeCodeSubscription,
            3,
            3600,
        );
        store.save(&wo).await.unwrap();

        let admitted = Arc::new(AtomicUsize::new(0));
        let admitted_clone = admitted.clone();
        let slots_seen: Arc<Mutex<Vec<SlotHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let slots_seen_clone = slots_seen.clone();
        let callback: AdmissionCallback = Arc::new(move |_wo, slot| {
            admitted_clone.fetch_add(1, Ordering::SeqCst);
            slots_seen_clone.try_lock().unwrap().push(slot);
        });
        scheduler.tick(&callback).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(slots_seen.try_lock().unwrap().len(), 1);
        let reloaded = store.load(&wo.id).await.unwrap();
        assert_eq!(reloaded.status, WorkOrderStatus::Preparing);
    }

    #[tokio::test]
    async fn sweep_force_cancels_work_exceeding_max_running_time() {
        let (scheduler, store) = build(600_000, 0).await;
        let mut wo = WorkOrder::new(
            "do it".to_string(),
            WorkspaceSource::Local { path: "/tmp".into() },
            AgentType::ClaudeCodeSubscription,
            3,
            3600,
        );
        wo.status = WorkOrderStatus::Running;
        store.save(&wo).await.unwrap();

        let cancelled = Arc::new(AtomicUsize::new(0));
        let cancelled_clone = cancelled.clone();
        let callback: ForceCancelCallback = Arc::new(move |_id, _reason| {
            cancelled_clone.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.sweep_stale(&callback).await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }
}
