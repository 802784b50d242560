//! Scheduler scenario (`spec.md` §8, scenario 5): a `Running` work order
//! that has exceeded `maxRunningTimeMs` is force-cancelled and the audit
//! trail records both the dead-process detection and the literal
//! `stale_cancelled` event the end-to-end scenario names.

mod common;

use agentgate::audit::AuditLog;
use agentgate::models::{AgentType, WorkOrderStatus, WorkspaceSource};
use agentgate::resource_monitor::ResourceMonitor;
use agentgate::scheduler::{AdmissionCallback, ForceCancelCallback, Scheduler};
use agentgate::state_machine::StateMachine;
use agentgate::store::WorkOrderStore;
use common::{resource_monitor_config, scheduler_config};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn stale_work_order_is_force_cancelled_and_audited() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(WorkOrderStore::new(dir.path()).await.unwrap());
    let monitor = ResourceMonitor::new(resource_monitor_config());
    let audit = Arc::new(AuditLog::new(1_000));
    let state_machine = Arc::new(StateMachine::new(audit.clone(), 3));

    // stale_threshold_ms huge (never informational-stale), max_running_time_ms
    // tiny so the created_at clock alone trips the force-cancel branch.
    let config = scheduler_config(600_000, 0);
    let (scheduler, _scheduler_rx) = Scheduler::new(config, store.clone(), monitor, state_machine, audit.clone());

    let mut wo = agentgate::models::WorkOrder::new(
        "long running task".to_string(),
        WorkspaceSource::Local { path: "/tmp".to_string() },
        AgentType::ClaudeCodeSubscription,
        3,
        3600,
    );
    wo.status = WorkOrderStatus::Running;
    store.save(&wo).await.unwrap();

    let cancelled = Arc::new(AtomicUsize::new(0));
    let cancelled_clone = cancelled.clone();
    let reasons: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let reasons_clone = reasons.clone();

    // Mirrors main.rs's real force-cancel callback: moves the work order out
    // of `Running` so later sweeps stop re-flagging it as stale.
    let store_for_cancel = store.clone();
    let callback: ForceCancelCallback = Arc::new(move |id, reason| {
        cancelled_clone.fetch_add(1, Ordering::SeqCst);
        reasons_clone.lock().unwrap().push(reason);
        let store = store_for_cancel.clone();
        tokio::spawn(async move {
            let _ = store.update_status(&id, WorkOrderStatus::Canceled).await;
        });
    });

    let on_admit: AdmissionCallback = Arc::new(|_wo, _slot| {});
    scheduler.start(on_admit, callback);
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    scheduler.shutdown().await;

    assert!(cancelled.load(Ordering::SeqCst) >= 1);
    assert!(!reasons.lock().unwrap()[0].is_empty());

    let timeline = audit.get_work_order_timeline(&wo.id).await;
    let cancelled_event = timeline.iter().find(|e| e.event_type == "stale_cancelled");
    assert!(cancelled_event.is_some(), "expected a stale_cancelled audit event, got: {timeline:?}");
    match &cancelled_event.unwrap().details {
        agentgate::audit::AuditDetails::StaleDetected { reason } => assert!(!reason.is_empty()),
        other => panic!("expected StaleDetected details, got {other:?}"),
    }
    assert!(timeline.iter().any(|e| e.event_type == "dead_process_detected"));
}
