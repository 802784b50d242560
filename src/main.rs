use agentgate::api::{self, AppState};
use agentgate::audit::AuditLog;
use agentgate::config::Config;
use agentgate::drivers::local::{
    CommandVerifier, CustomCommandGateRunner, GitSnapshotter, GitVcsAdapter, InProcessSandboxProvider,
    LocalAgentDriver, LocalOnlyWorkspaceResolver, VerificationGateRunner,
};
use agentgate::drivers::{DriverRegistry, WorkspaceResolver};
use agentgate::engine::{Engine, EngineServices};
use agentgate::events::buffer::EventBuffer;
use agentgate::events::rate_limiter::RateLimiter;
use agentgate::resource_monitor::ResourceMonitor;
use agentgate::retry::RetryManager;
use agentgate::scheduler::Scheduler;
use agentgate::state_machine::{StateEvent, StateMachine};
use agentgate::store::WorkOrderStore;
use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn agent_command_for(env_key: &str, default_cmd: &str) -> (String, Vec<String>) {
    match std::env::var(env_key) {
        Ok(raw) => {
            let mut parts = raw.split_whitespace().map(str::to_string);
            let cmd = parts.next().unwrap_or_else(|| default_cmd.to_string());
            (cmd, parts.collect())
        }
        Err(_) => (default_cmd.to_string(), Vec::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("starting AgentGate orchestration server");

    let config = Config::load()?;

    let store = Arc::new(WorkOrderStore::new(&config.store.data_dir).await?);
    match store.validate_storage().await {
        Ok(issues) if !issues.is_empty() => {
            for issue in &issues {
                tracing::warn!(?issue, "work-order store validation issue");
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("work-order store validation failed: {e}"),
    }

    let audit = Arc::new(AuditLog::new(config.audit.max_events));
    let state_machine = Arc::new(StateMachine::new(audit.clone(), config.retry.max_retries));
    let resource_monitor = ResourceMonitor::new(config.resource_monitor.clone());
    resource_monitor.start().await;

    let (retry_manager, mut retry_rx) = RetryManager::new(config.retry.clone());

    let mut drivers = DriverRegistry::new();
    for key in ["claude-code-subscription", "openai-codex", "opencode"] {
        let env_key = format!("AGENTGATE_AGENT_COMMAND_{}", key.to_uppercase().replace('-', "_"));
        let (command, args) = agent_command_for(&env_key, "true");
        drivers.register_agent_driver(key, Arc::new(LocalAgentDriver { command, args }));
    }
    drivers.register_gate_runner("verification-levels", Arc::new(VerificationGateRunner));
    drivers.register_gate_runner("custom-command", Arc::new(CustomCommandGateRunner));
    let drivers = Arc::new(drivers);

    let level_commands: HashMap<u8, Vec<String>> = std::env::var("AGENTGATE_VERIFY_COMMAND")
        .map(|cmd| HashMap::from([(0u8, vec![cmd])]))
        .unwrap_or_default();

    let services = EngineServices {
        vcs_adapter: Arc::new(GitVcsAdapter),
        snapshotter: Arc::new(GitSnapshotter),
        verifier: Arc::new(CommandVerifier { level_commands }),
        sandbox_provider: Arc::new(InProcessSandboxProvider),
        drivers: drivers.clone(),
    };

    let (engine, mut engine_rx) = Engine::new(
        config.engine.clone(),
        store.clone(),
        state_machine.clone(),
        resource_monitor.clone(),
        retry_manager.clone(),
        audit.clone(),
        services,
    );

    let (scheduler, mut scheduler_rx) = Scheduler::new(
        config.scheduler.clone(),
        store.clone(),
        resource_monitor.clone(),
        state_machine.clone(),
        audit.clone(),
    );

    let event_buffer = Arc::new(EventBuffer::new(
        config.events.max_events_per_work_order,
        config.events.max_total_events,
        config.events.retention_minutes,
    ));
    event_buffer.clone().start_cleanup(std::time::Duration::from_secs(60));
    let rate_limiter = Arc::new(RateLimiter::new(config.events.max_events_per_second, config.events.batch_window_ms));

    let state = AppState::new(
        Arc::new(config.api.clone()),
        store.clone(),
        engine.clone(),
        scheduler.clone(),
        resource_monitor.clone(),
        audit.clone(),
        event_buffer.clone(),
        rate_limiter.clone(),
    );

    // Fans every engine/scheduler stream event out to the buffer (for
    // catch-up replay), the rate limiter (for live `/ws` delivery), and the
    // run registry (the read-model behind `/runs`).
    {
        let event_buffer = event_buffer.clone();
        let rate_limiter = rate_limiter.clone();
        let runs = state.runs.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    Some(event) = engine_rx.recv() => event,
                    Some(event) = scheduler_rx.recv() => event,
                    else => break,
                };
                runs.apply(&event).await;
                event_buffer.push(event.clone()).await;
                rate_limiter.submit(event).await;
            }
        });
    }

    // Drains retry-due notifications back into the state machine, moving
    // the work order back to PENDING so the scheduler re-admits it.
    {
        let state_machine = state_machine.clone();
        let store = store.clone();
        tokio::spawn(async move {
            while let Some(due) = retry_rx.recv().await {
                let work_order = match store.load(&due.work_order_id).await {
                    Ok(wo) => wo,
                    Err(e) => {
                        tracing::warn!("retry due for unknown work order {}: {e}", due.work_order_id);
                        continue;
                    }
                };
                match state_machine.apply(&due.work_order_id, work_order.status, StateEvent::RetryDue, due.attempt).await {
                    Ok(next) => {
                        if let Err(e) = store.update_status(&due.work_order_id, next).await {
                            tracing::warn!("failed to persist retry-due transition for {}: {e}", due.work_order_id);
                        }
                    }
                    Err(e) => tracing::warn!("retry-due transition rejected for {}: {e}", due.work_order_id),
                }
            }
        });
    }

    let workspace_resolver: Arc<dyn WorkspaceResolver> = Arc::new(LocalOnlyWorkspaceResolver);

    {
        let engine = engine.clone();
        let workspace_resolver = workspace_resolver.clone();
        let on_admit: agentgate::scheduler::AdmissionCallback = Arc::new(move |work_order, slot| {
            let engine = engine.clone();
            let workspace_resolver = workspace_resolver.clone();
            tokio::spawn(async move {
                let workspace_path = match workspace_resolver.resolve(&work_order.workspace_source).await {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::error!("work order {} could not resolve a workspace: {e}", work_order.id);
                        return;
                    }
                };
                if let Err(e) = engine.execute_with_slot(work_order, workspace_path, Some(slot)).await {
                    tracing::error!("engine execution failed: {e}");
                }
            });
        });
        let engine = engine.clone();
        let on_force_cancel: agentgate::scheduler::ForceCancelCallback = Arc::new(move |work_order_id, reason| {
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.cancel_by_work_order(&work_order_id, &reason).await {
                    tracing::warn!("force-cancel failed for {work_order_id}: {e}");
                }
            });
        });
        scheduler.start(on_admit, on_force_cancel);
    }

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port).parse()?;
    let router = api::build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {addr}");

    let scheduler_for_shutdown = scheduler.clone();
    let server = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining in-flight runs");
        scheduler_for_shutdown.shutdown().await;
    });

    if let Err(e) = server.await {
        tracing::error!("server error: {e}");
    }

    Ok(())
}
