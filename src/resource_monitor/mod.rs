//! Resource Monitor (`spec.md` §4.2): bounded execution slots plus host
//! memory pressure sampling.

use crate::config::ResourceMonitorConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Opaque capability binding a work order to a reserved slot. Must be
/// released exactly once; `ResourceMonitor::release_slot` is idempotent so
/// a duplicate release is a no-op rather than a bug.
#[derive(Debug, Clone, Serialize)]
pub struct SlotHandle {
    pub id: String,
    pub work_order_id: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    None,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub available_memory_mb: u64,
    pub pressure: MemoryPressure,
    pub active_slots: usize,
    pub max_slots: usize,
    pub cpu_usage_percent: f32,
    pub healthy: bool,
}

struct MemorySample {
    total_mb: AtomicU64,
    used_mb: AtomicU64,
}

/// Tracks active slots and periodically samples host memory. Acquire and
/// release share a lock with the sampler so the two never observe a
/// torn view of `active` (`spec.md` §4.2 concurrency note).
pub struct ResourceMonitor {
    config: ResourceMonitorConfig,
    active: Mutex<Vec<SlotHandle>>,
    memory: MemorySample,
    running: AtomicBool,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(config: ResourceMonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            active: Mutex::new(Vec::new()),
            memory: MemorySample {
                total_mb: AtomicU64::new(16_384),
                used_mb: AtomicU64::new(2_048),
            },
            running: AtomicBool::new(false),
            sampler: Mutex::new(None),
        })
    }

    pub async fn acquire_slot(&self, work_order_id: &str) -> Option<SlotHandle> {
        let mut active = self.active.lock().await;
        if active.len() >= self.config.max_concurrent_slots {
            return None;
        }
        let available = self.available_memory_mb();
        if available < self.config.memory_per_slot_mb {
            return None;
        }
        let handle = SlotHandle {
            id: Uuid::new_v4().to_string(),
            work_order_id: work_order_id.to_string(),
            acquired_at: Utc::now(),
        };
        active.push(handle.clone());
        Some(handle)
    }

    /// Idempotent: releasing an already-released (or unknown) handle is a
    /// no-op, satisfying `release_slot(release_slot(h)) == release_slot(h)`.
    pub async fn release_slot(&self, handle: &SlotHandle) {
        let mut active = self.active.lock().await;
        active.retain(|h| h.id != handle.id);
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    fn available_memory_mb(&self) -> u64 {
        let total = self.memory.total_mb.load(Ordering::Relaxed);
        let used = self.memory.used_mb.load(Ordering::Relaxed);
        total.saturating_sub(used)
    }

    fn classify_pressure(total: u64, used: u64) -> MemoryPressure {
        if total == 0 {
            return MemoryPressure::Critical;
        }
        let ratio = used as f64 / total as f64;
        if ratio >= 0.95 {
            MemoryPressure::Critical
        } else if ratio >= 0.80 {
            MemoryPressure::Warning
        } else {
            MemoryPressure::None
        }
    }

    pub async fn get_health_report(&self) -> HealthReport {
        let total = self.memory.total_mb.load(Ordering::Relaxed);
        let used = self.memory.used_mb.load(Ordering::Relaxed);
        let pressure = Self::classify_pressure(total, used);
        let active = self.active.lock().await.len();
        HealthReport {
            total_memory_mb: total,
            used_memory_mb: used,
            available_memory_mb: total.saturating_sub(used),
            pressure,
            active_slots: active,
            max_slots: self.config.max_concurrent_slots,
            cpu_usage_percent: 0.0,
            healthy: pressure != MemoryPressure::Critical,
        }
    }

    /// Samples `/proc/meminfo` on Linux; falls back to a static estimate
    /// elsewhere so the monitor is still exercisable in tests.
    fn sample_host_memory() -> Option<(u64, u64)> {
        let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
        let mut total_kb = None;
        let mut available_kb = None;
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = rest.trim().split_whitespace().next()?.parse::<u64>().ok();
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                available_kb = rest.trim().split_whitespace().next()?.parse::<u64>().ok();
            }
        }
        let total = total_kb? / 1024;
        let available = available_kb? / 1024;
        Some((total, total.saturating_sub(available)))
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let interval = std::time::Duration::from_millis(this.config.poll_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while this.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if let Some((total, used)) = Self::sample_host_memory() {
                    this.memory.total_mb.store(total, Ordering::Relaxed);
                    this.memory.used_mb.store(used, Ordering::Relaxed);
                }
            }
        });
        *self.sampler.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.sampler.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_slots: usize, mem_per_slot: u64) -> ResourceMonitorConfig {
        ResourceMonitorConfig {
            max_concurrent_slots: max_slots,
            memory_per_slot_mb: mem_per_slot,
            poll_interval_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn acquire_fails_once_slots_exhausted() {
        let monitor = ResourceMonitor::new(config(1, 1));
        let first = monitor.acquire_slot("wo-1").await;
        assert!(first.is_some());
        let second = monitor.acquire_slot("wo-2").await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let monitor = ResourceMonitor::new(config(2, 1));
        let handle = monitor.acquire_slot("wo-1").await.unwrap();
        monitor.release_slot(&handle).await;
        monitor.release_slot(&handle).await;
        assert_eq!(monitor.active_count().await, 0);
    }

    #[tokio::test]
    async fn acquire_fails_under_memory_pressure() {
        let monitor = ResourceMonitor::new(config(10, 999_999));
        assert!(monitor.acquire_slot("wo-1").await.is_none());
    }

    #[test]
    fn pressure_thresholds_match_spec() {
        assert_eq!(ResourceMonitor::classify_pressure(100, 79), MemoryPressure::None);
        assert_eq!(ResourceMonitor::classify_pressure(100, 80), MemoryPressure::Warning);
        assert_eq!(ResourceMonitor::classify_pressure(100, 95), MemoryPressure::Critical);
    }
}
