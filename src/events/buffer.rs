//! Per-work-order ring buffer with a global LRU cap across all buffers
//! (`spec.md` §4.5 "Event Buffer").

use super::StreamEvent;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

struct WorkOrderBuffer {
    events: VecDeque<StreamEvent>,
    last_access: DateTime<Utc>,
}

struct Inner {
    buffers: HashMap<String, WorkOrderBuffer>,
    total_events: usize,
}

/// Bounds: `max_events_per_work_order` per ring, `max_total_events` summed
/// across all rings (enforced via LRU eviction of the least-recently
/// accessed buffer), and time-based cleanup via `retention_minutes`.
pub struct EventBuffer {
    inner: RwLock<Inner>,
    max_events_per_work_order: usize,
    max_total_events: usize,
    retention_minutes: i64,
    cleanup_task: RwLock<Option<JoinHandle<()>>>,
}

impl EventBuffer {
    pub fn new(max_events_per_work_order: usize, max_total_events: usize, retention_minutes: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                buffers: HashMap::new(),
                total_events: 0,
            }),
            max_events_per_work_order,
            max_total_events,
            retention_minutes: retention_minutes as i64,
            cleanup_task: RwLock::new(None),
        }
    }

    pub async fn push(&self, event: StreamEvent) {
        let work_order_id = event.work_order_id.clone();
        let mut inner = self.inner.write().await;
        {
            let buf = inner.buffers.entry(work_order_id.clone()).or_insert_with(|| WorkOrderBuffer {
                events: VecDeque::new(),
                last_access: Utc::now(),
            });
            buf.events.push_back(event);
            buf.last_access = Utc::now();
            if buf.events.len() > self.max_events_per_work_order {
                buf.events.pop_front();
            }
        }
        inner.total_events = inner.buffers.values().map(|b| b.events.len()).sum();
        if inner.total_events > self.max_total_events {
            Self::evict_lru(&mut inner);
        }
    }

    /// Evicts roughly half the events from the least-recently-accessed
    /// buffer; removes the buffer entirely if it drains.
    fn evict_lru(inner: &mut Inner) {
        let Some(target_id) = inner
            .buffers
            .iter()
            .min_by_key(|(_, buf)| buf.last_access)
            .map(|(id, _)| id.clone())
        else {
            return;
        };
        let mut drained = false;
        if let Some(buf) = inner.buffers.get_mut(&target_id) {
            let to_remove = buf.events.len() / 2;
            for _ in 0..to_remove {
                buf.events.pop_front();
            }
            drained = buf.events.is_empty();
        }
        if drained {
            inner.buffers.remove(&target_id);
        }
        inner.total_events = inner.buffers.values().map(|b| b.events.len()).sum();
    }

    pub async fn get_all(&self, work_order_id: &str, since: Option<DateTime<Utc>>) -> Vec<StreamEvent> {
        let mut inner = self.inner.write().await;
        let Some(buf) = inner.buffers.get_mut(work_order_id) else {
            return Vec::new();
        };
        buf.last_access = Utc::now();
        buf.events
            .iter()
            .filter(|e| since.map(|s| e.timestamp > s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn get_latest(&self, work_order_id: &str, n: usize) -> Vec<StreamEvent> {
        let mut inner = self.inner.write().await;
        let Some(buf) = inner.buffers.get_mut(work_order_id) else {
            return Vec::new();
        };
        buf.last_access = Utc::now();
        let len = buf.events.len();
        let start = len.saturating_sub(n);
        buf.events.iter().skip(start).cloned().collect()
    }

    pub async fn get_event_count(&self, work_order_id: &str) -> usize {
        self.inner
            .read()
            .await
            .buffers
            .get(work_order_id)
            .map(|b| b.events.len())
            .unwrap_or(0)
    }

    pub async fn clear(&self, work_order_id: &str) {
        let mut inner = self.inner.write().await;
        inner.buffers.remove(work_order_id);
        inner.total_events = inner.buffers.values().map(|b| b.events.len()).sum();
    }

    pub async fn clear_older_than(&self, cutoff: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        for buf in inner.buffers.values_mut() {
            buf.events.retain(|e| e.timestamp >= cutoff);
        }
        inner.buffers.retain(|_, buf| !buf.events.is_empty());
        inner.total_events = inner.buffers.values().map(|b| b.events.len()).sum();
    }

    /// Spawns the background cleanup loop; intended to run for the
    /// lifetime of the process.
    pub fn start_cleanup(self: std::sync::Arc<Self>, interval: std::time::Duration) {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let cutoff = Utc::now() - chrono::Duration::minutes(self.retention_minutes);
                self.clear_older_than(cutoff).await;
            }
        });
        // Fire-and-forget: stored so a future shutdown path could abort it;
        // dropping the guard here would cancel the task immediately.
        let task_slot = self.cleanup_task.try_write();
        if let Ok(mut slot) = task_slot {
            *slot = Some(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamEventPayload;

    fn event(work_order_id: &str) -> StreamEvent {
        StreamEvent::new(work_order_id, StreamEventPayload::Pong)
    }

    #[tokio::test]
    async fn caps_events_per_work_order() {
        let buf = EventBuffer::new(3, 1_000, 60);
        for _ in 0..5 {
            buf.push(event("wo-1")).await;
        }
        assert_eq!(buf.get_event_count("wo-1").await, 3);
    }

    #[tokio::test]
    async fn evicts_lru_buffer_on_global_overflow() {
        let buf = EventBuffer::new(100, 5, 60);
        for _ in 0..3 {
            buf.push(event("wo-old")).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        for _ in 0..3 {
            buf.push(event("wo-new")).await;
        }
        // total was 6 > max_total_events(5); the older buffer should have
        // been trimmed, not the newer one.
        let old_count = buf.get_event_count("wo-old").await;
        let new_count = buf.get_event_count("wo-new").await;
        assert!(old_count < 3);
        assert_eq!(new_count, 3);
    }

    #[tokio::test]
    async fn clear_older_than_drops_stale_events() {
        let buf = EventBuffer::new(100, 1_000, 60);
        buf.push(event("wo-1")).await;
        let future_cutoff = Utc::now() + chrono::Duration::seconds(1);
        buf.clear_older_than(future_cutoff).await;
        assert_eq!(buf.get_event_count("wo-1").await, 0);
    }
}
