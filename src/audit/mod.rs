//! Append-only Audit Log (`spec.md` §4.4): bounded, per-work-order indexed,
//! never stores a failure event with empty details.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Structured detail payload. Failure variants always carry message,
/// classification, and context so `details` is never empty.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditDetails {
    Transition { from: String, to: String, reason: String },
    InvalidTransition { from: String, event: String },
    Failure {
        message: String,
        classification: String,
        stack: Option<String>,
        exit_code: Option<i32>,
        context: String,
    },
    SlotAcquired { slot_id: String },
    SlotReleased { slot_id: String },
    StaleDetected { reason: String },
    Generic(serde_json::Value),
}

impl AuditDetails {
    fn is_empty(&self) -> bool {
        matches!(self, Self::Generic(serde_json::Value::Null))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: String,
    pub work_order_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub details: AuditDetails,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub work_order_id: Option<String>,
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

struct Inner {
    events: VecDeque<AuditEvent>,
    by_work_order: HashMap<String, VecDeque<String>>,
    max_events: usize,
}

pub struct AuditLog {
    inner: RwLock<Inner>,
}

impl AuditLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                events: VecDeque::new(),
                by_work_order: HashMap::new(),
                max_events,
            }),
        }
    }

    /// Appends an event, evicting the oldest event (and its per-work-order
    /// index entry) once `max_events` is crossed.
    pub async fn record(&self, work_order_id: &str, event_type: &str, details: AuditDetails) -> AuditEvent {
        debug_assert!(
            !(event_type.contains("fail") && details.is_empty()),
            "failure events must never carry empty details"
        );
        let event = AuditEvent {
            id: Uuid::new_v4().to_string(),
            work_order_id: work_order_id.to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            details,
        };
        let mut inner = self.inner.write().await;
        inner
            .by_work_order
            .entry(work_order_id.to_string())
            .or_default()
            .push_back(event.id.clone());
        inner.events.push_back(event.clone());
        if inner.events.len() > inner.max_events {
            if let Some(evicted) = inner.events.pop_front() {
                if let Some(ids) = inner.by_work_order.get_mut(&evicted.work_order_id) {
                    ids.retain(|id| id != &evicted.id);
                    if ids.is_empty() {
                        inner.by_work_order.remove(&evicted.work_order_id);
                    }
                }
            }
        }
        event
    }

    pub async fn get_work_order_timeline(&self, work_order_id: &str) -> Vec<AuditEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|e| e.work_order_id == work_order_id)
            .cloned()
            .collect()
    }

    pub async fn query(&self, filter: AuditFilter) -> Vec<AuditEvent> {
        let inner = self.inner.read().await;
        let mut results: Vec<AuditEvent> = inner
            .events
            .iter()
            .filter(|e| filter.work_order_id.as_deref().map(|id| id == e.work_order_id).unwrap_or(true))
            .filter(|e| filter.event_type.as_deref().map(|t| t == e.event_type).unwrap_or(true))
            .filter(|e| filter.since.map(|s| e.timestamp >= s).unwrap_or(true))
            .filter(|e| filter.until.map(|u| e.timestamp <= u).unwrap_or(true))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let start = results.len().saturating_sub(limit);
            results = results.split_off(start);
        }
        results
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.events.clear();
        inner.by_work_order.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_log_evicts_oldest_and_its_index_entry() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.record(
                "wo-1",
                "note",
                AuditDetails::Generic(serde_json::json!({ "i": i })),
            )
            .await;
        }
        assert_eq!(log.len().await, 3);
        let timeline = log.get_work_order_timeline("wo-1").await;
        assert_eq!(timeline.len(), 3);
    }

    #[tokio::test]
    async fn clear_then_query_is_empty() {
        let log = AuditLog::new(100);
        log.record("wo-1", "note", AuditDetails::Generic(serde_json::json!({}))).await;
        log.clear().await;
        let results = log.query(AuditFilter::default()).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn timeline_preserves_insertion_order() {
        let log = AuditLog::new(100);
        log.record("wo-1", "a", AuditDetails::Generic(serde_json::json!({}))).await;
        log.record("wo-1", "b", AuditDetails::Generic(serde_json::json!({}))).await;
        log.record("wo-1", "c", AuditDetails::Generic(serde_json::json!({}))).await;
        let timeline = log.get_work_order_timeline("wo-1").await;
        let names: Vec<_> = timeline.iter().map(|e| e.event_type.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
