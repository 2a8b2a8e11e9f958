//! Retry queue for requests that hit a tripped circuit or timed out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AgentOutput, RequestContext};
use crate::error::{PlatformError, PlatformResult};
use crate::events::{EventPublisher, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Backoff stops doubling after this many attempts.
    pub max_doublings: u32,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    /// Queue bound; requests past it are dead-lettered on arrival.
    pub max_pending: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(600),
            max_doublings: 3,
            max_attempts: 5,
            poll_interval: Duration::from_millis(500),
            max_pending: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.min(self.max_doublings).min(31);
        self.min_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryTask {
    pub task_id: String,
    pub agent_id: String,
    pub payload: Value,
    pub request: RequestContext,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: String,
    #[serde(skip)]
    due: Instant,
}

impl RetryTask {
    fn schedule(&mut self, delay: Duration) {
        self.due = Instant::now() + delay;
        self.next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

/// Executes one retry attempt. Implemented by the resilient invoker.
#[async_trait]
pub trait RetryDispatcher: Send + Sync {
    async fn dispatch(&self, task: &RetryTask) -> PlatformResult<AgentOutput>;

    /// Time until `agent_id` will accept calls again, if it is currently refusing them.
    fn not_before(&self, agent_id: &str) -> Option<Duration>;
}

/// Counts from one pass over the due tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryRound {
    pub dispatched: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

pub struct RetryScheduler {
    policy: RetryPolicy,
    queue: Mutex<HashMap<String, RetryTask>>,
    events: EventPublisher,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy, events: EventPublisher) -> Self {
        Self {
            policy,
            queue: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Queues a request for later; the first retry waits at least `not_before`.
    ///
    /// A request already queued for the same agent and payload keeps its
    /// existing task, whose id is returned. Returns `None` when the queue is
    /// full; the request is dead-lettered instead.
    pub fn enqueue(
        &self,
        agent_id: &str,
        payload: Value,
        request: RequestContext,
        reason: &PlatformError,
        not_before: Option<Duration>,
    ) -> Option<String> {
        let mut queue = self.queue.lock();
        if let Some(existing) = queue
            .values_mut()
            .find(|t| t.agent_id == agent_id && t.payload == payload)
        {
            existing.last_error = reason.to_string();
            debug!("Retry {} for {} already queued", existing.task_id, agent_id);
            return Some(existing.task_id.clone());
        }
        if queue.len() >= self.policy.max_pending {
            drop(queue);
            warn!(
                "Retry queue full ({} tasks); dead-lettering request for {}",
                self.policy.max_pending, agent_id
            );
            self.events.emit(
                EventType::DeadLetter,
                Some(agent_id),
                json!({
                    "task_id": null,
                    "attempts": 0,
                    "reason": "retry queue full",
                    "last_error": reason.to_string(),
                    "payload": payload,
                }),
            );
            return None;
        }

        let delay = self
            .policy
            .backoff(0)
            .max(not_before.unwrap_or(Duration::ZERO));
        let mut task = RetryTask {
            task_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            payload,
            request,
            attempt_count: 0,
            max_attempts: self.policy.max_attempts,
            next_retry_at: Utc::now(),
            last_error: reason.to_string(),
            due: Instant::now(),
        };
        task.schedule(delay);

        let task_id = task.task_id.clone();
        self.events.emit(
            EventType::RetryScheduled,
            Some(agent_id),
            json!({ "task_id": task_id, "attempt": 0, "delay_ms": delay.as_millis() as u64 }),
        );
        debug!("Queued retry {} for {} in {:?}", task_id, agent_id, delay);
        queue.insert(task_id.clone(), task);
        Some(task_id)
    }

    /// Pushes every queued task for `agent_id` to at least `not_before` from now.
    pub fn reschedule_agent(&self, agent_id: &str, not_before: Duration) {
        let earliest = Instant::now() + not_before;
        let mut queue = self.queue.lock();
        for task in queue.values_mut().filter(|t| t.agent_id == agent_id) {
            if task.due < earliest {
                task.schedule(not_before);
            }
        }
    }

    /// Queued tasks, soonest first.
    pub fn pending(&self) -> Vec<RetryTask> {
        let mut tasks: Vec<RetryTask> = self.queue.lock().values().cloned().collect();
        tasks.sort_by_key(|t| t.due);
        tasks
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn take_due(&self) -> Vec<RetryTask> {
        let now = Instant::now();
        let mut queue = self.queue.lock();
        let due: Vec<String> = queue
            .values()
            .filter(|t| t.due <= now)
            .map(|t| t.task_id.clone())
            .collect();
        due.iter().filter_map(|id| queue.remove(id)).collect()
    }

    /// Dispatches every task that is due, concurrently, and waits for all of them.
    pub async fn process_due(&self, dispatcher: &dyn RetryDispatcher) -> RetryRound {
        let due = self.take_due();
        let mut round = RetryRound {
            dispatched: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return round;
        }

        let attempts = due.into_iter().map(|mut task| async move {
            task.attempt_count += 1;
            let result = dispatcher.dispatch(&task).await;
            (task, result)
        });

        for (mut task, result) in join_all(attempts).await {
            match result {
                Ok(_) => {
                    round.succeeded += 1;
                    info!("Retry {} for {} succeeded on attempt {}", task.task_id, task.agent_id, task.attempt_count);
                    self.events.emit(
                        EventType::RetrySucceeded,
                        Some(&task.agent_id),
                        json!({ "task_id": task.task_id, "attempt": task.attempt_count }),
                    );
                }
                Err(e) if task.attempt_count >= task.max_attempts => {
                    round.dead_lettered += 1;
                    warn!(
                        "Retry {} for {} exhausted after {} attempts: {}",
                        task.task_id, task.agent_id, task.attempt_count, e
                    );
                    let exhausted = PlatformError::RetryExhausted {
                        task_id: task.task_id.clone(),
                        agent_id: task.agent_id.clone(),
                        attempts: task.attempt_count,
                    };
                    self.events.emit(
                        EventType::DeadLetter,
                        Some(&task.agent_id),
                        json!({
                            "task_id": task.task_id,
                            "attempts": task.attempt_count,
                            "reason": exhausted.to_string(),
                            "last_error": e.to_string(),
                            "payload": task.payload,
                        }),
                    );
                }
                Err(e) => {
                    round.rescheduled += 1;
                    let delay = self
                        .policy
                        .backoff(task.attempt_count)
                        .max(dispatcher.not_before(&task.agent_id).unwrap_or(Duration::ZERO));
                    task.last_error = e.to_string();
                    task.schedule(delay);
                    self.events.emit(
                        EventType::RetryScheduled,
                        Some(&task.agent_id),
                        json!({
                            "task_id": task.task_id,
                            "attempt": task.attempt_count,
                            "delay_ms": delay.as_millis() as u64,
                        }),
                    );
                    self.queue.lock().insert(task.task_id.clone(), task);
                }
            }
        }
        round
    }

    /// Polls for due tasks until `cancel` fires. A pass already under way
    /// finishes before the loop exits.
    pub async fn run(self: Arc<Self>, dispatcher: Arc<dyn RetryDispatcher>, cancel: CancellationToken) {
        info!("Retry scheduler started");
        let mut ticker = tokio::time::interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let round = self.process_due(dispatcher.as_ref()).await;
                    if round.dispatched > 0 {
                        debug!(?round, "Retry pass finished");
                    }
                }
            }
        }
        info!("Retry scheduler stopped with {} task(s) pending", self.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HistorySink;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        succeed_on: Option<u32>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RetryDispatcher for Scripted {
        async fn dispatch(&self, task: &RetryTask) -> PlatformResult<AgentOutput> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(n) == self.succeed_on {
                Ok(AgentOutput::new(json!("ok")))
            } else {
                Err(PlatformError::AgentInvocation {
                    agent_id: task.agent_id.clone(),
                    reason: "still down".into(),
                })
            }
        }

        fn not_before(&self, _agent_id: &str) -> Option<Duration> {
            None
        }
    }

    fn scheduler() -> (RetryScheduler, Arc<HistorySink>, EventPublisher) {
        let history = Arc::new(HistorySink::new(64));
        let events = EventPublisher::new(vec![history.clone()]);
        (RetryScheduler::new(RetryPolicy::default(), events.clone()), history, events)
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..6).map(|a| policy.backoff(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);

        let tight = RetryPolicy {
            max_backoff: Duration::from_secs(3),
            ..Default::default()
        };
        assert_eq!(tight.backoff(5), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_dispatched_before_due() {
        let (scheduler, _, _) = scheduler();
        let dispatcher = Scripted { succeed_on: Some(1), calls: AtomicU32::new(0) };
        let err = PlatformError::CircuitOpen("echo".into());
        scheduler.enqueue("echo", json!({}), RequestContext::default(), &err, Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(scheduler.process_due(&dispatcher).await.dispatched, 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        let round = scheduler.process_due(&dispatcher).await;
        assert_eq!(round.succeeded, 1);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_emits_one_dead_letter() {
        let (scheduler, history, events) = scheduler();
        let dispatcher = Scripted { succeed_on: None, calls: AtomicU32::new(0) };
        let err = PlatformError::CircuitOpen("echo".into());
        scheduler.enqueue("echo", json!({"q": 1}), RequestContext::default(), &err, None);

        for _ in 0..20 {
            tokio::time::advance(Duration::from_secs(10)).await;
            scheduler.process_due(&dispatcher).await;
        }
        events.flush().await;

        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 5);
        assert_eq!(history.count(EventType::DeadLetter), 1);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_agent_defers_pending_tasks() {
        let (scheduler, _, _) = scheduler();
        let err = PlatformError::CircuitOpen("echo".into());
        scheduler.enqueue("echo", json!({}), RequestContext::default(), &err, None);
        scheduler.enqueue("other", json!({}), RequestContext::default(), &err, None);

        scheduler.reschedule_agent("echo", Duration::from_secs(60));
        let pending = scheduler.pending();
        assert_eq!(pending[0].agent_id, "other");
        assert_eq!(pending[1].agent_id, "echo");
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_request_keeps_one_task() {
        let (scheduler, history, events) = scheduler();
        let err = PlatformError::CircuitOpen("echo".into());
        let first = scheduler.enqueue("echo", json!({"q": 1}), RequestContext::default(), &err, None);
        let again = scheduler.enqueue("echo", json!({"q": 1}), RequestContext::default(), &err, None);
        let other = scheduler.enqueue("echo", json!({"q": 2}), RequestContext::default(), &err, None);

        assert!(first.is_some());
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(scheduler.len(), 2);

        events.flush().await;
        assert_eq!(history.count(EventType::RetryScheduled), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_dead_letters_new_requests() {
        let history = Arc::new(HistorySink::new(64));
        let events = EventPublisher::new(vec![history.clone()]);
        let scheduler = RetryScheduler::new(
            RetryPolicy {
                max_pending: 2,
                ..Default::default()
            },
            events.clone(),
        );
        let err = PlatformError::CircuitOpen("echo".into());
        for n in 0..2 {
            assert!(scheduler
                .enqueue("echo", json!({ "n": n }), RequestContext::default(), &err, None)
                .is_some());
        }

        let overflow = scheduler.enqueue("echo", json!({ "n": 2 }), RequestContext::default(), &err, None);
        assert!(overflow.is_none());
        assert_eq!(scheduler.len(), 2);

        events.flush().await;
        let dead = history.of_type(EventType::DeadLetter);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload["reason"], "retry queue full");
        assert_eq!(dead[0].payload["payload"], json!({ "n": 2 }));
    }
}
