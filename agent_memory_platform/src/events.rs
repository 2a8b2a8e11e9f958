//! Structured platform events and the fire-and-forget publisher that fans them out to sinks.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentInvocationFailed,
    CircuitOpened,
    CircuitHalfOpened,
    CircuitClosed,
    FallbackActivated,
    RetryScheduled,
    RetrySucceeded,
    DeadLetter,
    TierDegraded,
    MemoryArchived,
    MemoryRestored,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentInvocationFailed => "agent_invocation_failed",
            EventType::CircuitOpened => "circuit_opened",
            EventType::CircuitHalfOpened => "circuit_half_opened",
            EventType::CircuitClosed => "circuit_closed",
            EventType::FallbackActivated => "fallback_activated",
            EventType::RetryScheduled => "retry_scheduled",
            EventType::RetrySucceeded => "retry_succeeded",
            EventType::DeadLetter => "dead_letter",
            EventType::TierDegraded => "tier_degraded",
            EventType::MemoryArchived => "memory_archived",
            EventType::MemoryRestored => "memory_restored",
        }
    }

    /// Events that signal something an operator should look at.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            EventType::CircuitOpened | EventType::DeadLetter | EventType::TierDegraded
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub agent_id: Option<String>,
    pub payload: Value,
}

impl PlatformEvent {
    pub fn new(event_type: EventType, agent_id: Option<&str>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            agent_id: agent_id.map(str::to_string),
            payload,
        }
    }
}

/// Destination for published events.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;
    async fn publish(&self, event: &PlatformEvent) -> Result<()>;
}

/// Writes each event as a structured log line.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn publish(&self, event: &PlatformEvent) -> Result<()> {
        let agent = event.agent_id.as_deref().unwrap_or("-");
        if event.event_type.is_alert() {
            warn!(event = %event.event_type, agent, payload = %event.payload, "platform event");
        } else {
            info!(event = %event.event_type, agent, payload = %event.payload, "platform event");
        }
        Ok(())
    }
}

/// Bounded ring of the most recent events.
pub struct HistorySink {
    capacity: usize,
    events: Mutex<VecDeque<PlatformEvent>>,
}

impl HistorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Newest last.
    pub fn recent(&self, limit: usize) -> Vec<PlatformEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<PlatformEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for HistorySink {
    fn name(&self) -> &str {
        "history"
    }

    async fn publish(&self, event: &PlatformEvent) -> Result<()> {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }
}

enum Command {
    Publish(PlatformEvent),
    Flush(oneshot::Sender<()>),
}

/// Cheap, cloneable handle; `publish` never blocks and never drops.
///
/// Events go onto an unbounded channel drained by a background task that
/// delivers them to every sink in publication order. The task ends once every
/// handle has been dropped.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<Command>,
    published: Arc<AtomicU64>,
}

impl EventPublisher {
    /// Spawns the delivery task; must be called inside a tokio runtime.
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(rx, sinks));
        Self {
            tx,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, event: PlatformEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(Command::Publish(event)).is_err() {
            debug!("Event dispatcher has stopped; event discarded");
        }
    }

    pub fn emit(&self, event_type: EventType, agent_id: Option<&str>, payload: Value) {
        self.publish(PlatformEvent::new(event_type, agent_id, payload));
    }

    /// Resolves once every event published before the call reached the sinks.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<Command>, sinks: Vec<Arc<dyn EventSink>>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Publish(event) => {
                for sink in &sinks {
                    if let Err(e) = sink.publish(&event).await {
                        warn!("Event sink '{}' rejected {}: {}", sink.name(), event.event_type, e);
                    }
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Event dispatcher stopped");
}
