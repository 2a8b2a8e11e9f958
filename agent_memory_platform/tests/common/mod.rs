//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use agent_memory_platform::agent::{Agent, AgentHealth, AgentOutput, InvocationContext, VertexAgent};
use agent_memory_platform::error::{StorageError, StorageResult};
use agent_memory_platform::events::{EventPublisher, EventSink, EventType, HistorySink};
use agent_memory_platform::memory::tier_manager::TierSet;
use agent_memory_platform::memory::{MemoryItem, StorageAdapter, Tier, TierManager, TierPolicy};
use agent_memory_platform::monitoring::AgentMetrics;
use agent_memory_platform::planner::{Planner, PlannerConfig};
use agent_memory_platform::registry::AgentRegistry;
use agent_memory_platform::resilience::{
    BreakerConfig, CircuitTable, ResilientInvoker, RetryPolicy, RetryScheduler,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Agent whose health, latency and score are controlled by the test.
pub struct ScriptedAgent {
    capabilities: Vec<String>,
    healthy: AtomicBool,
    delay_ms: AtomicU64,
    jitter_ms: u64,
    score: f64,
    pub calls: AtomicU32,
}

impl ScriptedAgent {
    pub fn new(capabilities: &[&str]) -> Self {
        Self {
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            healthy: AtomicBool::new(true),
            delay_ms: AtomicU64::new(0),
            jitter_ms: 0,
            score: 1.0,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    /// Adds a random delay of up to `max_ms` to every call.
    pub fn with_jitter(mut self, max_ms: u64) -> Self {
        self.jitter_ms = max_ms;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn agent_type(&self) -> &str {
        "test"
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn handle(&self, input: Value, ctx: InvocationContext) -> Result<AgentOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut delay = self.delay_ms.load(Ordering::SeqCst);
        if self.jitter_ms > 0 {
            delay += rand::thread_rng().gen_range(0..=self.jitter_ms);
        }
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if !self.healthy.load(Ordering::SeqCst) {
            return Err(anyhow!("{} is down", ctx.agent_id));
        }

        if let Some(writes) = input.get("set").and_then(Value::as_object) {
            for (key, value) in writes {
                ctx.scratch.set(key.clone(), value.clone());
            }
        }
        if let Some(merges) = input.get("merge").and_then(Value::as_object) {
            for (key, value) in merges {
                ctx.scratch.merge(key.clone(), value.clone());
            }
        }

        let mut upstream: Vec<&String> = ctx.upstream.keys().collect();
        upstream.sort();
        Ok(AgentOutput::new(json!({
            "agent": ctx.agent_id,
            "input": input,
            "upstream": upstream,
        }))
        .with_score(self.score))
    }

    async fn health_check(&self) -> Result<AgentHealth> {
        Ok(AgentHealth {
            status: if self.healthy.load(Ordering::SeqCst) { "healthy" } else { "down" }.to_string(),
            details: None,
            uptime_seconds: 0,
            total_requests: self.calls() as u64,
            error_count: 0,
        })
    }
}

/// Registry, breaker table, retry queue and invoker wired together without
/// background loops, so tests drive retries and time explicitly.
pub struct Harness {
    pub registry: Arc<AgentRegistry>,
    pub circuits: Arc<CircuitTable>,
    pub retries: Arc<RetryScheduler>,
    pub invoker: Arc<ResilientInvoker>,
    pub metrics: Arc<AgentMetrics>,
    pub memory: Arc<TierManager>,
    pub events: EventPublisher,
    pub history: Arc<HistorySink>,
}

impl Harness {
    pub fn new(timeout: Duration, default_fallback: Option<&str>) -> Self {
        let history = Arc::new(HistorySink::new(10_000));
        let events = EventPublisher::new(vec![history.clone() as Arc<dyn EventSink>]);
        let policy = TierPolicy::default();
        let memory = Arc::new(TierManager::new(TierSet::in_memory(&policy), policy, events.clone()));
        let registry = Arc::new(AgentRegistry::new(0.5));
        let circuits = Arc::new(CircuitTable::new(BreakerConfig::default()));
        let retries = Arc::new(RetryScheduler::new(RetryPolicy::default(), events.clone()));
        let metrics = Arc::new(AgentMetrics::new());
        let invoker = Arc::new(ResilientInvoker::new(
            registry.clone(),
            circuits.clone(),
            retries.clone(),
            metrics.clone(),
            events.clone(),
            memory.clone(),
            timeout,
            default_fallback.map(str::to_string),
        ));
        Self {
            registry,
            circuits,
            retries,
            invoker,
            metrics,
            memory,
            events,
            history,
        }
    }

    /// Harness with `vertex-agent` registered as the platform default fallback.
    pub fn with_vertex_fallback(timeout: Duration) -> Self {
        let harness = Self::new(timeout, Some("vertex-agent"));
        let vertex = Arc::new(VertexAgent::default());
        harness
            .registry
            .register(vertex.descriptor("vertex-agent"), vertex);
        harness
    }

    pub fn add(&self, id: &str, agent: ScriptedAgent) -> Arc<ScriptedAgent> {
        let agent = Arc::new(agent);
        self.registry.register(agent.descriptor(id), agent.clone());
        agent
    }

    pub fn planner(&self, config: PlannerConfig) -> Planner {
        Planner::new(self.registry.clone(), self.invoker.clone(), config)
    }

    /// Number of `event_type` events published so far.
    pub async fn count(&self, event_type: EventType) -> usize {
        self.events.flush().await;
        self.history.count(event_type)
    }
}

/// Wraps a tier adapter so tests can take it offline.
pub struct Switchable {
    inner: Arc<dyn StorageAdapter>,
    down: AtomicBool,
}

impl Switchable {
    pub fn new(inner: Arc<dyn StorageAdapter>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            down: AtomicBool::new(false),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> StorageResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::unreachable(self.inner.tier(), "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for Switchable {
    fn tier(&self) -> Tier {
        self.inner.tier()
    }

    async fn write(&self, item: &MemoryItem) -> StorageResult<()> {
        self.check()?;
        self.inner.write(item).await
    }

    async fn read(&self, id: &str) -> StorageResult<Option<MemoryItem>> {
        self.check()?;
        self.inner.read(id).await
    }

    async fn remove(&self, id: &str) -> StorageResult<()> {
        self.check()?;
        self.inner.remove(id).await
    }

    async fn similar(&self, embedding: &[f32], top_k: usize) -> StorageResult<Vec<(String, f32)>> {
        self.check()?;
        self.inner.similar(embedding, top_k).await
    }

    async fn scan(&self) -> StorageResult<Vec<MemoryItem>> {
        self.check()?;
        self.inner.scan().await
    }
}
