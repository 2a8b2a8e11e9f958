use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::memory::{Embedder, MemoryItem, TierManager};

/// Agent trait; implementations receive their memory handle and cancellation
/// signal through [`InvocationContext`].
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    fn agent_type(&self) -> &str;
    fn capabilities(&self) -> Vec<String>;
    async fn handle(&self, input: Value, ctx: InvocationContext) -> Result<AgentOutput>;
    async fn health_check(&self) -> Result<AgentHealth>;

    /// Descriptor used when the agent is registered under `id`.
    fn descriptor(&self, id: &str) -> AgentDescriptor {
        AgentDescriptor::new(id, self.name()).with_capabilities(self.capabilities())
    }
}

/// Agent health information
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub error_count: u64,
}

impl AgentHealth {
    pub fn unreachable(details: impl Into<String>) -> Self {
        Self {
            status: "unreachable".to_string(),
            details: Some(details.into()),
            uptime_seconds: 0,
            total_requests: 0,
            error_count: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// What an agent produced. `score` ranks competing responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentOutput {
    pub content: Value,
    pub score: f64,
}

impl AgentOutput {
    pub fn new(content: Value) -> Self {
        Self { content, score: 1.0 }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }
}

/// Caller-side description of a request, scored by each agent's confidence function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub hints: HashMap<String, String>,
}

impl RequestContext {
    pub fn with_capabilities<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Shared key/value context for collaborating steps.
///
/// Plain writes are last-writer-wins per key; `merge` folds a value into the
/// existing one atomically.
#[derive(Clone, Default)]
pub struct Scratchpad {
    entries: Arc<DashMap<String, Value>>,
}

impl Scratchpad {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    /// Objects merge per field, arrays concatenate, anything else replaces.
    pub fn merge(&self, key: impl Into<String>, value: Value) {
        match self.entries.entry(key.into()) {
            Entry::Occupied(mut existing) => merge_values(existing.get_mut(), value),
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

impl fmt::Debug for Scratchpad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scratchpad")
            .field("keys", &self.entries.len())
            .finish()
    }
}

fn merge_values(current: &mut Value, incoming: Value) {
    match (current, incoming) {
        (Value::Object(current), Value::Object(incoming)) => {
            for (k, v) in incoming {
                match current.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        current.insert(k, v);
                    }
                }
            }
        }
        (Value::Array(current), Value::Array(incoming)) => current.extend(incoming),
        (current, incoming) => *current = incoming,
    }
}

/// Everything an agent sees besides its input.
#[derive(Clone)]
pub struct InvocationContext {
    /// Registry id the agent was invoked under.
    pub agent_id: String,
    pub request: RequestContext,
    pub memory: Arc<TierManager>,
    pub scratch: Scratchpad,
    /// Outputs of completed upstream steps, keyed by step id.
    pub upstream: HashMap<String, Value>,
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl InvocationContext {
    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(anyhow!("invocation of '{}' was cancelled", self.agent_id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statefulness {
    Stateless,
    Stateful,
}

pub type ConfidenceFn = Arc<dyn Fn(&RequestContext) -> f64 + Send + Sync>;

/// Registration record for an agent.
///
/// Without an explicit confidence function, confidence is the share of the
/// requested capabilities this agent declares.
#[derive(Clone)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub capability_set: BTreeSet<String>,
    pub confidence_fn: Option<ConfidenceFn>,
    pub statefulness: Statefulness,
    pub fallback_of: Option<String>,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capability_set: BTreeSet::new(),
            confidence_fn: None,
            statefulness: Statefulness::Stateless,
            fallback_of: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capability_set
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_confidence<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> f64 + Send + Sync + 'static,
    {
        self.confidence_fn = Some(Arc::new(f));
        self
    }

    pub fn stateful(mut self) -> Self {
        self.statefulness = Statefulness::Stateful;
        self
    }

    pub fn fallback_for(mut self, agent_id: impl Into<String>) -> Self {
        self.fallback_of = Some(agent_id.into());
        self
    }

    /// Confidence in `[0, 1]`; non-finite scores count as zero.
    pub fn confidence(&self, ctx: &RequestContext) -> f64 {
        let raw = match &self.confidence_fn {
            Some(f) => f(ctx),
            None => self.capability_overlap(ctx),
        };
        if raw.is_finite() {
            raw.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    fn capability_overlap(&self, ctx: &RequestContext) -> f64 {
        if ctx.capabilities.is_empty() {
            return 0.0;
        }
        let matched = ctx
            .capabilities
            .iter()
            .filter(|c| self.capability_set.contains(c.as_str()))
            .count();
        matched as f64 / ctx.capabilities.len() as f64
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            capabilities: self.capability_set.iter().cloned().collect(),
            statefulness: self.statefulness,
            fallback_of: self.fallback_of.clone(),
        }
    }
}

impl fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capability_set", &self.capability_set)
            .field("statefulness", &self.statefulness)
            .field("fallback_of", &self.fallback_of)
            .finish()
    }
}

/// Serializable view of a descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub statefulness: Statefulness,
    pub fallback_of: Option<String>,
}

struct Counters {
    requests: AtomicU64,
    errors: AtomicU64,
    started: std::time::Instant,
}

impl Counters {
    fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: std::time::Instant::now(),
        }
    }

    fn health(&self) -> AgentHealth {
        AgentHealth {
            status: "healthy".to_string(),
            details: None,
            uptime_seconds: self.started.elapsed().as_secs(),
            total_requests: self.requests.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
        }
    }
}

// --- Built-in Agents ---

/// Returns its input along with the ids of upstream outputs it saw.
pub struct EchoAgent {
    counters: Counters,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self {
            counters: Counters::new(),
        }
    }
}

impl Default for EchoAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    fn agent_type(&self) -> &str {
        "utility"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["text_echo".to_string(), "testing".to_string()]
    }

    async fn handle(&self, input: Value, ctx: InvocationContext) -> Result<AgentOutput> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        ctx.ensure_active()?;

        let mut upstream: Vec<&String> = ctx.upstream.keys().collect();
        upstream.sort();
        debug!("Echo agent '{}' processed request", ctx.agent_id);
        Ok(AgentOutput::new(json!({
            "agent": ctx.agent_id,
            "echo": input,
            "upstream": upstream,
        })))
    }

    async fn health_check(&self) -> Result<AgentHealth> {
        Ok(self.counters.health())
    }
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum MemoryOp {
    Remember {
        content: String,
        #[serde(default)]
        metadata: HashMap<String, String>,
    },
    Recall {
        query: String,
        #[serde(default = "default_top_k")]
        top_k: usize,
    },
    Note {
        key: String,
        value: Value,
    },
}

fn default_top_k() -> usize {
    5
}

/// Reads and writes agent memory through the tier manager.
///
/// Input is `{"op": "remember" | "recall" | "note", ...}`; `note` merges a
/// value into the shared scratch context.
pub struct MemoryAgent {
    embedder: Arc<dyn Embedder>,
    counters: Counters,
}

impl MemoryAgent {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            counters: Counters::new(),
        }
    }
}

#[async_trait]
impl Agent for MemoryAgent {
    fn name(&self) -> &str {
        "memory"
    }

    fn agent_type(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> Vec<String> {
        vec![
            "memory_write".to_string(),
            "memory_recall".to_string(),
            "notes".to_string(),
        ]
    }

    fn descriptor(&self, id: &str) -> AgentDescriptor {
        AgentDescriptor::new(id, self.name())
            .with_capabilities(self.capabilities())
            .stateful()
    }

    #[instrument(skip(self, input, ctx), fields(agent_id = %ctx.agent_id))]
    async fn handle(&self, input: Value, ctx: InvocationContext) -> Result<AgentOutput> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        ctx.ensure_active()?;

        let op: MemoryOp = serde_json::from_value(input).map_err(|e| {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            anyhow!("Invalid memory agent input: {}", e)
        })?;

        let content = match op {
            MemoryOp::Remember { content, metadata } => {
                let mut item = MemoryItem::text(&content).with_embedding(self.embedder.embed(&content));
                if let Some(session) = &ctx.request.session_id {
                    item = item.with_owner(session);
                }
                item.metadata = metadata;
                let id = ctx
                    .memory
                    .put(item, None)
                    .await
                    .context("remember failed")?;
                info!("Memory agent stored {}", id);
                json!({ "memory_id": id })
            }
            MemoryOp::Recall { query, top_k } => {
                let hits = ctx
                    .memory
                    .recall(&self.embedder.embed(&query), top_k)
                    .await
                    .context("recall failed")?;
                let items: Vec<Value> = hits
                    .iter()
                    .map(|hit| {
                        json!({
                            "id": hit.item.id,
                            "text": hit.item.content.as_text(),
                            "score": hit.score,
                            "tier": hit.source,
                        })
                    })
                    .collect();
                json!({ "results": items })
            }
            MemoryOp::Note { key, value } => {
                ctx.scratch.merge(&key, value);
                json!({ "noted": key })
            }
        };
        Ok(AgentOutput::new(content))
    }

    async fn health_check(&self) -> Result<AgentHealth> {
        Ok(self.counters.health())
    }
}

/// General-purpose agent that answers anything at a fixed, modest confidence.
///
/// Used as the platform-wide fallback when an agent declares none of its own.
pub struct VertexAgent {
    confidence: f64,
    counters: Counters,
}

impl VertexAgent {
    pub const DEFAULT_CONFIDENCE: f64 = 0.3;

    pub fn new(confidence: f64) -> Self {
        Self {
            confidence: confidence.clamp(0.0, 1.0),
            counters: Counters::new(),
        }
    }
}

impl Default for VertexAgent {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CONFIDENCE)
    }
}

#[async_trait]
impl Agent for VertexAgent {
    fn name(&self) -> &str {
        "vertex"
    }

    fn agent_type(&self) -> &str {
        "general"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["general".to_string()]
    }

    fn descriptor(&self, id: &str) -> AgentDescriptor {
        let confidence = self.confidence;
        AgentDescriptor::new(id, self.name())
            .with_capabilities(self.capabilities())
            .with_confidence(move |_| confidence)
    }

    async fn handle(&self, input: Value, ctx: InvocationContext) -> Result<AgentOutput> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        ctx.ensure_active()?;

        let prompt = match &input {
            Value::String(s) => s.clone(),
            other => other
                .get("prompt")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| ctx.request.text.clone()),
        };

        Ok(AgentOutput::new(json!({
            "agent": ctx.agent_id,
            "answer": format!("General response to: {}", prompt),
            "input": input,
        }))
        .with_score(self.confidence))
    }

    async fn health_check(&self) -> Result<AgentHealth> {
        Ok(self.counters.health())
    }
}
