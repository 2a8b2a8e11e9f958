//! Agent registry: descriptors, live instances and capability-based selection.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::agent::{
    Agent, AgentDescriptor, EchoAgent, MemoryAgent, RequestContext, VertexAgent,
};
use crate::error::{PlatformError, PlatformResult};
use crate::memory::Embedder;

/// Builds an agent instance from a JSON config.
pub type AgentFactory = Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn Agent>> + Send + Sync>;

pub fn factory<F>(f: F) -> AgentFactory
where
    F: Fn(&Value) -> anyhow::Result<Arc<dyn Agent>> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Registered {
    descriptor: AgentDescriptor,
    instance: Arc<dyn Agent>,
}

/// Constructed once and passed by reference; there is no global registry.
pub struct AgentRegistry {
    agents: DashMap<String, Registered>,
    classes: DashMap<String, AgentFactory>,
    /// Sequence number of each agent's last successful invocation.
    last_success: DashMap<String, u64>,
    success_seq: AtomicU64,
    threshold: f64,
}

impl AgentRegistry {
    pub fn new(threshold: f64) -> Self {
        Self {
            agents: DashMap::new(),
            classes: DashMap::new(),
            last_success: DashMap::new(),
            success_seq: AtomicU64::new(0),
            threshold,
        }
    }

    /// Registry with the `echo`, `memory` and `vertex` classes available to [`create`](Self::create).
    pub fn with_builtin_classes(threshold: f64, embedder: Arc<dyn Embedder>) -> Self {
        let registry = Self::new(threshold);
        registry.register_class("echo", factory(|_| Ok(Arc::new(EchoAgent::new()))));
        registry.register_class(
            "memory",
            factory(move |_| Ok(Arc::new(MemoryAgent::new(embedder.clone())))),
        );
        registry.register_class(
            "vertex",
            factory(|config| {
                let confidence = config
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(VertexAgent::DEFAULT_CONFIDENCE);
                Ok(Arc::new(VertexAgent::new(confidence)))
            }),
        );
        registry
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Registers (or replaces) an agent under `descriptor.id`.
    pub fn register(&self, descriptor: AgentDescriptor, instance: Arc<dyn Agent>) {
        let id = descriptor.id.clone();
        let replaced = self
            .agents
            .insert(id.clone(), Registered { descriptor, instance })
            .is_some();
        if replaced {
            info!("Replaced agent registration: {}", id);
        } else {
            info!("Registered agent: {}", id);
        }
    }

    pub fn register_class(&self, type_tag: impl Into<String>, factory: AgentFactory) {
        let tag = type_tag.into();
        debug!("Registered agent class: {}", tag);
        self.classes.insert(tag, factory);
    }

    /// Instantiates a registered class and registers the result under `id`.
    ///
    /// Recognised config keys: `fallback_of` (agent id this one substitutes
    /// for) and `name`.
    #[instrument(skip(self, config))]
    pub fn create(&self, type_tag: &str, id: &str, config: &Value) -> PlatformResult<Arc<dyn Agent>> {
        let factory = self
            .classes
            .get(type_tag)
            .map(|f| f.clone())
            .ok_or_else(|| PlatformError::UnknownAgentType(type_tag.to_string()))?;

        let instance = factory(config)
            .map_err(|e| PlatformError::Config(format!("agent '{}' ({}): {:#}", id, type_tag, e)))?;

        let mut descriptor = instance.descriptor(id);
        if let Some(name) = config.get("name").and_then(Value::as_str) {
            descriptor.name = name.to_string();
        }
        if let Some(target) = config.get("fallback_of").and_then(Value::as_str) {
            descriptor.fallback_of = Some(target.to_string());
        }

        self.register(descriptor, instance.clone());
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> PlatformResult<AgentDescriptor> {
        self.agents
            .get(id)
            .map(|r| r.descriptor.clone())
            .ok_or_else(|| PlatformError::AgentNotFound(id.to_string()))
    }

    pub fn instance(&self, id: &str) -> PlatformResult<Arc<dyn Agent>> {
        self.agents
            .get(id)
            .map(|r| r.instance.clone())
            .ok_or_else(|| PlatformError::AgentNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// All descriptors, ordered by id.
    pub fn list(&self) -> Vec<AgentDescriptor> {
        let mut all: Vec<AgentDescriptor> = self.agents.iter().map(|r| r.descriptor.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn list_by_capability(&self, tag: &str) -> Vec<AgentDescriptor> {
        self.list()
            .into_iter()
            .filter(|d| d.capability_set.contains(tag))
            .collect()
    }

    /// First agent (by id) declaring itself a fallback for `agent_id`.
    pub fn fallback_for(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.list()
            .into_iter()
            .find(|d| d.id != agent_id && d.fallback_of.as_deref() == Some(agent_id))
    }

    pub fn record_success(&self, agent_id: &str) {
        let seq = self.success_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_success.insert(agent_id.to_string(), seq);
    }

    /// Agents scoring at or above the threshold, best first.
    ///
    /// Equal scores prefer the most recent successful invocation, then the
    /// lower id.
    pub fn candidates(&self, ctx: &RequestContext) -> Vec<(AgentDescriptor, f64)> {
        let mut scored: Vec<(AgentDescriptor, f64, u64)> = self
            .list()
            .into_iter()
            .filter_map(|d| {
                let score = d.confidence(ctx);
                if score < self.threshold {
                    return None;
                }
                let seen = self.last_success.get(&d.id).map(|s| *s).unwrap_or(0);
                Some((d, score, seen))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.cmp(&a.2))
                .then(a.0.id.cmp(&b.0.id))
        });
        scored.into_iter().map(|(d, score, _)| (d, score)).collect()
    }

    pub fn select(&self, ctx: &RequestContext) -> PlatformResult<AgentDescriptor> {
        self.candidates(ctx)
            .into_iter()
            .next()
            .map(|(d, score)| {
                debug!("Selected agent '{}' with confidence {:.2}", d.id, score);
                d
            })
            .ok_or(PlatformError::NoCapableAgent {
                threshold: self.threshold,
            })
    }
}
