//! Service facade: builds every component from `Settings`, owns the background
//! loops and exposes invoke / remember / recall / circuit inspection.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentDescriptor, AgentHealth, AgentSummary, RequestContext};
use crate::error::{PlatformError, PlatformResult};
use crate::events::{EventPublisher, EventSink, HistorySink, PlatformEvent, TracingSink};
use crate::memory::adapter::{
    ArchiveAdapter, CacheAdapter, DurableAdapter, LocalAdapter, VectorAdapter,
};
use crate::memory::archive::{ArchiveBackend, FsArchive, InMemoryArchive};
use crate::memory::durable_store::{DurableBackend, InMemoryDurableStore, SledStore};
use crate::memory::fast_cache::{FastCacheBackend, InMemoryFastCache};
use crate::memory::tier_manager::{RecallHit, TierSet};
use crate::memory::vector_store::{VectorStore, VectorStoreConfig};
use crate::memory::{Embedder, HashEmbedder, MemoryItem, Tier, TierManager, TierStats};
use crate::monitoring::{AgentMetrics, AgentMetricsSnapshot};
use crate::planner::{ExecutionReport, Planner, SubTask, TaskRequest, TeamMode};
use crate::registry::AgentRegistry;
use crate::resilience::{
    CallContext, CircuitSnapshot, CircuitTable, Invocation, ResilientInvoker, RetryScheduler, RetryTask,
};
use crate::settings::Settings;

const DEFAULT_TOP_K: usize = 5;

/// Work submitted through [`Orchestrator::invoke`].
///
/// With no sub-tasks this is a single call to `agent` (or to the agent the
/// registry selects for the context). With sub-tasks it is planned and
/// executed as a team.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub mode: Option<TeamMode>,
    #[serde(default)]
    pub subtasks: Vec<SubTask>,
    /// Chain sub-tasks in declaration order.
    #[serde(default)]
    pub ordered: bool,
}

impl Task {
    pub fn single(agent: impl Into<String>, input: Value) -> Self {
        Self {
            agent: Some(agent.into()),
            input,
            ..Default::default()
        }
    }

    pub fn team(mode: TeamMode, subtasks: Vec<SubTask>) -> Self {
        Self {
            mode: Some(mode),
            subtasks,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Single(Invocation),
    Plan(ExecutionReport),
}

/// Optional placement for [`Orchestrator::remember_with`].
#[derive(Debug, Clone, Default)]
pub struct RememberOptions {
    pub metadata: HashMap<String, String>,
    pub tier: Option<Tier>,
    pub ttl: Option<Duration>,
    /// Used instead of the embedder's vector.
    pub embedding: Option<Vec<f32>>,
}

pub struct Orchestrator {
    settings: Settings,
    memory: Arc<TierManager>,
    registry: Arc<AgentRegistry>,
    circuits: Arc<CircuitTable>,
    retries: Arc<RetryScheduler>,
    invoker: Arc<ResilientInvoker>,
    planner: Planner,
    metrics: Arc<AgentMetrics>,
    embedder: Arc<dyn Embedder>,
    events: EventPublisher,
    history: Arc<HistorySink>,
    shutdown: CancellationToken,
    background: TaskTracker,
}

impl Orchestrator {
    /// Builds the configured storage back-ends and starts the platform.
    #[instrument(skip(settings))]
    pub async fn new(settings: Settings) -> Result<Self> {
        let tiers = build_tiers(&settings)
            .await
            .context("Failed to initialize memory tiers")?;
        Self::with_tiers(settings, tiers)
    }

    /// Starts the platform over caller-supplied tier adapters.
    ///
    /// Must be called inside a tokio runtime; the retry scheduler and archive
    /// sweep are spawned here.
    pub fn with_tiers(settings: Settings, tiers: TierSet) -> Result<Self> {
        settings.validate()?;

        let history = Arc::new(HistorySink::new(settings.events.history_capacity));
        let mut sinks: Vec<Arc<dyn EventSink>> = vec![history.clone()];
        if settings.events.log_events {
            sinks.push(Arc::new(TracingSink));
        }
        let events = EventPublisher::new(sinks);

        let memory = Arc::new(TierManager::new(tiers, settings.tier_policy(), events.clone()));
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(settings.memory.embedding_dim));
        let registry = Arc::new(AgentRegistry::with_builtin_classes(
            settings.orchestrator.selection_threshold,
            embedder.clone(),
        ));
        for entry in &settings.agents {
            registry
                .create(&entry.type_tag, &entry.id, &entry.config)
                .with_context(|| format!("Failed to create agent '{}'", entry.id))?;
        }
        if let Some(fallback) = &settings.resilience.default_fallback {
            if !registry.contains(fallback) {
                warn!("Default fallback '{}' is not a registered agent", fallback);
            }
        }

        let circuits = Arc::new(CircuitTable::new(settings.breaker_config()));
        let retries = Arc::new(RetryScheduler::new(settings.retry_policy(), events.clone()));
        let metrics = Arc::new(AgentMetrics::new());
        let invoker = Arc::new(ResilientInvoker::new(
            registry.clone(),
            circuits.clone(),
            retries.clone(),
            metrics.clone(),
            events.clone(),
            memory.clone(),
            settings.agent_timeout(),
            settings.resilience.default_fallback.clone(),
        ));
        let planner = Planner::new(registry.clone(), invoker.clone(), settings.planner_config());

        let shutdown = CancellationToken::new();
        let background = TaskTracker::new();
        background.spawn(retries.clone().run(invoker.clone(), shutdown.clone()));
        background.spawn(archive_sweep(
            memory.clone(),
            Duration::from_secs(settings.memory.archive_sweep_interval_secs.max(1)),
            shutdown.clone(),
        ));

        info!(
            "Orchestrator ready with {} agent(s): {}",
            registry.list().len(),
            registry.list().iter().map(|d| d.id.as_str()).collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            settings,
            memory,
            registry,
            circuits,
            retries,
            invoker,
            planner,
            metrics,
            embedder,
            events,
            history,
            shutdown,
            background,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> &Arc<TierManager> {
        &self.memory
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Runs a single call or a team plan.
    #[instrument(skip(self, task, context), fields(agent_id = task.agent.as_deref().unwrap_or("-")))]
    pub async fn invoke(&self, task: Task, context: RequestContext) -> PlatformResult<Response> {
        if !task.subtasks.is_empty() {
            let request = TaskRequest {
                id: Uuid::new_v4().to_string(),
                mode: task.mode.unwrap_or_default(),
                subtasks: task.subtasks,
                context,
                ordered: task.ordered,
            };
            let mut plan = self.planner.plan(request)?;
            let report = self.planner.execute(&mut plan).await?;
            return Ok(Response::Plan(report));
        }

        let agent_id = match task.agent {
            Some(agent_id) => agent_id,
            None => self.registry.select(&context)?.id,
        };
        let invocation = self
            .invoker
            .invoke(&agent_id, task.input, CallContext::new(context))
            .await?;
        Ok(Response::Single(invocation))
    }

    /// Stores text for the context's session and returns its id.
    pub async fn remember(
        &self,
        context: &RequestContext,
        content: &str,
        metadata: Option<HashMap<String, String>>,
    ) -> PlatformResult<String> {
        let options = RememberOptions {
            metadata: metadata.unwrap_or_default(),
            ..Default::default()
        };
        self.remember_with(context, content, options).await
    }

    #[instrument(skip(self, context, content, options))]
    pub async fn remember_with(
        &self,
        context: &RequestContext,
        content: &str,
        options: RememberOptions,
    ) -> PlatformResult<String> {
        let embedding = options
            .embedding
            .unwrap_or_else(|| self.embedder.embed(content));
        let mut item = MemoryItem::text(content).with_embedding(embedding);
        item.metadata = options.metadata;
        if let Some(session) = &context.session_id {
            item = item.with_owner(session);
        }
        if let Some(ttl) = options.ttl {
            item = item.with_ttl(ttl);
        }
        self.memory.put(item, options.tier).await
    }

    /// Items most similar to `query`, best first.
    pub async fn recall(
        &self,
        context: &RequestContext,
        query: &str,
        top_k: Option<usize>,
    ) -> PlatformResult<Vec<MemoryItem>> {
        Ok(self
            .recall_scored(context, query, top_k)
            .await?
            .into_iter()
            .map(|hit| hit.item)
            .collect())
    }

    /// As [`recall`](Self::recall), with scores and the tier each item came from.
    ///
    /// A context with a session only sees items owned by that session or by nobody.
    /// `top_k` is capped at `memory.max_recall_top_k`.
    #[instrument(skip(self, context, query))]
    pub async fn recall_scored(
        &self,
        context: &RequestContext,
        query: &str,
        top_k: Option<usize>,
    ) -> PlatformResult<Vec<RecallHit>> {
        let top_k = top_k
            .unwrap_or(DEFAULT_TOP_K)
            .min(self.settings.memory.max_recall_top_k);
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(query);

        let Some(session) = &context.session_id else {
            return self.memory.recall(&embedding, top_k).await;
        };
        let mut hits = self.memory.recall(&embedding, top_k.saturating_mul(4)).await?;
        hits.retain(|hit| {
            hit.item
                .owner_ref
                .as_deref()
                .map_or(true, |owner| owner == session)
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    pub async fn get_memory(&self, id: &str) -> PlatformResult<MemoryItem> {
        self.memory.get(id).await
    }

    pub async fn delete_memory(&self, id: &str) -> PlatformResult<()> {
        self.memory.delete(id).await
    }

    /// Circuit snapshot for a registered agent.
    pub fn get_circuit_status(&self, agent_id: &str) -> PlatformResult<CircuitSnapshot> {
        if !self.registry.contains(agent_id) {
            return Err(PlatformError::AgentNotFound(agent_id.to_string()));
        }
        Ok(self.circuits.snapshot(agent_id))
    }

    /// Snapshot of every registered agent's circuit.
    pub fn circuits(&self) -> Vec<CircuitSnapshot> {
        self.registry
            .list()
            .iter()
            .map(|d| self.circuits.snapshot(&d.id))
            .collect()
    }

    pub fn list_agents(&self) -> Vec<AgentSummary> {
        self.registry.list().iter().map(AgentDescriptor::summary).collect()
    }

    pub fn create_agent(&self, type_tag: &str, id: &str, config: &Value) -> PlatformResult<AgentSummary> {
        self.registry.create(type_tag, id, config)?;
        Ok(self.registry.get(id)?.summary())
    }

    pub fn register_agent(&self, descriptor: AgentDescriptor, instance: Arc<dyn Agent>) {
        self.registry.register(descriptor, instance);
    }

    /// Self-reported health of every registered agent, keyed by id.
    pub async fn agent_health(&self) -> BTreeMap<String, AgentHealth> {
        let mut report = BTreeMap::new();
        for descriptor in self.registry.list() {
            let Ok(agent) = self.registry.instance(&descriptor.id) else {
                continue;
            };
            let health = agent.health_check().await.unwrap_or_else(|e| {
                warn!("Health check for {} failed: {:#}", descriptor.id, e);
                AgentHealth::unreachable(e.to_string())
            });
            report.insert(descriptor.id, health);
        }
        report
    }

    pub fn agent_metrics(&self) -> Vec<AgentMetricsSnapshot> {
        self.metrics.snapshots()
    }

    pub fn pending_retries(&self) -> Vec<RetryTask> {
        self.retries.pending()
    }

    /// Newest last.
    pub fn recent_events(&self, limit: usize) -> Vec<PlatformEvent> {
        self.history.recent(limit)
    }

    pub fn memory_stats(&self) -> TierStats {
        self.memory.stats()
    }

    /// Stops the background loops, letting in-flight work finish, then drains
    /// pending mirror writes and events.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.shutdown.cancel();
        self.background.close();
        self.background.wait().await;
        self.memory.flush().await;
        self.events.flush().await;
        info!("Orchestrator stopped");
    }
}

async fn archive_sweep(memory: Arc<TierManager>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = memory.archive_inactive().await {
                    error!("Archive sweep failed: {}", e);
                }
            }
        }
    }
}

async fn build_tiers(settings: &Settings) -> Result<TierSet> {
    let m = &settings.memory;
    let policy = settings.tier_policy();

    let cache: Arc<dyn FastCacheBackend> = match m.cache_provider.as_str() {
        #[cfg(feature = "with-redis")]
        "redis" => {
            let url = m
                .cache_url
                .as_deref()
                .ok_or_else(|| anyhow!("memory.cache_url is required for the redis cache"))?;
            Arc::new(crate::memory::fast_cache::RedisFastCache::connect(url).await?)
        }
        #[cfg(not(feature = "with-redis"))]
        "redis" => return Err(anyhow!("Redis cache provider requires the `with-redis` feature")),
        _ => Arc::new(InMemoryFastCache::new(m.l1_capacity)),
    };

    let durable: Arc<dyn DurableBackend> = match m.durable_provider.as_str() {
        "sled" => {
            let path = m
                .durable_path
                .as_ref()
                .ok_or_else(|| anyhow!("memory.durable_path is required for the sled store"))?;
            Arc::new(SledStore::open(path)?)
        }
        _ => Arc::new(InMemoryDurableStore::new()),
    };

    let vectors = VectorStore::new(VectorStoreConfig {
        max_entries: m.vector_capacity,
        embedding_dim: m.embedding_dim,
        ..Default::default()
    });

    let archive: Arc<dyn ArchiveBackend> = match &m.archive_path {
        Some(root) => Arc::new(FsArchive::open(root).await?),
        None => Arc::new(InMemoryArchive::new()),
    };

    Ok(TierSet {
        l0: Arc::new(LocalAdapter::new(m.l0_capacity)),
        l1: Arc::new(CacheAdapter::new(cache, policy.l1_ttl)),
        l2: Arc::new(DurableAdapter::new(durable)),
        l3: Arc::new(VectorAdapter::new(Arc::new(vectors))),
        l4: Arc::new(ArchiveAdapter::new(archive)),
    })
}
