//! Layered configuration: embedded defaults, optional local file, then `AMP__*` environment variables.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::memory::TierPolicy;
use crate::planner::PlannerConfig;
use crate::resilience::{BreakerConfig, RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_target: bool,
    pub enable_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_target: false,
            enable_thread_ids: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    pub agent_timeout_ms: u64,
    pub selection_threshold: f64,
    pub max_competitors: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            agent_timeout_ms: 30_000,
            selection_threshold: 0.5,
            max_competitors: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub durable_provider: String, // "in_memory" or "sled"
    pub durable_path: Option<PathBuf>,
    pub cache_provider: String, // "in_memory" or "redis"
    pub cache_url: Option<String>,
    pub l0_capacity: usize,
    pub l1_capacity: usize,
    pub l1_ttl_secs: u64,
    pub l0_promotion_hits: u32,
    pub access_window_secs: u64,
    pub archive_after_days: u64,
    pub archive_sweep_interval_secs: u64,
    /// Directory for the file-system archive; in-memory when unset.
    pub archive_path: Option<PathBuf>,
    pub embedding_dim: usize,
    pub vector_capacity: usize,
    /// Upper bound on `top_k` for a single recall.
    pub max_recall_top_k: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            durable_provider: "in_memory".to_string(),
            durable_path: None,
            cache_provider: "in_memory".to_string(),
            cache_url: None,
            l0_capacity: 1_024,
            l1_capacity: 10_000,
            l1_ttl_secs: 900,
            l0_promotion_hits: 2,
            access_window_secs: 300,
            archive_after_days: 30,
            archive_sweep_interval_secs: 3_600,
            archive_path: None,
            embedding_dim: 256,
            vector_capacity: 100_000,
            max_recall_top_k: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub min_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub max_doublings: u32,
    pub max_attempts: u32,
    pub retry_poll_interval_ms: u64,
    /// Retry queue bound; requests past it are dead-lettered immediately.
    pub max_pending_retries: usize,
    /// Agent serving every agent that declares no fallback of its own.
    pub default_fallback: Option<String>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 60,
            min_backoff_ms: 1_000,
            max_backoff_secs: 600,
            max_doublings: 3,
            max_attempts: 5,
            retry_poll_interval_ms: 500,
            max_pending_retries: 1_000,
            default_fallback: Some("vertex-agent".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub log_events: bool,
    pub history_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            log_events: true,
            history_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_rate_limiting: bool,
    pub rate_limit_per_minute: u32,
    pub enable_cors: bool,
    pub allowed_origins: Vec<String>,
    pub max_request_size_mb: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_rate_limiting: true,
            rate_limit_per_minute: 600,
            enable_cors: false,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            max_request_size_mb: 5,
        }
    }
}

/// One statically declared agent, created from a registered class at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub memory: MemoryConfig,
    pub resilience: ResilienceConfig,
    pub events: EventsConfig,
    pub security: SecurityConfig,
    pub agents: Vec<AgentSpec>,
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(include_str!("../config.toml"), FileFormat::Toml))
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("AMP")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("security.allowed_origins")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration sources")?;

        let settings: Settings = config
            .try_deserialize()
            .context("Failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject startup misconfiguration.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        let o = &self.orchestrator;
        if o.max_concurrency == 0 {
            return Err(anyhow!("orchestrator.max_concurrency must be at least 1"));
        }
        if !(0.0..=1.0).contains(&o.selection_threshold) {
            return Err(anyhow!(
                "orchestrator.selection_threshold must be within [0, 1], got {}",
                o.selection_threshold
            ));
        }
        if o.agent_timeout_ms == 0 {
            return Err(anyhow!("orchestrator.agent_timeout_ms cannot be 0"));
        }

        let m = &self.memory;
        match m.cache_provider.as_str() {
            "in_memory" => {}
            "redis" if m.cache_url.is_none() => {
                return Err(anyhow!("Redis cache provider requires memory.cache_url (AMP__MEMORY__CACHE_URL)"));
            }
            "redis" => {}
            other => return Err(anyhow!("Unknown cache provider: {}", other)),
        }
        match m.durable_provider.as_str() {
            "in_memory" => warn!("Durable tier is in-memory; items will not survive a restart"),
            "sled" if m.durable_path.is_none() => {
                return Err(anyhow!("Sled durable provider requires memory.durable_path"));
            }
            "sled" => {}
            other => return Err(anyhow!("Unknown durable provider: {}", other)),
        }
        if m.l0_capacity == 0 || m.l1_capacity == 0 {
            return Err(anyhow!("memory tier capacities must be at least 1"));
        }
        if m.max_recall_top_k == 0 {
            return Err(anyhow!("memory.max_recall_top_k must be at least 1"));
        }

        let r = &self.resilience;
        if r.failure_threshold == 0 {
            return Err(anyhow!("resilience.failure_threshold must be at least 1"));
        }
        if r.max_attempts == 0 {
            return Err(anyhow!("resilience.max_attempts must be at least 1"));
        }
        if r.max_pending_retries == 0 {
            return Err(anyhow!("resilience.max_pending_retries must be at least 1"));
        }
        if Duration::from_secs(r.max_backoff_secs) < Duration::from_millis(r.min_backoff_ms) {
            return Err(anyhow!("resilience.max_backoff_secs is below min_backoff_ms"));
        }

        Ok(())
    }

    pub fn tier_policy(&self) -> TierPolicy {
        let m = &self.memory;
        TierPolicy {
            l0_capacity: m.l0_capacity,
            l1_ttl: Duration::from_secs(m.l1_ttl_secs),
            l0_promotion_hits: m.l0_promotion_hits,
            access_window: Duration::from_secs(m.access_window_secs),
            archive_after: Duration::from_secs(m.archive_after_days.saturating_mul(24 * 60 * 60)),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.resilience.failure_threshold,
            cooldown: Duration::from_secs(self.resilience.cooldown_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let r = &self.resilience;
        RetryPolicy {
            min_backoff: Duration::from_millis(r.min_backoff_ms),
            max_backoff: Duration::from_secs(r.max_backoff_secs),
            max_doublings: r.max_doublings,
            max_attempts: r.max_attempts,
            poll_interval: Duration::from_millis(r.retry_poll_interval_ms.max(1)),
            max_pending: r.max_pending_retries,
        }
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            max_concurrency: self.orchestrator.max_concurrency,
            max_competitors: self.orchestrator.max_competitors,
        }
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.orchestrator.agent_timeout_ms)
    }
}
