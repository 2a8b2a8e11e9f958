//! Error taxonomy shared by the memory, registry, planning and resilience layers.

use thiserror::Error;

use crate::memory::Tier;

/// Errors surfaced by platform operations.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("authoritative storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("memory item '{0}' not found")]
    NotFound(String),

    #[error("agent '{0}' not found in registry")]
    AgentNotFound(String),

    #[error("unknown agent type '{0}'")]
    UnknownAgentType(String),

    #[error("no agent cleared the confidence threshold of {threshold:.2}")]
    NoCapableAgent { threshold: f64 },

    #[error("agent '{agent_id}' timed out after {timeout_ms}ms")]
    AgentTimeout { agent_id: String, timeout_ms: u64 },

    #[error("agent '{agent_id}' failed: {reason}")]
    AgentInvocation { agent_id: String, reason: String },

    #[error("circuit for agent '{0}' is open and no fallback is configured")]
    CircuitOpen(String),

    #[error("planning failed: {0}")]
    Planning(String),

    #[error("retry task '{task_id}' for agent '{agent_id}' exhausted {attempts} attempts")]
    RetryExhausted {
        task_id: String,
        agent_id: String,
        attempts: u32,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type PlatformResult<T> = Result<T, PlatformError>;

impl PlatformError {
    /// HTTP status used when the error crosses the network boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            PlatformError::NotFound(_) | PlatformError::AgentNotFound(_) => 404,
            PlatformError::UnknownAgentType(_)
            | PlatformError::Planning(_)
            | PlatformError::InvalidInput(_)
            | PlatformError::Config(_) => 400,
            PlatformError::NoCapableAgent { .. } => 422,
            PlatformError::AgentTimeout { .. } => 504,
            PlatformError::AgentInvocation { .. } => 502,
            PlatformError::CircuitOpen(_) | PlatformError::StorageUnavailable(_) => 503,
            PlatformError::RetryExhausted { .. } | PlatformError::Internal(_) => 500,
        }
    }

    /// Short machine-readable tag for API bodies and events.
    pub fn kind(&self) -> &'static str {
        match self {
            PlatformError::StorageUnavailable(_) => "storage_unavailable",
            PlatformError::NotFound(_) => "not_found",
            PlatformError::AgentNotFound(_) => "agent_not_found",
            PlatformError::UnknownAgentType(_) => "unknown_agent_type",
            PlatformError::NoCapableAgent { .. } => "no_capable_agent",
            PlatformError::AgentTimeout { .. } => "agent_timeout",
            PlatformError::AgentInvocation { .. } => "agent_invocation_error",
            PlatformError::CircuitOpen(_) => "circuit_open",
            PlatformError::Planning(_) => "planning_error",
            PlatformError::RetryExhausted { .. } => "retry_exhausted",
            PlatformError::InvalidInput(_) => "invalid_input",
            PlatformError::Config(_) => "config_error",
            PlatformError::Internal(_) => "internal_error",
        }
    }
}

/// Errors raised by an individual storage adapter.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{tier} backend unreachable: {reason}")]
    Unreachable { tier: Tier, reason: String },

    #[error("failed to encode or decode stored item: {0}")]
    Codec(String),

    #[error("{tier} does not support {operation}")]
    Unsupported { tier: Tier, operation: &'static str },

    /// The backend is healthy but refused the request.
    #[error("{tier} rejected input: {reason}")]
    Invalid { tier: Tier, reason: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn unreachable(tier: Tier, reason: impl std::fmt::Display) -> Self {
        StorageError::Unreachable {
            tier,
            reason: reason.to_string(),
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Codec(e.to_string())
    }
}
