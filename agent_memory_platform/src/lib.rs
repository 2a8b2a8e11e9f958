//! Agent Memory Platform - Core Library
//!
//! Tiered agent memory (L0 process-local through L4 cold archive), a
//! capability-scored agent registry, a DAG execution planner for agent teams,
//! and per-agent circuit breakers with fallback routing and background retry.

pub mod agent;
pub mod batch;
pub mod cli;
pub mod error;
pub mod events;
pub mod memory;
pub mod middleware;
pub mod monitoring;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod resilience;
pub mod server;
pub mod settings;
pub mod telemetry;

pub use agent::{Agent, AgentDescriptor, AgentOutput, InvocationContext, RequestContext};
pub use error::{PlatformError, PlatformResult};
pub use orchestrator::{Orchestrator, Response, Task};
pub use settings::Settings;
