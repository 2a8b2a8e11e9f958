//! Breaker-guarded agent invocation with timeout, fallback routing and retry enqueueing.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::breaker::{Admission, CircuitTable, Transition};
use super::retry::{RetryDispatcher, RetryScheduler, RetryTask};
use crate::agent::{AgentOutput, InvocationContext, RequestContext, Scratchpad};
use crate::error::{PlatformError, PlatformResult};
use crate::events::{EventPublisher, EventType};
use crate::memory::TierManager;
use crate::monitoring::AgentMetrics;
use crate::registry::AgentRegistry;

/// Caller-side context for one invocation.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    pub request: RequestContext,
    pub scratch: Scratchpad,
    pub upstream: HashMap<String, Value>,
    /// Cancelling this abandons the call without counting it against the agent.
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(request: RequestContext) -> Self {
        Self {
            request,
            ..Default::default()
        }
    }
}

/// A successful response and how it was obtained.
#[derive(Debug, Clone, Serialize)]
pub struct Invocation {
    /// Agent the caller asked for.
    pub requested: String,
    /// Agent that produced the output.
    pub served_by: String,
    pub output: AgentOutput,
    pub fallback_used: bool,
    /// Retry queued for the original agent, if any.
    pub retry_task: Option<String>,
    pub latency_ms: u64,
}

enum Outcome {
    Completed(Invocation),
    Rejected,
    Failed { error: PlatformError, tripped: bool },
}

pub struct ResilientInvoker {
    registry: Arc<AgentRegistry>,
    circuits: Arc<CircuitTable>,
    retries: Arc<RetryScheduler>,
    metrics: Arc<AgentMetrics>,
    events: EventPublisher,
    memory: Arc<TierManager>,
    timeout: Duration,
    default_fallback: Option<String>,
}

impl ResilientInvoker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        circuits: Arc<CircuitTable>,
        retries: Arc<RetryScheduler>,
        metrics: Arc<AgentMetrics>,
        events: EventPublisher,
        memory: Arc<TierManager>,
        timeout: Duration,
        default_fallback: Option<String>,
    ) -> Self {
        Self {
            registry,
            circuits,
            retries,
            metrics,
            events,
            memory,
            timeout,
            default_fallback,
        }
    }

    /// Fallback for `agent_id`: a declared `fallback_of` agent, else the configured default.
    pub fn fallback_for(&self, agent_id: &str) -> Option<String> {
        self.registry
            .fallback_for(agent_id)
            .map(|d| d.id)
            .or_else(|| {
                self.default_fallback
                    .clone()
                    .filter(|id| id != agent_id && self.registry.contains(id))
            })
    }

    /// Live invocation path.
    ///
    /// Failures and open circuits are routed to the fallback when one exists.
    /// A request that tripped the circuit, timed out, or was refused by it is
    /// also queued for retry against the original agent.
    #[instrument(skip(self, input, call), fields(agent_id = %agent_id))]
    pub async fn invoke(&self, agent_id: &str, input: Value, call: CallContext) -> PlatformResult<Invocation> {
        match self.guarded(agent_id, input.clone(), &call).await? {
            Outcome::Completed(invocation) => Ok(invocation),
            Outcome::Rejected => {
                let breaker = self.circuits.breaker(agent_id);
                let error = PlatformError::CircuitOpen(agent_id.to_string());
                let task = self.retries.enqueue(
                    agent_id,
                    input.clone(),
                    call.request.clone(),
                    &error,
                    breaker.retry_after(),
                );
                self.route_to_fallback(agent_id, input, &call, error, task).await
            }
            Outcome::Failed { error, tripped } => {
                let task = if tripped || matches!(error, PlatformError::AgentTimeout { .. }) {
                    let not_before = self.circuits.breaker(agent_id).retry_after();
                    self.retries.enqueue(
                        agent_id,
                        input.clone(),
                        call.request.clone(),
                        &error,
                        not_before,
                    )
                } else {
                    None
                };
                self.route_to_fallback(agent_id, input, &call, error, task).await
            }
        }
    }

    /// One breaker-governed call with no fallback and no retry enqueueing.
    pub async fn attempt(&self, agent_id: &str, input: Value, call: &CallContext) -> PlatformResult<Invocation> {
        match self.guarded(agent_id, input, call).await? {
            Outcome::Completed(invocation) => Ok(invocation),
            Outcome::Rejected => Err(PlatformError::CircuitOpen(agent_id.to_string())),
            Outcome::Failed { error, .. } => Err(error),
        }
    }

    async fn route_to_fallback(
        &self,
        agent_id: &str,
        input: Value,
        call: &CallContext,
        error: PlatformError,
        retry_task: Option<String>,
    ) -> PlatformResult<Invocation> {
        let Some(fallback) = self.fallback_for(agent_id) else {
            return Err(error);
        };

        warn!("Routing {} to fallback {}: {}", agent_id, fallback, error);
        self.metrics.record_fallback(agent_id);
        self.events.emit(
            EventType::FallbackActivated,
            Some(agent_id),
            json!({ "fallback": fallback, "reason": error.to_string(), "retry_task": retry_task }),
        );

        match self.attempt(&fallback, input, call).await {
            Ok(mut invocation) => {
                invocation.requested = agent_id.to_string();
                invocation.fallback_used = true;
                invocation.retry_task = retry_task;
                Ok(invocation)
            }
            Err(fallback_error) => {
                warn!("Fallback {} for {} also failed: {}", fallback, agent_id, fallback_error);
                Err(error)
            }
        }
    }

    async fn guarded(&self, agent_id: &str, input: Value, call: &CallContext) -> PlatformResult<Outcome> {
        let agent = self.registry.instance(agent_id)?;
        let breaker = self.circuits.breaker(agent_id);

        let permit = match breaker.admit() {
            Admission::Granted(permit) => permit,
            Admission::Rejected(state) => {
                self.metrics.record_rejected(agent_id);
                info!("Circuit for {} is {}; request refused", agent_id, state);
                return Ok(Outcome::Rejected);
            }
        };
        if permit.is_trial() {
            self.events
                .emit(EventType::CircuitHalfOpened, Some(agent_id), json!({}));
        }

        let started = Instant::now();
        let deadline = started + self.timeout;
        let cancel = call.cancel.child_token();
        let ctx = InvocationContext {
            agent_id: agent_id.to_string(),
            request: call.request.clone(),
            memory: self.memory.clone(),
            scratch: call.scratch.clone(),
            upstream: call.upstream.clone(),
            cancel: cancel.clone(),
            deadline,
        };

        let result = tokio::select! {
            _ = call.cancel.cancelled() => {
                // Caller gave up; the permit drops unresolved.
                return Err(PlatformError::Internal(format!("invocation of '{}' was cancelled", agent_id)));
            }
            result = tokio::time::timeout_at(deadline, agent.handle(input, ctx)) => result,
        };
        let latency = started.elapsed();

        let error = match result {
            Ok(Ok(output)) => {
                if permit.success() == Transition::Closed {
                    self.events
                        .emit(EventType::CircuitClosed, Some(agent_id), json!({}));
                }
                self.metrics.record_success(agent_id, latency);
                self.registry.record_success(agent_id);
                return Ok(Outcome::Completed(Invocation {
                    requested: agent_id.to_string(),
                    served_by: agent_id.to_string(),
                    output,
                    fallback_used: false,
                    retry_task: None,
                    latency_ms: latency.as_millis() as u64,
                }));
            }
            Ok(Err(e)) => PlatformError::AgentInvocation {
                agent_id: agent_id.to_string(),
                reason: format!("{:#}", e),
            },
            Err(_) => {
                cancel.cancel();
                PlatformError::AgentTimeout {
                    agent_id: agent_id.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            }
        };

        let timed_out = matches!(error, PlatformError::AgentTimeout { .. });
        self.metrics.record_failure(agent_id, latency, timed_out);
        self.events.emit(
            EventType::AgentInvocationFailed,
            Some(agent_id),
            json!({ "error": error.to_string(), "kind": error.kind() }),
        );

        let tripped = permit.failure() == Transition::Opened;
        if tripped {
            let snapshot = breaker.snapshot();
            self.events.emit(
                EventType::CircuitOpened,
                Some(agent_id),
                json!({
                    "failures": snapshot.failure_count,
                    "cooldown_ms": snapshot.cooldown_duration_ms,
                }),
            );
            self.retries
                .reschedule_agent(agent_id, breaker.config().cooldown);
        }
        Ok(Outcome::Failed { error, tripped })
    }
}

#[async_trait]
impl RetryDispatcher for ResilientInvoker {
    async fn dispatch(&self, task: &RetryTask) -> PlatformResult<AgentOutput> {
        let call = CallContext::new(task.request.clone());
        self.attempt(&task.agent_id, task.payload.clone(), &call)
            .await
            .map(|invocation| invocation.output)
    }

    fn not_before(&self, agent_id: &str) -> Option<Duration> {
        self.circuits.breaker(agent_id).retry_after()
    }
}
