//! Per-agent invocation metrics.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[cfg(feature = "with-metrics")]
use metrics::{counter, histogram};

/// Point-in-time view of one agent's counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentMetricsSnapshot {
    pub agent_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeouts: u64,
    /// Requests refused by an open or half-open circuit.
    pub rejected_requests: u64,
    /// Requests this agent failed that a fallback answered.
    pub fallbacks: u64,
    pub average_response_time_ms: f64,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
    fallbacks: AtomicU64,
    /// Summed latency of completed calls, in microseconds.
    latency_us: AtomicU64,
}

/// Lock-free per-agent counters, recorded on every invocation.
#[derive(Default)]
pub struct AgentMetrics {
    agents: DashMap<String, Counters>,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<F: FnOnce(&Counters)>(&self, agent_id: &str, f: F) {
        if let Some(counters) = self.agents.get(agent_id) {
            f(&counters);
            return;
        }
        let counters = self.agents.entry(agent_id.to_string()).or_default();
        f(&counters);
    }

    pub fn record_success(&self, agent_id: &str, latency: Duration) {
        self.with(agent_id, |c| {
            c.total.fetch_add(1, Ordering::Relaxed);
            c.successes.fetch_add(1, Ordering::Relaxed);
            c.latency_us
                .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        });

        #[cfg(feature = "with-metrics")]
        {
            counter!("amp_agent_invocations_total", "agent" => agent_id.to_string(), "outcome" => "success").increment(1);
            histogram!("amp_agent_latency_seconds", "agent" => agent_id.to_string()).record(latency.as_secs_f64());
        }
    }

    pub fn record_failure(&self, agent_id: &str, latency: Duration, timed_out: bool) {
        self.with(agent_id, |c| {
            c.total.fetch_add(1, Ordering::Relaxed);
            c.failures.fetch_add(1, Ordering::Relaxed);
            if timed_out {
                c.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            c.latency_us
                .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        });

        #[cfg(feature = "with-metrics")]
        {
            let outcome = if timed_out { "timeout" } else { "failure" };
            counter!("amp_agent_invocations_total", "agent" => agent_id.to_string(), "outcome" => outcome).increment(1);
        }
    }

    pub fn record_rejected(&self, agent_id: &str) {
        self.with(agent_id, |c| {
            c.total.fetch_add(1, Ordering::Relaxed);
            c.rejected.fetch_add(1, Ordering::Relaxed);
        });

        #[cfg(feature = "with-metrics")]
        counter!("amp_agent_invocations_total", "agent" => agent_id.to_string(), "outcome" => "rejected").increment(1);
    }

    pub fn record_fallback(&self, agent_id: &str) {
        self.with(agent_id, |c| {
            c.fallbacks.fetch_add(1, Ordering::Relaxed);
        });

        #[cfg(feature = "with-metrics")]
        counter!("amp_agent_fallbacks_total", "agent" => agent_id.to_string()).increment(1);
    }

    pub fn snapshot(&self, agent_id: &str) -> Option<AgentMetricsSnapshot> {
        self.agents.get(agent_id).map(|c| snapshot_of(agent_id, &c))
    }

    /// All agents, ordered by id.
    pub fn snapshots(&self) -> Vec<AgentMetricsSnapshot> {
        let mut all: Vec<AgentMetricsSnapshot> = self
            .agents
            .iter()
            .map(|e| snapshot_of(e.key(), e.value()))
            .collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }
}

fn snapshot_of(agent_id: &str, c: &Counters) -> AgentMetricsSnapshot {
    let successes = c.successes.load(Ordering::Relaxed);
    let failures = c.failures.load(Ordering::Relaxed);
    let completed = successes + failures;
    let average_response_time_ms = if completed == 0 {
        0.0
    } else {
        c.latency_us.load(Ordering::Relaxed) as f64 / completed as f64 / 1_000.0
    };

    AgentMetricsSnapshot {
        agent_id: agent_id.to_string(),
        total_requests: c.total.load(Ordering::Relaxed),
        successful_requests: successes,
        failed_requests: failures,
        timeouts: c.timeouts.load(Ordering::Relaxed),
        rejected_requests: c.rejected.load(Ordering::Relaxed),
        fallbacks: c.fallbacks.load(Ordering::Relaxed),
        average_response_time_ms,
    }
}
