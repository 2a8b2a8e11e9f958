//! Per-agent circuit breakers.
//!
//! Each breaker's state lives behind one mutex so that counting a failure and
//! tripping happen together: concurrent failures can never trip twice, and
//! only one caller at a time is handed the half-open trial.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests go to the fallback until the cooldown elapses.
    Open,
    /// One trial request is testing whether the agent recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// State change caused by recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Opened,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitSnapshot {
    pub agent_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_trip_at: Option<DateTime<Utc>>,
    pub cooldown_duration_ms: u64,
    pub trial_in_flight: bool,
    pub trips: u64,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    tripped_at: Option<Instant>,
    last_trip_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    trips: u64,
}

pub struct CircuitBreaker {
    agent_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Outcome of asking the breaker for permission to call the agent.
pub enum Admission {
    Granted(Permit),
    Rejected(CircuitState),
}

/// Permission to make one call. Resolve it with [`Permit::success`] or
/// [`Permit::failure`]; dropping an unresolved trial frees the half-open slot
/// for the next caller.
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl Permit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) -> Transition {
        self.resolved = true;
        self.breaker.on_success(self.trial)
    }

    pub fn failure(mut self) -> Transition {
        self.resolved = true;
        self.breaker.on_failure(self.trial)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.release_trial();
        }
    }
}

impl CircuitBreaker {
    pub fn new(agent_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                tripped_at: None,
                last_trip_at: None,
                trial_in_flight: false,
                trips: 0,
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn admit(self: &Arc<Self>) -> Admission {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .tripped_at
                    .map_or(true, |at| Instant::now().duration_since(at) >= self.config.cooldown);
                if !cooled {
                    return Admission::Rejected(CircuitState::Open);
                }
                info!(agent_id = %self.agent_id, "Circuit half-open; admitting one trial");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Admission::Rejected(CircuitState::HalfOpen);
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Admission::Granted(Permit {
            breaker: self.clone(),
            trial,
            resolved: false,
        })
    }

    fn on_success(&self, trial: bool) -> Transition {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                Transition::None
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.trial_in_flight = false;
                info!(agent_id = %self.agent_id, "Circuit closed after successful trial");
                Transition::Closed
            }
            // A call admitted before the trip finished late; it says nothing
            // about recovery.
            _ => Transition::None,
        }
    }

    fn on_failure(&self, trial: bool) -> Transition {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
            self.trip(&mut inner);
            warn!(agent_id = %self.agent_id, "Trial failed; circuit re-opened");
            return Transition::Opened;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner);
                    warn!(
                        agent_id = %self.agent_id,
                        failures = inner.failure_count,
                        "Circuit opened"
                    );
                    Transition::Opened
                } else {
                    debug!(
                        agent_id = %self.agent_id,
                        failures = inner.failure_count,
                        "Recorded failure"
                    );
                    Transition::None
                }
            }
            _ => Transition::None,
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.tripped_at = Some(Instant::now());
        inner.last_trip_at = Some(Utc::now());
        inner.trips += 1;
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
            debug!(agent_id = %self.agent_id, "Unresolved trial released");
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Time left until an open circuit admits a trial.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match (inner.state, inner.tripped_at) {
            (CircuitState::Open, Some(at)) => {
                Some(self.config.cooldown.saturating_sub(Instant::now().duration_since(at)))
            }
            _ => None,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            agent_id: self.agent_id.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_trip_at: inner.last_trip_at,
            cooldown_duration_ms: self.config.cooldown.as_millis() as u64,
            trial_in_flight: inner.trial_in_flight,
            trips: inner.trips,
        }
    }
}

/// Breakers keyed by agent id, created on first use.
pub struct CircuitTable {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitTable {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn breaker(&self, agent_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(agent_id) {
            return existing.clone();
        }
        self.breakers
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(agent_id, self.config)))
            .clone()
    }

    /// Snapshot for `agent_id`; an agent never invoked reports a fresh closed circuit.
    pub fn snapshot(&self, agent_id: &str) -> CircuitSnapshot {
        match self.breakers.get(agent_id) {
            Some(breaker) => breaker.snapshot(),
            None => CircuitBreaker::new(agent_id, self.config).snapshot(),
        }
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<CircuitSnapshot> =
            self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }
}
