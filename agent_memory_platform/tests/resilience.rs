//! Circuit breaker, fallback and retry behaviour through the resilient invoker.

mod common;

use agent_memory_platform::agent::RequestContext;
use agent_memory_platform::error::PlatformError;
use agent_memory_platform::events::EventType;
use agent_memory_platform::resilience::{CallContext, CircuitState};
use common::{Harness, ScriptedAgent};
use futures::future::join_all;
use serde_json::json;
use std::time::Duration;
use tracing_test::traced_test;

const TIMEOUT: Duration = Duration::from_secs(5);

fn call() -> CallContext {
    CallContext::new(RequestContext::default())
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_breaker_trips_after_three_failures() {
    let h = Harness::new(TIMEOUT, None);
    let flaky = h.add("flaky", ScriptedAgent::new(&["general"]));
    flaky.set_healthy(false);

    for expected in 1..=2 {
        let err = h.invoker.attempt("flaky", json!("x"), &call()).await.unwrap_err();
        assert!(matches!(err, PlatformError::AgentInvocation { .. }));
        let snapshot = h.circuits.snapshot("flaky");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, expected);
    }

    h.invoker.attempt("flaky", json!("x"), &call()).await.unwrap_err();
    assert_eq!(h.circuits.snapshot("flaky").state, CircuitState::Open);
    assert_eq!(h.count(EventType::CircuitOpened).await, 1);

    // Refused without reaching the agent.
    let err = h.invoker.attempt("flaky", json!("x"), &call()).await.unwrap_err();
    assert!(matches!(err, PlatformError::CircuitOpen(_)));
    assert_eq!(flaky.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_count_as_failures() {
    let h = Harness::new(Duration::from_secs(1), None);
    let slow = h.add("slow", ScriptedAgent::new(&["general"]));
    slow.set_delay(Duration::from_secs(30));

    for _ in 0..3 {
        let err = h.invoker.attempt("slow", json!("x"), &call()).await.unwrap_err();
        assert!(matches!(err, PlatformError::AgentTimeout { .. }));
    }
    assert_eq!(h.circuits.snapshot("slow").state, CircuitState::Open);

    let metrics = h.metrics.snapshot("slow").unwrap();
    assert_eq!(metrics.timeouts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_exactly_one_trial_under_concurrency() {
    let h = Harness::new(TIMEOUT, None);
    let agent = h.add("solo", ScriptedAgent::new(&["general"]));
    agent.set_healthy(false);
    for _ in 0..3 {
        let _ = h.invoker.attempt("solo", json!("x"), &call()).await;
    }
    assert_eq!(h.circuits.snapshot("solo").state, CircuitState::Open);

    agent.set_healthy(true);
    agent.set_delay(Duration::from_millis(200));
    tokio::time::advance(Duration::from_secs(61)).await;

    let calls_before = agent.calls();
    let ctx = call();
    let attempts = (0..16).map(|_| h.invoker.attempt("solo", json!("trial"), &ctx));
    let results = join_all(attempts).await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(PlatformError::CircuitOpen(_))))
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(refused, 15);
    assert_eq!(agent.calls() - calls_before, 1);
    assert_eq!(h.circuits.snapshot("solo").state, CircuitState::Closed);
    assert_eq!(h.count(EventType::CircuitHalfOpened).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_and_restarts_cooldown() {
    let h = Harness::new(TIMEOUT, None);
    let agent = h.add("stubborn", ScriptedAgent::new(&["general"]));
    agent.set_healthy(false);
    for _ in 0..3 {
        let _ = h.invoker.attempt("stubborn", json!("x"), &call()).await;
    }

    tokio::time::advance(Duration::from_secs(61)).await;
    let err = h.invoker.attempt("stubborn", json!("x"), &call()).await.unwrap_err();
    assert!(matches!(err, PlatformError::AgentInvocation { .. }));
    assert_eq!(h.circuits.snapshot("stubborn").state, CircuitState::Open);

    // Cooldown counts from the failed trial, not the first trip.
    tokio::time::advance(Duration::from_secs(30)).await;
    let err = h.invoker.attempt("stubborn", json!("x"), &call()).await.unwrap_err();
    assert!(matches!(err, PlatformError::CircuitOpen(_)));
    assert_eq!(agent.calls(), 4);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_echo_falls_back_to_vertex_then_recovers() {
    let h = Harness::with_vertex_fallback(TIMEOUT);
    let echo = h.add("echo", ScriptedAgent::new(&["text_echo"]));

    let first = h.invoker.invoke("echo", json!("hello"), call()).await.unwrap();
    assert_eq!(first.served_by, "echo");
    assert!(!first.fallback_used);

    echo.set_healthy(false);
    for _ in 0..3 {
        let served = h.invoker.invoke("echo", json!("hello"), call()).await.unwrap();
        assert_eq!(served.served_by, "vertex-agent");
        assert_eq!(served.requested, "echo");
        assert!(served.fallback_used);
    }
    assert_eq!(h.circuits.snapshot("echo").state, CircuitState::Open);
    assert!(!h.retries.is_empty());

    // While open the original agent is not contacted at all.
    let calls = echo.calls();
    let served = h.invoker.invoke("echo", json!("hello"), call()).await.unwrap();
    assert_eq!(served.served_by, "vertex-agent");
    assert!(served.retry_task.is_some());
    assert_eq!(echo.calls(), calls);

    echo.set_healthy(true);
    tokio::time::advance(Duration::from_secs(59)).await;
    let served = h.invoker.invoke("echo", json!("hello"), call()).await.unwrap();
    assert_eq!(served.served_by, "vertex-agent");

    tokio::time::advance(Duration::from_secs(2)).await;
    let trial = h.invoker.invoke("echo", json!("hello"), call()).await.unwrap();
    assert_eq!(trial.served_by, "echo");
    assert!(!trial.fallback_used);
    assert_eq!(h.circuits.snapshot("echo").state, CircuitState::Closed);

    let again = h.invoker.invoke("echo", json!("hello"), call()).await.unwrap();
    assert_eq!(again.served_by, "echo");

    assert_eq!(h.count(EventType::CircuitOpened).await, 1);
    assert_eq!(h.count(EventType::CircuitHalfOpened).await, 1);
    assert_eq!(h.count(EventType::CircuitClosed).await, 1);
    assert!(h.count(EventType::FallbackActivated).await >= 5);
    assert_eq!(h.metrics.snapshot("echo").unwrap().fallbacks, 5);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_without_fallback_surfaces_error() {
    let h = Harness::new(TIMEOUT, None);
    let agent = h.add("lonely", ScriptedAgent::new(&["general"]));
    agent.set_healthy(false);
    for _ in 0..3 {
        let err = h.invoker.invoke("lonely", json!("x"), call()).await.unwrap_err();
        assert!(matches!(err, PlatformError::AgentInvocation { .. }));
    }
    let err = h.invoker.invoke("lonely", json!("x"), call()).await.unwrap_err();
    assert!(matches!(err, PlatformError::CircuitOpen(_)));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_hides_failure_from_caller() {
    let h = Harness::new(TIMEOUT, None);
    let primary = h.add("primary", ScriptedAgent::new(&["search"]));
    let backup = std::sync::Arc::new(ScriptedAgent::new(&["search"]));
    h.registry.register(
        agent_memory_platform::agent::Agent::descriptor(backup.as_ref(), "backup").fallback_for("primary"),
        backup.clone(),
    );

    primary.set_healthy(false);
    let served = h.invoker.invoke("primary", json!("q"), call()).await.unwrap();
    assert_eq!(served.served_by, "backup");
    assert_eq!(backup.calls(), 1);
    // A single failure neither trips nor queues a retry.
    assert!(served.retry_task.is_none());
    assert!(h.retries.is_empty());
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_retry_exhaustion_emits_exactly_one_dead_letter() {
    let h = Harness::new(TIMEOUT, None);
    let agent = h.add("broken", ScriptedAgent::new(&["general"]));
    agent.set_healthy(false);

    for _ in 0..3 {
        let _ = h.invoker.invoke("broken", json!({ "job": 7 }), call()).await;
    }
    assert_eq!(h.retries.len(), 1);
    let task = h.retries.pending().remove(0);
    assert_eq!(task.agent_id, "broken");
    assert_eq!(task.attempt_count, 0);

    let mut dead = 0;
    for _ in 0..200 {
        tokio::time::advance(Duration::from_secs(15)).await;
        let round = h.retries.process_due(h.invoker.as_ref()).await;
        dead += round.dead_lettered;
        assert_eq!(round.succeeded, 0);
        if h.retries.is_empty() {
            break;
        }
    }
    assert!(h.retries.is_empty());
    assert_eq!(dead, 1);

    // Nothing is left to re-emit.
    tokio::time::advance(Duration::from_secs(3600)).await;
    h.retries.process_due(h.invoker.as_ref()).await;

    assert_eq!(h.count(EventType::DeadLetter).await, 1);
    let letter = &h.history.of_type(EventType::DeadLetter)[0];
    assert_eq!(letter.agent_id.as_deref(), Some("broken"));
    assert_eq!(letter.payload["attempts"], 5);
    assert_eq!(letter.payload["payload"], json!({ "job": 7 }));
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_once_agent_recovers() {
    let h = Harness::new(TIMEOUT, None);
    let agent = h.add("wobbly", ScriptedAgent::new(&["general"]));
    agent.set_healthy(false);
    for _ in 0..3 {
        let _ = h.invoker.invoke("wobbly", json!("x"), call()).await;
    }
    assert_eq!(h.retries.len(), 1);

    // Not due before the cooldown ends.
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(h.retries.process_due(h.invoker.as_ref()).await.dispatched, 0);

    agent.set_healthy(true);
    tokio::time::advance(Duration::from_secs(31)).await;
    let round = h.retries.process_due(h.invoker.as_ref()).await;
    assert_eq!(round.succeeded, 1);
    assert!(h.retries.is_empty());
    assert_eq!(h.circuits.snapshot("wobbly").state, CircuitState::Closed);
    assert_eq!(h.count(EventType::RetrySucceeded).await, 1);
    assert_eq!(h.count(EventType::DeadLetter).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_call_does_not_count_against_circuit() {
    let h = Harness::new(TIMEOUT, None);
    let agent = h.add("patient", ScriptedAgent::new(&["general"]));
    agent.set_delay(Duration::from_secs(2));

    let ctx = call();
    let cancel = ctx.cancel.clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    });
    let err = h.invoker.attempt("patient", json!("x"), &ctx).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, PlatformError::Internal(_)));
    let snapshot = h.circuits.snapshot("patient");
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_calls_against_open_circuit_share_one_retry() {
    let h = Harness::new(TIMEOUT, None);
    let agent = h.add("down", ScriptedAgent::new(&["general"]));
    agent.set_healthy(false);
    for _ in 0..3 {
        let _ = h.invoker.invoke("down", json!("same"), call()).await;
    }
    assert_eq!(h.circuits.snapshot("down").state, CircuitState::Open);

    for _ in 0..10 {
        let err = h.invoker.invoke("down", json!("same"), call()).await.unwrap_err();
        assert!(matches!(err, PlatformError::CircuitOpen(_)));
    }
    assert_eq!(h.retries.len(), 1);

    let _ = h.invoker.invoke("down", json!("different"), call()).await;
    assert_eq!(h.retries.len(), 2);
}
