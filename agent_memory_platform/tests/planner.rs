//! Plan construction and execution across the three team modes.

mod common;

use agent_memory_platform::error::PlatformError;
use agent_memory_platform::planner::{
    ExecutionReport, PlanStatus, PlannerConfig, StepResult, StepStatus, SubTask, TaskRequest, TeamMode,
};
use common::{Harness, ScriptedAgent};
use futures::future::join_all;
use serde_json::json;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn config(max_concurrency: usize) -> PlannerConfig {
    PlannerConfig {
        max_concurrency,
        max_competitors: 3,
    }
}

fn diamond(mode: TeamMode) -> TaskRequest {
    TaskRequest::new(
        mode,
        vec![
            SubTask::new("fetch", json!("fetch")).with_agent("worker-a"),
            SubTask::new("parse", json!("parse")).with_agent("worker-b").after(["fetch"]),
            SubTask::new("index", json!("index")).with_agent("worker-c").after(["fetch"]),
            SubTask::new("report", json!("report"))
                .with_agent("worker-a")
                .after(["parse", "index"]),
            SubTask::new("audit", json!("audit")).with_agent("worker-b"),
        ],
    )
}

fn completed(report: &ExecutionReport, step: &str) -> StepResult {
    let result = report.step(step).cloned().unwrap();
    assert_eq!(result.status, StepStatus::Completed, "step {} did not complete", step);
    result
}

/// Every dependent starts only after all of its dependencies finished.
fn assert_dependency_order(report: &ExecutionReport, edges: &[(&str, &str)]) {
    for (dependent, dependency) in edges {
        let after = completed(report, dependent);
        let before = completed(report, dependency);
        assert!(
            after.started_seq > before.finished_seq,
            "{} started at {} before {} finished at {}",
            dependent,
            after.started_seq,
            dependency,
            before.finished_seq
        );
    }
}

/// Highest number of steps in flight at once, reconstructed from the sequence stamps.
fn peak_concurrency(report: &ExecutionReport) -> usize {
    report
        .steps
        .iter()
        .filter(|s| s.status != StepStatus::Skipped)
        .map(|trial| {
            report
                .steps
                .iter()
                .filter(|s| s.status != StepStatus::Skipped)
                .filter(|s| s.started_seq <= trial.started_seq && trial.started_seq < s.finished_seq)
                .count()
        })
        .max()
        .unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_randomized_runs_respect_dependencies() {
    let h = Harness::new(TIMEOUT, None);
    for id in ["worker-a", "worker-b", "worker-c"] {
        h.add(id, ScriptedAgent::new(&["general"]).with_jitter(15));
    }
    let planner = h.planner(config(4));

    let runs = (0..24).map(|i| {
        let mode = if i % 2 == 0 {
            TeamMode::Collaborative
        } else {
            TeamMode::Competitive
        };
        let mut plan = planner.plan(diamond(mode)).unwrap();
        let planner = &planner;
        async move { planner.execute(&mut plan).await.unwrap() }
    });

    for report in join_all(runs).await {
        assert_eq!(report.status, PlanStatus::Completed);
        assert_dependency_order(
            &report,
            &[
                ("parse", "fetch"),
                ("index", "fetch"),
                ("report", "parse"),
                ("report", "index"),
            ],
        );
        assert_eq!(report.outputs.len(), 5);
        assert_eq!(report.outputs["report"]["upstream"], json!(["index", "parse"]));
        assert_eq!(report.outputs["fetch"]["upstream"], json!([]));
    }
}

#[tokio::test]
async fn test_cycle_rejected_before_any_agent_runs() {
    let h = Harness::new(TIMEOUT, None);
    let agent = h.add("worker", ScriptedAgent::new(&["general"]));
    let planner = h.planner(config(4));

    let task = TaskRequest::new(
        TeamMode::Collaborative,
        vec![
            SubTask::new("a", json!(1)).with_agent("worker").after(["c"]),
            SubTask::new("b", json!(2)).with_agent("worker").after(["a"]),
            SubTask::new("c", json!(3)).with_agent("worker").after(["b"]),
        ],
    );
    let err = planner.plan(task).unwrap_err();
    assert!(matches!(err, PlatformError::Planning(_)));
    assert_eq!(agent.calls(), 0);
}

#[tokio::test]
async fn test_unknown_dependency_and_duplicates_rejected() {
    let h = Harness::new(TIMEOUT, None);
    h.add("worker", ScriptedAgent::new(&["general"]));
    let planner = h.planner(config(4));

    let dangling = TaskRequest::new(
        TeamMode::Sequential,
        vec![SubTask::new("a", json!(1)).with_agent("worker").after(["ghost"])],
    );
    assert!(matches!(planner.plan(dangling), Err(PlatformError::Planning(_))));

    let duplicated = TaskRequest::new(
        TeamMode::Sequential,
        vec![
            SubTask::new("a", json!(1)).with_agent("worker"),
            SubTask::new("a", json!(2)).with_agent("worker"),
        ],
    );
    assert!(matches!(planner.plan(duplicated), Err(PlatformError::Planning(_))));

    let empty = TaskRequest::new(TeamMode::Sequential, Vec::new());
    assert!(matches!(planner.plan(empty), Err(PlatformError::Planning(_))));
}

#[tokio::test]
async fn test_unknown_capability_has_no_capable_agent() {
    let h = Harness::new(TIMEOUT, None);
    h.add("worker", ScriptedAgent::new(&["general"]));
    let planner = h.planner(config(4));

    let task = TaskRequest::new(
        TeamMode::Collaborative,
        vec![SubTask::new("a", json!(1)).with_capabilities(["translation"])],
    );
    assert!(matches!(planner.plan(task), Err(PlatformError::NoCapableAgent { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_mode_never_overlaps_steps() {
    let h = Harness::new(TIMEOUT, None);
    for id in ["worker-a", "worker-b", "worker-c"] {
        h.add(id, ScriptedAgent::new(&["general"]).with_jitter(10));
    }
    let planner = h.planner(config(8));

    let mut plan = planner.plan(diamond(TeamMode::Sequential)).unwrap();
    let report = planner.execute(&mut plan).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(plan.status, PlanStatus::Completed);

    let mut spans: Vec<(u64, u64)> = report
        .steps
        .iter()
        .map(|s| (s.started_seq, s.finished_seq))
        .collect();
    spans.sort();
    for pair in spans.windows(2) {
        assert_eq!(pair[0].1 + 1, pair[1].0, "steps overlapped: {:?}", spans);
    }
    assert_eq!(peak_concurrency(&report), 1);
}

#[tokio::test]
async fn test_ordered_task_chains_listed_subtasks() {
    let h = Harness::new(TIMEOUT, None);
    h.add("worker", ScriptedAgent::new(&["general"]));
    let planner = h.planner(config(4));

    let mut task = TaskRequest::new(
        TeamMode::Collaborative,
        vec![
            SubTask::new("first", json!(1)).with_agent("worker"),
            SubTask::new("second", json!(2)).with_agent("worker"),
            SubTask::new("third", json!(3)).with_agent("worker"),
        ],
    );
    task.ordered = true;
    let mut plan = planner.plan(task).unwrap();
    assert_eq!(plan.order, vec!["first", "second", "third"]);

    let report = planner.execute(&mut plan).await.unwrap();
    assert_dependency_order(&report, &[("second", "first"), ("third", "second")]);
    assert_eq!(report.outputs["third"]["upstream"], json!(["second"]));
}

#[tokio::test]
async fn test_competitive_mode_selects_highest_score() {
    let h = Harness::new(TIMEOUT, None);
    h.add("cautious", ScriptedAgent::new(&["ranking"]).with_score(0.4));
    h.add("bold", ScriptedAgent::new(&["ranking"]).with_score(0.9));
    h.add("average", ScriptedAgent::new(&["ranking"]).with_score(0.6));
    let planner = h.planner(config(4));

    let task = TaskRequest::new(
        TeamMode::Competitive,
        vec![SubTask::new("rank", json!("which is best?")).with_capabilities(["ranking"])],
    );
    let mut plan = planner.plan(task).unwrap();
    assert_eq!(plan.steps.len(), 3);
    assert!(plan.steps.iter().all(|s| s.group == "rank"));

    let report = planner.execute(&mut plan).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.outputs["rank"]["agent"], "bold");

    let selected: Vec<&StepResult> = report.steps.iter().filter(|s| s.selected).collect();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].step_id, "rank#bold");
    assert_eq!(selected[0].score, Some(0.9));
}

#[tokio::test]
async fn test_competitive_group_survives_one_failed_competitor() {
    let h = Harness::new(TIMEOUT, None);
    let best = h.add("best", ScriptedAgent::new(&["ranking"]).with_score(0.9));
    h.add("steady", ScriptedAgent::new(&["ranking"]).with_score(0.5));
    best.set_healthy(false);
    let planner = h.planner(config(4));

    let task = TaskRequest::new(
        TeamMode::Competitive,
        vec![SubTask::new("rank", json!("go")).with_capabilities(["ranking"])],
    );
    let mut plan = planner.plan(task).unwrap();
    let report = planner.execute(&mut plan).await.unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.outputs["rank"]["agent"], "steady");
    assert_eq!(report.step("rank#best").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn test_collaborative_steps_share_scratch() {
    let h = Harness::new(TIMEOUT, None);
    h.add("writer", ScriptedAgent::new(&["general"]));
    let planner = h.planner(config(4));

    let task = TaskRequest::new(
        TeamMode::Collaborative,
        vec![
            SubTask::new(
                "draft",
                json!({ "set": { "status": "draft" }, "merge": { "notes": ["outline"] } }),
            )
            .with_agent("writer"),
            SubTask::new(
                "review",
                json!({ "set": { "status": "reviewed" }, "merge": { "notes": ["typos fixed"] } }),
            )
            .with_agent("writer")
            .after(["draft"]),
        ],
    );
    let mut plan = planner.plan(task).unwrap();
    let report = planner.execute(&mut plan).await.unwrap();

    assert_eq!(report.scratch["status"], "reviewed");
    assert_eq!(report.scratch["notes"], json!(["outline", "typos fixed"]));
}

#[tokio::test]
async fn test_other_modes_keep_scratch_private() {
    let h = Harness::new(TIMEOUT, None);
    h.add("writer", ScriptedAgent::new(&["general"]));
    let planner = h.planner(config(4));

    for mode in [TeamMode::Sequential, TeamMode::Competitive] {
        let task = TaskRequest::new(
            mode,
            vec![SubTask::new("draft", json!({ "set": { "status": "draft" } })).with_agent("writer")],
        );
        let mut plan = planner.plan(task).unwrap();
        let report = planner.execute(&mut plan).await.unwrap();
        assert_eq!(report.status, PlanStatus::Completed);
        assert!(report.scratch.is_empty(), "{:?} leaked scratch writes", mode);
    }
}

#[tokio::test]
async fn test_failed_subtask_skips_dependents_only() {
    let h = Harness::new(TIMEOUT, None);
    h.add("worker-a", ScriptedAgent::new(&["general"]));
    let broken = h.add("worker-b", ScriptedAgent::new(&["general"]));
    let downstream = h.add("worker-c", ScriptedAgent::new(&["general"]));
    broken.set_healthy(false);
    let planner = h.planner(config(4));

    let task = TaskRequest::new(
        TeamMode::Collaborative,
        vec![
            SubTask::new("load", json!(1)).with_agent("worker-a"),
            SubTask::new("transform", json!(2)).with_agent("worker-b").after(["load"]),
            SubTask::new("publish", json!(3)).with_agent("worker-c").after(["transform"]),
            SubTask::new("notify", json!(4)).with_agent("worker-c").after(["publish"]),
            SubTask::new("cleanup", json!(5)).with_agent("worker-a").after(["load"]),
        ],
    );
    let mut plan = planner.plan(task).unwrap();
    let report = planner.execute(&mut plan).await.unwrap();

    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(plan.status, PlanStatus::Failed);
    assert_eq!(report.step("transform").unwrap().status, StepStatus::Failed);
    assert!(report.step("transform").unwrap().error.is_some());
    assert_eq!(report.step("publish").unwrap().status, StepStatus::Skipped);
    assert_eq!(report.step("notify").unwrap().status, StepStatus::Skipped);
    assert_eq!(report.step("cleanup").unwrap().status, StepStatus::Completed);
    assert_eq!(downstream.calls(), 0);
    assert_eq!(report.steps.len(), 5);
    assert!(!report.outputs.contains_key("publish"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_concurrency_bounds_parallel_steps() {
    let h = Harness::new(TIMEOUT, None);
    let worker = h.add("worker", ScriptedAgent::new(&["general"]));
    worker.set_delay(Duration::from_millis(20));
    let planner = h.planner(config(2));

    let subtasks = (0..8)
        .map(|i| SubTask::new(format!("leaf-{}", i), json!(i)).with_agent("worker"))
        .collect();
    let mut plan = planner.plan(TaskRequest::new(TeamMode::Collaborative, subtasks)).unwrap();
    let report = planner.execute(&mut plan).await.unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(worker.calls(), 8);
    let peak = peak_concurrency(&report);
    assert!(peak <= 2, "peak concurrency {} exceeded the bound", peak);
    assert_eq!(peak, 2);
}
