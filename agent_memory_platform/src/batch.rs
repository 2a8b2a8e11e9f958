//! Batch runner for `amp-cli run --config <jobs.toml>`.
//!
//! A job's tasks become the sub-tasks of one team plan, so duplicate ids,
//! dangling dependencies and cycles are rejected before any agent is called.
//! Execution, concurrency and skip propagation are the planner's.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::agent::RequestContext;
use crate::error::{PlatformError, PlatformResult};
use crate::orchestrator::{Orchestrator, Response, Task};
use crate::planner::{ExecutionReport, StepStatus, SubTask, TeamMode};
use crate::settings::Settings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub job: JobMetadata,
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub settings: BatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One `[[tasks]]` entry; maps one-to-one onto a planner sub-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl From<&TaskConfig> for SubTask {
    fn from(task: &TaskConfig) -> Self {
        let mut sub = SubTask::new(task.id.clone(), task.input.clone())
            .with_capabilities(task.capabilities.iter().cloned())
            .after(task.depends_on.iter().cloned());
        sub.agent = task.agent.clone();
        sub
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default)]
    pub mode: TeamMode,
    /// Run tasks in file order on top of their declared dependencies.
    #[serde(default)]
    pub ordered: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub output_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    /// Agent that produced the kept output, or the planned agent otherwise.
    pub agent: Option<String>,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub fallback_used: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    PartialSuccess,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_name: String,
    pub plan_id: String,
    pub status: BatchStatus,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    pub total_duration_ms: u64,
    /// In the order the tasks appear in the job file.
    pub task_results: Vec<TaskResult>,
}

impl BatchResult {
    fn count(&self, status: TaskStatus) -> usize {
        self.task_results.iter().filter(|r| r.status == status).count()
    }
}

/// Entry point for the `run` subcommand.
#[instrument(skip(settings))]
pub async fn run(config_path: PathBuf, settings: Settings) -> Result<()> {
    let config = load_batch_config(&config_path)?;
    info!("Running job '{}' with {} task(s)", config.job.name, config.tasks.len());
    let output_file = config.settings.output_file.clone();

    let orchestrator = Orchestrator::new(settings)
        .await
        .context("Failed to start the platform for the batch job")?;
    let outcome = execute_batch(&orchestrator, config).await;
    orchestrator.shutdown().await;
    let result = outcome.context("Batch job was rejected")?;

    print!("{}", render_summary(&result));
    if let Some(path) = &output_file {
        write_results(&result, path)?;
    }

    match result.status {
        BatchStatus::Success => Ok(()),
        BatchStatus::PartialSuccess => {
            warn!("Job '{}' finished with {} failed task(s)", result.job_name, result.failed_tasks);
            Ok(())
        }
        BatchStatus::Failed => Err(anyhow!("Job '{}' failed", result.job_name)),
    }
}

pub fn load_batch_config(path: &Path) -> Result<BatchConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read job file {}", path.display()))?;
    let config: BatchConfig =
        toml::from_str(&raw).with_context(|| format!("Invalid job file {}", path.display()))?;
    if config.tasks.is_empty() {
        return Err(anyhow!("Job file {} declares no tasks", path.display()));
    }
    Ok(config)
}

/// Plans the job's tasks as one team and runs them. Planning errors are
/// returned before any agent is invoked.
#[instrument(skip(orchestrator, config), fields(job = %config.job.name))]
pub async fn execute_batch(orchestrator: &Orchestrator, config: BatchConfig) -> PlatformResult<BatchResult> {
    if config.tasks.is_empty() {
        return Err(PlatformError::Planning("batch job has no tasks".into()));
    }
    let started = Instant::now();

    let context = RequestContext {
        session_id: config.settings.session_id.clone(),
        ..Default::default()
    };
    let team = Task {
        mode: Some(config.settings.mode),
        subtasks: config.tasks.iter().map(SubTask::from).collect(),
        ordered: config.settings.ordered,
        ..Default::default()
    };
    let report = match orchestrator.invoke(team, context).await? {
        Response::Plan(report) => report,
        Response::Single(_) => {
            return Err(PlatformError::Internal("batch job ran without a plan".into()));
        }
    };

    let task_results: Vec<TaskResult> = config
        .tasks
        .iter()
        .map(|task| task_result(task, &report))
        .collect();
    let mut result = BatchResult {
        job_name: config.job.name,
        plan_id: report.plan_id,
        status: BatchStatus::Failed,
        total_tasks: task_results.len(),
        successful_tasks: 0,
        failed_tasks: 0,
        skipped_tasks: 0,
        total_duration_ms: started.elapsed().as_millis() as u64,
        task_results,
    };
    result.successful_tasks = result.count(TaskStatus::Success);
    result.failed_tasks = result.count(TaskStatus::Failed);
    result.skipped_tasks = result.count(TaskStatus::Skipped);
    result.status = if result.successful_tasks == result.total_tasks {
        BatchStatus::Success
    } else if result.successful_tasks > 0 {
        BatchStatus::PartialSuccess
    } else {
        BatchStatus::Failed
    };
    Ok(result)
}

/// Folds a sub-task's steps (one, or several when competing) into one result.
fn task_result(task: &TaskConfig, report: &ExecutionReport) -> TaskResult {
    let steps: Vec<_> = report.steps.iter().filter(|s| s.group == task.id).collect();
    let mut result = TaskResult {
        task_id: task.id.clone(),
        agent: steps.first().map(|s| s.agent_id.clone()).or_else(|| task.agent.clone()),
        status: TaskStatus::Skipped,
        output: None,
        fallback_used: false,
        error: None,
        duration_ms: steps.iter().map(|s| s.duration_ms).max().unwrap_or(0),
    };

    if let Some(winner) = steps.iter().find(|s| s.selected) {
        result.status = TaskStatus::Success;
        result.agent = winner.served_by.clone().or_else(|| Some(winner.agent_id.clone()));
        result.fallback_used = winner.fallback_used;
        result.output = report.outputs.get(&task.id).cloned();
    } else if steps.iter().any(|s| s.status == StepStatus::Failed) {
        result.status = TaskStatus::Failed;
        let errors: Vec<&str> = steps.iter().filter_map(|s| s.error.as_deref()).collect();
        result.error = Some(errors.join("; "));
    } else {
        result.error = Some("skipped: a dependency failed".to_string());
    }
    result
}

fn render_summary(result: &BatchResult) -> String {
    let mut out = format!(
        "\njob {} [{:?}] plan {}\n  {} ok / {} failed / {} skipped of {} in {}ms\n",
        result.job_name,
        result.status,
        result.plan_id,
        result.successful_tasks,
        result.failed_tasks,
        result.skipped_tasks,
        result.total_tasks,
        result.total_duration_ms,
    );
    for task in &result.task_results {
        let agent = task.agent.as_deref().unwrap_or("-");
        let marker = if task.fallback_used { " (fallback)" } else { "" };
        out.push_str(&format!("  {:<8} {} via {}{}", format!("{:?}", task.status), task.task_id, agent, marker));
        if let Some(error) = &task.error {
            out.push_str(&format!(": {}", error));
        }
        out.push('\n');
    }
    out
}

fn write_results(result: &BatchResult, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(path, json).with_context(|| format!("Cannot write results to {}", path.display()))?;
    info!("Wrote batch results to {}", path.display());
    Ok(())
}
