//! Execution planner: turns a task into a dependency graph of agent steps and
//! runs it with bounded concurrency.
//!
//! Sub-tasks form the DAG; each becomes one step, or in competitive mode one
//! step per competing agent. A sub-task's dependents are released only once
//! every one of its steps has finished and at least one succeeded.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{RequestContext, Scratchpad};
use crate::error::{PlatformError, PlatformResult};
use crate::registry::AgentRegistry;
use crate::resilience::{CallContext, ResilientInvoker};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamMode {
    /// One step active at a time.
    Sequential,
    /// Independent steps run concurrently and share one scratch context.
    #[default]
    Collaborative,
    /// Each sub-task goes to several agents; the highest-scoring response wins.
    Competitive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    /// Explicit agent; otherwise one is selected by capability.
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl SubTask {
    pub fn new(id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            agent: None,
            capabilities: Vec::new(),
            input,
            depends_on: Vec::new(),
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default = "new_plan_id")]
    pub id: String,
    #[serde(default)]
    pub mode: TeamMode,
    pub subtasks: Vec<SubTask>,
    #[serde(default)]
    pub context: RequestContext,
    /// Chain sub-tasks in listed order on top of their declared dependencies.
    #[serde(default)]
    pub ordered: bool,
}

fn new_plan_id() -> String {
    Uuid::new_v4().to_string()
}

impl TaskRequest {
    pub fn new(mode: TeamMode, subtasks: Vec<SubTask>) -> Self {
        Self {
            id: new_plan_id(),
            mode,
            subtasks,
            context: RequestContext::default(),
            ordered: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub id: String,
    /// Sub-task this step belongs to.
    pub group: String,
    pub agent_id: String,
    pub input: Value,
    /// Sub-task ids that must complete first.
    pub depends_on: Vec<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub mode: TeamMode,
    pub steps: Vec<Step>,
    /// Sub-task ids in a valid topological order.
    pub order: Vec<String>,
    pub status: PlanStatus,
    #[serde(skip)]
    context: RequestContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// Not run because a dependency failed.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub group: String,
    pub agent_id: String,
    pub served_by: Option<String>,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub score: Option<f64>,
    pub error: Option<String>,
    pub fallback_used: bool,
    /// Kept as the sub-task's result.
    pub selected: bool,
    /// Execution-wide sequence numbers taken when the step started and finished.
    pub started_seq: u64,
    pub finished_seq: u64,
    pub duration_ms: u64,
}

impl StepResult {
    fn skipped(step: &Step) -> Self {
        Self {
            step_id: step.id.clone(),
            group: step.group.clone(),
            agent_id: step.agent_id.clone(),
            served_by: None,
            status: StepStatus::Skipped,
            output: None,
            score: None,
            error: None,
            fallback_used: false,
            selected: false,
            started_seq: 0,
            finished_seq: 0,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub plan_id: String,
    pub mode: TeamMode,
    pub status: PlanStatus,
    pub steps: Vec<StepResult>,
    /// Winning output per sub-task.
    pub outputs: BTreeMap<String, Value>,
    pub scratch: Map<String, Value>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub max_concurrency: usize,
    /// Agents a sub-task is dispatched to in competitive mode.
    pub max_competitors: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            max_competitors: 3,
        }
    }
}

pub struct Planner {
    registry: Arc<AgentRegistry>,
    invoker: Arc<ResilientInvoker>,
    config: PlannerConfig,
}

struct GroupState {
    steps: Vec<Step>,
    remaining_deps: usize,
    pending: usize,
    finished: Vec<StepResult>,
    dependents: Vec<String>,
}

impl Planner {
    pub fn new(registry: Arc<AgentRegistry>, invoker: Arc<ResilientInvoker>, config: PlannerConfig) -> Self {
        Self {
            registry,
            invoker,
            config,
        }
    }

    /// Builds the plan. Duplicate ids, unknown dependencies and cycles are
    /// rejected here, before anything runs.
    #[instrument(skip(self, task), fields(plan_id = %task.id))]
    pub fn plan(&self, task: TaskRequest) -> PlatformResult<ExecutionPlan> {
        if task.subtasks.is_empty() {
            return Err(PlatformError::Planning("task has no sub-tasks".into()));
        }

        let mut seen = HashSet::new();
        for sub in &task.subtasks {
            if !seen.insert(sub.id.as_str()) {
                return Err(PlatformError::Planning(format!("duplicate sub-task id '{}'", sub.id)));
            }
        }

        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        let mut previous: Option<&str> = None;
        for sub in &task.subtasks {
            let mut d = sub.depends_on.clone();
            if task.ordered {
                if let Some(prev) = previous {
                    if !d.iter().any(|x| x == prev) {
                        d.push(prev.to_string());
                    }
                }
            }
            let mut unique = HashSet::new();
            d.retain(|x| unique.insert(x.clone()));
            for dep in &d {
                if !seen.contains(dep.as_str()) {
                    return Err(PlatformError::Planning(format!(
                        "sub-task '{}' depends on unknown sub-task '{}'",
                        sub.id, dep
                    )));
                }
            }
            deps.insert(sub.id.clone(), d);
            previous = Some(sub.id.as_str());
        }

        let listed: Vec<String> = task.subtasks.iter().map(|s| s.id.clone()).collect();
        let order = topological_order(&listed, &deps)?;

        let mut steps = Vec::new();
        for sub in &task.subtasks {
            let agents = self.assign(task.mode, sub, &task.context)?;
            let competing = agents.len() > 1;
            for agent_id in agents {
                let id = if competing {
                    format!("{}#{}", sub.id, agent_id)
                } else {
                    sub.id.clone()
                };
                steps.push(Step {
                    id,
                    group: sub.id.clone(),
                    agent_id,
                    input: sub.input.clone(),
                    depends_on: deps.get(&sub.id).cloned().unwrap_or_default(),
                    capabilities: sub.capabilities.clone(),
                });
            }
        }

        info!("Planned {} step(s) over {} sub-task(s)", steps.len(), order.len());
        Ok(ExecutionPlan {
            id: task.id,
            mode: task.mode,
            steps,
            order,
            status: PlanStatus::Pending,
            context: task.context,
        })
    }

    fn assign(&self, mode: TeamMode, sub: &SubTask, base: &RequestContext) -> PlatformResult<Vec<String>> {
        if let Some(agent) = &sub.agent {
            return self.registry.get(agent).map(|d| vec![d.id]);
        }

        let mut ctx = base.clone();
        if !sub.capabilities.is_empty() {
            ctx.capabilities = sub.capabilities.clone();
        }

        match mode {
            TeamMode::Competitive => {
                let competitors: Vec<String> = self
                    .registry
                    .candidates(&ctx)
                    .into_iter()
                    .take(self.config.max_competitors.max(1))
                    .map(|(d, _)| d.id)
                    .collect();
                if competitors.is_empty() {
                    return Err(PlatformError::NoCapableAgent {
                        threshold: self.registry.threshold(),
                    });
                }
                Ok(competitors)
            }
            _ => self.registry.select(&ctx).map(|d| vec![d.id]),
        }
    }

    /// Runs the plan to completion. A failed sub-task skips everything that
    /// depends on it; independent branches keep going.
    #[instrument(skip(self, plan), fields(plan_id = %plan.id))]
    pub async fn execute(&self, plan: &mut ExecutionPlan) -> PlatformResult<ExecutionReport> {
        plan.status = PlanStatus::Running;
        let started = Instant::now();

        let concurrency = match plan.mode {
            TeamMode::Sequential => 1,
            _ => self.config.max_concurrency.max(1),
        };
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let seq = Arc::new(AtomicU64::new(0));
        let shared = Scratchpad::default();

        let mut groups: HashMap<String, GroupState> = plan
            .order
            .iter()
            .map(|g| {
                (
                    g.clone(),
                    GroupState {
                        steps: Vec::new(),
                        remaining_deps: 0,
                        pending: 0,
                        finished: Vec::new(),
                        dependents: Vec::new(),
                    },
                )
            })
            .collect();
        for step in &plan.steps {
            if let Some(state) = groups.get_mut(&step.group) {
                state.steps.push(step.clone());
                state.remaining_deps = step.depends_on.len();
            }
        }
        for step in &plan.steps {
            for dep in &step.depends_on {
                if let Some(state) = groups.get_mut(dep) {
                    if !state.dependents.contains(&step.group) {
                        state.dependents.push(step.group.clone());
                    }
                }
            }
        }

        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        let mut results: Vec<StepResult> = Vec::new();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut failed = false;
        let mut running: JoinSet<StepResult> = JoinSet::new();

        let ready: Vec<String> = plan
            .order
            .iter()
            .filter(|g| groups.get(*g).map_or(false, |s| s.remaining_deps == 0))
            .cloned()
            .collect();
        for group in ready {
            self.launch(&mut running, &mut groups, &group, plan, &outputs, &shared, &semaphore, &seq);
        }

        while let Some(joined) = running.join_next().await {
            let result = joined.map_err(|e| PlatformError::Internal(format!("step task failed: {}", e)))?;
            let group_id = result.group.clone();
            let Some(state) = groups.get_mut(&group_id) else {
                continue;
            };
            state.finished.push(result);
            state.pending -= 1;
            if state.pending > 0 {
                continue;
            }

            let mut finished = std::mem::take(&mut state.finished);
            let dependents = state.dependents.clone();
            let winner = finished
                .iter()
                .enumerate()
                .filter(|(_, r)| r.status == StepStatus::Completed)
                .max_by(|(_, a), (_, b)| {
                    a.score
                        .unwrap_or(0.0)
                        .partial_cmp(&b.score.unwrap_or(0.0))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.finished_seq.cmp(&a.finished_seq))
                })
                .map(|(i, _)| i);

            match winner {
                Some(i) => {
                    finished[i].selected = true;
                    if let Some(output) = finished[i].output.clone() {
                        outputs.insert(group_id.clone(), output);
                    }
                    debug!("Sub-task {} completed by {}", group_id, finished[i].agent_id);
                    results.extend(finished);

                    for dependent in dependents {
                        let Some(dep_state) = groups.get_mut(&dependent) else {
                            continue;
                        };
                        dep_state.remaining_deps = dep_state.remaining_deps.saturating_sub(1);
                        if dep_state.remaining_deps == 0 && !skipped.contains(&dependent) {
                            self.launch(&mut running, &mut groups, &dependent, plan, &outputs, &shared, &semaphore, &seq);
                        }
                    }
                }
                None => {
                    failed = true;
                    warn!("Sub-task {} failed; skipping its dependents", group_id);
                    results.extend(finished);

                    let mut queue: VecDeque<String> = dependents.into();
                    while let Some(next) = queue.pop_front() {
                        if !skipped.insert(next.clone()) {
                            continue;
                        }
                        if let Some(state) = groups.get(&next) {
                            results.extend(state.steps.iter().map(StepResult::skipped));
                            queue.extend(state.dependents.iter().cloned());
                        }
                    }
                }
            }
        }

        plan.status = if failed {
            PlanStatus::Failed
        } else {
            PlanStatus::Completed
        };
        info!("Plan {} finished: {:?}", plan.id, plan.status);

        Ok(ExecutionReport {
            plan_id: plan.id.clone(),
            mode: plan.mode,
            status: plan.status,
            steps: results,
            outputs,
            scratch: shared.snapshot(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        running: &mut JoinSet<StepResult>,
        groups: &mut HashMap<String, GroupState>,
        group: &str,
        plan: &ExecutionPlan,
        outputs: &BTreeMap<String, Value>,
        shared: &Scratchpad,
        semaphore: &Arc<Semaphore>,
        seq: &Arc<AtomicU64>,
    ) {
        let Some(state) = groups.get_mut(group) else {
            return;
        };
        state.pending = state.steps.len();

        for step in state.steps.clone() {
            let upstream: HashMap<String, Value> = step
                .depends_on
                .iter()
                .filter_map(|d| outputs.get(d).map(|o| (d.clone(), o.clone())))
                .collect();

            let mut request = plan.context.clone();
            if !step.capabilities.is_empty() {
                request.capabilities = step.capabilities.clone();
            }
            let call = CallContext {
                request,
                scratch: match plan.mode {
                    TeamMode::Collaborative => shared.clone(),
                    _ => Scratchpad::default(),
                },
                upstream,
                ..Default::default()
            };

            let invoker = self.invoker.clone();
            let semaphore = semaphore.clone();
            let seq = seq.clone();
            running.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let started_seq = seq.fetch_add(1, Ordering::SeqCst);
                let started = Instant::now();
                let outcome = invoker.invoke(&step.agent_id, step.input.clone(), call).await;
                let finished_seq = seq.fetch_add(1, Ordering::SeqCst);

                let mut result = StepResult::skipped(&step);
                result.started_seq = started_seq;
                result.finished_seq = finished_seq;
                result.duration_ms = started.elapsed().as_millis() as u64;
                match outcome {
                    Ok(invocation) => {
                        result.status = StepStatus::Completed;
                        result.served_by = Some(invocation.served_by);
                        result.score = Some(invocation.output.score);
                        result.output = Some(invocation.output.content);
                        result.fallback_used = invocation.fallback_used;
                    }
                    Err(e) => {
                        result.status = StepStatus::Failed;
                        result.error = Some(e.to_string());
                    }
                }
                result
            });
        }
    }
}

/// Kahn's algorithm; ties keep the listed order.
fn topological_order(listed: &[String], deps: &HashMap<String, Vec<String>>) -> PlatformResult<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = listed.iter().map(|id| (id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for id in listed {
        for dep in deps.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(id.as_str()) {
                *degree += 1;
            }
            dependents.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = listed
        .iter()
        .map(String::as_str)
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(listed.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if order.len() != listed.len() {
        let mut stuck: Vec<&str> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(id, _)| id)
            .collect();
        stuck.sort_unstable();
        return Err(PlatformError::Planning(format!(
            "dependency cycle among: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}
