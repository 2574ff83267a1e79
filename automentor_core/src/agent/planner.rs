//! Task Planner Module
//!
//! Decomposes a finalized goal into an executable task graph.
//!
//! - Linear: one chain, each task after its predecessor
//! - Parallel: a kickoff task, then everything else at once
//! - Milestone: phase clusters; each cluster waits for the whole previous one
//! - Adaptive: picks one of the above from goal complexity and time pressure
//!
//! Dependencies are built structurally from the strategy, so every plan is
//! acyclic by construction; the graph is still verified before it is
//! committed. Task count and effort come from a replaceable [`EffortPolicy`].

use super::goals::open_questions;
use super::types::{EffortTotals, Goal, GoalStatus, Task, TaskStatus};
use crate::capabilities::{CapabilityGuard, TextGenerator};
use crate::config::PlannerConfig;
use crate::error::{AgentError, AgentResult};
use crate::state::{StateRegistry, UserState};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

// ============================================================
// STRATEGY
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanningStrategy {
    Linear,
    Parallel,
    Milestone,
    Adaptive,
}

impl PlanningStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanningStrategy::Linear => "linear",
            PlanningStrategy::Parallel => "parallel",
            PlanningStrategy::Milestone => "milestone",
            PlanningStrategy::Adaptive => "adaptive",
        }
    }

    /// Next lighter-weight strategy used for corrective replanning
    pub fn lighter(self) -> Self {
        match self {
            PlanningStrategy::Milestone | PlanningStrategy::Adaptive => PlanningStrategy::Linear,
            PlanningStrategy::Linear | PlanningStrategy::Parallel => PlanningStrategy::Parallel,
        }
    }
}

// ============================================================
// COMPLEXITY ANALYSIS
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalCategory {
    SoftwareDeveloper,
    DataScientist,
    ProductManager,
    Marketing,
    Sales,
    General,
}

impl GoalCategory {
    pub fn categorize(text: &str) -> Self {
        let lower = text.to_lowercase();
        let words: BTreeSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has = |terms: &[&str]| {
            terms.iter().any(|t| {
                if t.contains(' ') {
                    lower.contains(t)
                } else {
                    words.contains(t)
                }
            })
        };

        if has(&["developer", "programming", "coding", "software", "web", "app", "react", "frontend", "backend"]) {
            GoalCategory::SoftwareDeveloper
        } else if has(&["data", "analytics", "machine learning", "ai", "statistics"]) {
            GoalCategory::DataScientist
        } else if has(&["product", "manager", "strategy", "roadmap", "stakeholder"]) {
            GoalCategory::ProductManager
        } else if has(&["marketing", "digital", "social media", "content", "brand"]) {
            GoalCategory::Marketing
        } else if has(&["sales", "business development", "account", "revenue"]) {
            GoalCategory::Sales
        } else {
            GoalCategory::General
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    Medium,
    High,
}

impl Level {
    fn score(&self) -> f32 {
        match self {
            Level::Low => 0.2,
            Level::Medium => 0.5,
            Level::High => 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplexityAnalysis {
    pub category: GoalCategory,
    pub skill_gap: Level,
    pub time_constraint: Level,
    pub resource_requirements: Level,
    pub dependencies: Vec<String>,
    /// Technologies named in the goal
    pub skills: Vec<String>,
    /// Weighted score in [0, 1]
    pub score: f32,
    /// Distinct pieces of scope; broader scope means smaller tasks
    pub scope_items: usize,
    pub job_related: bool,
    pub risk_factors: Vec<String>,
}

const TECH_TERMS: [&str; 12] = [
    "python", "javascript", "react", "sql", "aws", "typescript", "java", "rust", "docker",
    "kubernetes", "tensorflow", "node",
];

impl ComplexityAnalysis {
    pub fn of(goal: &Goal, today: NaiveDate) -> Self {
        let text = format!(
            "{} {}",
            goal.description,
            goal.smart.specific.as_deref().unwrap_or("")
        );
        let lower = text.to_lowercase();
        let words: BTreeSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let skills: Vec<String> = TECH_TERMS
            .iter()
            .filter(|t| words.contains(*t))
            .map(|t| t.to_string())
            .collect();
        let tech = skills.len();
        let skill_gap = match tech {
            0 => Level::Low,
            1 => Level::Medium,
            _ => Level::High,
        };

        let time_constraint = match goal.deadline {
            Some(deadline) => match (deadline - today).num_days() {
                d if d < 30 => Level::High,
                d if d < 90 => Level::Medium,
                _ => Level::Low,
            },
            None => Level::Low,
        };

        let expensive = ["course", "certification", "degree", "bootcamp", "conference"]
            .iter()
            .any(|k| lower.contains(k));
        let equipment = ["laptop", "software", "tools", "subscription"]
            .iter()
            .any(|k| lower.contains(k));
        let resource_requirements = match (expensive, equipment) {
            (true, true) => Level::High,
            (true, false) | (false, true) => Level::Medium,
            _ => Level::Low,
        };

        let mut dependencies = Vec::new();
        let job_related = words.contains("job") || words.contains("role") || words.contains("hired");
        if job_related {
            dependencies.extend(["resume", "portfolio", "interview_prep"].map(String::from));
        }
        if lower.contains("certification") {
            dependencies.extend(["study_materials", "practice_tests"].map(String::from));
        }
        if lower.contains("promotion") {
            dependencies.extend(["performance_review", "skill_development"].map(String::from));
        }

        let dependency_score = (dependencies.len() as f32 * 0.1).min(0.8);
        let score = 0.3 * skill_gap.score()
            + 0.2 * time_constraint.score()
            + 0.2 * resource_requirements.score()
            + 0.3 * dependency_score;

        let conjunctions = lower.matches(" and ").count() + lower.matches(',').count();
        let scope_items = dependencies.len() + tech + conjunctions;

        let mut risk_factors = Vec::new();
        if time_constraint == Level::High {
            risk_factors.push("Insufficient time to complete all necessary steps".to_string());
        }
        if skill_gap == Level::High {
            risk_factors.push("Significant learning curve may cause delays".to_string());
        }
        if resource_requirements == Level::High {
            risk_factors.push("High resource costs may limit progress".to_string());
        }
        if dependencies.len() > 3 {
            risk_factors.push("Multiple dependencies may create bottlenecks".to_string());
        }

        Self {
            category: GoalCategory::categorize(&text),
            skill_gap,
            time_constraint,
            resource_requirements,
            dependencies,
            skills,
            score,
            scope_items,
            job_related,
            risk_factors,
        }
    }

    /// Concrete strategy for an adaptive request
    pub fn resolve(&self, requested: PlanningStrategy) -> PlanningStrategy {
        if requested != PlanningStrategy::Adaptive {
            return requested;
        }
        if self.score > 0.7 {
            PlanningStrategy::Milestone
        } else if self.time_constraint == Level::High {
            PlanningStrategy::Parallel
        } else if self.score < 0.3 {
            PlanningStrategy::Linear
        } else {
            PlanningStrategy::Milestone
        }
    }
}

// ============================================================
// EFFORT POLICY
// ============================================================

pub struct EffortInput<'a> {
    pub goal: &'a Goal,
    pub analysis: &'a ComplexityAnalysis,
    pub horizon_weeks: f32,
    /// 1.0 for a normal plan, below 1.0 for a reduced-scope replan
    pub effort_scale: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffortEstimate {
    pub budget_hours: f32,
    pub chunk_hours: f32,
    /// Per-task effort in hours, in plan order
    pub efforts: Vec<f32>,
    /// Phase cluster of each task, in plan order
    pub clusters: Vec<u32>,
}

pub trait EffortPolicy: Send + Sync {
    fn estimate(&self, input: &EffortInput<'_>) -> EffortEstimate;
    fn hours_per_week(&self) -> f32;
}

const PHASE_WEIGHTS: [f32; 4] = [0.8, 1.3, 1.0, 0.7];
const PHASE_NAMES: [&str; 4] = ["Foundation", "Development", "Application", "Achievement"];

fn phase_of(cluster: u32, cluster_count: u32) -> usize {
    ((cluster * 4) / cluster_count.max(1)) as usize
}

/// Budget-driven policy: available hours over the horizon, split into
/// chunks whose size shrinks as the goal's scope broadens.
#[derive(Debug, Clone)]
pub struct HeuristicEffortPolicy {
    config: PlannerConfig,
}

impl HeuristicEffortPolicy {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }
}

impl EffortPolicy for HeuristicEffortPolicy {
    fn estimate(&self, input: &EffortInput<'_>) -> EffortEstimate {
        let c = &self.config;
        let budget = (input.horizon_weeks * c.hours_per_week * c.utilization * input.effort_scale).max(1.0);
        let chunk = (c.base_chunk_hours / (1.0 + 0.25 * input.analysis.scope_items as f32)).max(2.0);
        let count = ((budget / chunk).ceil() as usize).clamp(c.min_tasks, c.max_tasks);

        let cluster_count = count.min(4) as u32;
        let clusters: Vec<u32> = (0..count)
            .map(|i| ((i as u32) * cluster_count) / count as u32)
            .collect();
        let weights: Vec<f32> = clusters
            .iter()
            .map(|cl| PHASE_WEIGHTS[phase_of(*cl, cluster_count)])
            .collect();
        let weight_sum: f32 = weights.iter().sum();
        let efforts = weights
            .iter()
            .map(|w| (((budget * w / weight_sum) * 2.0).round() / 2.0).max(1.0))
            .collect();

        EffortEstimate {
            budget_hours: budget,
            chunk_hours: chunk,
            efforts,
            clusters,
        }
    }

    fn hours_per_week(&self) -> f32 {
        self.config.hours_per_week
    }
}

// ============================================================
// PLAN TYPES
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Feasibility {
    Feasible,
    Challenging,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneCluster {
    pub index: u32,
    pub name: String,
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningInsight {
    pub kind: String,
    pub description: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub goal_id: String,
    pub requested_strategy: PlanningStrategy,
    pub strategy: PlanningStrategy,
    pub tasks: Vec<Task>,
    pub clusters: Vec<MilestoneCluster>,
    pub total_effort_hours: f32,
    /// Length of the critical path through the task graph
    pub total_duration_hours: f32,
    pub total_duration_weeks: f32,
    pub total_duration_days: u32,
    pub feasibility: Feasibility,
    pub analysis: ComplexityAnalysis,
    pub insights: Vec<PlanningInsight>,
    pub effort_scale: f32,
    pub created_at: DateTime<Utc>,
}

/// What is kept about the current plan of a goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub goal_id: String,
    pub strategy: PlanningStrategy,
    pub effort_scale: f32,
    pub total_duration_hours: f32,
    pub revision: u32,
    pub created_at: DateTime<Utc>,
}

// ============================================================
// GRAPH HELPERS
// ============================================================

/// Topological order of `tasks`, or an error on cycles or foreign dependencies
pub fn topological_order(tasks: &[Task]) -> AgentResult<Vec<String>> {
    let ids: HashMap<&str, usize> = tasks.iter().enumerate().map(|(i, t)| (t.id.as_str(), i)).collect();
    let mut indegree = vec![0usize; tasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];

    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.depends_on {
            let &d = ids.get(dep.as_str()).ok_or_else(|| {
                AgentError::invalid_state(format!(
                    "task {} depends on {} outside goal {}",
                    task.id, dep, task.goal_id
                ))
            })?;
            if tasks[d].goal_id != task.goal_id {
                return Err(AgentError::invalid_state(format!(
                    "task {} depends on a task of another goal",
                    task.id
                )));
            }
            indegree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..tasks.len()).filter(|i| indegree[*i] == 0).collect();
    let mut order = Vec::with_capacity(tasks.len());
    while let Some(i) = ready.pop_front() {
        order.push(tasks[i].id.clone());
        for &j in &dependents[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.push_back(j);
            }
        }
    }

    if order.len() != tasks.len() {
        return Err(AgentError::invalid_state("task graph contains a cycle"));
    }
    Ok(order)
}

/// Longest effort-weighted path through the graph
pub fn critical_path_hours(tasks: &[Task]) -> AgentResult<f32> {
    let order = topological_order(tasks)?;
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut finish: HashMap<&str, f32> = HashMap::new();
    let mut longest = 0.0f32;

    for id in &order {
        let task = by_id[id.as_str()];
        let start = task
            .depends_on
            .iter()
            .map(|d| finish.get(d.as_str()).copied().unwrap_or(0.0))
            .fold(0.0, f32::max);
        let end = start + task.estimated_effort;
        longest = longest.max(end);
        finish.insert(task.id.as_str(), end);
    }
    Ok(longest)
}

// ============================================================
// TITLES
// ============================================================

fn focus_of(goal: &Goal) -> String {
    static TAIL: OnceLock<Regex> = OnceLock::new();
    let tail = TAIL.get_or_init(|| {
        Regex::new(r"(?i)\s+(in|within|by|over|before)\s+.*$").expect("focus regex is valid")
    });
    let trimmed = tail.replace(goal.title.trim(), "").to_string();
    let mut words: Vec<&str> = trimmed.split_whitespace().collect();
    const VERBS: [&str; 12] = [
        "learn", "build", "complete", "earn", "get", "develop", "create", "improve", "achieve",
        "obtain", "master", "become",
    ];
    if words
        .first()
        .map(|w| VERBS.contains(&w.to_lowercase().as_str()))
        .unwrap_or(false)
    {
        words.remove(0);
    }
    let focus = words.join(" ");
    if focus.is_empty() {
        "the goal".to_string()
    } else {
        focus
    }
}

fn phase_templates(category: GoalCategory, phase: usize, job_related: bool) -> &'static [&'static str] {
    use GoalCategory::*;
    match (phase, category) {
        (0, SoftwareDeveloper) => &["Research {focus} requirements", "Set up learning environment", "Create study schedule"],
        (0, DataScientist) => &["Assess current technical skills", "Identify skill gaps", "Select learning resources"],
        (0, ProductManager) => &["Study product strategy fundamentals", "Map stakeholders and success metrics", "Create study schedule"],
        (0, Marketing) => &["Audit current marketing skills", "Choose channels to focus on", "Create study schedule"],
        (0, Sales) => &["Review sales methodology basics", "Define target accounts", "Create practice schedule"],
        (0, General) => &["Define scope for {focus}", "Gather learning resources", "Create study schedule"],
        (1, SoftwareDeveloper) => &["Complete core {focus} course", "Build first portfolio project", "Learn version control (Git)", "Build second portfolio project"],
        (1, DataScientist) => &["Master data analysis tools", "Complete statistics course", "Work on data projects"],
        (1, ProductManager) => &["Complete product strategy course", "Write a product strategy document", "Practice stakeholder management"],
        (1, Marketing) => &["Complete digital marketing course", "Run a small campaign", "Analyze campaign metrics"],
        (1, Sales) => &["Practice discovery calls", "Build a pipeline of prospects", "Track revenue metrics"],
        (1, General) => &["Study core {focus} material", "Practice {focus} weekly", "Complete a guided {focus} exercise"],
        (2, _) if job_related => &["Update resume and LinkedIn", "Practice interview skills", "Network with professionals", "Apply to target positions"],
        (2, _) => &["Build a capstone project with {focus}", "Get feedback from a mentor", "Publish your work"],
        (_, _) if job_related => &["Prepare for final interviews", "Negotiate job offers", "Complete goal reflection"],
        (_, _) => &["Demonstrate {focus} against success criteria", "Complete goal reflection"],
    }
}

fn template_titles(goal: &Goal, analysis: &ComplexityAnalysis, clusters: &[u32]) -> Vec<String> {
    let focus = focus_of(goal);
    let cluster_count = clusters.iter().max().map(|m| m + 1).unwrap_or(1);
    let mut seen_in_cluster: HashMap<u32, usize> = HashMap::new();

    clusters
        .iter()
        .map(|cluster| {
            let n = seen_in_cluster.entry(*cluster).or_insert(0);
            let templates = phase_templates(
                analysis.category,
                phase_of(*cluster, cluster_count),
                analysis.job_related,
            );
            let base = templates[*n % templates.len()].replace("{focus}", &focus);
            let title = if *n >= templates.len() {
                format!("{} (part {})", base, *n / templates.len() + 1)
            } else {
                base
            };
            *n += 1;
            title
        })
        .collect()
}

/// One title per line; bullets and numbering are stripped
fn parse_generated_titles(output: &str, limit: usize) -> Vec<String> {
    output
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '-' | '*' | '.' | ')'))
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty() && line.chars().count() <= 80)
        .take(limit)
        .collect()
}

// ============================================================
// TASK PLANNER
// ============================================================

pub struct TaskPlanner {
    registry: Arc<StateRegistry>,
    policy: Arc<dyn EffortPolicy>,
    generator: Option<Arc<dyn TextGenerator>>,
    guard: CapabilityGuard,
    max_tokens: usize,
    default_horizon_weeks: u32,
}

impl TaskPlanner {
    pub fn new(
        registry: Arc<StateRegistry>,
        policy: Arc<dyn EffortPolicy>,
        guard: CapabilityGuard,
        config: &PlannerConfig,
    ) -> Self {
        Self {
            registry,
            policy,
            generator: None,
            guard,
            max_tokens: 256,
            default_horizon_weeks: config.default_horizon_weeks,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>, max_tokens: usize) -> Self {
        self.generator = Some(generator);
        self.max_tokens = max_tokens;
        self
    }

    pub fn create_comprehensive_plan(
        &self,
        user_id: &str,
        goal_id: &str,
        strategy: PlanningStrategy,
    ) -> AgentResult<TaskPlan> {
        self.create_comprehensive_plan_at(user_id, goal_id, strategy, Utc::now())
    }

    /// Build a plan for a finalized goal and replace its task set
    pub fn create_comprehensive_plan_at(
        &self,
        user_id: &str,
        goal_id: &str,
        strategy: PlanningStrategy,
        now: DateTime<Utc>,
    ) -> AgentResult<TaskPlan> {
        let goal = self.registry.snapshot(user_id).goal(goal_id)?.clone();
        require_finalized(&goal)?;

        let plan = self.draft_plan(&goal, strategy, 1.0, now)?;
        self.registry
            .write(user_id, |state| commit_plan(state, &plan, now))?;

        log::info!(
            "[PLANNER] Planned goal {} with {} strategy: {} tasks, {:.1} weeks",
            goal_id,
            plan.strategy.as_str(),
            plan.tasks.len(),
            plan.total_duration_weeks
        );
        Ok(plan)
    }

    /// Compute a plan without touching state
    pub(crate) fn draft_plan(
        &self,
        goal: &Goal,
        requested: PlanningStrategy,
        effort_scale: f32,
        now: DateTime<Utc>,
    ) -> AgentResult<TaskPlan> {
        require_finalized(goal)?;
        let today = now.date_naive();
        let analysis = ComplexityAnalysis::of(goal, today);
        let strategy = analysis.resolve(requested);

        let horizon_weeks = match goal.deadline {
            Some(deadline) => ((deadline - today).num_days() as f32 / 7.0).max(1.0),
            None => self.default_horizon_weeks as f32,
        };
        let estimate = self.policy.estimate(&EffortInput {
            goal,
            analysis: &analysis,
            horizon_weeks,
            effort_scale,
        });
        check_estimate(&estimate, self.policy.hours_per_week())?;

        let mut titles = template_titles(goal, &analysis, &estimate.clusters);
        if let Some(generator) = &self.generator {
            let prompt = format!(
                "List {} short, concrete task titles, one per line, for this goal: {}\nSuccess criteria: {}",
                titles.len(),
                goal.description,
                goal.smart.measurable.as_deref().unwrap_or("not stated")
            );
            let output = self.guard.generate(generator, &prompt, self.max_tokens)?;
            for (slot, generated) in titles
                .iter_mut()
                .zip(parse_generated_titles(&output, estimate.efforts.len()))
            {
                *slot = generated;
            }
        }

        let mut tasks: Vec<Task> = titles
            .iter()
            .zip(&estimate.efforts)
            .map(|(title, effort)| Task::new(&goal.id, title, *effort, now))
            .collect();
        let clusters = link(&mut tasks, strategy, &estimate.clusters);

        let total_effort_hours = EffortTotals::of(&tasks).total;
        let total_duration_hours = critical_path_hours(&tasks)?;
        let hours_per_week = self.policy.hours_per_week();
        let total_duration_weeks = total_duration_hours / hours_per_week;

        let weeks_available = goal
            .deadline
            .map(|d| (d - today).num_days() as f32 / 7.0)
            .unwrap_or(self.default_horizon_weeks as f32);
        let feasibility = if total_duration_weeks <= weeks_available {
            Feasibility::Feasible
        } else {
            Feasibility::Challenging
        };

        let insights = planning_insights(goal, &analysis, feasibility, effort_scale);

        Ok(TaskPlan {
            goal_id: goal.id.clone(),
            requested_strategy: requested,
            strategy,
            tasks,
            clusters,
            total_effort_hours,
            total_duration_hours,
            total_duration_weeks,
            total_duration_days: (total_duration_weeks * 7.0).ceil() as u32,
            feasibility,
            analysis,
            insights,
            effort_scale,
            created_at: now,
        })
    }

    pub fn update_task_status(
        &self,
        user_id: &str,
        goal_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> AgentResult<Task> {
        self.update_task_status_at(user_id, goal_id, task_id, status, Utc::now())
    }

    /// Move one task to `status` and recompute the goal's progress
    ///
    /// A task can only become active or completed once everything it
    /// depends on is completed. Completed tasks stay completed.
    pub fn update_task_status_at(
        &self,
        user_id: &str,
        goal_id: &str,
        task_id: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> AgentResult<Task> {
        self.registry.write(user_id, |state| {
            let goal = state.goal(goal_id)?;
            if goal.status != GoalStatus::Finalized {
                return Err(AgentError::invalid_state(format!(
                    "goal {} is {}; tasks can only change on a finalized goal",
                    goal_id,
                    goal.status.as_str()
                )));
            }

            let tasks = state.tasks.get(goal_id).map(Vec::as_slice).unwrap_or(&[]);
            let index = tasks
                .iter()
                .position(|t| t.id == task_id)
                .ok_or_else(|| AgentError::not_found(format!("task {} in goal {}", task_id, goal_id)))?;
            let task = &tasks[index];

            if task.status == status {
                return Ok(task.clone());
            }
            if task.is_completed() {
                return Err(AgentError::invalid_state(format!(
                    "task {} is completed and cannot be reopened",
                    task_id
                )));
            }
            if matches!(status, TaskStatus::Active | TaskStatus::Completed) {
                let blocked_by: Vec<&str> = task
                    .depends_on
                    .iter()
                    .filter(|dep| !tasks.iter().any(|t| &t.id == *dep && t.is_completed()))
                    .map(String::as_str)
                    .collect();
                if !blocked_by.is_empty() {
                    return Err(AgentError::invalid_state(format!(
                        "task {} waits on {} unfinished dependencies",
                        task_id,
                        blocked_by.len()
                    )));
                }
            }

            let updated = {
                let tasks = state.tasks.entry(goal_id.to_string()).or_default();
                let task = &mut tasks[index];
                task.status = status;
                task.updated_at = now;
                task.clone()
            };
            state.last_status_change.insert(goal_id.to_string(), now);
            let progress = state.refresh_progress(goal_id, now)?;
            log::info!(
                "[PLANNER] Task {} -> {} (goal {} at {:.0}%)",
                task_id,
                status.as_str(),
                goal_id,
                progress * 100.0
            );
            Ok(updated)
        })
    }

    pub fn tasks(&self, user_id: &str, goal_id: &str) -> AgentResult<Vec<Task>> {
        let snapshot = self.registry.snapshot(user_id);
        snapshot.goal(goal_id)?;
        Ok(snapshot.tasks_of(goal_id).to_vec())
    }

    pub fn plan_record(&self, user_id: &str, goal_id: &str) -> Option<PlanRecord> {
        self.registry.snapshot(user_id).plans.get(goal_id).cloned()
    }
}

fn require_finalized(goal: &Goal) -> AgentResult<()> {
    if goal.status != GoalStatus::Finalized {
        let open = open_questions(goal).len();
        return Err(AgentError::invalid_state(format!(
            "goal {} is {} ({} open SMART questions); only finalized goals can be planned",
            goal.id,
            goal.status.as_str(),
            open
        )));
    }
    Ok(())
}

/// Reject policy output the planner cannot lay out
fn check_estimate(estimate: &EffortEstimate, hours_per_week: f32) -> AgentResult<()> {
    if estimate.efforts.is_empty() {
        return Err(AgentError::invalid_state("effort policy produced no tasks"));
    }
    if estimate.clusters.len() != estimate.efforts.len() {
        return Err(AgentError::invalid_state(format!(
            "effort policy produced {} efforts but {} clusters",
            estimate.efforts.len(),
            estimate.clusters.len()
        )));
    }
    if let Some(bad) = estimate.efforts.iter().find(|e| !e.is_finite() || **e <= 0.0) {
        return Err(AgentError::invalid_state(format!("effort policy produced effort {}", bad)));
    }
    // clusters start at 0 and step by at most one, in plan order
    let mut previous = 0;
    for (i, cluster) in estimate.clusters.iter().enumerate() {
        let valid = if i == 0 {
            *cluster == 0
        } else {
            *cluster == previous || *cluster == previous + 1
        };
        if !valid {
            return Err(AgentError::invalid_state(format!(
                "effort policy cluster {} at task {} is out of order",
                cluster, i
            )));
        }
        previous = *cluster;
    }
    if !hours_per_week.is_finite() || hours_per_week <= 0.0 {
        return Err(AgentError::invalid_state(format!(
            "effort policy reports {} hours per week",
            hours_per_week
        )));
    }
    Ok(())
}

/// Wire dependencies for `strategy` and return the milestone clusters
fn link(tasks: &mut [Task], strategy: PlanningStrategy, clusters: &[u32]) -> Vec<MilestoneCluster> {
    let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    match strategy {
        PlanningStrategy::Parallel => {
            for task in tasks.iter_mut().skip(1) {
                task.depends_on.insert(ids[0].clone());
            }
            tasks[0].milestone = true;
            Vec::new()
        }
        PlanningStrategy::Milestone | PlanningStrategy::Adaptive => {
            let cluster_count = clusters.iter().max().map(|m| m + 1).unwrap_or(1);
            let mut grouped: Vec<MilestoneCluster> = (0..cluster_count)
                .map(|index| MilestoneCluster {
                    index,
                    name: PHASE_NAMES[phase_of(index, cluster_count)].to_string(),
                    task_ids: Vec::new(),
                })
                .collect();
            for (i, cluster) in clusters.iter().enumerate() {
                grouped[*cluster as usize].task_ids.push(ids[i].clone());
            }
            for (i, task) in tasks.iter_mut().enumerate() {
                let cluster = clusters[i];
                task.cluster = Some(cluster);
                if cluster > 0 {
                    task.depends_on
                        .extend(grouped[cluster as usize - 1].task_ids.iter().cloned());
                }
                task.milestone = grouped[cluster as usize].task_ids.last() == Some(&ids[i]);
            }
            grouped
        }
        PlanningStrategy::Linear => {
            for i in 1..tasks.len() {
                tasks[i].depends_on.insert(ids[i - 1].clone());
            }
            if let Some(last) = tasks.last_mut() {
                last.milestone = true;
            }
            Vec::new()
        }
    }
}

fn planning_insights(
    goal: &Goal,
    analysis: &ComplexityAnalysis,
    feasibility: Feasibility,
    effort_scale: f32,
) -> Vec<PlanningInsight> {
    let mut insights = Vec::new();
    if feasibility == Feasibility::Challenging {
        insights.push(PlanningInsight {
            kind: "time_pressure".to_string(),
            description: "The planned timeline is ambitious given the scope of work".to_string(),
            recommendations: vec![
                "Consider extending the deadline".to_string(),
                "Prioritize most critical tasks".to_string(),
                "Increase weekly time commitment".to_string(),
            ],
        });
    }
    if analysis.skill_gap == Level::High {
        insights.push(PlanningInsight {
            kind: "skill_development".to_string(),
            description: "Significant skill development will be required".to_string(),
            recommendations: vec![
                "Allocate extra time for learning".to_string(),
                "Consider mentorship or courses".to_string(),
                "Start with foundational skills".to_string(),
            ],
        });
    }
    if analysis.resource_requirements == Level::High {
        insights.push(PlanningInsight {
            kind: "resource_planning".to_string(),
            description: "This goal will require significant resources".to_string(),
            recommendations: vec![
                "Budget for courses and tools".to_string(),
                "Look for free alternatives".to_string(),
            ],
        });
    }
    if effort_scale < 1.0 {
        insights.push(PlanningInsight {
            kind: "reduced_scope".to_string(),
            description: format!(
                "Scope for '{}' reduced to {:.0}% after stalled progress",
                goal.title,
                effort_scale * 100.0
            ),
            recommendations: vec!["Focus on one task at a time".to_string()],
        });
    }
    for risk in &analysis.risk_factors {
        insights.push(PlanningInsight {
            kind: "risk".to_string(),
            description: risk.clone(),
            recommendations: Vec::new(),
        });
    }
    insights
}

/// Install `plan` as the goal's task set inside an open state write
///
/// Replaced tasks that a stored report refers to move to the archive; the
/// rest are dropped.
pub(crate) fn commit_plan(state: &mut UserState, plan: &TaskPlan, now: DateTime<Utc>) -> AgentResult<()> {
    require_finalized(state.goal(&plan.goal_id)?)?;
    topological_order(&plan.tasks)?;

    let replaced = state
        .tasks
        .insert(plan.goal_id.clone(), plan.tasks.clone())
        .unwrap_or_default();
    let archived: Vec<Task> = replaced
        .into_iter()
        .filter(|t| state.report_references(&t.id))
        .collect();
    state.archived_tasks.extend(archived);

    let revision = state
        .plans
        .get(&plan.goal_id)
        .map(|p| p.revision + 1)
        .unwrap_or(1);
    state.plans.insert(
        plan.goal_id.clone(),
        PlanRecord {
            goal_id: plan.goal_id.clone(),
            strategy: plan.strategy,
            effort_scale: plan.effort_scale,
            total_duration_hours: plan.total_duration_hours,
            revision,
            created_at: now,
        },
    );
    state.last_status_change.insert(plan.goal_id.clone(), now);
    state.refresh_progress(&plan.goal_id, now)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::SmartCriteria;
    use crate::capabilities::MockTextGenerator;
    use chrono::Duration;

    fn finalized_goal(user: &str, description: &str, deadline_days: Option<i64>, now: DateTime<Utc>) -> Goal {
        let mut goal = Goal::new(user, description, now);
        goal.status = GoalStatus::Finalized;
        goal.smart = SmartCriteria {
            specific: Some(description.to_string()),
            measurable: Some("3 projects".to_string()),
            achievable: Some("10h/week".to_string()),
            relevant: Some("career".to_string()),
            time_bound: Some("6 months".to_string()),
        };
        goal.deadline = deadline_days.map(|d| now.date_naive() + Duration::days(d));
        goal
    }

    fn planner_with_goal(goal: &Goal) -> (TaskPlanner, Arc<StateRegistry>) {
        let registry = Arc::new(StateRegistry::in_memory());
        registry
            .write(&goal.user_id, |state| {
                state.goals.insert(goal.id.clone(), goal.clone());
                Ok(())
            })
            .unwrap();
        let planner = TaskPlanner::new(
            Arc::clone(&registry),
            Arc::new(HeuristicEffortPolicy::new(PlannerConfig::default())),
            CapabilityGuard::new(std::time::Duration::from_secs(1)),
            &PlannerConfig::default(),
        );
        (planner, registry)
    }

    fn sum(tasks: &[Task]) -> f32 {
        tasks.iter().map(|t| t.estimated_effort).sum()
    }

    #[test]
    fn test_linear_duration_is_sum() {
        let now = Utc::now();
        let goal = finalized_goal("u1", "Learn SQL", Some(90), now);
        let (planner, _) = planner_with_goal(&goal);
        let plan = planner
            .create_comprehensive_plan_at("u1", &goal.id, PlanningStrategy::Linear, now)
            .unwrap();

        assert!(plan.tasks.len() >= 3);
        assert!((plan.total_duration_hours - sum(&plan.tasks)).abs() < 1e-3);
        for pair in plan.tasks.windows(2) {
            assert_eq!(pair[1].depends_on, BTreeSet::from([pair[0].id.clone()]));
        }
        assert!(plan.tasks.last().unwrap().milestone);
    }

    #[test]
    fn test_parallel_duration_is_kickoff_plus_max() {
        let now = Utc::now();
        let goal = finalized_goal("u1", "Learn SQL", Some(90), now);
        let (planner, _) = planner_with_goal(&goal);
        let plan = planner
            .create_comprehensive_plan_at("u1", &goal.id, PlanningStrategy::Parallel, now)
            .unwrap();

        let kickoff = &plan.tasks[0];
        assert!(kickoff.depends_on.is_empty());
        let rest = &plan.tasks[1..];
        assert!(rest.iter().all(|t| t.depends_on == BTreeSet::from([kickoff.id.clone()])));
        let max_rest = rest.iter().map(|t| t.estimated_effort).fold(0.0, f32::max);
        assert!((plan.total_duration_hours - (kickoff.estimated_effort + max_rest)).abs() < 1e-3);
    }

    #[test]
    fn test_milestone_duration_is_sum_of_cluster_maxima() {
        let now = Utc::now();
        let goal = finalized_goal("u1", "Learn React in 6 months", Some(180), now);
        let (planner, _) = planner_with_goal(&goal);
        let plan = planner
            .create_comprehensive_plan_at("u1", &goal.id, PlanningStrategy::Milestone, now)
            .unwrap();

        assert!(!plan.clusters.is_empty() && plan.clusters.len() <= 4);
        let by_id: HashMap<&str, &Task> = plan.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let expected: f32 = plan
            .clusters
            .iter()
            .map(|c| c.task_ids.iter().map(|id| by_id[id.as_str()].estimated_effort).fold(0.0, f32::max))
            .sum();
        assert!((plan.total_duration_hours - expected).abs() < 1e-3);

        for window in plan.clusters.windows(2) {
            let previous: BTreeSet<String> = window[0].task_ids.iter().cloned().collect();
            for id in &window[1].task_ids {
                assert_eq!(by_id[id.as_str()].depends_on, previous);
            }
        }
        for cluster in &plan.clusters {
            let last = cluster.task_ids.last().unwrap();
            assert!(by_id[last.as_str()].milestone);
        }
        assert!(plan.total_duration_weeks <= 26.0);
    }

    #[test]
    fn test_plans_are_acyclic_for_every_strategy() {
        let now = Utc::now();
        let descriptions = [
            "Learn Python and SQL, then get a data analyst job",
            "Get an AWS certification",
            "Improve public speaking",
        ];
        for (i, description) in descriptions.iter().enumerate() {
            for deadline in [None, Some(10), Some(400)] {
                let goal = finalized_goal("u1", description, deadline, now);
                let (planner, _) = planner_with_goal(&goal);
                for strategy in [
                    PlanningStrategy::Linear,
                    PlanningStrategy::Parallel,
                    PlanningStrategy::Milestone,
                    PlanningStrategy::Adaptive,
                ] {
                    let plan = planner
                        .create_comprehensive_plan_at("u1", &goal.id, strategy, now)
                        .unwrap_or_else(|e| panic!("case {} {:?}: {}", i, strategy, e));
                    assert!(!plan.tasks.is_empty());
                    assert_eq!(topological_order(&plan.tasks).unwrap().len(), plan.tasks.len());
                    assert_ne!(plan.strategy, PlanningStrategy::Adaptive);
                }
            }
        }
    }

    #[test]
    fn test_longer_deadline_gives_more_tasks() {
        let now = Utc::now();
        let short = finalized_goal("u1", "Learn SQL", Some(28), now);
        let long = finalized_goal("u1", "Learn SQL", Some(300), now);
        let (planner_a, _) = planner_with_goal(&short);
        let (planner_b, _) = planner_with_goal(&long);

        let a = planner_a.draft_plan(&short, PlanningStrategy::Linear, 1.0, now).unwrap();
        let b = planner_b.draft_plan(&long, PlanningStrategy::Linear, 1.0, now).unwrap();
        assert!(b.tasks.len() > a.tasks.len());
    }

    #[test]
    fn test_cycle_detection() {
        let now = Utc::now();
        let mut a = Task::new("g", "a", 1.0, now);
        let mut b = Task::new("g", "b", 1.0, now);
        a.depends_on.insert(b.id.clone());
        b.depends_on.insert(a.id.clone());
        assert!(matches!(topological_order(&[a, b]), Err(AgentError::InvalidState(_))));
    }

    #[test]
    fn test_plan_requires_finalized_goal() {
        let now = Utc::now();
        let mut goal = finalized_goal("u1", "Learn SQL", Some(60), now);
        goal.status = GoalStatus::Clarifying;
        let (planner, _) = planner_with_goal(&goal);
        assert!(matches!(
            planner.create_comprehensive_plan("u1", &goal.id, PlanningStrategy::Linear),
            Err(AgentError::InvalidState(_))
        ));
    }

    #[test]
    fn test_task_status_respects_dependencies_and_updates_progress() {
        let now = Utc::now();
        let goal = finalized_goal("u1", "Learn SQL", Some(60), now);
        let (planner, registry) = planner_with_goal(&goal);
        let plan = planner
            .create_comprehensive_plan_at("u1", &goal.id, PlanningStrategy::Linear, now)
            .unwrap();
        let first = &plan.tasks[0];
        let second = &plan.tasks[1];

        assert!(matches!(
            planner.update_task_status("u1", &goal.id, &second.id, TaskStatus::Active),
            Err(AgentError::InvalidState(_))
        ));

        planner
            .update_task_status("u1", &goal.id, &first.id, TaskStatus::Completed)
            .unwrap();
        let progress = registry.snapshot("u1").goal(&goal.id).unwrap().progress;
        let expected = first.estimated_effort / sum(&plan.tasks);
        assert!((progress - expected).abs() < 1e-5);

        assert!(matches!(
            planner.update_task_status("u1", &goal.id, &first.id, TaskStatus::Pending),
            Err(AgentError::InvalidState(_))
        ));
        planner
            .update_task_status("u1", &goal.id, &second.id, TaskStatus::Active)
            .unwrap();
    }

    #[test]
    fn test_generated_titles_replace_templates() {
        let now = Utc::now();
        let goal = finalized_goal("u1", "Learn SQL", Some(60), now);
        let (planner, _) = planner_with_goal(&goal);
        let generator = MockTextGenerator::new("1. Install PostgreSQL\n- Write ten SELECT queries\n\n");
        let planner = planner.with_generator(Arc::new(generator), 64);

        let plan = planner
            .create_comprehensive_plan_at("u1", &goal.id, PlanningStrategy::Linear, now)
            .unwrap();
        assert_eq!(plan.tasks[0].title, "Install PostgreSQL");
        assert_eq!(plan.tasks[1].title, "Write ten SELECT queries");
        assert!(!plan.tasks[2].title.is_empty());
    }

    #[test]
    fn test_generator_failure_aborts_without_commit() {
        let now = Utc::now();
        let goal = finalized_goal("u1", "Learn SQL", Some(60), now);
        let (planner, registry) = planner_with_goal(&goal);
        let planner = planner.with_generator(Arc::new(MockTextGenerator::new("").failing(1)), 64);

        assert!(matches!(
            planner.create_comprehensive_plan("u1", &goal.id, PlanningStrategy::Linear),
            Err(AgentError::Generation(_))
        ));
        assert!(registry.snapshot("u1").tasks_of(&goal.id).is_empty());
    }

    #[test]
    fn test_adaptive_resolution() {
        let now = Utc::now();
        let urgent = finalized_goal("u1", "Improve public speaking", Some(14), now);
        let analysis = ComplexityAnalysis::of(&urgent, now.date_naive());
        assert_eq!(analysis.resolve(PlanningStrategy::Adaptive), PlanningStrategy::Parallel);

        let simple = finalized_goal("u1", "Improve public speaking", Some(200), now);
        let analysis = ComplexityAnalysis::of(&simple, now.date_naive());
        assert!(analysis.score < 0.3);
        assert_eq!(analysis.resolve(PlanningStrategy::Adaptive), PlanningStrategy::Linear);
        assert_eq!(analysis.resolve(PlanningStrategy::Milestone), PlanningStrategy::Milestone);
    }

    #[test]
    fn test_focus_and_category() {
        let now = Utc::now();
        let goal = finalized_goal("u1", "Learn React in 6 months", Some(180), now);
        assert_eq!(focus_of(&goal), "React");
        assert_eq!(
            GoalCategory::categorize("Learn React in 6 months"),
            GoalCategory::SoftwareDeveloper
        );
        assert_eq!(GoalCategory::categorize("grow my sales pipeline"), GoalCategory::Sales);
    }

    struct FixedPolicy {
        efforts: Vec<f32>,
        clusters: Vec<u32>,
        hours_per_week: f32,
    }

    impl EffortPolicy for FixedPolicy {
        fn estimate(&self, _input: &EffortInput<'_>) -> EffortEstimate {
            EffortEstimate {
                budget_hours: self.efforts.iter().sum(),
                chunk_hours: 4.0,
                efforts: self.efforts.clone(),
                clusters: self.clusters.clone(),
            }
        }

        fn hours_per_week(&self) -> f32 {
            self.hours_per_week
        }
    }

    fn plan_with(policy: FixedPolicy, strategy: PlanningStrategy) -> AgentResult<TaskPlan> {
        let now = Utc::now();
        let goal = finalized_goal("u1", "Learn SQL", Some(90), now);
        let registry = Arc::new(StateRegistry::in_memory());
        let planner = TaskPlanner::new(
            Arc::clone(&registry),
            Arc::new(policy),
            CapabilityGuard::new(std::time::Duration::from_secs(1)),
            &PlannerConfig::default(),
        );
        planner.draft_plan(&goal, strategy, 1.0, now)
    }

    #[test]
    fn test_malformed_effort_policy_output_is_rejected() {
        let cases = vec![
            (vec![4.0, 4.0, 4.0], vec![0, 1], 10.0),
            (vec![4.0, 4.0], vec![1, 1], 10.0),
            (vec![4.0, 4.0, 4.0], vec![0, 2, 2], 10.0),
            (vec![4.0, 4.0, 4.0], vec![0, 1, 0], 10.0),
            (vec![4.0, f32::NAN], vec![0, 0], 10.0),
            (vec![4.0, 0.0], vec![0, 1], 10.0),
            (vec![4.0, 4.0], vec![0, 1], 0.0),
            (Vec::new(), Vec::new(), 10.0),
        ];
        for (efforts, clusters, hours_per_week) in cases {
            let policy = FixedPolicy {
                efforts: efforts.clone(),
                clusters: clusters.clone(),
                hours_per_week,
            };
            let result = plan_with(policy, PlanningStrategy::Milestone);
            assert!(
                matches!(result, Err(AgentError::InvalidState(_))),
                "efforts {:?} clusters {:?} hours {}",
                efforts,
                clusters,
                hours_per_week
            );
        }

        let plan = plan_with(
            FixedPolicy {
                efforts: vec![2.0, 3.0, 3.0, 5.0],
                clusters: vec![0, 0, 1, 2],
                hours_per_week: 10.0,
            },
            PlanningStrategy::Milestone,
        )
        .unwrap();
        assert_eq!(plan.tasks.len(), 4);
        assert_eq!(plan.clusters.len(), 3);
        assert_eq!(plan.total_effort_hours, 13.0);
    }
}
