//! AutoMentor Types
//!
//! Core data structures shared by the memory, goal, planning, reflection
//! and orchestration layers.

use crate::error::AgentError;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================
// MEMORY RECORDS
// ============================================================

/// Kind of a stored memory
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Interaction,
    Fact,
    Reflection,
    /// A `key: value` preference; the newest value per key wins
    Preference,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Interaction => "interaction",
            MemoryKind::Fact => "fact",
            MemoryKind::Reflection => "reflection",
            MemoryKind::Preference => "preference",
        }
    }

    /// Importance a fresh memory of this kind starts with
    pub fn default_importance(&self) -> f32 {
        match self {
            MemoryKind::Interaction => 0.5,
            MemoryKind::Fact | MemoryKind::Preference => 0.6,
            MemoryKind::Reflection => 0.7,
        }
    }
}

impl FromStr for MemoryKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interaction" => Ok(MemoryKind::Interaction),
            "fact" => Ok(MemoryKind::Fact),
            "reflection" => Ok(MemoryKind::Reflection),
            "preference" => Ok(MemoryKind::Preference),
            other => Err(AgentError::validation(format!("unknown memory kind '{}'", other))),
        }
    }
}

/// A single embedded memory
///
/// Text and embedding never change after creation. Only `importance` moves,
/// through decay and reinforcement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub kind: MemoryKind,
    pub created_at: DateTime<Utc>,
    pub importance: f32,
}

impl MemoryRecord {
    pub fn new(user_id: &str, text: &str, embedding: Vec<f32>, kind: MemoryKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            text: text.to_string(),
            embedding,
            kind,
            created_at: Utc::now(),
            importance: kind.default_importance(),
        }
    }

    pub fn created(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }
}

// ============================================================
// GOALS
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Draft,
    Clarifying,
    Finalized,
    Completed,
    Abandoned,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::Draft => "draft",
            GoalStatus::Clarifying => "clarifying",
            GoalStatus::Finalized => "finalized",
            GoalStatus::Completed => "completed",
            GoalStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GoalStatus::Completed | GoalStatus::Abandoned)
    }
}

/// One of the five SMART dimensions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SmartField {
    Specific,
    Measurable,
    Achievable,
    Relevant,
    TimeBound,
}

impl SmartField {
    pub const ALL: [SmartField; 5] = [
        SmartField::Specific,
        SmartField::Measurable,
        SmartField::Achievable,
        SmartField::Relevant,
        SmartField::TimeBound,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SmartField::Specific => "specific",
            SmartField::Measurable => "measurable",
            SmartField::Achievable => "achievable",
            SmartField::Relevant => "relevant",
            SmartField::TimeBound => "time_bound",
        }
    }
}

/// SMART breakdown of a goal. A `None` field still needs an answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmartCriteria {
    pub specific: Option<String>,
    pub measurable: Option<String>,
    pub achievable: Option<String>,
    pub relevant: Option<String>,
    pub time_bound: Option<String>,
}

impl SmartCriteria {
    pub fn get(&self, field: SmartField) -> Option<&str> {
        match field {
            SmartField::Specific => self.specific.as_deref(),
            SmartField::Measurable => self.measurable.as_deref(),
            SmartField::Achievable => self.achievable.as_deref(),
            SmartField::Relevant => self.relevant.as_deref(),
            SmartField::TimeBound => self.time_bound.as_deref(),
        }
    }

    fn slot(&mut self, field: SmartField) -> &mut Option<String> {
        match field {
            SmartField::Specific => &mut self.specific,
            SmartField::Measurable => &mut self.measurable,
            SmartField::Achievable => &mut self.achievable,
            SmartField::Relevant => &mut self.relevant,
            SmartField::TimeBound => &mut self.time_bound,
        }
    }

    /// Fill `field` only if it is still empty. Returns whether it was filled.
    pub fn fill(&mut self, field: SmartField, value: String) -> bool {
        let slot = self.slot(field);
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }

    /// Fill every empty field from `other`, never overwriting
    pub fn merge_missing(&mut self, other: &SmartCriteria) {
        for field in SmartField::ALL {
            if let Some(value) = other.get(field) {
                self.fill(field, value.to_string());
            }
        }
    }

    pub fn missing_fields(&self) -> Vec<SmartField> {
        SmartField::ALL
            .into_iter()
            .filter(|f| self.get(*f).is_none())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// A user goal moving through draft -> clarifying -> finalized -> terminal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Goal {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub status: GoalStatus,
    pub smart: SmartCriteria,
    pub deadline: Option<NaiveDate>,
    pub priority: Priority,
    /// Completed effort over total effort of the goal's tasks
    pub progress: f32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(user_id: &str, description: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: derive_title(description),
            description: description.trim().to_string(),
            status: GoalStatus::Draft,
            smart: SmartCriteria::default(),
            deadline: None,
            priority: Priority::Medium,
            progress: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        !self.status.is_terminal() && self.deadline.map(|d| d < today).unwrap_or(false)
    }
}

/// First sentence of the description, capped to a headline length
fn derive_title(description: &str) -> String {
    let first = description
        .trim()
        .split(['.', '\n', '!', '?'])
        .next()
        .unwrap_or("")
        .trim();
    if first.chars().count() <= 80 {
        first.to_string()
    } else {
        let cut: String = first.chars().take(77).collect();
        format!("{}...", cut.trim_end())
    }
}

// ============================================================
// TASKS
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Blocked,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
        }
    }
}

/// A unit of work inside a goal's plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub goal_id: String,
    pub title: String,
    pub status: TaskStatus,
    /// Effort in hours
    pub estimated_effort: f32,
    pub depends_on: BTreeSet<String>,
    pub milestone: bool,
    /// Phase index for milestone plans
    pub cluster: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(goal_id: &str, title: &str, estimated_effort: f32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal_id: goal_id.to_string(),
            title: title.to_string(),
            status: TaskStatus::Pending,
            estimated_effort,
            depends_on: BTreeSet::new(),
            milestone: false,
            cluster: None,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Completed and total effort of a task set
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EffortTotals {
    pub completed: f32,
    pub total: f32,
}

impl EffortTotals {
    pub fn of(tasks: &[Task]) -> Self {
        tasks.iter().fold(Self::default(), |mut acc, t| {
            acc.total += t.estimated_effort;
            if t.is_completed() {
                acc.completed += t.estimated_effort;
            }
            acc
        })
    }

    pub fn add(self, other: EffortTotals) -> Self {
        Self {
            completed: self.completed + other.completed,
            total: self.total + other.total,
        }
    }

    /// 0.0 when there is no effort at all
    pub fn ratio(&self) -> f32 {
        if self.total <= 0.0 {
            0.0
        } else {
            (self.completed / self.total).clamp(0.0, 1.0)
        }
    }
}

// ============================================================
// REFLECTION
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionType {
    Daily,
    Weekly,
    Monthly,
    OnDemand,
}

impl ReflectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReflectionType::Daily => "daily",
            ReflectionType::Weekly => "weekly",
            ReflectionType::Monthly => "monthly",
            ReflectionType::OnDemand => "on_demand",
        }
    }

    /// Interval between scheduled reflections, `None` for on-demand
    pub fn cadence(&self) -> Option<Duration> {
        match self {
            ReflectionType::Daily => Some(Duration::days(1)),
            ReflectionType::Weekly => Some(Duration::days(7)),
            ReflectionType::Monthly => Some(Duration::days(30)),
            ReflectionType::OnDemand => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalHealth {
    OnTrack,
    AtRisk,
    Stalled,
}

/// Per-goal outcome of one reflection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoalAssessment {
    pub goal_id: String,
    pub title: String,
    pub progress: f32,
    pub expected_progress: Option<f32>,
    pub health: GoalHealth,
    pub replanned: bool,
    pub completed: bool,
    /// Task ids this report references; replanning archives them
    pub task_ids: Vec<String>,
}

/// Overall progress classification of a report
///
/// Scored from schedule adherence of the planned goals (70%) and the share
/// of recent days with user interaction (30%).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressTrend {
    /// Ahead of schedule
    Excellent,
    Good,
    /// Slightly behind
    Moderate,
    /// Significantly behind
    Poor,
    #[default]
    Stagnant,
}

impl ProgressTrend {
    pub fn from_score(score: f32) -> Self {
        if score >= 0.9 {
            ProgressTrend::Excellent
        } else if score >= 0.7 {
            ProgressTrend::Good
        } else if score >= 0.5 {
            ProgressTrend::Moderate
        } else if score >= 0.3 {
            ProgressTrend::Poor
        } else {
            ProgressTrend::Stagnant
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressTrend::Excellent => "excellent",
            ProgressTrend::Good => "good",
            ProgressTrend::Moderate => "moderate",
            ProgressTrend::Poor => "poor",
            ProgressTrend::Stagnant => "stagnant",
        }
    }
}

/// Immutable output of one reflection cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReflectionReport {
    pub id: String,
    pub user_id: String,
    pub goal_ids: Vec<String>,
    pub reflection_type: ReflectionType,
    pub overall_progress: f32,
    #[serde(default)]
    pub trend: ProgressTrend,
    pub assessments: Vec<GoalAssessment>,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub actions: Vec<ToolAction>,
    pub generated_at: DateTime<Utc>,
}

impl ReflectionReport {
    pub fn assessment(&self, goal_id: &str) -> Option<&GoalAssessment> {
        self.assessments.iter().find(|a| a.goal_id == goal_id)
    }

    pub fn needs_attention(&self) -> bool {
        self.assessments
            .iter()
            .any(|a| matches!(a.health, GoalHealth::AtRisk | GoalHealth::Stalled))
    }
}

// ============================================================
// TOOL ACTIONS
// ============================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobFilters {
    pub keywords: Vec<String>,
    pub location: Option<String>,
    pub remote_only: bool,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPosting {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub remote: bool,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeRequest {
    pub user_id: String,
    pub target_role: Option<String>,
    pub template: String,
    /// Fact memories surfaced into the summary section
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderedDocument {
    pub template: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalendarEvent {
    pub user_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfirmation {
    pub event_id: String,
    pub starts_at: DateTime<Utc>,
}

/// A tool invocation recommended by a reflection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToolAction {
    SearchJobs {
        goal_id: String,
        filters: JobFilters,
    },
    RenderResume {
        goal_id: String,
        template: String,
        target_role: Option<String>,
    },
    ScheduleSessions {
        goal_id: String,
        sessions: u32,
        session_minutes: u32,
    },
}

impl ToolAction {
    pub fn tool_name(&self) -> &'static str {
        match self {
            ToolAction::SearchJobs { .. } => "job_search",
            ToolAction::RenderResume { .. } => "resume_renderer",
            ToolAction::ScheduleSessions { .. } => "calendar",
        }
    }

    pub fn goal_id(&self) -> &str {
        match self {
            ToolAction::SearchJobs { goal_id, .. }
            | ToolAction::RenderResume { goal_id, .. }
            | ToolAction::ScheduleSessions { goal_id, .. } => goal_id,
        }
    }
}

// ============================================================
// TRIGGERS
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Reflection,
    CheckIn,
    DeadlineWarning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTrigger {
    pub id: String,
    pub user_id: String,
    pub fires_at: DateTime<Utc>,
    pub kind: TriggerKind,
    pub goal_id: Option<String>,
}

impl ScheduledTrigger {
    pub fn new(user_id: &str, kind: TriggerKind, fires_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            fires_at,
            kind,
            goal_id: None,
        }
    }

    pub fn for_goal(mut self, goal_id: &str) -> Self {
        self.goal_id = Some(goal_id.to_string());
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smart_fill_never_overwrites() {
        let mut smart = SmartCriteria {
            specific: Some("Learn React".to_string()),
            ..Default::default()
        };
        assert!(!smart.fill(SmartField::Specific, "Learn Vue".to_string()));
        assert!(smart.fill(SmartField::Measurable, "3 projects".to_string()));
        assert_eq!(smart.get(SmartField::Specific), Some("Learn React"));
        assert_eq!(
            smart.missing_fields(),
            vec![SmartField::Achievable, SmartField::Relevant, SmartField::TimeBound]
        );
    }

    #[test]
    fn test_effort_totals_ratio() {
        let now = Utc::now();
        let mut a = Task::new("g", "a", 6.0, now);
        let b = Task::new("g", "b", 2.0, now);
        a.status = TaskStatus::Completed;

        let totals = EffortTotals::of(&[a, b]);
        assert_eq!(totals.ratio(), 0.75);
        assert_eq!(EffortTotals::of(&[]).ratio(), 0.0);
    }

    #[test]
    fn test_goal_title_from_description() {
        let goal = Goal::new("u1", "Learn React in 6 months. Then get hired.", Utc::now());
        assert_eq!(goal.title, "Learn React in 6 months");
        assert_eq!(goal.status, GoalStatus::Draft);
    }

    #[test]
    fn test_cadence() {
        assert_eq!(ReflectionType::Weekly.cadence(), Some(Duration::days(7)));
        assert_eq!(ReflectionType::OnDemand.cadence(), None);
    }

    #[test]
    fn test_tool_action_serializes_tagged() {
        let action = ToolAction::ScheduleSessions {
            goal_id: "g1".to_string(),
            sessions: 3,
            session_minutes: 60,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "schedule_sessions");
        assert_eq!(action.tool_name(), "calendar");
    }

    #[test]
    fn test_memory_kind_parses_stored_names() {
        for kind in [
            MemoryKind::Interaction,
            MemoryKind::Fact,
            MemoryKind::Reflection,
            MemoryKind::Preference,
        ] {
            assert_eq!(kind.as_str().parse::<MemoryKind>().unwrap(), kind);
        }
        assert!(matches!("insight".parse::<MemoryKind>(), Err(AgentError::Validation(_))));
    }

    #[test]
    fn test_trend_thresholds() {
        assert_eq!(ProgressTrend::from_score(0.95), ProgressTrend::Excellent);
        assert_eq!(ProgressTrend::from_score(0.7), ProgressTrend::Good);
        assert_eq!(ProgressTrend::from_score(0.55), ProgressTrend::Moderate);
        assert_eq!(ProgressTrend::from_score(0.3), ProgressTrend::Poor);
        assert_eq!(ProgressTrend::from_score(0.1), ProgressTrend::Stagnant);
    }

    #[test]
    fn test_report_without_trend_deserializes() {
        let json = serde_json::json!({
            "id": "r1",
            "user_id": "u1",
            "goal_ids": [],
            "reflection_type": "weekly",
            "overall_progress": 0.0,
            "assessments": [],
            "insights": [],
            "recommendations": [],
            "actions": [],
            "generated_at": "2026-01-05T09:00:00Z"
        });
        let report: ReflectionReport = serde_json::from_value(json).unwrap();
        assert_eq!(report.trend, ProgressTrend::Stagnant);
    }
}
