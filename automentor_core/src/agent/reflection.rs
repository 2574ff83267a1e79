//! Progress Evaluator
//!
//! Periodic reflection over a user's goals: effort-weighted progress,
//! health classification, corrective replanning of stalled goals,
//! completion, and typed tool actions for the orchestrator to dispatch.
//!
//! Each reflection runs as one state write. A replan failure aborts the
//! whole reflection; the report is appended only when everything succeeded.

use super::goals::mark_completed;
use super::planner::{commit_plan, ComplexityAnalysis, GoalCategory, PlanningStrategy, TaskPlanner};
use super::recall::MemoryManager;
use super::types::{
    EffortTotals, Goal, GoalAssessment, GoalHealth, GoalStatus, JobFilters, MemoryKind, MemoryRecord,
    ProgressTrend, ReflectionReport, ReflectionType, ToolAction,
};
use crate::config::ReflectionConfig;
use crate::error::{AgentError, AgentResult};
use crate::state::{StateRegistry, UserState};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

const SESSION_MINUTES: u32 = 90;
const MAX_SESSIONS: u32 = 7;
const ACTIVITY_WINDOW_DAYS: i64 = 7;
const LOW_ENGAGEMENT_INTERACTIONS: usize = 3;
const LEARNING_KEYWORDS: [&str; 6] = ["learn", "study", "course", "tutorial", "practice", "skill"];
/// Progress change below this counts as flat
const TREND_EPSILON: f32 = 0.01;

/// Read-only progress of one goal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoalProgress {
    pub goal_id: String,
    pub title: String,
    pub status: GoalStatus,
    pub progress: f32,
    pub completed_hours: f32,
    pub total_hours: f32,
    pub deadline: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    pub user_id: String,
    pub overall_progress: f32,
    pub goals: Vec<GoalProgress>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

impl TrendDirection {
    fn of(points: &[ProgressPoint]) -> Self {
        match (points.first(), points.last()) {
            (Some(first), Some(last)) if points.len() >= 2 => {
                let delta = last.progress - first.progress;
                if delta > TREND_EPSILON {
                    TrendDirection::Improving
                } else if delta < -TREND_EPSILON {
                    TrendDirection::Declining
                } else {
                    TrendDirection::Stable
                }
            }
            _ => TrendDirection::InsufficientData,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressPoint {
    pub at: DateTime<Utc>,
    pub progress: f32,
}

/// Progress of one goal across the reports of a time window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoalTrend {
    pub goal_id: String,
    pub title: String,
    pub current_progress: f32,
    pub direction: TrendDirection,
    pub points: Vec<ProgressPoint>,
}

/// User interaction in the days before a reflection
#[derive(Debug, Clone, Default, PartialEq)]
struct Activity {
    interactions: usize,
    active_days: usize,
    learning_days: usize,
}

impl Activity {
    fn of(records: &[MemoryRecord], now: DateTime<Utc>) -> Self {
        let since = now - Duration::days(ACTIVITY_WINDOW_DAYS);
        let recent: Vec<&MemoryRecord> = records
            .iter()
            .filter(|r| r.kind == MemoryKind::Interaction && r.created_at > since && r.created_at <= now)
            .collect();
        let active: BTreeSet<NaiveDate> = recent.iter().map(|r| r.created_at.date_naive()).collect();
        let learning: BTreeSet<NaiveDate> = recent
            .iter()
            .filter(|r| {
                let text = r.text.to_lowercase();
                LEARNING_KEYWORDS.iter().any(|k| text.contains(k))
            })
            .map(|r| r.created_at.date_naive())
            .collect();
        Self {
            interactions: recent.len(),
            active_days: active.len(),
            learning_days: learning.len(),
        }
    }

    fn score(&self) -> f32 {
        (self.active_days as f32 / ACTIVITY_WINDOW_DAYS as f32).min(1.0)
    }

    /// Active on at least 70% of the window
    fn is_consistent(&self) -> bool {
        self.active_days * 10 >= ACTIVITY_WINDOW_DAYS as usize * 7
    }
}

pub struct ProgressEvaluator {
    registry: Arc<StateRegistry>,
    planner: Arc<TaskPlanner>,
    memory: Arc<MemoryManager>,
    config: ReflectionConfig,
}

/// What happened to one goal during a reflection, before it is written up
struct Outcome {
    assessment: GoalAssessment,
    totals: EffortTotals,
    replanned_with: Option<PlanningStrategy>,
    idle_days: i64,
}

impl ProgressEvaluator {
    pub fn new(
        registry: Arc<StateRegistry>,
        planner: Arc<TaskPlanner>,
        memory: Arc<MemoryManager>,
        config: ReflectionConfig,
    ) -> Self {
        Self {
            registry,
            planner,
            memory,
            config,
        }
    }

    pub fn conduct_reflection(
        &self,
        user_id: &str,
        goal_ids: &[String],
        reflection_type: ReflectionType,
    ) -> AgentResult<ReflectionReport> {
        self.conduct_reflection_at(user_id, goal_ids, reflection_type, Utc::now())
    }

    /// Assess `goal_ids` (every non-abandoned goal when empty) and append a report
    pub fn conduct_reflection_at(
        &self,
        user_id: &str,
        goal_ids: &[String],
        reflection_type: ReflectionType,
        now: DateTime<Utc>,
    ) -> AgentResult<ReflectionReport> {
        if user_id.trim().is_empty() {
            return Err(AgentError::validation("user_id is required"));
        }

        let activity = Activity::of(&self.memory.store().user_records(user_id), now);
        let report = self
            .registry
            .write(user_id, |state| self.reflect(state, goal_ids, reflection_type, &activity, now))?;

        let attention = report.assessments.iter().filter(|a| a.health != GoalHealth::OnTrack).count();
        log::info!(
            "[REFLECT] {} reflection for {}: {} goals, {:.0}% overall ({}), {} need attention",
            reflection_type.as_str(),
            user_id,
            report.assessments.len(),
            report.overall_progress * 100.0,
            report.trend.as_str(),
            attention
        );

        for assessment in report.assessments.iter().filter(|a| a.replanned) {
            self.remember_after_commit(
                user_id,
                &format!(
                    "Re-planned '{}' with reduced scope after progress stalled",
                    assessment.title
                ),
                now,
            );
        }
        self.remember_after_commit(user_id, &summary_line(&report), now);

        Ok(report)
    }

    fn reflect(
        &self,
        state: &mut UserState,
        goal_ids: &[String],
        reflection_type: ReflectionType,
        activity: &Activity,
        now: DateTime<Utc>,
    ) -> AgentResult<ReflectionReport> {
        let ids: Vec<String> = if goal_ids.is_empty() {
            state
                .goals
                .values()
                .filter(|g| g.status != GoalStatus::Abandoned)
                .map(|g| g.id.clone())
                .collect()
        } else {
            for id in goal_ids {
                state.goal(id)?;
            }
            goal_ids.to_vec()
        };

        let mut overall = EffortTotals::default();
        let mut insights = Vec::new();
        let mut recommendations = Vec::new();
        let mut actions = Vec::new();
        let mut assessments = Vec::with_capacity(ids.len());

        for goal_id in &ids {
            let outcome = self.assess_goal(state, goal_id, reflection_type, now)?;
            overall = overall.add(outcome.totals);

            let goal = state.goal(goal_id)?;
            describe(&outcome, goal, &mut insights, &mut recommendations);
            if goal.status == GoalStatus::Finalized {
                actions.extend(self.actions_for(goal, outcome.totals, now.date_naive()));
            }
            assessments.push(outcome.assessment);
        }

        if ids.is_empty() {
            insights.push("No active goals to reflect on".to_string());
            recommendations.push("Set a new goal to get started".to_string());
        } else {
            let planned = assessments.iter().any(|a| !a.task_ids.is_empty());
            describe_activity(activity, planned, &mut insights, &mut recommendations);
        }
        if !actions.is_empty() {
            recommendations.push(format!("Review {} suggested follow-up actions", actions.len()));
        }

        let report = ReflectionReport {
            id: Uuid::new_v4().to_string(),
            user_id: state.user_id.clone(),
            goal_ids: ids,
            reflection_type,
            overall_progress: overall.ratio(),
            trend: classify_trend(&assessments, activity),
            assessments,
            insights,
            recommendations,
            actions,
            generated_at: now,
        };
        state.reports.push(report.clone());
        Ok(report)
    }

    fn assess_goal(
        &self,
        state: &mut UserState,
        goal_id: &str,
        reflection_type: ReflectionType,
        now: DateTime<Utc>,
    ) -> AgentResult<Outcome> {
        let goal = state.goal(goal_id)?.clone();
        let tasks = state.tasks_of(goal_id);
        let totals = EffortTotals::of(tasks);
        let all_done = !tasks.is_empty() && tasks.iter().all(|t| t.is_completed());
        let unfinished = tasks.iter().any(|t| !t.is_completed());

        let last_change = state.last_status_change.get(goal_id).copied();
        let previous = state
            .last_report_for(goal_id, reflection_type)
            .map(|r| r.generated_at);
        let idle_days = (now - last_change.unwrap_or(goal.created_at)).num_days();

        let stalled = goal.status == GoalStatus::Finalized
            && unfinished
            && match (previous, last_change) {
                (Some(prev), Some(change)) => change < prev,
                (Some(_), None) => true,
                (None, _) => false,
            };

        let expected = expected_progress(&goal, now.date_naive());
        let progress = totals.ratio();
        let at_risk = goal.status == GoalStatus::Finalized
            && expected
                .map(|e| progress < e - self.config.at_risk_margin)
                .unwrap_or(false);

        let mut completed = false;
        let mut replanned_with = None;
        let health = if goal.status == GoalStatus::Finalized && all_done {
            mark_completed(state, goal_id, now)?;
            completed = true;
            GoalHealth::OnTrack
        } else if stalled {
            let current = state
                .plans
                .get(goal_id)
                .map(|p| p.strategy)
                .unwrap_or(PlanningStrategy::Milestone);
            let strategy = current.lighter();
            let plan = self
                .planner
                .draft_plan(&goal, strategy, self.config.replan_effort_scale, now)?;
            commit_plan(state, &plan, now)?;
            log::info!(
                "[REFLECT] Goal {} stalled; re-planned {} -> {} at {:.0}% effort",
                goal_id,
                current.as_str(),
                plan.strategy.as_str(),
                self.config.replan_effort_scale * 100.0
            );
            replanned_with = Some(plan.strategy);
            GoalHealth::Stalled
        } else if at_risk {
            GoalHealth::AtRisk
        } else {
            GoalHealth::OnTrack
        };

        let goal = state.goal(goal_id)?;
        Ok(Outcome {
            assessment: GoalAssessment {
                goal_id: goal_id.to_string(),
                title: goal.title.clone(),
                progress: if completed { 1.0 } else { progress },
                expected_progress: expected,
                health,
                replanned: replanned_with.is_some(),
                completed,
                task_ids: state.tasks_of(goal_id).iter().map(|t| t.id.clone()).collect(),
            },
            totals,
            replanned_with,
            idle_days,
        })
    }

    fn actions_for(&self, goal: &Goal, totals: EffortTotals, today: NaiveDate) -> Vec<ToolAction> {
        let progress = totals.ratio();
        let analysis = ComplexityAnalysis::of(goal, today);
        let text = goal.description.to_lowercase();
        let mut actions = Vec::new();

        if analysis.job_related && progress >= self.config.job_search_threshold {
            actions.push(ToolAction::SearchJobs {
                goal_id: goal.id.clone(),
                filters: JobFilters {
                    keywords: analysis.skills.clone(),
                    location: None,
                    remote_only: text.contains("remote"),
                    limit: 5,
                },
            });
        }

        let career_doc = ["resume", "cv", "job", "role"]
            .iter()
            .any(|k| text.split(|c: char| !c.is_alphanumeric()).any(|w| w == *k));
        if career_doc && progress >= 0.5 {
            let template = match analysis.category {
                GoalCategory::SoftwareDeveloper | GoalCategory::DataScientist => "technical",
                GoalCategory::Marketing => "creative",
                _ => "modern",
            };
            actions.push(ToolAction::RenderResume {
                goal_id: goal.id.clone(),
                template: template.to_string(),
                target_role: None,
            });
        }

        if let Some(deadline) = goal.deadline {
            let days_left = (deadline - today).num_days();
            if (0..=self.config.schedule_window_days).contains(&days_left) && progress < 0.8 {
                let remaining_hours = totals.total - totals.completed;
                let sessions = ((remaining_hours * 60.0 / SESSION_MINUTES as f32).ceil() as u32)
                    .clamp(1, MAX_SESSIONS);
                actions.push(ToolAction::ScheduleSessions {
                    goal_id: goal.id.clone(),
                    sessions,
                    session_minutes: SESSION_MINUTES,
                });
            }
        }
        actions
    }

    /// Current progress from the last committed state; never waits on writers
    pub fn progress_snapshot(&self, user_id: &str) -> ProgressSnapshot {
        let snapshot = self.registry.snapshot(user_id);
        let mut overall = EffortTotals::default();
        let goals = snapshot
            .goals
            .values()
            .filter(|g| g.status != GoalStatus::Abandoned)
            .map(|goal| {
                let totals = EffortTotals::of(snapshot.tasks_of(&goal.id));
                overall = overall.add(totals);
                GoalProgress {
                    goal_id: goal.id.clone(),
                    title: goal.title.clone(),
                    status: goal.status,
                    progress: totals.ratio(),
                    completed_hours: totals.completed,
                    total_hours: totals.total,
                    deadline: goal.deadline,
                }
            })
            .collect();

        ProgressSnapshot {
            user_id: user_id.to_string(),
            overall_progress: overall.ratio(),
            goals,
        }
    }

    pub fn progress_trends(&self, user_id: &str, window: Duration) -> AgentResult<Vec<GoalTrend>> {
        self.progress_trends_at(user_id, window, Utc::now())
    }

    /// Per-goal progress across the reports generated in `(now - window, now]`
    pub fn progress_trends_at(
        &self,
        user_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> AgentResult<Vec<GoalTrend>> {
        if window <= Duration::zero() {
            return Err(AgentError::validation("trend window must be positive"));
        }
        let since = now - window;
        let snapshot = self.registry.snapshot(user_id);
        let reports: Vec<&ReflectionReport> = snapshot
            .reports
            .iter()
            .filter(|r| r.generated_at > since && r.generated_at <= now)
            .collect();

        Ok(snapshot
            .goals
            .values()
            .filter(|g| g.status != GoalStatus::Abandoned)
            .map(|goal| {
                let points: Vec<ProgressPoint> = reports
                    .iter()
                    .filter_map(|r| {
                        r.assessment(&goal.id).map(|a| ProgressPoint {
                            at: r.generated_at,
                            progress: a.progress,
                        })
                    })
                    .collect();
                GoalTrend {
                    goal_id: goal.id.clone(),
                    title: goal.title.clone(),
                    current_progress: EffortTotals::of(snapshot.tasks_of(&goal.id)).ratio(),
                    direction: TrendDirection::of(&points),
                    points,
                }
            })
            .collect())
    }

    /// Stored reports of a user, oldest first
    pub fn reports(&self, user_id: &str) -> Vec<ReflectionReport> {
        self.registry.snapshot(user_id).reports.clone()
    }

    fn remember_after_commit(&self, user_id: &str, text: &str, now: DateTime<Utc>) {
        if let Err(e) = self.memory.remember_at(user_id, text, MemoryKind::Reflection, now) {
            log::warn!("[REFLECT] Report saved but memory write failed for {}: {}", user_id, e);
        }
    }
}

/// Elapsed fraction of the creation-to-deadline span
fn expected_progress(goal: &Goal, today: NaiveDate) -> Option<f32> {
    let deadline = goal.deadline?;
    let start = goal.created_at.date_naive();
    let span = (deadline - start).num_days();
    if span <= 0 {
        return Some(1.0);
    }
    let elapsed = (today - start).num_days();
    Some((elapsed as f32 / span as f32).clamp(0.0, 1.0))
}

fn describe(outcome: &Outcome, goal: &Goal, insights: &mut Vec<String>, recommendations: &mut Vec<String>) {
    let a = &outcome.assessment;
    match a.health {
        _ if a.completed => insights.push(format!("Completed '{}'", goal.title)),
        GoalHealth::Stalled => {
            insights.push(format!("No progress in {} days on '{}'", outcome.idle_days, goal.title));
            if let Some(strategy) = outcome.replanned_with {
                recommendations.push(format!(
                    "Reduce scope: '{}' was re-planned with a {} plan; start with its first task this week",
                    goal.title,
                    strategy.as_str()
                ));
            }
        }
        GoalHealth::AtRisk => {
            insights.push(format!(
                "'{}' is behind schedule ({:.0}% done, {:.0}% expected)",
                goal.title,
                a.progress * 100.0,
                a.expected_progress.unwrap_or(0.0) * 100.0
            ));
            recommendations.push(format!("Re-plan '{}' or extend its deadline", goal.title));
            recommendations.push(format!("Schedule focused sessions for '{}'", goal.title));
        }
        GoalHealth::OnTrack => match goal.status {
            GoalStatus::Finalized if a.progress > 0.0 => {
                insights.push(format!("'{}' is on track at {:.0}%", goal.title, a.progress * 100.0))
            }
            GoalStatus::Finalized => {
                recommendations.push(format!("Start the first task of '{}'", goal.title))
            }
            GoalStatus::Draft | GoalStatus::Clarifying => recommendations.push(format!(
                "Answer the open questions to finalize '{}'",
                goal.title
            )),
            _ => {}
        },
    }
}

/// Schedule adherence of planned goals weighted 70/30 with recent activity
fn classify_trend(assessments: &[GoalAssessment], activity: &Activity) -> ProgressTrend {
    let scores: Vec<f32> = assessments
        .iter()
        .filter(|a| a.completed || !a.task_ids.is_empty())
        .map(|a| {
            if a.completed {
                return 1.0;
            }
            if a.health == GoalHealth::Stalled {
                return 0.0;
            }
            let expected = a.expected_progress.unwrap_or(0.0);
            if a.progress >= expected {
                1.0
            } else {
                a.progress / expected
            }
        })
        .collect();
    if scores.is_empty() {
        return ProgressTrend::Stagnant;
    }
    let adherence = scores.iter().sum::<f32>() / scores.len() as f32;
    ProgressTrend::from_score(0.7 * adherence + 0.3 * activity.score())
}

fn describe_activity(
    activity: &Activity,
    planned: bool,
    insights: &mut Vec<String>,
    recommendations: &mut Vec<String>,
) {
    if activity.interactions < LOW_ENGAGEMENT_INTERACTIONS {
        insights.push(format!(
            "Low engagement: {} interactions in the last {} days",
            activity.interactions, ACTIVITY_WINDOW_DAYS
        ));
        recommendations.push("Set up regular check-in reminders".to_string());
    } else if activity.is_consistent() {
        insights.push(format!(
            "Consistent engagement on {} of the last {} days",
            activity.active_days, ACTIVITY_WINDOW_DAYS
        ));
    }

    if activity.learning_days >= 3 {
        insights.push(format!(
            "Learning activity on {} of the last {} days",
            activity.learning_days, ACTIVITY_WINDOW_DAYS
        ));
    } else if planned && activity.learning_days == 0 {
        recommendations.push("Schedule regular learning sessions".to_string());
    }
}

fn summary_line(report: &ReflectionReport) -> String {
    let stalled = report.assessments.iter().filter(|a| a.health == GoalHealth::Stalled).count();
    let at_risk = report.assessments.iter().filter(|a| a.health == GoalHealth::AtRisk).count();
    format!(
        "{} reflection: {:.0}% overall across {} goals, {} stalled, {} at risk",
        report.reflection_type.as_str(),
        report.overall_progress * 100.0,
        report.assessments.len(),
        stalled,
        at_risk
    )
}
