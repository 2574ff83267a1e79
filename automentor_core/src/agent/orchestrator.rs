//! Orchestrator
//!
//! Owns the scheduled triggers of every user and turns them into work:
//! reflections (with one retry and a canned fallback), proactive check-ins,
//! deadline warnings, and dispatch of reflection actions to tool
//! capabilities. Tool failures are remembered, never propagated.

use super::recall::MemoryManager;
use super::reflection::ProgressEvaluator;
use super::types::{
    CalendarEvent, GoalStatus, MemoryKind, ReflectionType, ResumeRequest,
    ScheduledTrigger, ToolAction, TriggerKind,
};
use crate::capabilities::{CapabilityGuard, TextGenerator, ToolSet};
use crate::config::OrchestratorConfig;
use crate::error::{AgentError, AgentResult};
use crate::state::{StateRegistry, UserState};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;

const SESSION_HOUR: u32 = 18;
const WARNING_HOUR: u32 = 9;
const RESUME_HIGHLIGHTS: usize = 5;

/// Result of one tool dispatch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutcome {
    pub tool: String,
    pub goal_id: String,
    pub success: bool,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Reflected {
        report_id: String,
        tools: Vec<ToolOutcome>,
        scheduled: Vec<ScheduledTrigger>,
    },
    /// Reflection failed twice; a canned check-in went out instead
    Degraded {
        message: String,
        error: String,
        scheduled: Vec<ScheduledTrigger>,
    },
    Message {
        text: String,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FiredTrigger {
    pub trigger: ScheduledTrigger,
    pub outcome: TriggerOutcome,
}

pub struct Orchestrator {
    registry: Arc<StateRegistry>,
    evaluator: Arc<ProgressEvaluator>,
    memory: Arc<MemoryManager>,
    tools: ToolSet,
    guard: CapabilityGuard,
    generator: Option<Arc<dyn TextGenerator>>,
    max_tokens: usize,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<StateRegistry>,
        evaluator: Arc<ProgressEvaluator>,
        memory: Arc<MemoryManager>,
        tools: ToolSet,
        guard: CapabilityGuard,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            evaluator,
            memory,
            tools,
            guard,
            generator: None,
            max_tokens: 256,
            config,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>, max_tokens: usize) -> Self {
        self.generator = Some(generator);
        self.max_tokens = max_tokens;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ============================================================
    // SCHEDULING
    // ============================================================

    pub fn cadence_of(&self, user_id: &str) -> ReflectionType {
        self.registry
            .snapshot(user_id)
            .cadence
            .unwrap_or(self.config.default_cadence)
    }

    pub fn set_cadence(&self, user_id: &str, cadence: ReflectionType) -> AgentResult<Option<ScheduledTrigger>> {
        self.set_cadence_at(user_id, cadence, Utc::now())
    }

    /// Change a user's reflection cadence and reschedule the pending reflection
    pub fn set_cadence_at(
        &self,
        user_id: &str,
        cadence: ReflectionType,
        now: DateTime<Utc>,
    ) -> AgentResult<Option<ScheduledTrigger>> {
        if user_id.trim().is_empty() {
            return Err(AgentError::validation("user_id is required"));
        }
        let scheduled = self.registry.write(user_id, |state| {
            state.cadence = Some(cadence);
            state
                .triggers
                .retain(|t| !(t.kind == TriggerKind::Reflection && t.goal_id.is_none()));
            Ok(self.schedule_reflection(state, now))
        })?;
        log::info!("[ORCH] Cadence for {} set to {}", user_id, cadence.as_str());
        Ok(scheduled)
    }

    pub fn track_goal(&self, user_id: &str, goal_id: &str) -> AgentResult<Vec<ScheduledTrigger>> {
        self.track_goal_at(user_id, goal_id, Utc::now())
    }

    /// Make sure a reflection is pending and the goal's deadline warning is set
    pub fn track_goal_at(
        &self,
        user_id: &str,
        goal_id: &str,
        now: DateTime<Utc>,
    ) -> AgentResult<Vec<ScheduledTrigger>> {
        let scheduled = self.registry.write(user_id, |state| {
            let goal = state.goal(goal_id)?;
            if goal.status.is_terminal() {
                return Err(AgentError::invalid_state(format!(
                    "goal {} is {} and is no longer tracked",
                    goal_id,
                    goal.status.as_str()
                )));
            }
            let deadline = goal.deadline;

            let mut scheduled = Vec::new();
            scheduled.extend(self.schedule_reflection(state, now));

            if let Some(deadline) = deadline {
                let warn_hour = NaiveTime::from_hms_opt(WARNING_HOUR, 0, 0).unwrap_or_default();
                let warn_at = deadline.and_time(warn_hour).and_utc()
                    - Duration::days(self.config.deadline_warning_lead_days);
                let pending = state.triggers.iter().any(|t| {
                    t.kind == TriggerKind::DeadlineWarning && t.goal_id.as_deref() == Some(goal_id)
                });
                if warn_at > now && !pending {
                    let trigger =
                        ScheduledTrigger::new(user_id, TriggerKind::DeadlineWarning, warn_at).for_goal(goal_id);
                    state.triggers.push(trigger.clone());
                    scheduled.push(trigger);
                }
            }
            Ok(scheduled)
        })?;

        if scheduled.is_empty() {
            log::debug!("[ORCH] Goal {} already tracked", goal_id);
        } else {
            log::info!("[ORCH] Tracking goal {} ({} new triggers)", goal_id, scheduled.len());
        }
        Ok(scheduled)
    }

    /// Pending reflection for the user's cadence, unless one exists already
    fn schedule_reflection(&self, state: &mut UserState, now: DateTime<Utc>) -> Option<ScheduledTrigger> {
        let cadence = state.cadence.unwrap_or(self.config.default_cadence);
        let interval = cadence.cadence()?;
        let pending = state
            .triggers
            .iter()
            .any(|t| t.kind == TriggerKind::Reflection && t.goal_id.is_none());
        if pending {
            return None;
        }
        let trigger = ScheduledTrigger::new(&state.user_id, TriggerKind::Reflection, now + interval);
        state.triggers.push(trigger.clone());
        Some(trigger)
    }

    fn schedule_check_in(&self, state: &mut UserState, now: DateTime<Utc>) -> Option<ScheduledTrigger> {
        if state.triggers.iter().any(|t| t.kind == TriggerKind::CheckIn) {
            return None;
        }
        let trigger = ScheduledTrigger::new(
            &state.user_id,
            TriggerKind::CheckIn,
            now + Duration::hours(self.config.check_in_delay_hours),
        );
        state.triggers.push(trigger.clone());
        Some(trigger)
    }

    /// Re-queue missing reflections and deadline warnings for every finalized goal
    pub fn restore_schedules(&self, now: DateTime<Utc>) -> AgentResult<usize> {
        let mut restored = 0;
        for user_id in self.registry.users() {
            let goal_ids: Vec<String> = self
                .registry
                .snapshot(&user_id)
                .goals
                .values()
                .filter(|g| g.status == GoalStatus::Finalized)
                .map(|g| g.id.clone())
                .collect();
            for goal_id in goal_ids {
                restored += self.track_goal_at(&user_id, &goal_id, now)?.len();
            }
        }
        if restored > 0 {
            log::info!("[ORCH] Restored {} missing triggers", restored);
        }
        Ok(restored)
    }

    pub fn pending_triggers(&self, user_id: &str) -> Vec<ScheduledTrigger> {
        let mut triggers = self.registry.snapshot(user_id).triggers.clone();
        triggers.sort_by(|a, b| a.fires_at.cmp(&b.fires_at).then_with(|| a.id.cmp(&b.id)));
        triggers
    }

    /// Every trigger due at `now`, across users, oldest first
    pub fn due_triggers(&self, now: DateTime<Utc>) -> Vec<ScheduledTrigger> {
        let mut due: Vec<ScheduledTrigger> = self
            .registry
            .users()
            .iter()
            .flat_map(|user| {
                self.registry
                    .snapshot(user)
                    .triggers
                    .iter()
                    .filter(|t| t.is_due(now))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        due.sort_by(|a, b| a.fires_at.cmp(&b.fires_at).then_with(|| a.id.cmp(&b.id)));
        due
    }

    // ============================================================
    // FIRING
    // ============================================================

    /// Fire every due trigger in time order; one failing trigger never stops the rest
    pub fn run_due(&self, now: DateTime<Utc>) -> Vec<FiredTrigger> {
        let due = self.due_triggers(now);
        if !due.is_empty() {
            log::info!("[ORCH] {} triggers due", due.len());
        }
        let mut fired = Vec::with_capacity(due.len());
        for trigger in due {
            match self.fire_trigger(&trigger, now) {
                Ok(outcome) => fired.push(FiredTrigger { trigger, outcome }),
                Err(e) => log::error!(
                    "[ORCH] Trigger {} ({:?}) for {} failed: {}",
                    trigger.id,
                    trigger.kind,
                    trigger.user_id,
                    e
                ),
            }
        }
        fired
    }

    /// Claim `trigger` and run it
    ///
    /// A reflection's successor is queued in the same write that claims it.
    pub fn fire_trigger(&self, trigger: &ScheduledTrigger, now: DateTime<Utc>) -> AgentResult<TriggerOutcome> {
        let claimed = self.registry.write(&trigger.user_id, |state| {
            let before = state.triggers.len();
            state.triggers.retain(|t| t.id != trigger.id);
            if state.triggers.len() == before {
                return Ok(None);
            }
            let next = match trigger.kind {
                TriggerKind::Reflection => self.schedule_reflection(state, now),
                _ => None,
            };
            Ok(Some(next))
        })?;
        let next = match claimed {
            Some(next) => next,
            None => {
                return Ok(TriggerOutcome::Skipped {
                    reason: format!("trigger {} is no longer pending", trigger.id),
                })
            }
        };

        log::debug!("[ORCH] Firing {:?} for {}", trigger.kind, trigger.user_id);
        match trigger.kind {
            TriggerKind::Reflection => self.fire_reflection(&trigger.user_id, next, now),
            TriggerKind::CheckIn => Ok(TriggerOutcome::Message {
                text: self.check_in(&trigger.user_id, now),
            }),
            TriggerKind::DeadlineWarning => self.fire_deadline_warning(trigger, now),
        }
    }

    fn fire_reflection(
        &self,
        user_id: &str,
        next: Option<ScheduledTrigger>,
        now: DateTime<Utc>,
    ) -> AgentResult<TriggerOutcome> {
        let cadence = self.cadence_of(user_id);
        let result = match self.evaluator.conduct_reflection_at(user_id, &[], cadence, now) {
            Err(e) if e.is_capability_failure() => {
                log::warn!("[ORCH] Reflection for {} failed ({}); retrying once", user_id, e);
                thread::sleep(self.config.retry_backoff());
                self.evaluator.conduct_reflection_at(user_id, &[], cadence, now)
            }
            other => other,
        };

        match result {
            Ok(report) => {
                let tools: Vec<ToolOutcome> = report
                    .actions
                    .iter()
                    .map(|action| self.dispatch(user_id, action, now))
                    .collect();
                let mut scheduled: Vec<ScheduledTrigger> = next.into_iter().collect();
                if report.needs_attention() {
                    let check_in = self
                        .registry
                        .write(user_id, |state| Ok(self.schedule_check_in(state, now)))?;
                    scheduled.extend(check_in);
                }
                Ok(TriggerOutcome::Reflected {
                    report_id: report.id,
                    tools,
                    scheduled,
                })
            }
            Err(e) if e.is_capability_failure() => {
                log::warn!("[ORCH] Reflection degraded for {}: {}", user_id, e);
                let message = canned_check_in(self.evaluator.progress_snapshot(user_id).overall_progress);
                self.remember(user_id, &message, now);
                Ok(TriggerOutcome::Degraded {
                    message,
                    error: e.to_string(),
                    scheduled: next.into_iter().collect(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn fire_deadline_warning(&self, trigger: &ScheduledTrigger, now: DateTime<Utc>) -> AgentResult<TriggerOutcome> {
        let goal_id = trigger
            .goal_id
            .as_deref()
            .ok_or_else(|| AgentError::invalid_state("deadline warning without a goal"))?;
        let snapshot = self.registry.snapshot(&trigger.user_id);
        let goal = snapshot.goal(goal_id)?;
        if goal.status != GoalStatus::Finalized {
            return Ok(TriggerOutcome::Skipped {
                reason: format!("goal {} is {}", goal_id, goal.status.as_str()),
            });
        }

        let due = goal
            .deadline
            .map(|d| d.to_string())
            .unwrap_or_else(|| "soon".to_string());
        let text = format!(
            "Heads up: '{}' is due on {} and is {:.0}% complete.",
            goal.title,
            due,
            goal.progress * 100.0
        );
        self.remember(&trigger.user_id, &text, now);
        log::info!("[ORCH] Deadline warning for goal {}", goal_id);
        Ok(TriggerOutcome::Message { text })
    }

    /// Proactive check-in text; generated when possible, canned otherwise
    pub fn check_in(&self, user_id: &str, now: DateTime<Utc>) -> String {
        let snapshot = self.evaluator.progress_snapshot(user_id);
        let canned = canned_check_in(snapshot.overall_progress);

        let text = match &self.generator {
            Some(generator) => {
                let goals: Vec<String> = snapshot
                    .goals
                    .iter()
                    .filter(|g| g.status == GoalStatus::Finalized)
                    .map(|g| format!("- {} ({:.0}%)", g.title, g.progress * 100.0))
                    .collect();
                let prompt = format!(
                    "Write a short, encouraging check-in for a learner. Their goals:\n{}\nAsk about one concrete next step.",
                    goals.join("\n")
                );
                match self.guard.generate(generator, &prompt, self.max_tokens) {
                    Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                    Ok(_) => canned,
                    Err(e) => {
                        log::warn!("[ORCH] Check-in generation failed for {}: {}", user_id, e);
                        canned
                    }
                }
            }
            None => canned,
        };

        self.remember(user_id, &text, now);
        text
    }

    // ============================================================
    // TOOL DISPATCH
    // ============================================================

    fn dispatch(&self, user_id: &str, action: &ToolAction, now: DateTime<Utc>) -> ToolOutcome {
        let tool = action.tool_name();
        let title = self
            .registry
            .snapshot(user_id)
            .goal(action.goal_id())
            .map(|g| g.title.clone())
            .unwrap_or_else(|_| action.goal_id().to_string());

        let result: AgentResult<String> = match action {
            ToolAction::SearchJobs { filters, .. } => {
                let search = Arc::clone(&self.tools.job_search);
                let filters = filters.clone();
                self.guard
                    .call_tool(tool, move || search.search(&filters))
                    .map(|jobs| {
                        let names: Vec<String> = jobs
                            .iter()
                            .map(|j| format!("{} at {}", j.title, j.company))
                            .collect();
                        format!("Found {} job postings for '{}': {}", jobs.len(), title, names.join("; "))
                    })
            }
            ToolAction::RenderResume {
                template,
                target_role,
                ..
            } => {
                let mut facts = self.memory.store().user_records(user_id);
                facts.retain(|r| r.kind == MemoryKind::Fact);
                facts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                let request = ResumeRequest {
                    user_id: user_id.to_string(),
                    target_role: target_role.clone(),
                    template: template.clone(),
                    highlights: facts.into_iter().take(RESUME_HIGHLIGHTS).map(|r| r.text).collect(),
                };
                let renderer = Arc::clone(&self.tools.resume_renderer);
                self.guard
                    .call_tool(tool, move || renderer.render(&request))
                    .map(|doc| format!("Rendered a {} resume for '{}' ({} characters)", doc.template, title, doc.content.len()))
            }
            ToolAction::ScheduleSessions {
                sessions,
                session_minutes,
                ..
            } => {
                let start = NaiveTime::from_hms_opt(SESSION_HOUR, 0, 0).unwrap_or_default();
                let events: Vec<CalendarEvent> = (1..=*sessions as i64)
                    .map(|day| CalendarEvent {
                        user_id: user_id.to_string(),
                        title: format!("Study session: {}", title),
                        starts_at: (now.date_naive() + Duration::days(day)).and_time(start).and_utc(),
                        duration_minutes: *session_minutes,
                    })
                    .collect();
                let calendar = Arc::clone(&self.tools.calendar);
                self.guard
                    .call_tool(tool, move || {
                        events
                            .iter()
                            .map(|e| calendar.schedule(e))
                            .collect::<AgentResult<Vec<_>>>()
                    })
                    .map(|confirmed| format!("Scheduled {} study sessions for '{}'", confirmed.len(), title))
            }
        };

        let outcome = match result {
            Ok(summary) => ToolOutcome {
                tool: tool.to_string(),
                goal_id: action.goal_id().to_string(),
                success: true,
                summary,
            },
            Err(e) => {
                log::warn!("[ORCH] Tool {} failed for {}: {}", tool, user_id, e);
                ToolOutcome {
                    tool: tool.to_string(),
                    goal_id: action.goal_id().to_string(),
                    success: false,
                    summary: format!("{} failed for '{}': {}", tool, title, e),
                }
            }
        };
        self.remember(user_id, &outcome.summary, now);
        outcome
    }

    /// Decay and flush long-term memory
    pub fn maintain(&self, now: DateTime<Utc>) -> AgentResult<()> {
        let report = self.memory.cleanup(now);
        let flushed = self.memory.persist()?;
        if report.decayed > 0 || report.removed > 0 || flushed > 0 {
            log::info!(
                "[ORCH] Memory maintenance: {} decayed, {} removed, {} flushed",
                report.decayed,
                report.removed,
                flushed
            );
        }
        Ok(())
    }

    fn remember(&self, user_id: &str, text: &str, now: DateTime<Utc>) {
        if let Err(e) = self.memory.remember_at(user_id, text, MemoryKind::Interaction, now) {
            log::warn!("[ORCH] Could not record memory for {}: {}", user_id, e);
        }
    }
}

fn canned_check_in(overall_progress: f32) -> String {
    format!(
        "Checking in: you are {:.0}% of the way through your goals. What is one task you can finish this week?",
        overall_progress * 100.0
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::memory::{DecayPolicy, MemoryStore};
    use crate::agent::planner::{HeuristicEffortPolicy, PlanningStrategy, TaskPlanner};
    use crate::agent::types::{Goal, SmartCriteria, TaskStatus};
    use crate::capabilities::{FailingTool, HashingEmbedder, MockTextGenerator, RecordingCalendar};
    use crate::config::{MemoryConfig, PlannerConfig, ReflectionConfig};
    use chrono::NaiveDate;

    struct Harness {
        registry: Arc<StateRegistry>,
        memory: Arc<MemoryManager>,
        planner: Arc<TaskPlanner>,
        orchestrator: Orchestrator,
    }

    fn guard() -> CapabilityGuard {
        CapabilityGuard::new(std::time::Duration::from_secs(2))
    }

    /// `replan_generator` is used only by the evaluator's planner
    fn harness(tools: ToolSet, replan_generator: Option<Arc<dyn TextGenerator>>) -> Harness {
        let registry = Arc::new(StateRegistry::in_memory());
        let memory = Arc::new(MemoryManager::new(
            Arc::new(MemoryStore::in_memory(DecayPolicy::default()).unwrap()),
            Arc::new(HashingEmbedder::new(64)),
            guard(),
            &MemoryConfig::default(),
        ));
        let policy = Arc::new(HeuristicEffortPolicy::new(PlannerConfig::default()));
        let planner = Arc::new(TaskPlanner::new(
            Arc::clone(&registry),
            policy.clone(),
            guard(),
            &PlannerConfig::default(),
        ));
        let mut replanner = TaskPlanner::new(Arc::clone(&registry), policy, guard(), &PlannerConfig::default());
        if let Some(generator) = replan_generator {
            replanner = replanner.with_generator(generator, 64);
        }
        let evaluator = Arc::new(ProgressEvaluator::new(
            Arc::clone(&registry),
            Arc::new(replanner),
            Arc::clone(&memory),
            ReflectionConfig::default(),
        ));
        let config = OrchestratorConfig {
            retry_backoff_ms: 10,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            evaluator,
            Arc::clone(&memory),
            tools,
            guard(),
            config,
        );
        Harness {
            registry,
            memory,
            planner,
            orchestrator,
        }
    }

    fn seed_goal(h: &Harness, description: &str, created: DateTime<Utc>, deadline: NaiveDate) -> String {
        let mut goal = Goal::new("u1", description, created);
        goal.status = GoalStatus::Finalized;
        goal.smart = SmartCriteria {
            specific: Some(description.to_string()),
            measurable: Some("3 projects".to_string()),
            achievable: Some("10h/week".to_string()),
            relevant: Some("career".to_string()),
            time_bound: Some(deadline.to_string()),
        };
        goal.deadline = Some(deadline);
        let id = goal.id.clone();
        h.registry
            .write("u1", |state| {
                state.goals.insert(id.clone(), goal);
                Ok(())
            })
            .unwrap();
        id
    }

    fn interactions(h: &Harness) -> Vec<String> {
        h.memory
            .store()
            .user_records("u1")
            .into_iter()
            .filter(|r| r.kind == MemoryKind::Interaction)
            .map(|r| r.text)
            .collect()
    }

    #[test]
    fn test_cadence_controls_reflection_schedule() {
        let h = harness(ToolSet::default(), None);
        let now = Utc::now();

        let daily = h.orchestrator.set_cadence_at("u1", ReflectionType::Daily, now).unwrap();
        assert_eq!(daily.unwrap().fires_at, now + Duration::days(1));

        let monthly = h.orchestrator.set_cadence_at("u1", ReflectionType::Monthly, now).unwrap();
        assert_eq!(monthly.unwrap().fires_at, now + Duration::days(30));
        assert_eq!(h.orchestrator.pending_triggers("u1").len(), 1);

        assert!(h
            .orchestrator
            .set_cadence_at("u1", ReflectionType::OnDemand, now)
            .unwrap()
            .is_none());
        assert!(h.orchestrator.pending_triggers("u1").is_empty());
        assert_eq!(h.orchestrator.cadence_of("u1"), ReflectionType::OnDemand);
    }

    #[test]
    fn test_track_goal_schedules_reflection_and_deadline_warning() {
        let h = harness(ToolSet::default(), None);
        let now = Utc::now();
        let deadline = now.date_naive() + Duration::days(60);
        let goal_id = seed_goal(&h, "Learn SQL", now, deadline);

        let scheduled = h.orchestrator.track_goal_at("u1", &goal_id, now).unwrap();
        assert_eq!(scheduled.len(), 2);
        let warning = scheduled
            .iter()
            .find(|t| t.kind == TriggerKind::DeadlineWarning)
            .unwrap();
        assert_eq!(warning.fires_at.date_naive(), deadline - Duration::days(7));
        assert_eq!(warning.goal_id.as_deref(), Some(goal_id.as_str()));

        assert!(h.orchestrator.track_goal_at("u1", &goal_id, now).unwrap().is_empty());
    }

    #[test]
    fn test_restore_schedules_requeues_finalized_goals_only() {
        let h = harness(ToolSet::default(), None);
        let now = Utc::now();
        let tracked = seed_goal(&h, "Learn SQL", now, now.date_naive() + Duration::days(60));
        let done = seed_goal(&h, "Improve public speaking", now, now.date_naive() + Duration::days(60));
        h.registry
            .write("u1", |state| {
                if let Some(goal) = state.goals.get_mut(&done) {
                    goal.status = GoalStatus::Completed;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(h.orchestrator.restore_schedules(now).unwrap(), 2);
        let pending = h.orchestrator.pending_triggers("u1");
        assert_eq!(pending.len(), 2);
        assert!(pending
            .iter()
            .filter(|t| t.kind == TriggerKind::DeadlineWarning)
            .all(|t| t.goal_id.as_deref() == Some(tracked.as_str())));

        assert_eq!(h.orchestrator.restore_schedules(now).unwrap(), 0);
    }

    #[test]
    fn test_deadline_inside_lead_time_gets_no_warning() {
        let h = harness(ToolSet::default(), None);
        let now = Utc::now();
        let goal_id = seed_goal(&h, "Learn SQL", now, now.date_naive() + Duration::days(3));
        let scheduled = h.orchestrator.track_goal_at("u1", &goal_id, now).unwrap();
        assert!(scheduled.iter().all(|t| t.kind == TriggerKind::Reflection));
    }

    #[test]
    fn test_run_due_reflects_and_reschedules() {
        let calendar = Arc::new(RecordingCalendar::new());
        let tools = ToolSet {
            calendar: calendar.clone(),
            ..Default::default()
        };
        let h = harness(tools, None);
        let now = Utc::now();
        let goal_id = seed_goal(
            &h,
            "Learn SQL",
            now - Duration::days(50),
            now.date_naive() + Duration::days(12),
        );
        h.planner
            .create_comprehensive_plan_at("u1", &goal_id, PlanningStrategy::Linear, now)
            .unwrap();
        h.orchestrator.track_goal_at("u1", &goal_id, now).unwrap();

        // the deadline warning (5 days out) and the weekly reflection are both due
        let later = now + Duration::days(7) + Duration::minutes(1);
        let fired = h.orchestrator.run_due(later);
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].trigger.kind, TriggerKind::DeadlineWarning);
        let reflected = fired
            .iter()
            .find(|f| f.trigger.kind == TriggerKind::Reflection)
            .unwrap();
        match &reflected.outcome {
            TriggerOutcome::Reflected { tools, scheduled, .. } => {
                assert!(tools.iter().any(|t| t.tool == "calendar" && t.success));
                assert!(scheduled.iter().any(|t| t.kind == TriggerKind::Reflection));
                assert!(scheduled.iter().any(|t| t.kind == TriggerKind::CheckIn));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!calendar.events().is_empty());
        assert!(interactions(&h).iter().any(|m| m.starts_with("Scheduled")));
        assert_eq!(h.registry.snapshot("u1").reports.len(), 1);
    }

    #[test]
    fn test_tool_failures_are_remembered_not_fatal() {
        let tools = ToolSet {
            job_search: Arc::new(FailingTool),
            resume_renderer: Arc::new(FailingTool),
            calendar: Arc::new(FailingTool),
        };
        let h = harness(tools, None);
        let now = Utc::now();
        let goal_id = seed_goal(
            &h,
            "Get a backend developer job with Python",
            now,
            now.date_naive() + Duration::days(10),
        );
        let plan = h
            .planner
            .create_comprehensive_plan_at("u1", &goal_id, PlanningStrategy::Linear, now)
            .unwrap();
        for task in plan.tasks.iter().take(plan.tasks.len() - 1) {
            h.planner
                .update_task_status_at("u1", &goal_id, &task.id, TaskStatus::Completed, now)
                .unwrap();
        }

        let trigger = ScheduledTrigger::new("u1", TriggerKind::Reflection, now);
        h.registry
            .write("u1", |state| {
                state.triggers.push(trigger.clone());
                Ok(())
            })
            .unwrap();

        match h.orchestrator.fire_trigger(&trigger, now).unwrap() {
            TriggerOutcome::Reflected { tools, .. } => {
                assert!(!tools.is_empty());
                assert!(tools.iter().all(|t| !t.success));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(interactions(&h).iter().any(|m| m.contains("failed")));
    }

    fn stall(h: &Harness, now: DateTime<Utc>) -> String {
        let goal_id = seed_goal(h, "Learn SQL", now, now.date_naive() + Duration::days(120));
        h.planner
            .create_comprehensive_plan_at("u1", &goal_id, PlanningStrategy::Milestone, now)
            .unwrap();
        h.orchestrator.set_cadence_at("u1", ReflectionType::Weekly, now).unwrap();
        let first = h.orchestrator.run_due(now + Duration::days(7));
        assert!(matches!(first[0].outcome, TriggerOutcome::Reflected { .. }));
        goal_id
    }

    #[test]
    fn test_reflection_retries_once_after_capability_failure() {
        let generator = Arc::new(MockTextGenerator::new("Practice joins").failing(1));
        let h = harness(ToolSet::default(), Some(generator.clone()));
        let now = Utc::now();
        let goal_id = stall(&h, now);

        let second = h.orchestrator.run_due(now + Duration::days(14));
        assert!(matches!(second[0].outcome, TriggerOutcome::Reflected { .. }));
        assert_eq!(generator.call_count(), 2);
        let state = h.registry.snapshot("u1");
        assert_eq!(state.plans[&goal_id].strategy, PlanningStrategy::Linear);
        assert_eq!(state.tasks_of(&goal_id)[0].title, "Practice joins");
    }

    #[test]
    fn test_second_failure_degrades_to_canned_check_in() {
        let generator = Arc::new(MockTextGenerator::new("unused").failing(2));
        let h = harness(ToolSet::default(), Some(generator.clone()));
        let now = Utc::now();
        let goal_id = stall(&h, now);
        let tasks_before = h.registry.snapshot("u1").tasks_of(&goal_id).to_vec();

        let second = h.orchestrator.run_due(now + Duration::days(14));
        match &second[0].outcome {
            TriggerOutcome::Degraded { message, scheduled, .. } => {
                assert!(message.starts_with("Checking in"));
                assert!(scheduled.iter().any(|t| t.kind == TriggerKind::Reflection));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(generator.call_count(), 2);

        let state = h.registry.snapshot("u1");
        assert_eq!(state.reports.len(), 1);
        assert_eq!(state.tasks_of(&goal_id), tasks_before.as_slice());
        assert!(interactions(&h).iter().any(|m| m.starts_with("Checking in")));
    }

    #[test]
    fn test_slow_generator_times_out_and_degrades() {
        let generator = Arc::new(MockTextGenerator::new("late").slow(std::time::Duration::from_millis(400)));
        let mut h = harness(ToolSet::default(), None);
        h.orchestrator = h.orchestrator.with_generator(generator, 32);
        h.orchestrator.guard = CapabilityGuard::new(std::time::Duration::from_millis(50));

        let text = h.orchestrator.check_in("u1", Utc::now());
        assert!(text.starts_with("Checking in"));
    }

    #[test]
    fn test_check_in_uses_generator_when_available() {
        let generator = Arc::new(MockTextGenerator::new("  How did the SQL practice go?  "));
        let h = harness(ToolSet::default(), None);
        let orchestrator = h.orchestrator.with_generator(generator, 32);
        assert_eq!(orchestrator.check_in("u1", Utc::now()), "How did the SQL practice go?");
    }

    #[test]
    fn test_deadline_warning_and_double_fire() {
        let h = harness(ToolSet::default(), None);
        let now = Utc::now();
        let goal_id = seed_goal(&h, "Learn SQL", now, now.date_naive() + Duration::days(30));
        let scheduled = h.orchestrator.track_goal_at("u1", &goal_id, now).unwrap();
        let warning = scheduled
            .into_iter()
            .find(|t| t.kind == TriggerKind::DeadlineWarning)
            .unwrap();

        match h.orchestrator.fire_trigger(&warning, warning.fires_at).unwrap() {
            TriggerOutcome::Message { text } => assert!(text.contains("Learn SQL")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(
            h.orchestrator.fire_trigger(&warning, warning.fires_at).unwrap(),
            TriggerOutcome::Skipped { .. }
        ));
    }
}
