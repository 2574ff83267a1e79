//! Goal Manager
//!
//! Moves a goal from free text to a finalized SMART goal:
//!
//! draft -> clarifying -> finalized -> completed | abandoned
//!
//! `abandoned` is also reachable from draft and clarifying. Completed and
//! abandoned goals are terminal. `completed` is only reached through the
//! progress evaluator, `abandoned` only through an explicit user action.

use super::recall::MemoryManager;
use super::smart::{parse_timeline, question_for, sanitize, SmartExtractor};
use super::types::{Goal, GoalStatus, MemoryKind, SmartCriteria, SmartField};
use crate::error::{AgentError, AgentResult};
use crate::state::{StateRegistry, UserState};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================
// TYPES
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarifyingQuestion {
    pub field: SmartField,
    pub question: String,
}

/// A goal still being clarified, with one question per empty SMART field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalDraft {
    pub goal: Goal,
    pub questions: Vec<ClarifyingQuestion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalAnalytics {
    pub total_goals: usize,
    pub by_status: BTreeMap<String, usize>,
    pub average_progress: f32,
    /// Percentage of goals completed
    pub completion_rate: f32,
    pub overdue_goals: usize,
}

pub fn open_questions(goal: &Goal) -> Vec<ClarifyingQuestion> {
    goal.smart
        .missing_fields()
        .into_iter()
        .map(|field| ClarifyingQuestion {
            field,
            question: question_for(field).to_string(),
        })
        .collect()
}

// ============================================================
// TRANSITIONS
// ============================================================

fn allowed(from: GoalStatus, to: GoalStatus) -> bool {
    use GoalStatus::*;
    matches!(
        (from, to),
        (Draft, Clarifying)
            | (Clarifying, Finalized)
            | (Finalized, Completed)
            | (Draft, Abandoned)
            | (Clarifying, Abandoned)
            | (Finalized, Abandoned)
    )
}

pub(crate) fn transition(goal: &mut Goal, to: GoalStatus, now: DateTime<Utc>) -> AgentResult<()> {
    if !allowed(goal.status, to) {
        return Err(AgentError::invalid_state(format!(
            "goal {} cannot move from {} to {}",
            goal.id,
            goal.status.as_str(),
            to.as_str()
        )));
    }
    log::debug!("[GOALS] {} {} -> {}", goal.id, goal.status.as_str(), to.as_str());
    goal.status = to;
    goal.updated_at = now;
    Ok(())
}

/// Evaluator-only completion path, applied inside an open state write
pub(crate) fn mark_completed(
    state: &mut UserState,
    goal_id: &str,
    now: DateTime<Utc>,
) -> AgentResult<()> {
    let goal = state.goal_mut(goal_id)?;
    transition(goal, GoalStatus::Completed, now)?;
    state.triggers.retain(|t| t.goal_id.as_deref() != Some(goal_id));
    Ok(())
}

// ============================================================
// GOAL MANAGER
// ============================================================

pub struct GoalManager {
    registry: Arc<StateRegistry>,
    memory: Arc<MemoryManager>,
    extractor: Arc<dyn SmartExtractor>,
    context_tokens: usize,
}

impl GoalManager {
    pub fn new(
        registry: Arc<StateRegistry>,
        memory: Arc<MemoryManager>,
        extractor: Arc<dyn SmartExtractor>,
        context_tokens: usize,
    ) -> Self {
        Self {
            registry,
            memory,
            extractor,
            context_tokens,
        }
    }

    pub fn create_collaborative_goal(&self, user_id: &str, description: &str) -> AgentResult<GoalDraft> {
        self.create_collaborative_goal_at(user_id, description, Utc::now())
    }

    /// Create a goal from free text and ask for whatever SMART fields are missing
    ///
    /// Recall and extraction failures abort before anything is stored.
    pub fn create_collaborative_goal_at(
        &self,
        user_id: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> AgentResult<GoalDraft> {
        if user_id.trim().is_empty() {
            return Err(AgentError::validation("user_id is required"));
        }
        if description.trim().is_empty() {
            return Err(AgentError::validation("goal description is empty"));
        }

        let context = self
            .memory
            .build_context_at(user_id, description, self.context_tokens, now)?;
        let smart = sanitize(self.extractor.extract(description, &context)?);

        let goal = self.registry.write(user_id, |state| {
            let mut goal = Goal::new(user_id, description, now);
            goal.smart = smart;
            transition(&mut goal, GoalStatus::Clarifying, now)?;
            state.goals.insert(goal.id.clone(), goal.clone());
            Ok(goal)
        })?;

        let questions = open_questions(&goal);
        log::info!(
            "[GOALS] Created goal {} for {} ({} open questions)",
            goal.id,
            user_id,
            questions.len()
        );
        self.remember_after_commit(
            user_id,
            &format!("Set a new goal: {}", goal.description),
            MemoryKind::Fact,
            now,
        );

        Ok(GoalDraft { goal, questions })
    }

    pub fn finalize_goal(
        &self,
        user_id: &str,
        goal_id: &str,
        answers: &SmartCriteria,
    ) -> AgentResult<Goal> {
        self.finalize_goal_at(user_id, goal_id, answers, Utc::now())
    }

    /// Fill empty SMART fields from `answers` and finalize the goal
    ///
    /// Answers never overwrite fields that already have a value. If any
    /// field is still empty the goal stays in clarifying and nothing is
    /// committed. Finalizing an already finalized goal returns it unchanged.
    pub fn finalize_goal_at(
        &self,
        user_id: &str,
        goal_id: &str,
        answers: &SmartCriteria,
        now: DateTime<Utc>,
    ) -> AgentResult<Goal> {
        if let Ok(goal) = self.registry.snapshot(user_id).goal(goal_id) {
            if goal.status == GoalStatus::Finalized {
                return Ok(goal.clone());
            }
        }

        let answers = sanitize(answers.clone());
        let (goal, changed) = self.registry.write(user_id, |state| {
            let goal = state.goal_mut(goal_id)?;
            match goal.status {
                GoalStatus::Finalized => return Ok((goal.clone(), false)),
                GoalStatus::Clarifying => {}
                other => {
                    return Err(AgentError::invalid_state(format!(
                        "goal {} is {} and cannot be finalized",
                        goal_id,
                        other.as_str()
                    )))
                }
            }

            let mut smart = goal.smart.clone();
            smart.merge_missing(&answers);
            let missing = smart.missing_fields();
            if !missing.is_empty() {
                log::debug!("[GOALS] Goal {} still missing {} fields", goal_id, missing.len());
                return Err(AgentError::IncompleteGoal {
                    missing: missing.iter().map(|f| f.as_str().to_string()).collect(),
                });
            }

            goal.deadline = smart
                .time_bound
                .as_deref()
                .and_then(|t| parse_timeline(t, now.date_naive()));
            goal.smart = smart;
            transition(goal, GoalStatus::Finalized, now)?;
            Ok((goal.clone(), true))
        })?;

        if changed {
            log::info!("[GOALS] Finalized goal {} (deadline {:?})", goal.id, goal.deadline);
            let deadline = goal
                .deadline
                .map(|d| format!(" by {}", d))
                .unwrap_or_default();
            self.remember_after_commit(
                user_id,
                &format!(
                    "Committed to '{}'{}: success means {}",
                    goal.title,
                    deadline,
                    goal.smart.measurable.as_deref().unwrap_or("progress")
                ),
                MemoryKind::Fact,
                now,
            );
        }
        Ok(goal)
    }

    /// Explicit user cancellation
    pub fn abandon_goal(&self, user_id: &str, goal_id: &str, reason: Option<&str>) -> AgentResult<Goal> {
        let now = Utc::now();
        let goal = self.registry.write(user_id, |state| {
            let goal = state.goal_mut(goal_id)?;
            transition(goal, GoalStatus::Abandoned, now)?;
            let goal = goal.clone();
            state.triggers.retain(|t| t.goal_id.as_deref() != Some(goal_id));
            Ok(goal)
        })?;

        log::info!("[GOALS] Abandoned goal {}", goal_id);
        let note = match reason {
            Some(r) if !r.trim().is_empty() => format!("Abandoned goal '{}': {}", goal.title, r.trim()),
            _ => format!("Abandoned goal '{}'", goal.title),
        };
        self.remember_after_commit(user_id, &note, MemoryKind::Interaction, now);
        Ok(goal)
    }

    pub fn get_goal(&self, user_id: &str, goal_id: &str) -> AgentResult<Goal> {
        self.registry.snapshot(user_id).goal(goal_id).cloned()
    }

    pub fn list_goals(&self, user_id: &str, status: Option<GoalStatus>) -> Vec<Goal> {
        let snapshot = self.registry.snapshot(user_id);
        let mut goals: Vec<Goal> = snapshot
            .goals
            .values()
            .filter(|g| status.map(|s| g.status == s).unwrap_or(true))
            .cloned()
            .collect();
        goals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        goals
    }

    pub fn goal_analytics(&self, user_id: &str, today: NaiveDate) -> GoalAnalytics {
        let goals = self.list_goals(user_id, None);
        if goals.is_empty() {
            return GoalAnalytics::default();
        }

        let mut analytics = GoalAnalytics {
            total_goals: goals.len(),
            ..Default::default()
        };
        for goal in &goals {
            *analytics
                .by_status
                .entry(goal.status.as_str().to_string())
                .or_insert(0) += 1;
            if goal.is_overdue(today) {
                analytics.overdue_goals += 1;
            }
        }
        let completed = goals
            .iter()
            .filter(|g| g.status == GoalStatus::Completed)
            .count();
        analytics.average_progress =
            goals.iter().map(|g| g.progress).sum::<f32>() / goals.len() as f32;
        analytics.completion_rate = completed as f32 / goals.len() as f32 * 100.0;
        analytics
    }

    fn remember_after_commit(&self, user_id: &str, text: &str, kind: MemoryKind, now: DateTime<Utc>) {
        if let Err(e) = self.memory.remember_at(user_id, text, kind, now) {
            log::warn!("[GOALS] Goal saved but memory write failed for {}: {}", user_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::memory::{DecayPolicy, MemoryStore};
    use crate::agent::smart::HeuristicSmartExtractor;
    use crate::capabilities::{CapabilityGuard, HashingEmbedder};
    use crate::config::MemoryConfig;
    use chrono::Duration;

    fn manager() -> GoalManager {
        let memory = Arc::new(MemoryManager::new(
            Arc::new(MemoryStore::in_memory(DecayPolicy::default()).unwrap()),
            Arc::new(HashingEmbedder::new(128)),
            CapabilityGuard::new(std::time::Duration::from_secs(2)),
            &MemoryConfig::default(),
        ));
        GoalManager::new(
            Arc::new(StateRegistry::in_memory()),
            memory,
            Arc::new(HeuristicSmartExtractor),
            256,
        )
    }

    fn answers() -> SmartCriteria {
        SmartCriteria {
            specific: Some("Build React apps".to_string()),
            measurable: Some("Ship 3 portfolio projects".to_string()),
            achievable: Some("10 hours per week alongside work".to_string()),
            relevant: Some("Moving into frontend engineering".to_string()),
            time_bound: Some("6 months".to_string()),
        }
    }

    #[test]
    fn test_create_asks_for_missing_fields() {
        let goals = manager();
        let draft = goals
            .create_collaborative_goal("u1", "Learn React in 6 months")
            .unwrap();
        assert_eq!(draft.goal.status, GoalStatus::Clarifying);
        let fields: Vec<SmartField> = draft.questions.iter().map(|q| q.field).collect();
        assert_eq!(
            fields,
            vec![SmartField::Measurable, SmartField::Achievable, SmartField::Relevant]
        );
    }

    #[test]
    fn test_blank_description_rejected() {
        let goals = manager();
        assert!(matches!(
            goals.create_collaborative_goal("u1", "   "),
            Err(AgentError::Validation(_))
        ));
        assert!(goals.list_goals("u1", None).is_empty());
    }

    #[test]
    fn test_incomplete_finalize_commits_nothing() {
        let goals = manager();
        let draft = goals.create_collaborative_goal("u1", "Learn React in 6 months").unwrap();
        let partial = SmartCriteria {
            measurable: Some("3 apps".to_string()),
            ..Default::default()
        };

        let err = goals.finalize_goal("u1", &draft.goal.id, &partial).unwrap_err();
        match err {
            AgentError::IncompleteGoal { missing } => {
                assert_eq!(missing, vec!["achievable".to_string(), "relevant".to_string()])
            }
            other => panic!("unexpected error {:?}", other),
        }
        let goal = goals.get_goal("u1", &draft.goal.id).unwrap();
        assert_eq!(goal.status, GoalStatus::Clarifying);
        assert!(goal.smart.measurable.is_none());
    }

    #[test]
    fn test_finalize_keeps_existing_values_and_is_idempotent() {
        let goals = manager();
        let now = Utc::now();
        let draft = goals
            .create_collaborative_goal_at("u1", "Learn React in 6 months", now)
            .unwrap();

        let goal = goals.finalize_goal_at("u1", &draft.goal.id, &answers(), now).unwrap();
        assert_eq!(goal.status, GoalStatus::Finalized);
        assert_eq!(goal.smart.specific.as_deref(), Some("Learn React in 6 months"));
        assert_eq!(goal.deadline, Some(now.date_naive() + Duration::days(180)));

        let again = goals.finalize_goal("u1", &draft.goal.id, &SmartCriteria::default()).unwrap();
        assert_eq!(again, goal);
    }

    #[test]
    fn test_oversized_time_bound_finalizes_without_deadline() {
        let goals = manager();
        let draft = goals.create_collaborative_goal("u1", "Learn Go").unwrap();
        let huge = SmartCriteria {
            time_bound: Some("in 1000000000000 days".to_string()),
            ..answers()
        };
        let goal = goals.finalize_goal("u1", &draft.goal.id, &huge).unwrap();
        assert_eq!(goal.status, GoalStatus::Finalized);
        assert!(goal.deadline.is_none());
    }

    #[test]
    fn test_terminal_goals_reject_transitions() {
        let goals = manager();
        let draft = goals.create_collaborative_goal("u1", "Get an AWS certification").unwrap();
        goals.abandon_goal("u1", &draft.goal.id, Some("changed plans")).unwrap();

        assert!(matches!(
            goals.finalize_goal("u1", &draft.goal.id, &answers()),
            Err(AgentError::InvalidState(_))
        ));
        assert!(matches!(
            goals.abandon_goal("u1", &draft.goal.id, None),
            Err(AgentError::InvalidState(_))
        ));
    }

    #[test]
    fn test_unknown_goal_not_found() {
        let goals = manager();
        assert!(matches!(
            goals.finalize_goal("u1", "missing", &answers()),
            Err(AgentError::NotFound(_))
        ));
    }

    #[test]
    fn test_goal_analytics() {
        let goals = manager();
        let now = Utc::now();
        let a = goals.create_collaborative_goal_at("u1", "Learn React in 6 months", now).unwrap();
        goals.finalize_goal_at("u1", &a.goal.id, &answers(), now).unwrap();
        let b = goals.create_collaborative_goal_at("u1", "Learn Go", now).unwrap();
        goals.abandon_goal("u1", &b.goal.id, None).unwrap();

        let analytics = goals.goal_analytics("u1", now.date_naive() + Duration::days(400));
        assert_eq!(analytics.total_goals, 2);
        assert_eq!(analytics.by_status.get("finalized"), Some(&1));
        assert_eq!(analytics.by_status.get("abandoned"), Some(&1));
        assert_eq!(analytics.overdue_goals, 1);
        assert_eq!(analytics.completion_rate, 0.0);
    }
}
