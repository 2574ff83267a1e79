//! Per-user state partitions
//!
//! Each user owns one partition holding goals, tasks, plans, reports and
//! triggers. Writers to a partition are serialized by its writer lock and
//! work on a private copy that is published only if the whole operation
//! succeeds. Readers always see the last committed snapshot and never wait
//! on a writer.

use crate::agent::planner::PlanRecord;
use crate::agent::types::{Goal, ReflectionReport, ReflectionType, ScheduledTrigger, Task};
use crate::error::{AgentError, AgentResult};
use crate::storage::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserState {
    pub user_id: String,
    pub goals: BTreeMap<String, Goal>,
    /// Current task set of each goal, in plan order
    pub tasks: BTreeMap<String, Vec<Task>>,
    pub plans: BTreeMap<String, PlanRecord>,
    /// Replaced tasks that a stored report still refers to
    pub archived_tasks: Vec<Task>,
    pub reports: Vec<ReflectionReport>,
    pub triggers: Vec<ScheduledTrigger>,
    /// Last task status change (or replan) per goal
    pub last_status_change: BTreeMap<String, DateTime<Utc>>,
    pub cadence: Option<ReflectionType>,
}

impl UserState {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    pub fn goal(&self, goal_id: &str) -> AgentResult<&Goal> {
        self.goals
            .get(goal_id)
            .ok_or_else(|| AgentError::not_found(format!("goal {} for user {}", goal_id, self.user_id)))
    }

    pub fn goal_mut(&mut self, goal_id: &str) -> AgentResult<&mut Goal> {
        let user_id = self.user_id.clone();
        self.goals
            .get_mut(goal_id)
            .ok_or_else(|| AgentError::not_found(format!("goal {} for user {}", goal_id, user_id)))
    }

    pub fn tasks_of(&self, goal_id: &str) -> &[Task] {
        self.tasks.get(goal_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Most recent report of `reflection_type` that covered `goal_id`
    pub fn last_report_for(
        &self,
        goal_id: &str,
        reflection_type: ReflectionType,
    ) -> Option<&ReflectionReport> {
        self.reports
            .iter()
            .rev()
            .find(|r| r.reflection_type == reflection_type && r.goal_ids.iter().any(|g| g == goal_id))
    }

    /// Whether any stored report refers to `task_id`
    pub fn report_references(&self, task_id: &str) -> bool {
        self.reports.iter().any(|r| {
            r.assessments
                .iter()
                .any(|a| a.task_ids.iter().any(|t| t == task_id))
        })
    }

    /// Recompute a goal's progress from its current tasks
    pub fn refresh_progress(&mut self, goal_id: &str, now: DateTime<Utc>) -> AgentResult<f32> {
        let totals = crate::agent::types::EffortTotals::of(self.tasks_of(goal_id));
        let goal = self.goal_mut(goal_id)?;
        goal.progress = totals.ratio();
        goal.updated_at = now;
        Ok(goal.progress)
    }
}

struct Slot {
    writer: Mutex<()>,
    committed: RwLock<Arc<UserState>>,
}

impl Slot {
    fn new(state: UserState) -> Self {
        Self {
            writer: Mutex::new(()),
            committed: RwLock::new(Arc::new(state)),
        }
    }

    fn current(&self) -> Arc<UserState> {
        Arc::clone(&self.committed.read().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Registry of user partitions, optionally backed by a [`StateStore`]
pub struct StateRegistry {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    store: Option<Arc<StateStore>>,
}

impl StateRegistry {
    pub fn in_memory() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Registry that persists every commit and starts from the stored state
    pub fn with_store(store: Arc<StateStore>) -> AgentResult<Self> {
        let mut slots = HashMap::new();
        for state in store.load_all()? {
            slots.insert(state.user_id.clone(), Arc::new(Slot::new(state)));
        }
        Ok(Self {
            slots: RwLock::new(slots),
            store: Some(store),
        })
    }

    fn slot(&self, user_id: &str) -> Arc<Slot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
        {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            slots
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Slot::new(UserState::new(user_id)))),
        )
    }

    /// Last committed state of `user_id`
    pub fn snapshot(&self, user_id: &str) -> Arc<UserState> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        match slots.get(user_id) {
            Some(slot) => slot.current(),
            None => Arc::new(UserState::new(user_id)),
        }
    }

    /// Run `mutate` against a copy of the user's state and commit it on success
    ///
    /// On error the copy is dropped and nothing is published or persisted.
    pub fn write<T, F>(&self, user_id: &str, mutate: F) -> AgentResult<T>
    where
        F: FnOnce(&mut UserState) -> AgentResult<T>,
    {
        let slot = self.slot(user_id);
        let _writer = slot.writer.lock().unwrap_or_else(|e| e.into_inner());

        let mut draft = (*slot.current()).clone();
        let value = mutate(&mut draft)?;

        if let Some(store) = &self.store {
            store.save_user(&draft)?;
        }
        *slot.committed.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(draft);
        Ok(value)
    }

    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::{ScheduledTrigger, TriggerKind};
    use std::thread;

    #[test]
    fn test_failed_write_commits_nothing() {
        let registry = StateRegistry::in_memory();
        let result: AgentResult<()> = registry.write("u1", |state| {
            state
                .triggers
                .push(ScheduledTrigger::new("u1", TriggerKind::CheckIn, Utc::now()));
            Err(AgentError::validation("abort"))
        });
        assert!(result.is_err());
        assert!(registry.snapshot("u1").triggers.is_empty());
    }

    #[test]
    fn test_reading_unknown_user_registers_nothing() {
        let registry = StateRegistry::in_memory();
        let state = registry.snapshot("ghost");
        assert_eq!(state.user_id, "ghost");
        assert!(state.goals.is_empty());
        assert!(registry.users().is_empty());

        registry.write("u1", |_| Ok(())).unwrap();
        registry.snapshot("ghost");
        assert_eq!(registry.users(), vec!["u1".to_string()]);
    }

    #[test]
    fn test_snapshot_is_stable_across_writes() {
        let registry = StateRegistry::in_memory();
        let before = registry.snapshot("u1");
        registry
            .write("u1", |state| {
                state.cadence = Some(ReflectionType::Daily);
                Ok(())
            })
            .unwrap();
        assert_eq!(before.cadence, None);
        assert_eq!(registry.snapshot("u1").cadence, Some(ReflectionType::Daily));
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        let registry = Arc::new(StateRegistry::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..25 {
                        registry
                            .write("u1", |state| {
                                state.triggers.push(ScheduledTrigger::new(
                                    "u1",
                                    TriggerKind::CheckIn,
                                    Utc::now(),
                                ));
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.snapshot("u1").triggers.len(), 200);
    }

    #[test]
    fn test_registry_reloads_from_store() {
        let store = Arc::new(StateStore::in_memory().unwrap());
        {
            let registry = StateRegistry::with_store(Arc::clone(&store)).unwrap();
            registry
                .write("u9", |state| {
                    state.cadence = Some(ReflectionType::Monthly);
                    Ok(())
                })
                .unwrap();
        }
        let registry = StateRegistry::with_store(store).unwrap();
        assert_eq!(registry.users(), vec!["u9".to_string()]);
        assert_eq!(registry.snapshot("u9").cadence, Some(ReflectionType::Monthly));
    }
}
