//! SQLite persistence for per-user agent state
//!
//! Goals, tasks, reports, triggers and plan metadata are stored as JSON
//! bodies in a single keyed table. Saving a user rewrites that user's rows
//! in one transaction, so a crash leaves the previous committed state.

use crate::error::AgentResult;
use crate::state::UserState;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

const KIND_GOAL: &str = "goal";
const KIND_TASK: &str = "task";
const KIND_ARCHIVED_TASK: &str = "archived_task";
const KIND_PLAN: &str = "plan";
const KIND_REPORT: &str = "report";
const KIND_TRIGGER: &str = "trigger";
const KIND_META: &str = "meta";

pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub fn open(db_path: impl AsRef<Path>) -> AgentResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store for testing
    pub fn in_memory() -> AgentResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AgentResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_records (
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (user_id, kind, id)
            );
            CREATE INDEX IF NOT EXISTS idx_user_records_user ON user_records(user_id);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Replace everything stored for `state.user_id`
    pub fn save_user(&self, state: &UserState) -> AgentResult<()> {
        let rows = encode(state)?;
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM user_records WHERE user_id = ?1",
            params![state.user_id],
        )?;
        for (seq, (kind, id, body)) in rows.iter().enumerate() {
            tx.execute(
                "INSERT INTO user_records (user_id, kind, id, seq, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![state.user_id, kind, id, seq as i64, body],
            )?;
        }
        tx.commit()?;
        log::debug!("[STORE] Saved {} records for {}", rows.len(), state.user_id);
        Ok(())
    }

    /// Rebuild every stored user's state
    pub fn load_all(&self) -> AgentResult<Vec<UserState>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT user_id, kind, body FROM user_records ORDER BY user_id, seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut users: BTreeMap<String, UserState> = BTreeMap::new();
        for row in rows {
            let (user_id, kind, body) = row?;
            let state = users
                .entry(user_id.clone())
                .or_insert_with(|| UserState::new(&user_id));
            decode_into(state, &kind, &body)?;
        }

        log::info!("[STORE] Loaded state for {} users", users.len());
        Ok(users.into_values().collect())
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Meta {
    cadence: Option<crate::agent::types::ReflectionType>,
    last_status_change: BTreeMap<String, chrono::DateTime<chrono::Utc>>,
}

fn encode(state: &UserState) -> AgentResult<Vec<(&'static str, String, String)>> {
    let mut rows = Vec::new();
    for goal in state.goals.values() {
        rows.push((KIND_GOAL, goal.id.clone(), serde_json::to_string(goal)?));
    }
    for task in state.tasks.values().flatten() {
        rows.push((KIND_TASK, task.id.clone(), serde_json::to_string(task)?));
    }
    for task in &state.archived_tasks {
        rows.push((KIND_ARCHIVED_TASK, task.id.clone(), serde_json::to_string(task)?));
    }
    for (goal_id, plan) in &state.plans {
        rows.push((KIND_PLAN, goal_id.clone(), serde_json::to_string(plan)?));
    }
    for report in &state.reports {
        rows.push((KIND_REPORT, report.id.clone(), serde_json::to_string(report)?));
    }
    for trigger in &state.triggers {
        rows.push((KIND_TRIGGER, trigger.id.clone(), serde_json::to_string(trigger)?));
    }
    let meta = Meta {
        cadence: state.cadence,
        last_status_change: state.last_status_change.clone(),
    };
    rows.push((KIND_META, state.user_id.clone(), serde_json::to_string(&meta)?));
    Ok(rows)
}

fn decode_into(state: &mut UserState, kind: &str, body: &str) -> AgentResult<()> {
    match kind {
        KIND_GOAL => {
            let goal: crate::agent::types::Goal = serde_json::from_str(body)?;
            state.goals.insert(goal.id.clone(), goal);
        }
        KIND_TASK => {
            let task: crate::agent::types::Task = serde_json::from_str(body)?;
            state.tasks.entry(task.goal_id.clone()).or_default().push(task);
        }
        KIND_ARCHIVED_TASK => state.archived_tasks.push(serde_json::from_str(body)?),
        KIND_PLAN => {
            let plan: crate::agent::planner::PlanRecord = serde_json::from_str(body)?;
            state.plans.insert(plan.goal_id.clone(), plan);
        }
        KIND_REPORT => state.reports.push(serde_json::from_str(body)?),
        KIND_TRIGGER => state.triggers.push(serde_json::from_str(body)?),
        KIND_META => {
            let meta: Meta = serde_json::from_str(body)?;
            state.cadence = meta.cadence;
            state.last_status_change = meta.last_status_change;
        }
        other => log::warn!("[STORE] Skipping unknown record kind '{}'", other),
    }
    Ok(())
}
