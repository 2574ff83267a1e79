//! Agent configuration
//!
//! Every tunable of the memory, planning, reflection and orchestration
//! layers lives here. All sections default sensibly so a partial YAML file
//! (or none at all) is a valid configuration.

use crate::agent::types::ReflectionType;
use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================
// TOP-LEVEL CONFIG
// ============================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub storage: StorageConfig,
    pub memory: MemoryConfig,
    pub capabilities: CapabilityConfig,
    pub planner: PlannerConfig,
    pub reflection: ReflectionConfig,
    pub orchestrator: OrchestratorConfig,
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> AgentResult<Self> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let config: AgentConfig = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> AgentResult<Self> {
        let config: AgentConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make decay, planning or scoring meaningless
    pub fn validate(&self) -> AgentResult<()> {
        let m = &self.memory;
        if !(m.decay_factor > 0.0 && m.decay_factor <= 1.0) {
            return Err(AgentError::validation("memory.decay_factor must be in (0, 1]"));
        }
        if m.decay_unit_days <= 0 {
            return Err(AgentError::validation("memory.decay_unit_days must be positive"));
        }
        if !(0.0..=1.0).contains(&m.importance_floor) {
            return Err(AgentError::validation("memory.importance_floor must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&m.dedup_threshold) {
            return Err(AgentError::validation("memory.dedup_threshold must be in [0, 1]"));
        }
        if m.recall_half_life_days <= 0.0 {
            return Err(AgentError::validation("memory.recall_half_life_days must be positive"));
        }

        let p = &self.planner;
        if p.hours_per_week <= 0.0 || p.utilization <= 0.0 || p.base_chunk_hours <= 0.0 {
            return Err(AgentError::validation(
                "planner hours_per_week, utilization and base_chunk_hours must be positive",
            ));
        }
        if p.min_tasks == 0 || p.min_tasks > p.max_tasks {
            return Err(AgentError::validation("planner requires 0 < min_tasks <= max_tasks"));
        }

        let r = &self.reflection;
        if r.replan_effort_scale <= 0.0 || r.replan_effort_scale > 1.0 {
            return Err(AgentError::validation("reflection.replan_effort_scale must be in (0, 1]"));
        }

        if self.capabilities.timeout_ms == 0 {
            return Err(AgentError::validation("capabilities.timeout_ms must be positive"));
        }
        Ok(())
    }
}

// ============================================================
// SECTIONS
// ============================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Dimension of the bundled hashing embedder
    pub embedding_dim: usize,
    pub decay_unit_days: i64,
    pub decay_factor: f32,
    pub importance_floor: f32,
    pub retention_horizon_days: i64,
    /// Similarity at or above which `remember` reinforces instead of inserting
    pub dedup_threshold: f32,
    pub reinforce_boost: f32,
    pub recall_half_life_days: f64,
    /// Token budget for context assembled during goal creation
    pub context_max_tokens: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 256,
            decay_unit_days: 7,
            decay_factor: 0.95,
            importance_floor: 0.05,
            retention_horizon_days: 30,
            dedup_threshold: 0.97,
            reinforce_boost: 0.1,
            recall_half_life_days: 30.0,
            context_max_tokens: 512,
        }
    }
}

impl MemoryConfig {
    pub fn recall_half_life(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.recall_half_life_days * 86_400.0) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Per-call timeout for embedding and text generation
    pub timeout_ms: u64,
    pub generation_max_tokens: usize,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            generation_max_tokens: 512,
        }
    }
}

impl CapabilityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub hours_per_week: f32,
    /// Fraction of weekly hours a plan is allowed to consume
    pub utilization: f32,
    /// Horizon used when a goal has no deadline
    pub default_horizon_weeks: u32,
    pub min_tasks: usize,
    pub max_tasks: usize,
    /// Task size for a narrowly scoped goal; broader scope shrinks it
    pub base_chunk_hours: f32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            hours_per_week: 10.0,
            utilization: 0.8,
            default_horizon_weeks: 26,
            min_tasks: 3,
            max_tasks: 24,
            base_chunk_hours: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// How far below expected progress a goal may fall before it is at risk
    pub at_risk_margin: f32,
    pub replan_effort_scale: f32,
    pub job_search_threshold: f32,
    pub schedule_window_days: i64,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            at_risk_margin: 0.15,
            replan_effort_scale: 0.75,
            job_search_threshold: 0.6,
            schedule_window_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Whether the background trigger loop runs
    pub enabled: bool,
    pub default_cadence: ReflectionType,
    pub deadline_warning_lead_days: i64,
    pub check_in_delay_hours: i64,
    pub retry_backoff_ms: u64,
    pub poll_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_cadence: ReflectionType::Weekly,
            deadline_warning_lead_days: 7,
            check_in_delay_hours: 48,
            retry_backoff_ms: 500,
            poll_interval_secs: 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
