//! Runtime wiring
//!
//! Builds every component from an [`AgentConfig`] and a set of
//! capabilities, sharing one state registry and one memory store.

use crate::agent::goals::GoalManager;
use crate::agent::memory::{DecayPolicy, MemoryStore};
use crate::agent::orchestrator::Orchestrator;
use crate::agent::planner::{EffortPolicy, HeuristicEffortPolicy, TaskPlanner};
use crate::agent::recall::MemoryManager;
use crate::agent::reflection::ProgressEvaluator;
use crate::agent::smart::{GenerativeSmartExtractor, HeuristicSmartExtractor, SmartExtractor};
use crate::agent::types::{Goal, SmartCriteria};
use crate::capabilities::{CapabilityGuard, EmbeddingProvider, HashingEmbedder, TextGenerator, ToolSet};
use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::scheduler::OrchestratorLoop;
use crate::state::StateRegistry;
use crate::storage::StateStore;
use chrono::Utc;
use std::sync::Arc;

/// External capabilities the runtime is built with
#[derive(Clone)]
pub struct Capabilities {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub generator: Option<Arc<dyn TextGenerator>>,
    pub tools: ToolSet,
    pub effort_policy: Option<Arc<dyn EffortPolicy>>,
}

impl Capabilities {
    /// Hashing embedder, no text generator, bundled tools
    pub fn offline(config: &AgentConfig) -> Self {
        Self {
            embedder: Arc::new(HashingEmbedder::new(config.memory.embedding_dim)),
            generator: None,
            tools: ToolSet::default(),
            effort_policy: None,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }
}

pub struct AgentRuntime {
    pub config: AgentConfig,
    pub registry: Arc<StateRegistry>,
    pub memory: Arc<MemoryManager>,
    pub goals: Arc<GoalManager>,
    pub planner: Arc<TaskPlanner>,
    pub evaluator: Arc<ProgressEvaluator>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig, capabilities: Capabilities) -> AgentResult<Self> {
        config.validate()?;
        let policy = DecayPolicy::from(&config.memory);

        let (memory_store, registry) = match &config.storage.db_path {
            Some(path) => {
                log::info!("[RUNTIME] Opening storage at {}", path.display());
                let memory_store = MemoryStore::open(path, policy)?;
                let state_store = Arc::new(StateStore::open(path)?);
                (memory_store, StateRegistry::with_store(state_store)?)
            }
            None => {
                log::info!("[RUNTIME] Using in-memory storage");
                (MemoryStore::in_memory(policy)?, StateRegistry::in_memory())
            }
        };
        let registry = Arc::new(registry);

        let guard = CapabilityGuard::new(config.capabilities.timeout());
        let max_tokens = config.capabilities.generation_max_tokens;

        let memory = Arc::new(MemoryManager::new(
            Arc::new(memory_store),
            Arc::clone(&capabilities.embedder),
            guard.clone(),
            &config.memory,
        ));

        let extractor: Arc<dyn SmartExtractor> = match &capabilities.generator {
            Some(generator) => Arc::new(GenerativeSmartExtractor::new(
                Arc::clone(generator),
                guard.clone(),
                max_tokens,
            )),
            None => Arc::new(HeuristicSmartExtractor),
        };
        let goals = Arc::new(GoalManager::new(
            Arc::clone(&registry),
            Arc::clone(&memory),
            extractor,
            config.memory.context_max_tokens,
        ));

        let effort_policy = capabilities
            .effort_policy
            .clone()
            .unwrap_or_else(|| Arc::new(HeuristicEffortPolicy::new(config.planner.clone())));
        let mut planner = TaskPlanner::new(Arc::clone(&registry), effort_policy, guard.clone(), &config.planner);
        if let Some(generator) = &capabilities.generator {
            planner = planner.with_generator(Arc::clone(generator), max_tokens);
        }
        let planner = Arc::new(planner);

        let evaluator = Arc::new(ProgressEvaluator::new(
            Arc::clone(&registry),
            Arc::clone(&planner),
            Arc::clone(&memory),
            config.reflection.clone(),
        ));

        let mut orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&evaluator),
            Arc::clone(&memory),
            capabilities.tools.clone(),
            guard,
            config.orchestrator.clone(),
        );
        if let Some(generator) = &capabilities.generator {
            orchestrator = orchestrator.with_generator(Arc::clone(generator), max_tokens);
        }
        orchestrator.restore_schedules(Utc::now())?;

        log::info!(
            "[RUNTIME] Ready: {} users, {} memories",
            registry.users().len(),
            memory.store().len()
        );
        Ok(Self {
            config,
            registry,
            memory,
            goals,
            planner,
            evaluator,
            orchestrator: Arc::new(orchestrator),
        })
    }

    /// Offline runtime with in-memory storage and default settings
    pub fn in_memory() -> AgentResult<Self> {
        let config = AgentConfig::default();
        let capabilities = Capabilities::offline(&config);
        Self::new(config, capabilities)
    }

    /// Finalize a goal and start tracking it for reflections and deadline warnings
    pub fn finalize_goal(&self, user_id: &str, goal_id: &str, answers: &SmartCriteria) -> AgentResult<Goal> {
        let goal = self.goals.finalize_goal(user_id, goal_id, answers)?;
        self.orchestrator.track_goal(user_id, goal_id)?;
        Ok(goal)
    }

    pub fn orchestrator_loop(&self) -> OrchestratorLoop {
        OrchestratorLoop::new(Arc::clone(&self.orchestrator))
    }

    /// Flush memory to storage; task state is persisted on every commit
    pub fn shutdown(&self) -> AgentResult<()> {
        let flushed = self.memory.persist()?;
        log::info!("[RUNTIME] Shutdown flushed {} memories", flushed);
        Ok(())
    }
}
