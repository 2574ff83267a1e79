use automentor_core::agent::planner::PlanningStrategy;
use automentor_core::agent::types::{
    GoalHealth, GoalStatus, MemoryKind, ReflectionType, SmartCriteria, TaskStatus,
};
use automentor_core::capabilities::{MockEmbedder, ToolSet};
use automentor_core::config::AgentConfig;
use automentor_core::error::AgentError;
use automentor_core::runtime::{AgentRuntime, Capabilities};
use chrono::{Duration, Utc};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn react_answers() -> SmartCriteria {
    SmartCriteria {
        specific: Some("Learn React in 6 months".to_string()),
        measurable: Some("Ship 3 React portfolio apps".to_string()),
        achievable: Some("10 hours per week alongside my job".to_string()),
        relevant: Some("Moving into frontend development".to_string()),
        time_bound: Some("6 months".to_string()),
    }
}

#[test]
fn test_react_goal_to_milestone_plan() {
    init_logging();
    let runtime = AgentRuntime::in_memory().unwrap();
    let draft = runtime
        .goals
        .create_collaborative_goal("u1", "Learn React in 6 months")
        .unwrap();
    assert_eq!(draft.goal.status, GoalStatus::Clarifying);

    let goal = runtime
        .finalize_goal("u1", &draft.goal.id, &react_answers())
        .unwrap();
    assert_eq!(goal.status, GoalStatus::Finalized);
    let days = (goal.deadline.unwrap() - Utc::now().date_naive()).num_days();
    assert!((175..=185).contains(&days), "deadline {} days out", days);

    // finalizing twice is a no-op
    let again = runtime
        .finalize_goal("u1", &draft.goal.id, &SmartCriteria::default())
        .unwrap();
    assert_eq!(again, goal);

    let plan = runtime
        .planner
        .create_comprehensive_plan("u1", &goal.id, PlanningStrategy::Milestone)
        .unwrap();
    assert!(!plan.clusters.is_empty());
    assert!(plan.tasks.iter().any(|t| t.milestone));
    assert!(plan.total_duration_days <= 183, "{} days", plan.total_duration_days);
    assert!(plan.total_duration_weeks <= 26.0);

    let pending = runtime.orchestrator.pending_triggers("u1");
    assert!(pending.iter().any(|t| t.goal_id.as_deref() == Some(goal.id.as_str())));
}

#[test]
fn test_incomplete_answers_keep_goal_clarifying() {
    let runtime = AgentRuntime::in_memory().unwrap();
    let draft = runtime
        .goals
        .create_collaborative_goal("u1", "Get better at something")
        .unwrap();

    let partial = SmartCriteria {
        measurable: Some("Finish 2 courses".to_string()),
        ..Default::default()
    };
    match runtime.goals.finalize_goal("u1", &draft.goal.id, &partial) {
        Err(AgentError::IncompleteGoal { missing }) => assert!(!missing.is_empty()),
        other => panic!("expected incomplete goal, got {:?}", other),
    }

    let stored = runtime.goals.get_goal("u1", &draft.goal.id).unwrap();
    assert_eq!(stored.status, GoalStatus::Clarifying);
    assert_eq!(stored.smart, draft.goal.smart);
    assert!(runtime
        .planner
        .create_comprehensive_plan("u1", &draft.goal.id, PlanningStrategy::Linear)
        .is_err());
}

#[test]
fn test_recall_is_isolated_per_user() {
    let runtime = AgentRuntime::in_memory().unwrap();
    let memory = &runtime.memory;
    memory
        .remember("u1", "I built two apps to practice my React skills", MemoryKind::Fact)
        .unwrap();
    memory
        .remember("u1", "Prefers studying in the evening", MemoryKind::Interaction)
        .unwrap();
    memory
        .remember("u2", "React skills are the main gap for the new role", MemoryKind::Fact)
        .unwrap();
    memory
        .remember("u2", "Wants a frontend job with React skills", MemoryKind::Fact)
        .unwrap();

    let results = memory
        .recall("u1", "React skills", 3, memory.default_half_life())
        .unwrap();
    assert!(!results.is_empty() && results.len() <= 3);
    assert!(results.iter().all(|r| r.record.user_id == "u1"));
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(results[0].record.text.contains("React"));
}

#[test]
fn test_two_stalled_weekly_reflections_replan() {
    init_logging();
    let runtime = AgentRuntime::in_memory().unwrap();
    let t0 = Utc::now();
    let draft = runtime
        .goals
        .create_collaborative_goal_at("u1", "Learn React in 6 months", t0)
        .unwrap();
    let goal = runtime
        .goals
        .finalize_goal_at("u1", &draft.goal.id, &react_answers(), t0)
        .unwrap();
    runtime
        .planner
        .create_comprehensive_plan_at("u1", &goal.id, PlanningStrategy::Milestone, t0)
        .unwrap();

    let first = runtime
        .evaluator
        .conduct_reflection_at("u1", &[], ReflectionType::Weekly, t0 + Duration::days(7))
        .unwrap();
    assert_ne!(first.assessment(&goal.id).unwrap().health, GoalHealth::Stalled);

    let second = runtime
        .evaluator
        .conduct_reflection_at("u1", &[], ReflectionType::Weekly, t0 + Duration::days(14))
        .unwrap();
    let assessment = second.assessment(&goal.id).unwrap();
    assert_eq!(assessment.health, GoalHealth::Stalled);
    assert!(assessment.replanned);
    assert!(!second.recommendations.is_empty());
    assert_eq!(
        runtime.planner.plan_record("u1", &goal.id).unwrap().strategy,
        PlanningStrategy::Linear
    );

    let reflections = runtime.memory.stats("u1").by_kind.get("reflection").copied();
    assert!(reflections.unwrap_or(0) >= 2);
}

#[test]
fn test_completing_every_task_completes_goal() {
    let runtime = AgentRuntime::in_memory().unwrap();
    let draft = runtime
        .goals
        .create_collaborative_goal("u1", "Learn React in 6 months")
        .unwrap();
    let goal = runtime
        .goals
        .finalize_goal("u1", &draft.goal.id, &react_answers())
        .unwrap();
    let plan = runtime
        .planner
        .create_comprehensive_plan("u1", &goal.id, PlanningStrategy::Parallel)
        .unwrap();

    for task in &plan.tasks {
        runtime
            .planner
            .update_task_status("u1", &goal.id, &task.id, TaskStatus::Completed)
            .unwrap();
        let progress = runtime.evaluator.progress_snapshot("u1").overall_progress;
        assert!((0.0..=1.0).contains(&progress));
    }
    assert_eq!(runtime.evaluator.progress_snapshot("u1").overall_progress, 1.0);

    let report = runtime
        .evaluator
        .conduct_reflection("u1", &[], ReflectionType::OnDemand)
        .unwrap();
    assert_eq!(report.overall_progress, 1.0);
    assert_eq!(
        runtime.goals.get_goal("u1", &goal.id).unwrap().status,
        GoalStatus::Completed
    );
    assert!(runtime.orchestrator.pending_triggers("u1").iter().all(|t| t.goal_id.is_none()));
}

#[test]
fn test_embedding_timeout_aborts_goal_creation() {
    init_logging();
    let mut config = AgentConfig::default();
    config.capabilities.timeout_ms = 50;
    let embedder = Arc::new(MockEmbedder::new(64).slow(std::time::Duration::from_millis(300)));
    let capabilities = Capabilities {
        embedder: embedder.clone(),
        generator: None,
        tools: ToolSet::default(),
        effort_policy: None,
    };
    let runtime = AgentRuntime::new(config, capabilities).unwrap();

    let result = runtime.goals.create_collaborative_goal("u1", "Learn Rust this year");
    assert!(matches!(result, Err(AgentError::CapabilityTimeout { .. })));
    assert!(runtime.goals.list_goals("u1", None).is_empty());
    assert_eq!(runtime.memory.stats("u1").total, 0);
}

#[test]
fn test_goal_analytics_counts_statuses() {
    let runtime = AgentRuntime::in_memory().unwrap();
    let a = runtime
        .goals
        .create_collaborative_goal("u1", "Learn React in 6 months")
        .unwrap();
    runtime
        .goals
        .create_collaborative_goal("u1", "Read more books")
        .unwrap();
    runtime.goals.abandon_goal("u1", &a.goal.id, Some("changed plans")).unwrap();

    let analytics = runtime.goals.goal_analytics("u1", Utc::now().date_naive());
    assert_eq!(analytics.total_goals, 2);
    assert_eq!(analytics.by_status.get("abandoned"), Some(&1));
    assert_eq!(analytics.by_status.get("clarifying"), Some(&1));
    assert_eq!(analytics.completion_rate, 0.0);
}
