//! Scientist loop tests - full runs over a real bus and an in-memory world model
//!
//! These tests verify the loop end to end:
//! - The budget stops the run after the cycle that spends it
//! - Analysis is triggered exactly once per cycle
//! - Plan rejections are retried a bounded number of times
//! - The Pareto front excludes dominated results
//! - Too few successes yield an insufficient-data insight
//! - The cycle watchdog closes a cycle whose experiments never report

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use scientist::actors::executor::{ExperimentRunner, RunOutput, RunnerError, SimulatedRunner};
use scientist::actors::planner::Candidate;
use scientist::config::ScientistConfig;
use scientist::llm::OfflineBackend;
use scientist::scientist::Scientist;
use shared_types::{
    Artifacts, DesignSpace, Event, EventPayload, ExperimentConfig, ExperimentStatus,
    InsightStatus, Metrics, Topic,
};
use tokio::time::{timeout, Duration};

// ============================================================================
// Helpers
// ============================================================================

fn test_config(budget_max: usize, max_cycles: u32) -> ScientistConfig {
    let mut config = ScientistConfig::default();
    config.database.path = ":memory:".to_string();
    config.experiment.budget_max = budget_max;
    config.experiment.max_cycles = max_cycles;
    config.planner.seed = Some(11);
    config.director.cycle_timeout_secs = 30;
    config.director.analysis_timeout_secs = 30;
    config
}

/// A configuration inside the default design space.
fn config_for(id: &str, compression_ratio: u32) -> ExperimentConfig {
    let mut config = Candidate {
        compression_ratio,
        mask_type: "random".to_string(),
        num_stages: 7,
        num_features: 64,
        num_blocks: 3,
        learning_rate: 1e-4,
        activation: "ReLU".to_string(),
        recon_family: None,
        uq_scheme: None,
    }
    .into_config(&DesignSpace::default());
    config.experiment_id = id.to_string();
    config
}

fn metrics(psnr: f64, ssim: f64, latency: f64) -> Metrics {
    Metrics {
        psnr,
        ssim,
        coverage: 0.9,
        latency,
        memory: 512.0,
        training_time: 60.0,
        convergence_epoch: 20,
    }
}

/// Scores each configuration by compression ratio; unknown ratios fail.
struct ScoredRunner {
    scores: HashMap<u32, Metrics>,
}

#[async_trait]
impl ExperimentRunner for ScoredRunner {
    fn name(&self) -> &str {
        "scored"
    }

    async fn run(&self, config: &ExperimentConfig) -> Result<RunOutput, RunnerError> {
        let ratio = config.forward_config.compression_ratio;
        match self.scores.get(&ratio) {
            Some(metrics) => Ok(RunOutput {
                metrics: metrics.clone(),
                artifacts: Artifacts::default(),
            }),
            None => Err(RunnerError::InvalidOutput(format!("no score for cr={ratio}"))),
        }
    }
}

/// Never reports back within a test's lifetime.
struct HangingRunner;

#[async_trait]
impl ExperimentRunner for HangingRunner {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn run(&self, _config: &ExperimentConfig) -> Result<RunOutput, RunnerError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Err(RunnerError::InvalidOutput("unreachable".to_string()))
    }
}

async fn start(config: ScientistConfig, runner: Arc<dyn ExperimentRunner>) -> Scientist {
    Scientist::start_with(config, Arc::new(OfflineBackend), runner)
        .await
        .expect("scientist should start")
}

async fn events(scientist: &Scientist, topic: Topic) -> Vec<Event> {
    scientist.bus().history(Some(topic)).await.unwrap()
}

fn cycle_of(event: &Event) -> Option<u32> {
    match &event.payload {
        EventPayload::PlanRequested(p) => Some(p.cycle),
        EventPayload::PlanApproved(p) => Some(p.cycle),
        EventPayload::PlanRejected(p) => Some(p.cycle),
        EventPayload::ExperimentCompleted(p) => Some(p.result.cycle),
        EventPayload::StateUpdated(p) => Some(p.cycle),
        EventPayload::InsightGenerated(p) => Some(p.cycle),
    }
}

fn count_in_cycle(events: &[Event], cycle: u32) -> usize {
    events.iter().filter(|e| cycle_of(e) == Some(cycle)).count()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_budget_stops_run_after_second_cycle() {
    // Given: budget for two batches of three
    let scientist = start(
        test_config(6, 5),
        Arc::new(SimulatedRunner::new(Duration::ZERO)),
    )
    .await;

    // When: the loop runs from the baseline batch
    let outcome = timeout(Duration::from_secs(20), scientist.run(None))
        .await
        .expect("run should finish")
        .expect("run should succeed");

    // Then: two cycles, six experiments, nothing requested for a third cycle
    assert_eq!(outcome.experiments_used, 6);
    assert_eq!(outcome.cycles_completed, 2);
    assert!(!outcome.pareto_ids.is_empty());

    let requests = events(&scientist, Topic::PlanRequested).await;
    assert_eq!(count_in_cycle(&requests, 1), 1);
    assert_eq!(count_in_cycle(&requests, 2), 0);

    let results = scientist.world_model().get_all_experiments().unwrap();
    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| r.status == ExperimentStatus::Completed));

    let status = scientist.status().await.unwrap();
    assert!(status.stopped);
    scientist.shutdown().await;
}

#[tokio::test]
async fn test_analysis_triggered_once_per_cycle() {
    let scientist = start(
        test_config(6, 5),
        Arc::new(SimulatedRunner::new(Duration::from_millis(5))),
    )
    .await;

    timeout(Duration::from_secs(20), scientist.run(None))
        .await
        .expect("run should finish")
        .expect("run should succeed");

    let triggers: Vec<Event> = events(&scientist, Topic::StateUpdated)
        .await
        .into_iter()
        .filter(|e| matches!(&e.payload, EventPayload::StateUpdated(u) if u.trigger_analysis))
        .collect();
    assert_eq!(count_in_cycle(&triggers, 0), 1);
    assert_eq!(count_in_cycle(&triggers, 1), 1);

    let insights = events(&scientist, Topic::InsightGenerated).await;
    assert_eq!(insights.len(), 2);
    scientist.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_design_space_retries_then_analyzes() {
    // Given: a design space with exactly the three baseline points
    let mut config = test_config(20, 1);
    config.design_space = DesignSpace {
        mask_types: vec!["random".to_string()],
        num_stages: vec![7],
        num_features: vec![64],
        num_blocks: vec![3],
        learning_rates: vec![1e-4],
        activations: vec!["ReLU".to_string()],
        ..DesignSpace::default()
    };
    let scientist = start(config, Arc::new(SimulatedRunner::new(Duration::ZERO))).await;

    // When
    let outcome = timeout(Duration::from_secs(20), scientist.run(None))
        .await
        .expect("run should finish")
        .expect("run should succeed");

    // Then: one request plus two retries, then analysis closes the cycle
    let requests = events(&scientist, Topic::PlanRequested).await;
    let rejections = events(&scientist, Topic::PlanRejected).await;
    assert_eq!(count_in_cycle(&requests, 1), 3);
    assert_eq!(count_in_cycle(&rejections, 1), 3);

    let reasons: Vec<Option<String>> = events(&scientist, Topic::StateUpdated)
        .await
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::StateUpdated(u) if u.cycle == 1 => Some(u.reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![Some("plan_retries_exhausted".to_string())]);

    assert_eq!(outcome.experiments_used, 3);
    assert_eq!(outcome.cycles_completed, 2);
    scientist.shutdown().await;
}

#[tokio::test]
async fn test_pareto_front_excludes_dominated_result() {
    // Given: A beats C on every objective, B trades quality for speed
    let runner = ScoredRunner {
        scores: HashMap::from([
            (8, metrics(30.0, 0.90, 50.0)),
            (16, metrics(28.0, 0.88, 20.0)),
            (24, metrics(27.0, 0.85, 60.0)),
        ]),
    };
    let scientist = start(test_config(3, 5), Arc::new(runner)).await;
    let initial = vec![
        config_for("exp_a", 8),
        config_for("exp_b", 16),
        config_for("exp_c", 24),
    ];

    // When
    let outcome = timeout(Duration::from_secs(20), scientist.run(Some(initial)))
        .await
        .expect("run should finish")
        .expect("run should succeed");

    // Then
    let mut front = outcome.pareto_ids.clone();
    front.sort();
    assert_eq!(front, vec!["exp_a".to_string(), "exp_b".to_string()]);
    assert_eq!(outcome.insights.status, InsightStatus::Complete);
    assert_eq!(outcome.cycles_completed, 1);

    let history = scientist.world_model().pareto_history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].0, 0);
    scientist.shutdown().await;
}

#[tokio::test]
async fn test_too_few_successes_yield_insufficient_data() {
    // Given: only cr=8 succeeds
    let runner = ScoredRunner {
        scores: HashMap::from([(8, metrics(30.0, 0.90, 50.0))]),
    };
    let scientist = start(test_config(3, 5), Arc::new(runner)).await;

    // When
    let outcome = timeout(Duration::from_secs(20), scientist.run(None))
        .await
        .expect("run should finish")
        .expect("run should succeed");

    // Then: failures still count against the budget
    assert_eq!(outcome.experiments_used, 3);
    assert_eq!(outcome.insights.status, InsightStatus::InsufficientData);
    assert_eq!(outcome.insights.message.as_deref(), Some("Insufficient data"));
    assert!(outcome.pareto_ids.is_empty());

    let failed = scientist
        .world_model()
        .get_all_experiments()
        .unwrap()
        .into_iter()
        .filter(|r| r.status == ExperimentStatus::Failed)
        .count();
    assert_eq!(failed, 2);
    scientist.shutdown().await;
}

#[tokio::test]
async fn test_cycle_watchdog_records_timeouts() {
    // Given: experiments that never finish and a one second cycle deadline
    let mut config = test_config(3, 5);
    config.director.cycle_timeout_secs = 1;
    config.director.analysis_timeout_secs = 1;
    let scientist = start(config, Arc::new(HangingRunner)).await;

    // When
    let outcome = timeout(Duration::from_secs(20), scientist.run(None))
        .await
        .expect("watchdog should end the run")
        .expect("run should succeed");

    // Then: the batch is recorded as timed out and analysis still ran
    assert_eq!(outcome.experiments_used, 3);
    assert_eq!(outcome.cycles_completed, 1);
    let results = scientist.world_model().get_all_experiments().unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status == ExperimentStatus::TimedOut));

    let reasons: Vec<Option<String>> = events(&scientist, Topic::StateUpdated)
        .await
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::StateUpdated(u) => Some(u.reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![Some("cycle_timeout".to_string())]);
    scientist.shutdown().await;
}
