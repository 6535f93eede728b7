//! Executor - runs approved configurations
//!
//! Each approved configuration becomes one task on a shared semaphore
//! (`max_parallel`). Every task publishes exactly one `EXPERIMENT_COMPLETED`,
//! whatever happens to the run: runner errors, timeouts and panics all turn
//! into failure-status results. A result the bus refuses is recorded directly
//! in the world model as a failure, when one is attached.

use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use shared_types::{
    Artifacts, Event, EventPayload, ExperimentCompleted, ExperimentConfig, ExperimentResult,
    ExperimentStatus, Metrics,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::actors::event_bus::{panic_message, EventBus, EventHandler, HandlerResult};
use crate::llm::extract_json;
use crate::world_model::WorldModel;

pub const EXECUTOR_SENDER: &str = "Executor";

// ============================================================================
// Runners
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub metrics: Metrics,
    pub artifacts: Artifacts,
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to start runner: {0}")]
    Spawn(String),
    #[error("runner io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runner exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("runner produced invalid output: {0}")]
    InvalidOutput(String),
}

/// Executes one configuration to completion.
#[async_trait]
pub trait ExperimentRunner: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self, config: &ExperimentConfig) -> Result<RunOutput, RunnerError>;
}

/// Synthetic metrics derived from the configuration fingerprint, so the same
/// configuration always scores the same.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRunner {
    delay: Duration,
}

impl SimulatedRunner {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

pub fn simulated_metrics(config: &ExperimentConfig) -> Metrics {
    let fingerprint = config.fingerprint();
    let seed = u64::from_str_radix(&fingerprint[..16], 16).unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);

    let rp = &config.recon_params;
    let cr = config.forward_config.compression_ratio as f64;
    let depth = rp.num_stages as f64;
    let width = (rp.num_features as f64 / 32.0).max(1.0).log2();
    let blocks = rp.num_blocks as f64;

    let mut psnr = 24.0 + depth * 0.6 + width * 1.2 + blocks * 0.3 - cr * 0.12;
    if config.forward_config.mask_type == "optimized" {
        psnr += 0.8;
    }
    if rp.activation == "LeakyReLU" {
        psnr += 0.2;
    }
    psnr -= config.forward_config.sensor_noise * 10.0;
    psnr += rng.gen_range(-0.75..0.75);

    let ssim = (0.55 + (psnr - 20.0) * 0.025 + rng.gen_range(-0.01..0.01)).clamp(0.0, 0.99);
    let latency = depth * blocks * (rp.num_features as f64 / 32.0) * 1.6 + rng.gen_range(0.0..4.0);
    let memory = 256.0 + rp.num_features as f64 * depth * 2.0;
    let epochs = rng.gen_range(10..=40);

    Metrics {
        psnr,
        ssim,
        coverage: rng.gen_range(0.85..0.95),
        latency,
        memory,
        training_time: latency * 12.0,
        convergence_epoch: epochs,
    }
}

#[async_trait]
impl ExperimentRunner for SimulatedRunner {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn run(&self, config: &ExperimentConfig) -> Result<RunOutput, RunnerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(RunOutput {
            metrics: simulated_metrics(config),
            artifacts: Artifacts::default(),
        })
    }
}

/// Runs an external program: configuration JSON on stdin, a JSON object with
/// `metrics` (and optional `artifacts`) on stdout. The child is killed when
/// the run is dropped, which is how timeouts stop it.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    metrics: Metrics,
    #[serde(default)]
    artifacts: Artifacts,
}

impl CommandRunner {
    pub fn new(command: &[String]) -> Result<Self, RunnerError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| RunnerError::Spawn("empty command".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl ExperimentRunner for CommandRunner {
    fn name(&self) -> &str {
        &self.program
    }

    async fn run(&self, config: &ExperimentConfig) -> Result<RunOutput, RunnerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(&config.to_api_format())
                .map_err(|e| RunnerError::InvalidOutput(e.to_string()))?;
            // A runner that ignores its input may exit before reading it
            if let Err(e) = stdin.write_all(&body).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RunnerError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let value = extract_json(&stdout)
            .ok_or_else(|| RunnerError::InvalidOutput("no JSON object on stdout".to_string()))?;
        let reply: CommandReply =
            serde_json::from_value(value).map_err(|e| RunnerError::InvalidOutput(e.to_string()))?;
        Ok(RunOutput {
            metrics: reply.metrics,
            artifacts: reply.artifacts,
        })
    }
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_parallel: usize,
    pub experiment_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            experiment_timeout: Duration::from_secs(3600),
        }
    }
}

pub struct Executor {
    bus: EventBus,
    runner: Arc<dyn ExperimentRunner>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    store: Option<WorldModel>,
}

impl Executor {
    pub fn new(bus: EventBus, runner: Arc<dyn ExperimentRunner>, settings: ExecutorSettings) -> Self {
        Self {
            bus,
            runner,
            permits: Arc::new(Semaphore::new(settings.max_parallel.max(1))),
            timeout: settings.experiment_timeout,
            store: None,
        }
    }

    /// Fallback store for results that cannot be published.
    pub fn with_store(mut self, world_model: WorldModel) -> Self {
        self.store = Some(world_model);
        self
    }

    /// Run a batch, publishing each result as soon as it is known. Returns
    /// once every configuration has reported.
    pub async fn run_batch(&self, configs: Vec<ExperimentConfig>, cycle: u32) {
        let batch = configs.len();
        let mut tasks = JoinSet::new();

        for config in configs {
            let runner = self.runner.clone();
            let permits = self.permits.clone();
            let bus = self.bus.clone();
            let store = self.store.clone();
            let timeout = self.timeout;

            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => run_one(runner, config, cycle, timeout).await,
                    Err(e) => ExperimentResult::failed(
                        config,
                        cycle,
                        ExperimentStatus::Failed,
                        format!("executor closed: {e}"),
                        Utc::now(),
                    ),
                };
                let event = Event::new(
                    ExperimentCompleted {
                        result: result.clone(),
                    },
                    EXECUTOR_SENDER,
                );
                if let Err(e) = bus.publish(event) {
                    tracing::error!(
                        cycle,
                        experiment_id = %result.experiment_id,
                        status = result.status.as_str(),
                        error = %e,
                        "Failed to publish result"
                    );
                    if let Some(store) = store {
                        record_undelivered(&store, result, &e.to_string()).await;
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(cycle, error = %e, "Experiment task aborted");
            }
        }
        tracing::info!(cycle, batch, runner = self.runner.name(), "Batch finished");
    }
}

/// Persist a result the bus refused, as a failure so it never counts as a success.
async fn record_undelivered(store: &WorldModel, result: ExperimentResult, error: &str) {
    let experiment_id = result.experiment_id.clone();
    let failed = ExperimentResult::failed(
        result.config,
        result.cycle,
        ExperimentStatus::Failed,
        format!("result not delivered: {error}"),
        result.started_at,
    );
    match store.blocking(move |wm| wm.save_experiment(&failed)).await {
        Ok(_) => tracing::warn!(experiment_id = %experiment_id, "Undelivered result recorded as failed"),
        Err(e) => tracing::error!(
            experiment_id = %experiment_id,
            error = %e,
            "Failed to record undelivered result"
        ),
    }
}

async fn run_one(
    runner: Arc<dyn ExperimentRunner>,
    config: ExperimentConfig,
    cycle: u32,
    timeout: Duration,
) -> ExperimentResult {
    let started_at = Utc::now();
    tracing::info!(
        cycle,
        experiment_id = %config.experiment_id,
        config = %config.short_label(),
        "Experiment started"
    );

    let outcome = AssertUnwindSafe(tokio::time::timeout(timeout, runner.run(&config)))
        .catch_unwind()
        .await;

    let result = match outcome {
        Ok(Ok(Ok(output))) => {
            ExperimentResult::completed(config, cycle, output.metrics, output.artifacts, started_at)
        }
        Ok(Ok(Err(e))) => {
            ExperimentResult::failed(config, cycle, ExperimentStatus::Failed, e.to_string(), started_at)
        }
        Ok(Err(_elapsed)) => ExperimentResult::failed(
            config,
            cycle,
            ExperimentStatus::TimedOut,
            format!("experiment exceeded {}s", timeout.as_secs_f64()),
            started_at,
        ),
        Err(panic) => ExperimentResult::failed(
            config,
            cycle,
            ExperimentStatus::Failed,
            format!("runner panicked: {}", panic_message(&*panic)),
            started_at,
        ),
    };

    match &result.metrics {
        Some(m) => tracing::info!(
            cycle,
            experiment_id = %result.experiment_id,
            psnr = m.psnr,
            ssim = m.ssim,
            latency = m.latency,
            "Experiment completed"
        ),
        None => tracing::warn!(
            cycle,
            experiment_id = %result.experiment_id,
            status = result.status.as_str(),
            error = result.error_message.as_deref().unwrap_or(""),
            "Experiment failed"
        ),
    }
    result
}

#[async_trait]
impl EventHandler for Executor {
    fn name(&self) -> &str {
        EXECUTOR_SENDER
    }

    async fn handle(&self, event: Event) -> HandlerResult {
        if let EventPayload::PlanApproved(plan) = event.payload {
            self.run_batch(plan.configs, plan.cycle).await;
        }
        Ok(())
    }
}
