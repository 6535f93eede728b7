//! Scientist - builds and owns one experimentation run
//!
//! Spawns the bus and the Director, opens the world model, picks the LLM
//! backend and runner, and subscribes each agent to the topic it serves:
//!
//! | Topic            | Subscriber |
//! |------------------|------------|
//! | `PLAN_REQUESTED` | Planner (routes through the Reviewer when enabled) |
//! | `PLAN_APPROVED`  | Executor, Director |
//! | `PLAN_REJECTED`, `EXPERIMENT_COMPLETED`, `INSIGHT_GENERATED` | Director |
//! | `STATE_UPDATED`  | Analysis |

use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorRef};
use shared_types::{ExperimentConfig, Topic};
use tokio::task::JoinHandle;

use crate::actors::director::{
    director_status, run_director, DirectorActor, DirectorArguments, DirectorError, DirectorMsg,
    DirectorStatus, RunOutcome,
};
use crate::actors::event_bus::{BusError, EventBus};
use crate::actors::executor::{CommandRunner, ExperimentRunner, RunnerError, SimulatedRunner};
use crate::actors::{baseline_configs, AnalysisAgent, Executor, PlanRoute, Planner, Reviewer};
use crate::config::{RunnerKind, ScientistConfig};
use crate::llm::{OfflineBackend, OpenAiClient, SharedBackend};
use crate::world_model::{WorldModel, WorldModelError};

#[derive(Debug, thiserror::Error)]
pub enum ScientistError {
    #[error(transparent)]
    WorldModel(#[from] WorldModelError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Director(#[from] DirectorError),
    #[error("failed to spawn director: {0}")]
    Spawn(String),
}

/// Picks the backend for `config`: OpenAI when live mode has a key, offline
/// otherwise.
pub fn select_backend(config: &ScientistConfig) -> SharedBackend {
    let Some(settings) = config.openai_settings() else {
        tracing::info!(
            mock_mode = config.experiment.mock_mode,
            "Using offline LLM backend"
        );
        return Arc::new(OfflineBackend);
    };
    match OpenAiClient::new(settings) {
        Ok(client) => {
            tracing::info!(model = %client.model(), "Using OpenAI-compatible LLM backend");
            Arc::new(client)
        }
        Err(e) => {
            tracing::warn!(error = %e, "LLM client unavailable; using offline backend");
            Arc::new(OfflineBackend)
        }
    }
}

/// Picks the runner for `config`. Mock mode always simulates.
pub fn select_runner(config: &ScientistConfig) -> Result<Arc<dyn ExperimentRunner>, RunnerError> {
    let simulated = || -> Arc<dyn ExperimentRunner> {
        Arc::new(SimulatedRunner::new(Duration::from_millis(
            config.executor.simulated_delay_ms,
        )))
    };
    if config.experiment.mock_mode {
        return Ok(simulated());
    }
    match config.executor.runner {
        RunnerKind::Simulated => Ok(simulated()),
        RunnerKind::Command => Ok(Arc::new(CommandRunner::new(&config.executor.command)?)),
    }
}

pub struct Scientist {
    config: ScientistConfig,
    bus: EventBus,
    world_model: WorldModel,
    director: ActorRef<DirectorMsg>,
    director_handle: JoinHandle<()>,
}

impl Scientist {
    /// Wire a run from configuration alone.
    pub async fn start(config: ScientistConfig) -> Result<Self, ScientistError> {
        let llm = select_backend(&config);
        let runner = select_runner(&config)?;
        Self::start_with(config, llm, runner).await
    }

    /// Wire a run with an explicit backend and runner.
    pub async fn start_with(
        config: ScientistConfig,
        llm: SharedBackend,
        runner: Arc<dyn ExperimentRunner>,
    ) -> Result<Self, ScientistError> {
        let bus = EventBus::spawn(config.bus_config()).await?;
        let world_model = WorldModel::open(&config.database.path, config.memory.clone())?;
        tracing::info!(
            db = %config.database.path,
            design_id = world_model.design_id(),
            llm = %llm.name(),
            runner = %runner.name(),
            "Scientist wiring"
        );

        let route = if config.reviewer.enabled {
            PlanRoute::Review(Arc::new(Reviewer::new(
                world_model.clone(),
                llm.clone(),
                config.reviewer.use_llm,
            )))
        } else {
            PlanRoute::Direct
        };
        let planner = Planner::new(
            bus.clone(),
            world_model.clone(),
            llm.clone(),
            route,
            config.planner_settings(),
        );
        let executor = Executor::new(bus.clone(), runner, config.executor_settings())
            .with_store(world_model.clone());
        let analysis = AnalysisAgent::new(
            bus.clone(),
            world_model.clone(),
            llm,
            config.analysis_settings(),
        );

        bus.subscribe(Topic::PlanRequested, Arc::new(planner)).await?;
        bus.subscribe(Topic::PlanApproved, Arc::new(executor)).await?;
        bus.subscribe(Topic::StateUpdated, Arc::new(analysis)).await?;

        let (director, director_handle) = Actor::spawn(
            None,
            DirectorActor,
            DirectorArguments {
                bus: bus.clone(),
                world_model: world_model.clone(),
                policy: config.director_policy(),
                design_space: config.design_space.clone(),
                cycle_timeout: config.cycle_timeout(),
                analysis_timeout: config.analysis_timeout(),
            },
        )
        .await
        .map_err(|e| ScientistError::Spawn(e.to_string()))?;

        Ok(Self {
            config,
            bus,
            world_model,
            director,
            director_handle,
        })
    }

    pub fn config(&self) -> &ScientistConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn world_model(&self) -> &WorldModel {
        &self.world_model
    }

    pub async fn status(&self) -> Result<DirectorStatus, ScientistError> {
        Ok(director_status(&self.director).await?)
    }

    /// Run to termination. Without an initial batch, one baseline
    /// configuration per compression ratio is used.
    pub async fn run(
        &self,
        initial: Option<Vec<ExperimentConfig>>,
    ) -> Result<RunOutcome, ScientistError> {
        let initial = initial.unwrap_or_else(|| baseline_configs(&self.config.design_space));
        tracing::info!(
            initial = initial.len(),
            budget_max = self.config.experiment.budget_max,
            max_cycles = self.config.experiment.max_cycles,
            "Starting experimentation loop"
        );
        let outcome = run_director(&self.director, initial).await?;
        tracing::info!(
            cycles = outcome.cycles_completed,
            experiments = outcome.experiments_used,
            pareto = outcome.pareto_ids.len(),
            "Experimentation loop finished"
        );
        Ok(outcome)
    }

    pub async fn shutdown(self) {
        self.director.stop(None);
        if let Err(e) = self.director_handle.await {
            tracing::warn!(error = %e, "Director task ended abnormally");
        }
        self.bus.stop();
    }
}
