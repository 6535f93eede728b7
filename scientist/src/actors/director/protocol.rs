//! DirectorActor message protocol
//!
//! Defines the messages the Director accepts and the errors a run can end with.

use ractor::RpcReplyPort;
use serde::Serialize;
use shared_types::{Event, ExperimentConfig, Insights};

use crate::actors::event_bus::BusError;
use crate::world_model::WorldModelError;

/// Which watchdog fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineStage {
    /// Planning + execution of the cycle took too long
    Cycle,
    /// Analysis was requested but no insight arrived
    Analysis,
}

/// Messages handled by DirectorActor
#[derive(Debug)]
pub enum DirectorMsg {
    /// An event delivered by the bus
    Event(Event),
    /// Start the loop with an initial batch. Replies once the loop terminates.
    Run {
        initial: Vec<ExperimentConfig>,
        reply: RpcReplyPort<Result<RunOutcome, DirectorError>>,
    },
    /// Watchdog timer armed at cycle start or analysis request
    Deadline { cycle: u32, stage: DeadlineStage },
    /// Snapshot of the cycle counters (for observability and tests)
    GetStatus { reply: RpcReplyPort<DirectorStatus> },
}

/// Final result of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub pareto_ids: Vec<String>,
    pub insights: Insights,
    /// Analyses accepted, one per closed cycle
    pub cycles_completed: u32,
    /// Experiments persisted in this design session
    pub experiments_used: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectorStatus {
    pub phase: super::state::Phase,
    pub current_cycle: u32,
    pub expected_experiments: usize,
    pub completed_experiments_cycle: usize,
    pub plan_retries: u32,
    pub stopped: bool,
}

/// Errors that can end a Director run
#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error("director run already started")]
    AlreadyRunning,
    #[error("world model failure: {0}")]
    WorldModel(#[from] WorldModelError),
    #[error("bus failure: {0}")]
    Bus(#[from] BusError),
    #[error("director actor failure: {0}")]
    Actor(String),
}
