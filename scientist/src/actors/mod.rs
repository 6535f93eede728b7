pub mod analysis;
pub mod director;
pub mod event_bus;
pub mod executor;
pub mod planner;
pub mod reviewer;

pub use analysis::{AnalysisAgent, AnalysisSettings};
pub use director::{DirectorActor, DirectorArguments, DirectorMsg, DirectorPolicy, RunOutcome};
pub use event_bus::{ActorForwarder, EventBus, EventBusConfig, EventHandler, SubscriptionId};
pub use executor::{
    CommandRunner, Executor, ExecutorSettings, ExperimentRunner, SimulatedRunner,
};
pub use planner::{baseline_configs, PlanRoute, Planner, PlannerSettings};
pub use reviewer::{ReviewVerdict, Reviewer};
