//! DirectorActor - owns the cycle/budget state machine
//!
//! The Director subscribes to plan, result and insight events through an
//! [`ActorForwarder`], so every event is handled one at a time in its mailbox.
//! Results are persisted here, before the batch check, so the experiment
//! count the budget is checked against always includes the result at hand.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{
    DesignSpace, Event, EventPayload, ExperimentResult, ExperimentStatus, Topic,
};

use crate::actors::director::{
    protocol::{DeadlineStage, DirectorError, DirectorMsg, RunOutcome},
    state::{Completion, CycleState, DirectorAction, DirectorPolicy},
};
use crate::actors::event_bus::{ActorForwarder, EventBus, SubscriptionId};
use crate::world_model::WorldModel;

pub const DIRECTOR_SENDER: &str = "Director";

const SUBSCRIBED_TOPICS: [Topic; 4] = [
    Topic::PlanApproved,
    Topic::PlanRejected,
    Topic::ExperimentCompleted,
    Topic::InsightGenerated,
];

#[derive(Debug, Default)]
pub struct DirectorActor;

/// Arguments for spawning DirectorActor
#[derive(Clone)]
pub struct DirectorArguments {
    pub bus: EventBus,
    pub world_model: WorldModel,
    pub policy: DirectorPolicy,
    pub design_space: DesignSpace,
    /// Watchdog for planning + execution of one cycle
    pub cycle_timeout: Duration,
    /// Watchdog for the analysis of one cycle
    pub analysis_timeout: Duration,
}

pub struct DirectorState {
    cycle: CycleState,
    bus: EventBus,
    world_model: WorldModel,
    cycle_timeout: Duration,
    analysis_timeout: Duration,
    run_reply: Option<RpcReplyPort<Result<RunOutcome, DirectorError>>>,
    subscriptions: Vec<SubscriptionId>,
}

#[async_trait]
impl Actor for DirectorActor {
    type Msg = DirectorMsg;
    type State = DirectorState;
    type Arguments = DirectorArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            budget_max = args.policy.budget_max,
            max_cycles = args.policy.max_cycles,
            max_plan_retries = args.policy.max_plan_retries,
            per_cycle_cap = args.policy.per_cycle_cap,
            "DirectorActor starting"
        );

        Ok(DirectorState {
            cycle: CycleState::new(args.policy, args.design_space),
            bus: args.bus,
            world_model: args.world_model,
            cycle_timeout: args.cycle_timeout,
            analysis_timeout: args.analysis_timeout,
            run_reply: None,
            subscriptions: Vec::new(),
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for topic in SUBSCRIBED_TOPICS {
            let forwarder = ActorForwarder::new(DIRECTOR_SENDER, myself.clone(), DirectorMsg::Event);
            let id = state.bus.subscribe(topic, Arc::new(forwarder)).await?;
            state.subscriptions.push(id);
        }
        tracing::info!(actor_id = %myself.get_id(), "DirectorActor started successfully");
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DirectorMsg::Run { initial, reply } => {
                if state.run_reply.is_some() {
                    let _ = reply.send(Err(DirectorError::AlreadyRunning));
                    return Ok(());
                }
                match state.cycle.start(initial) {
                    Ok(actions) => {
                        state.run_reply = Some(reply);
                        if let Err(e) = self.execute(&myself, state, actions).await {
                            self.fail(state, e);
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            DirectorMsg::Event(event) => {
                if state.cycle.is_stopped() {
                    tracing::debug!(
                        topic = %event.topic(),
                        event_id = %event.id,
                        "Director stopped; ignoring event"
                    );
                    return Ok(());
                }
                if let Err(e) = self.handle_event(&myself, state, event).await {
                    self.fail(state, e);
                }
            }
            DirectorMsg::Deadline { cycle, stage } => {
                let result = async {
                    let total = count(&state.world_model).await?;
                    let actions = state.cycle.on_deadline(cycle, stage, total);
                    self.execute(&myself, state, actions).await
                }
                .await;
                if let Err(e) = result {
                    self.fail(state, e);
                }
            }
            DirectorMsg::GetStatus { reply } => {
                let _ = reply.send(state.cycle.status());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for id in state.subscriptions.drain(..) {
            if let Err(e) = state.bus.unsubscribe(id).await {
                tracing::debug!(error = %e, "Director unsubscribe skipped");
            }
        }
        if let Some(reply) = state.run_reply.take() {
            let _ = reply.send(Err(DirectorError::Actor("director stopped".to_string())));
        }
        tracing::info!(actor_id = %myself.get_id(), "DirectorActor stopped");
        Ok(())
    }
}

impl DirectorActor {
    async fn handle_event(
        &self,
        myself: &ActorRef<DirectorMsg>,
        state: &mut DirectorState,
        event: Event,
    ) -> Result<(), DirectorError> {
        let actions = match event.payload {
            EventPayload::PlanApproved(plan) => {
                let total = count(&state.world_model).await?;
                state.cycle.on_plan_approved(&plan, total)
            }
            EventPayload::PlanRejected(rejected) => {
                let total = count(&state.world_model).await?;
                state.cycle.on_plan_rejected(&rejected, total)
            }
            EventPayload::ExperimentCompleted(completed) => {
                let result = completed.result;
                let disposition = state.cycle.classify_completion(&result);
                if disposition == Completion::Drop {
                    tracing::debug!(
                        experiment_id = %result.experiment_id,
                        cycle = result.cycle,
                        "Discarding experiment result"
                    );
                    return Ok(());
                }
                let record = result.clone();
                state
                    .world_model
                    .blocking(move |wm| wm.save_experiment(&record))
                    .await?;
                let total = count(&state.world_model).await?;
                state
                    .cycle
                    .on_experiment_persisted(&result, disposition, total)
            }
            EventPayload::InsightGenerated(insight) => {
                let total = count(&state.world_model).await?;
                state.cycle.on_insight(&insight, total)
            }
            EventPayload::PlanRequested(_) | EventPayload::StateUpdated(_) => Vec::new(),
        };
        self.execute(myself, state, actions).await
    }

    async fn execute(
        &self,
        myself: &ActorRef<DirectorMsg>,
        state: &mut DirectorState,
        actions: Vec<DirectorAction>,
    ) -> Result<(), DirectorError> {
        for action in actions {
            match action {
                DirectorAction::Publish(payload) => {
                    state.bus.publish(Event::new(payload, DIRECTOR_SENDER))?;
                }
                DirectorAction::OpenPlan { cycle } => {
                    state
                        .world_model
                        .blocking(move |wm| wm.plan_for_cycle(cycle))
                        .await?;
                }
                DirectorAction::RecordTimeouts { cycle, configs } => {
                    state
                        .world_model
                        .blocking(move |wm| {
                            let now = chrono::Utc::now();
                            for config in configs {
                                let result = ExperimentResult::failed(
                                    config,
                                    cycle,
                                    ExperimentStatus::TimedOut,
                                    "experiment did not report before the cycle deadline",
                                    now,
                                );
                                wm.save_experiment(&result)?;
                            }
                            Ok(())
                        })
                        .await?;
                }
                DirectorAction::ArmDeadline { cycle, stage } => {
                    let delay = match stage {
                        DeadlineStage::Cycle => state.cycle_timeout,
                        DeadlineStage::Analysis => state.analysis_timeout,
                    };
                    let _ = myself.send_after(delay, move || DirectorMsg::Deadline { cycle, stage });
                }
                DirectorAction::Stop => {
                    let total = count(&state.world_model).await?;
                    let outcome = state.cycle.outcome(total);
                    tracing::info!(
                        cycles_completed = outcome.cycles_completed,
                        experiments_used = outcome.experiments_used,
                        pareto = outcome.pareto_ids.len(),
                        "Director run finished"
                    );
                    if let Some(reply) = state.run_reply.take() {
                        let _ = reply.send(Ok(outcome));
                    }
                }
            }
        }
        Ok(())
    }

    /// Store or bus failures end the run: reply with the error and latch stop.
    fn fail(&self, state: &mut DirectorState, error: DirectorError) {
        tracing::error!(
            cycle = state.cycle.current_cycle(),
            error = %error,
            "Director run failed"
        );
        state.cycle.abort();
        if let Some(reply) = state.run_reply.take() {
            let _ = reply.send(Err(error));
        }
    }
}

async fn count(world_model: &WorldModel) -> Result<usize, DirectorError> {
    Ok(world_model.blocking(|wm| wm.count_experiments()).await?)
}

// ============================================================================
// Handle helpers
// ============================================================================

/// Start the loop and wait until it terminates.
pub async fn run_director(
    director: &ActorRef<DirectorMsg>,
    initial: Vec<shared_types::ExperimentConfig>,
) -> Result<RunOutcome, DirectorError> {
    ractor::call!(director, |reply| DirectorMsg::Run { initial, reply })
        .map_err(|e| DirectorError::Actor(e.to_string()))?
}

pub async fn director_status(
    director: &ActorRef<DirectorMsg>,
) -> Result<super::protocol::DirectorStatus, DirectorError> {
    ractor::call!(director, |reply| DirectorMsg::GetStatus { reply })
        .map_err(|e| DirectorError::Actor(e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::event_bus::{EventBusConfig, EventHandler, HandlerResult};
    use crate::actors::director::state::Phase;
    use crate::test_support::{config_with, metrics, result_ok};
    use crate::world_model::NarrativeThresholds;
    use shared_types::{ExperimentCompleted, InsightGenerated, Insights};

    /// Completes every approved config immediately.
    struct InstantExecutor {
        bus: EventBus,
    }

    #[async_trait]
    impl EventHandler for InstantExecutor {
        fn name(&self) -> &str {
            "instant-executor"
        }

        async fn handle(&self, event: Event) -> HandlerResult {
            if let EventPayload::PlanApproved(plan) = event.payload {
                for config in plan.configs {
                    let result = result_ok(config, plan.cycle, metrics(30.0, 0.9, 40.0));
                    self.bus
                        .publish(Event::new(ExperimentCompleted { result }, "Executor"))?;
                }
            }
            Ok(())
        }
    }

    /// Answers every analysis trigger with an empty insight.
    struct EchoAnalysis {
        bus: EventBus,
    }

    #[async_trait]
    impl EventHandler for EchoAnalysis {
        fn name(&self) -> &str {
            "echo-analysis"
        }

        async fn handle(&self, event: Event) -> HandlerResult {
            if let EventPayload::StateUpdated(update) = event.payload {
                self.bus.publish(Event::new(
                    InsightGenerated {
                        insights: Insights::insufficient_data(update.cycle, 0),
                        pareto_ids: vec!["p1".to_string()],
                        cycle: update.cycle,
                    },
                    "Analysis",
                ))?;
            }
            Ok(())
        }
    }

    async fn spawn_director(
        budget_max: usize,
        timeouts: Duration,
    ) -> (EventBus, WorldModel, ActorRef<DirectorMsg>) {
        let bus = EventBus::spawn(EventBusConfig::default()).await.unwrap();
        let world_model = WorldModel::open(":memory:", NarrativeThresholds::default()).unwrap();
        let (director, _handle) = Actor::spawn(
            None,
            DirectorActor,
            DirectorArguments {
                bus: bus.clone(),
                world_model: world_model.clone(),
                policy: DirectorPolicy {
                    budget_max,
                    ..DirectorPolicy::default()
                },
                design_space: DesignSpace::default(),
                cycle_timeout: timeouts,
                analysis_timeout: timeouts,
            },
        )
        .await
        .unwrap();
        (bus, world_model, director)
    }

    #[tokio::test]
    async fn test_run_stops_when_budget_is_spent() {
        // Given: an executor and analysis that answer instantly
        let (bus, world_model, director) = spawn_director(2, Duration::from_secs(30)).await;
        bus.subscribe(Topic::PlanApproved, Arc::new(InstantExecutor { bus: bus.clone() }))
            .await
            .unwrap();
        bus.subscribe(Topic::StateUpdated, Arc::new(EchoAnalysis { bus: bus.clone() }))
            .await
            .unwrap();

        // When: the run starts with a batch that exactly fills the budget
        let initial = vec![config_with("a", 8, 5), config_with("b", 16, 7)];
        let outcome = run_director(&director, initial).await.unwrap();

        // Then: one cycle closes and the loop stops
        assert_eq!(outcome.cycles_completed, 1);
        assert_eq!(outcome.experiments_used, 2);
        assert_eq!(outcome.pareto_ids, vec!["p1".to_string()]);
        assert_eq!(world_model.count_experiments().unwrap(), 2);

        let status = director_status(&director).await.unwrap();
        assert!(status.stopped);
        assert_eq!(status.phase, Phase::Terminated);

        let triggers = bus.history(Some(Topic::StateUpdated)).await.unwrap();
        assert_eq!(triggers.len(), 1);

        director.stop(None);
        bus.stop();
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let (bus, _world_model, director) = spawn_director(5, Duration::from_secs(30)).await;

        let first = director.clone();
        tokio::spawn(async move {
            let _ = run_director(&first, vec![config_with("a", 8, 5)]).await;
        });
        let mut started = false;
        for _ in 0..50 {
            if director_status(&director).await.unwrap().phase != Phase::Idle {
                started = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(started);

        let second = run_director(&director, Vec::new()).await;
        assert!(matches!(second, Err(DirectorError::AlreadyRunning)));

        director.stop(None);
        bus.stop();
    }

    #[tokio::test]
    async fn test_watchdogs_close_a_stalled_cycle() {
        // Given: nobody executes or analyzes anything
        let (bus, world_model, director) = spawn_director(2, Duration::from_millis(50)).await;

        // When: the run starts
        let outcome = run_director(&director, vec![config_with("a", 8, 5), config_with("b", 8, 7)])
            .await
            .unwrap();

        // Then: both experiments are recorded as timed out and the loop ends
        assert_eq!(outcome.experiments_used, 2);
        let results = world_model.get_all_experiments().unwrap();
        assert!(results
            .iter()
            .all(|r| r.status == ExperimentStatus::TimedOut));
        assert_eq!(
            outcome.insights.status,
            shared_types::InsightStatus::TimedOut
        );

        director.stop(None);
        bus.stop();
    }
}
