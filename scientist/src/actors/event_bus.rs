//! EventBusActor - topic-based pub/sub for the scientist loop
//!
//! The bus owns the subscription registry and the append-only history. It is
//! the only place events fan out to handlers.
//!
//! # Delivery
//!
//! - `Publish` appends to history, then dispatches one task per handler
//!   registered for the topic, in registration order.
//! - Handler tasks run independently: completion order is unspecified.
//! - A handler error or panic is logged and contained within its own task.
//! - In-flight handler invocations are capped by a semaphore (`max_in_flight`).
//!   Each dispatched task waits for its own permit, so the actor keeps serving
//!   publishes, subscriptions and history reads while handlers are saturated.
//!   Publishers only enqueue, so they never wait on handlers.
//!
//! # Example
//!
//! ```rust,ignore
//! let bus = EventBus::spawn(EventBusConfig::default()).await?;
//! bus.subscribe(Topic::PlanApproved, Arc::new(executor)).await?;
//! bus.publish(Event::new(PlanApproved { configs, cycle: 0 }, "Director"))?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use ractor::{cast, Actor, ActorProcessingErr, ActorRef, Message, RpcReplyPort};
use tokio::sync::Semaphore;

use shared_types::{Event, EventDecodeError, Topic};

// ============================================================================
// Handler contract
// ============================================================================

pub type HandlerResult = Result<(), ActorProcessingErr>;

/// A bus subscriber. One invocation per delivered event.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn handle(&self, event: Event) -> HandlerResult;
}

/// Forwards events into an actor mailbox, so the actor processes its
/// subscriptions one message at a time.
pub struct ActorForwarder<M: Message> {
    name: String,
    target: ActorRef<M>,
    wrap: fn(Event) -> M,
}

impl<M: Message> ActorForwarder<M> {
    pub fn new(name: impl Into<String>, target: ActorRef<M>, wrap: fn(Event) -> M) -> Self {
        Self {
            name: name.into(),
            target,
            wrap,
        }
    }
}

#[async_trait]
impl<M: Message> EventHandler for ActorForwarder<M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Event) -> HandlerResult {
        self.target
            .cast((self.wrap)(event))
            .map_err(|e| -> ActorProcessingErr { format!("forward failed: {e}").into() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
    #[error("rejected event: {0}")]
    Rejected(#[from] EventDecodeError),
}

// ============================================================================
// EventBusActor
// ============================================================================

/// Messages handled by EventBusActor
pub enum EventBusMsg {
    Publish {
        event: Event,
    },
    Subscribe {
        topic: Topic,
        handler: Arc<dyn EventHandler>,
        reply: RpcReplyPort<SubscriptionId>,
    },
    /// Reply is `true` when a registration was removed
    Unsubscribe {
        id: SubscriptionId,
        reply: RpcReplyPort<bool>,
    },
    SubscriberCount {
        topic: Topic,
        reply: RpcReplyPort<usize>,
    },
    History {
        topic: Option<Topic>,
        reply: RpcReplyPort<Vec<Event>>,
    },
}

impl std::fmt::Debug for EventBusMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Publish { event } => write!(f, "Publish({} {})", event.topic(), event.id),
            Self::Subscribe { topic, handler, .. } => {
                write!(f, "Subscribe({topic}, {})", handler.name())
            }
            Self::Unsubscribe { id, .. } => write!(f, "Unsubscribe({})", id.0),
            Self::SubscriberCount { topic, .. } => write!(f, "SubscriberCount({topic})"),
            Self::History { topic, .. } => write!(f, "History({topic:?})"),
        }
    }
}

/// Configuration for EventBusActor
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Global cap on concurrently running handler invocations
    pub max_in_flight: usize,

    /// Oldest events are dropped beyond this many; `None` keeps everything
    pub history_limit: Option<usize>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            history_limit: None,
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

/// State for EventBusActor
pub struct EventBusState {
    registry: HashMap<Topic, Vec<Subscription>>,
    history: VecDeque<Event>,
    permits: Arc<Semaphore>,
    next_id: u64,
    config: EventBusConfig,
}

#[derive(Debug, Default)]
pub struct EventBusActor;

#[async_trait]
impl Actor for EventBusActor {
    type Msg = EventBusMsg;
    type State = EventBusState;
    type Arguments = EventBusConfig;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        config: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            max_in_flight = config.max_in_flight,
            history_limit = ?config.history_limit,
            "EventBusActor starting"
        );

        Ok(EventBusState {
            registry: HashMap::new(),
            history: VecDeque::new(),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            next_id: 1,
            config,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventBusMsg::Publish { event } => self.handle_publish(event, state).await,
            EventBusMsg::Subscribe {
                topic,
                handler,
                reply,
            } => {
                let id = SubscriptionId(state.next_id);
                state.next_id += 1;
                tracing::info!(
                    topic = %topic,
                    handler = handler.name(),
                    subscription = id.0,
                    "Handler subscribed"
                );
                state
                    .registry
                    .entry(topic)
                    .or_default()
                    .push(Subscription { id, handler });
                let _ = reply.send(id);
                Ok(())
            }
            EventBusMsg::Unsubscribe { id, reply } => {
                let mut removed = false;
                for subs in state.registry.values_mut() {
                    let before = subs.len();
                    subs.retain(|s| s.id != id);
                    removed |= subs.len() != before;
                }
                tracing::info!(subscription = id.0, removed, "Handler unsubscribed");
                let _ = reply.send(removed);
                Ok(())
            }
            EventBusMsg::SubscriberCount { topic, reply } => {
                let count = state.registry.get(&topic).map(Vec::len).unwrap_or(0);
                let _ = reply.send(count);
                Ok(())
            }
            EventBusMsg::History { topic, reply } => {
                let events = state
                    .history
                    .iter()
                    .filter(|e| topic.map_or(true, |t| e.topic() == t))
                    .cloned()
                    .collect();
                let _ = reply.send(events);
                Ok(())
            }
        }
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            events = state.history.len(),
            "EventBusActor stopped"
        );
        Ok(())
    }
}

impl EventBusActor {
    async fn handle_publish(
        &self,
        event: Event,
        state: &mut EventBusState,
    ) -> Result<(), ActorProcessingErr> {
        let topic = event.topic();
        tracing::debug!(
            event_id = %event.id,
            topic = %topic,
            sender = %event.sender,
            "Publishing event"
        );

        state.history.push_back(event.clone());
        if let Some(limit) = state.config.history_limit {
            while state.history.len() > limit {
                state.history.pop_front();
            }
        }

        let Some(subs) = state.registry.get(&topic) else {
            tracing::debug!(topic = %topic, "No subscribers; event recorded only");
            return Ok(());
        };

        for sub in subs {
            let permits = state.permits.clone();
            let handler = sub.handler.clone();
            let event = event.clone();

            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    tracing::warn!(handler = handler.name(), topic = %topic, "Dispatch semaphore closed");
                    return;
                };
                let event_id = event.id.clone();
                let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(
                        handler = handler.name(),
                        topic = %topic,
                        event_id = %event_id,
                        error = %e,
                        "Event handler failed"
                    ),
                    Err(panic) => tracing::error!(
                        handler = handler.name(),
                        topic = %topic,
                        event_id = %event_id,
                        panic = %panic_message(&*panic),
                        "Event handler panicked"
                    ),
                }
            });
        }

        Ok(())
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable front-end for a running EventBusActor.
#[derive(Clone)]
pub struct EventBus {
    actor: ActorRef<EventBusMsg>,
}

impl EventBus {
    pub async fn spawn(config: EventBusConfig) -> Result<Self, BusError> {
        let (actor, _handle) = Actor::spawn(None, EventBusActor, config)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        Ok(Self { actor })
    }

    pub fn actor(&self) -> &ActorRef<EventBusMsg> {
        &self.actor
    }

    pub async fn subscribe(
        &self,
        topic: Topic,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, BusError> {
        ractor::call!(self.actor, |reply| EventBusMsg::Subscribe {
            topic,
            handler,
            reply
        })
        .map_err(|e| BusError::Unavailable(e.to_string()))
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, BusError> {
        ractor::call!(self.actor, |reply| EventBusMsg::Unsubscribe { id, reply })
            .map_err(|e| BusError::Unavailable(e.to_string()))
    }

    /// Fire-and-forget: returns once the event is queued for dispatch.
    pub fn publish(&self, event: Event) -> Result<(), BusError> {
        cast!(self.actor, EventBusMsg::Publish { event })
            .map_err(|e| BusError::Unavailable(e.to_string()))
    }

    /// Publish an untyped topic/payload pair. Unknown topics and payloads that
    /// do not match the topic schema are rejected before reaching history.
    pub fn publish_wire(
        &self,
        topic: &str,
        payload: serde_json::Value,
        sender: &str,
    ) -> Result<String, BusError> {
        let event = Event::from_wire(topic, payload, sender).map_err(|e| {
            tracing::warn!(topic = %topic, sender = %sender, error = %e, "Rejected wire event");
            e
        })?;
        let id = event.id.clone();
        self.publish(event)?;
        Ok(id)
    }

    pub async fn history(&self, topic: Option<Topic>) -> Result<Vec<Event>, BusError> {
        ractor::call!(self.actor, |reply| EventBusMsg::History { topic, reply })
            .map_err(|e| BusError::Unavailable(e.to_string()))
    }

    pub async fn subscriber_count(&self, topic: Topic) -> Result<usize, BusError> {
        ractor::call!(self.actor, |reply| EventBusMsg::SubscriberCount {
            topic,
            reply
        })
        .map_err(|e| BusError::Unavailable(e.to_string()))
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use shared_types::StateUpdated;

    use crate::test_support::wait_until;

    fn state_event(cycle: u32) -> Event {
        Event::new(
            StateUpdated {
                trigger_analysis: true,
                cycle,
                reason: None,
            },
            "test",
        )
    }

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(&self, _event: Event) -> HandlerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle(&self, _event: Event) -> HandlerResult {
            Err("deliberate failure".into())
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn handle(&self, _event: Event) -> HandlerResult {
            panic!("deliberate panic");
        }
    }

    /// Records the peak number of concurrently running invocations.
    #[derive(Default)]
    struct Slow {
        running: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn handle(&self, _event: Event) -> HandlerResult {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Holds each invocation until the test releases it.
    struct Gated {
        release: Semaphore,
        entered: AtomicUsize,
        done: AtomicUsize,
    }

    impl Gated {
        fn new() -> Self {
            Self {
                release: Semaphore::new(0),
                entered: AtomicUsize::new(0),
                done: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EventHandler for Gated {
        fn name(&self) -> &str {
            "gated"
        }

        async fn handle(&self, _event: Event) -> HandlerResult {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.release.acquire().await?.forget();
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_invoked_exactly_once() {
        // Given: two counters on the same topic and one on another
        let bus = EventBus::spawn(EventBusConfig::default()).await.unwrap();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let other = Arc::new(Counter::default());
        bus.subscribe(Topic::StateUpdated, a.clone()).await.unwrap();
        bus.subscribe(Topic::StateUpdated, b.clone()).await.unwrap();
        bus.subscribe(Topic::PlanApproved, other.clone()).await.unwrap();

        // When: one event is published
        bus.publish(state_event(1)).unwrap();

        // Then: each matching handler ran once, the other never
        assert!(
            wait_until(Duration::from_secs(2), || {
                a.calls.load(Ordering::SeqCst) == 1 && b.calls.load(Ordering::SeqCst) == 1
            })
            .await
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(other.calls.load(Ordering::SeqCst), 0);
        bus.stop();
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_do_not_affect_siblings() {
        let bus = EventBus::spawn(EventBusConfig::default()).await.unwrap();
        let counter = Arc::new(Counter::default());
        bus.subscribe(Topic::StateUpdated, Arc::new(Failing)).await.unwrap();
        bus.subscribe(Topic::StateUpdated, Arc::new(Panicking)).await.unwrap();
        bus.subscribe(Topic::StateUpdated, counter.clone()).await.unwrap();

        bus.publish(state_event(1)).unwrap();
        bus.publish(state_event(2)).unwrap();

        assert!(
            wait_until(Duration::from_secs(2), || counter.calls.load(Ordering::SeqCst) == 2).await
        );
        // Bus still serves requests after handler panics
        assert_eq!(bus.subscriber_count(Topic::StateUpdated).await.unwrap(), 3);
        bus.stop();
    }

    #[tokio::test]
    async fn test_duplicate_subscription_and_unsubscribe() {
        let bus = EventBus::spawn(EventBusConfig::default()).await.unwrap();
        let counter = Arc::new(Counter::default());
        let first = bus.subscribe(Topic::StateUpdated, counter.clone()).await.unwrap();
        let second = bus.subscribe(Topic::StateUpdated, counter.clone()).await.unwrap();
        assert_ne!(first, second);

        bus.publish(state_event(1)).unwrap();
        assert!(
            wait_until(Duration::from_secs(2), || counter.calls.load(Ordering::SeqCst) == 2).await
        );

        assert!(bus.unsubscribe(first).await.unwrap());
        assert!(!bus.unsubscribe(first).await.unwrap());
        assert_eq!(bus.subscriber_count(Topic::StateUpdated).await.unwrap(), 1);

        bus.publish(state_event(2)).unwrap();
        assert!(
            wait_until(Duration::from_secs(2), || counter.calls.load(Ordering::SeqCst) == 3).await
        );
        bus.stop();
    }

    #[tokio::test]
    async fn test_history_records_events_without_subscribers() {
        let bus = EventBus::spawn(EventBusConfig::default()).await.unwrap();
        bus.publish(state_event(1)).unwrap();
        bus.publish(state_event(2)).unwrap();

        let history = bus.history(None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(bus.history(Some(Topic::PlanApproved)).await.unwrap().is_empty());
        bus.stop();
    }

    #[tokio::test]
    async fn test_history_limit_drops_oldest() {
        let bus = EventBus::spawn(EventBusConfig {
            max_in_flight: 8,
            history_limit: Some(2),
        })
        .await
        .unwrap();
        let first = state_event(1);
        let first_id = first.id.clone();
        bus.publish(first).unwrap();
        bus.publish(state_event(2)).unwrap();
        bus.publish(state_event(3)).unwrap();

        let history = bus.history(None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.id != first_id));
        bus.stop();
    }

    #[tokio::test]
    async fn test_publish_wire_rejects_bad_input() {
        let bus = EventBus::spawn(EventBusConfig::default()).await.unwrap();
        let err = bus
            .publish_wire("NOT_A_TOPIC", serde_json::json!({}), "test")
            .unwrap_err();
        assert!(matches!(err, BusError::Rejected(EventDecodeError::UnknownTopic(_))));

        let err = bus
            .publish_wire("STATE_UPDATED", serde_json::json!({"cycle": 1}), "test")
            .unwrap_err();
        assert!(matches!(err, BusError::Rejected(_)));

        bus.publish_wire(
            "STATE_UPDATED",
            serde_json::json!({"trigger_analysis": true, "cycle": 1}),
            "test",
        )
        .unwrap();
        assert_eq!(bus.history(None).await.unwrap().len(), 1);
        bus.stop();
    }

    #[tokio::test]
    async fn test_in_flight_cap_bounds_concurrency() {
        let bus = EventBus::spawn(EventBusConfig {
            max_in_flight: 2,
            history_limit: None,
        })
        .await
        .unwrap();
        let slow = Arc::new(Slow::default());
        bus.subscribe(Topic::StateUpdated, slow.clone()).await.unwrap();

        for cycle in 0..6 {
            bus.publish(state_event(cycle)).unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || slow.done.load(Ordering::SeqCst) == 6).await);
        assert!(slow.peak.load(Ordering::SeqCst) <= 2);
        bus.stop();
    }

    #[tokio::test]
    async fn test_bus_stays_responsive_when_handlers_saturate_the_cap() {
        // Given: one permit held by a blocked handler and a second event queued behind it
        let bus = EventBus::spawn(EventBusConfig {
            max_in_flight: 1,
            history_limit: None,
        })
        .await
        .unwrap();
        let gated = Arc::new(Gated::new());
        bus.subscribe(Topic::StateUpdated, gated.clone()).await.unwrap();
        bus.publish(state_event(1)).unwrap();
        assert!(wait_until(Duration::from_secs(2), || gated.entered.load(Ordering::SeqCst) == 1).await);
        bus.publish(state_event(2)).unwrap();

        // When: the bus is queried while the cap is exhausted
        let history = tokio::time::timeout(Duration::from_secs(1), bus.history(None))
            .await
            .expect("history should not wait on handler permits")
            .unwrap();
        let counter = Arc::new(Counter::default());
        tokio::time::timeout(
            Duration::from_secs(1),
            bus.subscribe(Topic::PlanApproved, counter.clone()),
        )
        .await
        .expect("subscribe should not wait on handler permits")
        .unwrap();

        // Then: both events are recorded and the queued one runs once released
        assert_eq!(history.len(), 2);
        assert_eq!(gated.entered.load(Ordering::SeqCst), 1);
        gated.release.add_permits(2);
        assert!(wait_until(Duration::from_secs(2), || gated.done.load(Ordering::SeqCst) == 2).await);
        bus.stop();
    }
}
