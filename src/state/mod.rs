//! The state interface: the transport abstraction carrying message
//! envelopes between a scheduler and its components.
//!
//! Two kinds of implementation exist behind the same traits: the in-process
//! [`InternalBus`](internal::InternalBus) used by default and by tests, and
//! broker-backed buses which let components run in separate OS processes.
//! The kernel treats both identically; the choice is made at startup and is
//! global to one simulation level. A nested simulation may use a different
//! state interface than its enclosing scheduler.
//!
//! # Contract
//!
//! - `produce` delivers a message exactly once to every current subscriber
//!   of the topic, preserving publication order per topic.
//! - `subscribe` returns a consumer receiving, in publication order, every
//!   message published to any of its topics after subscription.
//! - `close` releases resources and is idempotent.

pub mod internal;

use std::fmt;
use std::time::Duration;

use crate::error::TransportError;
use crate::messages::StateMessage;
use crate::types::ComponentId;

pub use internal::InternalBus;

/// A named message stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    /// Creates a topic with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the topic name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The topic on which a component receives inputs and stop requests.
pub fn input_topic(component: &ComponentId) -> Topic {
    Topic(format!("tickit-{component}-in"))
}

/// The topic on which a component publishes outputs, interrupts and faults.
pub fn output_topic(component: &ComponentId) -> Topic {
    Topic(format!("tickit-{component}-out"))
}

/// The broadcast topic for simulation-wide control messages (shutdown).
pub fn control_topic() -> Topic {
    Topic("tickit-control".to_string())
}

/// The publishing half of a state interface.
pub trait StateProducer: Send {
    /// Publishes a message to a topic.
    fn produce(&self, topic: &Topic, message: StateMessage) -> Result<(), TransportError>;
}

/// The subscribing half of a state interface: a merged stream over the
/// topics named at subscription time.
pub trait StateConsumer: Send {
    /// Receives the next message, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` if the timeout elapses with nothing to deliver.
    fn recv(&mut self, timeout: Duration) -> Result<Option<StateMessage>, TransportError>;

    /// Receives the next message if one is already queued.
    fn try_recv(&mut self) -> Result<Option<StateMessage>, TransportError>;
}

/// A message transport over which schedulers and components exchange
/// envelopes.
pub trait StateInterface: Send + Sync {
    /// Creates a producer handle.
    fn producer(&self) -> Box<dyn StateProducer>;

    /// Subscribes to a set of topics, returning a merged consumer.
    fn subscribe(&self, topics: &[Topic]) -> Result<Box<dyn StateConsumer>, TransportError>;

    /// Releases transport resources. Idempotent.
    fn close(&self);
}

/// Bounded exponential backoff applied to failed publishes before the
/// failure escalates to the scheduler.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled per retry.
    pub base_delay: Duration,
    /// Upper bound on the per-retry delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

/// Publishes `message`, retrying transport failures with exponential
/// backoff up to the policy bound.
pub fn produce_with_retry(
    producer: &dyn StateProducer,
    topic: &Topic,
    message: StateMessage,
    policy: &RetryPolicy,
) -> Result<(), TransportError> {
    let mut delay = policy.base_delay;
    for attempt in 1..=policy.max_attempts.max(1) {
        match producer.produce(topic, message.clone()) {
            Ok(()) => return Ok(()),
            Err(error) if attempt < policy.max_attempts => {
                tracing::warn!(%topic, attempt, %error, "publish failed, retrying");
                std::thread::sleep(delay);
                delay = (delay * 2).min(policy.max_delay);
            }
            Err(_) => break,
        }
    }
    Err(TransportError::PublishFailed {
        topic: topic.as_str().to_string(),
        attempts: policy.max_attempts,
    })
}
