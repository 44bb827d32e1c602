//! In-process state interface.
//!
//! A single-process pub/sub bus: one unbounded channel per subscriber,
//! fanned out from a shared topic registry. Publishing clones the message
//! to every subscriber of the topic; a consumer subscribed to several
//! topics receives them merged into one channel, in publication order.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::messages::StateMessage;
use crate::state::{StateConsumer, StateInterface, StateProducer, Topic};

#[derive(Default)]
struct Registry {
    subscribers: Vec<(Topic, Sender<StateMessage>)>,
    closed: bool,
}

/// The in-process message bus, used by default and by tests.
///
/// Cheap to clone handles out of: producers and consumers share the
/// registry through an `Arc`.
#[derive(Clone, Default)]
pub struct InternalBus {
    registry: Arc<Mutex<Registry>>,
}

impl InternalBus {
    /// Creates a new, empty bus.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateInterface for InternalBus {
    fn producer(&self) -> Box<dyn StateProducer> {
        Box::new(InternalProducer {
            registry: Arc::clone(&self.registry),
        })
    }

    fn subscribe(&self, topics: &[Topic]) -> Result<Box<dyn StateConsumer>, TransportError> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(TransportError::Closed("bus".to_string()));
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        for topic in topics {
            registry.subscribers.push((topic.clone(), tx.clone()));
        }
        Ok(Box::new(InternalConsumer { rx }))
    }

    fn close(&self) {
        let mut registry = self.registry.lock();
        registry.closed = true;
        // Dropping the senders wakes every blocked consumer.
        registry.subscribers.clear();
    }
}

struct InternalProducer {
    registry: Arc<Mutex<Registry>>,
}

impl StateProducer for InternalProducer {
    fn produce(&self, topic: &Topic, message: StateMessage) -> Result<(), TransportError> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(TransportError::Closed(topic.as_str().to_string()));
        }
        // A subscriber whose consumer was dropped is pruned on the way past.
        registry
            .subscribers
            .retain(|(t, tx)| t != topic || tx.send(message.clone()).is_ok());
        Ok(())
    }
}

struct InternalConsumer {
    rx: Receiver<StateMessage>,
}

impl StateConsumer for InternalConsumer {
    fn recv(&mut self, timeout: Duration) -> Result<Option<StateMessage>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TransportError::Closed("bus".to_string()))
            }
        }
    }

    fn try_recv(&mut self) -> Result<Option<StateMessage>, TransportError> {
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Closed("bus".to_string())),
        }
    }
}
