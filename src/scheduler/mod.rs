//! Schedulers: the owners of simulated time.
//!
//! A scheduler owns the ticker (and through it the event router), the wake
//! queue, the persistent inputs buffer of its components, and the state
//! interface handles through which inputs and outputs travel. The
//! [`MasterScheduler`](master::MasterScheduler) drives a top-level
//! simulation; the [`SlaveScheduler`](slave::SlaveScheduler) runs the
//! sub-graph inside a system-simulation component.

pub mod master;
pub mod slave;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{OrderingError, SchedulerError, TransportError};
use crate::messages::{StateMessage, StopComponent};
use crate::router::EventRouter;
use crate::state::{
    control_topic, input_topic, output_topic, produce_with_retry, RetryPolicy, StateConsumer,
    StateInterface, StateProducer, Topic,
};
use crate::ticker::{TickEvent, TickIo, TickSummary, Ticker};
use crate::types::{ComponentId, SimTime, State};
use crate::wake::WakeQueue;

pub use master::MasterScheduler;
pub use slave::SlaveScheduler;

/// Tunables shared by all schedulers.
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    /// How long a tick may wait for any single component output.
    pub tick_timeout: Duration,
    /// Backoff applied to failed transport publishes.
    pub retry: RetryPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// Counters collected while a scheduler runs.
#[derive(Clone, Debug, Default)]
pub struct SchedulerStats {
    /// Ticks executed.
    pub ticks_executed: u64,
    /// Component updates across all ticks.
    pub components_updated: u64,
    /// Wake-up requests accepted from outputs.
    pub wakeups_scheduled: u64,
    /// Interrupts absorbed.
    pub interrupts_handled: u64,
}

/// State and behaviour common to master and slave schedulers.
pub(crate) struct SchedulerCore {
    pub(crate) ticker: Ticker,
    pub(crate) wakeups: WakeQueue,
    pub(crate) inputs: HashMap<ComponentId, State>,
    pub(crate) producer: Box<dyn StateProducer>,
    pub(crate) consumer: Box<dyn StateConsumer>,
    pub(crate) interrupts: Arc<Mutex<BTreeSet<ComponentId>>>,
    pub(crate) retry: RetryPolicy,
    pub(crate) stats: SchedulerStats,
}

impl SchedulerCore {
    /// Subscribes to the output topic of every component in the wiring and
    /// prepares the ticker.
    pub(crate) fn new(
        router: EventRouter,
        bus: &dyn StateInterface,
        initial_inputs: HashMap<ComponentId, State>,
        options: &SchedulerOptions,
    ) -> Result<Self, TransportError> {
        let topics: Vec<Topic> = router.components().iter().map(output_topic).collect();
        let consumer = bus.subscribe(&topics)?;
        let producer = bus.producer();
        Ok(Self {
            ticker: Ticker::new(router, options.tick_timeout),
            wakeups: WakeQueue::new(),
            inputs: initial_inputs,
            producer,
            consumer,
            interrupts: Arc::new(Mutex::new(BTreeSet::new())),
            retry: options.retry.clone(),
            stats: SchedulerStats::default(),
        })
    }

    /// All components this scheduler drives.
    pub(crate) fn components(&self) -> &BTreeSet<ComponentId> {
        self.ticker.router().components()
    }

    /// Absorbs every message queued between ticks.
    ///
    /// Interrupts accumulate for the next wake pass; a fatal fault aborts;
    /// an output outside a tick violates the one-output-per-tick invariant.
    pub(crate) fn drain_messages(&mut self) -> Result<(), SchedulerError> {
        while let Some(message) = self.consumer.try_recv()? {
            match message {
                StateMessage::Interrupt(interrupt) => {
                    tracing::debug!(component = %interrupt.source, "interrupt received");
                    self.stats.interrupts_handled += 1;
                    self.interrupts.lock().insert(interrupt.source);
                }
                StateMessage::Fault(fault) if fault.fatal => {
                    return Err(SchedulerError::Component {
                        component: fault.source,
                        message: fault.message,
                    });
                }
                StateMessage::Fault(fault) => {
                    tracing::warn!(
                        component = %fault.source,
                        message = %fault.message,
                        "component fault"
                    );
                }
                StateMessage::Output(output) => {
                    return Err(OrderingError::UnexpectedOutput {
                        component: output.source,
                        time: output.time,
                    }
                    .into());
                }
                other => tracing::debug!(?other, "ignoring message"),
            }
        }
        Ok(())
    }

    /// Takes the accumulated interrupt set, leaving it empty.
    pub(crate) fn take_interrupts(&mut self) -> BTreeSet<ComponentId> {
        std::mem::take(&mut *self.interrupts.lock())
    }

    /// Runs one tick over the transport and folds the requested wake-ups
    /// into the queue.
    pub(crate) fn do_tick(
        &mut self,
        time: SimTime,
        wake: &BTreeSet<ComponentId>,
    ) -> Result<TickSummary, SchedulerError> {
        let Self {
            ticker,
            wakeups,
            inputs,
            producer,
            consumer,
            interrupts,
            retry,
            stats,
        } = self;
        let mut io = CoreIo {
            producer: producer.as_ref(),
            consumer: consumer.as_mut(),
            interrupts: &**interrupts,
            retry,
        };
        let summary = ticker.tick(time, wake, inputs, &mut io)?;
        for (component, at) in &summary.wakeups {
            wakeups.push(component.clone(), *at);
        }
        stats.ticks_executed += 1;
        stats.components_updated += summary.updated.len() as u64;
        stats.wakeups_scheduled += summary.wakeups.len() as u64;
        Ok(summary)
    }

    /// Broadcasts a stop request on the control topic.
    pub(crate) fn broadcast_stop(&self) -> Result<(), TransportError> {
        produce_with_retry(
            self.producer.as_ref(),
            &control_topic(),
            StateMessage::Stop(StopComponent {}),
            &self.retry,
        )
    }
}

/// The default [`TickIo`]: inputs go out over the component input topics,
/// outputs and faults come back over the merged output subscription.
/// Interrupts arriving mid-tick are deferred to the next wake pass.
pub(crate) struct CoreIo<'a> {
    pub(crate) producer: &'a dyn StateProducer,
    pub(crate) consumer: &'a mut dyn StateConsumer,
    pub(crate) interrupts: &'a Mutex<BTreeSet<ComponentId>>,
    pub(crate) retry: &'a RetryPolicy,
}

impl TickIo for CoreIo<'_> {
    fn send_input(&mut self, input: crate::messages::Input) -> Result<(), SchedulerError> {
        let topic = input_topic(&input.target);
        produce_with_retry(self.producer, &topic, StateMessage::Input(input), self.retry)
            .map_err(Into::into)
    }

    fn recv_event(&mut self, timeout: Duration) -> Result<Option<TickEvent>, SchedulerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.consumer.recv(remaining)? {
                None => return Ok(None),
                Some(StateMessage::Output(output)) => return Ok(Some(TickEvent::Output(output))),
                Some(StateMessage::Fault(fault)) => return Ok(Some(TickEvent::Fault(fault))),
                Some(StateMessage::Interrupt(interrupt)) => {
                    tracing::debug!(component = %interrupt.source, "interrupt deferred until end of tick");
                    self.interrupts.lock().insert(interrupt.source);
                }
                Some(other) => tracing::debug!(?other, "ignoring message during tick"),
            }
        }
    }
}
