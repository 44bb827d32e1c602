//! The slave scheduler: a scheduler embedded inside a system-simulation
//! component.
//!
//! From outside, a system simulation looks like a single component with
//! input and output ports; inside, a slave scheduler runs its own ticker
//! over its own sub-graph. Two synthetic components stand on the boundary:
//! `external`, whose outputs are the system component's input ports, and
//! `expose`, whose inputs are the system component's exposed output ports.
//! Boundary traffic is intercepted before it reaches the transport.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{ConfigError, OrderingError, SchedulerError};
use crate::messages::{Input, Output};
use crate::router::{EventRouter, InverseWiring, Wiring};
use crate::scheduler::{CoreIo, SchedulerCore, SchedulerOptions, SchedulerStats};
use crate::state::StateInterface;
use crate::ticker::{TickEvent, TickIo};
use crate::types::{Changes, ComponentId, ComponentPort, PortId, SimTime, State};

/// The synthetic boundary-in component: its outputs are the enclosing
/// system component's input ports.
pub fn external_id() -> ComponentId {
    ComponentId::new("external")
}

/// The synthetic boundary-out component: its inputs are the enclosing
/// system component's exposed output ports.
pub fn expose_id() -> ComponentId {
    ComponentId::new("expose")
}

/// Orchestrates a nested simulation.
///
/// The enclosing component calls [`on_tick`](Self::on_tick) whenever the
/// parent scheduler updates it; wake-up requests from internal components
/// are merged into an internal queue and surfaced upward as the earliest
/// outstanding time. Slaves nest recursively: the protocol is identical at
/// every level.
pub struct SlaveScheduler {
    core: SchedulerCore,
    started: bool,
    stopped: bool,
    last_time: Option<SimTime>,
}

impl SlaveScheduler {
    /// Creates a slave scheduler over the internal wiring.
    ///
    /// `expose` maps each exposed output port of the system component to
    /// the internal component port producing it.
    pub fn new(
        wiring: Wiring,
        expose: HashMap<PortId, ComponentPort>,
        bus: &dyn StateInterface,
        initial_inputs: HashMap<ComponentId, State>,
        options: &SchedulerOptions,
    ) -> Result<Self, ConfigError> {
        let inverse = exposing_wiring(wiring, expose)?;
        let router = EventRouter::from_inverse(inverse)?;
        let core = SchedulerCore::new(router, bus, initial_inputs, options)?;
        Ok(Self {
            core,
            started: false,
            stopped: false,
            last_time: None,
        })
    }

    /// All internal components, boundary components included.
    pub fn components(&self) -> &BTreeSet<ComponentId> {
        self.core.components()
    }

    /// The interrupt set shared with an interrupt forwarder.
    ///
    /// Internal interrupts inserted here are woken on the next `on_tick`.
    pub fn interrupt_set(&self) -> Arc<Mutex<BTreeSet<ComponentId>>> {
        Arc::clone(&self.core.interrupts)
    }

    /// The earliest outstanding internal wake-up.
    pub fn next_wake_time(&self) -> Option<SimTime> {
        self.core.wakeups.next_time()
    }

    /// Counters collected so far.
    pub fn stats(&self) -> &SchedulerStats {
        &self.core.stats
    }

    /// Runs the nested simulation for one tick of the parent.
    ///
    /// `changes` are the system component's changed input ports. The slave
    /// wakes its boundary-in component, every internal component whose
    /// scheduled time is due, and any internally interrupted component;
    /// the first invocation instead performs the internal startup tick over
    /// all components. Returns the changed exposed outputs and the
    /// earliest remaining internal wake-up time.
    pub fn on_tick(
        &mut self,
        time: SimTime,
        changes: Changes,
    ) -> Result<(Changes, Option<SimTime>), SchedulerError> {
        if let Some(last) = self.last_time {
            if time < last {
                return Err(OrderingError::TimeReversal {
                    previous: last,
                    requested: time,
                }
                .into());
            }
        }
        self.core.drain_messages()?;

        let mut wake = if self.started {
            let mut wake = self.core.wakeups.pop_due(time);
            wake.insert(external_id());
            wake
        } else {
            self.started = true;
            self.core.components().clone()
        };
        wake.extend(self.core.take_interrupts());

        let mut exposed = Changes::new();
        let summary = {
            let SchedulerCore {
                ticker,
                inputs,
                producer,
                consumer,
                interrupts,
                retry,
                ..
            } = &mut self.core;
            let mut io = BoundaryIo {
                inner: CoreIo {
                    producer: producer.as_ref(),
                    consumer: consumer.as_mut(),
                    interrupts: &**interrupts,
                    retry,
                },
                time,
                boundary_changes: Some(changes),
                exposed: &mut exposed,
                synthesized: VecDeque::new(),
            };
            ticker.tick(time, &wake, inputs, &mut io)?
        };

        for (component, at) in &summary.wakeups {
            self.core.wakeups.push(component.clone(), *at);
        }
        self.core.stats.ticks_executed += 1;
        self.core.stats.components_updated += summary.updated.len() as u64;
        self.core.stats.wakeups_scheduled += summary.wakeups.len() as u64;
        self.last_time = Some(time);

        Ok((exposed, self.core.wakeups.next_time()))
    }

    /// Broadcasts the terminal stop message to the internal components.
    /// Idempotent.
    pub fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if !self.stopped {
            tracing::debug!("slave scheduler shutting down");
            self.core.broadcast_stop()?;
            self.stopped = true;
        }
        Ok(())
    }
}

/// Adds the boundary components to the internal wiring: `expose` consumes
/// the internal ports named by the expose map, `external` is registered as
/// a producer (its connections come from the wiring itself).
fn exposing_wiring(
    wiring: Wiring,
    expose: HashMap<PortId, ComponentPort>,
) -> Result<InverseWiring, ConfigError> {
    let mut inverse = InverseWiring::from_wiring(&wiring)?;
    inverse.add_component(external_id());
    inverse.add_component(expose_id());
    for (port, producer) in expose {
        inverse.connect(ComponentPort::new(expose_id(), port), producer)?;
    }
    Ok(inverse)
}

/// [`TickIo`] for a nested simulation: boundary components are served
/// locally, everything else goes over the internal transport.
struct BoundaryIo<'a> {
    inner: CoreIo<'a>,
    time: SimTime,
    /// Input changes of the enclosing component, emitted once through the
    /// boundary-in component.
    boundary_changes: Option<Changes>,
    /// Changed exposed outputs, collected from the boundary-out component.
    exposed: &'a mut Changes,
    synthesized: VecDeque<TickEvent>,
}

impl TickIo for BoundaryIo<'_> {
    fn send_input(&mut self, input: Input) -> Result<(), SchedulerError> {
        if input.target == external_id() {
            let changes = self.boundary_changes.take().unwrap_or_default();
            self.synthesized.push_back(TickEvent::Output(Output::new(
                external_id(),
                self.time,
                changes,
                None,
            )));
            Ok(())
        } else if input.target == expose_id() {
            *self.exposed = input.changed_values();
            self.synthesized
                .push_back(TickEvent::Output(Output::empty(expose_id(), self.time)));
            Ok(())
        } else {
            self.inner.send_input(input)
        }
    }

    fn recv_event(&mut self, timeout: Duration) -> Result<Option<TickEvent>, SchedulerError> {
        if let Some(event) = self.synthesized.pop_front() {
            return Ok(Some(event));
        }
        self.inner.recv_event(timeout)
    }
}
