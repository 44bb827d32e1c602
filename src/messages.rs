//! Message envelopes exchanged between schedulers and components.
//!
//! These are the only messages that travel over a state interface. The
//! on-wire representation of the external bus variant is the serde
//! serialization of [`StateMessage`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{Changes, ComponentId, PortId, SimTime, State};

/// A request for a component to update itself at a simulated time.
///
/// `inputs` is the full view of the component's input ports (persisted
/// values merged with this tick's deliveries); `changes` names the ports
/// whose value changed this tick. A component woken purely by a timer
/// receives an empty `changes` set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Input {
    /// The component being updated.
    pub target: ComponentId,
    /// The simulated time of the tick (in nanoseconds).
    pub time: SimTime,
    /// The value of every input port.
    pub inputs: State,
    /// The input ports whose value changed this tick.
    pub changes: BTreeSet<PortId>,
}

impl Input {
    /// Creates a new input message.
    pub fn new(
        target: ComponentId,
        time: SimTime,
        inputs: State,
        changes: BTreeSet<PortId>,
    ) -> Self {
        Self {
            target,
            time,
            inputs,
            changes,
        }
    }

    /// Extracts the changed ports and their new values as a mapping.
    pub fn changed_values(&self) -> Changes {
        self.changes
            .iter()
            .filter_map(|port| self.inputs.get(port).map(|v| (port.clone(), v.clone())))
            .collect()
    }
}

/// The result of a component update.
///
/// `changes` lists only the output ports whose value actually changed;
/// `call_at`, if present, asks the scheduler to wake the component again at
/// that simulated time (which must not precede `time`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Output {
    /// The component which produced the update.
    pub source: ComponentId,
    /// The simulated time of the tick; always equals the matching input time.
    pub time: SimTime,
    /// The output ports whose value changed, with their new values.
    pub changes: Changes,
    /// An optional request to be woken again at this simulated time.
    pub call_at: Option<SimTime>,
}

impl Output {
    /// Creates a new output message.
    pub fn new(
        source: ComponentId,
        time: SimTime,
        changes: Changes,
        call_at: Option<SimTime>,
    ) -> Self {
        Self {
            source,
            time,
            changes,
            call_at,
        }
    }

    /// Creates an output with no changed ports and no wake-up request.
    pub fn empty(source: ComponentId, time: SimTime) -> Self {
        Self::new(source, time, Changes::default(), None)
    }
}

/// A request to update a component immediately, outside the normal tick
/// cadence. Typically raised by a component's adapter when external traffic
/// mutates device state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interrupt {
    /// The component which should be updated.
    pub source: ComponentId,
}

/// A request for a component to terminate and release its resources.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopComponent {}

/// An error reported by a component in place of an output.
///
/// Fatal faults terminate the simulation; non-fatal faults are surfaced to
/// the operator and the run continues.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentFault {
    /// The component which failed.
    pub source: ComponentId,
    /// A human-readable description of the failure.
    pub message: String,
    /// Whether the simulation must stop.
    pub fatal: bool,
}

/// The envelope carried by a state interface topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateMessage {
    /// An input to a component.
    Input(Input),
    /// An output from a component.
    Output(Output),
    /// An immediate update request.
    Interrupt(Interrupt),
    /// A termination request.
    Stop(StopComponent),
    /// A component failure report.
    Fault(ComponentFault),
}
