//! Value-producing devices.

use crate::component::{Device, DeviceUpdate};
use crate::types::{PortId, SimTime, State, Value};

/// A device which produces a pre-configured value on its `value` port and
/// never asks to be called again.
#[derive(Debug)]
pub struct Source {
    value: Value,
}

impl Source {
    /// Creates a source producing `value`.
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

impl Device for Source {
    fn update(&mut self, _time: SimTime, _inputs: &State) -> DeviceUpdate {
        tracing::debug!(value = %self.value, "sourced");
        let outputs = State::from([(PortId::new("value"), self.value.clone())]);
        DeviceUpdate::new(outputs, None)
    }
}

/// A device which plays back a timetable of values on its `value` port,
/// waking itself for each scheduled emission.
#[derive(Debug)]
pub struct ScheduledSource {
    /// `(time, value)` pairs, sorted by time.
    schedule: Vec<(SimTime, Value)>,
}

impl ScheduledSource {
    /// Creates a scheduled source from `(time, value)` pairs.
    pub fn new(mut schedule: Vec<(SimTime, Value)>) -> Self {
        schedule.sort_by_key(|(time, _)| *time);
        Self { schedule }
    }
}

impl Device for ScheduledSource {
    fn update(&mut self, time: SimTime, _inputs: &State) -> DeviceUpdate {
        let current = self
            .schedule
            .iter()
            .take_while(|(at, _)| *at <= time)
            .last()
            .map(|(_, value)| value.clone());
        let call_at = self
            .schedule
            .iter()
            .map(|(at, _)| *at)
            .find(|at| *at > time);

        let mut outputs = State::new();
        if let Some(value) = current {
            outputs.insert(PortId::new("value"), value);
        }
        DeviceUpdate::new(outputs, call_at)
    }
}
