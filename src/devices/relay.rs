//! A pass-through device for wiring tests and demos.

use serde_json::json;

use crate::component::{Device, DeviceUpdate};
use crate::types::{PortId, SimTime, State};

/// Forwards its `input` port to its `value` port, optionally adding a fixed
/// offset to numeric values.
#[derive(Debug, Default)]
pub struct Relay {
    offset: i64,
}

impl Relay {
    /// A relay which forwards values unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay which adds `offset` to numeric values passing through.
    pub fn adding(offset: i64) -> Self {
        Self { offset }
    }
}

impl Device for Relay {
    fn update(&mut self, _time: SimTime, inputs: &State) -> DeviceUpdate {
        let mut outputs = State::new();
        if let Some(value) = inputs.get(&PortId::new("input")) {
            let forwarded = match value.as_i64() {
                Some(n) => json!(n + self.offset),
                None => value.clone(),
            };
            outputs.insert(PortId::new("value"), forwarded);
        }
        DeviceUpdate::new(outputs, None)
    }
}
