//! A terminal device which records what reaches it.

use crossbeam_channel::{Receiver, Sender};

use crate::component::{Device, DeviceUpdate};
use crate::types::{PortId, SimTime, State, Value};

/// A device with a single `input` port and no outputs.
///
/// Every update where the port carries a value is recorded, and optionally
/// reported over a probe channel so tests can observe deliveries from
/// outside the component's worker thread.
#[derive(Debug, Default)]
pub struct Sink {
    received: Vec<(SimTime, Value)>,
    probe: Option<Sender<(SimTime, Value)>>,
}

impl Sink {
    /// Creates an unobserved sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink paired with a probe receiving every delivery.
    pub fn with_probe() -> (Self, Receiver<(SimTime, Value)>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Self {
                received: Vec::new(),
                probe: Some(tx),
            },
            rx,
        )
    }

    /// Everything delivered so far.
    pub fn received(&self) -> &[(SimTime, Value)] {
        &self.received
    }
}

impl Device for Sink {
    fn update(&mut self, time: SimTime, inputs: &State) -> DeviceUpdate {
        if let Some(value) = inputs.get(&PortId::new("input")) {
            tracing::debug!(time, value = %value, "sunk");
            self.received.push((time, value.clone()));
            if let Some(probe) = &self.probe {
                let _ = probe.send((time, value.clone()));
            }
        }
        DeviceUpdate::default()
    }
}
