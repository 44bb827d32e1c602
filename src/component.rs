//! The component runtime contract.
//!
//! A component is anything a scheduler can update: a [`DeviceComponent`]
//! wrapping a user-supplied device behaviour, or a [`SystemComponent`]
//! wrapping a whole nested simulation. Components run on their own worker
//! thread inside a [`ComponentRunner`], consuming their input topic and
//! publishing outputs; the kernel never touches device state directly.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{SchedulerError, TransportError};
use crate::messages::{ComponentFault, Input, Interrupt, Output, StateMessage};
use crate::scheduler::slave::SlaveScheduler;
use crate::state::{
    control_topic, input_topic, output_topic, StateConsumer, StateInterface, StateProducer,
};
use crate::types::{Changes, ComponentId, SimTime, State};

/// How long a runner blocks on its consumer before re-checking for
/// termination.
const RUNNER_POLL: Duration = Duration::from_millis(200);

/// The result of one device update.
#[derive(Clone, Debug, Default)]
pub struct DeviceUpdate {
    /// The value of every output port the device produced. Ports whose
    /// value did not change since the previous update are filtered out
    /// before the output is published.
    pub outputs: State,
    /// An optional request to be updated again at this simulated time.
    pub call_at: Option<SimTime>,
}

impl DeviceUpdate {
    /// Creates a device update.
    pub fn new(outputs: State, call_at: Option<SimTime>) -> Self {
        Self { outputs, call_at }
    }
}

/// The capability the kernel consumes from the device-behaviour library.
///
/// A device is a local state machine: given the simulated time and the
/// current value of its input ports, it produces its output port values and
/// optionally asks to be called again.
pub trait Device: Send {
    /// Updates the device.
    fn update(&mut self, time: SimTime, inputs: &State) -> DeviceUpdate;
}

impl std::fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Device")
    }
}

/// Anything a scheduler can update: one input in, one output out, per tick.
pub trait Component: Send {
    /// The component's identifier at its simulation level.
    fn id(&self) -> &ComponentId;

    /// Handles one input, producing the matching output.
    fn handle_input(&mut self, input: Input) -> Result<Output, SchedulerError>;

    /// Releases resources on shutdown.
    fn stop(&mut self) {}
}

/// A component wrapping a device behaviour.
///
/// Delegates the update to the device and publishes only the output ports
/// whose value actually changed, so downstream components are not woken for
/// re-stated values.
pub struct DeviceComponent {
    id: ComponentId,
    device: Box<dyn Device>,
    last_outputs: State,
}

impl DeviceComponent {
    /// Wraps `device` as the component `id`.
    pub fn new(id: ComponentId, device: Box<dyn Device>) -> Self {
        Self {
            id,
            device,
            last_outputs: State::new(),
        }
    }
}

impl Component for DeviceComponent {
    fn id(&self) -> &ComponentId {
        &self.id
    }

    fn handle_input(&mut self, input: Input) -> Result<Output, SchedulerError> {
        let update = self.device.update(input.time, &input.inputs);
        let changes: Changes = update
            .outputs
            .iter()
            .filter(|&(port, value)| self.last_outputs.get(port) != Some(value))
            .map(|(port, value)| (port.clone(), value.clone()))
            .collect();
        self.last_outputs = update.outputs;
        Ok(Output::new(self.id.clone(), input.time, changes, update.call_at))
    }
}

/// A component wrapping a nested simulation.
///
/// Owns the inner state interface, the runners of the internal components,
/// and an interrupt forwarder which surfaces internal interrupts to the
/// parent scheduler.
pub struct SystemComponent {
    id: ComponentId,
    slave: SlaveScheduler,
    inner_bus: Arc<dyn StateInterface>,
    runners: Vec<ComponentRunner>,
    forwarder: Option<JoinHandle<()>>,
}

impl SystemComponent {
    /// Assembles a system component from its inner scheduler and runners.
    ///
    /// `interrupt` is the component's handle on the *outer* bus: internal
    /// interrupts are recorded for the slave's next tick and re-raised
    /// through it so the parent wakes this component immediately.
    pub fn new(
        id: ComponentId,
        slave: SlaveScheduler,
        inner_bus: Arc<dyn StateInterface>,
        runners: Vec<ComponentRunner>,
        interrupt: InterruptHandle,
    ) -> Result<Self, TransportError> {
        let forwarder = spawn_interrupt_forwarder(
            &id,
            inner_bus.as_ref(),
            slave.components(),
            slave.interrupt_set(),
            interrupt,
        )?;
        Ok(Self {
            id,
            slave,
            inner_bus,
            runners,
            forwarder: Some(forwarder),
        })
    }
}

impl Component for SystemComponent {
    fn id(&self) -> &ComponentId {
        &self.id
    }

    fn handle_input(&mut self, input: Input) -> Result<Output, SchedulerError> {
        let changes = input.changed_values();
        let (exposed, call_at) = self.slave.on_tick(input.time, changes)?;
        Ok(Output::new(self.id.clone(), input.time, exposed, call_at))
    }

    fn stop(&mut self) {
        if let Err(error) = self.slave.shutdown() {
            tracing::warn!(component = %self.id, %error, "inner shutdown failed");
        }
        // Close before joining so the joins terminate even if the stop
        // broadcast failed; queued messages still drain first.
        self.inner_bus.close();
        for runner in self.runners.drain(..) {
            runner.join();
        }
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.join();
        }
    }
}

/// A handle for raising an interrupt on behalf of a component, usable from
/// adapter threads.
pub struct InterruptHandle {
    producer: Box<dyn StateProducer>,
    component: ComponentId,
}

impl InterruptHandle {
    /// Creates an interrupt handle for `component` on `bus`.
    pub fn new(bus: &dyn StateInterface, component: ComponentId) -> Self {
        Self {
            producer: bus.producer(),
            component,
        }
    }

    /// Requests an immediate update of the component.
    pub fn raise(&self) -> Result<(), TransportError> {
        self.producer.produce(
            &output_topic(&self.component),
            StateMessage::Interrupt(Interrupt {
                source: self.component.clone(),
            }),
        )
    }
}

/// The worker thread owning one component.
///
/// Consumes the component's input topic and the control topic; each input
/// becomes exactly one published output (or a fatal fault). Exits on a stop
/// request or when the transport closes.
pub struct ComponentRunner {
    id: ComponentId,
    handle: JoinHandle<()>,
}

impl ComponentRunner {
    /// Subscribes the component and starts its worker thread.
    pub fn spawn(
        component: Box<dyn Component>,
        bus: &dyn StateInterface,
    ) -> Result<Self, TransportError> {
        let id = component.id().clone();
        let consumer = bus.subscribe(&[input_topic(&id), control_topic()])?;
        let producer = bus.producer();
        let thread_id = id.clone();
        let handle = std::thread::Builder::new()
            .name(format!("tickit-{id}"))
            .spawn(move || run_component(thread_id, component, consumer, producer))
            .expect("failed to spawn component thread");
        Ok(Self { id, handle })
    }

    /// The component this runner drives.
    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    /// Waits for the worker thread to finish.
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!(component = %self.id, "component thread panicked");
        }
    }
}

fn run_component(
    id: ComponentId,
    mut component: Box<dyn Component>,
    mut consumer: Box<dyn StateConsumer>,
    producer: Box<dyn StateProducer>,
) {
    let out_topic = output_topic(&id);
    loop {
        let message = match consumer.recv(RUNNER_POLL) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(_) => break,
        };
        match message {
            StateMessage::Input(input) if input.target == id => {
                let reply = match component.handle_input(input) {
                    Ok(output) => StateMessage::Output(output),
                    Err(error) => {
                        tracing::error!(component = %id, %error, "component failed");
                        StateMessage::Fault(ComponentFault {
                            source: id.clone(),
                            message: error.to_string(),
                            fatal: true,
                        })
                    }
                };
                let fatal = matches!(reply, StateMessage::Fault(_));
                if producer.produce(&out_topic, reply).is_err() || fatal {
                    break;
                }
            }
            StateMessage::Stop(_) => break,
            other => tracing::debug!(component = %id, ?other, "ignoring message"),
        }
    }
    component.stop();
    tracing::debug!(component = %id, "component stopped");
}

/// Watches the inner bus of a system component and surfaces internal
/// interrupts to the parent scheduler.
fn spawn_interrupt_forwarder(
    id: &ComponentId,
    inner_bus: &dyn StateInterface,
    components: &BTreeSet<ComponentId>,
    interrupts: Arc<Mutex<BTreeSet<ComponentId>>>,
    outer: InterruptHandle,
) -> Result<JoinHandle<()>, TransportError> {
    let mut topics: Vec<_> = components.iter().map(output_topic).collect();
    topics.push(control_topic());
    let mut consumer = inner_bus.subscribe(&topics)?;
    let id = id.clone();
    let handle = std::thread::Builder::new()
        .name(format!("tickit-{id}-interrupts"))
        .spawn(move || loop {
            match consumer.recv(RUNNER_POLL) {
                Ok(Some(StateMessage::Interrupt(interrupt))) => {
                    interrupts.lock().insert(interrupt.source);
                    if let Err(error) = outer.raise() {
                        tracing::warn!(component = %id, %error, "interrupt forwarding failed");
                    }
                }
                Ok(Some(StateMessage::Stop(_))) | Err(_) => break,
                Ok(_) => {}
            }
        })
        .expect("failed to spawn interrupt forwarder");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InternalBus;
    use crate::types::PortId;
    use serde_json::json;

    struct Doubler;

    impl Device for Doubler {
        fn update(&mut self, _time: SimTime, inputs: &State) -> DeviceUpdate {
            let doubled = inputs
                .get(&PortId::new("input"))
                .and_then(|v| v.as_i64())
                .map(|n| json!(n * 2));
            let mut outputs = State::new();
            if let Some(value) = doubled {
                outputs.insert(PortId::new("value"), value);
            }
            DeviceUpdate::new(outputs, None)
        }
    }

    fn input(target: &str, time: SimTime, entries: &[(&str, i64)]) -> Input {
        let inputs: State = entries
            .iter()
            .map(|(port, value)| (PortId::new(*port), json!(value)))
            .collect();
        let changes: BTreeSet<PortId> =
            entries.iter().map(|(port, _)| PortId::new(*port)).collect();
        Input::new(ComponentId::new(target), time, inputs, changes)
    }

    #[test]
    fn test_device_component_filters_unchanged_outputs() {
        let mut component =
            DeviceComponent::new(ComponentId::new("doubler"), Box::new(Doubler));

        let output = component.handle_input(input("doubler", 0, &[("input", 3)])).unwrap();
        assert_eq!(output.changes.get(&PortId::new("value")), Some(&json!(6)));

        // The same result again: nothing new to publish.
        let output = component.handle_input(input("doubler", 5, &[("input", 3)])).unwrap();
        assert!(output.changes.is_empty());
        assert_eq!(output.time, 5);

        let output = component.handle_input(input("doubler", 9, &[("input", 5)])).unwrap();
        assert_eq!(output.changes.get(&PortId::new("value")), Some(&json!(10)));
    }

    #[test]
    fn test_runner_round_trip() {
        let bus = InternalBus::new();
        let id = ComponentId::new("doubler");
        let mut outputs = bus.subscribe(&[output_topic(&id)]).unwrap();

        let runner = ComponentRunner::spawn(
            Box::new(DeviceComponent::new(id.clone(), Box::new(Doubler))),
            &bus,
        )
        .unwrap();

        bus.producer()
            .produce(
                &input_topic(&id),
                StateMessage::Input(input("doubler", 4, &[("input", 21)])),
            )
            .unwrap();

        let reply = outputs.recv(Duration::from_secs(2)).unwrap().unwrap();
        match reply {
            StateMessage::Output(output) => {
                assert_eq!(output.source, id);
                assert_eq!(output.time, 4);
                assert_eq!(output.changes.get(&PortId::new("value")), Some(&json!(42)));
            }
            other => panic!("expected output, got {other:?}"),
        }

        bus.producer()
            .produce(&control_topic(), StateMessage::Stop(crate::messages::StopComponent {}))
            .unwrap();
        runner.join();
    }

    #[test]
    fn test_interrupt_handle_publishes_to_output_topic() {
        let bus = InternalBus::new();
        let id = ComponentId::new("pump");
        let mut outputs = bus.subscribe(&[output_topic(&id)]).unwrap();

        let handle = InterruptHandle::new(&bus, id.clone());
        handle.raise().unwrap();

        let message = outputs.try_recv().unwrap().unwrap();
        assert_eq!(
            message,
            StateMessage::Interrupt(Interrupt { source: id })
        );
    }
}
