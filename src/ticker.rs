//! The per-tick propagation engine.
//!
//! A tick is one atomic advance of simulated time: a chosen set of
//! components each receive exactly one input and produce exactly one
//! output. The ticker sequences those updates so that a consumer is only
//! asked to update once every producer it could still hear from this tick
//! has spoken, growing the set of components to update as changed outputs
//! fan out.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use crate::error::{OrderingError, SchedulerError};
use crate::messages::{ComponentFault, Input, Output};
use crate::router::EventRouter;
use crate::types::{Changes, ComponentId, SimTime, State};

/// A message surfaced to the ticker while it awaits component outputs.
#[derive(Debug)]
pub enum TickEvent {
    /// A component finished its update.
    Output(Output),
    /// A component failed instead of producing an output.
    Fault(ComponentFault),
}

/// The transport seam between the ticker and the components it updates.
///
/// Schedulers implement this over their state interface; nested schedulers
/// additionally intercept their boundary components here.
pub trait TickIo {
    /// Delivers an input to a component.
    fn send_input(&mut self, input: Input) -> Result<(), SchedulerError>;

    /// Waits up to `timeout` for the next output or fault.
    ///
    /// Returns `Ok(None)` if the timeout elapses first.
    fn recv_event(&mut self, timeout: Duration) -> Result<Option<TickEvent>, SchedulerError>;
}

/// What happened during one tick.
#[derive(Clone, Debug, Default)]
pub struct TickSummary {
    /// The simulated time of the tick.
    pub time: SimTime,
    /// Every component which received an input and produced an output.
    pub updated: BTreeSet<ComponentId>,
    /// Wake-up requests collected from outputs, in arrival order.
    pub wakeups: Vec<(ComponentId, SimTime)>,
}

/// Sequences the update of components during a tick.
///
/// Owns the event router; the inputs buffer and wake queue stay with the
/// scheduler. Read-only between ticks.
#[derive(Debug)]
pub struct Ticker {
    router: EventRouter,
    timeout: Duration,
}

impl Ticker {
    /// Creates a ticker over a routed wiring.
    ///
    /// `timeout` bounds how long one tick will wait for any single output.
    pub fn new(router: EventRouter, timeout: Duration) -> Self {
        Self { router, timeout }
    }

    /// The router this ticker sequences over.
    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Performs a tick at `time` over the components in `wake`.
    ///
    /// `inputs` is the persistent per-component inputs buffer; deliveries
    /// made during the tick are merged into it. The tick ends when every
    /// reachable component has produced its output.
    pub fn tick(
        &self,
        time: SimTime,
        wake: &BTreeSet<ComponentId>,
        inputs: &mut HashMap<ComponentId, State>,
        io: &mut dyn TickIo,
    ) -> Result<TickSummary, SchedulerError> {
        for component in wake {
            if !self.router.contains(component) {
                return Err(SchedulerError::UnknownComponent(component.clone()));
            }
        }
        tracing::debug!(time, woken = wake.len(), "tick started");

        // The reachable closure grows as outputs arrive; `pending` holds the
        // values delivered this tick but not yet handed to their consumer.
        let mut reachable: BTreeSet<ComponentId> = wake.clone();
        let mut pending: HashMap<ComponentId, Changes> = HashMap::new();
        let mut sent: HashSet<ComponentId> = HashSet::new();
        let mut produced: HashSet<ComponentId> = HashSet::new();
        let mut wakeups: Vec<(ComponentId, SimTime)> = Vec::new();

        loop {
            self.dispatch_ready(time, &reachable, &mut pending, &mut sent, &produced, inputs, io)?;

            if produced.len() == reachable.len() {
                break;
            }

            let output = match io.recv_event(self.timeout)? {
                None => {
                    let outstanding: Vec<ComponentId> = self
                        .router
                        .topological_order()
                        .iter()
                        .filter(|c| sent.contains(*c) && !produced.contains(*c))
                        .cloned()
                        .collect();
                    return Err(SchedulerError::ComponentTimeout {
                        pending: outstanding,
                        timeout: self.timeout,
                    });
                }
                Some(TickEvent::Fault(fault)) => {
                    if fault.fatal {
                        return Err(SchedulerError::Component {
                            component: fault.source,
                            message: fault.message,
                        });
                    }
                    if sent.contains(&fault.source) && !produced.contains(&fault.source) {
                        tracing::warn!(
                            component = %fault.source,
                            message = %fault.message,
                            "component faulted during update, treating as empty output"
                        );
                        Output::empty(fault.source.clone(), time)
                    } else {
                        tracing::warn!(
                            component = %fault.source,
                            message = %fault.message,
                            "fault from a component not being updated"
                        );
                        continue;
                    }
                }
                Some(TickEvent::Output(output)) => output,
            };

            self.apply_output(
                time,
                output,
                inputs,
                &mut reachable,
                &mut pending,
                &sent,
                &mut produced,
                &mut wakeups,
            )?;
        }

        tracing::debug!(time, updated = reachable.len(), "tick finished");
        Ok(TickSummary {
            time,
            updated: reachable,
            wakeups,
        })
    }

    /// Sends an input to every reachable component whose dependencies are
    /// resolved, in topological order.
    ///
    /// A component is ready once no unproduced member of the reachable set
    /// remains among its transitive ancestors: any such ancestor could
    /// still deliver to it, directly or through an intermediate hop that
    /// has not joined the closure yet.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_ready(
        &self,
        time: SimTime,
        reachable: &BTreeSet<ComponentId>,
        pending: &mut HashMap<ComponentId, Changes>,
        sent: &mut HashSet<ComponentId>,
        produced: &HashSet<ComponentId>,
        inputs: &mut HashMap<ComponentId, State>,
        io: &mut dyn TickIo,
    ) -> Result<(), SchedulerError> {
        for component in self.router.topological_order() {
            if !reachable.contains(component) || sent.contains(component) {
                continue;
            }
            let blocked = self
                .router
                .inverse_dependants(component)
                .into_iter()
                .any(|ancestor| reachable.contains(&ancestor) && !produced.contains(&ancestor));
            if blocked {
                continue;
            }

            let delivered = pending.remove(component).unwrap_or_default();
            let state = inputs.entry(component.clone()).or_default();
            let mut changed: BTreeSet<_> = BTreeSet::new();
            for (port, value) in delivered {
                state.insert(port.clone(), value);
                changed.insert(port);
            }
            io.send_input(Input::new(component.clone(), time, state.clone(), changed))?;
            sent.insert(component.clone());
        }
        Ok(())
    }

    /// Folds one output into the tick: validates the ordering invariants,
    /// collects its wake-up request, and fans its changes out to consumers.
    #[allow(clippy::too_many_arguments)]
    fn apply_output(
        &self,
        time: SimTime,
        output: Output,
        inputs: &HashMap<ComponentId, State>,
        reachable: &mut BTreeSet<ComponentId>,
        pending: &mut HashMap<ComponentId, Changes>,
        sent: &HashSet<ComponentId>,
        produced: &mut HashSet<ComponentId>,
        wakeups: &mut Vec<(ComponentId, SimTime)>,
    ) -> Result<(), SchedulerError> {
        if !sent.contains(&output.source) {
            return Err(OrderingError::UnexpectedOutput {
                component: output.source,
                time,
            }
            .into());
        }
        if !produced.insert(output.source.clone()) {
            return Err(OrderingError::DuplicateOutput {
                component: output.source,
                time,
            }
            .into());
        }
        if output.time != time {
            return Err(OrderingError::TimeMismatch {
                component: output.source,
                expected: time,
                actual: output.time,
            }
            .into());
        }

        if let Some(at) = output.call_at {
            if at < time {
                return Err(OrderingError::WakeupInPast {
                    component: output.source,
                    requested: at,
                    now: time,
                }
                .into());
            }
            wakeups.push((output.source.clone(), at));
        }

        for (consumer, delivery) in self.router.fanout(&output.source, &output.changes) {
            // Deliveries equal to the consumer's persisted input are
            // short-circuited; the consumer is not woken for them.
            let fresh: Changes = delivery
                .into_iter()
                .filter(|(port, value)| {
                    inputs.get(&consumer).and_then(|state| state.get(port)) != Some(value)
                })
                .collect();
            if fresh.is_empty() {
                continue;
            }
            if sent.contains(&consumer) {
                return Err(OrderingError::StaleDelivery { component: consumer }.into());
            }
            reachable.insert(consumer.clone());
            pending.entry(consumer).or_default().extend(fresh);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Wiring;
    use crate::types::{ComponentPort, PortId, Value};
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    type Handler = Box<dyn FnMut(Input) -> Output>;

    /// A scripted transport: each component is a closure invoked
    /// synchronously on dispatch, its output queued for the next receive.
    #[derive(Default)]
    struct ScriptedIo {
        handlers: HashMap<ComponentId, Handler>,
        queue: VecDeque<TickEvent>,
    }

    impl ScriptedIo {
        fn handle(&mut self, name: &str, handler: impl FnMut(Input) -> Output + 'static) {
            self.handlers.insert(ComponentId::new(name), Box::new(handler));
        }
    }

    impl TickIo for ScriptedIo {
        fn send_input(&mut self, input: Input) -> Result<(), SchedulerError> {
            if let Some(handler) = self.handlers.get_mut(&input.target) {
                let output = handler(input);
                self.queue.push_back(TickEvent::Output(output));
            }
            Ok(())
        }

        fn recv_event(&mut self, _timeout: Duration) -> Result<Option<TickEvent>, SchedulerError> {
            Ok(self.queue.pop_front())
        }
    }

    fn chain_router() -> EventRouter {
        let mut wiring = Wiring::new();
        wiring.connect(
            ComponentPort::new("source", "value"),
            ComponentPort::new("mid", "input"),
        );
        wiring.connect(
            ComponentPort::new("mid", "value"),
            ComponentPort::new("sink", "input"),
        );
        EventRouter::new(wiring).unwrap()
    }

    fn ticker(router: EventRouter) -> Ticker {
        Ticker::new(router, Duration::from_millis(100))
    }

    fn wake(names: &[&str]) -> BTreeSet<ComponentId> {
        names.iter().map(|n| ComponentId::new(*n)).collect()
    }

    fn changes(entries: &[(&str, Value)]) -> Changes {
        entries
            .iter()
            .map(|(port, value)| (PortId::new(*port), value.clone()))
            .collect()
    }

    #[test]
    fn test_chain_propagates_within_one_tick() {
        let ticker = ticker(chain_router());
        let mut io = ScriptedIo::default();
        let seen = Rc::new(RefCell::new(Vec::new()));

        io.handle("source", |input| {
            Output::new(input.target, input.time, changes(&[("value", json!(1))]), None)
        });
        io.handle("mid", |input| {
            let forwarded = input.inputs[&PortId::new("input")].clone();
            Output::new(
                input.target,
                input.time,
                changes(&[("value", forwarded)]),
                None,
            )
        });
        let sink_seen = Rc::clone(&seen);
        io.handle("sink", move |input| {
            sink_seen.borrow_mut().push(input.changed_values());
            Output::empty(input.target, input.time)
        });

        let mut inputs = HashMap::new();
        let summary = ticker.tick(0, &wake(&["source"]), &mut inputs, &mut io).unwrap();

        assert_eq!(summary.updated, wake(&["source", "mid", "sink"]));
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0][&PortId::new("input")], json!(1));
        // Deliveries persist in the inputs buffer across ticks.
        assert_eq!(
            inputs[&ComponentId::new("sink")][&PortId::new("input")],
            json!(1)
        );
    }

    #[test]
    fn test_timer_only_wake_sees_empty_changes() {
        let mut wiring = Wiring::new();
        wiring.add_component(ComponentId::new("timer"));
        let ticker = ticker(EventRouter::new(wiring).unwrap());
        let mut io = ScriptedIo::default();

        let seen = Rc::new(RefCell::new(None));
        let probe = Rc::clone(&seen);
        io.handle("timer", move |input| {
            *probe.borrow_mut() = Some(input.changes.clone());
            Output::new(input.target, input.time, Changes::new(), Some(input.time + 10))
        });

        let mut inputs = HashMap::new();
        let summary = ticker.tick(20, &wake(&["timer"]), &mut inputs, &mut io).unwrap();

        assert_eq!(seen.borrow().as_ref().unwrap().len(), 0);
        assert_eq!(summary.wakeups, vec![(ComponentId::new("timer"), 30)]);
    }

    #[test]
    fn test_equal_value_delivery_short_circuits() {
        let ticker = ticker(chain_router());
        let mut io = ScriptedIo::default();

        io.handle("source", |input| {
            Output::new(input.target, input.time, changes(&[("value", json!(1))]), None)
        });
        io.handle("mid", |input| {
            panic!("mid should not be updated, got {input:?}");
        });

        // mid already holds the value the source is about to emit.
        let mut inputs = HashMap::new();
        inputs.insert(
            ComponentId::new("mid"),
            State::from([(PortId::new("input"), json!(1))]),
        );

        let summary = ticker.tick(0, &wake(&["source"]), &mut inputs, &mut io).unwrap();
        assert_eq!(summary.updated, wake(&["source"]));
    }

    #[test]
    fn test_consumer_waits_for_transitive_ancestor() {
        // p -> u -> d, with both p and d woken directly: d must not be
        // dispatched until u (reachable only through p's output) resolves.
        let mut wiring = Wiring::new();
        wiring.connect(
            ComponentPort::new("p", "value"),
            ComponentPort::new("u", "input"),
        );
        wiring.connect(
            ComponentPort::new("u", "value"),
            ComponentPort::new("d", "input"),
        );
        let ticker = ticker(EventRouter::new(wiring).unwrap());
        let mut io = ScriptedIo::default();

        io.handle("p", |input| {
            Output::new(input.target, input.time, changes(&[("value", json!(7))]), None)
        });
        io.handle("u", |input| {
            Output::new(
                input.target,
                input.time,
                changes(&[("value", json!(8))]),
                None,
            )
        });
        let seen = Rc::new(RefCell::new(Vec::new()));
        let probe = Rc::clone(&seen);
        io.handle("d", move |input| {
            probe.borrow_mut().push(input.changed_values());
            Output::empty(input.target, input.time)
        });

        let mut inputs = HashMap::new();
        let summary = ticker.tick(0, &wake(&["p", "d"]), &mut inputs, &mut io).unwrap();

        assert_eq!(summary.updated, wake(&["p", "u", "d"]));
        // d was updated exactly once, and saw u's output of this tick.
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0][&PortId::new("input")], json!(8));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        // Two isolated components woken together; the transport keeps
        // replaying an output from the first.
        let mut wiring = Wiring::new();
        wiring.add_component(ComponentId::new("a"));
        wiring.add_component(ComponentId::new("b"));
        let ticker = ticker(EventRouter::new(wiring).unwrap());

        struct DoubleIo;
        impl TickIo for DoubleIo {
            fn send_input(&mut self, _input: Input) -> Result<(), SchedulerError> {
                Ok(())
            }
            fn recv_event(&mut self, _t: Duration) -> Result<Option<TickEvent>, SchedulerError> {
                Ok(Some(TickEvent::Output(Output::empty(ComponentId::new("a"), 0))))
            }
        }

        let err = ticker
            .tick(0, &wake(&["a", "b"]), &mut HashMap::new(), &mut DoubleIo)
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Ordering(OrderingError::DuplicateOutput { .. })
        ));
    }

    #[test]
    fn test_unexpected_output_rejected() {
        let mut wiring = Wiring::new();
        wiring.add_component(ComponentId::new("a"));
        wiring.add_component(ComponentId::new("stranger"));
        let ticker = ticker(EventRouter::new(wiring).unwrap());

        struct StrangerIo;
        impl TickIo for StrangerIo {
            fn send_input(&mut self, _input: Input) -> Result<(), SchedulerError> {
                Ok(())
            }
            fn recv_event(&mut self, _t: Duration) -> Result<Option<TickEvent>, SchedulerError> {
                Ok(Some(TickEvent::Output(Output::empty(
                    ComponentId::new("stranger"),
                    0,
                ))))
            }
        }

        let err = ticker
            .tick(0, &wake(&["a"]), &mut HashMap::new(), &mut StrangerIo)
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Ordering(OrderingError::UnexpectedOutput { .. })
        ));
    }

    #[test]
    fn test_time_mismatch_rejected() {
        let mut wiring = Wiring::new();
        wiring.add_component(ComponentId::new("a"));
        let ticker = ticker(EventRouter::new(wiring).unwrap());
        let mut io = ScriptedIo::default();
        io.handle("a", |input| Output::empty(input.target, input.time + 1));

        let err = ticker
            .tick(5, &wake(&["a"]), &mut HashMap::new(), &mut io)
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Ordering(OrderingError::TimeMismatch { .. })
        ));
    }

    #[test]
    fn test_wakeup_in_past_rejected() {
        let mut wiring = Wiring::new();
        wiring.add_component(ComponentId::new("a"));
        let ticker = ticker(EventRouter::new(wiring).unwrap());
        let mut io = ScriptedIo::default();
        io.handle("a", |input| {
            Output::new(input.target, input.time, Changes::new(), Some(input.time - 1))
        });

        let err = ticker
            .tick(10, &wake(&["a"]), &mut HashMap::new(), &mut io)
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Ordering(OrderingError::WakeupInPast { .. })
        ));
    }

    #[test]
    fn test_missing_output_times_out() {
        let mut wiring = Wiring::new();
        wiring.add_component(ComponentId::new("mute"));
        let ticker = Ticker::new(EventRouter::new(wiring).unwrap(), Duration::from_millis(5));
        // No handler registered: the input vanishes and no output comes back.
        let mut io = ScriptedIo::default();

        let err = ticker
            .tick(0, &wake(&["mute"]), &mut HashMap::new(), &mut io)
            .unwrap_err();
        match err {
            SchedulerError::ComponentTimeout { pending, .. } => {
                assert_eq!(pending, vec![ComponentId::new("mute")]);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_nonfatal_fault_becomes_empty_output() {
        let ticker = ticker(chain_router());

        struct FaultyIo {
            queue: VecDeque<TickEvent>,
        }
        impl TickIo for FaultyIo {
            fn send_input(&mut self, input: Input) -> Result<(), SchedulerError> {
                if input.target == ComponentId::new("source") {
                    self.queue.push_back(TickEvent::Fault(ComponentFault {
                        source: input.target,
                        message: "flaky".to_string(),
                        fatal: false,
                    }));
                }
                Ok(())
            }
            fn recv_event(&mut self, _t: Duration) -> Result<Option<TickEvent>, SchedulerError> {
                Ok(self.queue.pop_front())
            }
        }

        let mut io = FaultyIo { queue: VecDeque::new() };
        let summary = ticker
            .tick(0, &wake(&["source"]), &mut HashMap::new(), &mut io)
            .unwrap();
        // The faulting component still counts as updated; nothing fanned out.
        assert_eq!(summary.updated, wake(&["source"]));
    }

    #[test]
    fn test_fatal_fault_aborts() {
        let mut wiring = Wiring::new();
        wiring.add_component(ComponentId::new("a"));
        let ticker = ticker(EventRouter::new(wiring).unwrap());

        struct FatalIo;
        impl TickIo for FatalIo {
            fn send_input(&mut self, _input: Input) -> Result<(), SchedulerError> {
                Ok(())
            }
            fn recv_event(&mut self, _t: Duration) -> Result<Option<TickEvent>, SchedulerError> {
                Ok(Some(TickEvent::Fault(ComponentFault {
                    source: ComponentId::new("a"),
                    message: "broken".to_string(),
                    fatal: true,
                })))
            }
        }

        let err = ticker
            .tick(0, &wake(&["a"]), &mut HashMap::new(), &mut FatalIo)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Component { .. }));
    }

    #[test]
    fn test_unknown_wake_component_rejected() {
        let ticker = ticker(chain_router());
        let err = ticker
            .tick(0, &wake(&["ghost"]), &mut HashMap::new(), &mut ScriptedIo::default())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownComponent(_)));
    }

    #[test]
    fn test_empty_wake_set_is_a_noop() {
        let ticker = ticker(chain_router());
        let summary = ticker
            .tick(0, &BTreeSet::new(), &mut HashMap::new(), &mut ScriptedIo::default())
            .unwrap();
        assert!(summary.updated.is_empty());
        assert!(summary.wakeups.is_empty());
    }
}
