//! Static wiring and the event router.
//!
//! The wiring is the static graph connecting component output ports to
//! consumer input ports. It is established once at startup; the router
//! validates that the induced component-level dependency graph is acyclic,
//! computes a total update order consistent with a topological sort, and
//! answers the fan-out and dependency queries the ticker needs.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::ConfigError;
use crate::types::{Changes, ComponentId, ComponentPort, PortId};

/// The static graph, keyed by producer: maps every output port of every
/// component to the set of input ports subscribed to it.
///
/// Components without connections are still registered so that isolated
/// components (pure timers, sinks of external traffic) take part in the
/// update order.
#[derive(Clone, Debug, Default)]
pub struct Wiring {
    map: HashMap<ComponentId, HashMap<PortId, BTreeSet<ComponentPort>>>,
}

impl Wiring {
    /// Creates an empty wiring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component with no connections (yet).
    pub fn add_component(&mut self, component: ComponentId) {
        self.map.entry(component).or_default();
    }

    /// Connects a producer output port to a consumer input port.
    pub fn connect(&mut self, producer: ComponentPort, consumer: ComponentPort) {
        self.map.entry(consumer.component.clone()).or_default();
        self.map
            .entry(producer.component)
            .or_default()
            .entry(producer.port)
            .or_default()
            .insert(consumer);
    }

    /// All components known to the wiring.
    pub fn components(&self) -> BTreeSet<ComponentId> {
        self.map.keys().cloned().collect()
    }

    /// The subscribers of one output port, if any.
    pub fn subscribers(&self, producer: &ComponentId, port: &PortId) -> Option<&BTreeSet<ComponentPort>> {
        self.map.get(producer).and_then(|ports| ports.get(port))
    }

    /// Iterates over every `(producer, output port, consumer)` connection.
    fn connections(&self) -> impl Iterator<Item = (&ComponentId, &PortId, &ComponentPort)> {
        self.map.iter().flat_map(|(producer, ports)| {
            ports.iter().flat_map(move |(port, consumers)| {
                consumers.iter().map(move |consumer| (producer, port, consumer))
            })
        })
    }
}

/// The static graph keyed by consumer: maps every input port to the single
/// output port which feeds it.
///
/// Constructing an inverse wiring enforces that no input port is fed by
/// more than one producer.
#[derive(Clone, Debug, Default)]
pub struct InverseWiring {
    map: HashMap<ComponentId, HashMap<PortId, ComponentPort>>,
}

impl InverseWiring {
    /// Creates an empty inverse wiring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component with no connections (yet).
    pub fn add_component(&mut self, component: ComponentId) {
        self.map.entry(component).or_default();
    }

    /// Records that `consumer` is fed by `producer`.
    ///
    /// Fails if the consumer input port already has a producer.
    pub fn connect(
        &mut self,
        consumer: ComponentPort,
        producer: ComponentPort,
    ) -> Result<(), ConfigError> {
        self.map.entry(producer.component.clone()).or_default();
        let ports = self.map.entry(consumer.component.clone()).or_default();
        if ports.contains_key(&consumer.port) {
            return Err(ConfigError::DoublyFedPort(consumer));
        }
        ports.insert(consumer.port, producer);
        Ok(())
    }

    /// Builds an inverse wiring from a producer-keyed wiring.
    pub fn from_wiring(wiring: &Wiring) -> Result<Self, ConfigError> {
        let mut inverse = Self::new();
        for component in wiring.components() {
            inverse.add_component(component);
        }
        for (producer, port, consumer) in wiring.connections() {
            inverse.connect(
                consumer.clone(),
                ComponentPort::new(producer.clone(), port.clone()),
            )?;
        }
        Ok(inverse)
    }

    /// Rebuilds the producer-keyed wiring.
    pub fn to_wiring(&self) -> Wiring {
        let mut wiring = Wiring::new();
        for component in self.map.keys() {
            wiring.add_component(component.clone());
        }
        for (consumer, ports) in &self.map {
            for (port, producer) in ports {
                wiring.connect(
                    producer.clone(),
                    ComponentPort::new(consumer.clone(), port.clone()),
                );
            }
        }
        wiring
    }
}

/// The dependency-ordered event router.
///
/// Read-only after construction. Encapsulates the wiring and answers the
/// queries the ticker and schedulers need: per-tick fan-out of changed
/// outputs, dependant closures, and a total component order in which every
/// producer precedes every one of its consumers.
#[derive(Clone, Debug)]
pub struct EventRouter {
    wiring: Wiring,
    components: BTreeSet<ComponentId>,
    /// First-order downstream components, per component.
    downstream: HashMap<ComponentId, HashSet<ComponentId>>,
    /// First-order upstream components, per component.
    upstream: HashMap<ComponentId, HashSet<ComponentId>>,
    /// Components in topological order (producers before consumers).
    order: Vec<ComponentId>,
    /// Position of each component in `order`.
    position: HashMap<ComponentId, usize>,
}

impl EventRouter {
    /// Builds a router from a producer-keyed wiring.
    ///
    /// Fails with [`ConfigError::DoublyFedPort`] if an input port has two
    /// producers, or [`ConfigError::CycleDetected`] if the component-level
    /// dependency graph has a cycle.
    pub fn new(wiring: Wiring) -> Result<Self, ConfigError> {
        // Canonicalising through the inverse form enforces the one-producer-
        // per-input-port invariant.
        InverseWiring::from_wiring(&wiring)?;

        let components = wiring.components();
        let mut downstream: HashMap<ComponentId, HashSet<ComponentId>> = components
            .iter()
            .map(|c| (c.clone(), HashSet::new()))
            .collect();
        let mut upstream: HashMap<ComponentId, HashSet<ComponentId>> = components
            .iter()
            .map(|c| (c.clone(), HashSet::new()))
            .collect();

        for (producer, _, consumer) in wiring.connections() {
            if producer != &consumer.component {
                downstream
                    .get_mut(producer)
                    .expect("producer registered above")
                    .insert(consumer.component.clone());
                upstream
                    .get_mut(&consumer.component)
                    .expect("consumer registered above")
                    .insert(producer.clone());
            } else {
                // A self-loop is the smallest possible cycle.
                return Err(ConfigError::CycleDetected {
                    members: vec![producer.clone()],
                });
            }
        }

        let order = topological_order(&components, &downstream, &upstream)?;
        let position = order
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();

        Ok(Self {
            wiring,
            components,
            downstream,
            upstream,
            order,
            position,
        })
    }

    /// Builds a router from a consumer-keyed wiring.
    pub fn from_inverse(inverse: InverseWiring) -> Result<Self, ConfigError> {
        Self::new(inverse.to_wiring())
    }

    /// All components known to the router.
    pub fn components(&self) -> &BTreeSet<ComponentId> {
        &self.components
    }

    /// `true` if the component takes part in this wiring.
    pub fn contains(&self, component: &ComponentId) -> bool {
        self.components.contains(component)
    }

    /// Components in a total order consistent with the dependency DAG:
    /// every producer precedes every one of its consumers.
    pub fn topological_order(&self) -> &[ComponentId] {
        &self.order
    }

    /// The position of a component in the topological order.
    pub fn position(&self, component: &ComponentId) -> Option<usize> {
        self.position.get(component).copied()
    }

    /// The components directly fed by `component`.
    pub fn downstream(&self, component: &ComponentId) -> Option<&HashSet<ComponentId>> {
        self.downstream.get(component)
    }

    /// The components directly feeding `component`.
    pub fn upstream(&self, component: &ComponentId) -> Option<&HashSet<ComponentId>> {
        self.upstream.get(component)
    }

    /// All components downstream of `component`, transitively (exclusive).
    pub fn dependants(&self, component: &ComponentId) -> BTreeSet<ComponentId> {
        self.closure(component, &self.downstream)
    }

    /// All components upstream of `component`, transitively (exclusive).
    ///
    /// Used by schedulers to walk producers at simulation boundaries, and by
    /// the ticker to decide when a component's dependencies are resolved.
    pub fn inverse_dependants(&self, component: &ComponentId) -> BTreeSet<ComponentId> {
        self.closure(component, &self.upstream)
    }

    fn closure(
        &self,
        component: &ComponentId,
        edges: &HashMap<ComponentId, HashSet<ComponentId>>,
    ) -> BTreeSet<ComponentId> {
        let mut seen: BTreeSet<ComponentId> = BTreeSet::new();
        let mut queue: VecDeque<&ComponentId> = VecDeque::from([component]);
        while let Some(current) = queue.pop_front() {
            if let Some(next) = edges.get(current) {
                for n in next {
                    if seen.insert(n.clone()) {
                        queue.push_back(n);
                    }
                }
            }
        }
        seen.remove(component);
        seen
    }

    /// Translates the changed outputs of `source` into input deliveries,
    /// grouped by destination component.
    ///
    /// Output ports absent from `changes` are not fanned out; changed ports
    /// with no subscribers produce nothing.
    pub fn fanout(
        &self,
        source: &ComponentId,
        changes: &Changes,
    ) -> HashMap<ComponentId, Changes> {
        let mut deliveries: HashMap<ComponentId, Changes> = HashMap::new();
        for (port, value) in changes {
            let Some(subscribers) = self.wiring.subscribers(source, port) else {
                continue;
            };
            for consumer in subscribers {
                deliveries
                    .entry(consumer.component.clone())
                    .or_default()
                    .insert(consumer.port.clone(), value.clone());
            }
        }
        deliveries
    }
}

/// Computes a topological order over the component-level dependency graph
/// using Kahn's algorithm, or reports the components stuck on a cycle.
fn topological_order(
    components: &BTreeSet<ComponentId>,
    downstream: &HashMap<ComponentId, HashSet<ComponentId>>,
    upstream: &HashMap<ComponentId, HashSet<ComponentId>>,
) -> Result<Vec<ComponentId>, ConfigError> {
    let mut in_degree: HashMap<&ComponentId, usize> = components
        .iter()
        .map(|c| (c, upstream.get(c).map_or(0, HashSet::len)))
        .collect();

    // BTreeSet iteration makes the order deterministic across runs.
    let mut queue: VecDeque<&ComponentId> = components
        .iter()
        .filter(|c| in_degree[*c] == 0)
        .collect();

    let mut order = Vec::with_capacity(components.len());
    while let Some(component) = queue.pop_front() {
        order.push(component.clone());
        if let Some(next) = downstream.get(component) {
            // Deterministic visit order for the same reason.
            let mut next: Vec<&ComponentId> = next.iter().collect();
            next.sort();
            for n in next {
                let degree = in_degree.get_mut(n).expect("all components registered");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(n);
                }
            }
        }
    }

    if order.len() != components.len() {
        let members: Vec<ComponentId> = components
            .iter()
            .filter(|c| !order.contains(*c))
            .cloned()
            .collect();
        return Err(ConfigError::CycleDetected { members });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(wiring: &mut Wiring, from: (&str, &str), to: (&str, &str)) {
        wiring.connect(
            ComponentPort::new(from.0, from.1),
            ComponentPort::new(to.0, to.1),
        );
    }

    fn chain() -> Wiring {
        let mut wiring = Wiring::new();
        wire(&mut wiring, ("source", "value"), ("mid", "input"));
        wire(&mut wiring, ("mid", "value"), ("sink", "input"));
        wiring
    }

    #[test]
    fn test_topological_order_linear() {
        let router = EventRouter::new(chain()).unwrap();
        assert_eq!(
            router.topological_order(),
            &[
                ComponentId::new("source"),
                ComponentId::new("mid"),
                ComponentId::new("sink")
            ]
        );
    }

    #[test]
    fn test_topological_order_diamond() {
        let mut wiring = Wiring::new();
        wire(&mut wiring, ("top", "value"), ("left", "input"));
        wire(&mut wiring, ("top", "value"), ("right", "input"));
        wire(&mut wiring, ("left", "value"), ("bottom", "a"));
        wire(&mut wiring, ("right", "value"), ("bottom", "b"));
        let router = EventRouter::new(wiring).unwrap();

        let position = |name: &str| router.position(&ComponentId::new(name)).unwrap();
        assert!(position("top") < position("left"));
        assert!(position("top") < position("right"));
        assert!(position("left") < position("bottom"));
        assert!(position("right") < position("bottom"));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut wiring = Wiring::new();
        wire(&mut wiring, ("a", "out"), ("b", "in"));
        wire(&mut wiring, ("b", "out"), ("a", "in"));
        let err = EventRouter::new(wiring).unwrap_err();
        assert!(matches!(err, ConfigError::CycleDetected { .. }));
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut wiring = Wiring::new();
        wire(&mut wiring, ("a", "out"), ("a", "in"));
        let err = EventRouter::new(wiring).unwrap_err();
        assert!(matches!(err, ConfigError::CycleDetected { .. }));
    }

    #[test]
    fn test_doubly_fed_port_rejected() {
        let mut wiring = Wiring::new();
        wire(&mut wiring, ("a", "out"), ("c", "in"));
        wire(&mut wiring, ("b", "out"), ("c", "in"));
        let err = EventRouter::new(wiring).unwrap_err();
        assert!(matches!(err, ConfigError::DoublyFedPort(_)));
    }

    #[test]
    fn test_isolated_component_in_order() {
        let mut wiring = chain();
        wiring.add_component(ComponentId::new("timer"));
        let router = EventRouter::new(wiring).unwrap();
        assert!(router.contains(&ComponentId::new("timer")));
        assert_eq!(router.topological_order().len(), 4);
    }

    #[test]
    fn test_fanout_groups_by_destination() {
        let mut wiring = Wiring::new();
        wire(&mut wiring, ("source", "value"), ("a", "input"));
        wire(&mut wiring, ("source", "value"), ("b", "input"));
        wire(&mut wiring, ("source", "status"), ("b", "status"));
        let router = EventRouter::new(wiring).unwrap();

        let changes = Changes::from([
            (PortId::new("value"), json!(1)),
            (PortId::new("status"), json!("ok")),
        ]);
        let deliveries = router.fanout(&ComponentId::new("source"), &changes);

        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[&ComponentId::new("a")].len(), 1);
        assert_eq!(deliveries[&ComponentId::new("b")].len(), 2);
        assert_eq!(
            deliveries[&ComponentId::new("b")][&PortId::new("status")],
            json!("ok")
        );
    }

    #[test]
    fn test_fanout_skips_unchanged_ports() {
        let router = EventRouter::new(chain()).unwrap();
        let deliveries = router.fanout(&ComponentId::new("source"), &Changes::new());
        assert!(deliveries.is_empty());
    }

    #[test]
    fn test_dependants_transitive() {
        let router = EventRouter::new(chain()).unwrap();
        let dependants = router.dependants(&ComponentId::new("source"));
        assert_eq!(
            dependants,
            BTreeSet::from([ComponentId::new("mid"), ComponentId::new("sink")])
        );
        assert!(router.dependants(&ComponentId::new("sink")).is_empty());
    }

    #[test]
    fn test_inverse_dependants_transitive() {
        let router = EventRouter::new(chain()).unwrap();
        let ancestors = router.inverse_dependants(&ComponentId::new("sink"));
        assert_eq!(
            ancestors,
            BTreeSet::from([ComponentId::new("source"), ComponentId::new("mid")])
        );
    }

    #[test]
    fn test_inverse_wiring_round_trip() {
        let wiring = chain();
        let inverse = InverseWiring::from_wiring(&wiring).unwrap();
        let router_a = EventRouter::new(wiring).unwrap();
        let router_b = EventRouter::from_inverse(inverse).unwrap();

        let changes = Changes::from([(PortId::new("value"), json!(5))]);
        assert_eq!(
            router_a.fanout(&ComponentId::new("mid"), &changes),
            router_b.fanout(&ComponentId::new("mid"), &changes)
        );
        assert_eq!(router_a.components(), router_b.components());
    }
}
