//! Declarative simulation configuration.
//!
//! A simulation is described by a list of component declarations, a wiring
//! list, a transport selector and scheduler tunables, loadable from YAML or
//! JSON.
//!
//! # Configuration File Structure
//!
//! ```yaml
//! scheduler:
//!   tick_timeout_ms: 1000
//!
//! transport:
//!   kind: internal
//!
//! components:
//!   - id: setpoint
//!     type: scheduled_source
//!     params:
//!       schedule: [[0, 2], [50, 5]]
//!   - id: plant
//!     type: system
//!     system:
//!       components:
//!         - id: pump
//!           type: relay
//!       wiring:
//!         - {producer: external, output_port: demand, consumer: pump, input_port: input}
//!       expose:
//!         flow: {component: pump, port: value}
//!
//! wiring:
//!   - {producer: setpoint, output_port: value, consumer: plant, input_port: demand}
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::router::Wiring;
use crate::scheduler::SchedulerOptions;
use crate::state::RetryPolicy;
use crate::types::{Changes, ComponentId, ComponentPort, PortId, State, Value};

/// The component kind reserved for nested simulations.
pub const SYSTEM_KIND: &str = "system";

/// Scheduler tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerParams {
    /// How long a tick may wait for any single component output.
    #[serde(default = "default_tick_timeout_ms")]
    pub tick_timeout_ms: u64,

    /// Publish attempts before a transport failure escalates.
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_tick_timeout_ms() -> u64 {
    1000
}

fn default_publish_attempts() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            tick_timeout_ms: default_tick_timeout_ms(),
            publish_attempts: default_publish_attempts(),
            log_level: default_log_level(),
        }
    }
}

impl SchedulerParams {
    /// Converts the parameters into scheduler options.
    pub fn options(&self) -> SchedulerOptions {
        SchedulerOptions {
            tick_timeout: Duration::from_millis(self.tick_timeout_ms),
            retry: RetryPolicy {
                max_attempts: self.publish_attempts,
                ..RetryPolicy::default()
            },
        }
    }
}

/// The transport carrying messages between the scheduler and components.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// In-process channels; the default.
    #[default]
    Internal,
    /// An external message broker. The kernel ships no broker bindings;
    /// selecting this requires supplying a state interface to the
    /// simulation builder.
    Bus {
        /// Broker addresses.
        brokers: Vec<String>,
    },
}

/// Declaration of one component.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Unique component identifier.
    pub id: ComponentId,

    /// The device kind, resolved through the component registry, or
    /// `system` for a nested simulation.
    #[serde(rename = "type")]
    pub kind: String,

    /// Device parameters, passed to the registry factory.
    #[serde(default)]
    pub params: HashMap<String, Value>,

    /// Initial values for the component's input ports.
    #[serde(default)]
    pub initial: Changes,

    /// Declared input port names. When non-empty, wiring into this
    /// component is validated against the list.
    #[serde(default)]
    pub inputs: Vec<PortId>,

    /// Declared output port names. When non-empty, wiring out of this
    /// component is validated against the list.
    #[serde(default)]
    pub outputs: Vec<PortId>,

    /// The nested simulation, for `system` components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Box<SystemConfig>>,
}

/// One wire: a producer output port feeding a consumer input port.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireConfig {
    pub producer: ComponentId,
    pub output_port: PortId,
    pub consumer: ComponentId,
    pub input_port: PortId,
}

/// The inner description of a system-simulation component.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Internal component declarations.
    #[serde(default)]
    pub components: Vec<ComponentConfig>,

    /// Internal wiring. The synthetic `external` component may appear as a
    /// producer; its output ports are the system component's input ports.
    #[serde(default)]
    pub wiring: Vec<WireConfig>,

    /// Exposed output ports, mapped to the internal ports producing them.
    #[serde(default)]
    pub expose: HashMap<PortId, ComponentPort>,
}

/// Complete simulation configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SimConfig {
    /// Scheduler tunables.
    #[serde(default)]
    pub scheduler: SchedulerParams,

    /// Transport selector.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Component declarations.
    #[serde(default)]
    pub components: Vec<ComponentConfig>,

    /// The wiring list.
    #[serde(default)]
    pub wiring: Vec<WireConfig>,
}

impl SimConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file, auto-detecting the format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ConfigError::UnknownFormat(ext.to_string())),
        }
    }

    /// Serializes to YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Serializes to pretty JSON.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validates the whole configuration, nested simulations included.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_level(&self.components, &self.wiring, false)
    }

    /// Builds the top-level wiring graph.
    pub fn to_wiring(&self) -> Wiring {
        assemble_wiring(&self.components, &self.wiring)
    }

    /// The configured initial inputs, per component.
    pub fn initial_inputs(&self) -> HashMap<ComponentId, State> {
        collect_initial_inputs(&self.components)
    }

    /// Finds a component declaration by id.
    pub fn find_component(&self, id: &ComponentId) -> Option<&ComponentConfig> {
        self.components.iter().find(|c| &c.id == id)
    }
}

impl SystemConfig {
    /// Builds the internal wiring graph (boundary components are added by
    /// the slave scheduler).
    pub fn to_wiring(&self) -> Wiring {
        assemble_wiring(&self.components, &self.wiring)
    }

    /// The configured initial inputs of the internal components.
    pub fn initial_inputs(&self) -> HashMap<ComponentId, State> {
        collect_initial_inputs(&self.components)
    }
}

fn assemble_wiring(components: &[ComponentConfig], wires: &[WireConfig]) -> Wiring {
    let mut wiring = Wiring::new();
    for component in components {
        wiring.add_component(component.id.clone());
    }
    for wire in wires {
        wiring.connect(
            ComponentPort::new(wire.producer.clone(), wire.output_port.clone()),
            ComponentPort::new(wire.consumer.clone(), wire.input_port.clone()),
        );
    }
    wiring
}

fn collect_initial_inputs(components: &[ComponentConfig]) -> HashMap<ComponentId, State> {
    components
        .iter()
        .filter(|c| !c.initial.is_empty())
        .map(|c| (c.id.clone(), c.initial.clone()))
        .collect()
}

/// Validates one nesting level. Inside a system simulation the synthetic
/// `external` component is a legal wiring producer.
fn validate_level(
    components: &[ComponentConfig],
    wires: &[WireConfig],
    nested: bool,
) -> Result<(), ConfigError> {
    let boundary_in = ComponentId::new("external");
    let boundary_out = ComponentId::new("expose");

    let mut ids: HashSet<&ComponentId> = HashSet::new();
    for component in components {
        if component.id == boundary_in || component.id == boundary_out {
            return Err(ConfigError::Validation(format!(
                "component id {} is reserved for the simulation boundary",
                component.id
            )));
        }
        if !ids.insert(&component.id) {
            return Err(ConfigError::DuplicateComponent(component.id.clone()));
        }
        match (&component.kind[..], &component.system) {
            (SYSTEM_KIND, None) => {
                return Err(ConfigError::MissingSystem(component.id.clone()));
            }
            (SYSTEM_KIND, Some(system)) => {
                validate_level(&system.components, &system.wiring, true)?;
                for producer in system.expose.values() {
                    if !system.components.iter().any(|c| c.id == producer.component) {
                        return Err(ConfigError::UnknownComponent(producer.component.clone()));
                    }
                }
            }
            (_, Some(_)) => {
                return Err(ConfigError::Validation(format!(
                    "component {} carries a system configuration but is not of type {SYSTEM_KIND}",
                    component.id
                )));
            }
            _ => {}
        }
    }

    fn declared_ports<'a>(
        components: &'a [ComponentConfig],
        id: &ComponentId,
        outputs: bool,
    ) -> Option<&'a Vec<PortId>> {
        components
            .iter()
            .find(|c| &c.id == id)
            .map(|c| if outputs { &c.outputs } else { &c.inputs })
            .filter(|ports| !ports.is_empty())
    }

    let mut fed: HashSet<(&ComponentId, &PortId)> = HashSet::new();
    for wire in wires {
        let external_producer = nested && wire.producer == boundary_in;
        if !external_producer && !ids.contains(&wire.producer) {
            return Err(ConfigError::UnknownComponent(wire.producer.clone()));
        }
        if !ids.contains(&wire.consumer) {
            return Err(ConfigError::UnknownComponent(wire.consumer.clone()));
        }
        if let Some(outputs) = declared_ports(components, &wire.producer, true) {
            if !outputs.contains(&wire.output_port) {
                return Err(ConfigError::UnknownPort {
                    component: wire.producer.clone(),
                    port: wire.output_port.clone(),
                });
            }
        }
        if let Some(inputs) = declared_ports(components, &wire.consumer, false) {
            if !inputs.contains(&wire.input_port) {
                return Err(ConfigError::UnknownPort {
                    component: wire.consumer.clone(),
                    port: wire.input_port.clone(),
                });
            }
        }
        if !fed.insert((&wire.consumer, &wire.input_port)) {
            return Err(ConfigError::DoublyFedPort(ComponentPort::new(
                wire.consumer.clone(),
                wire.input_port.clone(),
            )));
        }
    }
    Ok(())
}

/// Builder for assembling a [`SimConfig`] programmatically.
#[derive(Default)]
pub struct SimConfigBuilder {
    config: SimConfig,
}

impl SimConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-tick output timeout.
    pub fn tick_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.scheduler.tick_timeout_ms = timeout;
        self
    }

    /// Adds a component declaration.
    pub fn add_component(mut self, id: impl Into<ComponentId>, kind: impl Into<String>) -> Self {
        self.config.components.push(ComponentConfig {
            id: id.into(),
            kind: kind.into(),
            params: HashMap::new(),
            initial: Changes::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            system: None,
        });
        self
    }

    /// Adds a component declaration with parameters.
    pub fn add_component_with_params(
        mut self,
        id: impl Into<ComponentId>,
        kind: impl Into<String>,
        params: HashMap<String, Value>,
    ) -> Self {
        self.config.components.push(ComponentConfig {
            id: id.into(),
            kind: kind.into(),
            params,
            initial: Changes::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            system: None,
        });
        self
    }

    /// Adds a wire.
    pub fn add_wire(
        mut self,
        producer: impl Into<ComponentId>,
        output_port: impl Into<PortId>,
        consumer: impl Into<ComponentId>,
        input_port: impl Into<PortId>,
    ) -> Self {
        self.config.wiring.push(WireConfig {
            producer: producer.into(),
            output_port: output_port.into(),
            consumer: consumer.into(),
            input_port: input_port.into(),
        });
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<SimConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
scheduler:
  tick_timeout_ms: 250

components:
  - id: source
    type: scheduled_source
    params:
      schedule: [[0, 1], [5, 2]]
  - id: sink
    type: sink
    initial:
      input: 0

wiring:
  - {producer: source, output_port: value, consumer: sink, input_port: input}
"#;
        let config = SimConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.scheduler.tick_timeout_ms, 250);
        assert_eq!(config.components.len(), 2);
        assert_eq!(config.wiring.len(), 1);
        assert!(matches!(config.transport, TransportConfig::Internal));

        let initial = config.initial_inputs();
        assert_eq!(
            initial[&ComponentId::new("sink")][&PortId::new("input")],
            json!(0)
        );
    }

    #[test]
    fn test_nested_system_parsing() {
        let yaml = r#"
components:
  - id: plant
    type: system
    system:
      components:
        - id: pump
          type: relay
      wiring:
        - {producer: external, output_port: demand, consumer: pump, input_port: input}
      expose:
        flow: {component: pump, port: value}
"#;
        let config = SimConfig::from_yaml(yaml).unwrap();
        let plant = config.find_component(&ComponentId::new("plant")).unwrap();
        let system = plant.system.as_ref().unwrap();
        assert_eq!(system.components.len(), 1);
        assert_eq!(
            system.expose[&PortId::new("flow")],
            ComponentPort::new("pump", "value")
        );
    }

    #[test]
    fn test_unknown_wiring_component_rejected() {
        let yaml = r#"
components:
  - id: source
    type: source
wiring:
  - {producer: source, output_port: value, consumer: ghost, input_port: input}
"#;
        let err = SimConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownComponent(_)));
    }

    #[test]
    fn test_undeclared_port_rejected() {
        let yaml = r#"
components:
  - id: source
    type: source
    outputs: [value]
  - id: sink
    type: sink
wiring:
  - {producer: source, output_port: lever, consumer: sink, input_port: input}
"#;
        let err = SimConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPort { .. }));
    }

    #[test]
    fn test_doubly_fed_input_rejected() {
        let yaml = r#"
components:
  - id: a
    type: source
  - id: b
    type: source
  - id: sink
    type: sink
wiring:
  - {producer: a, output_port: value, consumer: sink, input_port: input}
  - {producer: b, output_port: value, consumer: sink, input_port: input}
"#;
        let err = SimConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::DoublyFedPort(_)));
    }

    #[test]
    fn test_duplicate_component_rejected() {
        let config = SimConfigBuilder::new()
            .add_component("a", "source")
            .add_component("a", "sink")
            .build();
        assert!(matches!(config, Err(ConfigError::DuplicateComponent(_))));
    }

    #[test]
    fn test_reserved_boundary_id_rejected() {
        let config = SimConfigBuilder::new()
            .add_component("external", "source")
            .build();
        assert!(matches!(config, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_system_without_inner_config_rejected() {
        let config = SimConfigBuilder::new().add_component("plant", "system").build();
        assert!(matches!(config, Err(ConfigError::MissingSystem(_))));
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = SimConfigBuilder::new()
            .tick_timeout_ms(500)
            .add_component("source", "source")
            .add_component("sink", "sink")
            .add_wire("source", "value", "sink", "input")
            .build()
            .unwrap();

        let yaml = config.to_yaml().unwrap();
        let restored = SimConfig::from_yaml(&yaml).unwrap();
        assert_eq!(restored.scheduler.tick_timeout_ms, 500);
        assert_eq!(restored.components.len(), 2);
        assert_eq!(restored.wiring.len(), 1);
    }
}
