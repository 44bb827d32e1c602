//! Device factory registry.
//!
//! Device kinds are registered by name so that simulations can be assembled
//! from declarative configuration. The registry is how an external
//! device-behaviour library plugs into the kernel.
//!
//! # Example
//!
//! ```
//! use tickit::registry::ComponentRegistry;
//! use tickit::devices::Relay;
//!
//! let mut registry = ComponentRegistry::new();
//! registry.register("relay", |_id, _params| Ok(Box::new(Relay::new())));
//! assert!(registry.contains("relay"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::component::Device;
use crate::error::ConfigError;
use crate::types::{ComponentId, SimTime, Value};

/// A factory producing a device from its declared parameters.
pub type DeviceFactory = Arc<
    dyn Fn(&ComponentId, &HashMap<String, Value>) -> Result<Box<dyn Device>, ConfigError>
        + Send
        + Sync,
>;

/// A registry of device factories, keyed by kind name.
#[derive(Default)]
pub struct ComponentRegistry {
    factories: HashMap<String, DeviceFactory>,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for a device kind.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&ComponentId, &HashMap<String, Value>) -> Result<Box<dyn Device>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    /// Creates a device of the given kind.
    pub fn create(
        &self,
        kind: &str,
        id: &ComponentId,
        params: &HashMap<String, Value>,
    ) -> Result<Box<dyn Device>, ConfigError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| ConfigError::UnknownKind(kind.to_string()))?;
        factory(id, params)
    }

    /// `true` if the kind is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// The number of registered kinds.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Iterates over the registered kind names.
    pub fn kinds(&self) -> impl Iterator<Item = &String> {
        self.factories.keys()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Creates a registry with the built-in device kinds:
///
/// - `source` - emits `params.value` once
/// - `scheduled_source` - plays back `params.schedule` (`[[time, value], ...]`)
/// - `sink` - records deliveries on its `input` port
/// - `metronome` - wakes itself every `params.period` nanoseconds
/// - `relay` - forwards `input` to `value`, adding `params.offset`
pub fn default_registry() -> ComponentRegistry {
    use crate::devices::{Metronome, Relay, ScheduledSource, Sink, Source};

    let mut registry = ComponentRegistry::new();

    registry.register("source", |_id, params| {
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        Ok(Box::new(Source::new(value)))
    });

    registry.register("scheduled_source", |id, params| {
        let entries = params
            .get("schedule")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ConfigError::Validation(format!("{id}: scheduled_source requires a schedule list"))
            })?;
        let mut schedule = Vec::with_capacity(entries.len());
        for entry in entries {
            let pair = entry.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                ConfigError::Validation(format!("{id}: schedule entries are [time, value] pairs"))
            })?;
            let time: SimTime = pair[0].as_u64().ok_or_else(|| {
                ConfigError::Validation(format!("{id}: schedule times are non-negative integers"))
            })?;
            schedule.push((time, pair[1].clone()));
        }
        Ok(Box::new(ScheduledSource::new(schedule)))
    });

    registry.register("sink", |_id, _params| Ok(Box::new(Sink::new())));

    registry.register("metronome", |id, params| {
        let period = params.get("period").and_then(Value::as_u64).ok_or_else(|| {
            ConfigError::Validation(format!("{id}: metronome requires a period"))
        })?;
        Ok(Box::new(Metronome::new(period)))
    });

    registry.register("relay", |_id, params| {
        let offset = params.get("offset").and_then(Value::as_i64).unwrap_or(0);
        Ok(Box::new(Relay::adding(offset)))
    });

    registry
}
