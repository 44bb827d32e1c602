//! Core type definitions for the simulation kernel.
//!
//! This module defines the fundamental types used throughout the kernel:
//! simulated time, component and port identifiers, and the opaque values
//! that flow on wires.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Simulated time in nanoseconds.
///
/// All times in the system are simulated; there is no wall-clock coupling.
/// Time starts at 0 and never decreases.
pub type SimTime = u64;

/// An opaque value flowing on a wire.
///
/// The kernel never interprets values; it only compares them by equality to
/// detect changes. Values are immutable once published.
pub type Value = serde_json::Value;

/// A mapping of port names to their current values.
///
/// Used both for the persistent inputs of a component and for the outputs a
/// component produces during an update.
pub type State = HashMap<PortId, Value>;

/// A mapping of port names to values which changed during a tick.
pub type Changes = HashMap<PortId, Value>;

/// Unique identifier for a component within one simulation level.
///
/// A human-readable name; nested simulations each have their own namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    /// Creates a new component identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// The name of an input or output port on a component.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    /// Creates a new port identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// A fully-qualified wire endpoint: one port of one component.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentPort {
    /// The component owning the port.
    pub component: ComponentId,
    /// The port name.
    pub port: PortId,
}

impl ComponentPort {
    /// Creates a new component port endpoint.
    pub fn new(component: impl Into<ComponentId>, port: impl Into<PortId>) -> Self {
        Self {
            component: component.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for ComponentPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.component, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_id_display() {
        let id = ComponentId::new("pump");
        assert_eq!(id.as_str(), "pump");
        assert_eq!(id.to_string(), "pump");
    }

    #[test]
    fn test_component_port_display() {
        let port = ComponentPort::new("pump", "flux");
        assert_eq!(port.to_string(), "pump:flux");
    }

    #[test]
    fn test_ids_as_map_keys() {
        let mut state: State = HashMap::new();
        state.insert(PortId::new("value"), serde_json::json!(42));
        assert_eq!(
            state.get(&PortId::new("value")),
            Some(&serde_json::json!(42))
        );
    }

    #[test]
    fn test_id_serde_transparent() {
        let id = ComponentId::new("sink");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sink\"");
        let back: ComponentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
