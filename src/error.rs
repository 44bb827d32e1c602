//! Error types for the simulation kernel.
//!
//! Construction-time problems are [`ConfigError`]s and abort startup.
//! Runtime invariant violations are [`OrderingError`]s and are never
//! recovered. Transport failures are [`TransportError`]s, retried with
//! backoff before escalating. [`SchedulerError`] is the top-level runtime
//! error the others fold into.

use std::time::Duration;

use thiserror::Error;

use crate::types::{ComponentId, ComponentPort, SimTime};

/// Errors raised while constructing a simulation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("wiring references unknown component: {0}")]
    UnknownComponent(ComponentId),

    #[error("component {component} declares no port named {port}")]
    UnknownPort {
        component: ComponentId,
        port: crate::types::PortId,
    },

    #[error("duplicate component id: {0}")]
    DuplicateComponent(ComponentId),

    #[error("input port {0} is fed by more than one producer")]
    DoublyFedPort(ComponentPort),

    #[error("wiring contains a dependency cycle through: {}", .members.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", "))]
    CycleDetected { members: Vec<ComponentId> },

    #[error("unknown component kind: {0}")]
    UnknownKind(String),

    #[error("component {0} is declared as a system simulation but has no system configuration")]
    MissingSystem(ComponentId),

    #[error("transport {0} is not available; supply a state interface to the simulation builder")]
    UnsupportedTransport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown file format: {0}")]
    UnknownFormat(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Fatal runtime violations of the tick ordering invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderingError {
    #[error("component {component} produced a second output at time {time}")]
    DuplicateOutput { component: ComponentId, time: SimTime },

    #[error("unexpected output from {component} at time {time}")]
    UnexpectedOutput { component: ComponentId, time: SimTime },

    #[error("output from {component} carries time {actual}, expected {expected}")]
    TimeMismatch {
        component: ComponentId,
        expected: SimTime,
        actual: SimTime,
    },

    #[error("delivery to {component} after it was already updated this tick")]
    StaleDelivery { component: ComponentId },

    #[error("simulated time moved backwards: {requested} < {previous}")]
    TimeReversal { previous: SimTime, requested: SimTime },

    #[error("component {component} requested a wake-up at {requested}, before the current time {now}")]
    WakeupInPast {
        component: ComponentId,
        requested: SimTime,
        now: SimTime,
    },
}

/// State interface failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("topic {0} is closed")]
    Closed(String),

    #[error("publish to {topic} failed after {attempts} attempts")]
    PublishFailed { topic: String, attempts: u32 },
}

/// The top-level runtime error produced by a running scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Ordering(#[from] OrderingError),

    #[error("no output within {timeout:?} from: {}", .pending.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", "))]
    ComponentTimeout {
        pending: Vec<ComponentId>,
        timeout: Duration,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("component {component} failed: {message}")]
    Component { component: ComponentId, message: String },

    #[error("unknown component in wake set: {0}")]
    UnknownComponent(ComponentId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_members() {
        let err = ConfigError::CycleDetected {
            members: vec![ComponentId::new("a"), ComponentId::new("b")],
        };
        let text = err.to_string();
        assert!(text.contains("a"));
        assert!(text.contains("b"));
    }

    #[test]
    fn test_timeout_error_names_pending() {
        let err = SchedulerError::ComponentTimeout {
            pending: vec![ComponentId::new("pump")],
            timeout: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("pump"));
    }

    #[test]
    fn test_ordering_folds_into_scheduler_error() {
        let err: SchedulerError = OrderingError::TimeReversal {
            previous: 10,
            requested: 5,
        }
        .into();
        assert!(matches!(err, SchedulerError::Ordering(_)));
    }
}
