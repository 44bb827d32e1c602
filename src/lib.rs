//! # Tickit Simulation Kernel
//!
//! An event-driven device-simulation framework: a directed graph of
//! user-supplied devices exchanges typed values on named wires, advanced by
//! a deterministic discrete-event kernel.
//!
//! ## Design Principles
//!
//! - **Graph-Driven**: the static wiring is the source of truth; the event
//!   router derives a dependency order in which every producer updates
//!   before its consumers.
//! - **Discrete Events**: a component is updated only when an input changes
//!   or a requested wake-up time arrives; within one tick each woken
//!   component exchanges exactly one input and one output.
//! - **Hierarchical Composition**: a whole simulation can stand in for a
//!   single component, with an embedded slave scheduler bridging wake-ups
//!   and wire values across the boundary, recursively.
//! - **Transport-Agnostic**: schedulers and components exchange messages
//!   through a pub/sub state interface; the in-process bus is the default,
//!   broker-backed buses plug in behind the same traits.

pub mod component;
pub mod config;
pub mod devices;
pub mod error;
pub mod messages;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod simulation;
pub mod state;
pub mod ticker;
pub mod types;
pub mod wake;

// Re-export commonly used types
pub use component::{Component, ComponentRunner, Device, DeviceComponent, DeviceUpdate};
pub use config::SimConfig;
pub use error::{ConfigError, OrderingError, SchedulerError, TransportError};
pub use messages::{Input, Output, StateMessage};
pub use registry::{default_registry, ComponentRegistry};
pub use router::{EventRouter, InverseWiring, Wiring};
pub use scheduler::{MasterScheduler, SchedulerOptions, SlaveScheduler};
pub use simulation::Simulation;
pub use state::{InternalBus, StateInterface};
pub use ticker::Ticker;
pub use types::{Changes, ComponentId, ComponentPort, PortId, SimTime, State, Value};
pub use wake::WakeQueue;
