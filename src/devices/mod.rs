//! Simple device behaviours used by tests, examples and smoke simulations.
//!
//! Real device libraries live outside the kernel; these implement the same
//! [`Device`](crate::component::Device) capability with small, predictable
//! behaviours.

pub mod relay;
pub mod sink;
pub mod source;
pub mod timer;

pub use relay::Relay;
pub use sink::Sink;
pub use source::{ScheduledSource, Source};
pub use timer::Metronome;
