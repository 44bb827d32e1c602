//! Simulation assembly: configuration + registry → a running kernel.
//!
//! [`Simulation`] owns the state interface, the component worker threads
//! and the master scheduler, and tears everything down in order on
//! shutdown. Nested system simulations are assembled recursively, each with
//! its own in-process bus.

use std::sync::Arc;

use crate::component::{
    Component, ComponentRunner, DeviceComponent, InterruptHandle, SystemComponent,
};
use crate::config::{ComponentConfig, SimConfig, TransportConfig, SYSTEM_KIND};
use crate::error::{ConfigError, SchedulerError};
use crate::registry::ComponentRegistry;
use crate::router::EventRouter;
use crate::scheduler::{MasterScheduler, SchedulerOptions, SchedulerStats, SlaveScheduler};
use crate::state::{InternalBus, StateInterface};
use crate::ticker::TickSummary;
use crate::types::{ComponentId, SimTime, State};

/// A fully assembled simulation.
///
/// # Example
///
/// ```no_run
/// use tickit::config::SimConfig;
/// use tickit::registry::default_registry;
/// use tickit::simulation::Simulation;
///
/// let config = SimConfig::from_file("plant.yaml")?;
/// let mut simulation = Simulation::from_config(config, &default_registry())?;
/// simulation.run()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Simulation {
    master: MasterScheduler,
    runners: Vec<ComponentRunner>,
    bus: Arc<dyn StateInterface>,
    stopped: bool,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("runners", &self.runners.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl Simulation {
    /// Starts building a simulation.
    pub fn builder(config: SimConfig, registry: &ComponentRegistry) -> SimulationBuilder<'_> {
        SimulationBuilder {
            config,
            registry,
            bus: None,
        }
    }

    /// Assembles a simulation with the transport named by the
    /// configuration.
    pub fn from_config(
        config: SimConfig,
        registry: &ComponentRegistry,
    ) -> Result<Self, ConfigError> {
        Self::builder(config, registry).build()
    }

    /// The master scheduler.
    pub fn master(&self) -> &MasterScheduler {
        &self.master
    }

    /// The simulated time of the most recent tick.
    pub fn time(&self) -> SimTime {
        self.master.time()
    }

    /// The master scheduler's counters.
    pub fn stats(&self) -> &SchedulerStats {
        self.master.stats()
    }

    /// The persisted input values of one top-level component.
    pub fn current_inputs(&self, component: &ComponentId) -> Option<&State> {
        self.master.current_inputs(component)
    }

    /// Performs the startup tick at time 0.
    pub fn run_initial_tick(&mut self) -> Result<TickSummary, SchedulerError> {
        self.master.run_initial_tick()
    }

    /// Advances to the next wake-up and performs one tick.
    pub fn step(&mut self) -> Result<Option<TickSummary>, SchedulerError> {
        self.master.step()
    }

    /// Runs every tick due at or before `max_time`.
    pub fn run_until(&mut self, max_time: SimTime) -> Result<(), SchedulerError> {
        self.master.run_until(max_time)
    }

    /// Runs until the wake queue is exhausted, then shuts down.
    pub fn run(&mut self) -> Result<(), SchedulerError> {
        let result = self.master.run();
        self.shutdown_internal();
        result
    }

    /// Broadcasts the terminal stop message, joins every component thread
    /// and closes the transport. Idempotent.
    pub fn shutdown(&mut self) -> Result<(), SchedulerError> {
        let result = self.master.shutdown();
        self.shutdown_internal();
        result
    }

    fn shutdown_internal(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let _ = self.master.shutdown();
        // Closing first guarantees the joins terminate even if the stop
        // broadcast failed: a runner blocked on its consumer sees the
        // disconnect once the queued messages (the stop included) drain.
        self.bus.close();
        for runner in self.runners.drain(..) {
            runner.join();
        }
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.shutdown_internal();
    }
}

/// Assembles a [`Simulation`], optionally with a caller-supplied state
/// interface (required for external-bus transports).
pub struct SimulationBuilder<'a> {
    config: SimConfig,
    registry: &'a ComponentRegistry,
    bus: Option<Arc<dyn StateInterface>>,
}

impl SimulationBuilder<'_> {
    /// Uses `bus` instead of the transport named by the configuration.
    pub fn with_state_interface(mut self, bus: Arc<dyn StateInterface>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Validates the configuration, spawns every component and prepares the
    /// master scheduler.
    pub fn build(self) -> Result<Simulation, ConfigError> {
        self.config.validate()?;
        let options = self.config.scheduler.options();

        let bus: Arc<dyn StateInterface> = match (self.bus, &self.config.transport) {
            (Some(bus), _) => bus,
            (None, TransportConfig::Internal) => Arc::new(InternalBus::new()),
            (None, TransportConfig::Bus { .. }) => {
                return Err(ConfigError::UnsupportedTransport("bus".to_string()));
            }
        };

        // Routing the wiring before anything spawns means a bad graph
        // fails with no worker threads to tear down.
        let router = EventRouter::new(self.config.to_wiring())?;

        let mut runners = Vec::with_capacity(self.config.components.len());
        let spawn = || -> Result<MasterScheduler, ConfigError> {
            for declaration in &self.config.components {
                let component =
                    build_component(declaration, self.registry, bus.as_ref(), &options)?;
                runners.push(ComponentRunner::spawn(component, bus.as_ref())?);
            }
            Ok(MasterScheduler::new(
                router,
                bus.as_ref(),
                self.config.initial_inputs(),
                &options,
            )?)
        };
        let master = match spawn() {
            Ok(master) => master,
            Err(error) => {
                bus.close();
                for runner in runners.drain(..) {
                    runner.join();
                }
                return Err(error);
            }
        };

        Ok(Simulation {
            master,
            runners,
            bus,
            stopped: false,
        })
    }
}

/// Builds one component; system simulations recurse with a fresh
/// in-process bus per nesting level.
fn build_component(
    declaration: &ComponentConfig,
    registry: &ComponentRegistry,
    outer_bus: &dyn StateInterface,
    options: &SchedulerOptions,
) -> Result<Box<dyn Component>, ConfigError> {
    if declaration.kind == SYSTEM_KIND {
        let system = declaration
            .system
            .as_ref()
            .ok_or_else(|| ConfigError::MissingSystem(declaration.id.clone()))?;

        let inner_bus: Arc<dyn StateInterface> = Arc::new(InternalBus::new());
        let mut runners = Vec::with_capacity(system.components.len());
        for inner in &system.components {
            let component = build_component(inner, registry, inner_bus.as_ref(), options)?;
            runners.push(ComponentRunner::spawn(component, inner_bus.as_ref())?);
        }

        let slave = SlaveScheduler::new(
            system.to_wiring(),
            system.expose.clone(),
            inner_bus.as_ref(),
            system.initial_inputs(),
            options,
        )?;
        let interrupt = InterruptHandle::new(outer_bus, declaration.id.clone());
        let component = SystemComponent::new(
            declaration.id.clone(),
            slave,
            Arc::clone(&inner_bus),
            runners,
            interrupt,
        )?;
        Ok(Box::new(component))
    } else {
        let device = registry.create(&declaration.kind, &declaration.id, &declaration.params)?;
        Ok(Box::new(DeviceComponent::new(
            declaration.id.clone(),
            device,
        )))
    }
}
