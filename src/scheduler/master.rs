//! The master scheduler: top-level owner of simulated time.

use std::collections::{BTreeSet, HashMap};

use crate::error::{SchedulerError, TransportError};
use crate::router::EventRouter;
use crate::scheduler::{SchedulerCore, SchedulerOptions, SchedulerStats};
use crate::state::StateInterface;
use crate::ticker::TickSummary;
use crate::types::{ComponentId, SimTime, State};

/// Drives a top-level simulation: owns the wake queue, advances simulated
/// time to the earliest due wake-up, and invokes the ticker.
///
/// # Example
///
/// ```ignore
/// let mut master = MasterScheduler::new(router, &bus, initial_inputs, &options)?;
/// master.run_initial_tick()?;        // time 0, every component
/// while master.step()?.is_some() {}  // until the wake queue is exhausted
/// master.shutdown()?;
/// ```
pub struct MasterScheduler {
    core: SchedulerCore,
    last_time: Option<SimTime>,
    started: bool,
    stopped: bool,
}

impl MasterScheduler {
    /// Creates a master scheduler over a routed wiring and a state
    /// interface, seeding the inputs buffer with the configured initial
    /// inputs.
    pub fn new(
        router: EventRouter,
        bus: &dyn StateInterface,
        initial_inputs: HashMap<ComponentId, State>,
        options: &SchedulerOptions,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            core: SchedulerCore::new(router, bus, initial_inputs, options)?,
            last_time: None,
            started: false,
            stopped: false,
        })
    }

    /// The simulated time of the most recent tick.
    pub fn time(&self) -> SimTime {
        self.last_time.unwrap_or(0)
    }

    /// The earliest outstanding wake-up time, if any.
    pub fn next_wake_time(&self) -> Option<SimTime> {
        self.core.wakeups.next_time()
    }

    /// All components driven by this scheduler.
    pub fn components(&self) -> &BTreeSet<ComponentId> {
        self.core.components()
    }

    /// The persisted input values of one component.
    pub fn current_inputs(&self, component: &ComponentId) -> Option<&State> {
        self.core.inputs.get(component)
    }

    /// Counters collected so far.
    pub fn stats(&self) -> &SchedulerStats {
        &self.core.stats
    }

    /// Schedules a wake-up for `component` at `when`, superseding any
    /// outstanding request.
    pub fn add_wakeup(&mut self, component: ComponentId, when: SimTime) {
        self.core.wakeups.push(component, when);
    }

    /// Performs the startup tick: at time 0 every component receives an
    /// input carrying its configured initial values and returns its initial
    /// output, establishing initial wire values and wake-up requests.
    pub fn run_initial_tick(&mut self) -> Result<TickSummary, SchedulerError> {
        let wake = self.core.components().clone();
        let summary = self.core.do_tick(0, &wake)?;
        self.last_time = Some(0);
        self.started = true;
        Ok(summary)
    }

    /// Advances to the next wake-up and performs one tick.
    ///
    /// The wake set is every component whose scheduled time is due, plus
    /// any component with a pending interrupt (interrupts are served at the
    /// current simulated time, without advancing it). Runs the startup tick
    /// first if it has not happened yet. Returns `Ok(None)` once the wake
    /// queue is exhausted and no interrupt is pending.
    pub fn step(&mut self) -> Result<Option<TickSummary>, SchedulerError> {
        if !self.started {
            return self.run_initial_tick().map(Some);
        }
        self.core.drain_messages()?;

        let now = self.time();
        let interrupts = self.core.take_interrupts();
        let (time, wake) = if interrupts.is_empty() {
            match self.core.wakeups.next_time() {
                None => return Ok(None),
                Some(due) => (due, self.core.wakeups.pop_due(due)),
            }
        } else {
            let mut wake = interrupts;
            wake.extend(self.core.wakeups.pop_due(now));
            (now, wake)
        };

        let summary = self.core.do_tick(time, &wake)?;
        self.last_time = Some(time);
        Ok(Some(summary))
    }

    /// Runs until the wake queue is exhausted, then shuts down.
    pub fn run(&mut self) -> Result<(), SchedulerError> {
        loop {
            match self.step() {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    self.shutdown()?;
                    return Ok(());
                }
                Err(error) => {
                    // Best effort: let components release their resources.
                    let _ = self.shutdown();
                    return Err(error);
                }
            }
        }
    }

    /// Runs every tick due at or before `max_time`, leaving later wake-ups
    /// queued.
    pub fn run_until(&mut self, max_time: SimTime) -> Result<(), SchedulerError> {
        if !self.started {
            self.run_initial_tick()?;
        }
        loop {
            self.core.drain_messages()?;
            let due_interrupt = !self.core.interrupts.lock().is_empty();
            let due_wakeup = self
                .core
                .wakeups
                .next_time()
                .is_some_and(|t| t <= max_time);
            if !due_interrupt && !due_wakeup {
                return Ok(());
            }
            self.step()?;
        }
    }

    /// Broadcasts the terminal stop message. Idempotent.
    pub fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if !self.stopped {
            tracing::debug!("master scheduler shutting down");
            self.core.broadcast_stop()?;
            self.stopped = true;
        }
        Ok(())
    }
}
