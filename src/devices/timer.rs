//! Periodic self-waking devices.

use crossbeam_channel::{Receiver, Sender};

use crate::component::{Device, DeviceUpdate};
use crate::types::{SimTime, State};

/// A device with no wires at all: it asks to be woken every `period`
/// nanoseconds, forever.
#[derive(Debug)]
pub struct Metronome {
    period: SimTime,
    beats: u64,
    probe: Option<Sender<SimTime>>,
}

impl Metronome {
    /// Creates a metronome with the given period.
    pub fn new(period: SimTime) -> Self {
        Self {
            period,
            beats: 0,
            probe: None,
        }
    }

    /// Creates a metronome paired with a probe receiving each beat time.
    pub fn with_probe(period: SimTime) -> (Self, Receiver<SimTime>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::with_probe_sender(period, tx), rx)
    }

    /// Creates a metronome reporting each beat to an existing channel.
    pub fn with_probe_sender(period: SimTime, probe: Sender<SimTime>) -> Self {
        let mut metronome = Self::new(period);
        metronome.probe = Some(probe);
        metronome
    }

    /// How many times the device has been updated.
    pub fn beats(&self) -> u64 {
        self.beats
    }
}

impl Device for Metronome {
    fn update(&mut self, time: SimTime, _inputs: &State) -> DeviceUpdate {
        self.beats += 1;
        if let Some(probe) = &self.probe {
            let _ = probe.send(time);
        }
        // Saturating keeps a mis-configured huge period from wrapping the
        // clock; the scheduler rejects wake-ups that go backwards.
        DeviceUpdate::new(State::new(), Some(time.saturating_add(self.period)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metronome_requests_next_beat() {
        let (mut metronome, probe) = Metronome::with_probe(10);

        let update = metronome.update(0, &State::new());
        assert_eq!(update.call_at, Some(10));
        let update = metronome.update(10, &State::new());
        assert_eq!(update.call_at, Some(20));

        assert_eq!(metronome.beats(), 2);
        assert_eq!(probe.try_iter().collect::<Vec<_>>(), vec![0, 10]);
    }
}
