//! Relay outputs for the compressor and the three fan-speed windings.
//!
//! At most one fan winding is ever energized: a speed change releases all three,
//! waits for the contacts to open, and only then closes the new one. The
//! compressor is released before the fan changes and energized after the fan runs.

use std::sync::Arc;

use embedded_hal::{delay::DelayNs, digital::OutputPin};
use log::debug;
use parking_lot::Mutex;

use crate::{
    config::{RelayConfig, RelayPolarity},
    error::ActuatorError,
    types::{ActuatorCommand, FanSpeed},
};

pub trait Actuators: Send {
    fn apply(&mut self, command: ActuatorCommand) -> Result<(), ActuatorError>;
}

struct Outputs {
    actuators: Box<dyn Actuators>,
    applied_seq: u64,
}

/// Actuator access shared by the control and command units. Separate from the
/// state lock so relay settling never extends a state critical section.
///
/// Every write carries the stamp from [`SystemState::next_decision`]; a write
/// older than the last one applied is dropped, so a decision superseded while
/// its unit was between the two locks never reaches the relays.
///
/// [`SystemState::next_decision`]: crate::state::SystemState::next_decision
#[derive(Clone)]
pub struct ActuatorHandle {
    inner: Arc<Mutex<Outputs>>,
}

impl ActuatorHandle {
    pub fn new(actuators: impl Actuators + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Outputs {
                actuators: Box::new(actuators),
                applied_seq: 0,
            })),
        }
    }

    /// Returns `Ok(false)` when `seq` was superseded and nothing was written.
    pub fn apply(&self, seq: u64, command: ActuatorCommand) -> Result<bool, ActuatorError> {
        let mut outputs = self.inner.lock();
        if seq <= outputs.applied_seq {
            debug!("dropping superseded actuator decision {seq}");
            return Ok(false);
        }
        outputs.applied_seq = seq;
        outputs.actuators.apply(command).map(|()| true)
    }
}

pub struct RelayPins<P> {
    pub compressor: P,
    pub fan_low: P,
    pub fan_medium: P,
    pub fan_high: P,
}

pub struct ActuatorInterlock<P, D> {
    pins: RelayPins<P>,
    delay: D,
    relays: RelayConfig,
    current: ActuatorCommand,
}

impl<P, D> ActuatorInterlock<P, D>
where
    P: OutputPin,
    D: DelayNs,
{
    /// Takes the pins and drives every relay to released.
    pub fn new(pins: RelayPins<P>, delay: D, relays: RelayConfig) -> Result<Self, ActuatorError> {
        let mut interlock = Self {
            pins,
            delay,
            relays,
            current: ActuatorCommand::ALL_OFF,
        };
        let polarity = interlock.relays.polarity;
        drive(&mut interlock.pins.compressor, polarity, false)?;
        interlock.release_fan()?;
        Ok(interlock)
    }

    pub fn current(&self) -> ActuatorCommand {
        self.current
    }

    fn set_compressor(&mut self, on: bool) -> Result<(), ActuatorError> {
        if self.current.compressor == on {
            return Ok(());
        }
        drive(&mut self.pins.compressor, self.relays.polarity, on)?;
        self.current.compressor = on;
        debug!("compressor relay {}", if on { "closed" } else { "open" });
        Ok(())
    }

    fn set_fan(&mut self, fan: FanSpeed) -> Result<(), ActuatorError> {
        if self.current.fan == fan {
            return Ok(());
        }
        let was_running = self.current.fan != FanSpeed::Off;
        self.release_fan()?;

        let polarity = self.relays.polarity;
        let winding = match fan {
            FanSpeed::Off => return Ok(()),
            FanSpeed::Low => &mut self.pins.fan_low,
            FanSpeed::Medium => &mut self.pins.fan_medium,
            FanSpeed::High => &mut self.pins.fan_high,
        };
        if was_running {
            self.delay.delay_ms(self.relays.fan_settle_ms);
        }
        drive(winding, polarity, true)?;
        self.current.fan = fan;
        debug!("fan relay at level {}", fan.level());
        Ok(())
    }

    fn release_fan(&mut self) -> Result<(), ActuatorError> {
        let polarity = self.relays.polarity;
        drive(&mut self.pins.fan_low, polarity, false)?;
        drive(&mut self.pins.fan_medium, polarity, false)?;
        drive(&mut self.pins.fan_high, polarity, false)?;
        self.current.fan = FanSpeed::Off;
        Ok(())
    }
}

impl<P, D> Actuators for ActuatorInterlock<P, D>
where
    P: OutputPin + Send,
    D: DelayNs + Send,
{
    fn apply(&mut self, command: ActuatorCommand) -> Result<(), ActuatorError> {
        if command == self.current {
            return Ok(());
        }
        if command.compressor {
            self.set_fan(command.fan)?;
            self.set_compressor(true)
        } else {
            self.set_compressor(false)?;
            self.set_fan(command.fan)
        }
    }
}

fn drive<P: OutputPin>(
    pin: &mut P,
    polarity: RelayPolarity,
    energized: bool,
) -> Result<(), ActuatorError> {
    let result = if polarity.level(energized) {
        pin.set_high()
    } else {
        pin.set_low()
    };
    result.map_err(|_| ActuatorError::Pin)
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::{mock::*, *};

    fn interlock(bench: &Bench) -> ActuatorInterlock<RecordingPin, BenchDelay> {
        let interlock =
            ActuatorInterlock::new(bench.pins(), bench.delay(), RelayConfig::default()).unwrap();
        bench.take();
        interlock
    }

    fn energized(edges: &[Edge], polarity: RelayPolarity) -> Vec<(&'static str, bool)> {
        edges
            .iter()
            .map(|edge| (edge.line, edge.high == polarity.level(true)))
            .collect()
    }

    #[test]
    fn new_releases_every_relay() {
        let bench = Bench::default();
        ActuatorInterlock::new(bench.pins(), bench.delay(), RelayConfig::default()).unwrap();

        let edges = bench.take();
        assert_eq!(edges.len(), 4);
        assert!(edges.iter().all(|edge| edge.high), "active-low relays idle high");
    }

    #[test]
    fn compressor_closes_after_fan_is_running() {
        let bench = Bench::default();
        let mut interlock = interlock(&bench);

        interlock
            .apply(ActuatorCommand {
                compressor: true,
                fan: FanSpeed::Medium,
            })
            .unwrap();

        let sequence: Vec<_> = energized(&bench.take(), RelayPolarity::ActiveLow)
            .into_iter()
            .filter(|(_, on)| *on)
            .collect();
        assert_eq!(sequence, vec![("fan_medium", true), ("compressor", true)]);
    }

    #[test]
    fn speed_change_breaks_before_make() {
        let bench = Bench::default();
        let mut interlock = interlock(&bench);
        let running = ActuatorCommand {
            compressor: true,
            fan: FanSpeed::Low,
        };
        interlock.apply(running).unwrap();
        bench.take();

        interlock
            .apply(ActuatorCommand {
                fan: FanSpeed::High,
                ..running
            })
            .unwrap();

        let edges = bench.take();
        let release = edges
            .iter()
            .find(|edge| edge.line == "fan_low" && edge.high)
            .unwrap();
        let make = edges
            .iter()
            .find(|edge| edge.line == "fan_high" && !edge.high)
            .unwrap();
        assert!(make.at_ns - release.at_ns >= 50_000_000);
        assert!(edges.iter().all(|edge| edge.line != "compressor"));
    }

    #[test]
    fn never_two_fan_windings_at_once() {
        let bench = Bench::default();
        let mut interlock = interlock(&bench);
        let speeds = [
            FanSpeed::Low,
            FanSpeed::High,
            FanSpeed::Medium,
            FanSpeed::Off,
            FanSpeed::High,
            FanSpeed::Low,
        ];

        let mut levels: HashMap<&'static str, bool> = HashMap::new();
        for fan in speeds {
            interlock
                .apply(ActuatorCommand {
                    compressor: fan != FanSpeed::Off,
                    fan,
                })
                .unwrap();
            for (line, on) in energized(&bench.take(), RelayPolarity::ActiveLow) {
                levels.insert(line, on);
                let windings = ["fan_low", "fan_medium", "fan_high"]
                    .iter()
                    .filter(|name| levels.get(*name).copied().unwrap_or(false))
                    .count();
                assert!(windings <= 1);
            }
        }
    }

    #[test]
    fn stopping_opens_compressor_before_fan() {
        let bench = Bench::default();
        let mut interlock = interlock(&bench);
        interlock
            .apply(ActuatorCommand {
                compressor: true,
                fan: FanSpeed::Medium,
            })
            .unwrap();
        bench.take();

        interlock.apply(ActuatorCommand::ALL_OFF).unwrap();

        let edges = bench.take();
        assert_eq!(edges[0].line, "compressor");
        assert!(edges[0].high);
        assert_eq!(interlock.current(), ActuatorCommand::ALL_OFF);
    }

    #[test]
    fn unchanged_command_writes_nothing() {
        let bench = Bench::default();
        let mut interlock = interlock(&bench);
        let command = ActuatorCommand {
            compressor: false,
            fan: FanSpeed::Low,
        };
        interlock.apply(command).unwrap();
        bench.take();

        interlock.apply(command).unwrap();

        assert!(bench.take().is_empty());
    }

    #[test]
    fn active_high_polarity_energizes_high() {
        let bench = Bench::default();
        let relays = RelayConfig {
            polarity: RelayPolarity::ActiveHigh,
            ..RelayConfig::default()
        };
        let mut interlock = ActuatorInterlock::new(bench.pins(), bench.delay(), relays).unwrap();
        assert!(bench.take().iter().all(|edge| !edge.high));

        interlock
            .apply(ActuatorCommand {
                compressor: false,
                fan: FanSpeed::Low,
            })
            .unwrap();

        let edges = bench.take();
        let low = edges.iter().rev().find(|edge| edge.line == "fan_low").unwrap();
        assert!(low.high);
    }

    #[test]
    fn handle_shares_one_interlock() {
        let bench = Bench::default();
        let handle = ActuatorHandle::new(interlock(&bench));
        let other = handle.clone();

        other
            .apply(
                1,
                ActuatorCommand {
                    compressor: false,
                    fan: FanSpeed::High,
                },
            )
            .unwrap();
        handle
            .apply(
                2,
                ActuatorCommand {
                    compressor: false,
                    fan: FanSpeed::High,
                },
            )
            .unwrap();

        let makes = bench
            .take()
            .into_iter()
            .filter(|edge| edge.line == "fan_high" && !edge.high)
            .count();
        assert_eq!(makes, 1);
    }

    #[test]
    fn superseded_decision_is_dropped() {
        let bench = Bench::default();
        let handle = ActuatorHandle::new(interlock(&bench));

        assert!(handle.apply(2, ActuatorCommand::ALL_OFF).unwrap());
        let stale = handle
            .apply(
                1,
                ActuatorCommand {
                    compressor: true,
                    fan: FanSpeed::Medium,
                },
            )
            .unwrap();

        assert!(!stale);
        assert!(bench.take().is_empty());
        assert!(handle
            .apply(
                3,
                ActuatorCommand {
                    compressor: false,
                    fan: FanSpeed::Low,
                },
            )
            .unwrap());
    }
}
