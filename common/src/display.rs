use std::time::Duration;

use log::warn;
use serde::Serialize;

use crate::{
    state::SharedState,
    types::{ControlState, FanSpeed, Mode},
};

pub const DISPLAY_COLUMNS: usize = 16;

/// What the panel shows, copied out of the shared state in one short lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplaySnapshot {
    pub ambient: f32,
    pub coil: f32,
    pub outlet: f32,
    pub volts: f32,
    pub amps: f32,
    pub watts: f32,
    pub setpoint: f32,
    pub system_on: bool,
    pub mode: Mode,
    pub fan: FanSpeed,
    pub compressor: bool,
    pub state: ControlState,
    pub freeze: bool,
    pub protection_wait: bool,
}

impl DisplaySnapshot {
    /// Two fixed-width lines for a 16x2 character panel.
    pub fn lines(&self) -> [String; 2] {
        let mode = match self.mode {
            Mode::Off => "OF",
            Mode::Cool => "CL",
            Mode::Fan => "FN",
        };
        let top = format!("{:>5.1}C SP{:>4.1} {mode}", self.ambient, self.setpoint);

        let bottom = if self.freeze {
            format!("FREEZE coil{:>5.1}", self.coil)
        } else if !self.system_on {
            format!("STANDBY {:>7.0}W", self.watts)
        } else if self.protection_wait {
            "SHORT-CYCLE WAIT".to_string()
        } else {
            format!("{:>3.0}V {:>4.1}A {:>4.0}W", self.volts, self.amps, self.watts)
        };

        [fit(top), fit(bottom)]
    }
}

fn fit(mut line: String) -> String {
    if line.chars().count() > DISPLAY_COLUMNS {
        line = line.chars().take(DISPLAY_COLUMNS).collect();
    }
    format!("{line:<DISPLAY_COLUMNS$}")
}

/// Display-side view of the shared state: on lock contention the last frame stays up.
#[derive(Debug)]
pub struct DisplayFeed {
    shared: SharedState,
    lock_timeout: Duration,
    last: Option<DisplaySnapshot>,
}

impl DisplayFeed {
    pub fn new(shared: SharedState, lock_timeout: Duration) -> Self {
        Self {
            shared,
            lock_timeout,
            last: None,
        }
    }

    pub fn refresh(&mut self) -> Option<DisplaySnapshot> {
        match self
            .shared
            .with(self.lock_timeout, "display", |state| state.display_snapshot())
        {
            Ok(snapshot) => self.last = Some(snapshot),
            Err(err) => warn!("display keeps previous frame: {err}"),
        }
        self.last
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::Configuration, state::SystemState};

    fn running_snapshot() -> DisplaySnapshot {
        let mut state = SystemState::new(Configuration {
            system_on: true,
            ..Configuration::default()
        });
        state.t_amb = 26.0;
        state.volt = 229.6;
        state.amp = 4.3;
        state.watt = 829.4;
        state.display_snapshot()
    }

    #[test]
    fn renders_two_full_width_lines() {
        let [top, bottom] = running_snapshot().lines();

        assert_eq!(top, " 26.0C SP24.0 CL");
        assert_eq!(bottom, "230V  4.3A  829W");
    }

    #[test]
    fn freeze_takes_over_the_bottom_line() {
        let mut snapshot = running_snapshot();
        snapshot.freeze = true;
        snapshot.coil = -1.5;

        assert_eq!(snapshot.lines()[1], "FREEZE coil -1.5");
    }

    #[test]
    fn oversized_values_never_overflow_the_panel() {
        let mut snapshot = running_snapshot();
        snapshot.ambient = -123.4;
        snapshot.watts = 123_456.0;

        for line in snapshot.lines() {
            assert_eq!(line.chars().count(), DISPLAY_COLUMNS);
        }
    }

    #[test]
    fn feed_keeps_last_frame_when_lock_is_busy() {
        let shared = SharedState::new(SystemState::new(Configuration::default()));
        let mut feed = DisplayFeed::new(shared.clone(), Duration::from_millis(5));

        let first = feed.refresh();
        assert!(first.is_some());

        let _guard = shared.lock_for(Duration::from_millis(5), "test").unwrap();
        assert_eq!(feed.refresh(), first);
    }
}
