//! Front panel: the power button and the two status LEDs.

use embedded_hal::digital::OutputPin;

use crate::{config::RelayPolarity, error::ActuatorError};

pub const BUTTON_POLL_MS: u64 = 50;
pub const BUTTON_CONFIRMATIONS: u8 = 3;

/// Accepts a level change only after it was sampled `required` times in a row.
#[derive(Debug, Clone)]
pub struct Debouncer {
    stable: bool,
    candidate: bool,
    count: u8,
    required: u8,
}

impl Debouncer {
    pub fn new(initial: bool, required: u8) -> Self {
        Self {
            stable: initial,
            candidate: initial,
            count: 0,
            required: required.max(1),
        }
    }

    pub fn is_pressed(&self) -> bool {
        self.stable
    }

    /// Feeds one raw sample (`true` = pressed). Returns the new level on a
    /// confirmed change.
    pub fn update(&mut self, pressed: bool) -> Option<bool> {
        if pressed == self.stable {
            self.candidate = pressed;
            self.count = 0;
            return None;
        }
        if pressed != self.candidate {
            self.candidate = pressed;
            self.count = 0;
        }
        self.count += 1;
        if self.count >= self.required {
            self.stable = pressed;
            self.count = 0;
            return Some(pressed);
        }
        None
    }

    /// True exactly once per confirmed press.
    pub fn pressed_edge(&mut self, pressed: bool) -> bool {
        self.update(pressed) == Some(true)
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(false, BUTTON_CONFIRMATIONS)
    }
}

/// Green while the system is on, red while it is off.
pub struct StatusLeds<P> {
    green: P,
    red: P,
    polarity: RelayPolarity,
    shown: Option<bool>,
}

impl<P: OutputPin> StatusLeds<P> {
    pub fn new(green: P, red: P, polarity: RelayPolarity) -> Self {
        Self {
            green,
            red,
            polarity,
            shown: None,
        }
    }

    pub fn show(&mut self, system_on: bool) -> Result<(), ActuatorError> {
        if self.shown == Some(system_on) {
            return Ok(());
        }
        set(&mut self.green, self.polarity.level(system_on))?;
        set(&mut self.red, self.polarity.level(!system_on))?;
        self.shown = Some(system_on);
        Ok(())
    }
}

fn set<P: OutputPin>(pin: &mut P, high: bool) -> Result<(), ActuatorError> {
    let result = if high { pin.set_high() } else { pin.set_low() };
    result.map_err(|_| ActuatorError::Pin)
}
