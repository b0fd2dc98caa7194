use embedded_hal::delay::DelayNs;
use thiserror::Error;

use crate::{
    config::SensorMap,
    error::BusError,
    onewire::{SensorIdentity, TemperatureBus},
};

/// Worst-case 12-bit conversion latency of the sensors.
pub const CONVERSION_WAIT_MS: u32 = 750;

/// Isolated readings in this band are a known disconnect artefact, not a temperature.
const GLITCH_BAND_C: core::ops::RangeInclusive<f32> = -0.07..=-0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorRole {
    Ambient,
    Coil,
    Outlet,
}

impl SensorRole {
    pub const ALL: [Self; 3] = [Self::Ambient, Self::Coil, Self::Outlet];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ambient => "ambient",
            Self::Coil => "coil",
            Self::Outlet => "outlet",
        }
    }

    pub fn identity(self, sensors: &SensorMap) -> SensorIdentity {
        match self {
            Self::Ambient => sensors.ambient,
            Self::Coil => sensors.coil,
            Self::Outlet => sensors.outlet,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ReadError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("discarded glitch reading {0:.4}C")]
    Glitch(f32),
}

/// Outcome of one acquisition round. Each role fails independently.
#[derive(Debug, Clone, PartialEq)]
pub struct Readings {
    pub ambient: Result<f32, ReadError>,
    pub coil: Result<f32, ReadError>,
    pub outlet: Result<f32, ReadError>,
}

impl Readings {
    pub fn get(&self, role: SensorRole) -> &Result<f32, ReadError> {
        match role {
            SensorRole::Ambient => &self.ambient,
            SensorRole::Coil => &self.coil,
            SensorRole::Outlet => &self.outlet,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SensorRole, &Result<f32, ReadError>)> {
        SensorRole::ALL.into_iter().map(|role| (role, self.get(role)))
    }
}

pub fn is_glitch(celsius: f32) -> bool {
    GLITCH_BAND_C.contains(&celsius)
}

/// Broadcast convert, wait, then read each known identity.
///
/// Owned by the control unit; nothing else touches the bus.
pub struct TemperatureAcquisition<B, W> {
    bus: B,
    wait: W,
    sensors: SensorMap,
}

impl<B, W> TemperatureAcquisition<B, W>
where
    B: TemperatureBus,
    W: DelayNs,
{
    pub fn new(bus: B, wait: W, sensors: SensorMap) -> Self {
        Self { bus, wait, sensors }
    }

    pub fn sensors(&self) -> &SensorMap {
        &self.sensors
    }

    /// Fails as a whole only when the convert broadcast finds no device at all.
    pub fn acquire(&mut self) -> Result<Readings, BusError> {
        self.bus.broadcast_convert()?;
        self.wait.delay_ms(CONVERSION_WAIT_MS);

        Ok(Readings {
            ambient: self.read_role(SensorRole::Ambient),
            coil: self.read_role(SensorRole::Coil),
            outlet: self.read_role(SensorRole::Outlet),
        })
    }

    fn read_role(&mut self, role: SensorRole) -> Result<f32, ReadError> {
        let identity = role.identity(&self.sensors);
        let celsius = self.bus.read_device(&identity)?;
        if is_glitch(celsius) {
            return Err(ReadError::Glitch(celsius));
        }
        Ok(celsius)
    }
}
