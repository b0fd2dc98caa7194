//! Windowed RMS metering of the mains voltage and compressor current.
//!
//! RMS is taken as the standard deviation of the raw samples, which removes the ADC
//! bias point without a separate offset constant.

use crate::{config::MeterConfig, error::MeterError};

/// One raw conversion from each of the voltage and current channels.
pub trait AnalogSampler {
    fn sample(&mut self) -> Result<(f32, f32), MeterError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RmsAccumulator {
    count: u64,
    sum: f64,
    sum_sq: f64,
}

impl RmsAccumulator {
    pub fn push(&mut self, raw: f32) {
        let raw = f64::from(raw);
        self.count += 1;
        self.sum += raw;
        self.sum_sq += raw * raw;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn rms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        let mean_sq = self.sum_sq / n;
        (mean_sq - mean * mean).max(0.0).sqrt()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerReading {
    pub volts: f32,
    pub amps: f32,
    /// `volts * amps * power_factor`; the power factor is a configured estimate.
    pub watts: f32,
}

#[derive(Debug, Clone)]
pub struct PowerMeter {
    config: MeterConfig,
}

impl PowerMeter {
    pub fn new(mut config: MeterConfig) -> Self {
        config.sanitize();
        Self { config }
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Samples both channels back to back until the window has elapsed.
    ///
    /// `now_us` is a monotonic microsecond clock.
    pub fn measure<S, C>(&self, sampler: &mut S, mut now_us: C) -> Result<PowerReading, MeterError>
    where
        S: AnalogSampler,
        C: FnMut() -> u64,
    {
        let window_us = self.config.window_ms.saturating_mul(1_000);
        let mut voltage = RmsAccumulator::default();
        let mut current = RmsAccumulator::default();

        let start = now_us();
        loop {
            let (v_raw, i_raw) = sampler.sample()?;
            voltage.push(v_raw);
            current.push(i_raw);
            if now_us().saturating_sub(start) >= window_us {
                break;
            }
        }

        Ok(self.reading_from(&voltage, &current))
    }

    pub fn reading_from(&self, voltage: &RmsAccumulator, current: &RmsAccumulator) -> PowerReading {
        let volts = snap(voltage.rms(), self.config.voltage_noise_floor) * self.config.voltage_scale;
        let amps = snap(current.rms(), self.config.current_noise_floor) * self.config.current_scale;

        PowerReading {
            volts,
            amps,
            watts: volts * amps * self.config.power_factor,
        }
    }
}

fn snap(raw_rms: f64, noise_floor: f32) -> f32 {
    let raw_rms = raw_rms as f32;
    if raw_rms < noise_floor {
        0.0
    } else {
        raw_rms
    }
}
