//! Simulated plant for host builds: a room, an evaporator coil and the AC line,
//! exposed through the same seams the firmware drives real hardware with.

use std::{
    f32::consts::PI,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use climate_common::{
    error::{ActuatorError, BusError, MeterError},
    ActuatorCommand, Actuators, AnalogSampler, FanSpeed, SensorMap, SensorRole, SensorIdentity,
    TemperatureBus,
};
use embedded_hal::delay::DelayNs;
use parking_lot::Mutex;

const ADC_MIDPOINT: f32 = 2048.0;
const LINE_HZ: f32 = 50.0;
const VOLTAGE_AMPLITUDE: f32 = 434.0;
const COMPRESSOR_CURRENT_AMPLITUDE: f32 = 150.0;
const FAN_CURRENT_PER_LEVEL: f32 = 12.0;
const CURRENT_NOISE_COUNTS: f32 = 8.0;
const SAMPLE_SPACING: Duration = Duration::from_micros(100);
const MAX_STEP_S: f32 = 10.0;

#[derive(Debug)]
struct PlantModel {
    sensors: SensorMap,
    room_c: f32,
    outdoor_c: f32,
    coil_c: f32,
    relays: ActuatorCommand,
    latched: Option<[f32; 3]>,
    last_step: Instant,
    epoch: Instant,
    noise: u32,
}

impl PlantModel {
    fn advance(&mut self, dt_s: f32) {
        let dt = dt_s.clamp(0.0, MAX_STEP_S);
        let airflow = airflow(self.relays.fan);

        self.room_c += (self.outdoor_c - self.room_c) * 0.0015 * dt;
        if self.relays.compressor {
            self.room_c -= 0.012 * (0.3 + airflow) * dt;
        }

        let coil_target = if self.relays.compressor {
            self.room_c - 8.0 - 26.0 * (1.0 - airflow)
        } else {
            self.room_c
        };
        let approach = (0.05 * dt).min(1.0);
        self.coil_c += (coil_target - self.coil_c) * approach;
    }

    fn outlet_c(&self) -> f32 {
        self.coil_c + (self.room_c - self.coil_c) * 0.35
    }

    fn next_noise(&mut self) -> f32 {
        self.noise = self.noise.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        ((self.noise >> 16) as f32 / 65_535.0 - 0.5) * CURRENT_NOISE_COUNTS
    }
}

fn airflow(fan: FanSpeed) -> f32 {
    match fan {
        FanSpeed::Off => 0.0,
        FanSpeed::Low => 0.45,
        FanSpeed::Medium => 0.7,
        FanSpeed::High => 1.0,
    }
}

fn quantize(celsius: f32) -> f32 {
    (celsius * 16.0).round() / 16.0
}

#[derive(Debug, Clone)]
pub struct SimulatedPlant {
    inner: Arc<Mutex<PlantModel>>,
}

impl SimulatedPlant {
    pub fn new(sensors: SensorMap) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Mutex::new(PlantModel {
                sensors,
                room_c: 27.0,
                outdoor_c: 32.0,
                coil_c: 27.0,
                relays: ActuatorCommand::ALL_OFF,
                latched: None,
                last_step: now,
                epoch: now,
                noise: 0x2545_F491,
            })),
        }
    }

    fn step_to_now(model: &mut PlantModel) {
        let now = Instant::now();
        let dt = now.duration_since(model.last_step).as_secs_f32();
        model.last_step = now;
        model.advance(dt);
    }
}

impl TemperatureBus for SimulatedPlant {
    fn broadcast_convert(&mut self) -> Result<(), BusError> {
        let mut model = self.inner.lock();
        Self::step_to_now(&mut model);
        let latched = [
            quantize(model.room_c),
            quantize(model.coil_c),
            quantize(model.outlet_c()),
        ];
        model.latched = Some(latched);
        Ok(())
    }

    fn read_device(&mut self, identity: &SensorIdentity) -> Result<f32, BusError> {
        let model = self.inner.lock();
        let latched = model.latched.ok_or(BusError::NotFound)?;
        let index = SensorRole::ALL
            .iter()
            .position(|role| role.identity(&model.sensors) == *identity)
            .ok_or(BusError::NotFound)?;
        Ok(latched[index])
    }
}

impl AnalogSampler for SimulatedPlant {
    fn sample(&mut self) -> Result<(f32, f32), MeterError> {
        thread::sleep(SAMPLE_SPACING);
        let mut model = self.inner.lock();
        let t = model.epoch.elapsed().as_secs_f32();
        let phase = (2.0 * PI * LINE_HZ * t).sin();

        let mut amplitude = f32::from(model.relays.fan.level()) * FAN_CURRENT_PER_LEVEL;
        if model.relays.compressor {
            amplitude += COMPRESSOR_CURRENT_AMPLITUDE;
        }
        let noise = model.next_noise();

        Ok((
            ADC_MIDPOINT + VOLTAGE_AMPLITUDE * phase,
            ADC_MIDPOINT + amplitude * phase + noise,
        ))
    }
}

impl Actuators for SimulatedPlant {
    fn apply(&mut self, command: ActuatorCommand) -> Result<(), ActuatorError> {
        let mut model = self.inner.lock();
        Self::step_to_now(&mut model);
        model.relays = command;
        Ok(())
    }
}

/// Blocking delay backed by the OS scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDelay;

impl DelayNs for HostDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(u64::from(ns)));
    }
}
