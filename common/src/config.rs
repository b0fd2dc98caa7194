use serde::{Deserialize, Serialize};

use crate::{
    onewire::SensorIdentity,
    types::{FanSpeed, Mode},
};

pub const SETPOINT_MIN_C: f32 = 16.0;
pub const SETPOINT_MAX_C: f32 = 30.0;

/// User configuration that survives power cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub setpoint: f32,
    pub fan_speed: FanSpeed,
    pub system_on: bool,
    pub mode: Mode,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            setpoint: 24.0,
            fan_speed: FanSpeed::Low,
            system_on: false,
            mode: Mode::Cool,
        }
    }
}

impl Configuration {
    pub fn sanitize(&mut self) {
        self.setpoint = clamp_setpoint(self.setpoint);
    }
}

pub fn clamp_setpoint(setpoint: f32) -> f32 {
    if setpoint.is_nan() {
        return Configuration::default().setpoint;
    }
    setpoint.clamp(SETPOINT_MIN_C, SETPOINT_MAX_C)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub hysteresis_c: f32,
    pub freeze_limit_c: f32,
    pub freeze_reset_c: f32,
    pub min_compressor_rest_ms: u64,
    pub sensor_stale_timeout_ms: u64,
    pub control_period_ms: u64,
    pub lock_timeout_ms: u64,
    pub publish_interval_ms: u64,
    pub liveness_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            hysteresis_c: 1.0,
            freeze_limit_c: 0.0,
            freeze_reset_c: 10.0,
            min_compressor_rest_ms: 180_000,
            sensor_stale_timeout_ms: 30_000,
            control_period_ms: 1_000,
            lock_timeout_ms: 100,
            publish_interval_ms: 10_000,
            liveness_timeout_ms: 5_000,
        }
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        self.hysteresis_c = if self.hysteresis_c.is_finite() {
            self.hysteresis_c.clamp(0.2, 5.0)
        } else {
            defaults.hysteresis_c
        };
        let band_invalid = self.freeze_limit_c.is_nan()
            || self.freeze_reset_c.is_nan()
            || self.freeze_reset_c <= self.freeze_limit_c;
        if band_invalid {
            self.freeze_limit_c = defaults.freeze_limit_c;
            self.freeze_reset_c = defaults.freeze_reset_c;
        }
        self.control_period_ms = self.control_period_ms.max(1_000);
        self.lock_timeout_ms = self.lock_timeout_ms.clamp(10, 1_000);
        self.publish_interval_ms = self.publish_interval_ms.max(1_000);
        // The conversion wait alone takes most of a period; keep several periods of slack.
        self.liveness_timeout_ms = self
            .liveness_timeout_ms
            .max(self.control_period_ms.saturating_mul(3));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    pub window_ms: u64,
    pub voltage_scale: f32,
    pub current_scale: f32,
    pub voltage_noise_floor: f32,
    pub current_noise_floor: f32,
    /// Fixed cos(phi) for the compressor load. An approximation, not a measurement.
    pub power_factor: f32,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            window_ms: 200,
            voltage_scale: 0.75,
            current_scale: 0.04,
            voltage_noise_floor: 6.0,
            current_noise_floor: 15.0,
            power_factor: 0.85,
        }
    }
}

impl MeterConfig {
    pub fn sanitize(&mut self) {
        self.window_ms = self.window_ms.max(200);
        self.power_factor = if self.power_factor.is_finite() {
            self.power_factor.clamp(0.1, 1.0)
        } else {
            1.0
        };
        self.voltage_noise_floor = self.voltage_noise_floor.max(0.0);
        self.current_noise_floor = self.current_noise_floor.max(0.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayPolarity {
    ActiveHigh,
    ActiveLow,
}

impl RelayPolarity {
    /// Line level (true = high) that energizes or releases a relay.
    pub fn level(self, energized: bool) -> bool {
        match self {
            Self::ActiveHigh => energized,
            Self::ActiveLow => !energized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub polarity: RelayPolarity,
    pub fan_settle_ms: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            polarity: RelayPolarity::ActiveLow,
            fan_settle_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorMap {
    pub ambient: SensorIdentity,
    pub coil: SensorIdentity,
    pub outlet: SensorIdentity,
}

impl Default for SensorMap {
    fn default() -> Self {
        Self {
            ambient: SensorIdentity([0x28, 0xB5, 0x6C, 0x54, 0x00, 0x00, 0x00, 0x14]),
            coil: SensorIdentity([0x28, 0xBB, 0x88, 0xAF, 0x00, 0x00, 0x00, 0x27]),
            outlet: SensorIdentity([0x28, 0xB9, 0x31, 0x55, 0x00, 0x00, 0x00, 0x9F]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            client_id: "climate-controller".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub meter: MeterConfig,
    #[serde(default)]
    pub relays: RelayConfig,
    #[serde(default)]
    pub sensors: SensorMap,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.control.sanitize();
        self.meter.sanitize();
    }
}
