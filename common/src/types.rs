use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Off,
    Cool,
    Fan,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Cool => "COOL",
            Self::Fan => "FAN",
        }
    }

    /// Wire and storage encoding: 0 = OFF, 1 = COOL, 2 = FAN.
    pub fn code(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Cool => 1,
            Self::Fan => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Off),
            1 => Some(Self::Cool),
            2 => Some(Self::Fan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FanSpeed {
    Off,
    Low,
    Medium,
    High,
}

impl FanSpeed {
    pub fn level(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(Self::Off),
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    FreezeProtect,
    Cooling,
    IdleCool,
    FanOnly,
    Standby,
}

impl ControlState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FreezeProtect => "FREEZE_PROTECT",
            Self::Cooling => "COOLING",
            Self::IdleCool => "IDLE_COOL",
            Self::FanOnly => "FAN_ONLY",
            Self::Standby => "STANDBY",
        }
    }
}

/// The one output decision a control cycle (or an applied command) produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorCommand {
    pub compressor: bool,
    pub fan: FanSpeed,
}

impl ActuatorCommand {
    pub const ALL_OFF: Self = Self {
        compressor: false,
        fan: FanSpeed::Off,
    };
}

/// Raw measurements, published on the telemetry topic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub v: f32,
    pub a: f32,
    pub amb: f32,
    pub out: f32,
    pub coil: f32,
}

/// Resolved control state, published on the status topic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub sys_on: bool,
    pub comp: u8,
    pub fan: u8,
    pub mode: u8,
    pub sp: f32,
}
