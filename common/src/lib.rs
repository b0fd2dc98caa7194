pub mod config;
pub mod control;
pub mod cycle;
pub mod display;
pub mod error;
pub mod interlock;
pub mod liveness;
pub mod meter;
pub mod onewire;
pub mod panel;
pub mod protocol;
pub mod state;
pub mod storage;
pub mod temperature;
pub mod topics;
pub mod types;

pub use config::{
    Configuration, ControlConfig, MeterConfig, NetworkConfig, RelayConfig, RelayPolarity,
    RuntimeConfig, SensorMap,
};
pub use control::ClimateEngine;
pub use cycle::{ControlLoop, CycleReport};
pub use display::{DisplayFeed, DisplaySnapshot};
pub use error::{
    ActuatorError, BusError, CoreError, MeterError, ProtocolError, PublishError, StorageError,
};
pub use interlock::{ActuatorHandle, ActuatorInterlock, Actuators, RelayPins};
pub use liveness::LivenessMonitor;
pub use meter::{AnalogSampler, PowerMeter, PowerReading};
pub use onewire::{OneWireBus, SensorIdentity, SlotGuard, TemperatureBus};
pub use panel::{Debouncer, StatusLeds};
pub use protocol::{CommandHandler, CommandReport, ConfigCommand, ConfigUpdate, Publisher};
pub use state::{SharedState, SystemState};
pub use storage::ConfigStore;
pub use temperature::{ReadError, Readings, SensorRole, TemperatureAcquisition};
pub use topics::*;
pub use types::{
    ActuatorCommand, ControlState, FanSpeed, Mode, StatusPayload, TelemetryPayload,
};
