use std::{sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::{
    config::{clamp_setpoint, Configuration},
    control::ClimateEngine,
    error::{CoreError, ProtocolError, PublishError},
    interlock::ActuatorHandle,
    state::SharedState,
    storage::{self, ConfigStore},
    topics::{MAX_COMMAND_BYTES, TOPIC_STATUS, TOPIC_TELEMETRY},
    types::{ActuatorCommand, FanSpeed, Mode, StatusPayload, TelemetryPayload},
};

/// Outbound message sink. Implementations are shared between units.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), PublishError>;
}

/// Telemetry and status go out as two independent messages.
pub fn publish_state(
    publisher: &dyn Publisher,
    telemetry: &TelemetryPayload,
    status: &StatusPayload,
) -> Result<(), PublishError> {
    publisher.publish(TOPIC_TELEMETRY, &serde_json::to_vec(telemetry)?, false)?;
    publisher.publish(TOPIC_STATUS, &serde_json::to_vec(status)?, true)
}

/// Validated fields of one inbound command. Absent or invalid fields stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfigCommand {
    pub on: Option<bool>,
    pub fan: Option<FanSpeed>,
    pub sp: Option<f32>,
    pub mode: Option<Mode>,
}

impl ConfigCommand {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_COMMAND_BYTES {
            return Err(ProtocolError::TooLarge(payload.len()));
        }
        let Value::Object(fields) = serde_json::from_slice::<Value>(payload)? else {
            return Err(ProtocolError::NotAnObject);
        };

        Ok(Self {
            on: fields.get("on").and_then(Value::as_bool),
            fan: fields
                .get("fan")
                .and_then(Value::as_i64)
                .and_then(FanSpeed::from_level),
            sp: fields
                .get("sp")
                .and_then(Value::as_f64)
                .map(|sp| clamp_setpoint(sp as f32)),
            mode: fields.get("mode").and_then(parse_mode),
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, cfg: &mut Configuration) {
        if let Some(on) = self.on {
            cfg.system_on = on;
        }
        if let Some(fan) = self.fan {
            cfg.fan_speed = fan;
        }
        if let Some(sp) = self.sp {
            cfg.setpoint = sp;
        }
        if let Some(mode) = self.mode {
            cfg.mode = mode;
        }
    }
}

fn parse_mode(value: &Value) -> Option<Mode> {
    match value {
        Value::Number(code) => code.as_i64().and_then(Mode::from_code),
        Value::String(name) => match name.to_ascii_uppercase().as_str() {
            "OFF" => Some(Mode::Off),
            "COOL" => Some(Mode::Cool),
            "FAN" => Some(Mode::Fan),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigUpdate {
    Command(ConfigCommand),
    /// Physical power button.
    TogglePower,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandReport {
    pub cfg: Configuration,
    pub actuators: ActuatorCommand,
    pub persisted: bool,
    pub published: bool,
}

/// Apply, persist, actuate, publish. One instance, owned by the command unit.
pub struct CommandHandler {
    shared: SharedState,
    engine: ClimateEngine,
    store: Box<dyn ConfigStore>,
    actuators: ActuatorHandle,
    publisher: Arc<dyn Publisher>,
    lock_timeout: Duration,
}

impl CommandHandler {
    pub fn new(
        shared: SharedState,
        engine: ClimateEngine,
        store: Box<dyn ConfigStore>,
        actuators: ActuatorHandle,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let lock_timeout = Duration::from_millis(engine.config().lock_timeout_ms);
        Self {
            shared,
            engine,
            store,
            actuators,
            publisher,
            lock_timeout,
        }
    }

    /// Parses and executes one raw broker payload.
    pub fn handle(&mut self, payload: &[u8], now_ms: u64) -> Result<CommandReport, CoreError> {
        let command = ConfigCommand::parse(payload).inspect_err(|err| {
            warn!("dropping command: {err}");
        })?;
        if command.is_empty() {
            debug!("command carried no valid fields, republishing state");
        }
        self.execute(ConfigUpdate::Command(command), now_ms)
    }

    pub fn execute(&mut self, update: ConfigUpdate, now_ms: u64) -> Result<CommandReport, CoreError> {
        let (before, cfg, seq, command, telemetry, status) = {
            let mut state = self
                .shared
                .lock_for(self.lock_timeout, "command")
                .inspect_err(|err| warn!("dropping command: {err}"))?;
            let before = state.cfg;
            match update {
                ConfigUpdate::Command(command) => command.apply_to(&mut state.cfg),
                ConfigUpdate::TogglePower => state.cfg.system_on = !state.cfg.system_on,
            }
            let command = self.engine.step(&mut state, now_ms);
            let seq = state.next_decision();
            (before, state.cfg, seq, command, state.telemetry(), state.status())
        };

        if before != cfg {
            info!(
                "configuration: on={} mode={} fan={} sp={:.1}",
                cfg.system_on,
                cfg.mode.as_str(),
                cfg.fan_speed.level(),
                cfg.setpoint
            );
        }

        let persisted = before != cfg
            && match storage::persist(self.store.as_mut(), &cfg) {
                Ok(()) => true,
                Err(err) => {
                    error!("failed to persist configuration: {err}");
                    false
                }
            };

        if let Err(err) = self.actuators.apply(seq, command) {
            error!("actuator write failed: {err}");
        }

        let published = match publish_state(self.publisher.as_ref(), &telemetry, &status) {
            Ok(()) => true,
            Err(err) => {
                warn!("state publish failed: {err}");
                false
            }
        };

        Ok(CommandReport {
            cfg,
            actuators: command,
            persisted,
            published,
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{Arc, Mutex};

    use super::Publisher;
    use crate::{
        error::{ActuatorError, PublishError},
        interlock::Actuators,
        types::ActuatorCommand,
    };

    #[derive(Clone, Default)]
    pub struct RecordingPublisher {
        pub messages: Arc<Mutex<Vec<(String, Vec<u8>, bool)>>>,
    }

    impl RecordingPublisher {
        pub fn topics(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|(topic, _, _)| topic.clone())
                .collect()
        }

        pub fn last_json(&self, topic: &str) -> Option<serde_json::Value> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(t, _, _)| t == topic)
                .map(|(_, payload, _)| serde_json::from_slice(payload).unwrap())
        }
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), PublishError> {
            self.messages
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec(), retain));
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    pub struct RecordingActuators {
        pub applied: Arc<Mutex<Vec<ActuatorCommand>>>,
    }

    impl Actuators for RecordingActuators {
        fn apply(&mut self, command: ActuatorCommand) -> Result<(), ActuatorError> {
            self.applied.lock().unwrap().push(command);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::{mock::*, *};
    use crate::{
        config::ControlConfig,
        error::StorageError,
        state::SystemState,
        storage::MemoryStore,
        temperature::SensorRole,
        topics::{TOPIC_STATUS, TOPIC_TELEMETRY},
    };

    #[derive(Clone, Default)]
    struct SharedStore(Arc<parking_lot::Mutex<MemoryStore>>);

    impl ConfigStore for SharedStore {
        fn load(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
            self.0.lock().load()
        }

        fn save(&mut self, record: &[u8]) -> Result<(), StorageError> {
            self.0.lock().save(record)
        }
    }

    struct Rig {
        shared: SharedState,
        store: SharedStore,
        actuators: RecordingActuators,
        publisher: RecordingPublisher,
        handler: CommandHandler,
    }

    fn rig(state: SystemState) -> Rig {
        let shared = SharedState::new(state);
        let store = SharedStore::default();
        let actuators = RecordingActuators::default();
        let publisher = RecordingPublisher::default();
        let handler = CommandHandler::new(
            shared.clone(),
            ClimateEngine::new(ControlConfig::default()),
            Box::new(store.clone()),
            ActuatorHandle::new(actuators.clone()),
            Arc::new(publisher.clone()),
        );
        Rig {
            shared,
            store,
            actuators,
            publisher,
            handler,
        }
    }

    fn cooling(now_ms: u64) -> SystemState {
        let mut state = SystemState::new(Configuration {
            setpoint: 24.0,
            fan_speed: FanSpeed::Low,
            system_on: true,
            mode: Mode::Cool,
        });
        state.update_temperature(SensorRole::Ambient, 26.0, now_ms);
        state.update_temperature(SensorRole::Coil, 8.0, now_ms);
        state.comp_active = true;
        state
    }

    #[test]
    fn parses_valid_fields_and_ignores_the_rest() {
        let command =
            ConfigCommand::parse(br#"{"on":true,"fan":7,"sp":42.0,"mode":"cool","x":1}"#).unwrap();

        assert_eq!(
            command,
            ConfigCommand {
                on: Some(true),
                fan: None,
                sp: Some(30.0),
                mode: Some(Mode::Cool),
            }
        );
    }

    #[test]
    fn wrong_types_are_ignored_field_by_field() {
        let command = ConfigCommand::parse(br#"{"on":"yes","fan":2.5,"sp":"20","mode":2}"#).unwrap();

        assert_eq!(
            command,
            ConfigCommand {
                mode: Some(Mode::Fan),
                ..ConfigCommand::default()
            }
        );
    }

    #[test]
    fn rejects_non_objects_and_oversized_payloads() {
        assert!(matches!(
            ConfigCommand::parse(b"[1,2]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            ConfigCommand::parse(b"{not json"),
            Err(ProtocolError::Json(_))
        ));
        let huge = vec![b' '; MAX_COMMAND_BYTES + 1];
        assert!(matches!(
            ConfigCommand::parse(&huge),
            Err(ProtocolError::TooLarge(513))
        ));
    }

    #[test]
    fn fan_mode_command_stops_running_compressor() {
        let now = 400_000;
        let mut rig = rig(cooling(now));

        let report = rig.handler.handle(br#"{"mode":2,"fan":2}"#, now).unwrap();

        let expected = ActuatorCommand {
            compressor: false,
            fan: FanSpeed::Medium,
        };
        assert_eq!(report.actuators, expected);
        assert!(report.persisted);
        assert!(report.published);

        let state = rig.shared.snapshot(Duration::from_millis(10), "test").unwrap();
        assert!(!state.comp_active);
        assert_eq!(state.last_comp_stop_ms, Some(now));

        let stored = rig.store.0.lock().record.clone().unwrap();
        let stored = storage::decode(&stored).unwrap();
        assert_eq!(stored.mode, Mode::Fan);
        assert_eq!(stored.fan_speed, FanSpeed::Medium);

        assert_eq!(*rig.actuators.applied.lock().unwrap(), vec![expected]);
        assert_eq!(rig.publisher.topics(), vec![TOPIC_TELEMETRY, TOPIC_STATUS]);
        assert_eq!(
            rig.publisher.last_json(TOPIC_STATUS),
            Some(serde_json::json!({"sys_on": true, "comp": 0, "fan": 2, "mode": 2, "sp": 24.0}))
        );
    }

    #[test]
    fn unchanged_configuration_is_not_rewritten() {
        let mut rig = rig(cooling(400_000));

        let report = rig.handler.handle(br#"{"on":true}"#, 400_000).unwrap();

        assert!(!report.persisted);
        assert_eq!(rig.store.0.lock().saves, 0);
        assert!(report.published);
    }

    #[test]
    fn power_toggle_goes_through_the_same_path() {
        let mut rig = rig(cooling(400_000));

        let report = rig
            .handler
            .execute(ConfigUpdate::TogglePower, 400_000)
            .unwrap();

        assert!(!report.cfg.system_on);
        assert_eq!(report.actuators, ActuatorCommand::ALL_OFF);
        assert!(report.persisted);
    }

    #[test]
    fn busy_state_lock_drops_the_command() {
        let mut rig = rig(cooling(400_000));
        let shared = rig.shared.clone();
        let _guard = shared.lock_for(Duration::from_millis(10), "test").unwrap();

        let result = rig.handler.handle(br#"{"mode":0}"#, 400_000);

        assert!(matches!(
            result,
            Err(CoreError::LockTimeout { unit: "command" })
        ));
        assert_eq!(rig.store.0.lock().saves, 0);
        assert!(rig.actuators.applied.lock().unwrap().is_empty());
        assert!(rig.publisher.topics().is_empty());
    }
}
