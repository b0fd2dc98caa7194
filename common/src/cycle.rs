use std::{sync::Arc, time::Duration};

use embedded_hal::delay::DelayNs;
use log::{error, warn};

use crate::{
    control::ClimateEngine,
    error::CoreError,
    interlock::ActuatorHandle,
    onewire::TemperatureBus,
    protocol::{publish_state, Publisher},
    state::SharedState,
    temperature::{Readings, TemperatureAcquisition},
    types::{ActuatorCommand, StatusPayload, TelemetryPayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub command: ActuatorCommand,
    pub published: bool,
}

/// Outputs resolved under the state lock, written after it is released.
struct Decision {
    seq: u64,
    command: ActuatorCommand,
    outgoing: Option<(TelemetryPayload, StatusPayload)>,
}

/// The sensor/control unit: acquire, decide under the lock, actuate outside it.
pub struct ControlLoop<B, W> {
    acquisition: TemperatureAcquisition<B, W>,
    engine: ClimateEngine,
    shared: SharedState,
    actuators: ActuatorHandle,
    publisher: Option<Arc<dyn Publisher>>,
    lock_timeout: Duration,
    last_publish_ms: Option<u64>,
}

impl<B, W> ControlLoop<B, W>
where
    B: TemperatureBus,
    W: DelayNs,
{
    pub fn new(
        acquisition: TemperatureAcquisition<B, W>,
        engine: ClimateEngine,
        shared: SharedState,
        actuators: ActuatorHandle,
    ) -> Self {
        let lock_timeout = Duration::from_millis(engine.config().lock_timeout_ms);
        Self {
            acquisition,
            engine,
            shared,
            actuators,
            publisher: None,
            lock_timeout,
            last_publish_ms: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.engine.config().control_period_ms)
    }

    /// Runs one cycle. `now_ms` is read after the conversion wait so readings are
    /// stamped with the time they were taken.
    ///
    /// A lock timeout skips the whole cycle; outputs keep their last state.
    pub fn run_cycle(&mut self, now_ms: impl FnOnce() -> u64) -> Result<CycleReport, CoreError> {
        let readings = match self.acquisition.acquire() {
            Ok(readings) => Some(readings),
            Err(err) => {
                error!("temperature bus convert failed: {err}");
                None
            }
        };
        let now = now_ms();

        let decision = self.decide(readings.as_ref(), now)?;
        if let Some(readings) = &readings {
            log_failures(readings);
        }
        Ok(self.actuate(decision, now))
    }

    fn decide(&self, readings: Option<&Readings>, now: u64) -> Result<Decision, CoreError> {
        let mut state = self
            .shared
            .lock_for(self.lock_timeout, "control")
            .inspect_err(|err| warn!("skipping control cycle: {err}"))?;
        if let Some(readings) = readings {
            for (role, reading) in readings.iter() {
                if let Ok(celsius) = reading {
                    state.update_temperature(role, *celsius, now);
                }
            }
        }
        let command = self.engine.step(&mut state, now);
        Ok(Decision {
            seq: state.next_decision(),
            command,
            outgoing: self
                .publish_due(now)
                .then(|| (state.telemetry(), state.status())),
        })
    }

    fn actuate(&mut self, decision: Decision, now: u64) -> CycleReport {
        let Decision {
            seq,
            command,
            outgoing,
        } = decision;
        if let Err(err) = self.actuators.apply(seq, command) {
            error!("actuator write failed: {err}");
        }

        let published = match (&self.publisher, outgoing) {
            (Some(publisher), Some((telemetry, status))) => {
                self.last_publish_ms = Some(now);
                publish_state(publisher.as_ref(), &telemetry, &status)
                    .inspect_err(|err| warn!("periodic publish failed: {err}"))
                    .is_ok()
            }
            _ => false,
        };

        CycleReport { command, published }
    }

    fn publish_due(&self, now_ms: u64) -> bool {
        self.publisher.is_some()
            && self.last_publish_ms.map_or(true, |last| {
                now_ms.saturating_sub(last) >= self.engine.config().publish_interval_ms
            })
    }
}

fn log_failures(readings: &Readings) {
    for (role, reading) in readings.iter() {
        if let Err(err) = reading {
            warn!("{} sensor read failed, keeping last value: {err}", role.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::{Configuration, ControlConfig, SensorMap},
        error::BusError,
        onewire::SensorIdentity,
        protocol::{
            mock::{RecordingActuators, RecordingPublisher},
            CommandHandler,
        },
        state::SystemState,
        storage::MemoryStore,
        topics::{TOPIC_STATUS, TOPIC_TELEMETRY},
        types::{FanSpeed, Mode},
    };

    #[derive(Clone, Default)]
    struct ScriptedBus {
        values: Arc<parking_lot::Mutex<HashMap<SensorIdentity, Result<f32, BusError>>>>,
    }

    impl ScriptedBus {
        fn set(&self, identity: SensorIdentity, value: Result<f32, BusError>) {
            self.values.lock().insert(identity, value);
        }
    }

    impl TemperatureBus for ScriptedBus {
        fn broadcast_convert(&mut self) -> Result<(), BusError> {
            if self.values.lock().is_empty() {
                Err(BusError::NotFound)
            } else {
                Ok(())
            }
        }

        fn read_device(&mut self, identity: &SensorIdentity) -> Result<f32, BusError> {
            self.values
                .lock()
                .get(identity)
                .copied()
                .unwrap_or(Err(BusError::NotFound))
        }
    }

    struct NoWait;

    impl DelayNs for NoWait {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    struct Rig {
        bus: ScriptedBus,
        shared: SharedState,
        handle: ActuatorHandle,
        actuators: RecordingActuators,
        publisher: RecordingPublisher,
        control: ControlLoop<ScriptedBus, NoWait>,
    }

    fn rig(cfg: Configuration) -> Rig {
        let sensors = SensorMap::default();
        let bus = ScriptedBus::default();
        bus.set(sensors.ambient, Ok(26.0));
        bus.set(sensors.coil, Ok(8.0));
        bus.set(sensors.outlet, Ok(14.0));

        let shared = SharedState::new(SystemState::new(cfg));
        let actuators = RecordingActuators::default();
        let publisher = RecordingPublisher::default();
        let handle = ActuatorHandle::new(actuators.clone());
        let control = ControlLoop::new(
            TemperatureAcquisition::new(bus.clone(), NoWait, sensors),
            ClimateEngine::new(ControlConfig::default()),
            shared.clone(),
            handle.clone(),
        )
        .with_publisher(Arc::new(publisher.clone()));

        Rig {
            bus,
            shared,
            handle,
            actuators,
            publisher,
            control,
        }
    }

    fn cooling() -> Configuration {
        Configuration {
            setpoint: 24.0,
            fan_speed: FanSpeed::Medium,
            system_on: true,
            mode: Mode::Cool,
        }
    }

    #[test]
    fn cycle_stores_readings_and_actuates_after_unlock() {
        let mut rig = rig(cooling());

        let report = rig.control.run_cycle(|| 400_000).unwrap();

        assert_eq!(
            report.command,
            ActuatorCommand {
                compressor: true,
                fan: FanSpeed::Medium
            }
        );
        let state = rig.shared.snapshot(Duration::from_millis(10), "test").unwrap();
        assert_eq!(state.t_amb, 26.0);
        assert_eq!(state.t_out, 14.0);
        assert!(state.comp_active);
        assert_eq!(*rig.actuators.applied.lock().unwrap(), vec![report.command]);
    }

    #[test]
    fn failed_sensor_keeps_previous_value() {
        let mut rig = rig(cooling());
        rig.control.run_cycle(|| 400_000).unwrap();

        let sensors = SensorMap::default();
        rig.bus.set(sensors.ambient, Err(BusError::Checksum));
        rig.bus.set(sensors.outlet, Ok(-0.0625));
        rig.control.run_cycle(|| 401_000).unwrap();

        let state = rig.shared.snapshot(Duration::from_millis(10), "test").unwrap();
        assert_eq!(state.t_amb, 26.0);
        assert_eq!(state.t_out, 14.0);
        assert!(state.comp_active);
    }

    #[test]
    fn dead_bus_still_runs_the_state_machine() {
        let mut rig = rig(cooling());
        rig.control.run_cycle(|| 400_000).unwrap();
        rig.bus.values.lock().clear();

        let stale = 400_000 + ControlConfig::default().sensor_stale_timeout_ms;
        let report = rig.control.run_cycle(|| stale).unwrap();

        assert!(!report.command.compressor);
    }

    #[test]
    fn publishes_on_first_cycle_then_per_interval() {
        let mut rig = rig(cooling());

        assert!(rig.control.run_cycle(|| 400_000).unwrap().published);
        assert!(!rig.control.run_cycle(|| 401_000).unwrap().published);
        assert!(rig.control.run_cycle(|| 410_000).unwrap().published);

        assert_eq!(
            rig.publisher.topics(),
            vec![TOPIC_TELEMETRY, TOPIC_STATUS, TOPIC_TELEMETRY, TOPIC_STATUS]
        );
    }

    #[test]
    fn lock_timeout_skips_cycle_without_actuating() {
        let mut rig = rig(cooling());
        let shared = rig.shared.clone();
        let _guard = shared.lock_for(Duration::from_millis(10), "test").unwrap();

        let result = rig.control.run_cycle(|| 400_000);

        assert!(matches!(
            result,
            Err(CoreError::LockTimeout { unit: "control" })
        ));
        assert!(rig.actuators.applied.lock().unwrap().is_empty());
    }

    #[test]
    fn command_between_decision_and_write_wins() {
        let mut rig = rig(cooling());
        let mut handler = CommandHandler::new(
            rig.shared.clone(),
            ClimateEngine::new(ControlConfig::default()),
            Box::new(MemoryStore::default()),
            rig.handle.clone(),
            Arc::new(rig.publisher.clone()),
        );

        let readings = Readings {
            ambient: Ok(26.0),
            coil: Ok(8.0),
            outlet: Ok(14.0),
        };
        let decision = rig.control.decide(Some(&readings), 400_000).unwrap();
        assert!(decision.command.compressor);

        let report = handler.handle(br#"{"on":false}"#, 400_010).unwrap();
        assert_eq!(report.actuators, ActuatorCommand::ALL_OFF);

        rig.control.actuate(decision, 400_020);

        assert_eq!(
            *rig.actuators.applied.lock().unwrap(),
            vec![ActuatorCommand::ALL_OFF]
        );
        let state = rig.shared.snapshot(Duration::from_millis(10), "test").unwrap();
        assert!(!state.cfg.system_on);
        assert!(!state.comp_active);
    }
}
