use std::{sync::Arc, time::Duration};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    config::Configuration,
    display::DisplaySnapshot,
    error::CoreError,
    meter::PowerReading,
    temperature::SensorRole,
    types::{ControlState, StatusPayload, TelemetryPayload},
};

/// Everything the execution units share. Only ever touched through [`SharedState`].
#[derive(Debug, Clone, PartialEq)]
pub struct SystemState {
    pub t_amb: f32,
    pub t_out: f32,
    pub t_coil: f32,

    pub volt: f32,
    pub amp: f32,
    pub watt: f32,

    pub cfg: Configuration,

    pub comp_active: bool,
    pub freeze_mode: bool,
    pub protection_wait: bool,
    pub control_state: ControlState,

    /// Monotonic time of the last compressor-off transition; `None` since boot.
    pub last_comp_stop_ms: Option<u64>,

    amb_updated_ms: Option<u64>,
    out_updated_ms: Option<u64>,
    coil_updated_ms: Option<u64>,

    decision_seq: u64,
}

impl SystemState {
    pub fn new(mut cfg: Configuration) -> Self {
        cfg.sanitize();
        Self {
            t_amb: 0.0,
            t_out: 0.0,
            t_coil: 0.0,
            volt: 0.0,
            amp: 0.0,
            watt: 0.0,
            cfg,
            comp_active: false,
            freeze_mode: false,
            protection_wait: false,
            control_state: ControlState::Standby,
            last_comp_stop_ms: None,
            amb_updated_ms: None,
            out_updated_ms: None,
            coil_updated_ms: None,
            decision_seq: 0,
        }
    }

    pub fn temperature(&self, role: SensorRole) -> f32 {
        match role {
            SensorRole::Ambient => self.t_amb,
            SensorRole::Coil => self.t_coil,
            SensorRole::Outlet => self.t_out,
        }
    }

    pub fn update_temperature(&mut self, role: SensorRole, celsius: f32, now_ms: u64) {
        let (slot, updated) = match role {
            SensorRole::Ambient => (&mut self.t_amb, &mut self.amb_updated_ms),
            SensorRole::Coil => (&mut self.t_coil, &mut self.coil_updated_ms),
            SensorRole::Outlet => (&mut self.t_out, &mut self.out_updated_ms),
        };
        *slot = celsius;
        *updated = Some(now_ms);
    }

    pub fn last_update_ms(&self, role: SensorRole) -> Option<u64> {
        match role {
            SensorRole::Ambient => self.amb_updated_ms,
            SensorRole::Coil => self.coil_updated_ms,
            SensorRole::Outlet => self.out_updated_ms,
        }
    }

    pub fn is_fresh(&self, role: SensorRole, now_ms: u64, stale_timeout_ms: u64) -> bool {
        self.last_update_ms(role)
            .map(|last| now_ms.saturating_sub(last) < stale_timeout_ms)
            .unwrap_or(false)
    }

    /// Stamps an actuator decision made under the state lock. Stamps only grow,
    /// so they order relay writes the same way the lock ordered the decisions.
    pub fn next_decision(&mut self) -> u64 {
        self.decision_seq += 1;
        self.decision_seq
    }

    pub fn update_power(&mut self, reading: &PowerReading) {
        self.volt = reading.volts;
        self.amp = reading.amps;
        self.watt = reading.watts;
    }

    pub fn telemetry(&self) -> TelemetryPayload {
        TelemetryPayload {
            v: self.volt,
            a: self.amp,
            amb: self.t_amb,
            out: self.t_out,
            coil: self.t_coil,
        }
    }

    pub fn status(&self) -> StatusPayload {
        StatusPayload {
            sys_on: self.cfg.system_on,
            comp: u8::from(self.comp_active),
            fan: self.cfg.fan_speed.level(),
            mode: self.cfg.mode.code(),
            sp: self.cfg.setpoint,
        }
    }

    pub fn display_snapshot(&self) -> DisplaySnapshot {
        DisplaySnapshot {
            ambient: self.t_amb,
            coil: self.t_coil,
            outlet: self.t_out,
            volts: self.volt,
            amps: self.amp,
            watts: self.watt,
            setpoint: self.cfg.setpoint,
            system_on: self.cfg.system_on,
            mode: self.cfg.mode,
            fan: self.cfg.fan_speed,
            compressor: self.comp_active,
            state: self.control_state,
            freeze: self.freeze_mode,
            protection_wait: self.protection_wait,
        }
    }
}

/// The one exclusive lock around [`SystemState`]. Every wait is bounded.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<SystemState>>,
}

impl SharedState {
    pub fn new(state: SystemState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// `unit` names the caller in the timeout error.
    pub fn lock_for(
        &self,
        timeout: Duration,
        unit: &'static str,
    ) -> Result<MutexGuard<'_, SystemState>, CoreError> {
        self.inner
            .try_lock_for(timeout)
            .ok_or(CoreError::LockTimeout { unit })
    }

    pub fn with<R>(
        &self,
        timeout: Duration,
        unit: &'static str,
        f: impl FnOnce(&mut SystemState) -> R,
    ) -> Result<R, CoreError> {
        let mut guard = self.lock_for(timeout, unit)?;
        Ok(f(&mut guard))
    }

    pub fn snapshot(&self, timeout: Duration, unit: &'static str) -> Result<SystemState, CoreError> {
        self.with(timeout, unit, |state| state.clone())
    }
}
