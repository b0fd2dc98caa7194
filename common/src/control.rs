use log::{info, warn};

use crate::{
    config::ControlConfig,
    state::SystemState,
    temperature::SensorRole,
    types::{ActuatorCommand, ControlState, FanSpeed, Mode},
};

/// Thermostat, anti-freeze and short-cycle logic.
///
/// Stateless apart from its tuning: everything it remembers lives in
/// [`SystemState`], so the caller decides how long the lock is held.
#[derive(Debug, Clone)]
pub struct ClimateEngine {
    config: ControlConfig,
}

impl ClimateEngine {
    pub fn new(mut config: ControlConfig) -> Self {
        config.sanitize();
        Self { config }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Minimum rest since the last stop has elapsed, and the same minimum since boot.
    pub fn is_safe_to_start(&self, state: &SystemState, now_ms: u64) -> bool {
        self.restart_remaining_ms(state, now_ms) == 0
    }

    pub fn restart_remaining_ms(&self, state: &SystemState, now_ms: u64) -> u64 {
        let min_rest = self.config.min_compressor_rest_ms;
        let since_boot = min_rest.saturating_sub(now_ms);
        let since_stop = state
            .last_comp_stop_ms
            .map(|stop| min_rest.saturating_sub(now_ms.saturating_sub(stop)))
            .unwrap_or(0);
        since_boot.max(since_stop)
    }

    /// One control cycle. Resolves the outputs for this cycle and records every
    /// compressor stop in `state` before returning.
    pub fn step(&self, state: &mut SystemState, now_ms: u64) -> ActuatorCommand {
        if let Some(command) = self.evaluate_freeze(state, now_ms) {
            return command;
        }

        let cfg = state.cfg;
        match (cfg.system_on, cfg.mode) {
            (false, _) | (true, Mode::Off) => {
                self.stop_compressor(state, now_ms, "system off");
                state.protection_wait = false;
                self.enter(state, ControlState::Standby);
                ActuatorCommand::ALL_OFF
            }
            (true, Mode::Fan) => {
                self.stop_compressor(state, now_ms, "fan only mode");
                state.protection_wait = false;
                self.enter(state, ControlState::FanOnly);
                ActuatorCommand {
                    compressor: false,
                    fan: cfg.fan_speed,
                }
            }
            (true, Mode::Cool) => self.evaluate_cooling(state, now_ms),
        }
    }

    fn evaluate_freeze(&self, state: &mut SystemState, now_ms: u64) -> Option<ActuatorCommand> {
        if state.freeze_mode {
            if state.t_coil > self.config.freeze_reset_c {
                info!(
                    "freeze protection released: coil {:.1}C above {:.1}C",
                    state.t_coil, self.config.freeze_reset_c
                );
                state.freeze_mode = false;
                return None;
            }
        } else {
            // A coil that has never reported cannot be trusted to be frozen.
            let coil_seen = state.last_update_ms(SensorRole::Coil).is_some();
            if !coil_seen || state.t_coil >= self.config.freeze_limit_c {
                return None;
            }
            warn!(
                "freeze protection engaged: coil {:.1}C below {:.1}C",
                state.t_coil, self.config.freeze_limit_c
            );
            state.freeze_mode = true;
            state.comp_active = false;
            state.last_comp_stop_ms = Some(now_ms);
            state.protection_wait = false;
        }

        self.enter(state, ControlState::FreezeProtect);
        Some(ActuatorCommand {
            compressor: false,
            fan: FanSpeed::High,
        })
    }

    fn evaluate_cooling(&self, state: &mut SystemState, now_ms: u64) -> ActuatorCommand {
        let stale_after = self.config.sensor_stale_timeout_ms;
        let setpoint = state.cfg.setpoint;
        let hysteresis = self.config.hysteresis_c;

        let mut demand = if !state.is_fresh(SensorRole::Ambient, now_ms, stale_after) {
            if state.comp_active {
                warn!("ambient reading stale, dropping cooling demand");
            }
            false
        } else if state.t_amb > setpoint + hysteresis {
            true
        } else if state.t_amb < setpoint - hysteresis {
            false
        } else {
            state.comp_active
        };

        if demand && !state.is_fresh(SensorRole::Coil, now_ms, stale_after) {
            warn!("coil reading stale, compressor held off");
            demand = false;
        }

        if !demand {
            self.stop_compressor(state, now_ms, "thermostat satisfied");
            state.protection_wait = false;
        } else if !state.comp_active {
            if self.is_safe_to_start(state, now_ms) {
                info!(
                    "compressor start: ambient {:.1}C setpoint {:.1}C outlet delta-T {:.1}C",
                    state.t_amb,
                    setpoint,
                    state.t_amb - state.t_out
                );
                state.comp_active = true;
                state.protection_wait = false;
            } else {
                if !state.protection_wait {
                    info!(
                        "cooling request held by short-cycle protection, {}s remaining",
                        self.restart_remaining_ms(state, now_ms).div_ceil(1_000)
                    );
                }
                state.protection_wait = true;
            }
        }

        let control_state = if state.comp_active {
            ControlState::Cooling
        } else {
            ControlState::IdleCool
        };
        self.enter(state, control_state);

        let fan = if state.comp_active {
            state.cfg.fan_speed.max(FanSpeed::Low)
        } else {
            state.cfg.fan_speed
        };
        ActuatorCommand {
            compressor: state.comp_active,
            fan,
        }
    }

    fn stop_compressor(&self, state: &mut SystemState, now_ms: u64, reason: &str) {
        if state.comp_active {
            info!("compressor stop: {reason}");
            state.comp_active = false;
            state.last_comp_stop_ms = Some(now_ms);
        }
    }

    fn enter(&self, state: &mut SystemState, next: ControlState) {
        if state.control_state != next {
            info!(
                "control state {} -> {}",
                state.control_state.as_str(),
                next.as_str()
            );
            state.control_state = next;
        }
    }
}
