//! Fixed-layout configuration record kept in the device key-value store.
//!
//! Layout (little endian, C struct alignment):
//! `setpoint: f32 | fan_speed: i32 | system_on: bool, 3 pad | mode: i32`.

use log::{info, warn};

use crate::{
    config::{Configuration, SETPOINT_MAX_C, SETPOINT_MIN_C},
    error::StorageError,
    types::{FanSpeed, Mode},
};

pub const CONFIG_NAMESPACE: &str = "ac_storage";
pub const CONFIG_KEY: &str = "config";
pub const RECORD_LEN: usize = 16;

/// Durable blob storage for the configuration record.
pub trait ConfigStore: Send {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&mut self) -> Result<Option<Vec<u8>>, StorageError>;
    fn save(&mut self, record: &[u8]) -> Result<(), StorageError>;
}

pub fn encode(cfg: &Configuration) -> [u8; RECORD_LEN] {
    let mut record = [0_u8; RECORD_LEN];
    record[0..4].copy_from_slice(&cfg.setpoint.to_le_bytes());
    record[4..8].copy_from_slice(&i32::from(cfg.fan_speed.level()).to_le_bytes());
    record[8] = u8::from(cfg.system_on);
    record[12..16].copy_from_slice(&i32::from(cfg.mode.code()).to_le_bytes());
    record
}

pub fn decode(record: &[u8]) -> Result<Configuration, StorageError> {
    let record: &[u8; RECORD_LEN] = record
        .try_into()
        .map_err(|_| StorageError::Corrupt("record length"))?;

    let setpoint = f32::from_le_bytes([record[0], record[1], record[2], record[3]]);
    if !(SETPOINT_MIN_C..=SETPOINT_MAX_C).contains(&setpoint) {
        return Err(StorageError::Corrupt("setpoint"));
    }

    let fan_level = i32::from_le_bytes([record[4], record[5], record[6], record[7]]);
    let fan_speed =
        FanSpeed::from_level(i64::from(fan_level)).ok_or(StorageError::Corrupt("fan speed"))?;

    let system_on = match record[8] {
        0 => false,
        1 => true,
        _ => return Err(StorageError::Corrupt("system flag")),
    };

    let mode_code = i32::from_le_bytes([record[12], record[13], record[14], record[15]]);
    let mode = Mode::from_code(i64::from(mode_code)).ok_or(StorageError::Corrupt("mode"))?;

    Ok(Configuration {
        setpoint,
        fan_speed,
        system_on,
        mode,
    })
}

/// Boot-time load. Any failure falls back to the safe defaults.
pub fn load_or_default(store: &mut dyn ConfigStore) -> Configuration {
    match store.load().and_then(|record| record.map(|bytes| decode(&bytes)).transpose()) {
        Ok(Some(cfg)) => {
            info!(
                "loaded configuration: on={} mode={} sp={:.1}",
                cfg.system_on,
                cfg.mode.as_str(),
                cfg.setpoint
            );
            cfg
        }
        Ok(None) => {
            info!("no stored configuration, using defaults");
            Configuration::default()
        }
        Err(err) => {
            warn!("stored configuration unusable ({err}), using defaults");
            Configuration::default()
        }
    }
}

pub fn persist(store: &mut dyn ConfigStore, cfg: &Configuration) -> Result<(), StorageError> {
    store.save(&encode(cfg))
}

#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct MemoryStore {
    pub record: Option<Vec<u8>>,
    pub saves: usize,
    pub fail: bool,
}

#[cfg(test)]
impl ConfigStore for MemoryStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        if self.fail {
            return Err(StorageError::Unavailable("memory store offline".into()));
        }
        Ok(self.record.clone())
    }

    fn save(&mut self, record: &[u8]) -> Result<(), StorageError> {
        if self.fail {
            return Err(StorageError::Unavailable("memory store offline".into()));
        }
        self.record = Some(record.to_vec());
        self.saves += 1;
        Ok(())
    }
}
