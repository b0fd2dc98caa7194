use thiserror::Error;

/// Failures of a single one-wire transaction.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum BusError {
    #[error("no presence pulse on one-wire bus")]
    NotFound,
    #[error("scratchpad crc mismatch")]
    Checksum,
    #[error("decoded temperature {0:.2}C outside -55..125C")]
    OutOfRange(f32),
    #[error("one-wire pin i/o failed")]
    Pin,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum MeterError {
    #[error("adc conversion failed")]
    Adc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ActuatorError {
    #[error("relay output write failed")]
    Pin,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("stored record corrupt: {0}")]
    Corrupt(&'static str),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("command payload of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("command is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("command is not a json object")]
    NotAnObject,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker transport rejected publish: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("shared state lock not acquired within bound ({unit})")]
    LockTimeout { unit: &'static str },
    #[error(transparent)]
    StorageUnavailable(#[from] StorageError),
    #[error("control loop silent for {silent_ms}ms")]
    LivenessTimeout { silent_ms: u64 },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Actuator(#[from] ActuatorError),
    #[error(transparent)]
    Meter(#[from] MeterError),
}
