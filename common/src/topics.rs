pub const TOPIC_COMMAND: &str = "climate/cmnd/config";
pub const TOPIC_TELEMETRY: &str = "climate/tele/telemetry";
pub const TOPIC_STATUS: &str = "climate/stat/status";
pub const TOPIC_AVAILABILITY: &str = "climate/availability";

pub const AVAILABILITY_ONLINE: &str = "ONLINE";
pub const AVAILABILITY_OFFLINE: &str = "OFFLINE";

/// Inbound command payloads above this size are dropped unparsed.
pub const MAX_COMMAND_BYTES: usize = 512;
