use std::time::Duration;
use uuid::Uuid;

/**
 * How long (milliseconds) a scan cycle searches for devices unless configured otherwise.
 */
pub const SCAN_DURATION: u64 = 3000;

/**
 * How long (milliseconds) opening a connection may take unless configured otherwise.
 */
pub const CONNECT_DEADLINE: u64 = 5000;

/**
 * How long (milliseconds) to wait before retrying a failed connection attempt.
 */
pub const CONNECT_RETRY_DELAY: u64 = 1000;

/**
 * How long (milliseconds) stopping a scan or closing a connection may take.
 */
pub const STOP_DEADLINE: u64 = 2000;

/**
 * Capacity of the command channel of a session.
 */
pub const COMMAND_CHANNEL_SIZE: usize = 16;

/**
 * Capacity of the channel carrying discovery results from a scan cycle to its session.
 */
pub const SCAN_CHANNEL_SIZE: usize = 64;

/**
 * Display name of peripherals that do not advertise a local name.
 */
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

pub fn millis(value: u64) -> Duration {
    Duration::from_millis(value)
}

pub fn parse_service_uuid(value: &str) -> Result<Uuid, uuid::Error> {
    Uuid::parse_str(value)
}
