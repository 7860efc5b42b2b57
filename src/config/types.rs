use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{millis, parse_service_uuid, CONNECT_DEADLINE, SCAN_DURATION};
use crate::error::ConfigError;

/**
 * What happens to the devices of a previous scan cycle when a new one starts.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RescanPolicy {
    /// Forget everything, the list only shows what the current cycle found.
    Clear,
    /// Keep previously found devices and refresh the ones seen again.
    Merge,
}

impl std::fmt::Display for RescanPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            RescanPolicy::Clear => "Clear",
            RescanPolicy::Merge => "Merge",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub scan_duration_ms: u64,
    pub rescan_policy: RescanPolicy,
    pub service_filter: Option<String>,
    pub connect_attempts: u32,
    pub connect_deadline_ms: u64,
}

impl Config {
    pub fn scan_duration(&self) -> Duration {
        millis(self.scan_duration_ms)
    }

    pub fn connect_deadline(&self) -> Duration {
        millis(self.connect_deadline_ms)
    }

    // a config file with 0 attempts would make every connect fail without trying
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.max(1)
    }

    pub fn service_uuid(&self) -> Result<Option<Uuid>, ConfigError> {
        match &self.service_filter {
            None => Ok(None),
            Some(value) => Ok(Some(parse_service_uuid(value)?)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scan_duration_ms: SCAN_DURATION,
            rescan_policy: RescanPolicy::Clear,
            service_filter: None,
            connect_attempts: 1,
            connect_deadline_ms: CONNECT_DEADLINE,
        }
    }
}
