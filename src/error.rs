use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

use crate::device::types::ConnectionState;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Invalid service filter uuid in config: {source}")]
    InvalidServiceUuid { #[from] source: uuid::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start (transport): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Command failed: {source}")]
    CommandError { #[from] source: CommandError },

    #[error("Failed to start async runtime: {source}")]
    Runtime { source: io::Error },

    #[error("Session task failed: {source}")]
    SessionTask { #[from] source: tokio::task::JoinError },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { source: btleplug::Error },

    #[error("Bluetooth permission has not been granted")]
    PermissionDenied,

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("No peripheral with address {address} is known to any adapter")]
    PeripheralNotFound { address: String },

    #[error("Connecting to {address} took too long")]
    ConnectTimeout { address: String },
}

// btleplug reports a missing permission as a regular error variant, callers need to be able to
// tell it apart from other transport failures.
impl From<btleplug::Error> for DeviceError {
    fn from(source: btleplug::Error) -> Self {
        match source {
            btleplug::Error::PermissionDenied => DeviceError::PermissionDenied,
            source => DeviceError::Btle { source },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A device with id {id} (or address {address}) is already registered")]
    DuplicateDevice { id: String, address: String },

    #[error("No device with id {id} is registered")]
    UnknownDevice { id: String },
}

/// The result of a rejected or failed command, see [`crate::device::connection::SessionHandle`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Bluetooth permission is required for this operation")]
    PermissionDenied,

    #[error("No device with id {id} has been discovered")]
    UnknownDevice { id: String },

    #[error("Command {command} is not valid in state {state:?}")]
    InvalidTransition { command: &'static str, state: ConnectionState },

    #[error("Device {id} is already registered")]
    DuplicateDevice { id: String },

    #[error("Transport failure: {message}")]
    TransportFailure { message: String },

    #[error("The session is no longer running")]
    SessionClosed,
}

impl CommandError {
    /// Rejections are commands that were refused before anything was attempted; everything else
    /// is a failure of an attempted operation.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CommandError::PermissionDenied
                | CommandError::UnknownDevice { .. }
                | CommandError::InvalidTransition { .. }
                | CommandError::DuplicateDevice { .. }
        )
    }
}

impl From<RegistryError> for CommandError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::DuplicateDevice { id, .. } => CommandError::DuplicateDevice { id },
            RegistryError::UnknownDevice { id } => CommandError::UnknownDevice { id },
        }
    }
}

impl From<DeviceError> for CommandError {
    fn from(error: DeviceError) -> Self {
        match error {
            DeviceError::PermissionDenied => CommandError::PermissionDenied,
            error => CommandError::TransportFailure { message: error.to_string() },
        }
    }
}
