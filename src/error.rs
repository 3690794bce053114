use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use uuid::Uuid;
use btleplug;
use serde_json;

use crate::ble::types::ConnectionEventReason;

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
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (bluetooth adapter): {source}")]
    AdapterError { #[from] source: AdapterError },

    #[error("Bluetooth operation failed: {source}")]
    BleError { #[from] source: BleError },

    #[error("Failed to start the async runtime: {source}")]
    RuntimeError { source: io::Error },

    #[error("No Pixel die was found while scanning")]
    NoPixelFound,
}

/// Failure reported by a [`crate::ble::adapter::BleAdapter`] implementation.
///
/// This never crosses the `Peripheral` / `Scanner` boundary as-is; it is translated into
/// [`BleError`] or a [`ConnectionEventReason`] first.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("The bluetooth adapter is turned off")]
    AdapterOff,

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("A required bluetooth characteristic is not available: {0}")]
    MissingCharacteristic(Uuid),

    #[error("Not supported by this adapter: {0}")]
    NotSupported(String),

    #[error("Adapter failure: {0}")]
    Other(String),
}

impl AdapterError {
    pub fn reason(&self) -> ConnectionEventReason {
        match self {
            AdapterError::Btle { source } => match source {
                btleplug::Error::NotSupported(_) => ConnectionEventReason::NotSupported,
                btleplug::Error::PermissionDenied => ConnectionEventReason::NotSupported,
                btleplug::Error::TimedOut(_) => ConnectionEventReason::Timeout,
                btleplug::Error::NotConnected => ConnectionEventReason::LinkLoss,
                _ => ConnectionEventReason::Unknown,
            },
            AdapterError::NoAdapter => ConnectionEventReason::AdapterOff,
            AdapterError::AdapterOff => ConnectionEventReason::AdapterOff,
            AdapterError::NotSupported(_) => ConnectionEventReason::NotSupported,
            AdapterError::MissingCharacteristic(_) => ConnectionEventReason::NotSupported,
            AdapterError::UnknownPeripheral(_) | AdapterError::Other(_) => ConnectionEventReason::Unknown,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Payload is empty")]
    Empty,

    #[error("Unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("Invalid length for {what}: expected {expected} bytes, got {actual}")]
    InvalidLength { what: &'static str, expected: usize, actual: usize },

    #[error("Payload too short for {what}: expected at least {expected} bytes, got {actual}")]
    TooShort { what: &'static str, expected: usize, actual: usize },

    #[error("Invalid value {value} for field {field}")]
    InvalidValue { field: &'static str, value: u8 },

    #[error("LED count {0} does not match any known die type")]
    UnknownDieType(u8),

    #[error("Advertisement carries no manufacturer data")]
    MissingManufacturerData,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("The peripheral is not connected")]
    NotConnected,

    #[error("Another operation is already in progress on this resource")]
    Busy,

    #[error("The operation did not complete in time")]
    Timeout,

    #[error("The operation was canceled")]
    Canceled,

    #[error("The operation is not supported by the bluetooth adapter")]
    NotSupported,

    #[error("The connection to the peripheral was lost")]
    LinkLoss,

    #[error("The bluetooth adapter is turned off")]
    AdapterOff,

    #[error("Failed to decode payload: {source}")]
    Decode { #[from] source: DecodeError },

    #[error("A required bluetooth characteristic is not available: {0}")]
    MissingCharacteristic(Uuid),

    #[error("Die identified as pixel {actual:08x}, expected {expected:08x}")]
    IdentificationMismatch { expected: u32, actual: u32 },

    #[error("Unclassified bluetooth failure: {0}")]
    Unknown(String),
}

impl BleError {
    pub fn from_reason(reason: ConnectionEventReason) -> Self {
        match reason {
            ConnectionEventReason::Timeout => BleError::Timeout,
            ConnectionEventReason::Canceled => BleError::Canceled,
            ConnectionEventReason::NotSupported => BleError::NotSupported,
            ConnectionEventReason::LinkLoss => BleError::LinkLoss,
            ConnectionEventReason::PeripheralInitiated => BleError::LinkLoss,
            ConnectionEventReason::AdapterOff => BleError::AdapterOff,
            ConnectionEventReason::Unknown | ConnectionEventReason::Success => {
                BleError::Unknown(format!("connection ended ({:?})", reason))
            },
        }
    }
}

impl From<AdapterError> for BleError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::MissingCharacteristic(uuid) => BleError::MissingCharacteristic(uuid),
            AdapterError::UnknownPeripheral(_) => BleError::NotConnected,
            AdapterError::Btle { source: btleplug::Error::NotConnected } => BleError::NotConnected,
            err => match err.reason() {
                ConnectionEventReason::Unknown => BleError::Unknown(err.to_string()),
                reason => BleError::from_reason(reason),
            },
        }
    }
}
