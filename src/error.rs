use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

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

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start (bluetooth): {source}")]
    Transport { #[from] source: TransportError },

    #[error("Session failed: {source}")]
    Session { #[from] source: SessionError },

    #[error("Invalid servo target {0:?}, expected ID:ANGLE")]
    InvalidTarget(String),

    #[error("Failed to wait for shutdown signal: {source}")]
    Signal { source: io::Error },
}

/// Raised by the frame codec. Never escapes the session task.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame (length {length})")]
    MalformedFrame { length: usize },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("Bluetooth radio is not available: {reason}")]
    Unavailable { reason: String },

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("Device {0} has not been discovered by a scan")]
    UnknownDevice(String),

    #[error("The transport was closed")]
    Closed,
}

/// Caller-visible session failures. These are also published through the
/// session snapshot, so they are cheap to clone and compare.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Not connected to a device")]
    NotConnected,

    #[error("Failed to connect to device: {reason}")]
    ConnectFailure { reason: String },

    #[error("Connecting to device took too long")]
    ConnectTimeout,

    #[error("Device disconnected unexpectedly")]
    UnsolicitedDisconnect,

    #[error("Bluetooth is not available: {reason}")]
    TransportUnavailable { reason: String },

    #[error("No matching device found before the scan timed out")]
    DeviceNotFound,

    #[error("The session has been shut down")]
    SessionClosed,
}

impl SessionError {
    pub fn connect_failure(source: &TransportError) -> Self {
        SessionError::ConnectFailure { reason: source.to_string() }
    }
}
