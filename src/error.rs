use thiserror::Error;

/// Adapter unreachable or the scan itself failed. Never fatal: the scanner
/// reports it as "no devices found".
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("No Bluetooth adapter found")]
    #[cfg_attr(not(feature = "ble-central"), allow(dead_code))]
    NoAdapter,

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Scan timed out")]
    Timeout,
}

/// Connecting to a peripheral or subscribing to its heart-rate
/// characteristic failed.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Device not found: {0}")]
    #[cfg_attr(not(feature = "ble-central"), allow(dead_code))]
    DeviceNotFound(String),

    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Heart rate characteristic not found on {0}")]
    CharacteristicNotFound(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Disconnect failed: {0}")]
    #[cfg_attr(not(feature = "ble-central"), allow(dead_code))]
    DisconnectFailed(String),
}

/// A heart-rate measurement payload too short for the width its flag selects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Empty heart rate payload")]
    Empty,

    #[error("Heart rate payload too short: need {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store is unavailable: {0}")]
    Unavailable(String),
}

/// A single viewer could not be reached.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Viewer {0} is gone")]
    ViewerGone(u64),

    #[error("Viewer {0} is not keeping up, signal dropped")]
    Lagging(u64),
}
