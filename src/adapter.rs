//! The BLE radio as a capability.
//!
//! Everything above this module talks to [`BleAdapter`] and [`BleLink`];
//! the real radio (`btle`, behind the `ble-central` feature) and the
//! simulator (`fake`) both implement them.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::error::{ConnectError, ScanError};

pub const HEART_RATE_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// What the radio saw of one peripheral during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: Option<String>,
    pub address: String,
    pub rssi: Option<i16>,
}

/// Raw characteristic values, in the order the peripheral sent them. The
/// stream ends when the link goes away.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Scan for `timeout` and report every peripheral observed.
    async fn discover(&self, timeout: Duration) -> Result<Vec<Advertisement>, ScanError>;

    /// Open a connection to the peripheral at `address`.
    async fn connect(&self, address: &str) -> Result<Box<dyn BleLink>, ConnectError>;
}

/// One open connection to a peripheral.
#[async_trait]
pub trait BleLink: Send + Sync {
    fn address(&self) -> &str;

    /// Enable notifications for `characteristic` and hand back their payloads.
    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, ConnectError>;

    async fn disconnect(&self) -> Result<(), ConnectError>;
}
