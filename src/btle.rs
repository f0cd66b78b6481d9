use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CharPropFlags, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{Advertisement, BleAdapter, BleLink, NotificationStream};
use crate::error::{ConnectError, ScanError};

/// The host's first Bluetooth adapter, driven through btleplug.
pub struct BtleplugAdapter {
    adapter: Adapter,
}

impl BtleplugAdapter {
    pub async fn new() -> Result<Self, ScanError> {
        let manager = Manager::new()
            .await
            .map_err(|e| ScanError::ScanFailed(format!("Bluetooth manager unavailable: {}", e)))?;
        let adapter_list = manager
            .adapters()
            .await
            .map_err(|e| ScanError::ScanFailed(format!("Failed to list adapters: {}", e)))?;

        for adapter in adapter_list.iter() {
            debug!("{}", adapter.adapter_info().await.unwrap_or("No name adapter".to_string()));
        }

        // TODO: let the user pick when the host has more than one adapter
        let adapter = adapter_list.into_iter().next().ok_or(ScanError::NoAdapter)?;
        Ok(BtleplugAdapter { adapter })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<PlatformPeripheral>, btleplug::Error> {
        let peripherals = self.adapter.peripherals().await?;
        Ok(peripherals
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address)))
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn discover(&self, timeout: Duration) -> Result<Vec<Advertisement>, ScanError> {
        info!("Scanning for devices...");
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| ScanError::ScanFailed(e.to_string()))?;

        tokio::time::sleep(timeout).await;

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        // may contain peripherals seen in earlier scans that are no longer around
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| ScanError::ScanFailed(format!("Failed to get peripherals: {}", e)))?;

        let mut found = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals.iter() {
            let Ok(Some(properties)) = peripheral.properties().await else { continue; };
            found.push(Advertisement {
                name: properties.local_name,
                address: peripheral.address().to_string(),
                rssi: properties.rssi,
            });
        }

        Ok(found)
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn BleLink>, ConnectError> {
        let failed = |e: btleplug::Error| ConnectError::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        };

        let peripheral = self
            .find_peripheral(address)
            .await
            .map_err(failed)?
            .ok_or_else(|| ConnectError::DeviceNotFound(address.to_string()))?;

        if !peripheral.is_connected().await.map_err(failed)? {
            peripheral.connect().await.map_err(failed)?;
        }

        debug!("Discover peripheral {} services...", address);
        peripheral.discover_services().await.map_err(failed)?;

        Ok(Box::new(BtleplugLink {
            address: address.to_string(),
            peripheral,
        }))
    }
}

struct BtleplugLink {
    address: String,
    peripheral: PlatformPeripheral,
}

#[async_trait]
impl BleLink for BtleplugLink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, ConnectError> {
        let Some(hr_char) = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.properties.contains(CharPropFlags::NOTIFY))
        else {
            return Err(ConnectError::CharacteristicNotFound(self.address.clone()));
        };

        debug!("Subscribing to characteristic {:?}", hr_char.uuid);
        self.peripheral
            .subscribe(&hr_char)
            .await
            .map_err(|e| ConnectError::SubscriptionFailed(e.to_string()))?;

        let notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| ConnectError::SubscriptionFailed(e.to_string()))?;

        Ok(Box::pin(notifications.filter_map(move |data| async move {
            (data.uuid == characteristic).then_some(data.value)
        })))
    }

    async fn disconnect(&self) -> Result<(), ConnectError> {
        debug!("Disconnecting from peripheral {:?}...", self.address);
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| ConnectError::DisconnectFailed(e.to_string()))
    }
}
