use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use serde::Serialize;

use crate::adapter::{Advertisement, BleAdapter};
use crate::error::ScanError;

/// Slack on top of the scan window before the scan itself is abandoned.
const SCAN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub address: String,
    #[serde(rename = "rssi")]
    pub signal_strength: i16,
}

impl From<Advertisement> for DeviceDescriptor {
    fn from(adv: Advertisement) -> Self {
        DeviceDescriptor {
            name: adv.name.filter(|n| !n.is_empty()).unwrap_or_else(|| "Unknown".to_string()),
            address: adv.address,
            signal_strength: adv.rssi.unwrap_or(i16::MIN),
        }
    }
}

#[derive(Clone)]
pub struct DeviceScanner {
    adapter: Arc<dyn BleAdapter>,
}

impl DeviceScanner {
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Self {
        DeviceScanner { adapter }
    }

    /// Every device seen within `timeout_secs`, strongest signal first.
    /// A failed scan is logged and reported as no devices.
    pub async fn discover(&self, timeout_secs: f64) -> Vec<DeviceDescriptor> {
        match self.try_discover(timeout_secs).await {
            Ok(devices) => {
                info!("Found {} devices.", devices.len());
                devices
            }
            Err(e) => {
                error!("Scan error: {}", e);
                Vec::new()
            }
        }
    }

    async fn try_discover(&self, timeout_secs: f64) -> Result<Vec<DeviceDescriptor>, ScanError> {
        let window = Duration::try_from_secs_f64(timeout_secs.max(0.0))
            .map_err(|e| ScanError::ScanFailed(e.to_string()))?;

        let advertisements = tokio::time::timeout(window + SCAN_GRACE, self.adapter.discover(window))
            .await
            .map_err(|_| ScanError::Timeout)??;

        // one entry per address, keeping the strongest sighting
        let mut by_address: HashMap<String, DeviceDescriptor> = HashMap::new();
        for device in advertisements.into_iter().map(DeviceDescriptor::from) {
            match by_address.get(&device.address) {
                Some(seen) if seen.signal_strength >= device.signal_strength => {}
                _ => {
                    by_address.insert(device.address.clone(), device);
                }
            }
        }

        let mut devices: Vec<_> = by_address.into_values().collect();
        devices.sort_by(|a, b| {
            b.signal_strength
                .cmp(&a.signal_strength)
                .then_with(|| a.address.cmp(&b.address))
        });
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{SimulatedAdapter, SimulatedDevice};

    #[tokio::test(start_paused = true)]
    async fn test_sorted_by_signal_strength() {
        let adapter = SimulatedAdapter::new().with_devices(vec![
            SimulatedDevice::new(Some("A"), "01", -80),
            SimulatedDevice::new(Some("B"), "02", -60),
            SimulatedDevice::new(Some("C"), "03", -90),
        ]);
        let scanner = DeviceScanner::new(Arc::new(adapter));

        let rssi: Vec<_> = scanner
            .discover(5.0)
            .await
            .iter()
            .map(|d| d.signal_strength)
            .collect();
        assert_eq!(rssi, [-60, -80, -90]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_name_is_unknown_and_duplicates_collapse() {
        let adapter = SimulatedAdapter::new().with_devices(vec![
            SimulatedDevice::new(None, "01", -70),
            SimulatedDevice::new(Some("Strap"), "02", -75),
            SimulatedDevice::new(Some("Strap"), "02", -50),
        ]);
        let scanner = DeviceScanner::new(Arc::new(adapter));

        let devices = scanner.discover(1.0).await;
        assert_eq!(
            devices,
            vec![
                DeviceDescriptor {
                    name: "Strap".to_string(),
                    address: "02".to_string(),
                    signal_strength: -50
                },
                DeviceDescriptor {
                    name: "Unknown".to_string(),
                    address: "01".to_string(),
                    signal_strength: -70
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_is_empty() {
        let scanner = DeviceScanner::new(Arc::new(SimulatedAdapter::new().with_failing_scan()));
        assert!(scanner.discover(5.0).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_scan_times_out() {
        let scanner = DeviceScanner::new(Arc::new(SimulatedAdapter::new().with_hanging_scan()));

        let started = tokio::time::Instant::now();
        assert!(matches!(scanner.try_discover(1.0).await, Err(ScanError::Timeout)));
        assert!(started.elapsed() >= Duration::from_secs(1) + SCAN_GRACE);

        assert!(scanner.discover(1.0).await.is_empty());
    }

    #[test]
    fn test_serializes_rssi_key() {
        let device = DeviceDescriptor {
            name: "Mock HR Monitor".to_string(),
            address: "00:11:22:33:44:55".to_string(),
            signal_strength: -60,
        };
        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["rssi"], -60);
        assert_eq!(json["name"], "Mock HR Monitor");
    }
}
