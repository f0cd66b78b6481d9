//! A deterministic stand-in for the radio.
//!
//! Used when the binary is built without `ble-central`, when no adapter can
//! be found, or when `--simulate` is passed. Tests drive it directly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{Advertisement, BleAdapter, BleLink, NotificationStream, HEART_RATE_MEASUREMENT_UUID};
use crate::error::{ConnectError, ScanError};

const SCAN_LATENCY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub name: Option<String>,
    pub address: String,
    pub rssi: i16,
}

impl SimulatedDevice {
    pub fn new(name: Option<&str>, address: &str, rssi: i16) -> Self {
        Self {
            name: name.map(str::to_string),
            address: address.to_string(),
            rssi,
        }
    }
}

#[derive(Debug, Clone)]
enum PayloadSource {
    /// 8-bit readings between 60 and 100 bpm.
    Random { seed: u64 },
    /// Exactly these payloads, then silence.
    #[cfg_attr(not(test), allow(dead_code))]
    Script(Vec<Vec<u8>>),
}

pub struct SimulatedAdapter {
    devices: Vec<SimulatedDevice>,
    interval: Duration,
    connect_delay: Duration,
    source: PayloadSource,
    unreachable: HashSet<String>,
    scan_fails: bool,
    scan_hangs: bool,
    radio: CancellationToken,
    live_links: Arc<AtomicUsize>,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        SimulatedAdapter {
            devices: vec![
                SimulatedDevice::new(Some("Mock HR Monitor"), "00:11:22:33:44:55", -60),
                SimulatedDevice::new(Some("Another Device"), "AA:BB:CC:DD:EE:FF", -80),
            ],
            interval: Duration::from_secs(1),
            connect_delay: Duration::from_secs(1),
            source: PayloadSource::Random { seed: 42 },
            unreachable: HashSet::new(),
            scan_fails: false,
            scan_hangs: false,
            radio: CancellationToken::new(),
            live_links: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[cfg(test)]
    pub fn with_devices(mut self, devices: Vec<SimulatedDevice>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[cfg(test)]
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.source = PayloadSource::Random { seed };
        self
    }

    #[cfg(test)]
    pub fn with_script(mut self, payloads: Vec<Vec<u8>>) -> Self {
        self.source = PayloadSource::Script(payloads);
        self
    }

    #[cfg(test)]
    pub fn with_unreachable(mut self, address: &str) -> Self {
        self.unreachable.insert(address.to_string());
        self
    }

    #[cfg(test)]
    pub fn with_failing_scan(mut self) -> Self {
        self.scan_fails = true;
        self
    }

    /// Scans never come back, like a wedged radio stack.
    #[cfg(test)]
    pub fn with_hanging_scan(mut self) -> Self {
        self.scan_hangs = true;
        self
    }

    #[cfg(test)]
    /// Links that have been opened and not yet disconnected or dropped.
    pub fn live_links(&self) -> usize {
        self.live_links.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    /// Every open link's notification stream ends, as if the peripherals
    /// all walked out of range.
    pub fn power_off(&self) {
        self.radio.cancel();
    }
}

#[async_trait]
impl BleAdapter for SimulatedAdapter {
    async fn discover(&self, timeout: Duration) -> Result<Vec<Advertisement>, ScanError> {
        if self.scan_hangs {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(timeout.min(SCAN_LATENCY)).await;

        if self.scan_fails {
            return Err(ScanError::ScanFailed("simulated radio is off".to_string()));
        }

        Ok(self
            .devices
            .iter()
            .map(|d| Advertisement {
                name: d.name.clone(),
                address: d.address.clone(),
                rssi: Some(d.rssi),
            })
            .collect())
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn BleLink>, ConnectError> {
        tokio::time::sleep(self.connect_delay).await;

        if self.unreachable.contains(address) {
            return Err(ConnectError::ConnectionFailed {
                address: address.to_string(),
                reason: "peripheral did not respond".to_string(),
            });
        }

        self.live_links.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated link to {} opened", address);

        Ok(Box::new(SimulatedLink {
            address: address.to_string(),
            interval: self.interval,
            source: self.source.clone(),
            cancel: self.radio.child_token(),
            closed: AtomicBool::new(false),
            live_links: Arc::clone(&self.live_links),
        }))
    }
}

struct SimulatedLink {
    address: String,
    interval: Duration,
    source: PayloadSource,
    cancel: CancellationToken,
    closed: AtomicBool,
    live_links: Arc<AtomicUsize>,
}

impl SimulatedLink {
    fn close(&self) {
        self.cancel.cancel();
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.live_links.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl BleLink for SimulatedLink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, ConnectError> {
        if characteristic != HEART_RATE_MEASUREMENT_UUID {
            return Err(ConnectError::CharacteristicNotFound(self.address.clone()));
        }
        if self.cancel.is_cancelled() {
            return Err(ConnectError::SubscriptionFailed(format!("{} is not connected", self.address)));
        }

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
        let cancel = self.cancel.clone();
        let interval = self.interval;
        let source = self.source.clone();

        tokio::spawn(async move {
            let mut payloads: Box<dyn Iterator<Item = Vec<u8>> + Send> = match source {
                PayloadSource::Random { seed } => {
                    let mut rng = StdRng::seed_from_u64(seed);
                    Box::new(std::iter::repeat_with(move || vec![0, rng.gen_range(60..=100)]))
                }
                PayloadSource::Script(script) => Box::new(script.into_iter()),
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(payload) = payloads.next() else {
                    // keep the stream open until the link closes
                    cancel.cancelled().await;
                    break;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx))))
    }

    async fn disconnect(&self) -> Result<(), ConnectError> {
        self.close();
        debug!("Simulated link to {} closed", self.address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn test_discover_lists_two_devices() {
        let adapter = SimulatedAdapter::new();
        let found = adapter.discover(Duration::from_secs(5)).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_ne!(found[0].rssi, found[1].rssi);
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_notifications_are_deterministic() {
        async fn first_three(seed: u64) -> Vec<Vec<u8>> {
            let adapter = SimulatedAdapter::new().with_seed(seed);
            let link = adapter.connect("00:11:22:33:44:55").await.unwrap();
            let stream = link.subscribe(HEART_RATE_MEASUREMENT_UUID).await.unwrap();
            stream.take(3).collect().await
        }

        let a = first_three(7).await;
        assert_eq!(a, first_three(7).await);
        for payload in a {
            assert_eq!(payload[0], 0);
            assert!((60..=100).contains(&payload[1]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_ends_stream() {
        let adapter = SimulatedAdapter::new().with_script(vec![vec![0, 70]]);
        let link = adapter.connect("AA").await.unwrap();
        assert_eq!(adapter.live_links(), 1);

        let mut stream = link.subscribe(HEART_RATE_MEASUREMENT_UUID).await.unwrap();
        assert_eq!(stream.next().await, Some(vec![0, 70]));

        link.disconnect().await.unwrap();
        assert_eq!(stream.next().await, None);
        assert_eq!(adapter.live_links(), 0);

        drop(link);
        assert_eq!(adapter.live_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_and_wrong_characteristic() {
        let adapter = SimulatedAdapter::new().with_unreachable("DE:AD");
        assert!(adapter.connect("DE:AD").await.is_err());

        let link = adapter.connect("BE:EF").await.unwrap();
        assert!(link.subscribe(Uuid::nil()).await.is_err());
    }
}
