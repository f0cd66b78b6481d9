//! The one live connection to a heart-rate peripheral.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --disconnect--> Disconnected
//!                               |
//!                               +--err--> Failed --> Disconnected
//! ```
//!
//! `connect` and `disconnect` run under one async mutex, so at most one link
//! is ever published. Each request also bumps an epoch; a connect that
//! finishes opening its link after a newer request arrived closes the link
//! again instead of publishing it.
//!
//! Notifications are consumed by a per-link pump task which decodes them,
//! refreshes the current reading, queues the write and then emits the
//! `heart_rate` signal, in that order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{BleAdapter, BleLink, NotificationStream, HEART_RATE_MEASUREMENT_UUID};
use crate::decoder;
use crate::error::ConnectError;
use crate::signal::ViewerSignal;
use crate::store::StoreWriter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub address: Option<String>,
    pub value: Option<u16>,
}

/// Where a session's output goes. Shared with the pump task.
#[derive(Clone)]
struct SessionSink {
    tx_signal: mpsc::Sender<ViewerSignal>,
    writer: StoreWriter,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl SessionSink {
    async fn emit(&self, signal: ViewerSignal) {
        if self.tx_signal.send(signal).await.is_err() {
            debug!("No one is listening for session signals");
        }
    }

    fn set_state(&self, state: ConnectionState, address: Option<&str>) {
        self.status.send_modify(|status| {
            status.state = state;
            status.address = address.map(str::to_string);
            if state != ConnectionState::Connected {
                status.value = None;
            }
        });
    }

    fn set_value(&self, value: u16) {
        self.status.send_modify(|status| status.value = Some(value));
    }
}

struct ActiveLink {
    address: String,
    link: Arc<dyn BleLink>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

/// Cleans up after a `connect` future that is dropped part way through,
/// e.g. by a caller's timeout.
struct ConnectAttempt<'a> {
    sink: &'a SessionSink,
    link: Option<Arc<dyn BleLink>>,
    done: bool,
}

impl<'a> ConnectAttempt<'a> {
    fn new(sink: &'a SessionSink) -> Self {
        ConnectAttempt { sink, link: None, done: false }
    }

    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!("Connection attempt abandoned");
        self.sink.set_state(ConnectionState::Disconnected, None);

        if let Some(link) = self.link.take() {
            close_in_background(link);
        }
    }
}

/// Finishes a teardown whose future was dropped before the link was closed.
/// The link has already left `active` by then, so nothing else would.
struct Teardown<'a> {
    sink: &'a SessionSink,
    link: Option<Arc<dyn BleLink>>,
}

impl Teardown<'_> {
    fn finish(mut self) {
        self.link = None;
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else { return; };
        warn!("Teardown of {} abandoned", link.address());
        self.sink.set_state(ConnectionState::Disconnected, None);
        if self.sink.tx_signal.try_send(ViewerSignal::status("Disconnected")).is_err() {
            debug!("Could not report abandoned teardown of {}", link.address());
        }
        close_in_background(link);
    }
}

/// Disconnect `link` on a spawned task. For drop paths, which cannot await.
fn close_in_background(link: Arc<dyn BleLink>) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = link.disconnect().await {
                    warn!("Failed to close abandoned link to {}: {}", link.address(), e);
                }
            });
        }
        Err(_) => warn!("No runtime left to close abandoned link to {}", link.address()),
    }
}

pub struct DeviceSession {
    adapter: Arc<dyn BleAdapter>,
    sink: SessionSink,
    active: Mutex<Option<ActiveLink>>,
    epoch: AtomicU64,
}

impl DeviceSession {
    pub fn new(adapter: Arc<dyn BleAdapter>, writer: StoreWriter, tx_signal: mpsc::Sender<ViewerSignal>) -> Self {
        DeviceSession {
            adapter,
            sink: SessionSink {
                tx_signal,
                writer,
                status: Arc::new(watch::Sender::new(SessionStatus::default())),
            },
            active: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// State, address and latest decoded heart rate of the current connection.
    pub fn status(&self) -> SessionStatus {
        self.sink.status.borrow().clone()
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Connect to `address`, tearing down any existing session first.
    ///
    /// Failures are reported to viewers as an `error` signal and leave the
    /// session disconnected. The future may be dropped at any await point
    /// without leaving a link open.
    pub async fn connect(&self, address: &str) {
        let epoch = self.bump_epoch();
        let mut active = self.active.lock().await;

        if let Some(previous) = active.take() {
            self.teardown(previous).await;
        }

        if !self.is_current(epoch) {
            debug!("Connect to {} superseded before it started", address);
            return;
        }

        let mut attempt = ConnectAttempt::new(&self.sink);
        self.sink.set_state(ConnectionState::Connecting, Some(address));
        self.sink.emit(ViewerSignal::status(format!("Connecting to {address}"))).await;

        let (link, notifications) = match self.open(address, &mut attempt).await {
            Ok(opened) => opened,
            Err(e) => {
                error!("Connection error: {}", e);
                self.sink.set_state(ConnectionState::Failed, Some(address));
                self.sink.emit(ViewerSignal::error(e.to_string())).await;
                self.sink.set_state(ConnectionState::Disconnected, None);
                attempt.finish();
                return;
            }
        };

        if !self.is_current(epoch) {
            info!("Connection to {} superseded, closing it", address);
            attempt.link = None;
            if let Err(e) = link.disconnect().await {
                warn!("Failed to close superseded link to {}: {}", address, e);
            }
            self.sink.set_state(ConnectionState::Disconnected, None);
            self.sink
                .emit(ViewerSignal::status(format!("Connection to {address} superseded")))
                .await;
            attempt.finish();
            return;
        }

        self.sink.set_state(ConnectionState::Connected, Some(address));
        self.sink.emit(ViewerSignal::status(format!("Connected to {address}"))).await;

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_notifications(
            self.sink.clone(),
            address.to_string(),
            notifications,
            cancel.clone(),
        ));
        *active = Some(ActiveLink {
            address: address.to_string(),
            link,
            cancel,
            pump,
        });
        attempt.link = None;
        attempt.finish();
        info!("Connected to {}", address);
    }

    async fn open(
        &self,
        address: &str,
        attempt: &mut ConnectAttempt<'_>,
    ) -> Result<(Arc<dyn BleLink>, NotificationStream), ConnectError> {
        let link: Arc<dyn BleLink> = Arc::from(self.adapter.connect(address).await?);
        attempt.link = Some(Arc::clone(&link));

        match link.subscribe(HEART_RATE_MEASUREMENT_UUID).await {
            Ok(notifications) => Ok((link, notifications)),
            Err(e) => {
                attempt.link = None;
                if let Err(close_err) = link.disconnect().await {
                    warn!("Failed to close link to {}: {}", address, close_err);
                }
                Err(e)
            }
        }
    }

    /// Close the current session. Does nothing when there is none.
    pub async fn disconnect(&self) {
        self.bump_epoch();
        let mut active = self.active.lock().await;

        match active.take() {
            Some(previous) => self.teardown(previous).await,
            None => debug!("Disconnect requested with no active session"),
        }
    }

    /// Stop the pump and close the link. Safe to drop part way through:
    /// the session still ends up disconnected with the link closed.
    async fn teardown(&self, active: ActiveLink) {
        let ActiveLink { address, link, cancel, pump } = active;
        cancel.cancel();
        let guard = Teardown {
            sink: &self.sink,
            link: Some(Arc::clone(&link)),
        };

        if let Err(e) = pump.await {
            warn!("Notification task for {} ended abnormally: {}", address, e);
        }
        if let Err(e) = link.disconnect().await {
            warn!("Disconnect from {} failed: {}", address, e);
        }
        guard.finish();

        info!("Disconnected from {}", address);
        self.sink.set_state(ConnectionState::Disconnected, None);
        self.sink.emit(ViewerSignal::status("Disconnected")).await;
    }
}

async fn pump_notifications(
    sink: SessionSink,
    address: String,
    mut notifications: NotificationStream,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = notifications.next() => next,
        };

        let Some(payload) = next else {
            warn!("Notification stream from {} ended", address);
            sink.set_state(ConnectionState::Disconnected, None);
            sink.emit(ViewerSignal::status(format!("Connection lost to {address}"))).await;
            return;
        };

        on_notification(&sink, &address, &payload).await;
    }
}

async fn on_notification(sink: &SessionSink, address: &str, payload: &[u8]) {
    let bpm = match decoder::decode(payload) {
        Ok(bpm) => bpm,
        Err(e) => {
            warn!("Dropping malformed sample from {}: {}", address, e);
            return;
        }
    };

    debug!("Heart Rate: {}", bpm);
    sink.set_value(bpm);
    sink.writer.submit(bpm, address);
    sink.emit(ViewerSignal::HeartRate { value: bpm }).await;
}
