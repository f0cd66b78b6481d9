use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::hub::BroadcastHub;
use crate::session::DeviceSession;
use crate::signal::{ViewerCommand, ViewerSignal};

/// Routes viewer commands to the device session. Holds no state of its own.
#[derive(Clone)]
pub struct Coordinator {
    session: Arc<DeviceSession>,
}

impl Coordinator {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Coordinator { session }
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub async fn handle(&self, command: ViewerCommand) {
        match command {
            ViewerCommand::Connect { address } => self.session.connect(&address).await,
            ViewerCommand::Disconnect => self.session.disconnect().await,
            ViewerCommand::Unknown => debug!("Ignoring unknown viewer command"),
        }
    }

    /// Handle one raw text frame from a viewer.
    pub async fn handle_text(&self, text: &str) {
        let command = ViewerCommand::parse(text);
        if command == ViewerCommand::Unknown {
            warn!("Ignoring malformed viewer command: {}", text);
            return;
        }
        self.handle(command).await;
    }
}

/// Relay everything the session emits to the connected viewers, in order.
pub fn forward_signals(mut rx_signal: mpsc::Receiver<ViewerSignal>, hub: Arc<BroadcastHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = rx_signal.recv().await {
            hub.broadcast(&signal);
        }
        debug!("Session signal channel closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::fake::SimulatedAdapter;
    use crate::session::ConnectionState;
    use crate::store::{StoreWriter, TimeSeriesStore};

    fn wire() -> (Coordinator, Arc<BroadcastHub>) {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        let (writer, _) = StoreWriter::spawn(store);
        let (tx, rx) = mpsc::channel(128);
        let hub = Arc::new(BroadcastHub::new());
        forward_signals(rx, hub.clone());
        let session = Arc::new(DeviceSession::new(Arc::new(SimulatedAdapter::new()), writer, tx));
        (Coordinator::new(session), hub)
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_reach_session_and_viewers() {
        let (coordinator, hub) = wire();
        let (_id, mut viewer) = hub.register();

        coordinator
            .handle_text(r#"{"action":"connect","address":"00:11:22:33:44:55"}"#)
            .await;
        assert_eq!(coordinator.session().status().state, ConnectionState::Connected);

        coordinator.handle_text(r#"{"action":"disconnect"}"#).await;
        assert_eq!(coordinator.session().status().state, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut seen = Vec::new();
        while let Ok(signal) = viewer.try_recv() {
            seen.push(signal);
        }
        assert_eq!(seen.first(), Some(&ViewerSignal::status("Connecting to 00:11:22:33:44:55")));
        assert_eq!(seen.last(), Some(&ViewerSignal::status("Disconnected")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_commands_are_ignored() {
        let (coordinator, hub) = wire();
        let (_id, mut viewer) = hub.register();

        coordinator.handle_text(r#"{"action":"launch"}"#).await;
        coordinator.handle_text("garbage").await;
        coordinator.handle(ViewerCommand::Unknown).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.session().status().state, ConnectionState::Disconnected);
        assert!(viewer.try_recv().is_err());
    }
}
