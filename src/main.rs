use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::sync::mpsc;

mod adapter;
#[cfg(feature = "ble-central")]
mod btle;
mod config;
mod coordinator;
mod decoder;
mod error;
mod fake;
mod hub;
mod scanner;
mod server;
mod session;
mod signal;
mod store;

use adapter::BleAdapter;
use config::Args;
use coordinator::Coordinator;
use fake::SimulatedAdapter;
use hub::BroadcastHub;
use scanner::DeviceScanner;
use server::AppState;
use session::DeviceSession;
use store::{StoreWriter, TimeSeriesStore};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let store = TimeSeriesStore::open(&args.db_path)
        .with_context(|| format!("failed to open database {}", args.db_path.display()))?;
    let (writer, _writer_task) = StoreWriter::spawn(store.clone());

    let adapter = select_adapter(&args).await;

    let (tx_signal, rx_signal) = mpsc::channel(128);
    let hub = Arc::new(BroadcastHub::new());
    let forwarder = coordinator::forward_signals(rx_signal, Arc::clone(&hub));

    let session = Arc::new(DeviceSession::new(Arc::clone(&adapter), writer.clone(), tx_signal));
    let state = AppState {
        coordinator: Coordinator::new(Arc::clone(&session)),
        hub,
        scanner: DeviceScanner::new(adapter),
        store,
        scan_timeout: args.scan_timeout,
    };

    let (addr, server) = warp::serve(server::routes(state))
        .try_bind_with_graceful_shutdown(args.bind, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .with_context(|| format!("failed to bind {}", args.bind))?;

    info!("Listening on http://{}", addr);
    server.await;

    info!("Shutting down");
    session.disconnect().await;

    if tokio::time::timeout(FLUSH_TIMEOUT, writer.flush()).await.is_err() {
        warn!("Gave up waiting for pending measurements");
    }
    forwarder.abort();
    Ok(())
}

async fn select_adapter(args: &Args) -> Arc<dyn BleAdapter> {
    let simulated = || -> Arc<dyn BleAdapter> {
        Arc::new(
            SimulatedAdapter::new()
                .with_interval(args.sim_interval())
                .with_seed(args.sim_seed),
        )
    };

    if args.simulate {
        info!("Using simulated adapter");
        return simulated();
    }

    #[cfg(feature = "ble-central")]
    match btle::BtleplugAdapter::new().await {
        Ok(adapter) => return Arc::new(adapter),
        Err(e) => warn!("{}, falling back to simulated adapter", e),
    }

    #[cfg(not(feature = "ble-central"))]
    warn!("Built without ble-central, using simulated adapter");

    simulated()
}
