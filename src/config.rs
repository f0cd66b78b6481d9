use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Stream heart-rate readings from a BLE monitor to browser viewers
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address the HTTP/WebSocket server listens on
    #[arg(long, env = "HRSTREAM_BIND", default_value = "127.0.0.1:8000")]
    pub bind: SocketAddr,

    /// SQLite database holding the measurement log
    #[arg(long, env = "HRSTREAM_DB", default_value = "heart_rate.db")]
    pub db_path: PathBuf,

    /// Use the simulated adapter even if a radio is available
    #[arg(long, env = "HRSTREAM_SIMULATE")]
    pub simulate: bool,

    /// How long a device scan listens for advertisements, in seconds
    #[arg(long, default_value = "5.0")]
    pub scan_timeout: f64,

    /// Period between simulated heart-rate notifications, in milliseconds
    #[arg(long, default_value = "1000")]
    pub sim_interval_ms: u64,

    /// Seed for simulated heart-rate values
    #[arg(long, default_value = "42")]
    pub sim_seed: u64,
}

impl Args {
    pub fn sim_interval(&self) -> Duration {
        Duration::from_millis(self.sim_interval_ms.max(1))
    }
}
