//! Append-only heart-rate log backed by SQLite.
//!
//! Measurements are only ever inserted. Reads are bucketed aggregates
//! (`minute`, `hour`, `day`) or the most recent raw rows. All writes from a
//! live session go through [`StoreWriter`], a single task that applies them
//! in the order they were submitted.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, error};
use rusqlite::{params, Connection};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::StorageError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS measurements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
    value INTEGER,
    device_address TEXT
)";

/// One persisted heart-rate reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: u16,
    pub device_address: String,
}

/// Granularity of a history query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Period {
    #[default]
    Minute,
    Hour,
    Day,
    Raw,
}

impl Period {
    fn bucket_format(self) -> Option<&'static str> {
        match self {
            Period::Minute => Some("%Y-%m-%d %H:%M"),
            Period::Hour => Some("%Y-%m-%d %H:00"),
            Period::Day => Some("%Y-%m-%d"),
            Period::Raw => None,
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(Period::Minute),
            "hour" => Ok(Period::Hour),
            "day" => Ok(Period::Day),
            "raw" => Ok(Period::Raw),
            _ => Err(format!("Invalid period: {}. Use minute, hour, day or raw", s)),
        }
    }
}

/// A point on the history chart: a bucket label (or raw timestamp) and a
/// rounded bpm value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPoint {
    pub timestamp: String,
    pub value: i64,
}

#[derive(Clone)]
pub struct TimeSeriesStore {
    conn: Arc<Mutex<Connection>>,
}

impl TimeSeriesStore {
    /// Open (or create) the database file and make sure the table exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Create the schema. Safe to run against an initialised database.
    pub fn init(&self) -> Result<(), StorageError> {
        self.lock()?.execute(SCHEMA, [])?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("connection lock poisoned".to_string()))
    }

    /// Persist a reading stamped with the current UTC time.
    pub fn append(&self, value: u16, device_address: &str) -> Result<Measurement, StorageError> {
        self.append_at(value, device_address, Utc::now())
    }

    pub fn append_at(
        &self,
        value: u16,
        device_address: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Measurement, StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO measurements (timestamp, value, device_address) VALUES (?1, ?2, ?3)",
            params![timestamp.format(TIMESTAMP_FORMAT).to_string(), value, device_address],
        )?;

        Ok(Measurement {
            id: conn.last_insert_rowid(),
            timestamp,
            value,
            device_address: device_address.to_string(),
        })
    }

    /// The `limit` most recent buckets (or raw rows), oldest first. Values are
    /// rounded half away from zero.
    pub fn query_aggregate(&self, period: Period, limit: i64) -> Result<Vec<HistoryPoint>, StorageError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let mut stmt = match period.bucket_format() {
            Some(format) => conn.prepare(&format!(
                "SELECT strftime('{format}', timestamp) AS time_bucket, AVG(value)
                 FROM measurements
                 GROUP BY time_bucket
                 ORDER BY time_bucket DESC
                 LIMIT ?1"
            ))?,
            None => conn.prepare(
                "SELECT timestamp, value
                 FROM measurements
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?1",
            )?,
        };

        let rows = stmt.query_map(params![limit], |row| {
            let timestamp: String = row.get(0)?;
            let value: f64 = row.get(1)?;
            Ok(HistoryPoint {
                timestamp,
                value: value.round() as i64,
            })
        })?;

        let mut points = rows.collect::<Result<Vec<_>, _>>()?;
        points.reverse();
        Ok(points)
    }

    /// [`Self::query_aggregate`] off the async runtime.
    pub async fn history(&self, period: Period, limit: i64) -> Result<Vec<HistoryPoint>, StorageError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.query_aggregate(period, limit))
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
    }
}

enum PendingWrite {
    Measurement { value: u16, device_address: String },
    /// Answered once every write queued before it has been applied.
    Flush(oneshot::Sender<()>),
}

/// Handle to the single task that owns all live writes.
///
/// `submit` never blocks the caller; writes land in submission order and a
/// failed write is logged and dropped. The task keeps serving later writes
/// after a failure.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<PendingWrite>,
}

impl StoreWriter {
    pub fn spawn(store: TimeSeriesStore) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PendingWrite>();

        let handle = tokio::spawn(async move {
            while let Some(write) = rx.recv().await {
                let (value, device_address) = match write {
                    PendingWrite::Measurement { value, device_address } => (value, device_address),
                    PendingWrite::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };

                let store = store.clone();
                let result = tokio::task::spawn_blocking(move || store.append(value, &device_address)).await;

                match result {
                    Ok(Ok(measurement)) => debug!("Stored measurement #{}", measurement.id),
                    Ok(Err(e)) => error!("Dropping measurement: {}", e),
                    Err(e) => error!("Store write task failed: {}", e),
                }
            }
            debug!("Store writer stopped");
        });

        (Self { tx }, handle)
    }

    pub fn submit(&self, value: u16, device_address: &str) {
        let write = PendingWrite::Measurement {
            value,
            device_address: device_address.to_string(),
        };
        if self.tx.send(write).is_err() {
            error!("Store writer is gone, dropping measurement {}", value);
        }
    }

    /// Wait until everything submitted so far has been written or dropped.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(PendingWrite::Flush(done)).is_err() {
            debug!("Store writer already stopped");
            return;
        }
        let _ = wait.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_append_then_raw_query() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        let m = store.append(72, "AA:BB").unwrap();
        assert_eq!(m.value, 72);
        assert_eq!(m.device_address, "AA:BB");

        let points = store.query_aggregate(Period::Raw, 1).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 72);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        let a = store.append(60, "AA:BB").unwrap();
        let b = store.append(61, "AA:BB").unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn test_minute_bucket_mean() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        for (v, s) in [(60, 5), (70, 20), (80, 40)] {
            store.append_at(v, "AA:BB", at(10, 15, s)).unwrap();
        }

        let points = store.query_aggregate(Period::Minute, 1).unwrap();
        assert_eq!(
            points,
            vec![HistoryPoint {
                timestamp: "2026-03-14 10:15".to_string(),
                value: 70
            }]
        );
    }

    #[test]
    fn test_buckets_are_latest_first_then_reversed() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        store.append_at(60, "AA:BB", at(8, 0, 0)).unwrap();
        store.append_at(70, "AA:BB", at(9, 10, 0)).unwrap();
        store.append_at(71, "AA:BB", at(9, 50, 0)).unwrap();
        store.append_at(90, "AA:BB", at(11, 0, 0)).unwrap();

        let points = store.query_aggregate(Period::Hour, 2).unwrap();
        let labels: Vec<_> = points.iter().map(|p| p.timestamp.as_str()).collect();
        assert_eq!(labels, ["2026-03-14 09:00", "2026-03-14 11:00"]);
        // 70.5 rounds half away from zero
        assert_eq!(points[0].value, 71);
        assert_eq!(points[1].value, 90);

        let days = store.query_aggregate(Period::Day, 10).unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].timestamp, "2026-03-14");
        assert_eq!(days[0].value, 73);
    }

    #[test]
    fn test_raw_returns_latest_in_ascending_order() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        for (i, v) in [61, 62, 63, 64].into_iter().enumerate() {
            store.append_at(v, "AA:BB", at(12, 0, i as u32)).unwrap();
        }

        let values: Vec<_> = store
            .query_aggregate(Period::Raw, 3)
            .unwrap()
            .into_iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, [62, 63, 64]);
    }

    #[test]
    fn test_non_positive_limit_is_empty() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        store.append(72, "AA:BB").unwrap();
        assert!(store.query_aggregate(Period::Raw, 0).unwrap().is_empty());
        assert!(store.query_aggregate(Period::Minute, -5).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_is_idempotent_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heart_rate.db");

        {
            let store = TimeSeriesStore::open(&path).unwrap();
            store.init().unwrap();
            store.append(88, "11:22").unwrap();
        }

        let store = TimeSeriesStore::open(&path).unwrap();
        let points = store.query_aggregate(Period::Raw, 10).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 88);
    }

    #[test]
    fn test_period_from_str() {
        assert_eq!("hour".parse::<Period>(), Ok(Period::Hour));
        assert_eq!("raw".parse::<Period>(), Ok(Period::Raw));
        assert!("week".parse::<Period>().is_err());
        assert_eq!(Period::default(), Period::Minute);
    }

    #[tokio::test]
    async fn test_writer_keeps_submission_order() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        let (writer, handle) = StoreWriter::spawn(store.clone());

        for v in [90, 91, 92, 93] {
            writer.submit(v, "AA:BB");
        }
        drop(writer);
        handle.await.unwrap();

        let values: Vec<_> = store
            .history(Period::Raw, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, [90, 91, 92, 93]);
    }

    #[tokio::test]
    async fn test_writer_survives_failed_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heart_rate.db");
        let store = TimeSeriesStore::open(&path).unwrap();
        let (writer, handle) = StoreWriter::spawn(store.clone());

        // pull the table out from under the writer
        Connection::open(&path)
            .unwrap()
            .execute("DROP TABLE measurements", [])
            .unwrap();
        writer.submit(70, "AA:BB");
        writer.flush().await;
        assert!(!handle.is_finished());

        store.init().unwrap();
        writer.submit(71, "AA:BB");
        writer.flush().await;

        let values: Vec<_> = store
            .query_aggregate(Period::Raw, 10)
            .unwrap()
            .into_iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, [71]);
    }
}
