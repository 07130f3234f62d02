//! SQLite adapter for the Store outbound ports (spec §4.1): `StoreWriter`,
//! `Store`/`Snapshot`, `StoreStats`, `BackupSource`.
//!
//! Persists `Observation`/`DeviceEvent` rows via `sqlx`, the same crate and
//! `INSERT`-per-row style the teacher crate used for its own
//! `SqliteStorage` adapter. The pool sits behind a `RwLock` only so
//! [`SqliteStore::rotate`] can swap it out for a fresh one -- every other
//! operation takes the read side and never blocks on it.

use chrono::{DateTime, Utc};
use domain::{
    ArchivedStore, BackupSource, Batch, DeviceClass, DeviceEvent, Observation, ObservationRow, Qos, Snapshot,
    Store, StoreError, StoreStats, StoreWriter,
};
use sqlx::{Row as _, SqlitePool};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.message().contains("malformed") || db_err.message().contains("corrupt") => {
            StoreError::StorageCorrupted(db_err.message().to_owned())
        }
        _ => StoreError::Io(err.to_string()),
    }
}

async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS observations (
            id       INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_micros INTEGER NOT NULL,
            topic    TEXT    NOT NULL,
            payload  TEXT    NOT NULL,
            qos      INTEGER NOT NULL,
            retained INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_observations_ts ON observations (ts_micros)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS device_events (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_micros    INTEGER NOT NULL,
            device_id    TEXT    NOT NULL,
            device_class TEXT    NOT NULL,
            temperature  REAL,
            humidity     REAL,
            battery      INTEGER NOT NULL,
            signal       INTEGER NOT NULL,
            raw_payload  TEXT    NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn open_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let opts = sqlx::sqlite::SqliteConnectOptions::new().filename(path).create_if_missing(true);
    let pool = SqlitePool::connect_with(opts).await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// `Store`/`StoreWriter`/`StoreStats`/`BackupSource` adapter backed by a
/// SQLite file (spec §4.1).
#[derive(Debug)]
pub struct SqliteStore {
    path: PathBuf,
    free_space_floor_bytes: u64,
    pool: RwLock<SqlitePool>,
}

impl SqliteStore {
    /// Open (or create) the store file at `path` and ensure its schema
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be opened or the schema
    /// cannot be created.
    pub async fn open(path: impl Into<PathBuf>, free_space_floor_bytes: u64) -> Result<Self, StoreError> {
        let path = path.into();
        let pool = open_pool(&path).await.map_err(map_sqlx_error)?;
        Ok(Self { path, free_space_floor_bytes, pool: RwLock::new(pool) })
    }

    async fn free_space_bytes_impl(&self) -> Result<u64, StoreError> {
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || fs4::available_space(&dir))
            .await
            .map_err(|err| StoreError::Io(err.to_string()))?
            .map_err(|err| StoreError::Io(err.to_string()))
    }
}

impl StoreWriter for SqliteStore {
    /// # Errors
    ///
    /// Returns [`StoreError::StorageFull`] when free space is below the
    /// configured floor, before any write is attempted (spec §4.1).
    async fn append_batch(&self, batch: Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.free_space_bytes_impl().await? < self.free_space_floor_bytes {
            return Err(StoreError::StorageFull);
        }

        let pool = self.pool.read().await;
        let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

        match batch {
            Batch::Observations(observations) => {
                for obs in observations {
                    sqlx::query(
                        "INSERT INTO observations (ts_micros, topic, payload, qos, retained) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(obs.ts.timestamp_micros())
                    .bind(&obs.topic)
                    .bind(&obs.payload)
                    .bind(i64::from(u8::from(obs.qos)))
                    .bind(i64::from(obs.retained))
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;
                }
            }
            Batch::DeviceEvents(events) => {
                for event in events {
                    let class = match event.device_class {
                        DeviceClass::AirSensor => "air-sensor",
                        DeviceClass::WaterSensor => "water-sensor",
                    };
                    sqlx::query(
                        "INSERT INTO device_events
                         (ts_micros, device_id, device_class, temperature, humidity, battery, signal, raw_payload)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(event.ts.timestamp_micros())
                    .bind(&event.device_id)
                    .bind(class)
                    .bind(event.temperature)
                    .bind(event.humidity)
                    .bind(i64::from(event.battery))
                    .bind(i64::from(event.signal))
                    .bind(&event.raw_payload)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;
                }
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }
}

/// Read-only handle drawn from [`SqliteStore::snapshot`]. SQLite's own MVCC
/// gives each connection a consistent view of committed data, so this is a
/// thin clone of the pool handle rather than a separate transaction (spec
/// §3 "Snapshot").
#[derive(Debug, Clone)]
pub struct SqliteSnapshot {
    pool: SqlitePool,
}

impl Snapshot for SqliteSnapshot {
    async fn observations_since(&self, since: DateTime<Utc>) -> Result<Vec<ObservationRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, ts_micros, topic, payload, qos, retained FROM observations WHERE ts_micros >= ? ORDER BY ts_micros ASC",
        )
        .bind(since.timestamp_micros())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                let qos_raw: i64 = row.try_get("qos").map_err(map_sqlx_error)?;
                #[expect(clippy::cast_sign_loss, clippy::cast_possible_truncation, reason = "qos is stored as 0..=2")]
                let qos = Qos::try_from(qos_raw as u8)
                    .map_err(|err| StoreError::StorageCorrupted(err.to_string()))?;
                let ts_micros: i64 = row.try_get("ts_micros").map_err(map_sqlx_error)?;
                let ts = DateTime::from_timestamp_micros(ts_micros)
                    .ok_or_else(|| StoreError::StorageCorrupted("unrepresentable ts_micros".to_owned()))?;
                let retained: i64 = row.try_get("retained").map_err(map_sqlx_error)?;
                Ok(ObservationRow {
                    id: row.try_get("id").map_err(map_sqlx_error)?,
                    observation: Observation {
                        ts,
                        topic: row.try_get("topic").map_err(map_sqlx_error)?,
                        payload: row.try_get("payload").map_err(map_sqlx_error)?,
                        qos,
                        retained: retained != 0,
                    },
                })
            })
            .collect()
    }

    async fn earliest_observation_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let (micros,): (Option<i64>,) = sqlx::query_as("SELECT MIN(ts_micros) FROM observations")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(micros.and_then(DateTime::from_timestamp_micros))
    }
}

impl Store for SqliteStore {
    type Snap = SqliteSnapshot;

    async fn snapshot(&self) -> Result<Self::Snap, StoreError> {
        Ok(SqliteSnapshot { pool: self.pool.read().await.clone() })
    }

    /// Close the current store file, archive it at `archive_path`, and open
    /// a fresh, empty store at the original path (spec §4.7 cold backup).
    async fn rotate(&self, archive_path: &Path) -> Result<(), StoreError> {
        let mut pool = self.pool.write().await;
        pool.close().await;

        tokio::fs::copy(&self.path, archive_path).await.map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::remove_file(&self.path).await.map_err(|e| StoreError::Io(e.to_string()))?;

        let fresh = open_pool(&self.path).await.map_err(map_sqlx_error)?;
        *pool = fresh;
        tracing::info!(path = %self.path.display(), archive = %archive_path.display(), "store.rotated");
        Ok(())
    }

    /// Flush and close the store. Idempotent.
    async fn close(&self) -> Result<(), StoreError> {
        let pool = self.pool.read().await;
        if !pool.is_closed() {
            pool.close().await;
        }
        Ok(())
    }
}

impl StoreStats for SqliteStore {
    async fn file_size_bytes(&self) -> Result<u64, StoreError> {
        let meta = tokio::fs::metadata(&self.path).await.map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(meta.len())
    }

    async fn free_space_bytes(&self) -> Result<u64, StoreError> {
        self.free_space_bytes_impl().await
    }
}

/// `BackupSource` adapter: reads an archived store file from disk (spec
/// §4.7, §9 scoped-acquisition note). Stateless; shares no state with
/// [`SqliteStore`] because the archive it reads has already been detached
/// from the live pool by [`SqliteStore::rotate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileBackupSource;

impl BackupSource for FileBackupSource {
    async fn read_archive(&self, archive_path: &Path) -> Result<Vec<u8>, StoreError> {
        tokio::fs::read(archive_path).await.map_err(|e| StoreError::Io(e.to_string()))
    }
}

/// Helper for the Publisher's backup key, pairing the rotated file with its
/// `YYYY-MM` label (spec §4.7, §6).
#[must_use]
pub fn archived_store(path: PathBuf, year_month: String) -> ArchivedStore {
    ArchivedStore { path, year_month }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::Qos;

    async fn open_memory() -> SqliteStore {
        // A single connection so every query in a test sees the same
        // private in-memory database (SQLite's `:memory:` is otherwise
        // per-connection).
        let opts = sqlx::sqlite::SqliteConnectOptions::new().filename(":memory:");
        let pool = sqlx::sqlite::SqlitePoolOptions::new().max_connections(1).connect_with(opts).await.unwrap();
        create_schema(&pool).await.unwrap();
        SqliteStore { path: PathBuf::from(":memory:"), free_space_floor_bytes: 0, pool: RwLock::new(pool) }
    }

    fn observation(ts: DateTime<Utc>) -> Observation {
        Observation { ts, topic: "sensors/1".to_owned(), payload: "12.5".to_owned(), qos: Qos::AtLeastOnce, retained: false }
    }

    #[tokio::test]
    async fn append_and_read_back_observations_in_order() {
        let store = open_memory().await;
        let t0 = Utc::now();
        store
            .append_batch(Batch::Observations(vec![
                observation(t0),
                observation(t0 + chrono::Duration::seconds(1)),
            ]))
            .await
            .unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let rows = snapshot.observations_since(t0 - chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].id < rows[1].id, "ids must be strictly increasing");
        assert!(rows[0].observation.ts <= rows[1].observation.ts);
    }

    #[tokio::test]
    async fn earliest_observation_time_reflects_min_ts() {
        let store = open_memory().await;
        let t0 = Utc::now();
        store.append_batch(Batch::Observations(vec![observation(t0)])).await.unwrap();
        store.append_batch(Batch::Observations(vec![observation(t0 + chrono::Duration::hours(1))])).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let earliest = snapshot.earliest_observation_time().await.unwrap().unwrap();
        assert_eq!(earliest.timestamp_micros(), t0.timestamp_micros());
    }

    #[tokio::test]
    async fn empty_store_has_no_earliest_observation() {
        let store = open_memory().await;
        let snapshot = store.snapshot().await.unwrap();
        assert!(snapshot.earliest_observation_time().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let store = open_memory().await;
        store.append_batch(Batch::Observations(Vec::new())).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert!(snapshot.observations_since(Utc::now() - chrono::Duration::days(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn device_events_round_trip_water_sensor_without_humidity() {
        let store = open_memory().await;
        let event = DeviceEvent {
            ts: Utc::now(),
            device_id: "water-1".to_owned(),
            device_class: DeviceClass::WaterSensor,
            temperature: Some(58.0),
            humidity: None,
            battery: 77,
            signal: -61,
            raw_payload: "{}".to_owned(),
        };
        store.append_batch(Batch::DeviceEvents(vec![event])).await.unwrap();
        // device_events has no read port on `Snapshot` (spec §4.4 only
        // aggregates Source-A payloads); this test only proves the write
        // path accepts and commits the row without error.
    }
}
