//! Hexagonal ports. Every trait here is a seam between a component crate
//! (which depends only on `domain`) and a concrete adapter (which lives in
//! the `sleigh` binary crate). No component crate depends on another
//! component crate; they only ever depend on the traits below.

use crate::errors::{IngestError, NotifyError, ObjectStoreError, StoreError};
use crate::types::{DeviceEvent, Observation, ObservationRow};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Ingest Buffer inbound port
// ---------------------------------------------------------------------------

/// A batch of records destined for one Store table (spec §4.1, §4.3).
///
/// The Ingest Buffer partitions pending records by table and flushes each
/// non-empty partition as a single [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    /// Source-A observations.
    Observations(Vec<Observation>),
    /// Source-B device events.
    DeviceEvents(Vec<DeviceEvent>),
}

impl Batch {
    /// Number of records carried by this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Observations(v) => v.len(),
            Self::DeviceEvents(v) => v.len(),
        }
    }

    /// Whether this batch carries no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inbound port implemented by the Ingest Buffer; depended on by both
/// subscribers (spec §4.2, §4.3). A subscriber's sole observable effect is
/// a call through this port.
#[expect(
    async_fn_in_trait,
    reason = "no dyn dispatch needed; internal workspace only"
)]
pub trait IngestSink {
    /// Enqueue one Source-A observation.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Closed`] once the buffer has been shut down.
    /// A full buffer never errors here; it sheds its oldest pending record
    /// instead (spec §4.3).
    async fn enqueue_observation(&self, observation: Observation) -> Result<(), IngestError>;

    /// Enqueue one Source-B device event.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Closed`] once the buffer has been shut down.
    async fn enqueue_device_event(&self, event: DeviceEvent) -> Result<(), IngestError>;
}

// ---------------------------------------------------------------------------
// Store outbound ports
// ---------------------------------------------------------------------------

/// Outbound port the Ingest Buffer's drain task writes through (spec §4.1).
///
/// Implemented by the concrete store adapter in `sleigh`.
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait StoreWriter {
    /// Atomically append one non-empty batch to its target table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageFull`] when free space is below the
    /// configured floor, [`StoreError::StorageCorrupted`] on an integrity
    /// error, or [`StoreError::Io`] for any other failure.
    async fn append_batch(&self, batch: Batch) -> Result<(), StoreError>;
}

/// A read-only, point-in-time view of the Store (spec §3 "Snapshot").
///
/// Readers (Aggregator, Segmenter via Aggregator, Health Monitor) hold a
/// snapshot only for the duration of one query pass and release it
/// promptly so the writer can checkpoint (spec §4.1).
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait Snapshot: Send + Sync {
    /// Observations with `ts >= since`, ordered by `ts` ascending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any read failure.
    async fn observations_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ObservationRow>, StoreError>;

    /// Timestamp of the earliest persisted observation, or `None` if the
    /// table is empty. Used by the Aggregator to bound the 1-hour series
    /// (spec §4.4).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any read failure.
    async fn earliest_observation_time(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Outbound port implemented by the concrete store adapter; owned by the
/// Supervisor and used to obtain snapshots, rotate the store file for a
/// cold backup, and close it on shutdown (spec §4.1, §4.7).
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait Store {
    /// The snapshot type this store produces.
    type Snap: Snapshot;

    /// Obtain a read-only snapshot, suitable for [`Snapshot`] queries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the snapshot cannot be established.
    async fn snapshot(&self) -> Result<Self::Snap, StoreError>;

    /// Close the current store file, archive it at `archive_path`, and open
    /// a fresh, empty store at the original path (spec §4.7 cold backup).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the rotation cannot be completed.
    async fn rotate(&self, archive_path: &std::path::Path) -> Result<(), StoreError>;

    /// Flush and close the store. Idempotent (spec §4.1).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a failed flush.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Outbound port the Health Monitor reads store-file health through
/// (spec §4.8). Kept separate from [`Store`] so adapters that only expose
/// filesystem stats (e.g. a thin wrapper around the store's on-disk path)
/// need not implement the full read/write surface.
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait StoreStats {
    /// Size in bytes of the store's primary file on disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be statted.
    async fn file_size_bytes(&self) -> Result<u64, StoreError>;

    /// Free space in bytes on the filesystem backing the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the filesystem cannot be statted.
    async fn free_space_bytes(&self) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// Object store outbound port
// ---------------------------------------------------------------------------

/// Outbound port the Publisher pushes artifacts and backups through
/// (spec §4.7, §6).
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait ObjectStore {
    /// `PutObject` at a fixed key; overwrite semantics (last-writer-wins).
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::Transient`] for network/5xx failures the
    /// caller may retry, or [`ObjectStoreError::Permanent`] otherwise.
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<(), ObjectStoreError>;
}

/// Outbound port the Publisher copies the rotated store file through when
/// materializing a cold backup (spec §4.7, §9 scoped-acquisition note).
///
/// Implementations must guarantee that any temporary file created to
/// satisfy a call is removed before the call returns, on every exit path
/// including error propagation -- never relying on a process-exit handler.
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait BackupSource {
    /// Read the archived store file at `archive_path` into memory, or
    /// stream it, for upload as a backup object.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the archive cannot be read.
    async fn read_archive(&self, archive_path: &std::path::Path) -> Result<Vec<u8>, StoreError>;
}

// ---------------------------------------------------------------------------
// Health notification outbound port
// ---------------------------------------------------------------------------

/// What threshold a [`Notification`] is reporting on; used as half of the
/// rate-limiting key `(kind, cooldown-window)` (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// Emitted once per process at startup with the effective configuration.
    Startup,
    /// Store free space fell below `alert.free_space_mb`.
    LowFreeSpace,
    /// Store file size exceeded `alert.db_size_mb`.
    StoreSizeThreshold,
    /// The Ingest Buffer entered shed mode.
    ShedMode,
}

/// A single health/operational notification, carrying current values and
/// the threshold that triggered it (spec §4.8).
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub subject: String,
    pub body: String,
}

/// Outbound port the Health Monitor emits notifications through.
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait HealthNotifier {
    /// Deliver `notification`. Best-effort: callers log failures and
    /// continue rather than treat them as fatal (spec §7).
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::DeliveryFailed`] if the transport fails.
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Reference to a rotated/archived store file, named by the Publisher when
/// it performs a cold backup (spec §4.7). Plain data, not a port, but kept
/// here alongside the ports that pass it around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedStore {
    pub path: PathBuf,
    pub year_month: String,
}
