//! Publisher: the mode-aware loop that, while in season, repeatedly
//! produces and pushes the live artifact, and, off season, performs a
//! once-a-month cold backup of the Store (spec §4.7).
//!
//! The Publisher knows nothing about the Aggregator, the Segmenter or the
//! artifact wire format -- it is generic over [`ArtifactProducer`], a
//! local port the `sleigh` binary implements by composing those three
//! crates. This keeps `publish` compiled against `domain` alone, like
//! every other component crate.

use chrono::{DateTime, Datelike, Timelike, Utc};
use domain::{BackupSource, ObjectStore, ObjectStoreError, SeasonConfig, Store, StoreError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Local ports
// ---------------------------------------------------------------------------

/// Produces the gzipped live-artifact bytes for a given instant. The
/// `sleigh` binary's implementation snapshots the Store and runs the
/// Aggregator, Segmenter and Artifact Builder in sequence (spec §4.6,
/// §4.7); the Publisher only ever sees the result.
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait ArtifactProducer {
    /// # Errors
    ///
    /// Returns [`ProduceError`] if any upstream step (snapshot, aggregate,
    /// segment, build) fails.
    async fn produce(&self, now: DateTime<Utc>) -> Result<Vec<u8>, ProduceError>;
}

/// Raised by an [`ArtifactProducer`]; the Publisher treats this exactly
/// like a transient object-store failure for consecutive-failure counting
/// purposes (spec §4.7).
#[derive(Debug, Clone, thiserror::Error)]
#[error("artifact production failed: {0}")]
pub struct ProduceError(pub String);

/// Polled once per cycle so the Health Monitor's store-size / free-space
/// check runs "between cycles" as spec §4.8 requires, without `publish`
/// depending on the `health` crate.
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait HealthProbe {
    async fn probe(&self);
}

impl HealthProbe for () {
    async fn probe(&self) {}
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid publisher configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Produce(#[from] ProduceError),
    #[error("{0} consecutive publish failures, exceeding the configured maximum of {1}")]
    TooManyConsecutiveFailures(u32, u32),
}

// ---------------------------------------------------------------------------
// PublishConfig + builder
// ---------------------------------------------------------------------------

/// Runtime configuration for a [`Publisher`] (spec §4.7, §6).
#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub key: String,
    pub backup_prefix: String,
    pub backup_extension: String,
    pub interval: Duration,
    pub max_consecutive_failures: u32,
    pub backup_day_of_month: u32,
    pub backup_hour: u32,
}

/// Builder for [`PublishConfig`].
#[derive(Debug, Clone)]
pub struct PublishConfigBuilder {
    key: String,
    backup_prefix: String,
    backup_extension: String,
    interval: Duration,
    max_consecutive_failures: u32,
    backup_day_of_month: u32,
    backup_hour: u32,
}

impl PublishConfig {
    #[must_use]
    pub fn builder(key: impl Into<String>, backup_prefix: impl Into<String>) -> PublishConfigBuilder {
        PublishConfigBuilder {
            key: key.into(),
            backup_prefix: backup_prefix.into(),
            backup_extension: "db".to_owned(),
            interval: Duration::from_secs(30),
            max_consecutive_failures: 10,
            backup_day_of_month: 1,
            backup_hour: 3,
        }
    }
}

impl PublishConfigBuilder {
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    #[must_use]
    pub fn backup_schedule(mut self, day_of_month: u32, hour: u32) -> Self {
        self.backup_day_of_month = day_of_month;
        self.backup_hour = hour;
        self
    }

    #[must_use]
    pub fn backup_extension(mut self, extension: impl Into<String>) -> Self {
        self.backup_extension = extension.into();
        self
    }

    /// # Errors
    ///
    /// Returns [`PublishError::InvalidConfig`] if `key`/`backup_prefix` are
    /// empty, `interval` is zero, `max_consecutive_failures` is zero, or
    /// the backup schedule falls outside a valid calendar day/hour.
    pub fn build(self) -> Result<PublishConfig, PublishError> {
        if self.key.trim().is_empty() {
            return Err(PublishError::InvalidConfig { reason: "key must not be empty".to_owned() });
        }
        if self.backup_prefix.trim().is_empty() {
            return Err(PublishError::InvalidConfig { reason: "backup_prefix must not be empty".to_owned() });
        }
        if self.interval.is_zero() {
            return Err(PublishError::InvalidConfig { reason: "interval must be positive".to_owned() });
        }
        if self.max_consecutive_failures == 0 {
            return Err(PublishError::InvalidConfig { reason: "max_consecutive_failures must be at least 1".to_owned() });
        }
        if !(1..=28).contains(&self.backup_day_of_month) {
            return Err(PublishError::InvalidConfig { reason: "backup_day_of_month must be in 1..=28".to_owned() });
        }
        if self.backup_hour > 23 {
            return Err(PublishError::InvalidConfig { reason: "backup_hour must be in 0..=23".to_owned() });
        }
        Ok(PublishConfig {
            key: self.key,
            backup_prefix: self.backup_prefix,
            backup_extension: self.backup_extension,
            interval: self.interval,
            max_consecutive_failures: self.max_consecutive_failures,
            backup_day_of_month: self.backup_day_of_month,
            backup_hour: self.backup_hour,
        })
    }
}

/// Off-season wake cadence (spec §4.7: "wake at minute granularity").
const OFF_SEASON_POLL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Carried across cycles by the caller (spec §4.7 mode re-evaluation, §8
/// mode-exclusivity).
#[derive(Debug, Clone, Default)]
pub struct PublishState {
    consecutive_failures: u32,
    last_backup_month: Option<String>,
}

/// Outcome of a single cycle, for logging and for tests (spec §8
/// mode-exclusivity: exactly one of these per cycle).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Published,
    PublishFailed,
    BackupCreated,
    Idle,
}

/// The Publisher (spec §4.7).
///
/// `state` is carried in the struct, not on the call stack of [`Publisher::run`],
/// so that a restart of `run` by an outer supervisor (spec §7: bounded restart
/// of failed tasks) does not reset `consecutive_failures` back to zero and
/// silently multiply the `max_consecutive_failures` budget it is meant to
/// enforce.
#[derive(Debug)]
pub struct Publisher {
    config: PublishConfig,
    state: tokio::sync::Mutex<PublishState>,
}

impl Publisher {
    #[must_use]
    pub fn new(config: PublishConfig) -> Self {
        Self { config, state: tokio::sync::Mutex::new(PublishState::default()) }
    }

    /// Run the mode-aware loop until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::TooManyConsecutiveFailures`] once the
    /// in-season branch has failed `max_consecutive_failures` times in a
    /// row; the caller (the Supervisor) is expected to exit the process
    /// non-zero so it is restarted (spec §4.7, §7).
    pub async fn run<St, O, B, A, H>(
        &self,
        season: &SeasonConfig,
        store: &St,
        object_store: &O,
        backup_source: &B,
        producer: &A,
        health_probe: &H,
        cancel: CancellationToken,
    ) -> Result<(), PublishError>
    where
        St: Store,
        O: ObjectStore,
        B: BackupSource,
        A: ArtifactProducer,
        H: HealthProbe,
    {
        loop {
            let in_season = season.is_active(Utc::now());
            let wait = if in_season { self.config.interval } else { OFF_SEASON_POLL };
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!("publish.run.cancelled");
                    return Ok(());
                }
                () = tokio::time::sleep(wait) => {}
            }

            let now = Utc::now();
            let outcome = {
                let mut state = self.state.lock().await;
                self.run_cycle(&mut state, season, store, object_store, backup_source, producer, now).await?
            };
            tracing::debug!(?outcome, "publish.cycle.complete");
            health_probe.probe().await;
        }
    }

    /// A single cycle's worth of work, pure enough to unit test directly:
    /// re-evaluates mode against `now` and `season`, then performs exactly
    /// one of {live push, backup, idle} (spec §8 mode-exclusivity).
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::TooManyConsecutiveFailures`] once the
    /// configured ceiling is reached; all other failures are logged and
    /// reported as [`CycleOutcome::PublishFailed`] without incrementing
    /// past the ceiling check's own bookkeeping.
    pub async fn run_cycle<St, O, B, A>(
        &self,
        state: &mut PublishState,
        season: &SeasonConfig,
        store: &St,
        object_store: &O,
        backup_source: &B,
        producer: &A,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, PublishError>
    where
        St: Store,
        O: ObjectStore,
        B: BackupSource,
        A: ArtifactProducer,
    {
        if season.is_active(now) {
            return self.publish_once(state, producer, object_store, now).await;
        }
        self.maybe_backup(state, store, object_store, backup_source, now).await
    }

    async fn publish_once<A, O>(
        &self,
        state: &mut PublishState,
        producer: &A,
        object_store: &O,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, PublishError>
    where
        A: ArtifactProducer,
        O: ObjectStore,
    {
        let result = async {
            let bytes = producer.produce(now).await?;
            object_store.put_object(&self.config.key, bytes, "application/json", Some("gzip")).await?;
            Ok::<(), PublishError>(())
        }
        .await;

        match result {
            Ok(()) => {
                state.consecutive_failures = 0;
                Ok(CycleOutcome::Published)
            }
            Err(err) => {
                state.consecutive_failures += 1;
                tracing::warn!(
                    consecutive_failures = state.consecutive_failures,
                    "publish.push.failed: {err}"
                );
                if state.consecutive_failures >= self.config.max_consecutive_failures {
                    return Err(PublishError::TooManyConsecutiveFailures(
                        state.consecutive_failures,
                        self.config.max_consecutive_failures,
                    ));
                }
                Ok(CycleOutcome::PublishFailed)
            }
        }
    }

    async fn maybe_backup<St, O, B>(
        &self,
        state: &mut PublishState,
        store: &St,
        object_store: &O,
        backup_source: &B,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, PublishError>
    where
        St: Store,
        O: ObjectStore,
        B: BackupSource,
    {
        let year_month = format!("{:04}-{:02}", now.year(), now.month());
        let is_scheduled_instant = now.day() == self.config.backup_day_of_month && now.hour() == self.config.backup_hour;
        let already_done = state.last_backup_month.as_deref() == Some(year_month.as_str());

        if !is_scheduled_instant || already_done {
            return Ok(CycleOutcome::Idle);
        }

        // Scoped acquisition: the rotation target lives only as long as this
        // temp file; it is removed on every exit path, including `?`
        // propagation below, without relying on a process-exit handler
        // (spec §5).
        let temp_file = tempfile::NamedTempFile::new().map_err(|err| StoreError::Io(err.to_string()))?;
        let archive_path = temp_file.path().to_path_buf();

        store.rotate(&archive_path).await?;
        let bytes = backup_source.read_archive(&archive_path).await?;
        let key = format!("{}/store_{}.{}", self.config.backup_prefix, year_month, self.config.backup_extension);
        object_store.put_object(&key, bytes, "application/octet-stream", None).await?;

        state.last_backup_month = Some(year_month);
        tracing::info!("publish.backup.created: key={key}");
        Ok(CycleOutcome::BackupCreated)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use domain::Snapshot;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn season() -> SeasonConfig {
        SeasonConfig {
            start: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        }
    }

    struct FixedProducer {
        bytes: Vec<u8>,
        fail: bool,
    }
    impl ArtifactProducer for FixedProducer {
        async fn produce(&self, _now: DateTime<Utc>) -> Result<Vec<u8>, ProduceError> {
            if self.fail { Err(ProduceError("boom".to_owned())) } else { Ok(self.bytes.clone()) }
        }
    }

    #[derive(Default)]
    struct CollectingObjectStore {
        puts: Mutex<Vec<(String, usize, Option<String>)>>,
        fail_transient: AtomicU32,
    }
    impl ObjectStore for CollectingObjectStore {
        async fn put_object(
            &self,
            key: &str,
            bytes: Vec<u8>,
            _content_type: &str,
            content_encoding: Option<&str>,
        ) -> Result<(), ObjectStoreError> {
            if self.fail_transient.load(Ordering::SeqCst) > 0 {
                self.fail_transient.fetch_sub(1, Ordering::SeqCst);
                return Err(ObjectStoreError::Transient("network blip".to_owned()));
            }
            self.puts.lock().unwrap().push((key.to_owned(), bytes.len(), content_encoding.map(str::to_owned)));
            Ok(())
        }
    }

    struct NoopSnapshot;
    impl Snapshot for NoopSnapshot {
        async fn observations_since(&self, _since: DateTime<Utc>) -> Result<Vec<domain::ObservationRow>, StoreError> {
            Ok(Vec::new())
        }
        async fn earliest_observation_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct FakeStore {
        rotated: Mutex<Vec<std::path::PathBuf>>,
    }
    impl Store for FakeStore {
        type Snap = NoopSnapshot;
        async fn snapshot(&self) -> Result<Self::Snap, StoreError> {
            Ok(NoopSnapshot)
        }
        async fn rotate(&self, archive_path: &Path) -> Result<(), StoreError> {
            self.rotated.lock().unwrap().push(archive_path.to_path_buf());
            Ok(())
        }
        async fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBackupSource;
    impl BackupSource for FakeBackupSource {
        async fn read_archive(&self, _archive_path: &Path) -> Result<Vec<u8>, StoreError> {
            Ok(vec![1, 2, 3])
        }
    }

    #[test]
    fn config_rejects_empty_key() {
        assert!(PublishConfig::builder("", "backups").build().is_err());
    }

    #[test]
    fn config_rejects_invalid_backup_day() {
        assert!(PublishConfig::builder("live.json.gz", "backups").backup_schedule(29, 3).build().is_err());
    }

    #[tokio::test]
    async fn in_season_cycle_publishes() {
        let config = PublishConfig::builder("live.json.gz", "backups").build().unwrap();
        let publisher = Publisher::new(config);
        let mut state = PublishState::default();
        let producer = FixedProducer { bytes: vec![1, 2, 3, 4], fail: false };
        let object_store = CollectingObjectStore::default();
        let store = FakeStore::default();
        let backup_source = FakeBackupSource;
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();

        let outcome =
            publisher.run_cycle(&mut state, &season(), &store, &object_store, &backup_source, &producer, now).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Published);
        let puts = object_store.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "live.json.gz");
        assert_eq!(puts[0].2.as_deref(), Some("gzip"));
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn off_season_non_scheduled_hour_is_idle() {
        let config = PublishConfig::builder("live.json.gz", "backups").backup_schedule(1, 3).build().unwrap();
        let publisher = Publisher::new(config);
        let mut state = PublishState::default();
        let producer = FixedProducer { bytes: vec![], fail: false };
        let object_store = CollectingObjectStore::default();
        let store = FakeStore::default();
        let backup_source = FakeBackupSource;
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap();

        let outcome =
            publisher.run_cycle(&mut state, &season(), &store, &object_store, &backup_source, &producer, now).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Idle);
        assert!(object_store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn off_season_scheduled_hour_performs_backup_once() {
        let config = PublishConfig::builder("live.json.gz", "backups").backup_schedule(1, 3).build().unwrap();
        let publisher = Publisher::new(config);
        let mut state = PublishState::default();
        let producer = FixedProducer { bytes: vec![], fail: false };
        let object_store = CollectingObjectStore::default();
        let store = FakeStore::default();
        let backup_source = FakeBackupSource;
        let scheduled = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();

        let outcome =
            publisher.run_cycle(&mut state, &season(), &store, &object_store, &backup_source, &producer, scheduled).await.unwrap();
        assert_eq!(outcome, CycleOutcome::BackupCreated);
        assert_eq!(object_store.puts.lock().unwrap().len(), 1);
        assert_eq!(store.rotated.lock().unwrap().len(), 1);

        // A second wake in the same scheduled hour must not repeat the backup.
        let still_scheduled = scheduled + chrono::Duration::minutes(1);
        let outcome = publisher
            .run_cycle(&mut state, &season(), &store, &object_store, &backup_source, &producer, still_scheduled)
            .await
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Idle);
        assert_eq!(object_store.puts.lock().unwrap().len(), 1, "must not back up twice in the same month");
    }

    #[tokio::test]
    async fn consecutive_publish_failures_exceed_ceiling() {
        let config = PublishConfig::builder("live.json.gz", "backups").max_consecutive_failures(2).build().unwrap();
        let publisher = Publisher::new(config);
        let mut state = PublishState::default();
        let producer = FixedProducer { bytes: vec![1], fail: true };
        let object_store = CollectingObjectStore::default();
        let store = FakeStore::default();
        let backup_source = FakeBackupSource;
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();

        let first =
            publisher.run_cycle(&mut state, &season(), &store, &object_store, &backup_source, &producer, now).await.unwrap();
        assert_eq!(first, CycleOutcome::PublishFailed);

        let second =
            publisher.run_cycle(&mut state, &season(), &store, &object_store, &backup_source, &producer, now).await;
        assert!(matches!(second, Err(PublishError::TooManyConsecutiveFailures(2, 2))));
    }

    #[tokio::test]
    async fn transient_object_store_failure_resets_on_next_success() {
        let config = PublishConfig::builder("live.json.gz", "backups").max_consecutive_failures(5).build().unwrap();
        let publisher = Publisher::new(config);
        let mut state = PublishState::default();
        let producer = FixedProducer { bytes: vec![9], fail: false };
        let object_store = CollectingObjectStore { fail_transient: AtomicU32::new(1), ..Default::default() };
        let store = FakeStore::default();
        let backup_source = FakeBackupSource;
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();

        let failed =
            publisher.run_cycle(&mut state, &season(), &store, &object_store, &backup_source, &producer, now).await.unwrap();
        assert_eq!(failed, CycleOutcome::PublishFailed);
        assert_eq!(state.consecutive_failures, 1);

        let recovered =
            publisher.run_cycle(&mut state, &season(), &store, &object_store, &backup_source, &producer, now).await.unwrap();
        assert_eq!(recovered, CycleOutcome::Published);
        assert_eq!(state.consecutive_failures, 0);
    }
}
