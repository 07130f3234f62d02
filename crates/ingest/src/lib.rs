//! Ingest Buffer: a bounded in-memory queue partitioned by target table,
//! plus the single drain task that owns the Store writer handle (spec §4.3).
//!
//! [`IngestBuffer`] implements `domain::IngestSink` (the inbound port both
//! subscribers enqueue through) and drives [`IngestBuffer::run_drain`] (the
//! sole writer into the Store, via `domain::StoreWriter`).

use domain::{Batch, DeviceEvent, IngestError, IngestSink, Observation, StoreError, StoreWriter};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// ShedSignal port
// ---------------------------------------------------------------------------

/// Outbound port notified the instant the buffer enters shed mode, so the
/// Health Monitor can emit its notification immediately rather than waiting
/// for its own poll cadence (spec §4.3, §4.8).
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait ShedSignal {
    /// Best-effort; failures are logged by the implementor, never by the
    /// caller.
    async fn on_shed_mode_entered(&self);
}

/// Outbound port polled after every flush attempt, win or lose, so the
/// Health Monitor's store-size / free-space check runs on the cadence spec
/// §4.8 calls for ("called from the Ingest Buffer drain on every flush")
/// without the Ingest Buffer knowing anything about thresholds or
/// notifications.
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait FlushObserver {
    async fn on_flush(&self);
}

impl FlushObserver for () {
    async fn on_flush(&self) {}
}

// ---------------------------------------------------------------------------
// IngestConfig
// ---------------------------------------------------------------------------

/// Runtime configuration for an [`IngestBuffer`] (spec §4.3, §6).
#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    /// Flush once pending records in either partition reach this count.
    pub batch_size: usize,
    /// Flush once this long has elapsed since the last flush, regardless of
    /// count.
    pub flush_interval: Duration,
    /// While in shed mode, each partition is trimmed to at most this many
    /// pending records after every enqueue, discarding the oldest first.
    /// Bounds memory under sustained `StorageFull` (spec §4.3, §8 scenario 4).
    pub shed_ceiling: usize,
}

impl Default for IngestConfig {
    /// `batch_size = 5000`, `flush_interval = 300s` (spec §6 defaults).
    /// `shed_ceiling = 2 * batch_size`.
    fn default() -> Self {
        Self {
            batch_size: 5_000,
            flush_interval: Duration::from_secs(300),
            shed_ceiling: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// IngestBuffer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct State {
    observations: VecDeque<Observation>,
    device_events: VecDeque<DeviceEvent>,
    shed_mode: bool,
    closed: bool,
}

impl State {
    fn pending_len(&self) -> usize {
        self.observations.len() + self.device_events.len()
    }
}

/// The Ingest Buffer: bounded in-memory queue plus batch policy (spec §4.3).
///
/// Producers (the two subscribers) call [`IngestSink`] methods concurrently;
/// exactly one drain task should ever call [`IngestBuffer::run_drain`], which
/// is the buffer's only path to the Store.
#[derive(Debug)]
pub struct IngestBuffer {
    config: IngestConfig,
    state: Mutex<State>,
    /// Woken whenever a partition crosses `batch_size`, so the drain task
    /// does not have to wait out the full `flush_interval`.
    threshold: Notify,
}

impl IngestBuffer {
    #[must_use]
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            threshold: Notify::new(),
        }
    }

    /// Mark the buffer closed; subsequent enqueues return
    /// [`IngestError::Closed`]. Idempotent.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.threshold.notify_waiters();
    }

    /// Whether the buffer is currently in shed mode (spec §4.3, §8).
    pub async fn is_shedding(&self) -> bool {
        self.state.lock().await.shed_mode
    }

    /// Total pending records across both partitions. Exposed for tests and
    /// for a future operator-facing metrics surface.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending_len()
    }

    /// Run the drain loop until `cancel` fires.
    ///
    /// Flushes when either `batch_size` is reached in a partition or
    /// `flush_interval` elapses, whichever is first. On cancellation,
    /// drains one final batch before returning (spec §5).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageCorrupted`] to signal a fatal condition;
    /// the Supervisor is expected to halt the process on this error
    /// (spec §4.1, §7). All other store errors are handled internally
    /// (shed mode, logging) and never propagate.
    pub async fn run_drain<W, H, F>(
        &self,
        writer: &W,
        shed_signal: &H,
        flush_observer: &F,
        cancel: CancellationToken,
    ) -> Result<(), StoreError>
    where
        W: StoreWriter,
        H: ShedSignal,
        F: FlushObserver,
    {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!("ingest.drain.cancelled: flushing final batch");
                    self.flush(writer, shed_signal).await?;
                    flush_observer.on_flush().await;
                    return Ok(());
                }
                () = tokio::time::sleep(self.config.flush_interval) => {
                    tracing::debug!("ingest.drain.tick: reason=timer");
                    self.flush(writer, shed_signal).await?;
                    flush_observer.on_flush().await;
                }
                () = self.threshold.notified() => {
                    tracing::debug!("ingest.drain.tick: reason=threshold");
                    self.flush(writer, shed_signal).await?;
                    flush_observer.on_flush().await;
                }
            }
        }
    }

    async fn flush<W, H>(&self, writer: &W, shed_signal: &H) -> Result<(), StoreError>
    where
        W: StoreWriter,
        H: ShedSignal,
    {
        let (observations, device_events) = {
            let mut state = self.state.lock().await;
            (
                std::mem::take(&mut state.observations),
                std::mem::take(&mut state.device_events),
            )
        };

        let mut storage_full = false;

        if !observations.is_empty() {
            let count = observations.len();
            match writer.append_batch(Batch::Observations(observations.into())).await {
                Ok(()) => tracing::debug!("ingest.flush.observations: count={count}"),
                Err(StoreError::StorageFull) => {
                    tracing::warn!("ingest.flush.observations: storage full, dropping batch of {count}");
                    storage_full = true;
                }
                Err(StoreError::StorageCorrupted(msg)) => return Err(StoreError::StorageCorrupted(msg)),
                Err(StoreError::Io(msg)) => {
                    tracing::error!("ingest.flush.observations.io_error: {msg}");
                }
            }
        }

        if !device_events.is_empty() {
            let count = device_events.len();
            match writer.append_batch(Batch::DeviceEvents(device_events.into())).await {
                Ok(()) => tracing::debug!("ingest.flush.device_events: count={count}"),
                Err(StoreError::StorageFull) => {
                    tracing::warn!("ingest.flush.device_events: storage full, dropping batch of {count}");
                    storage_full = true;
                }
                Err(StoreError::StorageCorrupted(msg)) => return Err(StoreError::StorageCorrupted(msg)),
                Err(StoreError::Io(msg)) => {
                    tracing::error!("ingest.flush.device_events.io_error: {msg}");
                }
            }
        }

        let mut state = self.state.lock().await;
        if storage_full {
            if !state.shed_mode {
                state.shed_mode = true;
                drop(state);
                shed_signal.on_shed_mode_entered().await;
            }
        } else if state.shed_mode {
            state.shed_mode = false;
            tracing::info!("ingest.shed_mode.exited");
        }
        Ok(())
    }

    fn trim_if_shedding<T>(queue: &mut VecDeque<T>, shed_mode: bool, ceiling: usize) {
        if shed_mode {
            while queue.len() > ceiling {
                queue.pop_front();
            }
        }
    }
}

impl IngestSink for IngestBuffer {
    /// # Errors
    ///
    /// Returns [`IngestError::Closed`] once [`IngestBuffer::close`] has been
    /// called. A full (non-shedding) buffer never errors; it simply grows
    /// until the next flush (spec §4.3).
    async fn enqueue_observation(&self, observation: Observation) -> Result<(), IngestError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(IngestError::Closed);
        }
        state.observations.push_back(observation);
        let shed_mode = state.shed_mode;
        Self::trim_if_shedding(&mut state.observations, shed_mode, self.config.shed_ceiling);
        if state.observations.len() >= self.config.batch_size {
            self.threshold.notify_one();
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`IngestError::Closed`] once [`IngestBuffer::close`] has been
    /// called.
    async fn enqueue_device_event(&self, event: DeviceEvent) -> Result<(), IngestError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(IngestError::Closed);
        }
        state.device_events.push_back(event);
        let shed_mode = state.shed_mode;
        Self::trim_if_shedding(&mut state.device_events, shed_mode, self.config.shed_ceiling);
        if state.device_events.len() >= self.config.batch_size {
            self.threshold.notify_one();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::Qos;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn observation() -> Observation {
        Observation {
            ts: Utc::now(),
            topic: "sensors/1".to_owned(),
            payload: "1.0".to_owned(),
            qos: Qos::AtMostOnce,
            retained: false,
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        observation_batches: Mutex<Vec<usize>>,
        fail_full_times: AtomicU32,
    }

    impl StoreWriter for RecordingWriter {
        async fn append_batch(&self, batch: Batch) -> Result<(), StoreError> {
            if self.fail_full_times.load(Ordering::SeqCst) > 0 {
                self.fail_full_times.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::StorageFull);
            }
            if let Batch::Observations(v) = &batch {
                self.observation_batches.lock().await.push(v.len());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingShedSignal {
        count: std::sync::atomic::AtomicU32,
    }
    impl ShedSignal for CountingShedSignal {
        async fn on_shed_mode_entered(&self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn flush_triggers_on_batch_size() {
        let buffer = IngestBuffer::new(IngestConfig {
            batch_size: 3,
            flush_interval: Duration::from_secs(3600),
            shed_ceiling: 100,
        });
        let writer = RecordingWriter::default();
        let shed = CountingShedSignal::default();
        let cancel = CancellationToken::new();

        let drain_cancel = cancel.clone();
        let drain = tokio::spawn(async move {
            // Hand back the buffer reference via Arc would be cleaner, but
            // for this test we drive flush directly below instead.
            let _ = drain_cancel;
        });
        drain.await.unwrap();

        for _ in 0..3 {
            buffer.enqueue_observation(observation()).await.unwrap();
        }
        assert_eq!(buffer.pending_len().await, 3);

        // Drive one flush manually (equivalent to what run_drain's notified
        // branch would do).
        buffer.flush(&writer, &shed).await.unwrap();
        assert_eq!(writer.observation_batches.lock().await.as_slice(), &[3]);
        assert_eq!(buffer.pending_len().await, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn storage_full_enters_shed_mode_and_notifies_once() {
        let buffer = IngestBuffer::new(IngestConfig {
            batch_size: 1,
            flush_interval: Duration::from_secs(3600),
            shed_ceiling: 2,
        });
        let writer = RecordingWriter { fail_full_times: AtomicU32::new(1), ..Default::default() };
        let shed = CountingShedSignal::default();

        buffer.enqueue_observation(observation()).await.unwrap();
        buffer.flush(&writer, &shed).await.unwrap();
        assert!(buffer.is_shedding().await);
        assert_eq!(shed.count.load(Ordering::SeqCst), 1);

        // Second flush succeeds; shed mode must exit.
        buffer.enqueue_observation(observation()).await.unwrap();
        buffer.flush(&writer, &shed).await.unwrap();
        assert!(!buffer.is_shedding().await);
    }

    #[tokio::test]
    async fn shed_mode_bounds_memory_by_discarding_oldest() {
        let buffer = IngestBuffer::new(IngestConfig {
            batch_size: 1000,
            flush_interval: Duration::from_secs(3600),
            shed_ceiling: 2,
        });
        let writer = RecordingWriter { fail_full_times: AtomicU32::new(1), ..Default::default() };
        let shed = CountingShedSignal::default();

        buffer.enqueue_observation(observation()).await.unwrap();
        buffer.flush(&writer, &shed).await.unwrap();
        assert!(buffer.is_shedding().await);

        for _ in 0..10 {
            buffer.enqueue_observation(observation()).await.unwrap();
        }
        assert!(buffer.pending_len().await <= 2, "shed mode must bound pending count");
    }

    #[tokio::test]
    async fn closed_buffer_rejects_enqueue() {
        let buffer = IngestBuffer::new(IngestConfig::default());
        buffer.close().await;
        let result = buffer.enqueue_observation(observation()).await;
        assert!(matches!(result, Err(IngestError::Closed)));
    }

    #[tokio::test]
    async fn cancellation_flushes_final_batch() {
        let buffer = IngestBuffer::new(IngestConfig {
            batch_size: 1000,
            flush_interval: Duration::from_secs(3600),
            shed_ceiling: 100,
        });
        let writer = RecordingWriter::default();
        let shed = CountingShedSignal::default();
        buffer.enqueue_observation(observation()).await.unwrap();
        buffer.enqueue_observation(observation()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        buffer.run_drain(&writer, &shed, &(), cancel).await.unwrap();

        assert_eq!(writer.observation_batches.lock().await.as_slice(), &[2]);
    }

    #[derive(Default)]
    struct CountingFlushObserver {
        count: AtomicU32,
    }
    impl FlushObserver for CountingFlushObserver {
        async fn on_flush(&self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn flush_observer_runs_on_every_flush_tick() {
        let buffer = IngestBuffer::new(IngestConfig {
            batch_size: 1000,
            flush_interval: Duration::from_secs(3600),
            shed_ceiling: 100,
        });
        let writer = RecordingWriter::default();
        let shed = CountingShedSignal::default();
        let observer = CountingFlushObserver::default();
        buffer.enqueue_observation(observation()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        buffer.run_drain(&writer, &shed, &observer, cancel).await.unwrap();

        assert_eq!(observer.count.load(Ordering::SeqCst), 1);
    }
}
