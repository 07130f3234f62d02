//! Error taxonomy shared across every port (spec §4.1, §7).

/// Errors an `IngestSink` (the Ingest Buffer's inbound port) may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    /// The buffer has been shut down; no further enqueues are accepted.
    #[error("ingest buffer closed")]
    Closed,
}

/// Errors the Store (or a snapshot drawn from it) may return.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Free space fell below the configured hard floor; the caller should
    /// shed load rather than retry immediately (spec §4.1, §4.3).
    #[error("store has insufficient free space for this write")]
    StorageFull,
    /// An integrity error was detected in the store file. Fatal: the
    /// Supervisor halts the process (spec §4.1, §7).
    #[error("store corrupted: {0}")]
    StorageCorrupted(String),
    /// Any other I/O-level failure opening, writing, or reading the store.
    #[error("store I/O error: {0}")]
    Io(String),
}

/// Errors an `ObjectStore` adapter may return.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectStoreError {
    /// Network failure, timeout, or 5xx response. Callers count these and
    /// may retry (spec §4.7, §7).
    #[error("transient object-store error: {0}")]
    Transient(String),
    /// 4xx response or a malformed request; retrying will not help.
    #[error("permanent object-store error: {0}")]
    Permanent(String),
}

/// Errors a `HealthNotifier` adapter may return.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    /// Delivery failed (SMTP transport error, DNS failure, etc). Health
    /// notifications are best-effort; callers log and continue.
    #[error("notification delivery failed: {0}")]
    DeliveryFailed(String),
}
