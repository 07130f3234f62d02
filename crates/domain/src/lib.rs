//! Shared domain types, error taxonomy, and hexagonal ports for the Data
//! Sleigh daemon (spec §3, §4). Every component crate depends on `domain`
//! alone; concrete adapters live only in the `sleigh` binary crate.

mod errors;
mod ports;
mod types;

pub use errors::{IngestError, NotifyError, ObjectStoreError, StoreError};
pub use ports::{
    ArchivedStore, BackupSource, Batch, HealthNotifier, IngestSink, Notification,
    NotificationKind, ObjectStore, Snapshot, Store, StoreStats, StoreWriter,
};
pub use types::{
    AggregateBucket, DeviceClass, DeviceEvent, InvalidQos, Observation, ObservationRow,
    Prediction, Qos, Resolution, Segment, SeasonConfig, SubscriberState,
};
