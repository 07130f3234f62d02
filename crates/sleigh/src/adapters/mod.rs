//! Concrete adapters wiring the hexagonal ports in `domain` to real
//! infrastructure: SQLite storage, the local MQTT broker, the cloud
//! pub/sub service, S3-compatible object storage, and SMTP notifications.

pub mod cloud;
pub mod mqtt;
pub mod notify;
pub mod object_store;
pub mod sqlite_store;
