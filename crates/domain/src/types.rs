//! Entities shared by every pipeline component (spec §3).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Qos
// ---------------------------------------------------------------------------

/// Delivery guarantee requested for a Source-A subscription, matching the
/// local broker's wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Qos {
    /// Fire-and-forget delivery.
    AtMostOnce,
    /// Delivered at least once; duplicates possible.
    AtLeastOnce,
    /// Delivered exactly once.
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = InvalidQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Raised by [`Qos::try_from`] for values outside `0..=2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid qos value: {0} (expected 0, 1 or 2)")]
pub struct InvalidQos(pub u8);

// ---------------------------------------------------------------------------
// Observation (Source A)
// ---------------------------------------------------------------------------

/// A single sensor reading from Source A, as enqueued by the subscriber.
///
/// Carries no record id: the Store assigns one, strictly increasing per
/// table, at persist time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// UTC timestamp, microsecond precision.
    pub ts: DateTime<Utc>,
    /// Hierarchical topic the message arrived on.
    pub topic: String,
    /// Untyped payload. Numeric interpretation is deferred to the Aggregator.
    pub payload: String,
    /// Delivery guarantee the message was published with.
    pub qos: Qos,
    /// Broker "retained message" flag.
    pub retained: bool,
}

/// An [`Observation`] as returned by a [`crate::ports::Snapshot`] read, with
/// the record id the Store assigned on persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    /// Monotonically increasing id, unique within the observations table.
    pub id: i64,
    /// The persisted observation.
    pub observation: Observation,
}

// ---------------------------------------------------------------------------
// DeviceEvent (Source B)
// ---------------------------------------------------------------------------

/// The registered role of a Source-B device, used to classify incoming
/// events and to decide which optional fields apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Reports temperature and humidity.
    AirSensor,
    /// Reports temperature only; humidity is always absent.
    WaterSensor,
}

/// A normalized reading from Source B.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// UTC timestamp as reported by the gateway event.
    pub ts: DateTime<Utc>,
    /// Opaque device identifier.
    pub device_id: String,
    /// Registered role, used to decide which optional fields are expected.
    pub device_class: DeviceClass,
    /// Degrees Fahrenheit, when present in the event.
    pub temperature: Option<f64>,
    /// Relative humidity percent; always `None` for [`DeviceClass::WaterSensor`].
    pub humidity: Option<f64>,
    /// Battery level, `0..=100`.
    pub battery: u8,
    /// Signal strength in dBm.
    pub signal: i32,
    /// The complete, unmodified event JSON, retained for forensics.
    pub raw_payload: String,
}

// ---------------------------------------------------------------------------
// AggregateBucket
// ---------------------------------------------------------------------------

/// A time-bucketed summary of numeric `Observation.payload` values. Produced
/// at query time by the Aggregator; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    /// Start of the bucket, aligned to an epoch multiple of `width_secs`.
    pub start: DateTime<Utc>,
    /// Bucket width in seconds: 60, 300 or 3600.
    pub width_secs: u32,
    /// Number of observations whose payload parsed as a number.
    pub count: u64,
    /// Arithmetic mean of the parsed values.
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Sample (Bessel-corrected) standard deviation; `0.0` when `count < 2`.
    pub stddev: f64,
}

/// The resolution an [`AggregateBucket`] sequence is produced at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    OneMinute,
    FiveMinute,
    OneHour,
}

impl Resolution {
    /// Bucket width in seconds.
    #[must_use]
    pub fn width_secs(self) -> u32 {
        match self {
            Self::OneMinute => 60,
            Self::FiveMinute => 300,
            Self::OneHour => 3600,
        }
    }

    /// How far back from `now` this resolution looks, or `None` to mean
    /// "since the earliest observation" (only the 1-hour series does this).
    #[must_use]
    pub fn horizon(self) -> Option<chrono::Duration> {
        match self {
            Self::OneMinute => Some(chrono::Duration::minutes(10)),
            Self::FiveMinute => Some(chrono::Duration::hours(24)),
            Self::OneHour => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Segment / Prediction
// ---------------------------------------------------------------------------

/// A piecewise-linear interval in the 1-hour mean series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Dense id in time order; oldest segment is 0.
    pub id: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub start_value: f64,
    pub end_value: f64,
    /// Units per hour; positive in the dominant consumption direction.
    pub slope_per_hour: f64,
    /// Goodness of fit of the underlying linear regression.
    pub r_squared: f64,
    /// True for the most recent segment, if no refill event has occurred since.
    pub is_current: bool,
}

/// Emitted once per artifact when a current segment with positive slope exists.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub slope_per_hour: f64,
    /// Clamped to be no earlier than "now" at computation time.
    pub predicted_refill_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SeasonConfig
// ---------------------------------------------------------------------------

/// An operator-configured UTC calendar date window controlling Publisher mode.
///
/// `start` is inclusive, `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonConfig {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SeasonConfig {
    /// Whether `now`'s UTC calendar date falls in `[start, end)`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        today >= self.start && today < self.end
    }
}

// ---------------------------------------------------------------------------
// SubscriberState
// ---------------------------------------------------------------------------

/// Connection state machine shared by both subscribers (spec §4.2).
///
/// Source A never enters `Authenticating`; Source B passes through it on
/// every (re)connect to exchange its long-lived secret for a bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn qos_round_trips_through_u8() {
        for raw in 0u8..=2 {
            let qos = Qos::try_from(raw).unwrap();
            assert_eq!(u8::from(qos), raw);
        }
    }

    #[test]
    fn qos_rejects_out_of_range() {
        assert!(Qos::try_from(3).is_err());
    }

    #[test]
    fn season_start_inclusive_end_exclusive() {
        let season = SeasonConfig {
            start: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
        };
        let start = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 11, 30, 23, 59, 59).unwrap();
        let inside = Utc.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap();

        assert!(season.is_active(start), "start date is inclusive");
        assert!(!season.is_active(end), "end date is exclusive");
        assert!(!season.is_active(before));
        assert!(season.is_active(inside));
    }

    #[test]
    fn season_gating_example_from_spec() {
        let season = SeasonConfig {
            start: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
        };
        let off_season = Utc.with_ymd_and_hms(2025, 2, 3, 10, 0, 0).unwrap();
        assert!(!season.is_active(off_season));
    }

    #[test]
    fn resolution_widths_and_horizons() {
        assert_eq!(Resolution::OneMinute.width_secs(), 60);
        assert_eq!(Resolution::FiveMinute.width_secs(), 300);
        assert_eq!(Resolution::OneHour.width_secs(), 3600);
        assert!(Resolution::OneHour.horizon().is_none());
        assert_eq!(
            Resolution::OneMinute.horizon(),
            Some(chrono::Duration::minutes(10))
        );
    }
}
