//! Artifact Builder: composes the live artifact document -- season
//! metadata, last-N-minutes raw measurements, the three aggregate
//! resolutions and the segment analysis -- then gzip-encodes it (spec
//! §4.6).
//!
//! [`build`] is a pure function over already-computed inputs; it performs
//! no I/O and knows nothing about the Store, the Aggregator or the
//! Segmenter beyond their output types.

use chrono::{DateTime, SecondsFormat, Utc};
use domain::{AggregateBucket, ObservationRow, Prediction, SeasonConfig, Segment};
use serde::{Serialize, Serializer};
use std::io::Write as _;

/// Raised when the composed document cannot be serialized or compressed.
/// Both are effectively infallible for well-formed inputs; this exists so
/// callers propagate with `?` rather than `unwrap`.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("artifact compression failed: {0}")]
    Compress(#[from] std::io::Error),
}

/// The built artifact in both forms: `json` is retained only for local
/// diagnostics (spec §4.6); `gzipped` is what the Publisher actually
/// uploads.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub json: String,
    pub gzipped: Vec<u8>,
}

fn serialize_millis<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[derive(Debug, Serialize)]
struct SeasonDto {
    start: chrono::NaiveDate,
    end: chrono::NaiveDate,
    is_active: bool,
}

#[derive(Debug, Serialize)]
struct MeasurementDto {
    #[serde(serialize_with = "serialize_millis")]
    t: DateTime<Utc>,
    topic: String,
    payload: String,
}

/// An aggregate bucket using the compact wire keys specified for payload
/// size (spec §4.6): `t`, `m`, `min`, `max`, `c`.
#[derive(Debug, Serialize)]
struct BucketDto {
    #[serde(serialize_with = "serialize_millis")]
    t: DateTime<Utc>,
    m: f64,
    min: f64,
    max: f64,
    c: u64,
}

impl From<&AggregateBucket> for BucketDto {
    fn from(bucket: &AggregateBucket) -> Self {
        Self { t: bucket.start, m: bucket.mean, min: bucket.min, max: bucket.max, c: bucket.count }
    }
}

#[derive(Debug, Serialize)]
struct AggregateDto {
    data: Vec<BucketDto>,
}

impl From<&[AggregateBucket]> for AggregateDto {
    fn from(buckets: &[AggregateBucket]) -> Self {
        Self { data: buckets.iter().map(BucketDto::from).collect() }
    }
}

#[derive(Debug, Serialize)]
struct SegmentDto {
    id: u32,
    #[serde(serialize_with = "serialize_millis")]
    start_time: DateTime<Utc>,
    #[serde(serialize_with = "serialize_millis")]
    end_time: DateTime<Utc>,
    start_value: f64,
    end_value: f64,
    slope_per_hour: f64,
    r_squared: f64,
    is_current: bool,
}

impl From<&Segment> for SegmentDto {
    fn from(segment: &Segment) -> Self {
        Self {
            id: segment.id,
            start_time: segment.start_time,
            end_time: segment.end_time,
            start_value: segment.start_value,
            end_value: segment.end_value,
            slope_per_hour: segment.slope_per_hour,
            r_squared: segment.r_squared,
            is_current: segment.is_current,
        }
    }
}

#[derive(Debug, Serialize)]
struct PredictionDto {
    slope: f64,
    #[serde(serialize_with = "serialize_millis")]
    predicted_refill_time: DateTime<Utc>,
}

impl From<&Prediction> for PredictionDto {
    fn from(prediction: &Prediction) -> Self {
        Self { slope: prediction.slope_per_hour, predicted_refill_time: prediction.predicted_refill_time }
    }
}

#[derive(Debug, Serialize)]
struct AnalysisDto {
    segments: Vec<SegmentDto>,
    current_prediction: Option<PredictionDto>,
}

#[derive(Debug, Serialize)]
struct ArtifactDto {
    #[serde(serialize_with = "serialize_millis")]
    generated_at: DateTime<Utc>,
    season: SeasonDto,
    replay_delay_seconds: u64,
    minutes_of_data: u32,
    measurements: Vec<MeasurementDto>,
    agg_1m: AggregateDto,
    agg_5m: AggregateDto,
    agg_1h: AggregateDto,
    analysis: AnalysisDto,
}

/// Inputs the builder composes into one document; every field is already
/// computed by its owning component (spec §4.6 delegates entirely to the
/// Aggregator and Segmenter upstream).
#[derive(Debug, Clone, Copy)]
pub struct ArtifactInputs<'a> {
    pub now: DateTime<Utc>,
    pub season: &'a SeasonConfig,
    pub replay_delay_seconds: u64,
    pub minutes_of_data: u32,
    pub measurements: &'a [ObservationRow],
    pub agg_1m: &'a [AggregateBucket],
    pub agg_5m: &'a [AggregateBucket],
    pub agg_1h: &'a [AggregateBucket],
    pub segments: &'a [Segment],
    pub prediction: Option<&'a Prediction>,
}

/// Compose and gzip-encode the live artifact (spec §4.6).
///
/// # Errors
///
/// Returns [`ArtifactError`] if serialization or compression fails; both
/// are effectively unreachable for well-formed inputs (no `NaN`/`Infinity`
/// ever flows into this function, per spec §6).
pub fn build(inputs: ArtifactInputs<'_>) -> Result<Artifact, ArtifactError> {
    let dto = ArtifactDto {
        generated_at: inputs.now,
        season: SeasonDto {
            start: inputs.season.start,
            end: inputs.season.end,
            is_active: inputs.season.is_active(inputs.now),
        },
        replay_delay_seconds: inputs.replay_delay_seconds,
        minutes_of_data: inputs.minutes_of_data,
        measurements: inputs
            .measurements
            .iter()
            .map(|row| MeasurementDto {
                t: row.observation.ts,
                topic: row.observation.topic.clone(),
                payload: row.observation.payload.clone(),
            })
            .collect(),
        agg_1m: inputs.agg_1m.into(),
        agg_5m: inputs.agg_5m.into(),
        agg_1h: inputs.agg_1h.into(),
        analysis: AnalysisDto {
            segments: inputs.segments.iter().map(SegmentDto::from).collect(),
            current_prediction: inputs.prediction.map(PredictionDto::from),
        },
    };

    let json = serde_json::to_string(&dto)?;
    let gzipped = gzip(json.as_bytes())?;
    tracing::debug!(bytes = json.len(), gzipped_bytes = gzipped.len(), "artifact.built");
    Ok(Artifact { json, gzipped })
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
