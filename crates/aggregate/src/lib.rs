//! Aggregator: pure, snapshot-driven time bucketing of the observation
//! stream at 1-minute, 5-minute and 1-hour resolutions (spec §4.4).
//!
//! The bucketing itself ([`bucket_observations`]) is a plain function over
//! `&[ObservationRow]` with no I/O, so it is exhaustively unit-testable.
//! [`Aggregator::aggregate`] is the thin async wrapper that pulls rows from
//! a `domain::Snapshot`.

use chrono::{DateTime, TimeZone, Utc};
use domain::{AggregateBucket, ObservationRow, Resolution, Snapshot, StoreError};

/// Result of one bucketing pass: the emitted buckets plus a count of
/// records whose payload did not parse as a number (spec §4.4: "still
/// counted separately in diagnostics").
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateResult {
    pub buckets: Vec<AggregateBucket>,
    pub unparseable: u64,
}

/// Pure time-bucketing core, generic over no port -- takes already-fetched
/// rows and a `[window_start, now]` range.
///
/// Bucket starts are aligned to epoch multiples of the resolution's width
/// (spec §4.4). A bucket with zero successfully-parsed samples is omitted
/// from the output entirely; rows outside `[window_start, now]` are ignored.
#[must_use]
pub fn bucket_observations(
    rows: &[ObservationRow],
    resolution: Resolution,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> AggregateResult {
    let width = i64::from(resolution.width_secs());
    if width <= 0 || window_start > now {
        return AggregateResult { buckets: Vec::new(), unparseable: 0 };
    }

    let start_idx = window_start.timestamp().div_euclid(width);
    let end_idx = now.timestamp().div_euclid(width);
    let bucket_count = (end_idx - start_idx + 1).max(0) as usize;
    let mut samples: Vec<Vec<f64>> = vec![Vec::new(); bucket_count];
    let mut unparseable = 0u64;

    for row in rows {
        let ts = row.observation.ts;
        if ts < window_start || ts > now {
            continue;
        }
        let idx = ts.timestamp().div_euclid(width) - start_idx;
        #[expect(clippy::cast_sign_loss, reason = "idx is non-negative: ts is within [start_idx, end_idx]")]
        let idx = idx as usize;
        match row.observation.payload.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => samples[idx].push(value),
            _ => unparseable += 1,
        }
    }

    let mut buckets = Vec::new();
    for (offset, values) in samples.into_iter().enumerate() {
        if values.is_empty() {
            continue;
        }
        #[expect(clippy::cast_possible_wrap, reason = "offset is bounded by bucket_count, far below i64::MAX")]
        let bucket_epoch = (start_idx + offset as i64) * width;
        let Some(start) = Utc.timestamp_opt(bucket_epoch, 0).single() else {
            continue;
        };
        buckets.push(summarize(start, resolution.width_secs(), &values));
    }

    AggregateResult { buckets, unparseable }
}

fn summarize(start: DateTime<Utc>, width_secs: u32, values: &[f64]) -> AggregateBucket {
    #[expect(clippy::cast_precision_loss, reason = "sample counts are far below f64's exact-integer range")]
    let count = values.len() as f64;
    let sum: f64 = values.iter().sum();
    let mean = sum / count;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let stddev = if values.len() >= 2 {
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1.0);
        variance.sqrt()
    } else {
        0.0
    };
    AggregateBucket {
        start,
        width_secs,
        count: values.len() as u64,
        mean,
        min,
        max,
        stddev,
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Snapshot-driven facade over [`bucket_observations`] (spec §4.4).
#[derive(Debug, Default, Clone, Copy)]
pub struct Aggregator;

impl Aggregator {
    /// Produce the bucket sequence for `resolution` as of `now`.
    ///
    /// `t0` is `now - resolution.horizon()` for 1-minute/5-minute, or the
    /// earliest persisted observation for the 1-hour series (spec §4.4).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the snapshot read fails.
    pub async fn aggregate<S: Snapshot>(
        snapshot: &S,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<AggregateResult, StoreError> {
        let window_start = match resolution.horizon() {
            Some(horizon) => now - horizon,
            None => snapshot.earliest_observation_time().await?.unwrap_or(now),
        };
        let rows = snapshot.observations_since(window_start).await?;
        tracing::debug!(
            resolution = ?resolution,
            rows = rows.len(),
            "aggregate.fetched"
        );
        Ok(bucket_observations(&rows, resolution, window_start, now))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
