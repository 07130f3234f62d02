//! Segmenter: piecewise-linear regression over the 1-hour mean series,
//! partitioning history into monotone consumption segments and projecting
//! a refill time from the current segment's slope (spec §4.5).
//!
//! [`Segmenter::segment`] is a pure function over an already-fetched
//! 1-hour [`AggregateBucket`] series -- it performs no I/O and depends on
//! no port, so every tunable (spec §9 Open Question) is exercised directly
//! by unit tests.

use chrono::{DateTime, Utc};
use domain::{AggregateBucket, Prediction, Segment};
use std::ops::Range;

// ---------------------------------------------------------------------------
// SegmenterConfig + builder
// ---------------------------------------------------------------------------

/// Tunables the segmenter's goodness-of-fit and noise thresholds are
/// sensitive to (spec §9 Open Question: "not pinned by the source").
///
/// Construct via [`SegmenterConfig::builder`]. `empty_threshold` -- the
/// reservoir-empty reading used for refill prediction (spec §4.5) -- has no
/// sensible cross-deployment default and is the builder's only required
/// parameter.
#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    /// Reservoir-empty reading; prediction crosses this value (spec §3, §4.5).
    pub empty_threshold: f64,
    /// Minimum residual r² a candidate interval's OLS fit must reach to be
    /// accepted as a segment without further splitting. Default `0.4`.
    pub min_goodness_r2: f64,
    /// Minimum number of points a sub-interval must retain to still be
    /// eligible for recursive splitting; below this it is discarded as
    /// noise instead. Default `3`.
    pub min_segment_len: usize,
    /// Series shorter than this yield zero segments and no prediction.
    /// Default `5`.
    pub min_points: usize,
    /// A decrease in consecutive mean values larger than this is a refill
    /// event, partitioning the series (spec §4.5). Units match the raw
    /// payload (e.g. mm of sensor distance). Default `15.0`.
    pub jump_threshold: f64,
}

/// Builder for [`SegmenterConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfigBuilder {
    empty_threshold: f64,
    min_goodness_r2: f64,
    min_segment_len: usize,
    min_points: usize,
    jump_threshold: f64,
}

impl SegmenterConfig {
    #[must_use]
    pub fn builder(empty_threshold: f64) -> SegmenterConfigBuilder {
        SegmenterConfigBuilder {
            empty_threshold,
            min_goodness_r2: 0.4,
            min_segment_len: 3,
            min_points: 5,
            jump_threshold: 15.0,
        }
    }
}

impl SegmenterConfigBuilder {
    #[must_use]
    pub fn min_goodness_r2(mut self, value: f64) -> Self {
        self.min_goodness_r2 = value;
        self
    }

    #[must_use]
    pub fn min_segment_len(mut self, value: usize) -> Self {
        self.min_segment_len = value;
        self
    }

    #[must_use]
    pub fn min_points(mut self, value: usize) -> Self {
        self.min_points = value;
        self
    }

    #[must_use]
    pub fn jump_threshold(mut self, value: f64) -> Self {
        self.jump_threshold = value;
        self
    }

    #[must_use]
    pub fn build(self) -> SegmenterConfig {
        SegmenterConfig {
            empty_threshold: self.empty_threshold,
            min_goodness_r2: self.min_goodness_r2,
            min_segment_len: self.min_segment_len,
            min_points: self.min_points,
            jump_threshold: self.jump_threshold,
        }
    }
}

// ---------------------------------------------------------------------------
// Segmenter
// ---------------------------------------------------------------------------

/// Stateless segmenter (spec §4.5).
#[derive(Debug, Default, Clone, Copy)]
pub struct Segmenter;

impl Segmenter {
    /// Partition `series` (ascending 1-hour mean buckets) into segments and,
    /// if a current segment with positive slope exists, project a refill
    /// time.
    ///
    /// Series shorter than `config.min_points` yield `(vec![], None)`
    /// (spec §4.5 edge case).
    #[must_use]
    pub fn segment(
        series: &[AggregateBucket],
        now: DateTime<Utc>,
        config: &SegmenterConfig,
    ) -> (Vec<Segment>, Option<Prediction>) {
        if series.len() < config.min_points {
            return (Vec::new(), None);
        }

        let t0 = series[0].start;
        let xs: Vec<f64> = series.iter().map(|b| elapsed_hours(t0, b.start)).collect();
        let ys: Vec<f64> = series.iter().map(|b| b.mean).collect();

        let candidate_ranges = split_at_refill_events(&ys, config.jump_threshold);
        let mut accepted: Vec<Range<usize>> = Vec::new();
        for candidate in candidate_ranges {
            fit_recursive(candidate, &xs, &ys, config, &mut accepted);
        }
        accepted.sort_by_key(|r| r.start);

        let mut segments = Vec::with_capacity(accepted.len());
        for (id, range) in accepted.iter().enumerate() {
            let (slope, _intercept, r_squared) = ordinary_least_squares(&xs[range.clone()], &ys[range.clone()]);
            #[expect(clippy::cast_possible_truncation, reason = "segment ids are far below u32::MAX")]
            let id = id as u32;
            segments.push(Segment {
                id,
                start_time: series[range.start].start,
                end_time: series[range.end - 1].start,
                start_value: ys[range.start],
                end_value: ys[range.end - 1],
                slope_per_hour: slope,
                r_squared,
                is_current: false,
            });
        }

        // The latest segment is "current" only if it runs to the end of the
        // series and retains at least min_segment_len points -- a refill
        // closer to `now` than that suppresses is_current (spec §4.5).
        if let Some(last) = segments.last_mut() {
            let last_range = accepted.last().expect("segments non-empty implies accepted non-empty");
            let is_trailing = last_range.end == series.len();
            let long_enough = last_range.len() >= config.min_segment_len;
            last.is_current = is_trailing && long_enough;
        }

        let prediction = segments
            .last()
            .filter(|s| s.is_current && s.slope_per_hour > 0.0)
            .map(|current| {
                let delta_hours = (config.empty_threshold - current.end_value) / current.slope_per_hour;
                let projected = current.end_time + chrono::Duration::minutes((delta_hours * 60.0).round() as i64);
                Prediction {
                    slope_per_hour: current.slope_per_hour,
                    predicted_refill_time: projected.max(now),
                }
            });

        (segments, prediction)
    }
}

fn elapsed_hours(t0: DateTime<Utc>, t: DateTime<Utc>) -> f64 {
    (t - t0).num_seconds() as f64 / 3600.0
}

/// Splits `ys` into contiguous candidate ranges wherever a drop larger than
/// `jump_threshold` occurs between consecutive points (a refill event,
/// spec §4.5).
fn split_at_refill_events(ys: &[f64], jump_threshold: f64) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    for i in 1..ys.len() {
        let drop = ys[i - 1] - ys[i];
        if drop > jump_threshold {
            ranges.push(start..i);
            start = i;
        }
    }
    ranges.push(start..ys.len());
    ranges.into_iter().filter(|r| !r.is_empty()).collect()
}

/// Recursively splits `range` at the point of largest residual until every
/// resulting sub-interval meets `config.min_goodness_r2` or falls below
/// `config.min_segment_len` (discarded as noise), per spec §4.5 step 3.
fn fit_recursive(
    range: Range<usize>,
    xs: &[f64],
    ys: &[f64],
    config: &SegmenterConfig,
    accepted: &mut Vec<Range<usize>>,
) {
    if range.len() < 2 {
        return;
    }
    let (slope, intercept, r_squared) = ordinary_least_squares(&xs[range.clone()], &ys[range.clone()]);
    if r_squared >= config.min_goodness_r2 {
        accepted.push(range);
        return;
    }
    if range.len() <= config.min_segment_len {
        // Below the minimum length and still a poor fit: discard as noise.
        return;
    }

    let split_offset = max_residual_index(&xs[range.clone()], &ys[range.clone()], slope, intercept);
    let split_point = range.start + split_offset;
    if split_point <= range.start || split_point >= range.end - 1 {
        // Degenerate split (residual peak at an endpoint): nothing useful
        // to divide further; treat the whole interval as noise.
        return;
    }

    fit_recursive(range.start..split_point + 1, xs, ys, config, accepted);
    fit_recursive(split_point + 1..range.end, xs, ys, config, accepted);
}

fn max_residual_index(xs: &[f64], ys: &[f64], slope: f64, intercept: f64) -> usize {
    xs.iter()
        .zip(ys)
        .enumerate()
        .map(|(i, (x, y))| (i, (y - (slope * x + intercept)).abs()))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(i, _)| i)
}

/// Ordinary least squares of `ys` against `xs`. Returns `(slope, intercept,
/// r_squared)`. `r_squared` is `1.0` for a degenerate (constant-`y` or
/// single-point) fit with zero residual.
fn ordinary_least_squares(xs: &[f64], ys: &[f64]) -> (f64, f64, f64) {
    let n = xs.len() as f64;
    if xs.len() < 2 {
        return (0.0, ys.first().copied().unwrap_or(0.0), 1.0);
    }
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut cov_xy = 0.0;
    let mut var_x = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        cov_xy += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
    }
    if var_x == 0.0 {
        // All x equal (should not happen for a real time series); flat fit.
        return (0.0, mean_y, 1.0);
    }
    let slope = cov_xy / var_x;
    let intercept = mean_y - slope * mean_x;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        let predicted = slope * x + intercept;
        ss_res += (y - predicted).powi(2);
        ss_tot += (y - mean_y).powi(2);
    }
    let r_squared = if ss_tot == 0.0 { 1.0 } else { 1.0 - ss_res / ss_tot };
    (slope, intercept, r_squared)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bucket(start: DateTime<Utc>, mean: f64) -> AggregateBucket {
        AggregateBucket { start, width_secs: 3600, count: 1, mean, min: mean, max: mean, stddev: 0.0 }
    }

    fn hourly_series(base: DateTime<Utc>, values: &[f64]) -> Vec<AggregateBucket> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| bucket(base + chrono::Duration::hours(i as i64), v))
            .collect()
    }

    /// Spec §8 scenario 2: two monotone segments separated by a refill.
    #[test]
    fn spec_scenario_two_segments_with_refill() {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut values: Vec<f64> = (0..20).map(|h| 10.0 + 0.5 * f64::from(h)).collect();
        values.extend((20..40).map(|h| 5.0 + 0.5 * f64::from(h - 20)));
        let series = hourly_series(base, &values);
        let now = base + chrono::Duration::hours(39);

        // Threshold low enough to catch the spec's ~14.5-unit drop at h=20.
        let config = SegmenterConfig::builder(100.0).jump_threshold(10.0).build();
        let (segments, _prediction) = Segmenter::segment(&series, now, &config);

        assert_eq!(segments.len(), 2, "expected exactly two segments, got {segments:?}");
        for segment in &segments {
            assert!((segment.slope_per_hour - 0.5).abs() < 0.05, "slope {} not ~0.5", segment.slope_per_hour);
            assert!(segment.r_squared >= 0.99, "r2 {} below 0.99", segment.r_squared);
        }
        assert_eq!(segments[0].id, 0);
        assert_eq!(segments[1].id, 1);
        assert!(segments[1].is_current);
        assert!(!segments[0].is_current);
    }

    #[test]
    fn short_series_yields_no_segments() {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let series = hourly_series(base, &[10.0, 10.5, 11.0]);
        let config = SegmenterConfig::builder(100.0).min_points(5).build();
        let (segments, prediction) = Segmenter::segment(&series, base, &config);
        assert!(segments.is_empty());
        assert!(prediction.is_none());
    }

    #[test]
    fn pure_noise_yields_no_segments() {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        // Alternating high/low values with no linear structure and no
        // single jump large enough to be a refill event.
        let values: Vec<f64> = (0..12).map(|i| if i % 2 == 0 { 10.0 } else { 10.05 }).collect();
        let config = SegmenterConfig::builder(100.0).jump_threshold(50.0).min_goodness_r2(0.9).build();
        let series = hourly_series(base, &values);
        let now = base + chrono::Duration::hours(11);
        let (segments, _) = Segmenter::segment(&series, now, &config);
        assert!(segments.is_empty(), "near-flat noise should not pass a 0.9 r2 bound as a monotone segment");
    }

    /// Spec §8 scenario 6: slope 0.5/hr, last value 20, empty threshold 50
    /// -> predicted refill at now + 60h (within a minute).
    #[test]
    fn spec_scenario_prediction() {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let values: Vec<f64> = (0..10).map(|h| 20.0 - 0.5 * f64::from(9 - h)).collect();
        let series = hourly_series(base, &values);
        let now = base + chrono::Duration::hours(9);
        let config = SegmenterConfig::builder(50.0).min_points(5).build();

        let (segments, prediction) = Segmenter::segment(&series, now, &config);
        assert!(segments.last().unwrap().is_current);
        let prediction = prediction.expect("positive-slope current segment must yield a prediction");
        assert!((prediction.slope_per_hour - 0.5).abs() < 0.01);
        let expected = now + chrono::Duration::hours(60);
        let delta = (prediction.predicted_refill_time - expected).num_minutes().abs();
        assert!(delta <= 1, "predicted time off by {delta} minutes");
    }

    #[test]
    fn prediction_clamped_to_now_when_already_past_threshold() {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let values: Vec<f64> = (0..10).map(|h| f64::from(h) * 10.0).collect();
        let series = hourly_series(base, &values);
        let now = base + chrono::Duration::hours(9);
        // empty_threshold already exceeded by the last value (90 > 50).
        let config = SegmenterConfig::builder(50.0).min_points(5).build();
        let (_segments, prediction) = Segmenter::segment(&series, now, &config);
        let prediction = prediction.expect("still a positive-slope current segment");
        assert!(prediction.predicted_refill_time >= now);
    }

    #[test]
    fn negative_slope_current_segment_has_no_prediction() {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let values: Vec<f64> = (0..10).map(|h| 100.0 - 2.0 * f64::from(h)).collect();
        let series = hourly_series(base, &values);
        let now = base + chrono::Duration::hours(9);
        let config = SegmenterConfig::builder(50.0).min_points(5).build();
        let (_segments, prediction) = Segmenter::segment(&series, now, &config);
        assert!(prediction.is_none(), "a draining-toward-full (negative slope) segment must not predict a refill");
    }

    #[test]
    fn ols_perfect_line_has_r2_one() {
        let xs = vec![0.0, 1.0, 2.0, 3.0];
        let ys = vec![1.0, 3.0, 5.0, 7.0];
        let (slope, intercept, r2) = ordinary_least_squares(&xs, &ys);
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((intercept - 1.0).abs() < 1e-9);
        assert!((r2 - 1.0).abs() < 1e-9);
    }
}
