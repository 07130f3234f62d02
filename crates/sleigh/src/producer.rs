//! Wires `Store::snapshot` -> `Aggregator::aggregate` (x3 resolutions) ->
//! `Segmenter::segment` -> `artifact::build` into a single
//! `publish::ArtifactProducer` (spec §4.6, §8).

use aggregate::Aggregator;
use artifact::{ArtifactInputs, build};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use domain::{Resolution, SeasonConfig, Snapshot, Store};
use publish::{ArtifactProducer, ProduceError};
use segment::{Segmenter, SegmenterConfig};

/// Produces the compressed live artifact from the current store contents.
/// Generic over the concrete `Store` so it can be exercised against an
/// in-memory fake in tests without pulling in `sqlx`.
#[derive(Debug, Clone)]
pub struct StoreArtifactProducer<S> {
    store: std::sync::Arc<S>,
    season: SeasonConfig,
    segmenter_config: SegmenterConfig,
    minutes_of_data: u32,
    replay_delay_seconds: u64,
}

impl<S> StoreArtifactProducer<S> {
    #[must_use]
    pub fn new(
        store: std::sync::Arc<S>,
        season: SeasonConfig,
        segmenter_config: SegmenterConfig,
        minutes_of_data: u32,
        replay_delay_seconds: u64,
    ) -> Self {
        Self { store, season, segmenter_config, minutes_of_data, replay_delay_seconds }
    }
}

impl<S> ArtifactProducer for StoreArtifactProducer<S>
where
    S: Store + Send + Sync,
{
    async fn produce(&self, now: DateTime<Utc>) -> Result<Vec<u8>, ProduceError> {
        let snapshot = self.store.snapshot().await.map_err(|err| ProduceError(err.to_string()))?;

        let agg_1m = Aggregator::aggregate(&snapshot, Resolution::OneMinute, now)
            .await
            .map_err(|err| ProduceError(err.to_string()))?;
        let agg_5m = Aggregator::aggregate(&snapshot, Resolution::FiveMinute, now)
            .await
            .map_err(|err| ProduceError(err.to_string()))?;
        let agg_1h = Aggregator::aggregate(&snapshot, Resolution::OneHour, now)
            .await
            .map_err(|err| ProduceError(err.to_string()))?;

        let (segments, prediction) = Segmenter::segment(&agg_1h.buckets, now, &self.segmenter_config);

        let measurements_since = now - ChronoDuration::minutes(i64::from(self.minutes_of_data));
        let measurements = snapshot
            .observations_since(measurements_since)
            .await
            .map_err(|err| ProduceError(err.to_string()))?;

        let artifact = build(ArtifactInputs {
            now,
            season: &self.season,
            replay_delay_seconds: self.replay_delay_seconds,
            minutes_of_data: self.minutes_of_data,
            measurements: &measurements,
            agg_1m: &agg_1m.buckets,
            agg_5m: &agg_5m.buckets,
            agg_1h: &agg_1h.buckets,
            segments: &segments,
            prediction: prediction.as_ref(),
        })
        .map_err(|err| ProduceError(err.to_string()))?;

        Ok(artifact.gzipped)
    }
}
