//! Health Monitor: store file size / free space checks with
//! rate-limited notifications, plus a one-shot startup notification
//! (spec §4.8).
//!
//! Stateless callers (the Ingest Buffer drain, the Publisher) invoke
//! [`HealthMonitor::check`] on their own cadence; the rate-limiting state
//! lives here so a single shared [`HealthMonitor`] instance, not its
//! callers, decides whether a given cycle actually emits.

use chrono::{DateTime, Utc};
use domain::{HealthNotifier, Notification, NotificationKind, NotifyError, StoreStats};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// HealthConfig + builder
// ---------------------------------------------------------------------------

/// Thresholds and cooldown window for health notifications (spec §6
/// `alert.*`).
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub db_size_bytes: u64,
    pub free_space_bytes: u64,
    pub cooldown: Duration,
}

/// Builder for [`HealthConfig`].
#[derive(Debug, Clone, Copy)]
pub struct HealthConfigBuilder {
    db_size_bytes: u64,
    free_space_bytes: u64,
    cooldown: Duration,
}

impl HealthConfig {
    #[must_use]
    pub fn builder(db_size_mb: u64, free_space_mb: u64) -> HealthConfigBuilder {
        HealthConfigBuilder {
            db_size_bytes: db_size_mb * 1024 * 1024,
            free_space_bytes: free_space_mb * 1024 * 1024,
            cooldown: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl HealthConfigBuilder {
    #[must_use]
    pub fn cooldown_hours(mut self, hours: u64) -> Self {
        self.cooldown = Duration::from_secs(hours * 60 * 60);
        self
    }

    #[must_use]
    pub fn build(self) -> HealthConfig {
        HealthConfig {
            db_size_bytes: self.db_size_bytes,
            free_space_bytes: self.free_space_bytes,
            cooldown: self.cooldown,
        }
    }
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

/// Rate-limits at most one notification per `(kind, cooldown-window)`
/// (spec §4.8). Share one instance across every call site.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    last_sent: Mutex<HashMap<NotificationKind, DateTime<Utc>>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self { config, last_sent: Mutex::new(HashMap::new()) }
    }

    /// Check current store size and free space against configured
    /// thresholds, emitting at most one notification per breached kind,
    /// subject to the cooldown window.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if a due notification fails to deliver; the
    /// underlying store stat read failing is logged and treated as "no
    /// breach this cycle" rather than propagated, since a missed health
    /// check is not itself fatal (spec §7).
    pub async fn check<S, N>(&self, stats: &S, notifier: &N, now: DateTime<Utc>) -> Result<(), NotifyError>
    where
        S: StoreStats,
        N: HealthNotifier,
    {
        let file_size = match stats.file_size_bytes().await {
            Ok(size) => size,
            Err(err) => {
                tracing::warn!("health.check.file_size_unavailable: {err}");
                return Ok(());
            }
        };
        let free_space = match stats.free_space_bytes().await {
            Ok(size) => size,
            Err(err) => {
                tracing::warn!("health.check.free_space_unavailable: {err}");
                return Ok(());
            }
        };

        if file_size > self.config.db_size_bytes {
            self.maybe_notify(
                notifier,
                NotificationKind::StoreSizeThreshold,
                now,
                "store file size exceeds threshold".to_owned(),
                format!("store file is {file_size} bytes, threshold is {} bytes", self.config.db_size_bytes),
            )
            .await?;
        }

        if free_space < self.config.free_space_bytes {
            self.maybe_notify(
                notifier,
                NotificationKind::LowFreeSpace,
                now,
                "free space below threshold".to_owned(),
                format!("{free_space} bytes free, threshold is {} bytes", self.config.free_space_bytes),
            )
            .await?;
        }

        Ok(())
    }

    /// Notify that the Ingest Buffer has entered shed mode. Not rate
    /// limited the same way as the threshold checks above; invoked from
    /// [`ingest`]'s `ShedSignal` port the instant shed mode is entered
    /// (spec §4.3, §4.8), so it still passes through the shared cooldown
    /// so a flapping buffer does not flood the notifier.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if delivery fails.
    pub async fn notify_shed_mode<N: HealthNotifier>(&self, notifier: &N, now: DateTime<Utc>) -> Result<(), NotifyError> {
        self.maybe_notify(
            notifier,
            NotificationKind::ShedMode,
            now,
            "ingest buffer entered shed mode".to_owned(),
            "store writes are failing with StorageFull; oldest pending records are being discarded".to_owned(),
        )
        .await
    }

    /// Emit the once-per-process startup notification with the effective
    /// configuration, for operator confirmation (spec §4.8). Not subject
    /// to the cooldown: the caller is expected to invoke this exactly
    /// once, at startup.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if delivery fails.
    pub async fn startup<N: HealthNotifier>(&self, notifier: &N, effective_config: String) -> Result<(), NotifyError> {
        notifier
            .notify(Notification {
                kind: NotificationKind::Startup,
                subject: "data sleigh started".to_owned(),
                body: effective_config,
            })
            .await
    }

    async fn maybe_notify<N: HealthNotifier>(
        &self,
        notifier: &N,
        kind: NotificationKind,
        now: DateTime<Utc>,
        subject: String,
        body: String,
    ) -> Result<(), NotifyError> {
        {
            let mut last_sent = self.last_sent.lock().await;
            if let Some(&sent_at) = last_sent.get(&kind) {
                let elapsed = (now - sent_at).to_std().unwrap_or(Duration::ZERO);
                if elapsed < self.config.cooldown {
                    return Ok(());
                }
            }
            last_sent.insert(kind, now);
        }
        notifier.notify(Notification { kind, subject, body }).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use domain::StoreError;
    use std::sync::Mutex as StdMutex;

    struct FixedStats {
        file_size: u64,
        free_space: u64,
    }
    impl StoreStats for FixedStats {
        async fn file_size_bytes(&self) -> Result<u64, StoreError> {
            Ok(self.file_size)
        }
        async fn free_space_bytes(&self) -> Result<u64, StoreError> {
            Ok(self.free_space)
        }
    }

    #[derive(Default)]
    struct CollectingNotifier {
        received: StdMutex<Vec<Notification>>,
    }
    impl HealthNotifier for CollectingNotifier {
        async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
            self.received.lock().unwrap().push(notification);
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn no_breach_emits_nothing() {
        let monitor = HealthMonitor::new(HealthConfig::builder(1000, 100).build());
        let stats = FixedStats { file_size: 10, free_space: 1_000_000_000 };
        let notifier = CollectingNotifier::default();
        monitor.check(&stats, &notifier, now()).await.unwrap();
        assert!(notifier.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_size_breach_emits_once() {
        let monitor = HealthMonitor::new(HealthConfig::builder(1, 100).build());
        let stats = FixedStats { file_size: 2 * 1024 * 1024, free_space: 1_000_000_000 };
        let notifier = CollectingNotifier::default();

        monitor.check(&stats, &notifier, now()).await.unwrap();
        monitor.check(&stats, &notifier, now() + chrono::Duration::minutes(1)).await.unwrap();

        let received = notifier.received.lock().unwrap();
        assert_eq!(received.len(), 1, "cooldown must suppress the second breach within the window");
        assert_eq!(received[0].kind, NotificationKind::StoreSizeThreshold);
    }

    #[tokio::test]
    async fn breach_repeats_after_cooldown_elapses() {
        let monitor = HealthMonitor::new(HealthConfig::builder(1, 100).cooldown_hours(1).build());
        let stats = FixedStats { file_size: 2 * 1024 * 1024, free_space: 1_000_000_000 };
        let notifier = CollectingNotifier::default();

        monitor.check(&stats, &notifier, now()).await.unwrap();
        monitor.check(&stats, &notifier, now() + chrono::Duration::hours(2)).await.unwrap();

        assert_eq!(notifier.received.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn low_free_space_and_size_breach_both_fire_independently() {
        let monitor = HealthMonitor::new(HealthConfig::builder(1, 1000).build());
        let stats = FixedStats { file_size: 2 * 1024 * 1024, free_space: 10 };
        let notifier = CollectingNotifier::default();
        monitor.check(&stats, &notifier, now()).await.unwrap();
        let received = notifier.received.lock().unwrap();
        assert_eq!(received.len(), 2);
    }

    #[tokio::test]
    async fn startup_notification_is_not_rate_limited_by_check() {
        let monitor = HealthMonitor::new(HealthConfig::builder(1000, 100).build());
        let notifier = CollectingNotifier::default();
        monitor.startup(&notifier, "effective config: ...".to_owned()).await.unwrap();
        let received = notifier.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, NotificationKind::Startup);
    }

    #[tokio::test]
    async fn shed_mode_notification_shares_the_cooldown_bucket() {
        let monitor = HealthMonitor::new(HealthConfig::builder(1000, 100).build());
        let notifier = CollectingNotifier::default();
        monitor.notify_shed_mode(&notifier, now()).await.unwrap();
        monitor.notify_shed_mode(&notifier, now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(notifier.received.lock().unwrap().len(), 1, "flapping shed mode must not flood the notifier");
    }
}
