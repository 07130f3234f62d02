//! Binds `health::HealthMonitor` to the Ingest Buffer's `ShedSignal` /
//! `FlushObserver` ports and the Publisher's `HealthProbe` port, so a
//! single monitor instance backs every call site the spec names (spec
//! §4.8: "called from the Ingest Buffer drain on every flush" and from the
//! shed-mode transition and the Publisher's cycle).

use crate::adapters::notify::EmailNotifier;
use chrono::Utc;
use domain::{HealthNotifier, Notification, NotifyError, StoreStats};
use health::HealthMonitor;
use ingest::{FlushObserver, ShedSignal};
use publish::HealthProbe;
use std::sync::Arc;

/// Either a configured SMTP notifier, or nothing at all -- operators who
/// leave `alert.email_to` blank still get every other behavior, just with
/// notifications discarded instead of delivered.
#[derive(Clone)]
pub enum NotifierHandle {
    Email(Arc<EmailNotifier>),
    Disabled,
}

impl HealthNotifier for NotifierHandle {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        match self {
            Self::Email(notifier) => notifier.notify(notification).await,
            Self::Disabled => {
                tracing::debug!(subject = %notification.subject, "health.notify.discarded: no notifier configured");
                Ok(())
            }
        }
    }
}

pub struct HealthGlue<S> {
    monitor: Arc<HealthMonitor>,
    stats: Arc<S>,
    notifier: NotifierHandle,
}

// Derived `Clone` would require `S: Clone`, which the concrete store types
// this wraps (e.g. `SqliteStore`) deliberately are not -- every field here
// is already cheap to clone on its own (`Arc`, or the small `NotifierHandle`
// enum), so clone them directly instead.
impl<S> Clone for HealthGlue<S> {
    fn clone(&self) -> Self {
        Self { monitor: Arc::clone(&self.monitor), stats: Arc::clone(&self.stats), notifier: self.notifier.clone() }
    }
}

impl<S> HealthGlue<S> {
    #[must_use]
    pub fn new(monitor: Arc<HealthMonitor>, stats: Arc<S>, notifier: NotifierHandle) -> Self {
        Self { monitor, stats, notifier }
    }
}

impl<S> ShedSignal for HealthGlue<S>
where
    S: StoreStats + Send + Sync,
{
    async fn on_shed_mode_entered(&self) {
        if let Err(err) = self.monitor.notify_shed_mode(&self.notifier, Utc::now()).await {
            tracing::warn!("health.notify_shed_mode.failed: {err}");
        }
    }
}

impl<S> FlushObserver for HealthGlue<S>
where
    S: StoreStats + Send + Sync,
{
    async fn on_flush(&self) {
        if let Err(err) = self.monitor.check(self.stats.as_ref(), &self.notifier, Utc::now()).await {
            tracing::warn!("health.check.failed: {err}");
        }
    }
}

impl<S> HealthProbe for HealthGlue<S>
where
    S: StoreStats + Send + Sync,
{
    async fn probe(&self) {
        if let Err(err) = self.monitor.check(self.stats.as_ref(), &self.notifier, Utc::now()).await {
            tracing::warn!("health.check.failed: {err}");
        }
    }
}
