//! Source-A subscriber: connects to the local broker, subscribes to
//! configured topic patterns, and forwards every delivered message to the
//! Ingest Buffer as an [`Observation`] (spec §4.2).
//!
//! Entry point: [`SourceA::run`]. Configuration via
//! [`SourceAConfig::builder`]. Generic over [`BrokerClient`] and
//! `domain::IngestSink` -- carries no concrete MQTT logic.

use chrono::Utc;
use domain::{IngestError, IngestSink, Observation, Qos, SubscriberState};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// BrokerClient port (local to source_a: no other component crate needs it)
// ---------------------------------------------------------------------------

/// Errors a [`BrokerClient`] adapter may return.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// The broker connection could not be established or was lost.
    #[error("broker connection error: {0}")]
    Connection(String),
    /// A subscribe request was rejected by the broker.
    #[error("broker subscribe error: {0}")]
    Subscribe(String),
}

/// One message delivered by the broker on a subscribed topic (spec §6).
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
    pub qos: Qos,
    pub retained: bool,
}

/// Outbound port: a local pub/sub broker connection. Implemented by the
/// concrete MQTT adapter in `sleigh`.
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait BrokerClient {
    /// Establish (or re-establish) the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] on failure.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    /// Subscribe to `pattern` (may contain `+`/`#` wildcards) at `qos`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Subscribe`] if the broker rejects the request.
    async fn subscribe(&mut self, pattern: &str, qos: Qos) -> Result<(), BrokerError>;

    /// Wait for the next delivered message. Returns `Ok(None)` when the
    /// connection is cleanly closed by the peer.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if the connection drops.
    async fn next_message(&mut self) -> Result<Option<BrokerMessage>, BrokerError>;

    /// Best-effort graceful disconnect. Never fails.
    async fn disconnect(&mut self);
}

// ---------------------------------------------------------------------------
// SourceAError
// ---------------------------------------------------------------------------

/// Errors [`SourceA::run`] can return. Transient broker errors are *not*
/// represented here -- they are recovered internally via reconnect-with-
/// backoff and never propagate (spec §4.2, §7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceAError {
    /// The supplied configuration is invalid.
    #[error("invalid source_a configuration: {reason}")]
    InvalidConfig { reason: String },
    /// The Ingest Buffer has been permanently closed.
    #[error("ingest sink closed")]
    IngestClosed,
}

// ---------------------------------------------------------------------------
// TopicSubscription
// ---------------------------------------------------------------------------

/// One entry of `source_a.topics` (spec §6: `pattern:table:desc;...`).
///
/// `table` and `description` are carried through for operator-facing
/// diagnostics only; every Source-A message persists to the single
/// observations table regardless of which pattern matched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    pub pattern: String,
    pub table: String,
    pub description: String,
}

// ---------------------------------------------------------------------------
// SourceAConfig + builder
// ---------------------------------------------------------------------------

/// Runtime configuration for a [`SourceA`] subscriber.
///
/// Construct via [`SourceAConfig::builder`].
#[derive(Debug, Clone)]
pub struct SourceAConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: Qos,
    pub keepalive: Duration,
    pub topics: Vec<TopicSubscription>,
    /// Initial backoff delay after a failed connection attempt.
    pub backoff_min: Duration,
    /// Backoff delay cap; doubles from `backoff_min` up to this value.
    pub backoff_max: Duration,
}

/// Builder for [`SourceAConfig`].
#[derive(Debug, Clone)]
pub struct SourceAConfigBuilder {
    broker_host: String,
    broker_port: u16,
    username: Option<String>,
    password: Option<String>,
    qos: Qos,
    keepalive: Duration,
    topics: Vec<TopicSubscription>,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl SourceAConfig {
    /// Create a builder. `broker_host`, `broker_port` and at least one topic
    /// (added via [`SourceAConfigBuilder::topic`]) are required.
    ///
    /// Defaults: `qos = AtMostOnce`, `keepalive = 60s`, `backoff_min = 1s`,
    /// `backoff_max = 60s`.
    #[must_use]
    pub fn builder(broker_host: impl Into<String>, broker_port: u16) -> SourceAConfigBuilder {
        SourceAConfigBuilder {
            broker_host: broker_host.into(),
            broker_port,
            username: None,
            password: None,
            qos: Qos::AtMostOnce,
            keepalive: Duration::from_secs(60),
            topics: Vec::new(),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl SourceAConfigBuilder {
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    #[must_use]
    pub fn topic(mut self, subscription: TopicSubscription) -> Self {
        self.topics.push(subscription);
        self
    }

    #[must_use]
    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max;
        self
    }

    /// Validate and build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SourceAError::InvalidConfig`] when `broker_host` is empty,
    /// `topics` is empty, or `backoff_min > backoff_max`.
    pub fn build(self) -> Result<SourceAConfig, SourceAError> {
        if self.broker_host.is_empty() {
            return Err(SourceAError::InvalidConfig {
                reason: "broker_host must not be empty".to_owned(),
            });
        }
        if self.topics.is_empty() {
            return Err(SourceAError::InvalidConfig {
                reason: "at least one topic subscription is required".to_owned(),
            });
        }
        if self.backoff_min > self.backoff_max {
            return Err(SourceAError::InvalidConfig {
                reason: "backoff_min must be <= backoff_max".to_owned(),
            });
        }
        Ok(SourceAConfig {
            broker_host: self.broker_host,
            broker_port: self.broker_port,
            username: self.username,
            password: self.password,
            qos: self.qos,
            keepalive: self.keepalive,
            topics: self.topics,
            backoff_min: self.backoff_min,
            backoff_max: self.backoff_max,
        })
    }
}

// ---------------------------------------------------------------------------
// SourceA
// ---------------------------------------------------------------------------

/// Drives a [`BrokerClient`] through `Disconnected -> Connecting ->
/// Subscribed -> Failed -> (backoff) -> Connecting` and forwards every
/// delivered message to an `IngestSink` as an [`Observation`] (spec §4.2).
#[derive(Debug)]
pub struct SourceA {
    config: SourceAConfig,
}

impl SourceA {
    #[must_use]
    pub fn new(config: SourceAConfig) -> Self {
        Self { config }
    }

    /// Run the connect/subscribe/receive loop until `cancel` fires or the
    /// ingest sink is permanently closed.
    ///
    /// Every transient [`BrokerError`] is logged and recovered via
    /// exponential backoff (capped at `config.backoff_max`); it never
    /// propagates. The only propagated error is
    /// [`SourceAError::IngestClosed`], since that condition means the rest
    /// of the pipeline has shut down and there is nothing left to forward
    /// to.
    ///
    /// # Errors
    ///
    /// Returns [`SourceAError::IngestClosed`] once the Ingest Buffer
    /// reports [`IngestError::Closed`].
    pub async fn run<B, S>(&self, broker: &mut B, sink: &S, cancel: CancellationToken) -> Result<(), SourceAError>
    where
        B: BrokerClient,
        S: IngestSink,
    {
        let mut backoff = self.config.backoff_min;

        loop {
            if cancel.is_cancelled() {
                tracing::info!("source_a.run.cancelled");
                return Ok(());
            }

            tracing::debug!("source_a.state: Connecting");
            if let Err(e) = broker.connect().await {
                tracing::warn!("source_a.connect.failed: {e}");
                self.sleep_backoff(&mut backoff, &cancel).await;
                continue;
            }

            let mut subscribe_failed = false;
            for topic in &self.config.topics {
                if let Err(e) = broker.subscribe(&topic.pattern, self.config.qos).await {
                    tracing::warn!(pattern = %topic.pattern, "source_a.subscribe.failed: {e}");
                    subscribe_failed = true;
                    break;
                }
            }
            if subscribe_failed {
                broker.disconnect().await;
                self.sleep_backoff(&mut backoff, &cancel).await;
                continue;
            }

            tracing::info!("source_a.state: Subscribed, topics={}", self.config.topics.len());
            backoff = self.config.backoff_min;

            match self.receive_loop(broker, sink, &cancel).await {
                Ok(true) => {
                    // Cancelled cleanly while subscribed.
                    broker.disconnect().await;
                    return Ok(());
                }
                Ok(false) => {
                    tracing::warn!("source_a.state: Failed (connection dropped)");
                    broker.disconnect().await;
                    self.sleep_backoff(&mut backoff, &cancel).await;
                }
                Err(SourceAError::IngestClosed) => {
                    broker.disconnect().await;
                    return Err(SourceAError::IngestClosed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive messages until cancellation, disconnect, or a closed sink.
    ///
    /// Returns `Ok(true)` on cancellation, `Ok(false)` on a clean broker
    /// disconnect (the caller should reconnect).
    async fn receive_loop<B, S>(
        &self,
        broker: &mut B,
        sink: &S,
        cancel: &CancellationToken,
    ) -> Result<bool, SourceAError>
    where
        B: BrokerClient,
        S: IngestSink,
    {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(true),
                msg = broker.next_message() => msg,
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(false),
                Err(e) => {
                    tracing::warn!("source_a.receive.error: {e}");
                    return Ok(false);
                }
            };

            let observation = Observation {
                ts: Utc::now(),
                topic: message.topic,
                payload: message.payload,
                qos: message.qos,
                retained: message.retained,
            };

            match sink.enqueue_observation(observation).await {
                Ok(()) => {}
                Err(IngestError::Closed) => return Err(SourceAError::IngestClosed),
            }
        }
    }

    async fn sleep_backoff(&self, backoff: &mut Duration, cancel: &CancellationToken) {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(*backoff) => {}
        }
        *backoff = (*backoff * 2).min(self.config.backoff_max);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::{BrokerClient, BrokerError, BrokerMessage, SourceA, SourceAConfig, SourceAError, TopicSubscription};
    use domain::{IngestError, IngestSink, Observation, DeviceEvent, Qos};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn topic(pattern: &str) -> TopicSubscription {
        TopicSubscription {
            pattern: pattern.to_owned(),
            table: "observations".to_owned(),
            description: "test".to_owned(),
        }
    }

    #[test]
    fn config_rejects_empty_host() {
        let result = SourceAConfig::builder("", 1883).topic(topic("sensors/#")).build();
        assert!(matches!(result, Err(SourceAError::InvalidConfig { .. })));
    }

    #[test]
    fn config_rejects_no_topics() {
        let result = SourceAConfig::builder("localhost", 1883).build();
        assert!(matches!(result, Err(SourceAError::InvalidConfig { .. })));
    }

    #[test]
    fn config_rejects_inverted_backoff() {
        let result = SourceAConfig::builder("localhost", 1883)
            .topic(topic("sensors/#"))
            .backoff(Duration::from_secs(10), Duration::from_secs(1))
            .build();
        assert!(matches!(result, Err(SourceAError::InvalidConfig { .. })));
    }

    /// Scripted broker: connects successfully, delivers a fixed queue of
    /// messages, then returns `Ok(None)` (clean disconnect).
    struct ScriptedBroker {
        queue: VecDeque<BrokerMessage>,
        connect_attempts: u32,
        fail_connects: u32,
    }

    impl ScriptedBroker {
        fn new(messages: Vec<BrokerMessage>) -> Self {
            Self { queue: messages.into(), connect_attempts: 0, fail_connects: 0 }
        }

        fn failing_first(messages: Vec<BrokerMessage>, fail_connects: u32) -> Self {
            Self { queue: messages.into(), connect_attempts: 0, fail_connects }
        }
    }

    impl BrokerClient for ScriptedBroker {
        async fn connect(&mut self) -> Result<(), BrokerError> {
            self.connect_attempts += 1;
            if self.connect_attempts <= self.fail_connects {
                return Err(BrokerError::Connection("simulated".to_owned()));
            }
            Ok(())
        }

        async fn subscribe(&mut self, _pattern: &str, _qos: Qos) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn next_message(&mut self) -> Result<Option<BrokerMessage>, BrokerError> {
            Ok(self.queue.pop_front())
        }

        async fn disconnect(&mut self) {}
    }

    /// In-memory sink collecting every enqueued observation.
    struct CollectingSink {
        observations: Mutex<Vec<Observation>>,
        closed: bool,
    }

    impl CollectingSink {
        fn new() -> Self {
            Self { observations: Mutex::new(vec![]), closed: false }
        }

        fn closed() -> Self {
            Self { observations: Mutex::new(vec![]), closed: true }
        }
    }

    impl IngestSink for CollectingSink {
        async fn enqueue_observation(&self, observation: Observation) -> Result<(), IngestError> {
            if self.closed {
                return Err(IngestError::Closed);
            }
            self.observations.lock().unwrap().push(observation);
            Ok(())
        }

        async fn enqueue_device_event(&self, _event: DeviceEvent) -> Result<(), IngestError> {
            unreachable!("source_a never enqueues device events")
        }
    }

    fn msg(topic: &str, payload: &str) -> BrokerMessage {
        BrokerMessage {
            topic: topic.to_owned(),
            payload: payload.to_owned(),
            qos: Qos::AtMostOnce,
            retained: false,
        }
    }

    #[tokio::test]
    async fn forwards_all_delivered_messages_then_reconnects() {
        let config = SourceAConfig::builder("localhost", 1883)
            .topic(topic("sensors/#"))
            .backoff(Duration::from_millis(1), Duration::from_millis(5))
            .build()
            .unwrap();
        let source = SourceA::new(config);
        let mut broker = ScriptedBroker::new(vec![msg("sensors/1", "12.5"), msg("sensors/2", "13.0")]);
        let sink = CollectingSink::new();
        let cancel = CancellationToken::new();

        // After the scripted messages are drained, the broker reports a
        // clean disconnect and SourceA would loop forever reconnecting;
        // cancel shortly after to observe the forwarded observations.
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let result = source.run(&mut broker, &sink, cancel).await;
        assert!(result.is_ok());
        let observations = sink.observations.lock().unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].topic, "sensors/1");
        assert_eq!(observations[0].payload, "12.5");
        assert_eq!(observations[1].topic, "sensors/2");
    }

    #[tokio::test]
    async fn reconnects_after_connect_failure() {
        let config = SourceAConfig::builder("localhost", 1883)
            .topic(topic("sensors/#"))
            .backoff(Duration::from_millis(1), Duration::from_millis(5))
            .build()
            .unwrap();
        let source = SourceA::new(config);
        let mut broker = ScriptedBroker::failing_first(vec![msg("sensors/1", "1.0")], 2);
        let sink = CollectingSink::new();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let result = source.run(&mut broker, &sink, cancel).await;
        assert!(result.is_ok());
        assert!(broker.connect_attempts >= 3, "expected at least 3 connect attempts, got {}", broker.connect_attempts);
        assert_eq!(sink.observations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn propagates_ingest_closed() {
        let config = SourceAConfig::builder("localhost", 1883)
            .topic(topic("sensors/#"))
            .build()
            .unwrap();
        let source = SourceA::new(config);
        let mut broker = ScriptedBroker::new(vec![msg("sensors/1", "1.0")]);
        let sink = CollectingSink::closed();
        let cancel = CancellationToken::new();

        let result = source.run(&mut broker, &sink, cancel).await;
        assert!(matches!(result, Err(SourceAError::IngestClosed)));
    }
}
