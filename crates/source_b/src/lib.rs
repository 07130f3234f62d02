//! Source-B subscriber: exchanges a long-lived secret for a short-lived
//! bearer token, connects to the cloud pub/sub endpoint, subscribes to the
//! configured device ids, and forwards every parsed event to the Ingest
//! Buffer as a [`DeviceEvent`] (spec §4.2).
//!
//! Entry point: [`SourceB::run`]. Configuration via
//! [`SourceBConfig::builder`]. Generic over [`TokenProvider`],
//! [`CloudStream`] and `domain::IngestSink`.

use chrono::{DateTime, Utc};
use domain::{DeviceClass, DeviceEvent, IngestError, IngestSink};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// TokenProvider port
// ---------------------------------------------------------------------------

/// Errors a [`TokenProvider`] adapter may return.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("token exchange failed: {0}")]
    Exchange(String),
}

/// A short-lived bearer token and its validity window (spec §6).
#[derive(Debug, Clone, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Outbound port: exchanges `{uaid, secret}` for a bearer token against the
/// cloud's HTTPS endpoint. Implemented by the concrete `reqwest` adapter in
/// `sleigh`.
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait TokenProvider {
    /// # Errors
    ///
    /// Returns [`AuthError::Exchange`] on any non-2xx response or transport
    /// failure.
    async fn fetch_token(&self, uaid: &str, secret: &str) -> Result<TokenResponse, AuthError>;
}

// ---------------------------------------------------------------------------
// CloudStream port
// ---------------------------------------------------------------------------

/// Errors a [`CloudStream`] adapter may return.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CloudError {
    #[error("cloud stream connection error: {0}")]
    Connection(String),
    #[error("cloud stream subscribe error: {0}")]
    Subscribe(String),
}

/// One event body as delivered by the cloud stream, before parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCloudEvent {
    pub body: String,
}

/// Outbound port: the cloud pub/sub connection (e.g. a WebSocket),
/// authenticated with a bearer token. Implemented by the concrete
/// `tokio-tungstenite` adapter in `sleigh`.
#[expect(async_fn_in_trait, reason = "internal workspace only")]
pub trait CloudStream {
    /// # Errors
    ///
    /// Returns [`CloudError::Connection`] on failure.
    async fn connect(&mut self, bearer_token: &str) -> Result<(), CloudError>;

    /// # Errors
    ///
    /// Returns [`CloudError::Subscribe`] if the endpoint rejects the
    /// device-id list.
    async fn subscribe_devices(&mut self, device_ids: &[String]) -> Result<(), CloudError>;

    /// Wait for the next delivered event. Returns `Ok(None)` on a clean
    /// disconnect by the peer.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Connection`] if the connection drops.
    async fn next_event(&mut self) -> Result<Option<RawCloudEvent>, CloudError>;

    /// Best-effort graceful disconnect. Never fails.
    async fn disconnect(&mut self);
}

// ---------------------------------------------------------------------------
// SourceBError
// ---------------------------------------------------------------------------

/// Errors [`SourceB::run`] can return. Transient auth/network errors are
/// recovered internally via reconnect-with-backoff and never propagate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceBError {
    #[error("invalid source_b configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error("ingest sink closed")]
    IngestClosed,
}

// ---------------------------------------------------------------------------
// SourceBConfig + builder
// ---------------------------------------------------------------------------

/// Runtime configuration for a [`SourceB`] subscriber.
///
/// Construct via [`SourceBConfig::builder`].
#[derive(Debug, Clone)]
pub struct SourceBConfig {
    pub uaid: String,
    pub secret: String,
    pub air_devices: Vec<String>,
    pub water_devices: Vec<String>,
    /// Refresh the token this long before it would otherwise expire.
    pub refresh_margin: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

/// Builder for [`SourceBConfig`].
#[derive(Debug, Clone)]
pub struct SourceBConfigBuilder {
    uaid: String,
    secret: String,
    air_devices: Vec<String>,
    water_devices: Vec<String>,
    refresh_margin: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl SourceBConfig {
    /// Create a builder. `uaid` and `secret` are the only required
    /// parameters; at least one device id must be added via
    /// [`SourceBConfigBuilder::air_device`] or
    /// [`SourceBConfigBuilder::water_device`].
    ///
    /// Defaults: `refresh_margin = 60s`, `backoff_min = 1s`,
    /// `backoff_max = 60s`.
    #[must_use]
    pub fn builder(uaid: impl Into<String>, secret: impl Into<String>) -> SourceBConfigBuilder {
        SourceBConfigBuilder {
            uaid: uaid.into(),
            secret: secret.into(),
            air_devices: Vec::new(),
            water_devices: Vec::new(),
            refresh_margin: Duration::from_secs(60),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl SourceBConfigBuilder {
    #[must_use]
    pub fn air_device(mut self, device_id: impl Into<String>) -> Self {
        self.air_devices.push(device_id.into());
        self
    }

    #[must_use]
    pub fn water_device(mut self, device_id: impl Into<String>) -> Self {
        self.water_devices.push(device_id.into());
        self
    }

    #[must_use]
    pub fn refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    #[must_use]
    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max;
        self
    }

    /// # Errors
    ///
    /// Returns [`SourceBError::InvalidConfig`] when `uaid`/`secret` is
    /// empty, no device ids were registered, or `backoff_min > backoff_max`.
    pub fn build(self) -> Result<SourceBConfig, SourceBError> {
        if self.uaid.is_empty() || self.secret.is_empty() {
            return Err(SourceBError::InvalidConfig {
                reason: "uaid and secret must not be empty".to_owned(),
            });
        }
        if self.air_devices.is_empty() && self.water_devices.is_empty() {
            return Err(SourceBError::InvalidConfig {
                reason: "at least one device id is required".to_owned(),
            });
        }
        if self.backoff_min > self.backoff_max {
            return Err(SourceBError::InvalidConfig {
                reason: "backoff_min must be <= backoff_max".to_owned(),
            });
        }
        Ok(SourceBConfig {
            uaid: self.uaid,
            secret: self.secret,
            air_devices: self.air_devices,
            water_devices: self.water_devices,
            refresh_margin: self.refresh_margin,
            backoff_min: self.backoff_min,
            backoff_max: self.backoff_max,
        })
    }
}

impl SourceBConfig {
    fn device_ids(&self) -> Vec<String> {
        self.air_devices.iter().chain(self.water_devices.iter()).cloned().collect()
    }

    fn classify(&self, device_id: &str) -> Option<DeviceClass> {
        if self.air_devices.iter().any(|d| d == device_id) {
            Some(DeviceClass::AirSensor)
        } else if self.water_devices.iter().any(|d| d == device_id) {
            Some(DeviceClass::WaterSensor)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Wire event parsing
// ---------------------------------------------------------------------------

/// Minimal shape of a cloud event, per spec §6: `{time, deviceId,
/// payload:{...device-specific fields...}}`.
#[derive(Debug, Deserialize)]
struct WireEvent {
    time: DateTime<Utc>,
    #[serde(rename = "deviceId")]
    device_id: String,
    payload: WirePayload,
}

#[derive(Debug, Deserialize)]
struct WirePayload {
    #[serde(rename = "temperatureF", default)]
    temperature_f: Option<f64>,
    #[serde(rename = "humidityPct", default)]
    humidity_pct: Option<f64>,
    #[serde(rename = "batteryPct")]
    battery_pct: u8,
    #[serde(rename = "signalDbm")]
    signal_dbm: i32,
}

/// Parses one raw cloud event body into a [`DeviceEvent`].
///
/// Device class is looked up by `device_id` in `classify`; an unrecognized
/// device id is treated the same as a malformed body (spec §4.2: "device
/// class is inferred from the originating device id's registered role").
/// `humidity` is forced to `None` for [`DeviceClass::WaterSensor`]
/// regardless of what the payload carries, matching spec §3.
fn parse_device_event(
    body: &str,
    classify: impl Fn(&str) -> Option<DeviceClass>,
) -> Result<DeviceEvent, String> {
    let wire: WireEvent = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let device_class = classify(&wire.device_id)
        .ok_or_else(|| format!("unregistered device id: {}", wire.device_id))?;
    let humidity = match device_class {
        DeviceClass::AirSensor => wire.payload.humidity_pct,
        DeviceClass::WaterSensor => None,
    };
    Ok(DeviceEvent {
        ts: wire.time,
        device_id: wire.device_id,
        device_class,
        temperature: wire.payload.temperature_f,
        humidity,
        battery: wire.payload.battery_pct,
        signal: wire.payload.signal_dbm,
        raw_payload: body.to_owned(),
    })
}

// ---------------------------------------------------------------------------
// SourceB
// ---------------------------------------------------------------------------

/// Drives a [`TokenProvider`] + [`CloudStream`] pair through
/// `Disconnected -> Connecting -> Authenticating -> Subscribed -> Failed ->
/// (backoff) -> Connecting`, parses every delivered event, and forwards it
/// to an `IngestSink` (spec §4.2).
#[derive(Debug)]
pub struct SourceB {
    config: SourceBConfig,
}

enum CycleOutcome {
    Cancelled,
    TokenExpiring,
    Disconnected,
    IngestClosed,
}

impl SourceB {
    #[must_use]
    pub fn new(config: SourceBConfig) -> Self {
        Self { config }
    }

    /// # Errors
    ///
    /// Returns [`SourceBError::IngestClosed`] once the Ingest Buffer
    /// reports [`IngestError::Closed`].
    pub async fn run<A, C, S>(
        &self,
        auth: &A,
        stream: &mut C,
        sink: &S,
        cancel: CancellationToken,
    ) -> Result<(), SourceBError>
    where
        A: TokenProvider,
        C: CloudStream,
        S: IngestSink,
    {
        let device_ids = self.config.device_ids();
        let mut backoff = self.config.backoff_min;

        loop {
            if cancel.is_cancelled() {
                tracing::info!("source_b.run.cancelled");
                return Ok(());
            }

            tracing::debug!("source_b.state: Authenticating");
            let token = match auth.fetch_token(&self.config.uaid, &self.config.secret).await {
                Ok(token) => token,
                Err(e) => {
                    tracing::warn!("source_b.auth.failed: {e}");
                    self.sleep_backoff(&mut backoff, &cancel).await;
                    continue;
                }
            };

            tracing::debug!("source_b.state: Connecting");
            if let Err(e) = stream.connect(&token.access_token).await {
                tracing::warn!("source_b.connect.failed: {e}");
                self.sleep_backoff(&mut backoff, &cancel).await;
                continue;
            }

            if let Err(e) = stream.subscribe_devices(&device_ids).await {
                tracing::warn!("source_b.subscribe.failed: {e}");
                stream.disconnect().await;
                self.sleep_backoff(&mut backoff, &cancel).await;
                continue;
            }

            tracing::info!("source_b.state: Subscribed, devices={}", device_ids.len());
            backoff = self.config.backoff_min;

            let refresh_deadline = token
                .expires_in
                .checked_sub(self.config.refresh_margin)
                .unwrap_or(Duration::ZERO);

            match self.receive_loop(stream, sink, &cancel, refresh_deadline).await {
                CycleOutcome::Cancelled => {
                    stream.disconnect().await;
                    return Ok(());
                }
                CycleOutcome::TokenExpiring => {
                    tracing::info!("source_b.token.refreshing");
                    stream.disconnect().await;
                }
                CycleOutcome::Disconnected => {
                    tracing::warn!("source_b.state: Failed (connection dropped)");
                    stream.disconnect().await;
                    self.sleep_backoff(&mut backoff, &cancel).await;
                }
                CycleOutcome::IngestClosed => {
                    stream.disconnect().await;
                    return Err(SourceBError::IngestClosed);
                }
            }
        }
    }

    async fn receive_loop<C, S>(
        &self,
        stream: &mut C,
        sink: &S,
        cancel: &CancellationToken,
        refresh_deadline: Duration,
    ) -> CycleOutcome
    where
        C: CloudStream,
        S: IngestSink,
    {
        let classify_table: HashMap<String, DeviceClass> = self
            .config
            .air_devices
            .iter()
            .map(|d| (d.clone(), DeviceClass::AirSensor))
            .chain(self.config.water_devices.iter().map(|d| (d.clone(), DeviceClass::WaterSensor)))
            .collect();

        let refresh_sleep = tokio::time::sleep(refresh_deadline);
        tokio::pin!(refresh_sleep);

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return CycleOutcome::Cancelled,
                () = &mut refresh_sleep => return CycleOutcome::TokenExpiring,
                event = stream.next_event() => event,
            };

            let raw = match next {
                Ok(Some(raw)) => raw,
                Ok(None) => return CycleOutcome::Disconnected,
                Err(e) => {
                    tracing::warn!("source_b.receive.error: {e}");
                    return CycleOutcome::Disconnected;
                }
            };

            let device_event = match parse_device_event(&raw.body, |id| classify_table.get(id).copied()) {
                Ok(event) => event,
                Err(reason) => {
                    tracing::warn!("source_b.parse.dropped: {reason}");
                    continue;
                }
            };

            match sink.enqueue_device_event(device_event).await {
                Ok(()) => {}
                Err(IngestError::Closed) => return CycleOutcome::IngestClosed,
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
    use super::*;
    use domain::{IngestError, IngestSink, Observation};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn cfg() -> SourceBConfig {
        SourceBConfig::builder("uaid-1", "secret-1")
            .air_device("air-1")
            .water_device("water-1")
            .backoff(Duration::from_millis(1), Duration::from_millis(5))
            .build()
            .unwrap()
    }

    #[test]
    fn config_rejects_empty_secret() {
        let result = SourceBConfig::builder("uaid", "").air_device("air-1").build();
        assert!(matches!(result, Err(SourceBError::InvalidConfig { .. })));
    }

    #[test]
    fn config_rejects_no_devices() {
        let result = SourceBConfig::builder("uaid", "secret").build();
        assert!(matches!(result, Err(SourceBError::InvalidConfig { .. })));
    }

    #[test]
    fn parses_air_sensor_event_with_humidity() {
        let body = r#"{"time":"2025-01-01T00:00:00Z","deviceId":"air-1","payload":{"temperatureF":70.5,"humidityPct":44.0,"batteryPct":91,"signalDbm":-55}}"#;
        let event = parse_device_event(body, |id| (id == "air-1").then_some(DeviceClass::AirSensor)).unwrap();
        assert_eq!(event.device_id, "air-1");
        assert_eq!(event.device_class, DeviceClass::AirSensor);
        assert_eq!(event.temperature, Some(70.5));
        assert_eq!(event.humidity, Some(44.0));
        assert_eq!(event.battery, 91);
        assert_eq!(event.signal, -55);
        assert_eq!(event.raw_payload, body);
    }

    #[test]
    fn water_sensor_humidity_always_none() {
        let body = r#"{"time":"2025-01-01T00:00:00Z","deviceId":"water-1","payload":{"temperatureF":60.0,"humidityPct":50.0,"batteryPct":80,"signalDbm":-60}}"#;
        let event = parse_device_event(body, |id| (id == "water-1").then_some(DeviceClass::WaterSensor)).unwrap();
        assert_eq!(event.device_class, DeviceClass::WaterSensor);
        assert!(event.humidity.is_none(), "water sensor humidity must always be None");
    }

    #[test]
    fn missing_optional_fields_become_none() {
        let body = r#"{"time":"2025-01-01T00:00:00Z","deviceId":"air-1","payload":{"batteryPct":91,"signalDbm":-55}}"#;
        let event = parse_device_event(body, |id| (id == "air-1").then_some(DeviceClass::AirSensor)).unwrap();
        assert!(event.temperature.is_none());
        assert!(event.humidity.is_none());
    }

    #[test]
    fn unregistered_device_id_is_dropped() {
        let body = r#"{"time":"2025-01-01T00:00:00Z","deviceId":"unknown","payload":{"batteryPct":10,"signalDbm":-90}}"#;
        let result = parse_device_event(body, |_| None);
        assert!(result.is_err());
    }

    #[test]
    fn malformed_json_is_dropped() {
        let result = parse_device_event("not json", |_| Some(DeviceClass::AirSensor));
        assert!(result.is_err());
    }

    struct ScriptedAuth;
    impl TokenProvider for ScriptedAuth {
        async fn fetch_token(&self, _uaid: &str, _secret: &str) -> Result<TokenResponse, AuthError> {
            Ok(TokenResponse { access_token: "tok".to_owned(), expires_in: Duration::from_secs(3600) })
        }
    }

    struct FailingAuth {
        fail_times: Mutex<u32>,
    }
    impl TokenProvider for FailingAuth {
        async fn fetch_token(&self, _uaid: &str, _secret: &str) -> Result<TokenResponse, AuthError> {
            let mut remaining = self.fail_times.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AuthError::Exchange("simulated".to_owned()));
            }
            Ok(TokenResponse { access_token: "tok".to_owned(), expires_in: Duration::from_secs(3600) })
        }
    }

    struct ScriptedStream {
        queue: VecDeque<RawCloudEvent>,
        connects: u32,
    }
    impl ScriptedStream {
        fn new(bodies: Vec<&str>) -> Self {
            Self { queue: bodies.into_iter().map(|b| RawCloudEvent { body: b.to_owned() }).collect(), connects: 0 }
        }
    }
    impl CloudStream for ScriptedStream {
        async fn connect(&mut self, _bearer_token: &str) -> Result<(), CloudError> {
            self.connects += 1;
            Ok(())
        }
        async fn subscribe_devices(&mut self, _device_ids: &[String]) -> Result<(), CloudError> {
            Ok(())
        }
        async fn next_event(&mut self) -> Result<Option<RawCloudEvent>, CloudError> {
            Ok(self.queue.pop_front())
        }
        async fn disconnect(&mut self) {}
    }

    struct CollectingSink {
        events: Mutex<Vec<DeviceEvent>>,
    }
    impl CollectingSink {
        fn new() -> Self {
            Self { events: Mutex::new(vec![]) }
        }
    }
    impl IngestSink for CollectingSink {
        async fn enqueue_observation(&self, _observation: Observation) -> Result<(), IngestError> {
            unreachable!("source_b never enqueues observations")
        }
        async fn enqueue_device_event(&self, event: DeviceEvent) -> Result<(), IngestError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn forwards_parsed_events_and_skips_malformed() {
        let good = r#"{"time":"2025-01-01T00:00:00Z","deviceId":"air-1","payload":{"temperatureF":70.0,"humidityPct":40.0,"batteryPct":90,"signalDbm":-50}}"#;
        let mut stream = ScriptedStream::new(vec![good, "not json", good]);
        let sink = CollectingSink::new();
        let source = SourceB::new(cfg());
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let result = source.run(&ScriptedAuth, &mut stream, &sink, cancel).await;
        assert!(result.is_ok());
        assert_eq!(sink.events.lock().unwrap().len(), 2, "malformed event must be dropped, not forwarded");
    }

    #[tokio::test]
    async fn retries_auth_failures() {
        let mut stream = ScriptedStream::new(vec![]);
        let sink = CollectingSink::new();
        let source = SourceB::new(cfg());
        let auth = FailingAuth { fail_times: Mutex::new(2) };
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let result = source.run(&auth, &mut stream, &sink, cancel).await;
        assert!(result.is_ok());
        assert!(stream.connects >= 1);
    }
}
