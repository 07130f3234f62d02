//! Source-B cloud adapters (spec §4.2, §6): `reqwest`-backed `TokenProvider`
//! and `tokio-tungstenite`-backed `CloudStream`.

use futures_util::{SinkExt as _, StreamExt as _};
use serde::{Deserialize, Serialize};
use source_b::{AuthError, CloudError, CloudStream, RawCloudEvent, TokenProvider, TokenResponse};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// `TokenProvider` adapter: exchanges `{uaid, secret}` for a bearer token
/// via HTTPS POST (spec §6).
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    token_url: String,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    uaid: &'a str,
    secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponseBody {
    access_token: String,
    expires_in: u64,
}

impl HttpTokenProvider {
    /// # Panics
    ///
    /// Panics if the underlying `reqwest::Client` cannot be built (invalid
    /// TLS configuration); this mirrors the teacher's own
    /// `unwrap_or_else(|_| Client::new())` fallback being unnecessary here
    /// since no custom TLS options are set.
    #[must_use]
    pub fn new(token_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("default reqwest client configuration is always valid");
        Self { client, token_url: token_url.into() }
    }
}

impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self, uaid: &str, secret: &str) -> Result<TokenResponse, AuthError> {
        let response = self
            .client
            .post(&self.token_url)
            .json(&TokenRequest { uaid, secret })
            .send()
            .await
            .map_err(|err| AuthError::Exchange(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Exchange(format!("{status}: {body}")));
        }

        let body: TokenResponseBody = response.json().await.map_err(|err| AuthError::Exchange(err.to_string()))?;
        Ok(TokenResponse { access_token: body.access_token, expires_in: Duration::from_secs(body.expires_in) })
    }
}

/// `CloudStream` adapter: a `tokio-tungstenite` WebSocket connection to the
/// cloud pub/sub endpoint, authenticated with the bearer token obtained
/// from [`HttpTokenProvider`] (spec §4.2, §6).
#[derive(Debug)]
pub struct WebSocketCloudStream {
    endpoint: String,
    socket: Option<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>,
}

impl WebSocketCloudStream {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), socket: None }
    }
}

impl CloudStream for WebSocketCloudStream {
    async fn connect(&mut self, bearer_token: &str) -> Result<(), CloudError> {
        let url = format!("{}?access_token={bearer_token}", self.endpoint);
        let (socket, _response) =
            tokio_tungstenite::connect_async(url).await.map_err(|err| CloudError::Connection(err.to_string()))?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn subscribe_devices(&mut self, device_ids: &[String]) -> Result<(), CloudError> {
        let socket = self.socket.as_mut().ok_or_else(|| CloudError::Connection("not connected".to_owned()))?;
        let frame = serde_json::json!({ "type": "subscribe", "deviceIds": device_ids });
        socket
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|err| CloudError::Subscribe(err.to_string()))
    }

    async fn next_event(&mut self) -> Result<Option<RawCloudEvent>, CloudError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(CloudError::Connection("not connected".to_owned()));
        };
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(RawCloudEvent { body: text })),
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    return Ok(Some(RawCloudEvent { body: text }));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(err)) => return Err(CloudError::Connection(err.to_string())),
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
    }
}
