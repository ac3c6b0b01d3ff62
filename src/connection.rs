//! WebSocket connection engine for the Polaris device subscription.
//!
//! Implements the `graphql-transport-ws` protocol over WSS with an
//! exponential-backoff reconnect state machine:
//!
//! ```text
//! INIT → CONNECTING → (success) → CONNECTED → (disconnect) → WAIT_BACKOFF → CONNECTING
//!                   → (failure) →              WAIT_BACKOFF → CONNECTING
//! any state → (shutdown request) → SHUTTING_DOWN
//! ```
//!
//! A fatal auth rejection (handshake `error`, or a subscription `error`
//! whose `extensions.code` is FORBIDDEN/UNAUTHORIZED) terminates the
//! stream without reconnecting.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures_util::{SinkExt, Stream, StreamExt};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{PolarisConfig, ReconnectConfig};

/// GraphQL document sent with every `subscribe` message.
pub const DEVICES_SUBSCRIPTION: &str = r"subscription DevicesSubscription {
  devices {
    id
    label
    tags {
      key
      value
    }
    lastPosition {
      position {
        llaDec {
          lat
          lon
          alt
        }
      }
      timestamp
    }
    services {
      rtk {
        enabled
        connectionStatus
      }
    }
  }
}";

const SUBPROTOCOL: &str = "graphql-transport-ws";
const CONNECTION_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_BACKOFF_MS: f64 = 100.0;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// States in the reconnect state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    WaitBackoff,
    ShuttingDown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Init => "INIT",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::WaitBackoff => "WAIT_BACKOFF",
            ConnectionState::ShuttingDown => "SHUTTING_DOWN",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage<'a> {
    ConnectionInit { payload: AuthPayload },
    Subscribe { id: &'a str, payload: SubscribePayload<'a> },
    Pong,
}

#[derive(Serialize)]
struct AuthPayload {
    #[serde(rename = "Authorization")]
    authorization: String,
}

#[derive(Serialize)]
struct SubscribePayload<'a> {
    query: &'a str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timed out waiting for connection_ack")]
    AckTimeout,
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("authentication rejected: {0}")]
    FatalAuth(String),
}

impl ConnectionError {
    fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::FatalAuth(_))
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One raw server frame, tagged with the subscription that produced it.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub payload: String,
    pub subscription_id: String,
}

/// Clonable handle that requests a cooperative shutdown of the stream.
///
/// Idempotent; the stream terminates at its next suspension point and no
/// further reconnects are attempted.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn request_shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Manages the WSS lifecycle and the `graphql-transport-ws` protocol.
pub struct PolarisConnection {
    config: PolarisConfig,
    state: ConnectionState,
    attempt: u32,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PolarisConnection {
    pub fn new(config: PolarisConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        PolarisConnection {
            config,
            state: ConnectionState::Init,
            attempt: 0,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Lazy sequence of raw server frames.
    ///
    /// Connects, authenticates, subscribes, and reconnects with backoff
    /// until a shutdown is requested or a fatal auth failure occurs.
    pub fn subscribe(mut self) -> impl Stream<Item = RawFrame> {
        stream! {
            let mut shutdown_rx = self.shutdown_rx.clone();
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                self.set_state(ConnectionState::Connecting);
                let subscription_id = Uuid::new_v4().to_string();

                let handshake = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    result = self.open_and_handshake(&subscription_id) => result,
                };

                match handshake {
                    Ok(ws) => {
                        self.set_state(ConnectionState::Connected);
                        self.attempt = 0;
                        info!(subscription_id = %subscription_id, "subscription established");

                        let (mut ws_tx, mut ws_rx) = ws.split();
                        let mut keepalive = tokio::time::interval_at(
                            TokioInstant::now() + KEEPALIVE_INTERVAL,
                            KEEPALIVE_INTERVAL,
                        );
                        let mut last_inbound = Instant::now();

                        let end = loop {
                            tokio::select! {
                                biased;
                                _ = shutdown_rx.changed() => {
                                    if *shutdown_rx.borrow() {
                                        break LoopEnd::Shutdown;
                                    }
                                }
                                _ = keepalive.tick() => {
                                    // The server must answer pings within the
                                    // keepalive window; a silent peer is dead.
                                    if last_inbound.elapsed() >= KEEPALIVE_INTERVAL + KEEPALIVE_TIMEOUT {
                                        warn!("no traffic within keepalive window");
                                        break LoopEnd::Transient;
                                    }
                                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                                        break LoopEnd::Transient;
                                    }
                                }
                                frame = ws_rx.next() => {
                                    last_inbound = Instant::now();
                                    match frame {
                                        None => {
                                            warn!("websocket closed by server");
                                            break LoopEnd::Transient;
                                        }
                                        Some(Err(e)) => {
                                            warn!(error = %e, "websocket error");
                                            break LoopEnd::Transient;
                                        }
                                        Some(Ok(Message::Text(text))) => {
                                            let text = text.as_str().to_owned();
                                            match inspect_frame(&text) {
                                                FrameAction::Yield => {
                                                    yield RawFrame {
                                                        payload: text,
                                                        subscription_id: subscription_id.clone(),
                                                    };
                                                }
                                                FrameAction::ReplyPong => {
                                                    if let Ok(pong) = serde_json::to_string(&ClientMessage::Pong) {
                                                        if ws_tx.send(Message::Text(pong.into())).await.is_err() {
                                                            break LoopEnd::Transient;
                                                        }
                                                    }
                                                }
                                                FrameAction::Complete => {
                                                    info!("subscription completed by server, reconnecting");
                                                    break LoopEnd::Transient;
                                                }
                                                FrameAction::FatalAuth(message) => {
                                                    error!(message = %message, "authentication rejected mid-subscription");
                                                    break LoopEnd::Fatal;
                                                }
                                                FrameAction::Skip => {}
                                            }
                                        }
                                        Some(Ok(Message::Binary(data))) => {
                                            // Not expected on this protocol; let the
                                            // classifier deal with it.
                                            yield RawFrame {
                                                payload: String::from_utf8_lossy(&data).into_owned(),
                                                subscription_id: subscription_id.clone(),
                                            };
                                        }
                                        Some(Ok(Message::Ping(data))) => {
                                            let _ = ws_tx.send(Message::Pong(data)).await;
                                        }
                                        Some(Ok(_)) => {}
                                    }
                                }
                            }
                        };

                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws_tx.close()).await;

                        match end {
                            LoopEnd::Shutdown | LoopEnd::Fatal => break,
                            LoopEnd::Transient => {}
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "fatal auth error, not reconnecting");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "connection attempt failed");
                    }
                }

                if *shutdown_rx.borrow() {
                    break;
                }
                self.backoff(&mut shutdown_rx).await;
            }
            self.set_state(ConnectionState::ShuttingDown);
            info!("subscription stream finished");
        }
    }

    // -----------------------------------------------------------------------
    // Internal: connect + handshake
    // -----------------------------------------------------------------------

    /// Open the WebSocket, authenticate, and start the subscription.
    async fn open_and_handshake(&self, subscription_id: &str) -> Result<WsStream, ConnectionError> {
        let request = build_ws_request(&self.config.api_url)?;
        let (mut ws, _response) = connect_async(request).await?;

        let init = ClientMessage::ConnectionInit {
            payload: AuthPayload {
                authorization: format!("Bearer {}", self.config.api_key),
            },
        };
        ws.send(Message::Text(serde_json::to_string(&init)?.into()))
            .await?;

        let ack_type = tokio::time::timeout(CONNECTION_ACK_TIMEOUT, async {
            loop {
                match ws.next().await {
                    None => {
                        return Err(ConnectionError::Handshake(
                            "connection closed before connection_ack".to_owned(),
                        ));
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Text(text))) => {
                        return Ok(serde_json::from_str::<Value>(&text)
                            .ok()
                            .and_then(|v| {
                                v.get("type").and_then(Value::as_str).map(ToOwned::to_owned)
                            }));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        })
        .await
        .map_err(|_| ConnectionError::AckTimeout)??;
        match ack_type.as_deref() {
            Some("connection_ack") => {}
            Some("error") => {
                return Err(ConnectionError::FatalAuth(
                    "auth rejected by server".to_owned(),
                ));
            }
            other => {
                return Err(ConnectionError::Handshake(format!(
                    "expected connection_ack, got {other:?}"
                )));
            }
        }

        let subscribe = ClientMessage::Subscribe {
            id: subscription_id,
            payload: SubscribePayload {
                query: DEVICES_SUBSCRIPTION,
            },
        };
        ws.send(Message::Text(serde_json::to_string(&subscribe)?.into()))
            .await?;
        Ok(ws)
    }

    // -----------------------------------------------------------------------
    // Internal: backoff
    // -----------------------------------------------------------------------

    /// Wait with exponential backoff + jitter, racing the shutdown signal.
    async fn backoff(&mut self, shutdown_rx: &mut watch::Receiver<bool>) {
        self.set_state(ConnectionState::WaitBackoff);
        self.attempt += 1;
        let delay = backoff_delay(&self.config.reconnect, self.attempt);
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.attempt,
            "reconnecting after backoff"
        );
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }

    fn set_state(&mut self, new: ConnectionState) {
        if self.state != new {
            info!(from = %self.state, to = %new, "connection state");
            self.state = new;
        }
    }
}

enum LoopEnd {
    Shutdown,
    Transient,
    Fatal,
}

// ---------------------------------------------------------------------------
// Frame inspection
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum FrameAction {
    /// Hand the raw frame to the pipeline.
    Yield,
    /// Server-initiated protocol ping; answer with a pong frame.
    ReplyPong,
    /// Server finished the subscription; reconnect.
    Complete,
    /// Credentials rejected; terminate without reconnecting.
    FatalAuth(String),
    /// Protocol message with nothing for the pipeline.
    Skip,
}

/// Decide what to do with one inbound text frame.
///
/// Unparseable frames are yielded so the classifier can surface them as
/// malformed records rather than losing them here.
fn inspect_frame(text: &str) -> FrameAction {
    let Ok(msg) = serde_json::from_str::<Value>(text) else {
        return FrameAction::Yield;
    };
    match msg.get("type").and_then(Value::as_str) {
        Some("next") => FrameAction::Yield,
        Some("error") => {
            error!(payload = %msg.get("payload").unwrap_or(&serde_json::Value::Null), "subscription error frame");
            if let Some(errors) = msg.get("payload").and_then(Value::as_array) {
                for err in errors {
                    let code = err
                        .get("extensions")
                        .and_then(|e| e.get("code"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if code == "FORBIDDEN" || code == "UNAUTHORIZED" {
                        let message = err
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_owned();
                        return FrameAction::FatalAuth(message);
                    }
                }
            }
            FrameAction::Yield
        }
        Some("complete") => FrameAction::Complete,
        Some("ping") => FrameAction::ReplyPong,
        _ => FrameAction::Skip,
    }
}

// ---------------------------------------------------------------------------
// Backoff delay
// ---------------------------------------------------------------------------

/// `min(initial · multiplier^(attempt−1), max)` ± `jitter_pct`%, with a
/// 100 ms floor.
fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exp = config
        .backoff_multiplier
        .powi(attempt.saturating_sub(1) as i32);
    let base = (config.initial_delay_ms as f64 * exp).min(config.max_delay_ms as f64);
    let jitter = base * (config.jitter_pct / 100.0) * rand::thread_rng().gen_range(-1.0..=1.0);
    Duration::from_millis((base + jitter).max(MIN_BACKOFF_MS) as u64)
}

// ---------------------------------------------------------------------------
// Request building
// ---------------------------------------------------------------------------

fn build_ws_request(
    url: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ConnectionError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectionError::Handshake(format!("invalid URL '{url}': {e}")))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        SUBPROTOCOL.parse().map_err(
            |e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
                ConnectionError::Handshake(format!("invalid subprotocol header: {e}"))
            },
        )?,
    );
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn next_frames_are_yielded() {
        let raw = json!({"id": "1", "type": "next", "payload": {}}).to_string();
        assert_eq!(inspect_frame(&raw), FrameAction::Yield);
    }

    #[test]
    fn unparseable_frames_are_yielded_for_classification() {
        assert_eq!(inspect_frame("{garbage"), FrameAction::Yield);
    }

    #[test]
    fn ping_requests_a_pong_reply() {
        assert_eq!(inspect_frame(r#"{"type":"ping"}"#), FrameAction::ReplyPong);
    }

    #[test]
    fn complete_ends_the_receive_loop() {
        assert_eq!(inspect_frame(r#"{"type":"complete"}"#), FrameAction::Complete);
    }

    #[test]
    fn ack_and_unknown_types_are_skipped() {
        assert_eq!(inspect_frame(r#"{"type":"connection_ack"}"#), FrameAction::Skip);
        assert_eq!(inspect_frame(r#"{"type":"wat"}"#), FrameAction::Skip);
    }

    #[test]
    fn forbidden_error_is_fatal() {
        let raw = json!({
            "type": "error",
            "payload": [{"message": "nope", "extensions": {"code": "FORBIDDEN"}}],
        })
        .to_string();
        assert_eq!(inspect_frame(&raw), FrameAction::FatalAuth("nope".to_owned()));
    }

    #[test]
    fn unauthorized_error_is_fatal() {
        let raw = json!({
            "type": "error",
            "payload": [
                {"message": "other", "extensions": {"code": "RATE_LIMITED"}},
                {"message": "expired", "extensions": {"code": "UNAUTHORIZED"}},
            ],
        })
        .to_string();
        assert_eq!(
            inspect_frame(&raw),
            FrameAction::FatalAuth("expired".to_owned())
        );
    }

    #[test]
    fn non_auth_error_is_yielded_downstream() {
        let raw = json!({
            "type": "error",
            "payload": [{"message": "hiccup", "extensions": {"code": "INTERNAL"}}],
        })
        .to_string();
        assert_eq!(inspect_frame(&raw), FrameAction::Yield);
    }

    #[test]
    fn error_without_extensions_is_yielded() {
        let raw = json!({"type": "error", "payload": [{"message": "hm"}]}).to_string();
        assert_eq!(inspect_frame(&raw), FrameAction::Yield);
    }

    fn reconnect(initial: u64, max: u64, multiplier: f64, jitter: f64) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: initial,
            max_delay_ms: max,
            backoff_multiplier: multiplier,
            jitter_pct: jitter,
        }
    }

    #[test]
    fn backoff_grows_and_caps_at_max() {
        let cfg = reconnect(1000, 60_000, 2.0, 0.0);
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(&cfg, 20), Duration::from_millis(60_000));
    }

    #[test]
    fn backoff_with_multiplier_one_is_constant() {
        let cfg = reconnect(500, 60_000, 1.0, 0.0);
        for attempt in 1..10 {
            assert_eq!(backoff_delay(&cfg, attempt), Duration::from_millis(500));
        }
    }

    #[test]
    fn backoff_jitter_stays_within_bounds() {
        let cfg = reconnect(1000, 8000, 2.0, 20.0);
        for attempt in 1..=16 {
            for _ in 0..100 {
                let delay = backoff_delay(&cfg, attempt);
                assert!(delay >= Duration::from_millis(100), "below floor: {delay:?}");
                assert!(
                    delay <= Duration::from_millis(9600),
                    "above max + jitter: {delay:?}"
                );
            }
        }
    }

    #[test]
    fn backoff_never_drops_below_floor() {
        let cfg = reconnect(10, 60_000, 1.0, 50.0);
        for _ in 0..100 {
            assert!(backoff_delay(&cfg, 1) >= Duration::from_millis(100));
        }
    }
}
