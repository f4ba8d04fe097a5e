//! Odds feed transport.
//!
//! A transport opens one subscribed connection; the connection yields decoded
//! feed events until it fails. Reconnecting is the session manager's job, so
//! nothing here retries.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::messages::{parse_frame, FeedEvent, SubscriptionRequest};
use crate::error::TransportError;

#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Open a connection and send the subscription request.
    async fn connect(&self, request: &SubscriptionRequest) -> Result<Box<dyn FeedConnection>, TransportError>;
}

#[async_trait]
pub trait FeedConnection: Send {
    /// Next application event. Malformed frames are skipped; any error ends
    /// the connection.
    async fn next_event(&mut self) -> Result<FeedEvent, TransportError>;
}

#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    /// No frame at all for this long is a transport error
    pub heartbeat_grace: Duration,
    pub ping_interval: Duration,
}

pub struct WsTransport {
    config: WsTransportConfig,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        WsTransport { config }
    }

    fn endpoint(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.config.url)?;
        if let Some(key) = self.config.api_key.as_deref() {
            url.query_pairs_mut().append_pair("apiKey", key);
        }
        Ok(url)
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self, request: &SubscriptionRequest) -> Result<Box<dyn FeedConnection>, TransportError> {
        let url = self.endpoint()?;
        info!("[{}] Connecting to odds feed {}", request.sport, self.config.url);

        let (ws_stream, _response) =
            tokio::time::timeout(self.config.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| TransportError::ConnectTimeout(self.config.connect_timeout))??;

        let (mut write, read) = ws_stream.split();
        write.send(Message::Text(request.to_json())).await?;
        info!(
            "[{}] Subscribed to {} (resume token {:?})",
            request.sport,
            request.providers.join(","),
            request.resume_token
        );

        let mut ping = tokio::time::interval(self.config.ping_interval);
        // The first tick of an interval fires immediately.
        ping.reset();

        Ok(Box::new(WsConnection {
            label: request.sport.clone(),
            write,
            read,
            ping,
            grace: self.config.heartbeat_grace,
            deadline: Instant::now() + self.config.heartbeat_grace,
        }))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsConnection {
    label: String,
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    ping: Interval,
    grace: Duration,
    deadline: Instant,
}

#[async_trait]
impl FeedConnection for WsConnection {
    async fn next_event(&mut self) -> Result<FeedEvent, TransportError> {
        loop {
            tokio::select! {
                msg = self.read.next() => {
                    // Any frame proves the connection is alive.
                    self.deadline = Instant::now() + self.grace;
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if text.trim() == "ping" {
                                self.write.send(Message::Text("pong".to_string())).await?;
                                continue;
                            }
                            match parse_frame(&text) {
                                Ok(event) => return Ok(event),
                                Err(e) => {
                                    warn!("[{}] Dropping malformed frame: {}", self.label, e);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!("[{}] Server closed feed: {:?}", self.label, frame);
                            return Err(TransportError::Closed);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(TransportError::Closed),
                        _ => {}
                    }
                }
                _ = self.ping.tick() => {
                    self.write.send(Message::Ping(vec![])).await?;
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    return Err(TransportError::HeartbeatMissed(self.grace));
                }
            }
        }
    }
}
