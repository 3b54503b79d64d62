//! WebSocket feed gateway transport
//!
//! Speaks a small JSON protocol. Client frames are tagged by `op`
//! (`auth`, `join`, `leave`); server frames by `type` (`auth_ok`,
//! `auth_failed`, `message`, `session`, `error`). A dropped link is
//! reported as `Degraded` and re-established with backoff, re-joining
//! every tracked channel.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures_util::{SinkExt, Stream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use super::transport::{ConnectionState, EventSender, FeedConnector, FeedTransport, TransportEvent};
use crate::credentials::FeedCredentials;
use crate::domain::FeedMessage;
use crate::error::{RelayError, Result};

/// WebSocket link settings
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(15),
            ping_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(60),
        }
    }

    /// Backoff before reconnect attempt `attempt` (1-based), plus up to 25% jitter
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(10);
        let delay = self
            .reconnect_base_delay
            .saturating_mul(1 << exp)
            .min(self.reconnect_max_delay);
        let jitter_range = delay.as_millis() as u64 / 4;
        let jitter = if jitter_range > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_range))
        } else {
            Duration::ZERO
        };
        delay + jitter
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Auth {
        account: &'a str,
        token: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Join {
        channel: &'a str,
    },
    Leave {
        channel: &'a str,
    },
}

impl ClientFrame<'_> {
    fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    AuthOk {
        #[serde(default)]
        session: Option<String>,
    },
    AuthFailed {
        #[serde(default)]
        reason: String,
    },
    Message {
        channel_id: String,
        #[serde(default)]
        channel_name: Option<String>,
        message_id: String,
        text: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Session {
        data: String,
    },
    Error {
        reason: String,
    },
}

/// How one link lifetime ended
#[derive(Debug)]
enum LinkEnd {
    Dropped,
    AuthRejected(String),
    Closed,
}

enum AuthReply {
    Accepted(Option<String>),
    Rejected(String),
}

/// Opens one [`WebSocketTransport`] per session
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

impl FeedConnector for WebSocketConnector {
    fn open(&self, tenant_id: &str, events: EventSender) -> Arc<dyn FeedTransport> {
        Arc::new(WebSocketTransport {
            link: Arc::new(Link {
                tenant_id: tenant_id.to_string(),
                config: self.config.clone(),
                events,
                joined: DashSet::new(),
                outgoing: Mutex::new(None),
                latest_session: Mutex::new(None),
                closing: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        })
    }
}

/// State shared between the transport handle and its link task
#[derive(Debug)]
struct Link {
    tenant_id: String,
    config: WebSocketConfig,
    events: EventSender,
    joined: DashSet<String>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    latest_session: Mutex<Option<Vec<u8>>>,
    closing: AtomicBool,
}

impl Link {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, message: Message) -> Result<()> {
        let outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        match outgoing.as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| RelayError::Feed("feed link writer stopped".into())),
            None => Err(RelayError::Feed(format!(
                "feed link for tenant {} is down",
                self.tenant_id
            ))),
        }
    }

    fn set_outgoing(&self, tx: Option<mpsc::UnboundedSender<Message>>) {
        *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }

    fn remember_session(&self, encoded: &str) {
        match BASE64.decode(encoded) {
            Ok(blob) => {
                *self.latest_session.lock().unwrap_or_else(|e| e.into_inner()) = Some(blob.clone());
                self.emit(TransportEvent::SessionUpdated(blob));
            }
            Err(e) => warn!(tenant = %self.tenant_id, error = %e, "session frame is not base64"),
        }
    }

    fn handle_frame(&self, text: &str) {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(tenant = %self.tenant_id, error = %e, "ignoring unrecognised feed frame");
                return;
            }
        };

        match frame {
            ServerFrame::Message {
                channel_id,
                channel_name,
                message_id,
                text,
                timestamp,
            } => self.emit(TransportEvent::Message(FeedMessage {
                tenant_id: self.tenant_id.clone(),
                channel_id,
                channel_name,
                message_id,
                text,
                timestamp: timestamp.unwrap_or_else(Utc::now),
            })),
            ServerFrame::Session { data } => self.remember_session(&data),
            ServerFrame::Error { reason } => self.emit(TransportEvent::Fault(reason)),
            ServerFrame::AuthOk { .. } | ServerFrame::AuthFailed { .. } => {
                debug!(tenant = %self.tenant_id, "unexpected auth frame on established link");
            }
        }
    }
}

/// Reconnecting link; see the module docs for the protocol
#[derive(Debug)]
pub struct WebSocketTransport {
    link: Arc<Link>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl FeedTransport for WebSocketTransport {
    async fn connect(&self, credentials: &FeedCredentials, resume: Option<Vec<u8>>) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Ok(());
        }
        if self.link.closing.load(Ordering::SeqCst) {
            return Err(RelayError::Feed("transport is closed".into()));
        }
        parse_feed_url(&self.link.config.url)?;

        self.link.emit(TransportEvent::StateChanged(ConnectionState::Connecting));
        *task = Some(tokio::spawn(supervise(
            Arc::clone(&self.link),
            credentials.clone(),
            resume,
        )));
        Ok(())
    }

    async fn join_channel(&self, channel_id: &str) -> Result<()> {
        self.link.send(ClientFrame::Join { channel: channel_id }.to_message()?)?;
        self.link.joined.insert(channel_id.to_string());
        Ok(())
    }

    async fn leave_channel(&self, channel_id: &str) -> Result<()> {
        self.link.joined.remove(channel_id);
        self.link.send(ClientFrame::Leave { channel: channel_id }.to_message()?)
    }

    async fn close(&self) -> Result<()> {
        self.link.closing.store(true, Ordering::SeqCst);
        let _ = self.link.send(Message::Close(None));

        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut handle) = handle {
            if timeout(Duration::from_secs(2), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.link.set_outgoing(None);
        self.link.emit(TransportEvent::StateChanged(ConnectionState::Closed));
        Ok(())
    }
}

fn parse_feed_url(raw: &str) -> Result<url::Url> {
    url::Url::parse(raw)
        .map_err(|e| RelayError::Validation(format!("invalid feed url {}: {}", raw, e)))
}

/// Keep the link up until authentication is refused or the transport closes.
async fn supervise(link: Arc<Link>, credentials: FeedCredentials, resume: Option<Vec<u8>>) {
    if resume.is_some() {
        *link.latest_session.lock().unwrap_or_else(|e| e.into_inner()) = resume;
    }
    let mut attempt: u32 = 0;

    loop {
        let session = link
            .latest_session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let outcome = run_link(&link, &credentials, session).await;
        link.set_outgoing(None);

        match outcome {
            Ok(LinkEnd::Closed) => return,
            Ok(LinkEnd::AuthRejected(reason)) => {
                warn!(tenant = %link.tenant_id, reason = %reason, "feed refused authentication");
                link.emit(TransportEvent::StateChanged(ConnectionState::Closed));
                return;
            }
            Ok(LinkEnd::Dropped) => {
                attempt = 1;
                info!(tenant = %link.tenant_id, "feed link dropped, reconnecting");
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                link.emit(TransportEvent::Fault(e.to_string()));
            }
        }

        if link.closing.load(Ordering::SeqCst) {
            return;
        }
        link.emit(TransportEvent::StateChanged(ConnectionState::Degraded));

        let delay = link.config.reconnect_delay(attempt);
        warn!(
            tenant = %link.tenant_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "feed reconnect scheduled"
        );
        tokio::time::sleep(delay).await;
    }
}

/// One link lifetime: dial, authenticate, re-join, then pump frames.
async fn run_link(
    link: &Link,
    credentials: &FeedCredentials,
    session: Option<Vec<u8>>,
) -> Result<LinkEnd> {
    let url = parse_feed_url(&link.config.url)?;
    debug!(tenant = %link.tenant_id, url = %url, "dialling feed gateway");

    let (ws, _) = timeout(link.config.connect_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| RelayError::Timeout(format!("feed dial to {}", url)))??;
    let (mut write, mut read) = ws.split();

    let auth = ClientFrame::Auth {
        account: &credentials.account,
        token: &credentials.token,
        session: session.map(|blob| BASE64.encode(blob)),
    };
    write.send(auth.to_message()?).await?;

    let reply = timeout(link.config.auth_timeout, await_auth(&link.tenant_id, &mut read)).await;
    let session = match reply {
        Ok(Ok(AuthReply::Accepted(session))) => session,
        Ok(Ok(AuthReply::Rejected(reason))) => return Ok(LinkEnd::AuthRejected(reason)),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(RelayError::Timeout("feed authentication reply".into())),
    };
    if let Some(encoded) = session {
        link.remember_session(&encoded);
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    link.set_outgoing(Some(out_tx));

    let channels: Vec<String> = link.joined.iter().map(|c| c.clone()).collect();
    for channel in &channels {
        write.send(ClientFrame::Join { channel }.to_message()?).await?;
    }
    if !channels.is_empty() {
        info!(tenant = %link.tenant_id, channels = channels.len(), "re-joined feed channels");
    }
    link.emit(TransportEvent::StateChanged(ConnectionState::Ready));

    let mut ping = interval(link.config.ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => link.handle_frame(&text),
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(if link.closing.load(Ordering::SeqCst) {
                            LinkEnd::Closed
                        } else {
                            LinkEnd::Dropped
                        });
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                }
            }
            out = out_rx.recv() => {
                match out {
                    Some(Message::Close(frame)) => {
                        let _ = write.send(Message::Close(frame)).await;
                        return Ok(LinkEnd::Closed);
                    }
                    Some(message) => write.send(message).await?,
                    None => return Ok(LinkEnd::Closed),
                }
            }
            _ = ping.tick() => {
                write.send(Message::Ping(vec![])).await?;
            }
        }
    }
}

async fn await_auth<S>(tenant_id: &str, read: &mut S) -> Result<AuthReply>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::AuthOk { session }) => return Ok(AuthReply::Accepted(session)),
                Ok(ServerFrame::AuthFailed { reason }) => return Ok(AuthReply::Rejected(reason)),
                _ => debug!(tenant = %tenant_id, "frame before auth reply ignored"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(RelayError::Feed("feed closed during authentication".into()))
}
