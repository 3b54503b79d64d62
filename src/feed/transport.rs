use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::credentials::FeedCredentials;
use crate::domain::FeedMessage;
use crate::error::Result;

/// Protocol-level connection state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    /// Handshake / authentication in progress
    Connecting,
    Ready,
    /// Link lost, transport is trying to recover
    Degraded,
    /// Terminal: closed or authentication refused
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        }
    }

    /// States a pending `connect` waits for
    pub fn is_auth_terminal(&self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Notifications a transport pushes to its owning session
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Message(FeedMessage),
    /// Opaque resumption blob to persist for the next connect
    SessionUpdated(Vec<u8>),
    /// Asynchronous protocol failure, counted by the session's circuit breaker
    Fault(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// One tenant's link to the external feed
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Begin authenticating. Completion is reported through
    /// `StateChanged(Ready)` or `StateChanged(Closed)`.
    async fn connect(&self, credentials: &FeedCredentials, resume: Option<Vec<u8>>) -> Result<()>;

    async fn join_channel(&self, channel_id: &str) -> Result<()>;

    async fn leave_channel(&self, channel_id: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds transports; one per session
pub trait FeedConnector: Send + Sync {
    fn open(&self, tenant_id: &str, events: EventSender) -> Arc<dyn FeedTransport>;
}
