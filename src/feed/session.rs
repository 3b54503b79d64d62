//! Resilient Feed Session
//!
//! One per tenant. Wraps a transport with connection-state tracking, an
//! observed-channel filter, session-blob persistence and a circuit breaker.

use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{ConnectionState, FeedConnector, FeedTransport, TransportEvent};
use crate::bus::Queue;
use crate::coordination::{CircuitBreaker, CircuitBreakerConfig, CircuitState, SharedClock};
use crate::credentials::FeedCredentials;
use crate::domain::FeedMessage;
use crate::error::{RelayError, Result};
use crate::store::SessionStore;

/// File name of the persisted resumption blob
pub const SESSION_FILE: &str = "feed.session";

/// Shared collaborators and settings for every session
#[derive(Clone)]
pub struct SessionContext {
    pub inbound: Queue<FeedMessage>,
    pub session_store: Arc<dyn SessionStore>,
    pub clock: SharedClock,
    pub breaker: CircuitBreakerConfig,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
}

pub struct ResilientFeedSession {
    tenant_id: String,
    transport: Arc<dyn FeedTransport>,
    credentials: FeedCredentials,
    breaker: Arc<CircuitBreaker>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    observed: Arc<DashSet<String>>,
    channel_lock: Mutex<()>,
    connect_gate: Mutex<()>,
    session_store: Arc<dyn SessionStore>,
    clock: SharedClock,
    connect_timeout: Duration,
    close_timeout: Duration,
    last_access: StdMutex<Instant>,
    disposed: AtomicBool,
    event_task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResilientFeedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientFeedSession")
            .field("tenant_id", &self.tenant_id)
            .field("state", &self.state())
            .field("breaker", &self.breaker.state())
            .field("channels", &self.observed.len())
            .finish()
    }
}

impl ResilientFeedSession {
    /// Open a transport and start the event loop. Does not connect.
    pub fn start(
        tenant_id: &str,
        credentials: FeedCredentials,
        connector: &dyn FeedConnector,
        ctx: &SessionContext,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = connector.open(tenant_id, events_tx);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let session = Arc::new(Self {
            tenant_id: tenant_id.to_string(),
            transport,
            credentials,
            breaker: Arc::new(CircuitBreaker::new(
                format!("feed:{}", tenant_id),
                ctx.breaker.clone(),
                ctx.clock.clone(),
            )),
            state_tx: Arc::new(state_tx),
            observed: Arc::new(DashSet::new()),
            channel_lock: Mutex::new(()),
            connect_gate: Mutex::new(()),
            session_store: ctx.session_store.clone(),
            clock: ctx.clock.clone(),
            connect_timeout: ctx.connect_timeout,
            close_timeout: ctx.close_timeout,
            last_access: StdMutex::new(ctx.clock.now()),
            disposed: AtomicBool::new(false),
            event_task: StdMutex::new(None),
        });

        let handle = tokio::spawn(run_event_loop(
            session.tenant_id.clone(),
            events_rx,
            session.state_tx.clone(),
            session.observed.clone(),
            session.breaker.clone(),
            session.session_store.clone(),
            ctx.inbound.clone(),
        ));
        *session
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        session
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Ready at the protocol level and not cut off by an open circuit
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready && self.breaker.state() != CircuitState::Open
    }

    /// Unhealthy, but the transport or breaker is expected to bring it back
    pub fn is_recovering(&self) -> bool {
        !self.is_disposed()
            && !self.is_connected()
            && matches!(
                self.state(),
                ConnectionState::Ready | ConnectionState::Degraded | ConnectionState::Connecting
            )
    }

    pub fn credentials(&self) -> &FeedCredentials {
        &self.credentials
    }

    pub fn touch(&self) {
        *self.last_access.lock().unwrap_or_else(|e| e.into_inner()) = self.clock.now();
    }

    pub fn idle_for(&self) -> Duration {
        let last = *self.last_access.lock().unwrap_or_else(|e| e.into_inner());
        self.clock.now().saturating_duration_since(last)
    }

    /// Connect and wait for a terminal authentication state.
    ///
    /// Safe to call repeatedly: an already-ready session returns at once, and
    /// a session whose transport is already connecting is only waited on.
    pub async fn connect(&self) -> Result<()> {
        let _gate = self.connect_gate.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RelayError::SessionUnavailable(format!(
                "session for tenant {} is disposed",
                self.tenant_id
            )));
        }

        let current = self.state();
        match current {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Closed => {
                return Err(RelayError::SessionUnavailable(format!(
                    "session for tenant {} is closed",
                    self.tenant_id
                )))
            }
            ConnectionState::Connecting => {
                debug!(tenant = %self.tenant_id, "connect already in progress, waiting");
            }
            ConnectionState::Disconnected | ConnectionState::Degraded => {
                let resume = match self.session_store.get(&self.tenant_id, SESSION_FILE).await {
                    Ok(blob) => blob,
                    Err(e) => {
                        warn!(
                            tenant = %self.tenant_id,
                            error = %e,
                            "could not load session blob, starting fresh"
                        );
                        None
                    }
                };
                info!(
                    tenant = %self.tenant_id,
                    resumed = resume.is_some(),
                    "connecting feed session"
                );
                self.breaker
                    .call("connect", || self.transport.connect(&self.credentials, resume))
                    .await?;
            }
        }

        let mut state_rx = self.state_tx.subscribe();
        let waited = tokio::time::timeout(
            self.connect_timeout,
            state_rx.wait_for(|s| s.is_auth_terminal()),
        )
        .await;

        match waited {
            Ok(Ok(state)) if *state == ConnectionState::Ready => {
                info!(tenant = %self.tenant_id, "feed session ready");
                Ok(())
            }
            Ok(Ok(_)) => Err(RelayError::Auth(format!(
                "feed refused authentication for tenant {}",
                self.tenant_id
            ))),
            Ok(Err(_)) => Err(RelayError::SessionUnavailable(format!(
                "state channel closed for tenant {}",
                self.tenant_id
            ))),
            Err(_) => {
                self.breaker.record_failure("connect timed out");
                Err(RelayError::Timeout(format!(
                    "feed session for tenant {} not ready after {}s",
                    self.tenant_id,
                    self.connect_timeout.as_secs()
                )))
            }
        }
    }

    /// Start observing a channel. Returns false if it was already observed.
    pub async fn add_channel(&self, channel_id: &str) -> Result<bool> {
        let _guard = self.channel_lock.lock().await;
        if self.observed.contains(channel_id) {
            return Ok(false);
        }
        self.breaker
            .call("join_channel", || self.transport.join_channel(channel_id))
            .await?;
        self.observed.insert(channel_id.to_string());
        info!(tenant = %self.tenant_id, channel = channel_id, "channel observed");
        Ok(true)
    }

    /// Stop observing a channel. Returns false if it was not observed.
    pub async fn remove_channel(&self, channel_id: &str) -> Result<bool> {
        let _guard = self.channel_lock.lock().await;
        if self.observed.remove(channel_id).is_none() {
            return Ok(false);
        }
        // Local filtering already stops delivery; leaving is best effort.
        if let Err(e) = self
            .breaker
            .call("leave_channel", || self.transport.leave_channel(channel_id))
            .await
        {
            warn!(tenant = %self.tenant_id, channel = channel_id, error = %e, "leave call failed");
        }
        info!(tenant = %self.tenant_id, channel = channel_id, "channel no longer observed");
        Ok(true)
    }

    /// Point-in-time snapshot, sorted
    pub fn list_observed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.observed.iter().map(|c| c.clone()).collect();
        channels.sort();
        channels
    }

    pub fn is_observing(&self, channel_id: &str) -> bool {
        self.observed.contains(channel_id)
    }

    /// Close the transport and stop the event loop. Never fails.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.channel_lock.lock().await;

        match tokio::time::timeout(self.close_timeout, self.transport.close()).await {
            Ok(Ok(())) => debug!(tenant = %self.tenant_id, "feed transport closed"),
            Ok(Err(e)) => {
                warn!(tenant = %self.tenant_id, error = %e, "feed transport close failed")
            }
            Err(_) => warn!(tenant = %self.tenant_id, "feed transport close timed out"),
        }

        self.state_tx.send_replace(ConnectionState::Closed);
        if let Some(handle) = self
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.observed.clear();
        info!(tenant = %self.tenant_id, "feed session disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

async fn run_event_loop(
    tenant_id: String,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    observed: Arc<DashSet<String>>,
    breaker: Arc<CircuitBreaker>,
    session_store: Arc<dyn SessionStore>,
    inbound: Queue<FeedMessage>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::StateChanged(state) => {
                let previous = state_tx.send_replace(state);
                if previous != state {
                    info!(
                        tenant = %tenant_id,
                        from = %previous,
                        to = %state,
                        "feed connection state changed"
                    );
                }
            }
            TransportEvent::Message(mut message) => {
                if !observed.contains(&message.channel_id) {
                    debug!(
                        tenant = %tenant_id,
                        channel = %message.channel_id,
                        "discarding message from unobserved channel"
                    );
                    continue;
                }
                message.tenant_id = tenant_id.clone();
                if let Err(e) = inbound.publish(message) {
                    warn!(tenant = %tenant_id, error = %e, "failed to publish inbound message");
                }
            }
            TransportEvent::SessionUpdated(blob) => {
                if let Err(e) = session_store.put(&tenant_id, SESSION_FILE, &blob).await {
                    warn!(tenant = %tenant_id, error = %e, "failed to persist session blob");
                }
            }
            TransportEvent::Fault(reason) => {
                warn!(tenant = %tenant_id, reason = %reason, "feed protocol fault");
                breaker.record_failure(&reason);
            }
        }
    }
    debug!(tenant = %tenant_id, "feed event stream ended");
}
