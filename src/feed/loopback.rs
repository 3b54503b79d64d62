//! In-process feed transport
//!
//! Used by `feed.transport = "loopback"` for local runs and by the tests.
//! Messages are injected through the hub instead of arriving from a network.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::transport::{ConnectionState, EventSender, FeedConnector, FeedTransport, TransportEvent};
use crate::credentials::FeedCredentials;
use crate::domain::FeedMessage;
use crate::error::{RelayError, Result};

/// How a loopback transport answers authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    Accept,
    Reject,
    /// Never reaches a terminal state
    Hang,
}

#[derive(Debug, Default)]
struct HubShared {
    auth_mode: Mutex<AuthMode>,
    fail_next: AtomicU32,
}

impl HubShared {
    fn auth_mode(&self) -> AuthMode {
        *self.auth_mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_failure(&self, op: &str) -> Result<()> {
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            Err(RelayError::Feed(format!("loopback {} failed", op)))
        } else {
            Ok(())
        }
    }
}

/// Connector plus a registry of the transports it opened
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    shared: Arc<HubShared>,
    transports: Arc<DashMap<String, Arc<LoopbackTransport>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_auth_mode(&self, mode: AuthMode) {
        *self.shared.auth_mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    /// Make the next `n` transport calls (any tenant) fail
    pub fn fail_next(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    /// Most recently opened transport for a tenant
    pub fn transport(&self, tenant_id: &str) -> Option<Arc<LoopbackTransport>> {
        self.transports.get(tenant_id).map(|t| Arc::clone(t.value()))
    }

    /// Deliver a message to a tenant's transport. Returns false if the tenant has none.
    pub fn inject(&self, tenant_id: &str, channel_id: &str, message_id: &str, text: &str) -> bool {
        match self.transport(tenant_id) {
            Some(transport) => transport.inject(channel_id, message_id, text),
            None => false,
        }
    }
}

impl FeedConnector for LoopbackHub {
    fn open(&self, tenant_id: &str, events: EventSender) -> Arc<dyn FeedTransport> {
        let transport = Arc::new(LoopbackTransport {
            tenant_id: tenant_id.to_string(),
            events,
            shared: Arc::clone(&self.shared),
            joined: DashSet::new(),
            connects: AtomicU32::new(0),
            joins: AtomicU32::new(0),
            last_resume: Mutex::new(None),
        });
        self.transports
            .insert(tenant_id.to_string(), Arc::clone(&transport));
        transport
    }
}

#[derive(Debug)]
pub struct LoopbackTransport {
    tenant_id: String,
    events: EventSender,
    shared: Arc<HubShared>,
    joined: DashSet<String>,
    connects: AtomicU32,
    joins: AtomicU32,
    last_resume: Mutex<Option<Vec<u8>>>,
}

impl LoopbackTransport {
    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn inject(&self, channel_id: &str, message_id: &str, text: &str) -> bool {
        self.emit(TransportEvent::Message(FeedMessage {
            tenant_id: self.tenant_id.clone(),
            channel_id: channel_id.to_string(),
            channel_name: None,
            message_id: message_id.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        }))
    }

    pub fn set_state(&self, state: ConnectionState) -> bool {
        self.emit(TransportEvent::StateChanged(state))
    }

    pub fn fault(&self, reason: &str) -> bool {
        self.emit(TransportEvent::Fault(reason.to_string()))
    }

    pub fn connect_calls(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn join_calls(&self) -> u32 {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn joined_channels(&self) -> Vec<String> {
        let mut joined: Vec<String> = self.joined.iter().map(|c| c.clone()).collect();
        joined.sort();
        joined
    }

    pub fn last_resume(&self) -> Option<Vec<u8>> {
        self.last_resume
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl FeedTransport for LoopbackTransport {
    async fn connect(&self, credentials: &FeedCredentials, resume: Option<Vec<u8>>) -> Result<()> {
        self.shared.take_failure("connect")?;
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_resume.lock().unwrap_or_else(|e| e.into_inner()) = resume;

        self.emit(TransportEvent::StateChanged(ConnectionState::Connecting));
        match self.shared.auth_mode() {
            AuthMode::Accept => {
                let blob =
                    format!("loopback:{}:{}:{}", self.tenant_id, credentials.account, attempt);
                self.emit(TransportEvent::SessionUpdated(blob.into_bytes()));
                self.emit(TransportEvent::StateChanged(ConnectionState::Ready));
            }
            AuthMode::Reject => {
                self.emit(TransportEvent::StateChanged(ConnectionState::Closed));
            }
            AuthMode::Hang => {}
        }
        Ok(())
    }

    async fn join_channel(&self, channel_id: &str) -> Result<()> {
        self.shared.take_failure("join")?;
        self.joins.fetch_add(1, Ordering::SeqCst);
        self.joined.insert(channel_id.to_string());
        Ok(())
    }

    async fn leave_channel(&self, channel_id: &str) -> Result<()> {
        self.shared.take_failure("leave")?;
        self.joined.remove(channel_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shared.take_failure("close")?;
        self.emit(TransportEvent::StateChanged(ConnectionState::Closed));
        Ok(())
    }
}
