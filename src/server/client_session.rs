use crate::core::transport::{SessionKey, TransportInterface};
use crate::protocol::MessageFraming;
use crate::users::TokenInfo;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, only `JSONRPC.Hello` is accepted
    AwaitingHandshake,
    Active,
    /// Termination requested, waiting for the transport to report the disconnect
    Terminated,
}

/// Per-connection state owned by the dispatcher
pub struct ClientSession {
    key: SessionKey,
    transport: Arc<dyn TransportInterface>,
    state: SessionState,
    framing: MessageFraming,
    locale: String,
    token: Option<String>,
    identity: Option<TokenInfo>,
    notification_namespaces: BTreeSet<String>,
    connected_at: Instant,
}

impl ClientSession {
    pub fn new(key: SessionKey, transport: Arc<dyn TransportInterface>, locale: &str) -> Self {
        Self {
            key,
            transport,
            state: SessionState::AwaitingHandshake,
            framing: MessageFraming::new(),
            locale: locale.to_string(),
            token: None,
            identity: None,
            notification_namespaces: BTreeSet::new(),
            connected_at: Instant::now(),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn transport(&self) -> Arc<dyn TransportInterface> {
        Arc::clone(&self.transport)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Complete the handshake. A repeated `Hello` refreshes locale and token.
    pub fn activate(&mut self, locale: String, token: Option<String>, identity: Option<TokenInfo>) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.state = SessionState::Active;
        self.locale = locale;
        if token.is_some() {
            self.token = token;
            self.identity = identity;
        }
    }

    /// Returns false if the session was already terminated
    pub fn terminate(&mut self) -> bool {
        if self.state == SessionState::Terminated {
            return false;
        }
        self.state = SessionState::Terminated;
        self.framing.clear();
        true
    }

    pub fn push_data(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.framing.push_data(data)
    }

    pub fn buffered_len(&self) -> usize {
        self.framing.buffered_len()
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn identity(&self) -> Option<&TokenInfo> {
        self.identity.as_ref()
    }

    pub fn set_notification_namespaces(&mut self, namespaces: BTreeSet<String>) {
        self.notification_namespaces = namespaces;
    }

    pub fn notification_namespaces(&self) -> &BTreeSet<String> {
        &self.notification_namespaces
    }

    pub fn is_subscribed(&self, namespace: &str) -> bool {
        self.notification_namespaces.contains(namespace)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("locale", &self.locale)
            .field("authenticated", &self.identity.is_some())
            .field("notification_namespaces", &self.notification_namespaces)
            .finish()
    }
}
