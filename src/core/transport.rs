use crate::config::TransportConfig;
use log::debug;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Opaque id of a client connection, unique within its transport
pub type ClientId = Uuid;

/// Index of a transport registered with the dispatcher
pub type TransportId = usize;

/// A client connection qualified by the transport it arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub transport_id: TransportId,
    pub client_id: ClientId,
}

impl SessionKey {
    pub fn new(transport_id: TransportId, client_id: ClientId) -> Self {
        Self { transport_id, client_id }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.client_id, self.transport_id)
    }
}

/// Connection lifecycle and data events reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ClientConnected(ClientId),
    ClientDisconnected(ClientId),
    DataAvailable(ClientId, Vec<u8>),
}

/// Where a transport delivers its events. Handed out by the dispatcher when
/// the transport is registered.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    transport_id: TransportId,
    sender: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
}

impl TransportEventSink {
    pub fn new(transport_id: TransportId, sender: mpsc::UnboundedSender<(TransportId, TransportEvent)>) -> Self {
        Self { transport_id, sender }
    }

    pub fn transport_id(&self) -> TransportId {
        self.transport_id
    }

    pub fn client_connected(&self, client_id: ClientId) {
        self.emit(TransportEvent::ClientConnected(client_id));
    }

    pub fn client_disconnected(&self, client_id: ClientId) {
        self.emit(TransportEvent::ClientDisconnected(client_id));
    }

    pub fn data_available(&self, client_id: ClientId, data: Vec<u8>) {
        self.emit(TransportEvent::DataAvailable(client_id, data));
    }

    fn emit(&self, event: TransportEvent) {
        if self.sender.send((self.transport_id, event)).is_err() {
            debug!("Dispatcher is gone, dropping event from transport {}", self.transport_id);
        }
    }
}

/// Server side of a stream transport.
///
/// Sends and terminations never block; a send to an unknown or already
/// closed client is silently ignored.
pub trait TransportInterface: Send + Sync {
    fn configuration(&self) -> &TransportConfig;

    /// Queue `data` for the client
    fn send_data(&self, client_id: ClientId, data: &[u8]);

    /// Close the client connection after already queued data is flushed
    fn terminate_client_connection(&self, client_id: ClientId);
}
