pub mod tcp_server;
pub mod tls;
pub mod transport;

pub use tcp_server::TcpServer;
pub use tls::load_tls_acceptor;
pub use transport::{ClientId, SessionKey, TransportEvent, TransportEventSink, TransportId, TransportInterface};
