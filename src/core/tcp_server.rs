use crate::config::TransportConfig;
use crate::core::tls::load_tls_acceptor;
use crate::core::transport::{ClientId, TransportEventSink, TransportInterface};
use crate::error::TransportError;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

const READ_CHUNK_SIZE: usize = 4096;

/// Default deadline for completing the TLS handshake
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct ClientHandle {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    close: Arc<Notify>,
}

type ClientMap = Arc<Mutex<HashMap<ClientId, ClientHandle>>>;

/// TCP listener with optional TLS.
///
/// Each accepted connection gets a reader task that forwards raw chunks to
/// the dispatcher and a writer task fed through an unbounded queue. With TLS
/// enabled the handshake completes before the client is reported as
/// connected, and failed or stalled handshakes are dropped without any event.
pub struct TcpServer {
    config: TransportConfig,
    tls_acceptor: Option<TlsAcceptor>,
    tls_handshake_timeout: Duration,
    clients: ClientMap,
    local_addr: Mutex<Option<SocketAddr>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    /// Create a server from its configuration, loading TLS material when enabled
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let tls_acceptor = if config.ssl_enabled {
            match (&config.certificate_path, &config.key_path) {
                (Some(cert), Some(key)) => Some(load_tls_acceptor(Path::new(cert), Path::new(key))?),
                _ => {
                    return Err(TransportError::Tls(format!(
                        "transport {} has TLS enabled but no certificate or key configured",
                        config.id
                    )))
                }
            }
        } else {
            None
        };
        Ok(Self::with_tls_acceptor(config, tls_acceptor))
    }

    pub fn with_tls_acceptor(config: TransportConfig, tls_acceptor: Option<TlsAcceptor>) -> Self {
        Self {
            config,
            tls_acceptor,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            clients: Arc::new(Mutex::new(HashMap::new())),
            local_addr: Mutex::new(None),
            server_task: Mutex::new(None),
        }
    }

    /// Drop TLS connections whose handshake has not finished after `timeout`
    pub fn with_tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.tls_handshake_timeout = timeout;
        self
    }

    /// Bind and start accepting. Returns the bound address (useful with port 0).
    pub async fn start_server(&self, sink: TransportEventSink) -> Result<SocketAddr, TransportError> {
        if self.server_task.lock().is_some() {
            return Err(TransportError::AlreadyListening(self.config.id.clone()));
        }
        let ip: IpAddr = self
            .config
            .address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(self.config.address.clone()))?;
        let listener = TcpListener::bind(SocketAddr::new(ip, self.config.port)).await?;
        let bound = listener.local_addr()?;
        info!(
            "Started {} server on {}",
            if self.tls_acceptor.is_some() { "TLS" } else { "TCP" },
            bound
        );

        let task = tokio::spawn(Self::accept_loop(
            listener,
            self.tls_acceptor.clone().map(|acceptor| (acceptor, self.tls_handshake_timeout)),
            Arc::clone(&self.clients),
            sink,
        ));
        *self.server_task.lock() = Some(task);
        *self.local_addr.lock() = Some(bound);
        Ok(bound)
    }

    /// Stop accepting and close every client connection
    pub fn stop_server(&self) {
        if let Some(task) = self.server_task.lock().take() {
            task.abort();
            info!("Stopped server {}", self.config.id);
        }
        for client in self.clients.lock().values() {
            client.close.notify_one();
        }
        *self.local_addr.lock() = None;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    async fn accept_loop(
        listener: TcpListener,
        tls: Option<(TlsAcceptor, Duration)>,
        clients: ClientMap,
        sink: TransportEventSink,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not disable Nagle for {}: {}", peer, e);
                    }
                    let tls = tls.clone();
                    let clients = Arc::clone(&clients);
                    let sink = sink.clone();
                    tokio::spawn(async move {
                        match tls {
                            Some((acceptor, deadline)) => {
                                match tokio::time::timeout(deadline, acceptor.accept(stream)).await {
                                    Ok(Ok(tls_stream)) => Self::serve_client(tls_stream, peer, clients, sink).await,
                                    Ok(Err(e)) => debug!("TLS handshake with {} failed: {}", peer, e),
                                    Err(_) => debug!("TLS handshake with {} timed out after {:?}", peer, deadline),
                                }
                            }
                            None => Self::serve_client(stream, peer, clients, sink).await,
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn serve_client<S>(stream: S, peer: SocketAddr, clients: ClientMap, sink: TransportEventSink)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let client_id = Uuid::new_v4();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();
        let close = Arc::new(Notify::new());
        clients.lock().insert(
            client_id,
            ClientHandle {
                outgoing,
                close: Arc::clone(&close),
            },
        );
        info!("Client {} connected from {}", client_id, peer);
        sink.client_connected(client_id);

        // Drains queued data even after the client was removed, then closes.
        tokio::spawn(async move {
            while let Some(data) = queue.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    debug!("Write to client {} failed: {}", client_id, e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        loop {
            tokio::select! {
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => break,
                    Ok(n) => sink.data_available(client_id, buffer[..n].to_vec()),
                    Err(e) => {
                        warn!("Read from client {} failed: {}", client_id, e);
                        break;
                    }
                },
                _ = close.notified() => {
                    debug!("Terminating connection of client {}", client_id);
                    break;
                }
            }
        }

        clients.lock().remove(&client_id);
        info!("Client {} disconnected", client_id);
        sink.client_disconnected(client_id);
    }
}

impl TransportInterface for TcpServer {
    fn configuration(&self) -> &TransportConfig {
        &self.config
    }

    fn send_data(&self, client_id: ClientId, data: &[u8]) {
        match self.clients.lock().get(&client_id) {
            Some(client) => {
                if client.outgoing.send(data.to_vec()).is_err() {
                    debug!("Client {} is closing, dropping {} bytes", client_id, data.len());
                }
            }
            None => debug!("No such client {}, dropping {} bytes", client_id, data.len()),
        }
    }

    fn terminate_client_connection(&self, client_id: ClientId) {
        if let Some(client) = self.clients.lock().get(&client_id) {
            client.close.notify_one();
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop_server();
    }
}
