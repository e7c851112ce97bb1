use rust_hub_rpc::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use test_utils::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// TCP transport tests against a real socket on the loopback interface

async fn start_tcp(config: ServerConfig) -> (Arc<JsonRpcServer>, Arc<TcpServer>, SocketAddr) {
    let tcp = TcpServer::new(TransportConfig::new("tcp", "127.0.0.1", 0).with_authentication(false)).unwrap();
    start_transport(config, tcp).await
}

async fn start_tls(tls_handshake_timeout: Duration) -> (Arc<JsonRpcServer>, Arc<TcpServer>, SocketAddr) {
    let tls = tokio_test::assert_ok!(TcpServer::new(tls_transport_config()));
    start_transport(test_config(), tls.with_tls_handshake_timeout(tls_handshake_timeout)).await
}

async fn start_transport(config: ServerConfig, tcp: TcpServer) -> (Arc<JsonRpcServer>, Arc<TcpServer>, SocketAddr) {
    init_logging();
    let users = Arc::new(InMemoryUserManager::new());
    let mut builder = JsonRpcServerBuilder::new(config, users).unwrap();
    let things = ThingsHandler::new(builder.notifier()).unwrap();
    builder.register_handler(things).unwrap();
    let server = builder.build();

    let tcp = Arc::new(tcp);
    let sink = server.register_transport(tcp.clone());
    server.start();
    let address = tokio_test::assert_ok!(tcp.start_server(sink).await);
    (server, tcp, address)
}

/// Read until the server closes the socket; fails if it stays open
async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let closed = tokio::time::timeout(RECV_TIMEOUT, stream.read_to_end(&mut received)).await;
    assert!(closed.is_ok(), "server kept the connection open");
    received
}

fn request(id: i64, method: &str, params: JsonValue) -> Vec<u8> {
    JsonRpcRequest::new(id, method, test_utils::params(params)).encode()
}

#[tokio::test]
async fn test_hello_over_tcp() {
    let (server, tcp, address) = start_tcp(test_config()).await;
    let mut client = TcpTestClient::connect(address).await;

    client.send_raw(&request(1, "JSONRPC.Hello", json!({}))).await;
    let response = client.response().await;
    assert_eq!(response.id, 1);
    assert_eq!(result(&response)["protocolVersion"], server::PROTOCOL_VERSION);
    assert_eq!(tcp.client_count(), 1);
    assert_eq!(server.session_count(), 1);

    tcp.stop_server();
    server.shutdown();
}

#[tokio::test]
async fn test_concatenated_requests_over_tcp() {
    let (server, tcp, address) = start_tcp(test_config()).await;
    let mut client = TcpTestClient::connect(address).await;

    let mut data = request(1, "JSONRPC.Hello", json!({}));
    data.extend(request(2, "Things.AddThing", json!({"name": "Lamp"})));
    data.extend(request(3, "Things.GetThings", json!({})));
    client.send_raw(&data).await;

    assert_eq!(client.response().await.id, 1);
    let added = client.response().await;
    assert_eq!(added.id, 2);
    assert_eq!(result(&added)["thingError"], "ThingErrorNoError");
    let listed = client.response().await;
    assert_eq!(listed.id, 3);
    assert_eq!(result(&listed)["things"].as_array().unwrap().len(), 1);

    tcp.stop_server();
    server.shutdown();
}

#[tokio::test]
async fn test_server_closes_connection_on_handshake_violation() {
    let (server, tcp, address) = start_tcp(test_config()).await;
    let mut client = TcpTestClient::connect(address).await;

    client.send_raw(&request(7, "Things.GetThings", json!({}))).await;
    let response = client.response().await;
    assert_eq!(response.id, 7);
    assert_eq!(response.status, ResponseStatus::Error);
    assert!(client.next_message().await.is_none());
    wait_until(|| tcp.client_count() == 0 && server.session_count() == 0).await;

    tcp.stop_server();
    server.shutdown();
}

#[tokio::test]
async fn test_concurrent_clients() {
    let (server, tcp, address) = start_tcp(test_config()).await;

    let clients = (0..5).map(|n| async move {
        let mut client = TcpTestClient::connect(address).await;
        client.send_raw(&request(1, "JSONRPC.Hello", json!({}))).await;
        client.response().await;
        let name = format!("Lamp {}", n);
        client.send_raw(&request(2, "Things.AddThing", json!({"name": name}))).await;
        let response = client.response().await;
        assert_eq!(result(&response)["thingError"], "ThingErrorNoError");
        client
    });
    let clients = futures::future::join_all(clients).await;

    assert_eq!(server.session_count(), 5);
    assert_eq!(tcp.client_count(), 5);
    drop(clients);
    wait_until(|| server.session_count() == 0).await;

    tcp.stop_server();
    server.shutdown();
}

#[tokio::test]
async fn test_client_disconnect_removes_session() {
    let (server, tcp, address) = start_tcp(test_config()).await;
    let mut client = TcpTestClient::connect(address).await;
    client.send_raw(&request(1, "JSONRPC.Hello", json!({}))).await;
    client.response().await;
    assert_eq!(server.session_count(), 1);

    drop(client);
    wait_until(|| server.session_count() == 0).await;

    tcp.stop_server();
    server.shutdown();
}

#[tokio::test]
async fn test_tls_enabled_without_material_is_refused() {
    let config = TransportConfig::new("tls", "127.0.0.1", 0);
    let config = TransportConfig {
        ssl_enabled: true,
        ..config
    };
    assert!(matches!(TcpServer::new(config), Err(TransportError::Tls(_))));
}

#[tokio::test]
async fn test_hello_over_tls() {
    let (server, tls, address) = start_tls(Duration::from_secs(2)).await;
    let mut client = TcpTestClient::connect_tls(address).await;

    client.send_raw(&request(1, "JSONRPC.Hello", json!({}))).await;
    let response = client.response().await;
    assert_eq!(response.id, 1);
    assert_eq!(result(&response)["protocolVersion"], server::PROTOCOL_VERSION);

    client.send_raw(&request(2, "Things.AddThing", json!({"name": "Lamp"}))).await;
    assert_eq!(result(&client.response().await)["thingError"], "ThingErrorNoError");
    assert_eq!(tls.client_count(), 1);
    assert_eq!(server.session_count(), 1);

    drop(client);
    wait_until(|| server.session_count() == 0 && tls.client_count() == 0).await;

    tls.stop_server();
    server.shutdown();
}

#[tokio::test]
async fn test_plaintext_on_tls_port_is_dropped() {
    let (server, tls, address) = start_tls(Duration::from_secs(2)).await;
    let mut stream = TcpStream::connect(address).await.unwrap();

    stream.write_all(&request(1, "JSONRPC.Hello", json!({}))).await.unwrap();
    let received = read_until_closed(&mut stream).await;
    assert!(!received.contains(&b'{'), "plaintext client got a JSON reply");
    assert_eq!(server.session_count(), 0);
    assert_eq!(tls.client_count(), 0);

    tls.stop_server();
    server.shutdown();
}

#[tokio::test]
async fn test_stalled_tls_handshake_is_dropped() {
    let (server, tls, address) = start_tls(Duration::from_millis(200)).await;
    let mut idle = TcpStream::connect(address).await.unwrap();

    let received = read_until_closed(&mut idle).await;
    assert!(received.is_empty());
    assert_eq!(server.session_count(), 0);

    let mut client = TcpTestClient::connect_tls(address).await;
    client.send_raw(&request(1, "JSONRPC.Hello", json!({}))).await;
    assert_eq!(client.response().await.id, 1);

    tls.stop_server();
    server.shutdown();
}
