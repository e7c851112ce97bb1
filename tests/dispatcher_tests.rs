use rust_hub_rpc::*;
use std::time::Duration;
use test_utils::*;

/// Dispatcher tests: handshake, request parsing, validation and reply handling

#[tokio::test]
async fn test_hello_returns_server_information() {
    let harness = Harness::new(false);
    let mut client = harness.connect();

    let response = client.hello().await;
    let data = result(&response);
    assert_eq!(data["name"], "hub");
    assert_eq!(data["server"], NAME);
    assert_eq!(data["version"], VERSION);
    assert_eq!(data["protocolVersion"], server::PROTOCOL_VERSION);
    assert_eq!(data["locale"], "en_US");
    assert_eq!(data["authenticationRequired"], false);
    assert_eq!(data["initialSetupRequired"], false);
    assert!(data.get("authenticated").is_none());

    let experiences = data["experiences"].as_array().unwrap();
    assert!(experiences.iter().any(|e| e["name"] == "Things"));
    let hashes = data["cacheHashes"].as_array().unwrap();
    assert!(hashes.iter().any(|h| h["method"] == "Things.GetThings"));
}

#[tokio::test]
async fn test_cache_hash_follows_thing_list() {
    let harness = Harness::new(false);
    let mut client = harness.connect();

    let things_hash = |response: &JsonRpcResponse| {
        result(response)["cacheHashes"]
            .as_array()
            .unwrap()
            .iter()
            .find(|h| h["method"] == "Things.GetThings")
            .map(|h| h["hash"].clone())
            .unwrap()
    };
    let before = things_hash(&client.hello().await);
    assert_eq!(things_hash(&client.hello().await), before);

    let added = client.request("Things.AddThing", json!({"name": "Lamp"})).await;
    assert_eq!(result(&added)["thingError"], "ThingErrorNoError");
    let after = things_hash(&client.hello().await);
    assert_ne!(before, after);

    let listed = client.request("Things.GetThings", json!({})).await;
    assert_eq!(after, json!(server::cache_hash(&JsonValue::Object(result(&listed).clone()))));
}

#[tokio::test]
async fn test_hello_sets_locale() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    let response = client.request("JSONRPC.Hello", json!({"locale": "de_DE"})).await;
    assert_eq!(result(&response)["locale"], "de_DE");
}

#[tokio::test]
async fn test_call_before_hello_drops_connection() {
    let harness = Harness::new(false);
    let mut client = harness.connect();

    let response = client.request("Things.GetThings", json!({})).await;
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error.as_deref(), Some("Handshake required. Call JSONRPC.Hello first."));
    client.expect_closed().await;
    wait_until(|| harness.server.session_count() == 0).await;
}

#[tokio::test]
async fn test_session_state_follows_handshake() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    let key = SessionKey::new(0, client.id);
    wait_until(|| harness.server.session_state(&key) == Some(server::SessionState::AwaitingHandshake)).await;

    client.hello().await;
    assert_eq!(harness.server.session_state(&key), Some(server::SessionState::Active));

    client.disconnect();
    wait_until(|| harness.server.session_state(&key).is_none()).await;
}

#[tokio::test]
async fn test_handshake_timeout_drops_silent_client() {
    let config = ServerConfig {
        handshake_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let harness = Harness::with_config(config, false);
    let mut client = harness.connect();
    client.expect_closed().await;

    let mut polite = harness.connect();
    polite.hello().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let response = polite.request("JSONRPC.Version", json!({})).await;
    assert!(response.is_success());
}

#[tokio::test]
async fn test_malformed_json_gets_parse_error() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    client.send_raw(b"{nope}\n");
    let response = client.response().await;
    assert_eq!(response.id, -1);
    assert!(response.error.unwrap().starts_with("Failed to parse JSON data"));

    client.send_raw(b"hello there\n");
    let response = client.response().await;
    assert_eq!(response.id, -1);
    assert_eq!(response.status, ResponseStatus::Error);

    // The session survives malformed input
    assert!(client.request("JSONRPC.Version", json!({})).await.is_success());
}

#[tokio::test]
async fn test_missing_id_and_bad_method_format() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    client.send_raw(br#"{"method": "JSONRPC.Version"}"#);
    let response = client.response().await;
    assert_eq!(response.id, -1);
    assert_eq!(response.error.as_deref(), Some("Error parsing command. Missing 'id'"));

    let response = client.request("Version", json!({})).await;
    assert!(response.error.unwrap().contains("Namespace.method"));
}

#[tokio::test]
async fn test_unknown_namespace_and_method() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    let response = client.request("Nope.Call", json!({})).await;
    assert_eq!(response.error.as_deref(), Some("No such namespace: Nope"));

    let response = client.request("Things.Nope", json!({})).await;
    assert_eq!(response.error.as_deref(), Some("No such method: Things.Nope"));
}

#[tokio::test]
async fn test_invalid_params_report_path() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    let response = client.request("Things.AddThing", json!({})).await;
    assert_eq!(response.error.as_deref(), Some("Invalid params: Missing required key in name"));

    let response = client
        .request("Things.AddThing", json!({"name": "Lamp", "color": "#zz"}))
        .await;
    assert!(response.error.unwrap().ends_with(" in color"));

    let response = client
        .request("Things.AddThing", json!({"name": "Lamp", "brightness": 5}))
        .await;
    assert_eq!(response.error.as_deref(), Some("Invalid params: Unexpected field in brightness"));
    assert!(harness.things.things().is_empty());
}

#[tokio::test]
async fn test_sync_call_round_trip() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    let response = client
        .request("Things.AddThing", json!({"name": "Lamp", "color": "#ff0000"}))
        .await;
    let data = result(&response);
    assert_eq!(data["thingError"], "ThingErrorNoError");
    let thing_id = data["thingId"].as_str().unwrap().to_string();

    let response = client.request("Things.GetThings", json!({"thingId": thing_id})).await;
    let things = result(&response)["things"].as_array().unwrap().clone();
    assert_eq!(things.len(), 1);
    assert_eq!(things[0]["name"], "Lamp");
    assert_eq!(things[0]["color"], "#ff0000");
}

#[tokio::test]
async fn test_async_reply_arrives_after_later_sync_reply() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;
    let thing = harness.things.add_thing("Lamp", None).unwrap();

    let remove_id = client.call("Things.RemoveThing", json!({"thingId": thing.id.to_string()}));
    let get_id = client.call("Things.GetThings", json!({}));

    let first = client.response().await;
    assert_eq!(first.id, get_id);
    let second = client.response().await;
    assert_eq!(second.id, remove_id);
    assert_eq!(result(&second)["thingError"], "ThingErrorNoError");
    assert!(harness.things.things().is_empty());
}

#[tokio::test]
async fn test_duplicate_pending_command_id() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    client.send_request(JsonRpcRequest::new(50, "Fixture.Never", JsonMap::new()));
    client.send_request(JsonRpcRequest::new(50, "Fixture.Echo", params(json!({"value": "x"}))));

    let duplicate = client.response().await;
    assert_eq!(duplicate.id, 50);
    assert_eq!(duplicate.error.as_deref(), Some("Duplicate command id: 50"));

    let timed_out = client.response().await;
    assert_eq!(timed_out.id, 50);
    assert_eq!(timed_out.error.as_deref(), Some("Command timed out"));
    assert_eq!(harness.server.pending_call_count(), 0);
}

#[tokio::test]
async fn test_pending_call_limit_is_per_client() {
    let config = ServerConfig {
        max_pending_calls: 2,
        ..test_config()
    };
    let harness = Harness::with_config(config, false);
    let mut greedy = harness.connect();
    let mut other = harness.connect();
    greedy.hello().await;
    other.hello().await;

    greedy.call("Fixture.Never", json!({}));
    greedy.call("Fixture.Never", json!({}));
    wait_until(|| harness.server.pending_call_count() == 2).await;

    let refused = greedy.request("Fixture.Slow", json!({"value": "x", "delayMs": 0})).await;
    assert_eq!(refused.status, ResponseStatus::Error);
    assert_eq!(
        refused.error.as_deref(),
        Some("Too many pending calls: maximum 2 calls per client allowed")
    );

    let response = other.request("Fixture.Slow", json!({"value": "ok", "delayMs": 10})).await;
    assert_eq!(result(&response)["value"], "ok");
}

#[tokio::test]
async fn test_slow_reply_within_timeout() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    let response = client.request("Fixture.Slow", json!({"value": "late", "delayMs": 50})).await;
    assert_eq!(result(&response)["value"], "late");
}

#[tokio::test]
async fn test_abandoned_async_reply_is_internal_error() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    let response = client.request("Fixture.Abandon", json!({})).await;
    assert_eq!(response.error.as_deref(), Some("Internal error"));
}

#[tokio::test]
async fn test_reply_violating_schema_is_replaced() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    let response = client.request("Fixture.Broken", json!({})).await;
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error.as_deref(), Some("Internal error: invalid reply"));
}

#[tokio::test]
async fn test_deprecated_method_warns() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    let response = client.request("Fixture.Old", json!({"value": "v"})).await;
    assert!(response.is_success());
    assert_eq!(response.deprecation_warning.as_deref(), Some("Use Fixture.Echo"));

    let response = client.request("Fixture.Echo", json!({"value": "v"})).await;
    assert_eq!(response.deprecation_warning, None);
}

#[tokio::test]
async fn test_disconnect_releases_pending_calls() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    client.call("Fixture.Never", json!({}));
    wait_until(|| harness.server.pending_call_count() == 1).await;
    client.disconnect();
    wait_until(|| harness.server.pending_call_count() == 0 && harness.server.session_count() == 0).await;
}

#[tokio::test]
async fn test_oversized_buffer_drops_connection() {
    let config = ServerConfig {
        max_buffer_size: 64,
        ..test_config()
    };
    let harness = Harness::with_config(config, false);
    let mut client = harness.connect();
    client.hello().await;

    let mut data = br#"{"id": 1, "method": "Fixture.Echo", "params": {"value": ""#.to_vec();
    data.extend(std::iter::repeat(b'a').take(128));
    client.send_raw(&data);
    client.expect_closed().await;
}

#[tokio::test]
async fn test_messages_split_and_concatenated() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    client.send_raw(br#"{"id": 10, "method": "Fixture.Echo", "params": {"value": "}{"}}{"id": 11, "#);
    client.send_raw(br#""method": "Fixture.Echo", "params": {"value": "b"}}"#);

    let first = client.response().await;
    assert_eq!(first.id, 10);
    assert_eq!(result(&first)["value"], "}{");
    let second = client.response().await;
    assert_eq!(second.id, 11);
}

#[tokio::test]
async fn test_introspect_and_version() {
    let harness = Harness::new(false);
    let mut client = harness.connect();
    client.hello().await;

    let response = client.request("JSONRPC.Introspect", json!({})).await;
    let api = result(&response);
    assert!(api["methods"].get("Things.AddThing").is_some());
    assert!(api["methods"].get("JSONRPC.Hello").is_some());
    assert!(api["notifications"].get("Things.ThingAdded").is_some());
    assert_eq!(api["types"]["Thing"]["r:color"], "Color");
    assert_eq!(api["flags"]["PermissionScopes"], json!(["$ref:PermissionScope"]));

    let response = client.request("JSONRPC.Version", json!({})).await;
    assert_eq!(result(&response)["version"], VERSION);

    let response = client.request("JSONRPC.KeepAlive", json!({"sessionId": "s-1"})).await;
    assert_eq!(result(&response)["sessionId"], "s-1");
}
