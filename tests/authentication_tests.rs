use rust_hub_rpc::*;
use std::time::Duration;
use test_utils::*;

/// Authentication tests: initial setup, tokens, scopes, push button and lockdown

#[tokio::test]
async fn test_initial_setup_flow() {
    let harness = Harness::new(true);
    let mut client = harness.connect();

    let hello = client.hello().await;
    assert_eq!(result(&hello)["initialSetupRequired"], true);
    assert_eq!(result(&hello)["authenticationRequired"], true);

    let token = harness.admin_token(&mut client).await;
    let response = client.request_with_token("Things.GetThings", json!({}), &token).await;
    assert!(response.is_success());

    let hello = client.request("JSONRPC.Hello", json!({"token": token})).await;
    let data = result(&hello);
    assert_eq!(data["initialSetupRequired"], false);
    assert_eq!(data["authenticated"], true);
    assert_eq!(data["username"], USERNAME);
    assert_eq!(data["permissionScopes"], json!(["PermissionScopeAdmin"]));
}

#[tokio::test]
async fn test_setup_required_blocks_other_methods() {
    let harness = Harness::new(true);
    let mut client = harness.connect();
    client.hello().await;

    let response = client.request("Things.GetThings", json!({})).await;
    assert_eq!(response.status, ResponseStatus::Unauthorized);
    assert_eq!(response.error.as_deref(), Some("Initial setup required. Call CreateUser first."));
    client.expect_closed().await;
}

#[tokio::test]
async fn test_invalid_token_is_unauthorized() {
    let harness = Harness::new(true);
    harness.users.create_user(USERNAME, PASSWORD);
    let mut client = harness.connect();
    client.hello().await;

    let response = client.request_with_token("Things.GetThings", json!({}), "bogus").await;
    assert_eq!(response.status, ResponseStatus::Unauthorized);
    assert_eq!(response.error.as_deref(), Some("Forbidden: Invalid token."));
    client.expect_closed().await;
    assert!(harness.server.lockdown().is_active());
}

#[tokio::test]
async fn test_create_user_needs_admin_once_users_exist() {
    let harness = Harness::new(true);
    let mut client = harness.connect();
    client.hello().await;
    let token = harness.admin_token(&mut client).await;

    let response = client
        .request_with_token("JSONRPC.CreateUser", json!({"username": "guest", "password": "pw"}), &token)
        .await;
    assert_eq!(result(&response)["error"], "UserErrorNoError");

    let response = client
        .request_with_token("JSONRPC.CreateUser", json!({"username": "guest", "password": "pw"}), &token)
        .await;
    assert_eq!(result(&response)["error"], "UserErrorDuplicateUserId");

    let response = client
        .request("JSONRPC.CreateUser", json!({"username": "other", "password": "pw"}))
        .await;
    assert_eq!(response.status, ResponseStatus::Unauthorized);
    client.expect_closed().await;
}

#[tokio::test]
async fn test_permission_denied_keeps_connection() {
    let harness = Harness::new(true);
    harness.users.create_user(USERNAME, PASSWORD);
    harness.users.create_user("viewer", "viewer-pw");
    let mut client = harness.connect();
    client.hello().await;
    let token = login(&mut client, "viewer", "viewer-pw").await;

    let response = client
        .request_with_token("Things.AddThing", json!({"name": "Lamp"}), &token)
        .await;
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error.as_deref(), Some("Permission denied"));

    let response = client.request_with_token("Things.GetThings", json!({}), &token).await;
    assert!(response.is_success());
    assert!(!harness.server.lockdown().is_active());
}

#[tokio::test]
async fn test_token_given_at_hello_is_remembered() {
    let harness = Harness::new(true);
    let mut client = harness.connect();
    client.hello().await;
    let token = harness.admin_token(&mut client).await;

    let mut second = harness.connect();
    let hello = second.request("JSONRPC.Hello", json!({"token": token})).await;
    assert_eq!(result(&hello)["authenticated"], true);
    let response = second.request("Things.AddThing", json!({"name": "Lamp"})).await;
    assert_eq!(result(&response)["thingError"], "ThingErrorNoError");
}

#[tokio::test]
async fn test_request_token_overrides_hello_token() {
    let harness = Harness::new(true);
    harness.users.create_user(USERNAME, PASSWORD);
    harness.users.create_user("viewer", "viewer-pw");
    let mut client = harness.connect();
    client.hello().await;
    let admin = login(&mut client, USERNAME, PASSWORD).await;
    let viewer = login(&mut client, "viewer", "viewer-pw").await;

    client.request("JSONRPC.Hello", json!({"token": viewer})).await;
    let denied = client.request("Things.AddThing", json!({"name": "Lamp"})).await;
    assert_eq!(denied.error.as_deref(), Some("Permission denied"));

    let allowed = client
        .request_with_token("Things.AddThing", json!({"name": "Lamp"}), &admin)
        .await;
    assert!(allowed.is_success());
}

#[tokio::test]
async fn test_hello_with_unknown_token() {
    let harness = Harness::new(true);
    harness.users.create_user(USERNAME, PASSWORD);
    let mut client = harness.connect();
    let hello = client.request("JSONRPC.Hello", json!({"token": "stale"})).await;
    let data = result(&hello);
    assert_eq!(data["authenticated"], false);
    assert!(data.get("username").is_none());
}

#[tokio::test]
async fn test_first_failed_login_keeps_connection() {
    let harness = Harness::new(true);
    harness.users.create_user(USERNAME, PASSWORD);
    let mut client = harness.connect();
    client.hello().await;

    let response = client
        .request("JSONRPC.Authenticate", json!({"username": USERNAME, "password": "wrong", "deviceName": "test"}))
        .await;
    assert_eq!(result(&response)["success"], false);
    assert!(result(&response).get("token").is_none());
    assert!(harness.server.lockdown().is_active());

    let response = client.request("JSONRPC.Introspect", json!({})).await;
    assert!(response.is_success());
}

#[tokio::test]
async fn test_lockdown_drops_repeat_offender() {
    let harness = Harness::new(true);
    harness.users.create_user(USERNAME, PASSWORD);
    let wrong = json!({"username": USERNAME, "password": "wrong", "deviceName": "test"});

    let mut first = harness.connect();
    let mut second = harness.connect();
    first.hello().await;
    second.hello().await;

    let response = first.request("JSONRPC.Authenticate", wrong.clone()).await;
    assert_eq!(result(&response)["success"], false);

    let response = second.request("JSONRPC.Authenticate", wrong).await;
    assert_eq!(result(&response)["success"], false);
    second.expect_closed().await;

    let mut refused = harness.connect();
    refused.expect_closed().await;

    tokio::time::sleep(Duration::from_millis(350)).await;
    let mut late = harness.connect();
    late.hello().await;
    login(&mut late, USERNAME, PASSWORD).await;
}

#[tokio::test]
async fn test_tokens_and_remove_token() {
    let harness = Harness::new(true);
    let mut client = harness.connect();
    client.hello().await;
    let token = harness.admin_token(&mut client).await;
    login(&mut client, USERNAME, PASSWORD).await;

    let response = client.request_with_token("JSONRPC.Tokens", json!({}), &token).await;
    let list = result(&response)["tokenInfoList"].as_array().unwrap().clone();
    assert_eq!(list.len(), 2);
    assert!(list.iter().all(|t| t["username"] == USERNAME));

    let current = harness.users.verify_token(&token).unwrap().id.to_string();
    let removed = list
        .iter()
        .map(|t| t["id"].as_str().unwrap().to_string())
        .find(|id| *id != current)
        .unwrap();
    let response = client
        .request_with_token("JSONRPC.RemoveToken", json!({"tokenId": removed}), &token)
        .await;
    assert_eq!(result(&response)["error"], "UserErrorNoError");

    let response = client.request_with_token("JSONRPC.Tokens", json!({}), &token).await;
    let list = result(&response)["tokenInfoList"].as_array().unwrap().clone();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], current);

    let response = client
        .request_with_token("JSONRPC.RemoveToken", json!({"tokenId": uuid::Uuid::new_v4().to_string()}), &token)
        .await;
    assert_eq!(result(&response)["error"], "UserErrorTokenNotFound");
}

#[tokio::test]
async fn test_push_button_authentication() {
    let harness = Harness::new(true);
    let mut client = harness.connect();
    let hello = client.hello().await;
    assert_eq!(result(&hello)["pushButtonAuthAvailable"], true);

    let response = client
        .request("JSONRPC.RequestPushButtonAuth", json!({"deviceName": "panel"}))
        .await;
    let data = result(&response).clone();
    assert_eq!(data["success"], true);

    harness.users.push_button_pressed();
    let notification = client.notification().await;
    assert_eq!(notification.notification, "JSONRPC.PushButtonAuthFinished");
    assert_eq!(notification.params["transactionId"], data["transactionId"]);
    assert_eq!(notification.params["success"], true);

    let token = notification.params["token"].as_str().unwrap().to_string();
    let response = client
        .request_with_token("Things.AddThing", json!({"name": "Lamp"}), &token)
        .await;
    assert!(response.is_success());
}

#[tokio::test]
async fn test_push_button_request_replaced() {
    let harness = Harness::new(true);
    let mut first = harness.connect();
    let mut second = harness.connect();
    first.hello().await;
    second.hello().await;

    first
        .request("JSONRPC.RequestPushButtonAuth", json!({"deviceName": "one"}))
        .await;
    second
        .request("JSONRPC.RequestPushButtonAuth", json!({"deviceName": "two"}))
        .await;

    let cancelled = first.notification().await;
    assert_eq!(cancelled.params["success"], false);
    assert!(cancelled.params.get("token").is_none());
}

#[tokio::test]
async fn test_authentication_disabled_transport() {
    let harness = Harness::new(false);
    harness.users.create_user(USERNAME, PASSWORD);
    let mut client = harness.connect();
    let hello = client.hello().await;
    assert_eq!(result(&hello)["authenticationRequired"], false);
    assert_eq!(result(&hello)["initialSetupRequired"], false);

    let response = client.request("Fixture.Admin", json!({})).await;
    assert!(response.is_success());
}
