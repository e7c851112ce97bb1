use crate::core::transport::SessionKey;
use crate::server::json_handler::{CallContext, HandlerReply, JsonHandler, JsonMap, MethodTable};
use crate::server::notifier::Notifier;
use crate::specification::model_registry::{
    BasicType, FieldMap, HandlerDescriptor, MethodSpec, NotificationSpec, PermissionScope, TypeRef,
};
use crate::users::{PushButtonAuthResult, UserError, UserManager};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use uuid::Uuid;

pub const JSONRPC_NAMESPACE: &str = "JSONRPC";

/// Version of the wire protocol and of the `JSONRPC` namespace
pub const PROTOCOL_VERSION: &str = "1.0";

/// The built-in namespace: handshake, introspection, subscriptions and
/// user management.
pub struct JsonRpcHandler {
    notifier: Notifier,
    user_manager: Arc<dyn UserManager>,
    /// Push-button transaction id to the session waiting for it
    push_button_transactions: Mutex<HashMap<i32, SessionKey>>,
}

impl JsonRpcHandler {
    pub fn new(notifier: Notifier, user_manager: Arc<dyn UserManager>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            user_manager.set_push_button_listener(Arc::new(move |result: PushButtonAuthResult| {
                if let Some(handler) = this.upgrade() {
                    handler.push_button_auth_finished(result);
                }
            }));
            Self {
                notifier,
                user_manager: Arc::clone(&user_manager),
                push_button_transactions: Mutex::new(HashMap::new()),
            }
        })
    }

    /// Forget push-button transactions of a closed session
    pub fn client_disconnected(&self, session: &SessionKey) {
        let cancelled: Vec<i32> = {
            let mut transactions = self.push_button_transactions.lock();
            let ids: Vec<i32> = transactions
                .iter()
                .filter(|(_, s)| *s == session)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                transactions.remove(id);
            }
            ids
        };
        for id in cancelled {
            debug!("Cancelling push button transaction {} of closed client {}", id, session.client_id);
            self.user_manager.cancel_push_button_auth(id);
        }
    }

    fn push_button_auth_finished(&self, result: PushButtonAuthResult) {
        let Some(session) = self.push_button_transactions.lock().remove(&result.transaction_id) else {
            debug!("Push button transaction {} has no waiting client", result.transaction_id);
            return;
        };
        info!(
            "Push button transaction {} finished: {}",
            result.transaction_id,
            if result.success { "success" } else { "failed" }
        );
        let mut params = JsonMap::new();
        params.insert("success".to_string(), json!(result.success));
        params.insert("transactionId".to_string(), json!(result.transaction_id));
        if let Some(token) = result.token {
            params.insert("token".to_string(), json!(token));
        }
        self.notifier
            .publish_to_client(session, JSONRPC_NAMESPACE, "PushButtonAuthFinished", params);
    }

    fn hello(&self, _params: &JsonMap, ctx: &CallContext<'_>) -> HandlerReply {
        let config = ctx.server.config();
        let mut data = JsonMap::new();
        data.insert("server".to_string(), json!(crate::NAME));
        data.insert("name".to_string(), json!(config.server_name));
        data.insert("version".to_string(), json!(crate::VERSION));
        data.insert("uuid".to_string(), json!(config.server_uuid.to_string()));
        data.insert("language".to_string(), json!(ctx.locale()));
        data.insert("locale".to_string(), json!(ctx.locale()));
        data.insert("protocolVersion".to_string(), json!(PROTOCOL_VERSION));
        data.insert(
            "initialSetupRequired".to_string(),
            json!(ctx.authentication_required() && self.user_manager.initial_setup_required()),
        );
        data.insert("authenticationRequired".to_string(), json!(ctx.authentication_required()));
        data.insert(
            "pushButtonAuthAvailable".to_string(),
            json!(self.user_manager.push_button_auth_available()),
        );

        let experiences = ctx.server.experiences();
        if !experiences.is_empty() {
            let list: Vec<Value> = experiences
                .iter()
                .map(|e| json!({"name": e.name, "version": e.version}))
                .collect();
            data.insert("experiences".to_string(), Value::Array(list));
        }
        let hashes = ctx.server.cache_hashes();
        if !hashes.is_empty() {
            let list: Vec<Value> = hashes
                .iter()
                .map(|(method, hash)| json!({"method": method, "hash": hash}))
                .collect();
            data.insert("cacheHashes".to_string(), Value::Array(list));
        }

        if ctx.token().is_some() {
            data.insert("authenticated".to_string(), json!(ctx.identity().is_some()));
        }
        if let Some(identity) = ctx.identity() {
            let scopes: Vec<&str> = identity.scopes.iter().map(PermissionScope::as_str).collect();
            data.insert("permissionScopes".to_string(), json!(scopes));
            data.insert("username".to_string(), json!(identity.username));
        }
        HandlerReply::create_reply(data)
    }

    fn introspect(&self, _params: &JsonMap, ctx: &CallContext<'_>) -> HandlerReply {
        HandlerReply::create_reply(ctx.server.api().introspect())
    }

    fn version(&self, _params: &JsonMap, _ctx: &CallContext<'_>) -> HandlerReply {
        let mut data = JsonMap::new();
        data.insert("version".to_string(), json!(crate::VERSION));
        data.insert("protocolVersion".to_string(), json!(PROTOCOL_VERSION));
        HandlerReply::create_reply(data)
    }

    fn set_notification_status(&self, params: &JsonMap, ctx: &CallContext<'_>) -> HandlerReply {
        let requested: BTreeSet<String> = match params.get("enabled").and_then(Value::as_bool) {
            Some(true) => ctx.server.api().namespaces().cloned().collect(),
            Some(false) => BTreeSet::new(),
            None => params
                .get("namespaces")
                .and_then(Value::as_array)
                .map(|names| names.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default(),
        };
        let enabled = ctx.server.set_notification_namespaces(&ctx.session(), requested);
        let mut data = JsonMap::new();
        data.insert("namespaces".to_string(), json!(enabled.into_iter().collect::<Vec<_>>()));
        HandlerReply::create_reply(data)
    }

    fn create_user(&self, params: &JsonMap, _ctx: &CallContext<'_>) -> HandlerReply {
        let username = params.get("username").and_then(Value::as_str).unwrap_or_default();
        let password = params.get("password").and_then(Value::as_str).unwrap_or_default();
        let error = self.user_manager.create_user(username, password);
        info!("CreateUser {}: {}", username, error.as_str());
        let mut data = JsonMap::new();
        data.insert("error".to_string(), json!(error.as_str()));
        HandlerReply::create_reply(data)
    }

    fn authenticate(&self, params: &JsonMap, ctx: &CallContext<'_>) -> HandlerReply {
        let username = params.get("username").and_then(Value::as_str).unwrap_or_default();
        let password = params.get("password").and_then(Value::as_str).unwrap_or_default();
        let device_name = params.get("deviceName").and_then(Value::as_str).unwrap_or_default();

        let mut data = JsonMap::new();
        match self.user_manager.authenticate(username, password, device_name) {
            Some(token) => {
                info!("User {} authenticated from device {}", username, device_name);
                data.insert("success".to_string(), json!(true));
                data.insert("token".to_string(), json!(token));
            }
            None => {
                warn!("Authentication failed for user {} from client {}", username, ctx.client_id());
                data.insert("success".to_string(), json!(false));
                if ctx.server.lockdown().register_failure() {
                    warn!("Repeated authentication failure during lockdown, dropping client {}", ctx.client_id());
                    ctx.request_connection_drop();
                }
            }
        }
        HandlerReply::create_reply(data)
    }

    fn request_push_button_auth(&self, params: &JsonMap, ctx: &CallContext<'_>) -> HandlerReply {
        let mut data = JsonMap::new();
        if !self.user_manager.push_button_auth_available() {
            data.insert("success".to_string(), json!(false));
            data.insert("transactionId".to_string(), json!(-1));
            return HandlerReply::create_reply(data);
        }
        let device_name = params.get("deviceName").and_then(Value::as_str).unwrap_or_default();
        // The manager reports a replaced transaction through the listener, which takes this lock.
        let transaction_id = self.user_manager.request_push_button_auth(device_name);
        self.push_button_transactions.lock().insert(transaction_id, ctx.session());
        info!("Push button authentication {} requested by {}", transaction_id, device_name);
        data.insert("success".to_string(), json!(true));
        data.insert("transactionId".to_string(), json!(transaction_id));
        HandlerReply::create_reply(data)
    }

    fn tokens(&self, _params: &JsonMap, ctx: &CallContext<'_>) -> HandlerReply {
        let list: Vec<Value> = match ctx.identity() {
            Some(identity) => self
                .user_manager
                .tokens(&identity.username)
                .iter()
                .map(|t| t.to_json())
                .collect(),
            None => Vec::new(),
        };
        let mut data = JsonMap::new();
        data.insert("tokenInfoList".to_string(), Value::Array(list));
        HandlerReply::create_reply(data)
    }

    fn remove_token(&self, params: &JsonMap, ctx: &CallContext<'_>) -> HandlerReply {
        let token_id = params
            .get("tokenId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let error = match (ctx.identity(), token_id) {
            (Some(identity), Some(token_id)) => {
                let owned = self
                    .user_manager
                    .tokens(&identity.username)
                    .iter()
                    .any(|t| t.id == token_id);
                if owned {
                    self.user_manager.remove_token(token_id)
                } else {
                    UserError::TokenNotFound
                }
            }
            _ => UserError::PermissionDenied,
        };
        let mut data = JsonMap::new();
        data.insert("error".to_string(), json!(error.as_str()));
        HandlerReply::create_reply(data)
    }

    fn keep_alive(&self, params: &JsonMap, _ctx: &CallContext<'_>) -> HandlerReply {
        let session_id = params.get("sessionId").and_then(Value::as_str).unwrap_or_default();
        debug!("KeepAlive received {}", session_id);
        let mut data = JsonMap::new();
        data.insert("success".to_string(), json!(true));
        data.insert("sessionId".to_string(), json!(session_id));
        HandlerReply::create_reply(data)
    }
}

impl JsonHandler for JsonRpcHandler {
    fn name(&self) -> &str {
        JSONRPC_NAMESPACE
    }

    fn descriptor(&self) -> HandlerDescriptor {
        let string = || TypeRef::basic(BasicType::String);
        let boolean = || TypeRef::basic(BasicType::Bool);
        let object = || TypeRef::basic(BasicType::Object);

        HandlerDescriptor::new(JSONRPC_NAMESPACE)
            .with_enum("UserError", UserError::enum_values())
            .with_enum("PermissionScope", PermissionScope::enum_values())
            .with_flag("PermissionScopes", "PermissionScope")
            .with_object(
                "TokenInfo",
                FieldMap::new()
                    .with("id", TypeRef::basic(BasicType::Uuid))
                    .with("username", string())
                    .with("deviceName", string())
                    .with("creationTime", TypeRef::basic(BasicType::Uint)),
            )
            .with_object("Experience", FieldMap::new().with("name", string()).with("version", string()))
            .with_object("CacheHash", FieldMap::new().with("method", string()).with("hash", string()))
            .with_method(
                "Hello",
                MethodSpec::new(
                    "Initiates a connection. Must be the first call of every client. Returns information \
                     about this server and whether authentication is needed.",
                )
                .with_params(FieldMap::new().with("o:locale", string()).with("o:token", string()))
                .with_returns(
                    FieldMap::new()
                        .with("server", string())
                        .with("name", string())
                        .with("version", string())
                        .with("uuid", TypeRef::basic(BasicType::Uuid))
                        .with("language", string())
                        .with("locale", string())
                        .with("protocolVersion", string())
                        .with("initialSetupRequired", boolean())
                        .with("authenticationRequired", boolean())
                        .with("pushButtonAuthAvailable", boolean())
                        .with("o:experiences", TypeRef::list_of(TypeRef::reference("Experience")))
                        .with("o:cacheHashes", TypeRef::list_of(TypeRef::reference("CacheHash")))
                        .with("o:authenticated", boolean())
                        .with("o:permissionScopes", TypeRef::reference("PermissionScopes"))
                        .with("o:username", string()),
                ),
            )
            .with_method(
                "Introspect",
                MethodSpec::new("Introspect this API.").with_returns(
                    FieldMap::new()
                        .with("enums", object())
                        .with("flags", object())
                        .with("types", object())
                        .with("methods", object())
                        .with("notifications", object()),
                ),
            )
            .with_method(
                "Version",
                MethodSpec::new("Version of this server and of the JSON-RPC protocol.")
                    .with_returns(FieldMap::new().with("version", string()).with("protocolVersion", string())),
            )
            .with_method(
                "SetNotificationStatus",
                MethodSpec::new(
                    "Select the namespaces this client receives notifications for. \
                     Returns the resulting list.",
                )
                .with_params(
                    FieldMap::new()
                        .with("o:namespaces", TypeRef::basic(BasicType::StringList))
                        .with("o:enabled", boolean()),
                )
                .with_returns(FieldMap::new().with("namespaces", TypeRef::basic(BasicType::StringList))),
            )
            .with_method(
                "CreateUser",
                MethodSpec::new("Create a new user. Call Authenticate afterwards to obtain a token.")
                    .with_params(FieldMap::new().with("username", string()).with("password", string()))
                    .with_returns(FieldMap::new().with("error", TypeRef::reference("UserError")))
                    .with_permission_scope(PermissionScope::Admin),
            )
            .with_method(
                "Authenticate",
                MethodSpec::new("Obtain a token for a device with username and password.")
                    .with_params(
                        FieldMap::new()
                            .with("username", string())
                            .with("password", string())
                            .with("deviceName", string()),
                    )
                    .with_returns(FieldMap::new().with("success", boolean()).with("o:token", string())),
            )
            .with_method(
                "RequestPushButtonAuth",
                MethodSpec::new(
                    "Start a push button authentication. The result is sent with \
                     PushButtonAuthFinished to this client only.",
                )
                .with_params(FieldMap::new().with("deviceName", string()))
                .with_returns(
                    FieldMap::new()
                        .with("success", boolean())
                        .with("transactionId", TypeRef::basic(BasicType::Int)),
                ),
            )
            .with_method(
                "Tokens",
                MethodSpec::new("Tokens of the calling user.")
                    .with_returns(FieldMap::new().with("tokenInfoList", TypeRef::list_of(TypeRef::reference("TokenInfo")))),
            )
            .with_method(
                "RemoveToken",
                MethodSpec::new("Revoke one of the calling user's tokens.")
                    .with_params(FieldMap::new().with("tokenId", TypeRef::basic(BasicType::Uuid)))
                    .with_returns(FieldMap::new().with("error", TypeRef::reference("UserError"))),
            )
            .with_method(
                "KeepAlive",
                MethodSpec::new("Keep the connection alive.")
                    .with_params(FieldMap::new().with("sessionId", string()))
                    .with_returns(FieldMap::new().with("success", boolean()).with("sessionId", string())),
            )
            .with_notification(
                "PushButtonAuthFinished",
                NotificationSpec::new(
                    "Emitted to the requesting client only, regardless of its notification settings.",
                )
                .with_params(
                    FieldMap::new()
                        .with("success", boolean())
                        .with("transactionId", TypeRef::basic(BasicType::Int))
                        .with("o:token", string()),
                ),
            )
    }

    fn method_table(self: Arc<Self>) -> MethodTable {
        let mut table = MethodTable::new();
        macro_rules! route {
            ($name:literal, $method:ident) => {{
                let this = Arc::clone(&self);
                table.register($name, move |params, ctx| this.$method(params, ctx));
            }};
        }
        route!("Hello", hello);
        route!("Introspect", introspect);
        route!("Version", version);
        route!("SetNotificationStatus", set_notification_status);
        route!("CreateUser", create_user);
        route!("Authenticate", authenticate);
        route!("RequestPushButtonAuth", request_push_button_auth);
        route!("Tokens", tokens);
        route!("RemoveToken", remove_token);
        route!("KeepAlive", keep_alive);
        table
    }
}
