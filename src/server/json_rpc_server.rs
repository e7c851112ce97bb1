use crate::config::ServerConfig;
use crate::core::transport::{ClientId, SessionKey, TransportEvent, TransportEventSink, TransportId, TransportInterface};
use crate::error::{RegistrationError, RpcError};
use crate::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PendingCallKey, ResponseTracker, TimeoutManager,
    TrackerConfig,
};
use crate::server::client_session::{ClientSession, SessionState};
use crate::server::json_handler::{AsyncReply, CallContext, Experience, HandlerReply, JsonHandler, JsonMap, MethodTable};
use crate::server::jsonrpc_handler::{JsonRpcHandler, JSONRPC_NAMESPACE};
use crate::server::lockdown::LockdownState;
use crate::server::notifier::{NotificationEvent, Notifier};
use crate::specification::{scopes_permit, ApiSchema, JsonValidator};
use crate::users::{TokenInfo, UserManager};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Callable without a token while no user exists yet
const SETUP_METHODS: [&str; 4] = ["Introspect", "Hello", "CreateUser", "RequestPushButtonAuth"];

/// Callable without a token once users exist
const LOGIN_METHODS: [&str; 4] = ["Introspect", "Hello", "Authenticate", "RequestPushButtonAuth"];

type EventReceiver = mpsc::UnboundedReceiver<(TransportId, TransportEvent)>;

struct RegisteredHandler {
    handler: Arc<dyn JsonHandler>,
    methods: MethodTable,
}

/// Collects handlers before the server starts.
///
/// The API schema is frozen by [`JsonRpcServerBuilder::build`]; handlers
/// cannot be added to a running server.
pub struct JsonRpcServerBuilder {
    config: ServerConfig,
    user_manager: Arc<dyn UserManager>,
    notifier: Notifier,
    notifications: mpsc::UnboundedReceiver<NotificationEvent>,
    api: ApiSchema,
    handlers: HashMap<String, RegisteredHandler>,
    jsonrpc: Arc<JsonRpcHandler>,
}

impl JsonRpcServerBuilder {
    /// Create a builder with the built-in `JSONRPC` namespace registered
    pub fn new(config: ServerConfig, user_manager: Arc<dyn UserManager>) -> Result<Self, RegistrationError> {
        let (notifier, notifications) = Notifier::channel();
        let jsonrpc = JsonRpcHandler::new(notifier.clone(), Arc::clone(&user_manager));
        let mut builder = Self {
            config,
            user_manager,
            notifier,
            notifications,
            api: ApiSchema::new(),
            handlers: HashMap::new(),
            jsonrpc: Arc::clone(&jsonrpc),
        };
        builder.register_handler(jsonrpc)?;
        Ok(builder)
    }

    /// Handle for publishing notifications, to be given to handlers
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    pub fn api(&self) -> &ApiSchema {
        &self.api
    }

    /// Merge a handler's API and keep its callbacks.
    /// On error the schema is left unchanged.
    pub fn register_handler(&mut self, handler: Arc<dyn JsonHandler>) -> Result<&mut Self, RegistrationError> {
        let descriptor = handler.descriptor();
        if descriptor.name != handler.name() {
            return Err(RegistrationError::InvalidSchema {
                handler: handler.name().to_string(),
                reason: format!("descriptor declares namespace {}", descriptor.name),
            });
        }
        let methods = Arc::clone(&handler).method_table();
        if let Err(e) = self.api.register(&descriptor, |name| methods.contains(name)) {
            error!("Failed to register handler {}: {}", descriptor.name, e);
            return Err(e);
        }
        info!(
            "Registered handler {} ({} methods, {} notifications)",
            descriptor.name,
            descriptor.methods.len(),
            descriptor.notifications.len()
        );
        self.handlers
            .insert(descriptor.name.clone(), RegisteredHandler { handler, methods });
        Ok(self)
    }

    pub fn build(self) -> Arc<JsonRpcServer> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let tracker = ResponseTracker::new(TrackerConfig {
            max_pending_calls: self.config.max_pending_calls,
            reply_timeout: self.config.async_reply_timeout,
        });
        Arc::new(JsonRpcServer {
            lockdown: LockdownState::new(self.config.lockdown_duration),
            config: self.config,
            api: self.api,
            handlers: self.handlers,
            jsonrpc: self.jsonrpc,
            user_manager: self.user_manager,
            notifier: self.notifier,
            pending_queues: Mutex::new(Some((events_rx, self.notifications))),
            events_tx,
            transports: RwLock::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            tracker,
            handshake_timeouts: TimeoutManager::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Dispatches JSON-RPC traffic from any number of transports.
///
/// Transport events and notifications are each processed by one task, so
/// calls of a session are handled in arrival order. Sessions, pending calls
/// and the lockdown window are shared with async reply waiters behind locks.
pub struct JsonRpcServer {
    config: ServerConfig,
    api: ApiSchema,
    handlers: HashMap<String, RegisteredHandler>,
    jsonrpc: Arc<JsonRpcHandler>,
    user_manager: Arc<dyn UserManager>,
    notifier: Notifier,
    pending_queues: Mutex<Option<(EventReceiver, mpsc::UnboundedReceiver<NotificationEvent>)>>,
    events_tx: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
    transports: RwLock<Vec<Arc<dyn TransportInterface>>>,
    sessions: Mutex<HashMap<SessionKey, ClientSession>>,
    lockdown: LockdownState,
    tracker: ResponseTracker,
    handshake_timeouts: TimeoutManager<SessionKey>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JsonRpcServer {
    /// Attach a transport; it reports its clients through the returned sink
    pub fn register_transport(&self, transport: Arc<dyn TransportInterface>) -> TransportEventSink {
        let mut transports = self.transports.write();
        let transport_id = transports.len();
        info!(
            "Registered transport {} ({}:{}, authentication {})",
            transport.configuration().id,
            transport.configuration().address,
            transport.configuration().port,
            if transport.configuration().authentication_enabled { "on" } else { "off" }
        );
        transports.push(transport);
        TransportEventSink::new(transport_id, self.events_tx.clone())
    }

    /// Spawn the dispatch and notification loops. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some((events, notifications)) = self.pending_queues.lock().take() else {
            warn!("Server {} already started", self.config.server_name);
            return;
        };
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).event_loop(events)));
        tasks.push(tokio::spawn(Arc::clone(self).notification_loop(notifications)));
        info!("Server {} ({}) started", self.config.server_name, self.config.server_uuid);
    }

    /// Stop processing and close every client connection
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.handshake_timeouts.cancel_all_timeouts();
        self.tracker.shutdown();
        let sessions: Vec<ClientSession> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.transport().terminate_client_connection(session.key().client_id);
        }
        info!("Server {} stopped, closed {} sessions", self.config.server_name, sessions.len());
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn api(&self) -> &ApiSchema {
        &self.api
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    pub fn user_manager(&self) -> &Arc<dyn UserManager> {
        &self.user_manager
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session_state(&self, key: &SessionKey) -> Option<SessionState> {
        self.sessions.lock().get(key).map(ClientSession::state)
    }

    pub fn pending_call_count(&self) -> usize {
        self.tracker.pending_count()
    }

    pub fn lockdown(&self) -> &LockdownState {
        &self.lockdown
    }

    /// Experiences of all handlers, for `Hello`
    pub(crate) fn experiences(&self) -> Vec<Experience> {
        let mut experiences: Vec<Experience> = self.handlers.values().filter_map(|h| h.handler.experience()).collect();
        experiences.sort_by(|a, b| a.name.cmp(&b.name));
        experiences
    }

    /// `Namespace.Method` to digest, across all handlers
    pub(crate) fn cache_hashes(&self) -> BTreeMap<String, String> {
        self.handlers
            .iter()
            .flat_map(|(namespace, registered)| {
                registered
                    .handler
                    .cache_hashes()
                    .into_iter()
                    .map(move |(method, hash)| (format!("{}.{}", namespace, method), hash))
            })
            .collect()
    }

    /// Replace a session's subscriptions, keeping only registered namespaces.
    /// Returns the resulting set.
    pub(crate) fn set_notification_namespaces(&self, key: &SessionKey, namespaces: BTreeSet<String>) -> BTreeSet<String> {
        let namespaces: BTreeSet<String> = namespaces.into_iter().filter(|n| self.api.has_namespace(n)).collect();
        match self.sessions.lock().get_mut(key) {
            Some(session) => {
                debug!("Client {} notification namespaces: {:?}", key.client_id, namespaces);
                session.set_notification_namespaces(namespaces.clone());
                namespaces
            }
            None => BTreeSet::new(),
        }
    }

    async fn event_loop(self: Arc<Self>, mut events: EventReceiver) {
        while let Some((transport_id, event)) = events.recv().await {
            match event {
                TransportEvent::ClientConnected(client_id) => self.client_connected(transport_id, client_id),
                TransportEvent::ClientDisconnected(client_id) => self.client_disconnected(transport_id, client_id),
                TransportEvent::DataAvailable(client_id, data) => {
                    self.process_data(SessionKey::new(transport_id, client_id), &data)
                }
            }
        }
        debug!("Transport event queue closed");
    }

    async fn notification_loop(self: Arc<Self>, mut notifications: mpsc::UnboundedReceiver<NotificationEvent>) {
        while let Some(event) = notifications.recv().await {
            self.deliver_notification(event);
        }
    }

    fn transport(&self, transport_id: TransportId) -> Option<Arc<dyn TransportInterface>> {
        self.transports.read().get(transport_id).cloned()
    }

    fn client_connected(self: &Arc<Self>, transport_id: TransportId, client_id: ClientId) {
        let Some(transport) = self.transport(transport_id) else {
            warn!("Client {} connected on unknown transport {}", client_id, transport_id);
            return;
        };
        if let Some(remaining) = self.lockdown.remaining() {
            warn!(
                "Refusing client {}: authentication lockdown active for {:?}",
                client_id, remaining
            );
            transport.terminate_client_connection(client_id);
            return;
        }

        let key = SessionKey::new(transport_id, client_id);
        self.sessions
            .lock()
            .insert(key, ClientSession::new(key, transport, &self.config.default_locale));

        let server: Weak<Self> = Arc::downgrade(self);
        self.handshake_timeouts.start_timeout(
            key,
            self.config.handshake_timeout,
            Box::new(move |key: SessionKey| {
                if let Some(server) = server.upgrade() {
                    warn!("Client {} did not say Hello in time, dropping connection", key.client_id);
                    server.terminate_session(&key);
                }
            }),
        );
        info!("Client {} connected on transport {}", client_id, transport_id);
    }

    fn client_disconnected(&self, transport_id: TransportId, client_id: ClientId) {
        let key = SessionKey::new(transport_id, client_id);
        self.handshake_timeouts.cancel_timeout(&key);
        let released = self.tracker.release_session(&key);
        self.jsonrpc.client_disconnected(&key);
        let removed = self.sessions.lock().remove(&key);
        if let Some(session) = removed {
            info!(
                "Client {} disconnected after {:?} ({} pending calls released)",
                client_id,
                session.connected_at().elapsed(),
                released
            );
        }
    }

    fn process_data(self: &Arc<Self>, key: SessionKey, data: &[u8]) {
        let (packets, buffered) = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&key) else {
                debug!("Data from unknown client {}, ignoring", key.client_id);
                return;
            };
            if session.state() == SessionState::Terminated {
                return;
            }
            let packets = session.push_data(data);
            (packets, session.buffered_len())
        };

        for packet in packets {
            self.process_packet(key, &packet);
        }

        if buffered > self.config.max_buffer_size {
            warn!(
                "Client {} exceeded the buffer limit ({} > {} bytes), dropping connection",
                key.client_id, buffered, self.config.max_buffer_size
            );
            self.terminate_session(&key);
        }
    }

    fn process_packet(self: &Arc<Self>, key: SessionKey, packet: &[u8]) {
        let (state, session_locale, session_token, authentication_required) = {
            let sessions = self.sessions.lock();
            match sessions.get(&key) {
                Some(session) if session.state() != SessionState::Terminated => (
                    session.state(),
                    session.locale().to_string(),
                    session.token().map(str::to_string),
                    session.transport().configuration().authentication_enabled,
                ),
                _ => return,
            }
        };
        debug!("Incoming data from {}: {}", key.client_id, String::from_utf8_lossy(packet));

        let request = match JsonRpcRequest::decode(packet) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to decode message from {}: {}", key.client_id, e);
                let (id, err) = e.to_rpc_error();
                self.send_error(&key, id, err);
                return;
            }
        };
        let id = request.id;

        let Some((namespace, method)) = request.split_method() else {
            self.send_error(&key, id, RpcError::invalid_method(&request.method));
            return;
        };
        let full_name = request.method.clone();
        let is_hello = namespace == JSONRPC_NAMESPACE && method == "Hello";

        if state == SessionState::AwaitingHandshake && !is_hello {
            warn!("Client {} called {} before Hello, dropping connection", key.client_id, full_name);
            self.send_error(&key, id, RpcError::handshake_required());
            self.terminate_session(&key);
            return;
        }

        let Some(registered) = self.handlers.get(namespace) else {
            self.send_error(&key, id, RpcError::no_such_namespace(namespace));
            return;
        };
        let Some(method_spec) = self.api.method(&full_name) else {
            self.send_error(&key, id, RpcError::no_such_method(&full_name));
            return;
        };
        let Some(callback) = registered.methods.get(method) else {
            error!("Method {} is declared but has no callback", full_name);
            self.send_error(&key, id, RpcError::internal());
            return;
        };

        let hello_token = if is_hello {
            request.params.get("token").and_then(Value::as_str).map(str::to_string)
        } else {
            None
        };
        let token = hello_token.or_else(|| request.token.clone()).or(session_token);
        let identity = token.as_deref().and_then(|t| self.user_manager.verify_token(t));

        if authentication_required {
            if let Err(err) = self.check_authentication(namespace, method, identity.as_ref()) {
                warn!("Unauthorized call to {} from client {}", full_name, key.client_id);
                self.send_error(&key, id, err);
                self.lockdown.register_failure();
                self.terminate_session(&key);
                return;
            }
            if let Some(info) = &identity {
                if !scopes_permit(&info.scopes, method_spec.permission_scope) {
                    warn!(
                        "User {} lacks {} for {}",
                        info.username, method_spec.permission_scope, full_name
                    );
                    self.send_error(&key, id, RpcError::permission_denied());
                    return;
                }
            }
        }

        let validation = JsonValidator::new(&self.api).validate_params(&full_name, &request.params);
        if !validation.success {
            debug!("Invalid params for {}: {} in {}", full_name, validation.error_string, validation.path);
            self.send_error(&key, id, RpcError::invalid_params(&validation.error_string, &validation.path));
            return;
        }

        if self.tracker.is_pending(&PendingCallKey::new(key, id)) {
            self.send_error(&key, id, RpcError::duplicate_command_id(id));
            return;
        }

        let locale = if is_hello {
            let locale = request
                .params
                .get("locale")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| request.locale.clone())
                .unwrap_or(session_locale);
            let verified_token = identity.as_ref().and(token.clone());
            self.activate_session(&key, locale.clone(), verified_token, identity.clone());
            locale
        } else {
            request.locale.clone().unwrap_or(session_locale)
        };

        let context = CallContext::new(
            self,
            key,
            id,
            &locale,
            token.as_deref(),
            identity.as_ref(),
            authentication_required,
        );
        debug!("Invoking {} for client {}", full_name, key.client_id);
        let reply = callback(&request.params, &context);
        let drop_requested = context.connection_drop_requested();

        match reply {
            HandlerReply::Sync(data) => self.send_reply(&key, id, &full_name, data),
            HandlerReply::Async(pending) => self.track_async_reply(key, id, full_name, pending),
        }
        if drop_requested {
            self.terminate_session(&key);
        }
    }

    fn check_authentication(&self, namespace: &str, method: &str, identity: Option<&TokenInfo>) -> Result<(), RpcError> {
        if identity.is_some() {
            return Ok(());
        }
        let setup = self.user_manager.initial_setup_required();
        let allowed: &[&str] = if setup { &SETUP_METHODS } else { &LOGIN_METHODS };
        if namespace == JSONRPC_NAMESPACE && allowed.contains(&method) {
            return Ok(());
        }
        Err(if setup {
            RpcError::initial_setup_required()
        } else {
            RpcError::invalid_token()
        })
    }

    fn activate_session(&self, key: &SessionKey, locale: String, token: Option<String>, identity: Option<TokenInfo>) {
        self.handshake_timeouts.cancel_timeout(key);
        if let Some(session) = self.sessions.lock().get_mut(key) {
            if session.state() == SessionState::AwaitingHandshake {
                info!("Client {} completed handshake (locale {})", key.client_id, locale);
            }
            session.activate(locale, token, identity);
        }
    }

    fn track_async_reply(self: &Arc<Self>, key: SessionKey, id: i64, method: String, pending: AsyncReply) {
        let call_key = PendingCallKey::new(key, id);
        if let Err(e) = self.tracker.track_call(call_key, &method) {
            warn!("Cannot track {} for client {}: {}", method, key.client_id, e);
            self.send_error(&key, id, RpcError::error(e.to_string()));
            return;
        }

        let server = Arc::clone(self);
        let timeout = self.config.async_reply_timeout;
        let waiter = tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, pending.into_receiver()).await;
            let Some(call) = server.tracker.complete_call(&call_key) else {
                return;
            };
            match outcome {
                Ok(Ok(data)) => {
                    debug!("Async reply for {} ready after {:?}", call.method, call.elapsed());
                    server.send_reply(&key, id, &method, data);
                }
                Ok(Err(_)) => {
                    error!("Handler dropped the reply of {} without finishing it", method);
                    server.send_error(&key, id, RpcError::internal());
                }
                Err(_) => {
                    warn!("{} timed out after {:?}", method, timeout);
                    server.send_error(&key, id, RpcError::timed_out());
                }
            }
        });
        self.tracker.attach_waiter(&call_key, waiter);
    }

    fn send_reply(&self, key: &SessionKey, id: i64, method: &str, data: JsonMap) {
        let validation = JsonValidator::new(&self.api).validate_returns(method, &data);
        let response = if validation.success {
            let deprecation = self.api.method(method).and_then(|m| m.deprecation.clone());
            JsonRpcResponse::success(id, data).with_deprecation_warning(deprecation)
        } else {
            error!(
                "Reply of {} violates its schema: {} in {} ({})",
                method,
                validation.error_string,
                validation.path,
                Value::Object(data)
            );
            JsonRpcResponse::from_error(id, RpcError::invalid_reply())
        };
        self.send_response(key, &response);
    }

    fn send_error(&self, key: &SessionKey, id: i64, error: RpcError) {
        self.send_response(key, &JsonRpcResponse::from_error(id, error));
    }

    fn send_response(&self, key: &SessionKey, response: &JsonRpcResponse) {
        let transport = {
            let sessions = self.sessions.lock();
            match sessions.get(key) {
                Some(session) if session.state() != SessionState::Terminated => session.transport(),
                _ => {
                    debug!("Dropping response {} for closed client {}", response.id, key.client_id);
                    return;
                }
            }
        };
        transport.send_data(key.client_id, &response.encode());
    }

    /// Mark the session terminated and ask its transport to close it.
    /// Cleanup happens when the transport reports the disconnect.
    fn terminate_session(&self, key: &SessionKey) {
        self.handshake_timeouts.cancel_timeout(key);
        let transport = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(key) {
                Some(session) => session.terminate().then(|| session.transport()),
                None => None,
            }
        };
        if let Some(transport) = transport {
            transport.terminate_client_connection(key.client_id);
        }
    }

    fn deliver_notification(&self, event: NotificationEvent) {
        let full_name = format!("{}.{}", event.handler, event.event);
        let (Some(spec), Some(registered)) = (self.api.notification(&full_name), self.handlers.get(&event.handler))
        else {
            error!("Dropping unknown notification {}", full_name);
            return;
        };
        let id = self.notifier.next_id();

        let recipients: Vec<(ClientId, Arc<dyn TransportInterface>, String)> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.is_active())
            .filter(|s| match event.target {
                Some(target) => s.key() == target,
                None => s.is_subscribed(&event.handler),
            })
            .map(|s| (s.key().client_id, s.transport(), s.locale().to_string()))
            .collect();
        if recipients.is_empty() {
            return;
        }

        let validator = JsonValidator::new(&self.api);
        let mut encoded: HashMap<String, Option<Vec<u8>>> = HashMap::new();
        for (client_id, transport, locale) in recipients {
            let bytes = encoded.entry(locale).or_insert_with_key(|locale| {
                let params = registered
                    .handler
                    .translate_notification(&event.event, event.params.clone(), locale);
                let validation = validator.validate_notification_params(&full_name, &params);
                if !validation.success {
                    error!(
                        "Notification {} violates its schema: {} in {} ({})",
                        full_name,
                        validation.error_string,
                        validation.path,
                        Value::Object(params)
                    );
                    return None;
                }
                let notification = JsonRpcNotification {
                    id,
                    notification: full_name.clone(),
                    params,
                    deprecation_warning: spec.deprecation.clone(),
                };
                Some(notification.encode())
            });
            if let Some(bytes) = bytes {
                transport.send_data(client_id, bytes);
            }
        }
    }
}
