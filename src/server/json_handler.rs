use crate::core::transport::{ClientId, SessionKey};
use crate::server::json_rpc_server::JsonRpcServer;
use crate::specification::model_registry::HandlerDescriptor;
use crate::users::TokenInfo;
use log::debug;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Params, returns and notification payloads
pub type JsonMap = Map<String, Value>;

/// Completes an asynchronous reply. Dropping it unfinished makes the
/// dispatcher answer with an internal error.
#[derive(Debug)]
pub struct ReplyHandle {
    sender: oneshot::Sender<JsonMap>,
}

impl ReplyHandle {
    pub fn finish(self, data: JsonMap) {
        if self.sender.send(data).is_err() {
            debug!("Reply finished after the call was already answered");
        }
    }
}

/// Pending side of an asynchronous reply
#[derive(Debug)]
pub struct AsyncReply {
    receiver: oneshot::Receiver<JsonMap>,
}

impl AsyncReply {
    pub(crate) fn into_receiver(self) -> oneshot::Receiver<JsonMap> {
        self.receiver
    }
}

/// What a method callback hands back to the dispatcher
#[derive(Debug)]
pub enum HandlerReply {
    Sync(JsonMap),
    Async(AsyncReply),
}

impl HandlerReply {
    pub fn create_reply(data: JsonMap) -> Self {
        HandlerReply::Sync(data)
    }

    /// A reply that is completed later through the returned handle
    pub fn create_async_reply() -> (Self, ReplyHandle) {
        let (sender, receiver) = oneshot::channel();
        (HandlerReply::Async(AsyncReply { receiver }), ReplyHandle { sender })
    }

    /// Spawn `future` on the runtime and reply with its output
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = JsonMap> + Send + 'static,
    {
        let (reply, handle) = Self::create_async_reply();
        tokio::spawn(async move {
            handle.finish(future.await);
        });
        reply
    }
}

/// Per-call information passed to method callbacks
pub struct CallContext<'a> {
    pub(crate) server: &'a JsonRpcServer,
    session: SessionKey,
    command_id: i64,
    locale: &'a str,
    token: Option<&'a str>,
    identity: Option<&'a TokenInfo>,
    authentication_required: bool,
    drop_connection: Cell<bool>,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(
        server: &'a JsonRpcServer,
        session: SessionKey,
        command_id: i64,
        locale: &'a str,
        token: Option<&'a str>,
        identity: Option<&'a TokenInfo>,
        authentication_required: bool,
    ) -> Self {
        Self {
            server,
            session,
            command_id,
            locale,
            token,
            identity,
            authentication_required,
            drop_connection: Cell::new(false),
        }
    }

    pub fn session(&self) -> SessionKey {
        self.session
    }

    pub fn client_id(&self) -> ClientId {
        self.session.client_id
    }

    pub fn command_id(&self) -> i64 {
        self.command_id
    }

    /// Locale of the request, falling back to the one chosen at `Hello`
    pub fn locale(&self) -> &str {
        self.locale
    }

    pub fn token(&self) -> Option<&str> {
        self.token
    }

    /// The verified owner of the token, if any
    pub fn identity(&self) -> Option<&TokenInfo> {
        self.identity
    }

    pub fn authentication_required(&self) -> bool {
        self.authentication_required
    }

    /// Close the connection once the reply of this call has been sent
    pub fn request_connection_drop(&self) {
        self.drop_connection.set(true);
    }

    pub(crate) fn connection_drop_requested(&self) -> bool {
        self.drop_connection.get()
    }
}

pub type MethodCallback = Arc<dyn Fn(&JsonMap, &CallContext<'_>) -> HandlerReply + Send + Sync>;

/// Method name to callback, built once by each handler at registration
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodCallback>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, callback: F)
    where
        F: Fn(&JsonMap, &CallContext<'_>) -> HandlerReply + Send + Sync + 'static,
    {
        self.methods.insert(name.to_string(), Arc::new(callback));
    }

    pub fn get(&self, name: &str) -> Option<&MethodCallback> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// A client-facing capability advertised in `Hello`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experience {
    pub name: String,
    pub version: String,
}

impl Experience {
    pub fn new<S: Into<String>>(name: S, version: S) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// A namespace of methods and notifications.
///
/// The descriptor declares the API; the method table provides one callback
/// per declared method. Registration fails when the two disagree.
pub trait JsonHandler: Send + Sync {
    /// Namespace, equal to `descriptor().name`
    fn name(&self) -> &str;

    fn descriptor(&self) -> HandlerDescriptor;

    fn method_table(self: Arc<Self>) -> MethodTable;

    /// Localise notification params for one recipient locale
    fn translate_notification(&self, _notification: &str, params: JsonMap, _locale: &str) -> JsonMap {
        params
    }

    /// Method name to digest of data that clients may cache
    fn cache_hashes(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn experience(&self) -> Option<Experience> {
        None
    }
}

/// Hex SHA-256 of the compact JSON form of `data`
pub fn cache_hash(data: &Value) -> String {
    let digest = Sha256::digest(data.to_string().as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
