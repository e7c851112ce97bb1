//! JSON-RPC dispatcher
//!
//! Sessions, handler registration, the built-in `JSONRPC` namespace and
//! notification delivery.

pub mod client_session;
pub mod json_handler;
pub mod json_rpc_server;
pub mod jsonrpc_handler;
pub mod lockdown;
pub mod notifier;

pub use client_session::{ClientSession, SessionState};
pub use json_handler::{
    cache_hash, AsyncReply, CallContext, Experience, HandlerReply, JsonHandler, JsonMap, MethodCallback, MethodTable,
    ReplyHandle,
};
pub use json_rpc_server::{JsonRpcServer, JsonRpcServerBuilder};
pub use jsonrpc_handler::{JsonRpcHandler, JSONRPC_NAMESPACE, PROTOCOL_VERSION};
pub use lockdown::LockdownState;
pub use notifier::{NotificationEvent, Notifier};
