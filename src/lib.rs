//! # rust-hub-rpc
//!
//! Schema-validated JSON-RPC engine for home-automation hubs.
//!
//! Clients connect over TCP or TLS, say `JSONRPC.Hello` and then call
//! `Namespace.Method` on registered handlers. Every call is checked against
//! the merged API schema before it reaches a handler, and every reply and
//! notification is checked again on the way out.
//!
//! ## Features
//!
//! - **Schema registry**: handlers declare enums, flags, objects, methods and notifications
//! - **Validation**: typed params and returns with dotted error paths
//! - **Sessions**: handshake deadline, per-client locale and notification subscriptions
//! - **Authentication**: tokens, permission scopes, push-button pairing and lockdown
//! - **Async replies**: handlers may answer later, with a configurable timeout
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_hub_rpc::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::default();
//!     let users = Arc::new(InMemoryUserManager::new());
//!
//!     let mut builder = JsonRpcServerBuilder::new(config.clone(), users)?;
//!     let things = ThingsHandler::new(builder.notifier())?;
//!     builder.register_handler(things)?;
//!     let server = builder.build();
//!
//!     let tcp = Arc::new(TcpServer::new(TransportConfig::default())?);
//!     let sink = server.register_transport(tcp.clone());
//!     server.start();
//!     tcp.start_server(sink).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod server;
pub mod specification;
pub mod users;
pub mod utils;

// Transport layer
pub use crate::core::{SessionKey, TcpServer, TransportEvent, TransportEventSink, TransportInterface};

// Wire protocol
pub use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageFraming, ServerMessage};

// Dispatcher
pub use crate::server::{
    CallContext, HandlerReply, JsonHandler, JsonMap, JsonRpcServer, JsonRpcServerBuilder, MethodTable, Notifier,
    ReplyHandle,
};

// Schema
pub use crate::specification::{
    ApiSchema, ApiSpecParser, BasicType, FieldMap, HandlerDescriptor, JsonValidator, MethodSpec, NotificationSpec,
    PermissionScope, TypeRef, ValidationResult,
};

pub use crate::config::{ServerConfig, TransportConfig};
pub use crate::error::{ConfigError, RegistrationError, ResponseStatus, RpcError, TransportError};
pub use crate::handlers::ThingsHandler;
pub use crate::users::{InMemoryUserManager, TokenInfo, UserError, UserManager};

// Re-export common dependencies for convenience
pub use serde_json::{json, Value as JsonValue};

/// Prelude module for convenient importing
pub mod prelude {
    pub use crate::{
        json, ApiSchema, CallContext, HandlerDescriptor, HandlerReply, InMemoryUserManager, JsonHandler, JsonMap,
        JsonRpcServer, JsonRpcServerBuilder, JsonValue, MethodSpec, MethodTable, Notifier, PermissionScope,
        RegistrationError, RpcError, ServerConfig, TcpServer, ThingsHandler, TransportConfig, TransportInterface,
        UserManager,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
