pub mod registration_error;
pub mod rpc_error;
pub mod transport_error;

pub use registration_error::RegistrationError;
pub use rpc_error::{ResponseStatus, RpcError};
pub use transport_error::{ConfigError, TransportError};
