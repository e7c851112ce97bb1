use thiserror::Error;

/// Reasons a handler descriptor is refused by the schema registry.
///
/// Every variant names the handler whose registration failed; the live
/// schema is left untouched whenever one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Enum {name} is already registered with different values. Not registering handler {handler}")]
    EnumConflict { handler: String, name: String },

    #[error("Flag {name} is already registered with a different enum. Not registering handler {handler}")]
    FlagConflict { handler: String, name: String },

    #[error("Flag {name} clashes with an enum of the same name. Not registering handler {handler}")]
    FlagEnumNameClash { handler: String, name: String },

    #[error("Object {name} is already registered with different fields. Not registering handler {handler}")]
    ObjectConflict { handler: String, name: String },

    #[error("Type name {name} is already used by another kind of type. Not registering handler {handler}")]
    TypeNameClash { handler: String, name: String },

    #[error("Invalid reference '{reference}' in {location}. Not registering handler {handler}")]
    UnresolvedReference {
        handler: String,
        location: String,
        reference: String,
    },

    #[error("Method {method} is declared but has no implementation. Not registering handler {handler}")]
    MethodNotImplemented { handler: String, method: String },

    #[error("Namespace {handler} is already registered")]
    NamespaceConflict { handler: String },

    #[error("Invalid schema for handler {handler}: {reason}")]
    InvalidSchema { handler: String, reason: String },
}

impl RegistrationError {
    /// Name of the handler whose registration was refused
    pub fn handler(&self) -> &str {
        match self {
            RegistrationError::EnumConflict { handler, .. }
            | RegistrationError::FlagConflict { handler, .. }
            | RegistrationError::FlagEnumNameClash { handler, .. }
            | RegistrationError::ObjectConflict { handler, .. }
            | RegistrationError::TypeNameClash { handler, .. }
            | RegistrationError::UnresolvedReference { handler, .. }
            | RegistrationError::MethodNotImplemented { handler, .. }
            | RegistrationError::NamespaceConflict { handler }
            | RegistrationError::InvalidSchema { handler, .. } => handler,
        }
    }
}
