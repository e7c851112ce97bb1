pub mod api_spec_parser;
pub mod json_validator;
pub mod model_registry;
pub mod schema_registry;

pub use api_spec_parser::{ApiSpecParser, SchemaParseError};
pub use json_validator::{JsonValidator, ValidationMode, ValidationResult};
pub use model_registry::{
    scopes_permit, BasicType, Field, FieldKey, FieldMap, HandlerDescriptor, MethodSpec, NotificationSpec,
    PermissionScope, TypeRef, REF_PREFIX,
};
pub use schema_registry::{ApiSchema, NamedType};
