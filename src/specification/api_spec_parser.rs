use crate::specification::model_registry::{
    BasicType, FieldMap, HandlerDescriptor, MethodSpec, NotificationSpec, PermissionScope, TypeRef,
    REF_PREFIX,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaParseError {
    #[error("Unknown type '{0}'")]
    UnknownType(String),

    #[error("List types need exactly one element type, got {0}")]
    InvalidList(usize),

    #[error("Unsupported schema node: {0}")]
    UnsupportedNode(String),

    #[error("Invalid permission scope '{0}'")]
    InvalidPermissionScope(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for SchemaParseError {
    fn from(err: serde_json::Error) -> Self {
        SchemaParseError::Json(err.to_string())
    }
}

/// Converts between the JSON schema notation and the typed schema model.
///
/// The notation is the one clients see through introspection:
/// basic types by name, `"$ref:Name"` for named types, `[X]` for lists
/// and nested maps for inline objects.
pub struct ApiSpecParser;

impl ApiSpecParser {
    /// Parse a single schema node
    pub fn parse_type(value: &Value) -> Result<TypeRef, SchemaParseError> {
        match value {
            Value::String(name) => {
                if let Some(reference) = name.strip_prefix(REF_PREFIX) {
                    Ok(TypeRef::reference(reference))
                } else {
                    BasicType::from_name(name)
                        .map(TypeRef::basic)
                        .ok_or_else(|| SchemaParseError::UnknownType(name.clone()))
                }
            }
            Value::Array(items) => {
                if items.len() != 1 {
                    return Err(SchemaParseError::InvalidList(items.len()));
                }
                Ok(TypeRef::list_of(Self::parse_type(&items[0])?))
            }
            Value::Object(_) => Ok(TypeRef::object(Self::parse_field_map(value)?)),
            other => Err(SchemaParseError::UnsupportedNode(other.to_string())),
        }
    }

    /// Parse a `{key: type}` map, keeping key modifiers
    pub fn parse_field_map(value: &Value) -> Result<FieldMap, SchemaParseError> {
        let object = value
            .as_object()
            .ok_or_else(|| SchemaParseError::UnsupportedNode(value.to_string()))?;
        let mut fields = FieldMap::new();
        for (raw_key, node) in object {
            fields.insert(raw_key, Self::parse_type(node)?);
        }
        Ok(fields)
    }

    pub fn type_to_json(type_ref: &TypeRef) -> Value {
        match type_ref {
            TypeRef::Basic(basic) => Value::String(basic.as_str().to_string()),
            TypeRef::Ref(name) => Value::String(format!("{}{}", REF_PREFIX, name)),
            TypeRef::List(element) => Value::Array(vec![Self::type_to_json(element)]),
            TypeRef::Object(fields) => Self::field_map_to_json(fields),
        }
    }

    pub fn field_map_to_json(fields: &FieldMap) -> Value {
        let mut map = Map::new();
        for field in fields.iter() {
            map.insert(field.key.to_raw(), Self::type_to_json(&field.type_ref));
        }
        Value::Object(map)
    }

    pub fn method_to_json(method: &MethodSpec) -> Value {
        let mut value = json!({
            "description": method.description,
            "params": Self::field_map_to_json(&method.params),
            "returns": Self::field_map_to_json(&method.returns),
            "permissionScope": method.permission_scope.as_str(),
        });
        if let (Some(text), Some(map)) = (&method.deprecation, value.as_object_mut()) {
            map.insert("deprecated".to_string(), Value::String(text.clone()));
        }
        value
    }

    pub fn notification_to_json(notification: &NotificationSpec) -> Value {
        let mut value = json!({
            "description": notification.description,
            "params": Self::field_map_to_json(&notification.params),
        });
        if let (Some(text), Some(map)) = (&notification.deprecation, value.as_object_mut()) {
            map.insert("deprecated".to_string(), Value::String(text.clone()));
        }
        value
    }

    /// Build a descriptor from its notation form:
    /// `{enums, flags, types, methods, notifications}`, all optional.
    pub fn descriptor_from_value(name: &str, value: &Value) -> Result<HandlerDescriptor, SchemaParseError> {
        let root = value
            .as_object()
            .ok_or_else(|| SchemaParseError::InvalidDescriptor("root must be an object".to_string()))?;
        let mut descriptor = HandlerDescriptor::new(name);

        for (enum_name, values) in Self::section(root, "enums")? {
            let values = values
                .as_array()
                .ok_or_else(|| SchemaParseError::InvalidDescriptor(format!("enum {} must be a list", enum_name)))?
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        SchemaParseError::InvalidDescriptor(format!("enum {} has a non-string value", enum_name))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            descriptor.enums.insert(enum_name.clone(), values);
        }

        for (flag_name, node) in Self::section(root, "flags")? {
            let enum_ref = match node {
                Value::Array(items) if items.len() == 1 => items[0].as_str(),
                Value::String(s) => Some(s.as_str()),
                _ => None,
            }
            .and_then(|s| s.strip_prefix(REF_PREFIX))
            .ok_or_else(|| SchemaParseError::InvalidDescriptor(format!("flag {} must reference an enum", flag_name)))?;
            descriptor.flags.insert(flag_name.clone(), enum_ref.to_string());
        }

        for (object_name, node) in Self::section(root, "types")? {
            descriptor
                .objects
                .insert(object_name.clone(), Self::parse_field_map(node)?);
        }

        for (method_name, node) in Self::section(root, "methods")? {
            let mut method = MethodSpec::new(Self::string_member(node, "description").unwrap_or_default());
            if let Some(params) = node.get("params") {
                method.params = Self::parse_field_map(params)?;
            }
            if let Some(returns) = node.get("returns") {
                method.returns = Self::parse_field_map(returns)?;
            }
            if let Some(scope) = Self::string_member(node, "permissionScope") {
                method.permission_scope = PermissionScope::from_name(&scope)
                    .ok_or(SchemaParseError::InvalidPermissionScope(scope))?;
            }
            method.deprecation = Self::string_member(node, "deprecated");
            descriptor.methods.insert(method_name.clone(), method);
        }

        for (notification_name, node) in Self::section(root, "notifications")? {
            let mut notification =
                NotificationSpec::new(Self::string_member(node, "description").unwrap_or_default());
            if let Some(params) = node.get("params") {
                notification.params = Self::parse_field_map(params)?;
            }
            notification.deprecation = Self::string_member(node, "deprecated");
            descriptor
                .notifications
                .insert(notification_name.clone(), notification);
        }

        Ok(descriptor)
    }

    pub fn descriptor_from_json(name: &str, json_str: &str) -> Result<HandlerDescriptor, SchemaParseError> {
        let value: Value = serde_json::from_str(json_str)?;
        Self::descriptor_from_value(name, &value)
    }

    #[cfg(feature = "yaml-support")]
    pub fn descriptor_from_yaml(name: &str, yaml_str: &str) -> Result<HandlerDescriptor, SchemaParseError> {
        let value: Value = serde_yaml::from_str(yaml_str)
            .map_err(|e| SchemaParseError::InvalidDescriptor(e.to_string()))?;
        Self::descriptor_from_value(name, &value)
    }

    fn section<'a>(root: &'a Map<String, Value>, key: &str) -> Result<Vec<(&'a String, &'a Value)>, SchemaParseError> {
        match root.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Object(map)) => Ok(map.iter().collect()),
            Some(_) => Err(SchemaParseError::InvalidDescriptor(format!("'{}' must be an object", key))),
        }
    }

    fn string_member(node: &Value, key: &str) -> Option<String> {
        node.get(key).and_then(Value::as_str).map(str::to_string)
    }
}
