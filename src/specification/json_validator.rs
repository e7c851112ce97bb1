/*!
 * JSON validator for the merged API schema.
 * Checks inbound params, outbound returns and notification params and
 * reports the first failure together with the dotted path of the field.
 */

use crate::specification::model_registry::{BasicType, FieldMap, TypeRef};
use crate::specification::schema_registry::{ApiSchema, NamedType};
use crate::utils::color::parse_color;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use uuid::Uuid;

/// `HH:MM`, 24 hour clock
static TIME_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^([01][0-9]|2[0-3]):[0-5][0-9]$").ok());

/// Whether the value travels from client to server or the other way
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Inbound params: read-only fields are not required
    Write,
    /// Outbound returns and notifications
    Read,
}

/// Outcome of a validation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub success: bool,
    pub error_string: String,
    pub path: String,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_string: String::new(),
            path: String::new(),
        }
    }

    pub fn failure<S: Into<String>>(error: S) -> Self {
        Self {
            success: false,
            error_string: error.into(),
            path: String::new(),
        }
    }

    /// Prefix the failure path with the key of the enclosing field
    fn within(mut self, key: &str) -> Self {
        if !self.success {
            self.path = if self.path.is_empty() {
                key.to_string()
            } else {
                format!("{}.{}", key, self.path)
            };
        }
        self
    }
}

/// Stateless validator over an immutable [`ApiSchema`]
#[derive(Debug, Clone, Copy)]
pub struct JsonValidator<'a> {
    api: &'a ApiSchema,
}

impl<'a> JsonValidator<'a> {
    pub fn new(api: &'a ApiSchema) -> Self {
        Self { api }
    }

    /// Validate request params of `Namespace.Method`
    pub fn validate_params(&self, method: &str, params: &Map<String, Value>) -> ValidationResult {
        match self.api.method(method) {
            Some(spec) => self.validate_map(params, &spec.params, ValidationMode::Write),
            None => ValidationResult::failure(format!("No such method: {}", method)),
        }
    }

    /// Validate the reply data of `Namespace.Method`
    pub fn validate_returns(&self, method: &str, returns: &Map<String, Value>) -> ValidationResult {
        match self.api.method(method) {
            Some(spec) => self.validate_map(returns, &spec.returns, ValidationMode::Read),
            None => ValidationResult::failure(format!("No such method: {}", method)),
        }
    }

    pub fn validate_notification_params(&self, notification: &str, params: &Map<String, Value>) -> ValidationResult {
        match self.api.notification(notification) {
            Some(spec) => self.validate_map(params, &spec.params, ValidationMode::Read),
            None => ValidationResult::failure(format!("No such notification: {}", notification)),
        }
    }

    pub fn validate_map(&self, map: &Map<String, Value>, definition: &FieldMap, mode: ValidationMode) -> ValidationResult {
        for field in definition.iter() {
            let key = &field.key;
            match map.get(&key.name) {
                Some(value) => {
                    let result = self.validate_entry(value, &field.type_ref, mode);
                    if !result.success {
                        return result.within(&key.name);
                    }
                }
                None => {
                    if key.optional || (key.read_only && mode == ValidationMode::Write) {
                        continue;
                    }
                    return ValidationResult::failure("Missing required key").within(&key.name);
                }
            }
        }

        if let Some(unknown) = map.keys().find(|name| definition.get(name).is_none()) {
            return ValidationResult::failure("Unexpected field").within(unknown);
        }

        ValidationResult::ok()
    }

    pub fn validate_entry(&self, value: &Value, definition: &TypeRef, mode: ValidationMode) -> ValidationResult {
        match definition {
            TypeRef::Basic(basic) => Self::validate_basic(value, *basic),
            TypeRef::Ref(name) => self.validate_named(value, name, mode),
            TypeRef::List(element) => {
                let Some(items) = value.as_array() else {
                    return ValidationResult::failure("Expected list");
                };
                for (index, item) in items.iter().enumerate() {
                    let result = self.validate_entry(item, element, mode);
                    if !result.success {
                        return result.within(&index.to_string());
                    }
                }
                ValidationResult::ok()
            }
            TypeRef::Object(fields) => match value.as_object() {
                Some(map) => self.validate_map(map, fields, mode),
                None => ValidationResult::failure("Expected object"),
            },
        }
    }

    fn validate_named(&self, value: &Value, name: &str, mode: ValidationMode) -> ValidationResult {
        match self.api.named_type(name) {
            Some(NamedType::Enum(values)) => Self::validate_enum_value(value, name, values),
            Some(NamedType::Flag(enum_name)) => {
                let Some(items) = value.as_array() else {
                    return ValidationResult::failure(format!("Expected list of {}", enum_name));
                };
                let Some(NamedType::Enum(values)) = self.api.named_type(enum_name) else {
                    return ValidationResult::failure(format!("Invalid flag reference: {}", enum_name));
                };
                for (index, item) in items.iter().enumerate() {
                    let result = Self::validate_enum_value(item, enum_name, values);
                    if !result.success {
                        return result.within(&index.to_string());
                    }
                }
                ValidationResult::ok()
            }
            Some(NamedType::Object(fields)) => match value.as_object() {
                Some(map) => self.validate_map(map, fields, mode),
                None => ValidationResult::failure(format!("Expected object {}", name)),
            },
            None => ValidationResult::failure(format!("Unknown type reference: {}", name)),
        }
    }

    fn validate_enum_value(value: &Value, enum_name: &str, values: &[String]) -> ValidationResult {
        match value.as_str() {
            Some(s) if values.iter().any(|v| v == s) => ValidationResult::ok(),
            _ => ValidationResult::failure(format!("Expected enum value of {} but got {}", enum_name, value)),
        }
    }

    fn validate_basic(value: &Value, basic: BasicType) -> ValidationResult {
        let valid = match basic {
            BasicType::Variant => true,
            BasicType::String => value.is_string(),
            BasicType::Bool => value.is_boolean(),
            BasicType::Object => value.is_object(),
            BasicType::StringList => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
            BasicType::Double => value.is_number(),
            BasicType::Int => value.as_i64().is_some() || Self::integral_f64(value, i64::MIN as f64, i64::MAX as f64),
            BasicType::Uint => value.as_u64().is_some() || Self::integral_f64(value, 0.0, u64::MAX as f64),
            BasicType::Uuid => value
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(|uuid| !uuid.is_nil())
                .unwrap_or(false),
            BasicType::Color => value.as_str().and_then(parse_color).is_some(),
            BasicType::Time => value.as_str().map(Self::is_time).unwrap_or(false),
        };
        if valid {
            ValidationResult::ok()
        } else {
            ValidationResult::failure(format!("Invalid {}: {}", basic, value))
        }
    }

    fn is_time(s: &str) -> bool {
        TIME_PATTERN.as_ref().is_some_and(|pattern| pattern.is_match(s))
    }

    fn integral_f64(value: &Value, min: f64, max: f64) -> bool {
        value
            .as_f64()
            .map(|f| f.fract() == 0.0 && f >= min && f <= max)
            .unwrap_or(false)
    }
}
