use crate::error::{ResponseStatus, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Id used for responses to messages whose own id could not be read
pub const UNKNOWN_ID: i64 = -1;

/// Why a received blob could not be decoded into a request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("{0}")]
    MalformedJson(String),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing 'id'")]
    MissingId,

    #[error("invalid field '{field}'")]
    InvalidField { id: i64, field: String },
}

impl CodecError {
    /// Id to answer with, and the client-facing error
    pub fn to_rpc_error(&self) -> (i64, RpcError) {
        match self {
            CodecError::MalformedJson(details) => (UNKNOWN_ID, RpcError::parse_error(details)),
            CodecError::NotAnObject => (UNKNOWN_ID, RpcError::parse_error("expected a JSON object")),
            CodecError::MissingId => (UNKNOWN_ID, RpcError::missing_id()),
            CodecError::InvalidField { id, field } => (
                *id,
                RpcError::error(format!("Error parsing command. Invalid '{}'", field)),
            ),
        }
    }
}

/// Inbound call
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: i64,
    pub method: String,
    pub params: Map<String, Value>,
    pub token: Option<String>,
    pub locale: Option<String>,
}

impl JsonRpcRequest {
    pub fn new<S: Into<String>>(id: i64, method: S, params: Map<String, Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            token: None,
            locale: None,
        }
    }

    pub fn with_token<S: Into<String>>(mut self, token: S) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_locale<S: Into<String>>(mut self, locale: S) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// Splits `Namespace.Method`; `None` unless both parts are non-empty
    pub fn split_method(&self) -> Option<(&str, &str)> {
        let (namespace, method) = self.method.split_once('.')?;
        if namespace.is_empty() || method.is_empty() || method.contains('.') {
            return None;
        }
        Some((namespace, method))
    }

    /// Decode one framed message
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedJson(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(CodecError::NotAnObject);
        };

        let id = match object.get("id") {
            None | Some(Value::Null) => return Err(CodecError::MissingId),
            Some(id) => id
                .as_i64()
                .or_else(|| id.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .ok_or(CodecError::MissingId)?,
        };

        let invalid = |field: &str| CodecError::InvalidField { id, field: field.to_string() };

        let method = match object.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err(invalid("method")),
        };
        let params = match object.remove("params") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(params)) => params,
            Some(_) => return Err(invalid("params")),
        };
        let token = Self::optional_string(&mut object, "token").map_err(|_| invalid("token"))?;
        let locale = Self::optional_string(&mut object, "locale").map_err(|_| invalid("locale"))?;

        Ok(Self {
            id,
            method,
            params,
            token,
            locale,
        })
    }

    /// Encode as a client would send it
    pub fn encode(&self) -> Vec<u8> {
        let mut object = Map::new();
        object.insert("id".to_string(), Value::from(self.id));
        object.insert("method".to_string(), Value::String(self.method.clone()));
        object.insert("params".to_string(), Value::Object(self.params.clone()));
        if let Some(token) = &self.token {
            object.insert("token".to_string(), Value::String(token.clone()));
        }
        if let Some(locale) = &self.locale {
            object.insert("locale".to_string(), Value::String(locale.clone()));
        }
        frame(&Value::Object(object))
    }

    fn optional_string(object: &mut Map<String, Value>, key: &str) -> Result<Option<String>, ()> {
        match object.remove(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(()),
        }
    }
}

/// Reply to a request, correlated by `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcResponse {
    pub id: i64,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecation_warning: Option<String>,
}

impl JsonRpcResponse {
    pub fn success(id: i64, params: Map<String, Value>) -> Self {
        Self {
            id,
            status: ResponseStatus::Success,
            params: Some(params),
            error: None,
            deprecation_warning: None,
        }
    }

    pub fn from_error(id: i64, error: RpcError) -> Self {
        Self {
            id,
            status: error.status,
            params: None,
            error: Some(error.message),
            deprecation_warning: None,
        }
    }

    pub fn with_deprecation_warning(mut self, warning: Option<String>) -> Self {
        self.deprecation_warning = warning;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_message(self)
    }
}

/// Server-initiated event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcNotification {
    pub id: u64,
    pub notification: String,
    pub params: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecation_warning: Option<String>,
}

impl JsonRpcNotification {
    pub fn encode(&self) -> Vec<u8> {
        encode_message(self)
    }
}

/// Anything the server may receive back from the wire, used by clients and tests
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl ServerMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedJson(e.to_string()))
    }
}

fn encode_message<T: Serialize>(message: &T) -> Vec<u8> {
    match serde_json::to_value(message) {
        Ok(value) => frame(&value),
        Err(_) => Vec::new(),
    }
}

/// Compact JSON followed by the newline message separator
fn frame(value: &Value) -> Vec<u8> {
    let mut bytes = value.to_string().into_bytes();
    bytes.push(b'\n');
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_request() {
        let request = JsonRpcRequest::decode(
            br#"{"id": 3, "method": "JSONRPC.Hello", "params": {"locale": "de_DE"}, "token": "abc"}"#,
        )
        .unwrap();
        assert_eq!(request.id, 3);
        assert_eq!(request.split_method(), Some(("JSONRPC", "Hello")));
        assert_eq!(request.token.as_deref(), Some("abc"));
        assert_eq!(request.locale, None);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(JsonRpcRequest::decode(b"{nope"), Err(CodecError::MalformedJson(_))));
        assert_eq!(JsonRpcRequest::decode(b"[1]"), Err(CodecError::NotAnObject));
        assert_eq!(JsonRpcRequest::decode(br#"{"method": "A.b"}"#), Err(CodecError::MissingId));
        assert_eq!(
            JsonRpcRequest::decode(br#"{"id": 4, "method": "A.b", "params": []}"#),
            Err(CodecError::InvalidField { id: 4, field: "params".to_string() })
        );
    }

    #[test]
    fn test_missing_params_is_empty() {
        let request = JsonRpcRequest::decode(br#"{"id": 1, "method": "JSONRPC.Introspect"}"#).unwrap();
        assert!(request.params.is_empty());
    }

    #[test]
    fn test_split_method() {
        let mut request = JsonRpcRequest::new(1, "Things", Map::new());
        assert_eq!(request.split_method(), None);
        request.method = "Things.".to_string();
        assert_eq!(request.split_method(), None);
        request.method = "A.B.C".to_string();
        assert_eq!(request.split_method(), None);
    }

    #[test]
    fn test_response_encoding() {
        let response = JsonRpcResponse::from_error(7, RpcError::permission_denied())
            .with_deprecation_warning(Some("old".to_string()));
        let bytes = response.encode();
        assert_eq!(bytes.last(), Some(&b'\n'));
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"id": 7, "status": "error", "error": "Permission denied", "deprecationWarning": "old"})
        );
    }

    #[test]
    fn test_server_message_decoding() {
        let notification = JsonRpcNotification {
            id: 9,
            notification: "Things.ThingAdded".to_string(),
            params: Map::new(),
            deprecation_warning: None,
        };
        match ServerMessage::decode(&notification.encode()).unwrap() {
            ServerMessage::Notification(n) => assert_eq!(n.id, 9),
            other => panic!("unexpected {:?}", other),
        }
        let response = JsonRpcResponse::success(2, Map::new());
        assert!(matches!(ServerMessage::decode(&response.encode()).unwrap(), ServerMessage::Response(_)));
    }
}
