use crate::specification::model_registry::PermissionScope;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256, Sha512};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};
use uuid::Uuid;

static USERNAME_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\.+\-@]{3,}$").ok());

/// Result codes of user management calls, as exposed through the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserError {
    NoError,
    BackendError,
    InvalidUserId,
    DuplicateUserId,
    BadPassword,
    TokenNotFound,
    PermissionDenied,
}

impl UserError {
    pub const ALL: [UserError; 7] = [
        UserError::NoError,
        UserError::BackendError,
        UserError::InvalidUserId,
        UserError::DuplicateUserId,
        UserError::BadPassword,
        UserError::TokenNotFound,
        UserError::PermissionDenied,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UserError::NoError => "UserErrorNoError",
            UserError::BackendError => "UserErrorBackendError",
            UserError::InvalidUserId => "UserErrorInvalidUserId",
            UserError::DuplicateUserId => "UserErrorDuplicateUserId",
            UserError::BadPassword => "UserErrorBadPassword",
            UserError::TokenNotFound => "UserErrorTokenNotFound",
            UserError::PermissionDenied => "UserErrorPermissionDenied",
        }
    }

    pub fn enum_values() -> Vec<String> {
        Self::ALL.iter().map(|e| e.as_str().to_string()).collect()
    }
}

/// A verified identity behind a bearer token
#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub id: Uuid,
    pub username: String,
    pub device_name: String,
    pub creation_time: DateTime<Utc>,
    pub scopes: BTreeSet<PermissionScope>,
}

impl TokenInfo {
    /// The `TokenInfo` API object
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.to_string()));
        map.insert("username".to_string(), Value::String(self.username.clone()));
        map.insert("deviceName".to_string(), Value::String(self.device_name.clone()));
        map.insert("creationTime".to_string(), Value::from(self.creation_time.timestamp().max(0) as u64));
        Value::Object(map)
    }
}

/// Outcome of a push button transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushButtonAuthResult {
    pub transaction_id: i32,
    pub success: bool,
    pub token: Option<String>,
}

pub type PushButtonListener = Arc<dyn Fn(PushButtonAuthResult) + Send + Sync>;

/// Identity store consulted by the dispatcher and the `JSONRPC` namespace
pub trait UserManager: Send + Sync {
    /// True while no user exists yet
    fn initial_setup_required(&self) -> bool;

    fn create_user(&self, username: &str, password: &str) -> UserError;

    /// Issue a token for valid credentials
    fn authenticate(&self, username: &str, password: &str, device_name: &str) -> Option<String>;

    fn verify_token(&self, token: &str) -> Option<TokenInfo>;

    fn tokens(&self, username: &str) -> Vec<TokenInfo>;

    fn remove_token(&self, token_id: Uuid) -> UserError;

    fn push_button_auth_available(&self) -> bool;

    /// Start waiting for a button press; returns the transaction id.
    /// A still pending transaction is cancelled first.
    fn request_push_button_auth(&self, device_name: &str) -> i32;

    fn cancel_push_button_auth(&self, transaction_id: i32);

    fn set_push_button_listener(&self, listener: PushButtonListener);
}

struct UserRecord {
    username: String,
    password_hash: String,
    salt: String,
    scopes: BTreeSet<PermissionScope>,
}

struct TokenRecord {
    token: String,
    id: Uuid,
    username: String,
    device_name: String,
    creation_time: DateTime<Utc>,
}

#[derive(Default)]
struct Store {
    users: HashMap<String, UserRecord>,
    tokens: Vec<TokenRecord>,
    push_button: Option<(i32, String)>,
    next_transaction_id: i32,
    listener: Option<PushButtonListener>,
}

/// Volatile user backend.
///
/// The first user becomes administrator. Usernames compare case-insensitively.
/// The user created by push button auth has an empty name and cannot log in
/// with a password.
pub struct InMemoryUserManager {
    store: Mutex<Store>,
    strict_credentials: bool,
    push_button_available: bool,
}

impl InMemoryUserManager {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            strict_credentials: false,
            push_button_available: false,
        }
    }

    /// Require usernames of 3+ safe characters and passwords with 8+ characters
    /// mixing lower case, upper case and digits
    pub fn with_strict_credentials(mut self) -> Self {
        self.strict_credentials = true;
        self
    }

    pub fn with_push_button(mut self, available: bool) -> Self {
        self.push_button_available = available;
        self
    }

    /// Hardware hook: the physical button was pressed
    pub fn push_button_pressed(&self) {
        let (result, listener) = {
            let mut store = self.store.lock();
            let Some((transaction_id, device_name)) = store.push_button.take() else {
                debug!("Push button pressed without a client waiting for it");
                return;
            };
            store.users.entry(String::new()).or_insert_with(|| UserRecord {
                username: String::new(),
                password_hash: String::new(),
                salt: String::new(),
                scopes: [PermissionScope::Admin].into_iter().collect(),
            });
            let token = Self::issue_token(&mut store, "", &device_name);
            info!("Push button auth succeeded for device {}", device_name);
            (
                PushButtonAuthResult { transaction_id, success: true, token: Some(token) },
                store.listener.clone(),
            )
        };
        if let Some(listener) = listener {
            listener(result);
        }
    }

    fn hash_password(password: &str, salt: &str) -> String {
        BASE64.encode(Sha512::digest(format!("{}{}", password, salt).as_bytes()))
    }

    fn issue_token(store: &mut Store, username: &str, device_name: &str) -> String {
        let token = BASE64.encode(Sha256::digest(Uuid::new_v4().as_bytes()));
        store.tokens.push(TokenRecord {
            token: token.clone(),
            id: Uuid::new_v4(),
            username: username.to_string(),
            device_name: device_name.to_string(),
            creation_time: Utc::now(),
        });
        token
    }

    fn token_info(store: &Store, record: &TokenRecord) -> Option<TokenInfo> {
        let user = store.users.get(&record.username)?;
        Some(TokenInfo {
            id: record.id,
            username: user.username.clone(),
            device_name: record.device_name.clone(),
            creation_time: record.creation_time,
            scopes: user.scopes.clone(),
        })
    }

    fn username_valid(&self, username: &str) -> bool {
        if !self.strict_credentials {
            return !username.trim().is_empty();
        }
        USERNAME_PATTERN.as_ref().is_some_and(|pattern| pattern.is_match(username))
    }

    fn password_valid(&self, password: &str) -> bool {
        if !self.strict_credentials {
            return !password.is_empty();
        }
        password.chars().count() >= 8
            && password.chars().any(|c| c.is_ascii_lowercase())
            && password.chars().any(|c| c.is_ascii_uppercase())
            && password.chars().any(|c| c.is_ascii_digit())
    }
}

impl Default for InMemoryUserManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UserManager for InMemoryUserManager {
    fn initial_setup_required(&self) -> bool {
        !self.store.lock().users.keys().any(|name| !name.is_empty())
    }

    fn create_user(&self, username: &str, password: &str) -> UserError {
        if !self.username_valid(username) {
            warn!("Cannot create user: invalid username '{}'", username);
            return UserError::InvalidUserId;
        }
        if !self.password_valid(password) {
            warn!("Cannot create user {}: password does not meet the requirements", username);
            return UserError::BadPassword;
        }
        let key = username.to_lowercase();
        let mut store = self.store.lock();
        if store.users.contains_key(&key) {
            return UserError::DuplicateUserId;
        }
        let first = !store.users.keys().any(|name| !name.is_empty());
        let scopes: BTreeSet<PermissionScope> = if first {
            [PermissionScope::Admin].into_iter().collect()
        } else {
            [PermissionScope::ControlThings].into_iter().collect()
        };
        let salt = Uuid::new_v4().simple().to_string();
        store.users.insert(
            key.clone(),
            UserRecord {
                username: key,
                password_hash: Self::hash_password(password, &salt),
                salt,
                scopes,
            },
        );
        info!("Created user {}", username);
        UserError::NoError
    }

    fn authenticate(&self, username: &str, password: &str, device_name: &str) -> Option<String> {
        let key = username.to_lowercase();
        let mut store = self.store.lock();
        let valid = match store.users.get(&key) {
            Some(user) if !key.is_empty() => user.password_hash == Self::hash_password(password, &user.salt),
            _ => false,
        };
        if !valid {
            warn!("Authentication error for user {}", username);
            return None;
        }
        Some(Self::issue_token(&mut store, &key, device_name))
    }

    fn verify_token(&self, token: &str) -> Option<TokenInfo> {
        let store = self.store.lock();
        let record = store.tokens.iter().find(|t| t.token == token)?;
        Self::token_info(&store, record)
    }

    fn tokens(&self, username: &str) -> Vec<TokenInfo> {
        let key = username.to_lowercase();
        let store = self.store.lock();
        store
            .tokens
            .iter()
            .filter(|t| t.username == key)
            .filter_map(|t| Self::token_info(&store, t))
            .collect()
    }

    fn remove_token(&self, token_id: Uuid) -> UserError {
        let mut store = self.store.lock();
        let before = store.tokens.len();
        store.tokens.retain(|t| t.id != token_id);
        if store.tokens.len() == before {
            UserError::TokenNotFound
        } else {
            UserError::NoError
        }
    }

    fn push_button_auth_available(&self) -> bool {
        self.push_button_available
    }

    fn request_push_button_auth(&self, device_name: &str) -> i32 {
        let (transaction_id, cancelled, listener) = {
            let mut store = self.store.lock();
            let cancelled = store.push_button.take().map(|(id, _)| id);
            store.next_transaction_id += 1;
            let transaction_id = store.next_transaction_id;
            store.push_button = Some((transaction_id, device_name.to_string()));
            (transaction_id, cancelled, store.listener.clone())
        };
        if let (Some(previous), Some(listener)) = (cancelled, listener) {
            debug!("Push button transaction {} replaced by {}", previous, transaction_id);
            listener(PushButtonAuthResult { transaction_id: previous, success: false, token: None });
        }
        transaction_id
    }

    fn cancel_push_button_auth(&self, transaction_id: i32) {
        let mut store = self.store.lock();
        if matches!(store.push_button, Some((id, _)) if id == transaction_id) {
            store.push_button = None;
            debug!("Push button transaction {} cancelled", transaction_id);
        }
    }

    fn set_push_button_listener(&self, listener: PushButtonListener) {
        self.store.lock().listener = Some(listener);
    }
}
