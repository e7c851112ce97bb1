use crate::server::json_handler::{cache_hash, CallContext, Experience, HandlerReply, JsonHandler, JsonMap, MethodTable};
use crate::server::notifier::Notifier;
use crate::specification::{ApiSpecParser, HandlerDescriptor, SchemaParseError};
use crate::utils::parse_color;
use chrono::Utc;
use log::{debug, info};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const THINGS_NAMESPACE: &str = "Things";

const DEFAULT_COLOR: &str = "#ffffff";

/// A configured device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thing {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub setup_time: Option<String>,
}

impl Thing {
    pub fn to_json(&self) -> Value {
        let mut map = JsonMap::new();
        map.insert("id".to_string(), json!(self.id.to_string()));
        map.insert("name".to_string(), json!(self.name));
        map.insert("color".to_string(), json!(self.color));
        if let Some(setup_time) = &self.setup_time {
            map.insert("setupTime".to_string(), json!(setup_time));
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThingError {
    NoError,
    ThingNotFound,
    InvalidParameter,
}

impl ThingError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThingError::NoError => "ThingErrorNoError",
            ThingError::ThingNotFound => "ThingErrorThingNotFound",
            ThingError::InvalidParameter => "ThingErrorInvalidParameter",
        }
    }
}

fn schema() -> Value {
    json!({
        "enums": {
            "ThingError": ["ThingErrorNoError", "ThingErrorThingNotFound", "ThingErrorInvalidParameter"]
        },
        "types": {
            "Thing": {"id": "Uuid", "name": "String", "r:color": "Color", "o:setupTime": "Time"}
        },
        "methods": {
            "GetThings": {
                "description": "All configured things, or only the one with thingId.",
                "params": {"o:thingId": "Uuid"},
                "returns": {"things": ["$ref:Thing"]},
                "permissionScope": "PermissionScopeControlThings"
            },
            "AddThing": {
                "description": "Add a thing. The color defaults to white.",
                "params": {"name": "String", "o:color": "Color"},
                "returns": {"thingError": "$ref:ThingError", "o:thingId": "Uuid"},
                "permissionScope": "PermissionScopeConfigureThings"
            },
            "RemoveThing": {
                "description": "Remove a thing. Replies once the thing is gone.",
                "params": {"thingId": "Uuid"},
                "returns": {"thingError": "$ref:ThingError"},
                "permissionScope": "PermissionScopeConfigureThings"
            }
        },
        "notifications": {
            "ThingAdded": {
                "description": "Emitted when a thing was added.",
                "params": {"thing": "$ref:Thing", "message": "String"}
            },
            "ThingRemoved": {
                "description": "Emitted when a thing was removed.",
                "params": {"thingId": "Uuid"}
            }
        }
    })
}

/// In-memory sample namespace managing things
pub struct ThingsHandler {
    descriptor: HandlerDescriptor,
    notifier: Notifier,
    things: Mutex<HashMap<Uuid, Thing>>,
    removal_delay: Duration,
}

impl ThingsHandler {
    pub fn new(notifier: Notifier) -> Result<Arc<Self>, SchemaParseError> {
        Self::with_removal_delay(notifier, Duration::ZERO)
    }

    /// `RemoveThing` replies only after `delay`
    pub fn with_removal_delay(notifier: Notifier, delay: Duration) -> Result<Arc<Self>, SchemaParseError> {
        Ok(Arc::new(Self {
            descriptor: ApiSpecParser::descriptor_from_value(THINGS_NAMESPACE, &schema())?,
            notifier,
            things: Mutex::new(HashMap::new()),
            removal_delay: delay,
        }))
    }

    /// Snapshot ordered by name
    pub fn things(&self) -> Vec<Thing> {
        let mut things: Vec<Thing> = self.things.lock().values().cloned().collect();
        things.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        things
    }

    pub fn add_thing(&self, name: &str, color: Option<&str>) -> Result<Thing, ThingError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ThingError::InvalidParameter);
        }
        let color = match color {
            Some(color) if parse_color(color).is_some() => color.to_string(),
            Some(_) => return Err(ThingError::InvalidParameter),
            None => DEFAULT_COLOR.to_string(),
        };
        let thing = Thing {
            id: Uuid::new_v4(),
            name: name.to_string(),
            color,
            setup_time: Some(Utc::now().format("%H:%M").to_string()),
        };
        self.things.lock().insert(thing.id, thing.clone());
        info!("Added thing {} ({})", thing.name, thing.id);

        let mut params = JsonMap::new();
        params.insert("thing".to_string(), thing.to_json());
        params.insert("message".to_string(), json!(Self::added_message(&thing.name, "en_US")));
        self.notifier.publish(THINGS_NAMESPACE, "ThingAdded", params);
        Ok(thing)
    }

    pub fn remove_thing(&self, id: &Uuid) -> ThingError {
        if self.things.lock().remove(id).is_none() {
            return ThingError::ThingNotFound;
        }
        info!("Removed thing {}", id);
        let mut params = JsonMap::new();
        params.insert("thingId".to_string(), json!(id.to_string()));
        self.notifier.publish(THINGS_NAMESPACE, "ThingRemoved", params);
        ThingError::NoError
    }

    fn added_message(name: &str, locale: &str) -> String {
        match locale {
            "de_DE" => format!("{} wurde hinzugefügt", name),
            _ => format!("{} was added", name),
        }
    }

    fn get_things_method(&self, params: &JsonMap, _ctx: &CallContext<'_>) -> HandlerReply {
        let filter = params
            .get("thingId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        HandlerReply::create_reply(self.things_reply(filter))
    }

    fn things_reply(&self, filter: Option<Uuid>) -> JsonMap {
        let things: Vec<Value> = self
            .things()
            .iter()
            .filter(|t| filter.map(|id| id == t.id).unwrap_or(true))
            .map(Thing::to_json)
            .collect();
        let mut data = JsonMap::new();
        data.insert("things".to_string(), Value::Array(things));
        data
    }

    fn add_thing_method(&self, params: &JsonMap, ctx: &CallContext<'_>) -> HandlerReply {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let color = params.get("color").and_then(Value::as_str);
        let mut data = JsonMap::new();
        match self.add_thing(name, color) {
            Ok(thing) => {
                debug!("Client {} added thing {}", ctx.client_id(), thing.id);
                data.insert("thingError".to_string(), json!(ThingError::NoError.as_str()));
                data.insert("thingId".to_string(), json!(thing.id.to_string()));
            }
            Err(error) => {
                data.insert("thingError".to_string(), json!(error.as_str()));
            }
        }
        HandlerReply::create_reply(data)
    }

    fn remove_thing_method(self: &Arc<Self>, params: &JsonMap, _ctx: &CallContext<'_>) -> HandlerReply {
        let thing_id = params
            .get("thingId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let this = Arc::clone(self);
        HandlerReply::from_future(async move {
            if !this.removal_delay.is_zero() {
                tokio::time::sleep(this.removal_delay).await;
            }
            let error = match thing_id {
                Some(id) => this.remove_thing(&id),
                None => ThingError::InvalidParameter,
            };
            let mut data = JsonMap::new();
            data.insert("thingError".to_string(), json!(error.as_str()));
            data
        })
    }
}

impl JsonHandler for ThingsHandler {
    fn name(&self) -> &str {
        THINGS_NAMESPACE
    }

    fn descriptor(&self) -> HandlerDescriptor {
        self.descriptor.clone()
    }

    fn method_table(self: Arc<Self>) -> MethodTable {
        let mut table = MethodTable::new();
        let this = Arc::clone(&self);
        table.register("GetThings", move |params, ctx| this.get_things_method(params, ctx));
        let this = Arc::clone(&self);
        table.register("AddThing", move |params, ctx| this.add_thing_method(params, ctx));
        let this = self;
        table.register("RemoveThing", move |params, ctx| this.remove_thing_method(params, ctx));
        table
    }

    fn translate_notification(&self, notification: &str, mut params: JsonMap, locale: &str) -> JsonMap {
        if notification == "ThingAdded" {
            let name = params
                .get("thing")
                .and_then(|t| t.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(name) = name {
                params.insert("message".to_string(), json!(Self::added_message(&name, locale)));
            }
        }
        params
    }

    /// Digest of the unfiltered `GetThings` reply, recomputed on every call
    fn cache_hashes(&self) -> BTreeMap<String, String> {
        let reply = Value::Object(self.things_reply(None));
        BTreeMap::from([("GetThings".to_string(), cache_hash(&reply))])
    }

    fn experience(&self) -> Option<Experience> {
        Some(Experience::new(THINGS_NAMESPACE, "1.0"))
    }
}
