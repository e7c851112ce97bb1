use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Prefix marking a reference to a named enum, flag or object type
pub const REF_PREFIX: &str = "$ref:";

/// Primitive value types understood by the validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BasicType {
    Uuid,
    String,
    StringList,
    Int,
    Uint,
    Double,
    Bool,
    Variant,
    Color,
    Time,
    Object,
}

impl BasicType {
    pub const ALL: [BasicType; 11] = [
        BasicType::Uuid,
        BasicType::String,
        BasicType::StringList,
        BasicType::Int,
        BasicType::Uint,
        BasicType::Double,
        BasicType::Bool,
        BasicType::Variant,
        BasicType::Color,
        BasicType::Time,
        BasicType::Object,
    ];

    /// Returns the schema notation for this type
    pub fn as_str(&self) -> &'static str {
        match self {
            BasicType::Uuid => "Uuid",
            BasicType::String => "String",
            BasicType::StringList => "StringList",
            BasicType::Int => "Int",
            BasicType::Uint => "Uint",
            BasicType::Double => "Double",
            BasicType::Bool => "Bool",
            BasicType::Variant => "Variant",
            BasicType::Color => "Color",
            BasicType::Time => "Time",
            BasicType::Object => "Object",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for BasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Type of a single schema node
#[derive(Debug, Clone, PartialEq)]
pub enum TypeRef {
    Basic(BasicType),
    /// `$ref:<name>` to an enum, flag or object
    Ref(String),
    /// A one-element list in the notation, meaning "array of X"
    List(Box<TypeRef>),
    /// An inline object map
    Object(FieldMap),
}

impl TypeRef {
    pub fn basic(basic: BasicType) -> Self {
        TypeRef::Basic(basic)
    }

    pub fn reference<S: Into<String>>(name: S) -> Self {
        TypeRef::Ref(name.into())
    }

    pub fn list_of(element: TypeRef) -> Self {
        TypeRef::List(Box::new(element))
    }

    pub fn object(fields: FieldMap) -> Self {
        TypeRef::Object(fields)
    }

    /// Collects every type name this node references, depth first
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            TypeRef::Basic(_) => {}
            TypeRef::Ref(name) => out.push(name),
            TypeRef::List(element) => element.collect_references(out),
            TypeRef::Object(fields) => fields.collect_references(out),
        }
    }
}

/// A field name together with its key modifiers (`o:`, `r:`, `d:`)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldKey {
    pub name: String,
    pub optional: bool,
    pub read_only: bool,
    pub deprecated: bool,
}

impl FieldKey {
    /// Splits a notation key such as `o:r:name` into name and modifiers
    pub fn parse(raw: &str) -> Self {
        let mut key = FieldKey::default();
        let mut rest = raw;
        loop {
            if let Some(stripped) = rest.strip_prefix("o:") {
                key.optional = true;
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix("r:") {
                key.read_only = true;
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix("d:") {
                key.deprecated = true;
                rest = stripped;
            } else {
                break;
            }
        }
        key.name = rest.to_string();
        key
    }

    /// Rebuilds the notation key
    pub fn to_raw(&self) -> String {
        let mut raw = String::new();
        if self.deprecated {
            raw.push_str("d:");
        }
        if self.optional {
            raw.push_str("o:");
        }
        if self.read_only {
            raw.push_str("r:");
        }
        raw.push_str(&self.name);
        raw
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: FieldKey,
    pub type_ref: TypeRef,
}

/// Field name to type mapping used for params, returns and object bodies.
/// Keys are stored by plain name so modifiers never affect lookup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldMap {
    fields: BTreeMap<String, Field>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`FieldMap::insert`]
    pub fn with(mut self, raw_key: &str, type_ref: TypeRef) -> Self {
        self.insert(raw_key, type_ref);
        self
    }

    pub fn insert(&mut self, raw_key: &str, type_ref: TypeRef) {
        let key = FieldKey::parse(raw_key);
        self.fields.insert(key.name.clone(), Field { key, type_ref });
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        for field in self.fields.values() {
            field.type_ref.collect_references(out);
        }
    }
}

/// Capability tag required to invoke a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionScope {
    None,
    ControlThings,
    ConfigureThings,
    ExecuteRules,
    ConfigureRules,
    Admin,
}

impl PermissionScope {
    pub const ALL: [PermissionScope; 6] = [
        PermissionScope::None,
        PermissionScope::ControlThings,
        PermissionScope::ConfigureThings,
        PermissionScope::ExecuteRules,
        PermissionScope::ConfigureRules,
        PermissionScope::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionScope::None => "PermissionScopeNone",
            PermissionScope::ControlThings => "PermissionScopeControlThings",
            PermissionScope::ConfigureThings => "PermissionScopeConfigureThings",
            PermissionScope::ExecuteRules => "PermissionScopeExecuteRules",
            PermissionScope::ConfigureRules => "PermissionScopeConfigureRules",
            PermissionScope::Admin => "PermissionScopeAdmin",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == name)
    }

    /// All enum values in schema notation
    pub fn enum_values() -> Vec<String> {
        Self::ALL.iter().map(|s| s.as_str().to_string()).collect()
    }
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a granted scope set satisfies `required`. `Admin` satisfies anything.
pub fn scopes_permit(granted: &BTreeSet<PermissionScope>, required: PermissionScope) -> bool {
    required == PermissionScope::None
        || granted.contains(&PermissionScope::Admin)
        || granted.contains(&required)
}

/// Method specification
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSpec {
    pub description: String,
    pub params: FieldMap,
    pub returns: FieldMap,
    pub permission_scope: PermissionScope,
    pub deprecation: Option<String>,
}

impl MethodSpec {
    pub fn new<S: Into<String>>(description: S) -> Self {
        Self {
            description: description.into(),
            params: FieldMap::new(),
            returns: FieldMap::new(),
            permission_scope: PermissionScope::None,
            deprecation: None,
        }
    }

    pub fn with_params(mut self, params: FieldMap) -> Self {
        self.params = params;
        self
    }

    pub fn with_returns(mut self, returns: FieldMap) -> Self {
        self.returns = returns;
        self
    }

    pub fn with_permission_scope(mut self, scope: PermissionScope) -> Self {
        self.permission_scope = scope;
        self
    }

    pub fn deprecated<S: Into<String>>(mut self, text: S) -> Self {
        self.deprecation = Some(text.into());
        self
    }
}

/// Notification specification
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationSpec {
    pub description: String,
    pub params: FieldMap,
    pub deprecation: Option<String>,
}

impl NotificationSpec {
    pub fn new<S: Into<String>>(description: S) -> Self {
        Self {
            description: description.into(),
            params: FieldMap::new(),
            deprecation: None,
        }
    }

    pub fn with_params(mut self, params: FieldMap) -> Self {
        self.params = params;
        self
    }

    pub fn deprecated<S: Into<String>>(mut self, text: S) -> Self {
        self.deprecation = Some(text.into());
        self
    }
}

/// Everything a handler contributes to the API under its namespace.
///
/// The registry reads a descriptor once and copies what it needs; the
/// descriptor itself is never mutated by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerDescriptor {
    pub name: String,
    pub methods: BTreeMap<String, MethodSpec>,
    pub notifications: BTreeMap<String, NotificationSpec>,
    pub enums: BTreeMap<String, Vec<String>>,
    pub flags: BTreeMap<String, String>,
    pub objects: BTreeMap<String, FieldMap>,
}

impl HandlerDescriptor {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
            notifications: BTreeMap::new(),
            enums: BTreeMap::new(),
            flags: BTreeMap::new(),
            objects: BTreeMap::new(),
        }
    }

    pub fn with_enum<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enums
            .insert(name.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Declares a flag type: a list of values of `enum_name`
    pub fn with_flag(mut self, name: &str, enum_name: &str) -> Self {
        self.flags.insert(name.to_string(), enum_name.to_string());
        self
    }

    pub fn with_object(mut self, name: &str, fields: FieldMap) -> Self {
        self.objects.insert(name.to_string(), fields);
        self
    }

    pub fn with_method(mut self, name: &str, method: MethodSpec) -> Self {
        self.methods.insert(name.to_string(), method);
        self
    }

    pub fn with_notification(mut self, name: &str, notification: NotificationSpec) -> Self {
        self.notifications.insert(name.to_string(), notification);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_key_modifiers() {
        let key = FieldKey::parse("o:r:color");
        assert_eq!(key.name, "color");
        assert!(key.optional);
        assert!(key.read_only);
        assert!(!key.deprecated);
        assert_eq!(key.to_raw(), "o:r:color");

        let plain = FieldKey::parse("name");
        assert!(!plain.optional && !plain.read_only);
    }

    #[test]
    fn test_field_map_lookup_ignores_modifiers() {
        let map = FieldMap::new()
            .with("o:locale", TypeRef::basic(BasicType::String))
            .with("id", TypeRef::basic(BasicType::Uuid));
        assert!(map.get("locale").unwrap().key.optional);
        assert!(map.get("o:locale").is_none());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_collect_references() {
        let t = TypeRef::list_of(TypeRef::object(
            FieldMap::new()
                .with("a", TypeRef::reference("Thing"))
                .with("b", TypeRef::list_of(TypeRef::reference("ThingError"))),
        ));
        let mut refs = Vec::new();
        t.collect_references(&mut refs);
        assert_eq!(refs, vec!["Thing", "ThingError"]);
    }

    #[test]
    fn test_admin_satisfies_any_scope() {
        let admin: BTreeSet<_> = [PermissionScope::Admin].into_iter().collect();
        let control: BTreeSet<_> = [PermissionScope::ControlThings].into_iter().collect();
        assert!(scopes_permit(&admin, PermissionScope::ConfigureRules));
        assert!(scopes_permit(&control, PermissionScope::ControlThings));
        assert!(!scopes_permit(&control, PermissionScope::ConfigureThings));
        assert!(scopes_permit(&BTreeSet::new(), PermissionScope::None));
    }

    #[test]
    fn test_basic_type_names() {
        for basic in BasicType::ALL {
            assert_eq!(BasicType::from_name(basic.as_str()), Some(basic));
        }
        assert_eq!(BasicType::from_name("Float"), None);
    }
}
