use crate::error::RegistrationError;
use crate::specification::api_spec_parser::ApiSpecParser;
use crate::specification::model_registry::{
    FieldMap, HandlerDescriptor, MethodSpec, NotificationSpec, REF_PREFIX,
};
use log::{debug, warn};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// The merged API of every registered handler.
///
/// Types share one global name space; methods and notifications are keyed
/// `Namespace.Name`. The schema only ever grows, and a failed registration
/// leaves it exactly as it was.
#[derive(Debug, Clone, Default)]
pub struct ApiSchema {
    enums: BTreeMap<String, Vec<String>>,
    flags: BTreeMap<String, String>,
    objects: BTreeMap<String, FieldMap>,
    methods: BTreeMap<String, MethodSpec>,
    notifications: BTreeMap<String, NotificationSpec>,
    namespaces: BTreeSet<String>,
}

/// Named type lookup used by reference resolution and the validator
#[derive(Debug, Clone, Copy)]
pub enum NamedType<'a> {
    Enum(&'a [String]),
    Flag(&'a str),
    Object(&'a FieldMap),
}

impl ApiSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a handler descriptor into the schema.
    ///
    /// `is_implemented` answers whether the handler backs a declared method
    /// with an invocable callback.
    pub fn register<F>(&mut self, descriptor: &HandlerDescriptor, is_implemented: F) -> Result<(), RegistrationError>
    where
        F: Fn(&str) -> bool,
    {
        let handler = descriptor.name.clone();
        if handler.is_empty() || handler.contains('.') {
            return Err(RegistrationError::InvalidSchema {
                handler,
                reason: "namespace must be non-empty and must not contain '.'".to_string(),
            });
        }
        if self.namespaces.contains(&handler) {
            return Err(RegistrationError::NamespaceConflict { handler });
        }

        // Work on copies so any failure leaves the live schema untouched.
        let mut enums = self.enums.clone();
        let mut flags = self.flags.clone();
        let mut objects = self.objects.clone();

        for (name, values) in &descriptor.enums {
            match enums.get(name) {
                Some(existing) if existing != values => {
                    warn!("Enum type {} is already registered with different values", name);
                    return Err(RegistrationError::EnumConflict { handler, name: name.clone() });
                }
                Some(_) => {}
                None => {
                    if flags.contains_key(name) || objects.contains_key(name) {
                        return Err(RegistrationError::TypeNameClash { handler, name: name.clone() });
                    }
                    enums.insert(name.clone(), values.clone());
                }
            }
        }

        for (name, enum_name) in &descriptor.flags {
            if enums.contains_key(name) {
                return Err(RegistrationError::FlagEnumNameClash { handler, name: name.clone() });
            }
            match flags.get(name) {
                Some(existing) if existing != enum_name => {
                    return Err(RegistrationError::FlagConflict { handler, name: name.clone() });
                }
                Some(_) => {}
                None => {
                    if objects.contains_key(name) {
                        return Err(RegistrationError::TypeNameClash { handler, name: name.clone() });
                    }
                    if !enums.contains_key(enum_name) {
                        return Err(RegistrationError::UnresolvedReference {
                            handler,
                            location: format!("flag {}", name),
                            reference: format!("{}{}", REF_PREFIX, enum_name),
                        });
                    }
                    flags.insert(name.clone(), enum_name.clone());
                }
            }
        }

        for (name, fields) in &descriptor.objects {
            match objects.get(name) {
                Some(existing) if existing != fields => {
                    return Err(RegistrationError::ObjectConflict { handler, name: name.clone() });
                }
                Some(_) => {}
                None => {
                    if enums.contains_key(name) || flags.contains_key(name) {
                        return Err(RegistrationError::TypeNameClash { handler, name: name.clone() });
                    }
                    objects.insert(name.clone(), fields.clone());
                }
            }
        }

        // Object bodies may reference each other within one descriptor, so
        // resolution runs once every object is known.
        for (name, fields) in &descriptor.objects {
            Self::check_refs(fields, &enums, &flags, &objects).map_err(|reference| {
                RegistrationError::UnresolvedReference {
                    handler: handler.clone(),
                    location: format!("object {}", name),
                    reference,
                }
            })?;
        }

        for (name, method) in &descriptor.methods {
            if !is_implemented(name) {
                return Err(RegistrationError::MethodNotImplemented { handler, method: name.clone() });
            }
            for (section, fields) in [("params", &method.params), ("returns", &method.returns)] {
                Self::check_refs(fields, &enums, &flags, &objects).map_err(|reference| {
                    RegistrationError::UnresolvedReference {
                        handler: handler.clone(),
                        location: format!("{} of method {}.{}", section, handler, name),
                        reference,
                    }
                })?;
            }
        }

        for (name, notification) in &descriptor.notifications {
            Self::check_refs(&notification.params, &enums, &flags, &objects).map_err(|reference| {
                RegistrationError::UnresolvedReference {
                    handler: handler.clone(),
                    location: format!("params of notification {}.{}", handler, name),
                    reference,
                }
            })?;
        }

        self.enums = enums;
        self.flags = flags;
        self.objects = objects;
        for (name, method) in &descriptor.methods {
            self.methods.insert(format!("{}.{}", handler, name), method.clone());
        }
        for (name, notification) in &descriptor.notifications {
            self.notifications
                .insert(format!("{}.{}", handler, name), notification.clone());
        }
        debug!(
            "Registered handler {} with {} methods and {} notifications",
            handler,
            descriptor.methods.len(),
            descriptor.notifications.len()
        );
        self.namespaces.insert(handler);
        Ok(())
    }

    /// Verify every reference in `fields` names a known enum, flag or object.
    /// Returns the first unresolved reference in notation form.
    pub fn check_refs(
        fields: &FieldMap,
        enums: &BTreeMap<String, Vec<String>>,
        flags: &BTreeMap<String, String>,
        objects: &BTreeMap<String, FieldMap>,
    ) -> Result<(), String> {
        let mut references = Vec::new();
        fields.collect_references(&mut references);
        match references
            .into_iter()
            .find(|r| !enums.contains_key(*r) && !flags.contains_key(*r) && !objects.contains_key(*r))
        {
            Some(missing) => Err(format!("{}{}", REF_PREFIX, missing)),
            None => Ok(()),
        }
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains(namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &String> {
        self.namespaces.iter()
    }

    /// Look up a method by its full `Namespace.Method` name
    pub fn method(&self, full_name: &str) -> Option<&MethodSpec> {
        self.methods.get(full_name)
    }

    pub fn notification(&self, full_name: &str) -> Option<&NotificationSpec> {
        self.notifications.get(full_name)
    }

    pub fn named_type(&self, name: &str) -> Option<NamedType<'_>> {
        if let Some(values) = self.enums.get(name) {
            Some(NamedType::Enum(values))
        } else if let Some(enum_name) = self.flags.get(name) {
            Some(NamedType::Flag(enum_name))
        } else {
            self.objects.get(name).map(NamedType::Object)
        }
    }

    /// Methods of one namespace in name order, keyed by full name
    pub fn methods_in<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = (&'a String, &'a MethodSpec)> + 'a {
        self.methods
            .iter()
            .filter(move |(name, _)| Self::namespace_of(name) == namespace)
    }

    /// The introspection document: `{enums, flags, types, methods, notifications}`
    pub fn introspect(&self) -> Map<String, Value> {
        let enums = self
            .enums
            .iter()
            .map(|(name, values)| (name.clone(), Value::from(values.clone())))
            .collect::<Map<_, _>>();
        let flags = self
            .flags
            .iter()
            .map(|(name, enum_name)| {
                (name.clone(), Value::Array(vec![Value::String(format!("{}{}", REF_PREFIX, enum_name))]))
            })
            .collect::<Map<_, _>>();
        let types = self
            .objects
            .iter()
            .map(|(name, fields)| (name.clone(), ApiSpecParser::field_map_to_json(fields)))
            .collect::<Map<_, _>>();
        let methods = self
            .methods
            .iter()
            .map(|(name, method)| (name.clone(), ApiSpecParser::method_to_json(method)))
            .collect::<Map<_, _>>();
        let notifications = self
            .notifications
            .iter()
            .map(|(name, notification)| (name.clone(), ApiSpecParser::notification_to_json(notification)))
            .collect::<Map<_, _>>();

        let mut document = Map::new();
        document.insert("enums".to_string(), Value::Object(enums));
        document.insert("flags".to_string(), Value::Object(flags));
        document.insert("types".to_string(), Value::Object(types));
        document.insert("methods".to_string(), Value::Object(methods));
        document.insert("notifications".to_string(), Value::Object(notifications));
        document
    }

    fn namespace_of(full_name: &str) -> &str {
        full_name.split('.').next().unwrap_or_default()
    }
}
