//! Edgehub core types: resource kinds, object keys and the managed object union.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

/// Resource kinds mirrored and brokered by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Node,
    Pod,
    Lease,
    Event,
    Secret,
    #[serde(rename = "configmap")]
    ConfigMap,
}

impl Kind {
    pub const ALL: [Kind; 6] = [Kind::Node, Kind::Pod, Kind::Lease, Kind::Event, Kind::Secret, Kind::ConfigMap];

    /// Lowercase singular name, used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Node => "node",
            Kind::Pod => "pod",
            Kind::Lease => "lease",
            Kind::Event => "event",
            Kind::Secret => "secret",
            Kind::ConfigMap => "configmap",
        }
    }

    /// Plural name, used for topic segments and store directories.
    pub fn plural(self) -> &'static str {
        match self {
            Kind::Node => "nodes",
            Kind::Pod => "pods",
            Kind::Lease => "leases",
            Kind::Event => "events",
            Kind::Secret => "secrets",
            Kind::ConfigMap => "configmaps",
        }
    }

    /// Kubernetes `kind` field value.
    pub fn api_kind(self) -> &'static str {
        match self {
            Kind::Node => "Node",
            Kind::Pod => "Pod",
            Kind::Lease => "Lease",
            Kind::Event => "Event",
            Kind::Secret => "Secret",
            Kind::ConfigMap => "ConfigMap",
        }
    }

    pub fn api_version(self) -> &'static str {
        match self {
            Kind::Lease => "coordination.k8s.io/v1",
            _ => "v1",
        }
    }

    /// Node is the only cluster-scoped kind.
    pub fn namespaced(self) -> bool {
        !matches!(self, Kind::Node)
    }

    pub fn from_api_kind(s: &str) -> Option<Kind> {
        Kind::ALL.into_iter().find(|k| k.api_kind() == s)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = ObjectError;

    /// Accepts singular, plural or API casing (`pod`, `pods`, `Pod`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Kind::ALL
            .into_iter()
            .find(|k| k.as_str() == lower || k.plural() == lower)
            .ok_or_else(|| ObjectError::UnknownKind(s.to_string()))
    }
}

/// Identity of an object within one kind. `namespace` is `None` for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    /// Build a key for `kind`, dropping the namespace for cluster-scoped kinds.
    pub fn for_kind(kind: Kind, namespace: Option<&str>, name: &str) -> Self {
        let namespace = if kind.namespaced() { namespace.filter(|ns| !ns.is_empty()).map(str::to_string) } else { None };
        Self { namespace, name: name.to_string() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = ObjectError;

    /// Parses `ns/name` or bare `name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(ObjectKey::namespaced(ns, name)),
            None if !s.is_empty() => Ok(ObjectKey::cluster(s)),
            _ => Err(ObjectError::InvalidKey(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("object has no kind field")]
    MissingKind,
    #[error("kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: Kind, found: String },
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("decoding {kind} object: {source}")]
    Decode { kind: Kind, #[source] source: serde_json::Error },
}

/// A typed resource that can live in the managed object union.
pub trait KindObject: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: Kind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn into_managed(self) -> ManagedObject;
    fn from_managed(obj: ManagedObject) -> Option<Self>;

    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::for_kind(Self::KIND, meta.namespace.as_deref(), meta.name.as_deref().unwrap_or(""))
    }
}

/// Tagged union over the supported kinds.
///
/// Serializes as the plain Kubernetes object (with `apiVersion`/`kind`), so the
/// wire shape matches what any other Kubernetes tooling produces. Deserialization
/// dispatches on the object's own `kind` field.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedObject {
    Node(Node),
    Pod(Pod),
    Lease(Lease),
    Event(Event),
    Secret(Secret),
    ConfigMap(ConfigMap),
}

macro_rules! kind_object {
    ($ty:ty, $kind:ident) => {
        impl KindObject for $ty {
            const KIND: Kind = Kind::$kind;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }

            fn into_managed(self) -> ManagedObject {
                ManagedObject::$kind(self)
            }

            fn from_managed(obj: ManagedObject) -> Option<Self> {
                match obj {
                    ManagedObject::$kind(o) => Some(o),
                    _ => None,
                }
            }
        }

        impl From<$ty> for ManagedObject {
            fn from(o: $ty) -> Self {
                ManagedObject::$kind(o)
            }
        }
    };
}

kind_object!(Node, Node);
kind_object!(Pod, Pod);
kind_object!(Lease, Lease);
kind_object!(Event, Event);
kind_object!(Secret, Secret);
kind_object!(ConfigMap, ConfigMap);

impl ManagedObject {
    pub fn kind(&self) -> Kind {
        match self {
            ManagedObject::Node(_) => Kind::Node,
            ManagedObject::Pod(_) => Kind::Pod,
            ManagedObject::Lease(_) => Kind::Lease,
            ManagedObject::Event(_) => Kind::Event,
            ManagedObject::Secret(_) => Kind::Secret,
            ManagedObject::ConfigMap(_) => Kind::ConfigMap,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ManagedObject::Node(o) => &o.metadata,
            ManagedObject::Pod(o) => &o.metadata,
            ManagedObject::Lease(o) => &o.metadata,
            ManagedObject::Event(o) => &o.metadata,
            ManagedObject::Secret(o) => &o.metadata,
            ManagedObject::ConfigMap(o) => &o.metadata,
        }
    }

    /// Key derived from the object's declared identity.
    pub fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::for_kind(self.kind(), meta.namespace.as_deref(), meta.name.as_deref().unwrap_or(""))
    }

    pub fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn downcast<T: KindObject>(self) -> Option<T> {
        T::from_managed(self)
    }

    /// Decode a JSON value, dispatching on its `kind` field.
    pub fn from_value(value: Json) -> Result<Self, ObjectError> {
        let kind_name = value.get("kind").and_then(Json::as_str).ok_or(ObjectError::MissingKind)?;
        let kind = Kind::from_api_kind(kind_name).ok_or_else(|| ObjectError::UnknownKind(kind_name.to_string()))?;
        Self::decode_as(kind, value)
    }

    /// Decode a JSON value as `kind`. A missing `apiVersion`/`kind` is filled in;
    /// a present but different `kind` is rejected.
    pub fn decode_as(kind: Kind, mut value: Json) -> Result<Self, ObjectError> {
        if let Some(map) = value.as_object_mut() {
            match map.get("kind").and_then(Json::as_str) {
                Some(found) if found != kind.api_kind() => {
                    return Err(ObjectError::KindMismatch { expected: kind, found: found.to_string() })
                }
                Some(_) => {}
                None => {
                    map.insert("kind".into(), Json::String(kind.api_kind().into()));
                }
            }
            map.entry("apiVersion").or_insert_with(|| Json::String(kind.api_version().into()));
        }
        let decode = |e| ObjectError::Decode { kind, source: e };
        Ok(match kind {
            Kind::Node => ManagedObject::Node(serde_json::from_value(value).map_err(decode)?),
            Kind::Pod => ManagedObject::Pod(serde_json::from_value(value).map_err(decode)?),
            Kind::Lease => ManagedObject::Lease(serde_json::from_value(value).map_err(decode)?),
            Kind::Event => ManagedObject::Event(serde_json::from_value(value).map_err(decode)?),
            Kind::Secret => ManagedObject::Secret(serde_json::from_value(value).map_err(decode)?),
            Kind::ConfigMap => ManagedObject::ConfigMap(serde_json::from_value(value).map_err(decode)?),
        })
    }
}

impl Serialize for ManagedObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ManagedObject::Node(o) => o.serialize(serializer),
            ManagedObject::Pod(o) => o.serialize(serializer),
            ManagedObject::Lease(o) => o.serialize(serializer),
            ManagedObject::Event(o) => o.serialize(serializer),
            ManagedObject::Secret(o) => o.serialize(serializer),
            ManagedObject::ConfigMap(o) => o.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ManagedObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Json::deserialize(deserializer)?;
        ManagedObject::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Payload slot of an envelope: a single object or a `List` of objects.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Object(ManagedObject),
    List(Vec<ManagedObject>),
}

impl Payload {
    pub fn into_object(self) -> Option<ManagedObject> {
        match self {
            Payload::Object(o) => Some(o),
            Payload::List(_) => None,
        }
    }

    pub fn into_items(self) -> Vec<ManagedObject> {
        match self {
            Payload::Object(o) => vec![o],
            Payload::List(items) => items,
        }
    }
}

impl From<ManagedObject> for Payload {
    fn from(o: ManagedObject) -> Self {
        Payload::Object(o)
    }
}

#[derive(Serialize)]
struct ListRef<'a> {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    items: &'a [ManagedObject],
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Object(o) => o.serialize(serializer),
            Payload::List(items) => ListRef { api_version: "v1", kind: "List", items }.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut value = Json::deserialize(deserializer)?;
        if value.get("kind").and_then(Json::as_str) == Some("List") {
            let items = match value.get_mut("items").map(Json::take) {
                Some(Json::Array(items)) => items,
                Some(Json::Null) | None => Vec::new(),
                Some(_) => return Err(serde::de::Error::custom("List items must be a sequence")),
            };
            let items = items
                .into_iter()
                .map(ManagedObject::from_value)
                .collect::<Result<Vec<_>, _>>()
                .map_err(serde::de::Error::custom)?;
            return Ok(Payload::List(items));
        }
        ManagedObject::from_value(value).map(Payload::Object).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// One mutation of the in-memory index.
#[derive(Debug, Clone)]
pub struct Delta {
    pub kind: Kind,
    pub key: ObjectKey,
    pub change: DeltaKind,
    /// The new object for `Applied`, the last known object for `Deleted`.
    pub object: ManagedObject,
}
