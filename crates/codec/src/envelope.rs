//! Request and acknowledgement envelopes.

use std::fmt;

use edgehub_core::{Kind, KindObject, ManagedObject, ObjectKey, Payload};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use serde::{Deserialize, Serialize};

/// Operation carried by a request envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Get,
    Create,
    Update,
    Patch,
    Delete,
    /// Session start; the ack carries the authoritative pod and secret lists.
    Start,
    /// Liveness report, never acknowledged.
    Online,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::Get,
        Operation::Create,
        Operation::Update,
        Operation::Patch,
        Operation::Delete,
        Operation::Start,
        Operation::Online,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Patch => "patch",
            Operation::Delete => "delete",
            Operation::Start => "start",
            Operation::Online => "online",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL.into_iter().find(|op| op.as_str() == s).ok_or_else(|| format!("unknown operation: {s}"))
    }
}

/// Patch flavour, encoded as its HTTP content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchKind {
    #[serde(rename = "application/json-patch+json")]
    Json,
    #[serde(rename = "application/merge-patch+json")]
    Merge,
    #[serde(rename = "application/strategic-merge-patch+json")]
    StrategicMerge,
    #[serde(rename = "application/apply-patch+yaml")]
    Apply,
}

/// Operation-specific options. Only the fields relevant to the operation are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_manager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<i64>,
}

/// Edge -> cloud request. `identity` is fresh per request and is the only correlation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub kind: Kind,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ManagedObject>,
    #[serde(default)]
    pub options: RequestOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_kind: Option<PatchKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patch_subresources: Vec<String>,
    pub identity: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub need_ack: bool,
}

/// Globally unique request identity.
pub fn new_identity() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl RequestEnvelope {
    /// Bare request for `kind`/`key` with a freshly generated identity.
    pub fn new(kind: Kind, operation: Operation, key: &ObjectKey, node_name: &str, need_ack: bool) -> Self {
        Self {
            kind,
            operation,
            object_name: key.name.clone(),
            object_namespace: key.namespace.clone().unwrap_or_default(),
            object: None,
            options: RequestOptions::default(),
            patch_kind: None,
            patch_body: None,
            patch_subresources: Vec::new(),
            identity: new_identity(),
            node_name: node_name.to_string(),
            need_ack,
        }
    }

    /// Request carrying a full object; name and namespace are taken from it.
    pub fn with_object<T: KindObject>(operation: Operation, obj: T, node_name: &str, need_ack: bool) -> Self {
        let key = obj.key();
        let mut env = Self::new(T::KIND, operation, &key, node_name, need_ack);
        env.object = Some(obj.into_managed());
        env
    }

    pub fn patch(kind: Kind, key: &ObjectKey, node_name: &str, patch_kind: PatchKind, body: String, subresources: Vec<String>) -> Self {
        let mut env = Self::new(kind, Operation::Patch, key, node_name, true);
        env.patch_kind = Some(patch_kind);
        env.patch_body = Some(body);
        env.patch_subresources = subresources;
        env
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn key(&self) -> ObjectKey {
        let ns = (!self.object_namespace.is_empty()).then_some(self.object_namespace.as_str());
        ObjectKey::for_kind(self.kind, ns, &self.object_name)
    }
}

impl fmt::Display for RequestEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}] identity [{}]", self.operation, self.kind, self.key(), self.identity)
    }
}

/// Error discriminant of an acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[default]
    None,
    StatusError,
    StringError,
}

/// Error body of an acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Status(Box<Status>),
    Message(String),
}

/// Cloud -> edge acknowledgement, matched to its request by `identity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckEnvelope {
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Payload>,
    #[serde(default)]
    pub error_kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl AckEnvelope {
    pub fn ok(identity: impl Into<String>, object: Option<Payload>) -> Self {
        Self { identity: identity.into(), object, error_kind: ErrorKind::None, error: None }
    }

    pub fn status_error(identity: impl Into<String>, status: Status) -> Self {
        Self {
            identity: identity.into(),
            object: None,
            error_kind: ErrorKind::StatusError,
            error: Some(ErrorPayload::Status(Box::new(status))),
        }
    }

    pub fn string_error(identity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            object: None,
            error_kind: ErrorKind::StringError,
            error: Some(ErrorPayload::Message(message.into())),
        }
    }

    /// Whether `error_kind` agrees with the shape of `error`.
    pub(crate) fn is_consistent(&self) -> bool {
        matches!(
            (self.error_kind, &self.error),
            (ErrorKind::None, None)
                | (ErrorKind::StatusError, Some(ErrorPayload::Status(_)))
                | (ErrorKind::StringError, Some(ErrorPayload::Message(_)))
        )
    }

    /// Split into the result payload or the remote error.
    pub fn outcome(self) -> Result<Option<Payload>, RemoteError> {
        match (self.error_kind, self.error) {
            (ErrorKind::None, _) => Ok(self.object),
            (_, Some(ErrorPayload::Status(s))) => Err(RemoteError::Status(*s)),
            (_, Some(ErrorPayload::Message(m))) => Err(RemoteError::Message(m)),
            (kind, None) => Err(RemoteError::Message(format!("ack reported {:?} without an error body", kind))),
        }
    }
}

impl fmt::Display for AckEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ack identity [{}] error_kind {:?}", self.identity, self.error_kind)
    }
}

/// Error reported by the remote side in an acknowledgement.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("{}", status_text(.0))]
    Status(Status),
    #[error("{0}")]
    Message(String),
}

fn status_text(s: &Status) -> String {
    let reason = s.reason.as_deref().unwrap_or("Unknown");
    match s.message.as_deref() {
        Some(msg) if !msg.is_empty() => format!("{}: {}", reason, msg),
        _ => reason.to_string(),
    }
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        match self {
            RemoteError::Status(s) => s.reason.as_deref() == Some("NotFound") || s.code == Some(404),
            RemoteError::Message(_) => false,
        }
    }

    /// Retry hint carried by a status error, if any.
    pub fn retry_after_seconds(&self) -> Option<i32> {
        match self {
            RemoteError::Status(s) => s.details.as_ref().and_then(|d| d.retry_after_seconds),
            RemoteError::Message(_) => None,
        }
    }
}

/// Build a `NotFound` status the way the control plane reports it.
pub fn not_found_status(kind: Kind, name: &str) -> Status {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::StatusDetails;
    Status {
        code: Some(404),
        reason: Some("NotFound".into()),
        status: Some("Failure".into()),
        message: Some(format!("{} \"{}\" not found", kind.plural(), name)),
        details: Some(StatusDetails { kind: Some(kind.plural().into()), name: Some(name.into()), ..Default::default() }),
        ..Default::default()
    }
}
