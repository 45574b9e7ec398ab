use std::time::Duration;

use edgehub_bus::{RouterError, TransportError};
use edgehub_codec::{Operation, RemoteError};
use edgehub_core::{Kind, KindObject, ManagedObject, ObjectKey};
use edgehub_persist::StoreError;

/// Errors returned by the resource clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{kind} {key} not found")]
    NotFound { kind: Kind, key: ObjectKey },
    /// No acknowledgement within the wait window, or the request never left.
    /// `submitted` is the caller's object (or the last local copy) for optimistic continuation.
    #[error("{operation} {kind} {key} timed out after {after:?}{}", cause_suffix(.cause))]
    Timeout {
        kind: Kind,
        operation: Operation,
        key: ObjectKey,
        after: Duration,
        submitted: Option<Box<ManagedObject>>,
        cause: Option<TransportError>,
    },
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("internal: {0}")]
    Internal(String),
}

fn cause_suffix(cause: &Option<TransportError>) -> String {
    match cause {
        Some(e) => format!(" ({})", e),
        None => String::new(),
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::NotFound { .. } => true,
            ClientError::Remote(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    /// The object a timed-out call would have returned on success, as best known locally.
    pub fn submitted<T: KindObject>(&self) -> Option<T> {
        match self {
            ClientError::Timeout { submitted: Some(obj), .. } => obj.as_ref().clone().downcast(),
            _ => None,
        }
    }
}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        ClientError::Internal(e.to_string())
    }
}

/// Failure to bring the gateway up.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Router(#[from] RouterError),
}
