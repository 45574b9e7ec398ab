//! Edgehub envelope codec: request/ack envelopes, YAML wire encoding and optional gzip.

#![forbid(unsafe_code)]

mod compress;
mod envelope;

use edgehub_core::{Kind, ManagedObject, ObjectError};
use serde::Serialize;
use tracing::debug;

pub use compress::Compression;
pub use envelope::{
    new_identity, not_found_status, AckEnvelope, ErrorKind, ErrorPayload, Operation, PatchKind, RemoteError,
    RequestEnvelope, RequestOptions,
};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(#[source] serde_yaml::Error),
    #[error("decode: {0}")]
    Decode(#[source] serde_yaml::Error),
    #[error("object: {0}")]
    Object(#[from] ObjectError),
    #[error("ack {identity}: error_kind {kind:?} does not match error body")]
    InconsistentAck { identity: String, kind: ErrorKind },
    #[error("request {identity}: {reason}")]
    InvalidRequest { identity: String, reason: &'static str },
    #[error("compression: {0}")]
    Compression(#[source] std::io::Error),
    #[error("payload too large: {0} bytes")]
    TooLarge(usize),
    #[error("unknown compression: {0}")]
    UnknownCompression(String),
}

/// Either envelope, for consumers that see both directions.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(RequestEnvelope),
    Ack(AckEnvelope),
}

/// Encode any envelope (or object) to wire bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_yaml::to_string(value).map(String::into_bytes).map_err(CodecError::Encode)
}

pub fn decode_request(bytes: &[u8]) -> Result<RequestEnvelope, CodecError> {
    let req: RequestEnvelope = serde_yaml::from_slice(bytes).map_err(CodecError::Decode)?;
    if req.identity.is_empty() {
        return Err(CodecError::InvalidRequest { identity: req.identity, reason: "empty identity" });
    }
    if req.operation == Operation::Patch && (req.patch_kind.is_none() || req.patch_body.is_none()) {
        return Err(CodecError::InvalidRequest { identity: req.identity, reason: "patch without kind or body" });
    }
    if let Some(obj) = &req.object {
        if obj.kind() != req.kind {
            return Err(CodecError::Object(ObjectError::KindMismatch {
                expected: req.kind,
                found: obj.kind().api_kind().to_string(),
            }));
        }
    }
    Ok(req)
}

/// Decode an acknowledgement, rejecting one whose `error_kind` disagrees with its error body.
pub fn decode_ack(bytes: &[u8]) -> Result<AckEnvelope, CodecError> {
    let ack: AckEnvelope = serde_yaml::from_slice(bytes).map_err(CodecError::Decode)?;
    if !ack.is_consistent() {
        debug!(identity = %ack.identity, kind = ?ack.error_kind, "inconsistent ack");
        return Err(CodecError::InconsistentAck { identity: ack.identity, kind: ack.error_kind });
    }
    Ok(ack)
}

/// Decode bytes of unknown direction. Requests are recognised by their `operation` field.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let peek: serde_yaml::Value = serde_yaml::from_slice(bytes).map_err(CodecError::Decode)?;
    if peek.get("operation").is_some() {
        decode_request(bytes).map(Envelope::Request)
    } else {
        decode_ack(bytes).map(Envelope::Ack)
    }
}

/// Decode a bare object document as `kind`, as stored on disk or pushed by the cloud.
pub fn decode_object(kind: Kind, bytes: &[u8]) -> Result<ManagedObject, CodecError> {
    let value: serde_json::Value = serde_yaml::from_slice(bytes).map_err(CodecError::Decode)?;
    Ok(ManagedObject::decode_as(kind, value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgehub_core::{ObjectKey, Payload};
    use k8s_openapi::api::core::v1::{Node, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(ns: &str, name: &str) -> Pod {
        Pod { metadata: ObjectMeta { namespace: Some(ns.into()), name: Some(name.into()), ..Default::default() }, ..Default::default() }
    }

    #[test]
    fn request_survives_the_wire() {
        let req = RequestEnvelope::with_object(Operation::Update, pod("ns", "x"), "edge-1", true)
            .options(RequestOptions { field_manager: Some("edgehub".into()), ..Default::default() });
        let bytes = encode(&req).unwrap();
        let back = decode_request(&bytes).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn patch_request_keeps_content_type() {
        let key = ObjectKey::namespaced("ns", "x");
        let req = RequestEnvelope::patch(Kind::Pod, &key, "edge-1", PatchKind::Merge, r#"{"metadata":{"labels":{"a":"b"}}}"#.into(), vec!["status".into()]);
        let text = String::from_utf8(encode(&req).unwrap()).unwrap();
        assert!(text.contains("application/merge-patch+json"));
        let back = decode_request(text.as_bytes()).unwrap();
        assert_eq!(back.patch_subresources, vec!["status".to_string()]);
    }

    #[test]
    fn patch_without_body_is_rejected() {
        let key = ObjectKey::namespaced("ns", "x");
        let req = RequestEnvelope::new(Kind::Pod, Operation::Patch, &key, "edge-1", true);
        let bytes = encode(&req).unwrap();
        assert!(matches!(decode_request(&bytes), Err(CodecError::InvalidRequest { .. })));
    }

    #[test]
    fn request_object_must_match_kind() {
        let mut req = RequestEnvelope::with_object(Operation::Create, pod("ns", "x"), "edge-1", true);
        req.kind = Kind::Node;
        let bytes = encode(&req).unwrap();
        assert!(matches!(decode_request(&bytes), Err(CodecError::Object(ObjectError::KindMismatch { .. }))));
    }

    #[test]
    fn inconsistent_ack_is_rejected() {
        let yaml = "identity: abc\nerror_kind: status_error\nerror: plain text\n";
        assert!(matches!(decode_ack(yaml.as_bytes()), Err(CodecError::InconsistentAck { .. })));
        let yaml = "identity: abc\nerror_kind: string_error\n";
        assert!(matches!(decode_ack(yaml.as_bytes()), Err(CodecError::InconsistentAck { .. })));
    }

    #[test]
    fn status_error_ack_decodes() {
        let ack = AckEnvelope::status_error("abc", not_found_status(Kind::Pod, "x"));
        let back = decode_ack(&encode(&ack).unwrap()).unwrap();
        let err = back.outcome().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_ack_decodes_items() {
        let ack = AckEnvelope::ok("abc", Some(Payload::List(vec![pod("a", "p").into()])));
        let back = decode_ack(&encode(&ack).unwrap()).unwrap();
        let items = back.outcome().unwrap().unwrap().into_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key(), ObjectKey::namespaced("a", "p"));
    }

    #[test]
    fn envelope_direction_is_detected() {
        let req = RequestEnvelope::new(Kind::Node, Operation::Get, &ObjectKey::cluster("n1"), "n1", true);
        assert!(matches!(decode_envelope(&encode(&req).unwrap()).unwrap(), Envelope::Request(_)));
        let ack = AckEnvelope::ok("abc", None);
        assert!(matches!(decode_envelope(&encode(&ack).unwrap()).unwrap(), Envelope::Ack(_)));
    }

    #[test]
    fn bare_object_decodes_without_kind() {
        let obj = decode_object(Kind::Node, b"metadata:\n  name: n1\n").unwrap();
        assert!(obj.downcast::<Node>().is_some());
        assert!(decode_object(Kind::Node, b"kind: Pod\nmetadata:\n  name: n1\n").is_err());
        assert!(decode_object(Kind::Node, b"metadata: [unclosed").is_err());
    }
}
