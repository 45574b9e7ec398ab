//! Filename <-> object key encoding.
//!
//! Namespaced kinds: `<namespace>#<name>.yaml`. Cluster-scoped kinds: `<name>.yaml`.

use edgehub_core::{Kind, ObjectKey};

pub const FILE_SUFFIX: &str = ".yaml";
pub const SEPARATOR: char = '#';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyFormatError {
    #[error("{0}: missing .yaml suffix")]
    Suffix(String),
    #[error("{0}: does not match <namespace>#<name>.yaml")]
    Namespaced(String),
    #[error("{0}: does not match <name>.yaml")]
    Cluster(String),
    #[error("{kind} key {key} cannot be encoded")]
    Unencodable { kind: Kind, key: String },
}

/// Whether `file_name` looks like an object file at all: not hidden, right suffix.
pub fn is_object_file(file_name: &str) -> bool {
    !file_name.starts_with('.') && file_name.len() > FILE_SUFFIX.len() && file_name.ends_with(FILE_SUFFIX)
}

/// File name for `key` under `kind`'s directory.
pub fn encode_key(kind: Kind, key: &ObjectKey) -> Result<String, KeyFormatError> {
    let bad = || KeyFormatError::Unencodable { kind, key: key.to_string() };
    if key.name.is_empty() || key.name.contains(SEPARATOR) || key.name.contains('/') || key.name.starts_with('.') {
        return Err(bad());
    }
    match (&key.namespace, kind.namespaced()) {
        (Some(ns), true) if !ns.is_empty() && !ns.contains(SEPARATOR) && !ns.contains('/') && !ns.starts_with('.') => {
            Ok(format!("{}{}{}{}", ns, SEPARATOR, key.name, FILE_SUFFIX))
        }
        (None, false) => Ok(format!("{}{}", key.name, FILE_SUFFIX)),
        _ => Err(bad()),
    }
}

/// Key encoded in `file_name` (a bare file name, not a path).
pub fn decode_key(kind: Kind, file_name: &str) -> Result<ObjectKey, KeyFormatError> {
    let stem = file_name.strip_suffix(FILE_SUFFIX).ok_or_else(|| KeyFormatError::Suffix(file_name.to_string()))?;
    if kind.namespaced() {
        let mut parts = stem.split(SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => Ok(ObjectKey::namespaced(ns, name)),
            _ => Err(KeyFormatError::Namespaced(file_name.to_string())),
        }
    } else if stem.is_empty() || stem.contains(SEPARATOR) {
        Err(KeyFormatError::Cluster(file_name.to_string()))
    } else {
        Ok(ObjectKey::cluster(stem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip_every_kind() {
        for kind in Kind::ALL {
            let key = if kind.namespaced() { ObjectKey::namespaced("kube-system", "web-0") } else { ObjectKey::cluster("edge-1") };
            let file = encode_key(kind, &key).unwrap();
            assert_eq!(decode_key(kind, &file).unwrap(), key, "{kind}");
        }
        assert_eq!(encode_key(Kind::Pod, &ObjectKey::namespaced("ns", "x")).unwrap(), "ns#x.yaml");
        assert_eq!(encode_key(Kind::Node, &ObjectKey::cluster("n1")).unwrap(), "n1.yaml");
    }

    #[test]
    fn misplaced_separator_is_rejected() {
        for bad in ["#x.yaml", "ns#.yaml", "a#b#c.yaml", "nosep.yaml", "ns#x.yml"] {
            assert!(decode_key(Kind::Pod, bad).is_err(), "{bad}");
        }
        assert!(matches!(decode_key(Kind::Node, "ns#n1.yaml"), Err(KeyFormatError::Cluster(_))));
        assert!(matches!(decode_key(Kind::Node, "n1.json"), Err(KeyFormatError::Suffix(_))));
    }

    #[test]
    fn unencodable_keys() {
        assert!(encode_key(Kind::Pod, &ObjectKey::cluster("x")).is_err());
        assert!(encode_key(Kind::Node, &ObjectKey::namespaced("ns", "x")).is_err());
        assert!(encode_key(Kind::Pod, &ObjectKey::namespaced("ns", "a#b")).is_err());
        assert!(encode_key(Kind::Node, &ObjectKey::cluster("../etc")).is_err());
    }

    #[test]
    fn object_file_filter() {
        assert!(is_object_file("ns#x.yaml"));
        assert!(!is_object_file(".ns#x.yaml"));
        assert!(!is_object_file(".yaml"));
        assert!(!is_object_file("ns#x.yaml.tmp"));
    }
}
