//! Topic naming shared by both sides of the bus.
//!
//! - request: `<edge>/<plural>/<namespace>/<name>/<op>` (no namespace segment for nodes)
//! - push:    `<cloud>/<plural>/<node>`
//! - ack:     `<ack>/<node>`

use edgehub_codec::Operation;
use edgehub_core::{Kind, ObjectKey};

pub const DEFAULT_EDGE_ROOT: &str = "/lite/edge";
pub const DEFAULT_CLOUD_ROOT: &str = "/lite/cloud";
pub const DEFAULT_ACK_ROOT: &str = "/lite/cloud/ack";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    edge_root: String,
    cloud_root: String,
    ack_root: String,
    node: String,
}

/// What a topic carries, recovered from its shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Ack,
    Push(Kind),
    Request { kind: Kind, key: ObjectKey, operation: Operation },
}

fn trim_root(root: &str) -> String {
    let r = root.trim_end_matches('/');
    if r.is_empty() { String::from("/") } else { r.to_string() }
}

fn join(root: &str, rest: &[&str]) -> String {
    let mut out = String::from(root.trim_end_matches('/'));
    for seg in rest {
        out.push('/');
        out.push_str(seg);
    }
    out
}

impl Topics {
    pub fn new(edge_root: &str, cloud_root: &str, ack_root: &str, node: &str) -> Self {
        Self { edge_root: trim_root(edge_root), cloud_root: trim_root(cloud_root), ack_root: trim_root(ack_root), node: node.to_string() }
    }

    pub fn with_defaults(node: &str) -> Self {
        Self::new(DEFAULT_EDGE_ROOT, DEFAULT_CLOUD_ROOT, DEFAULT_ACK_ROOT, node)
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn request(&self, kind: Kind, key: &ObjectKey, operation: Operation) -> String {
        match (&key.namespace, kind.namespaced()) {
            (Some(ns), true) => join(&self.edge_root, &[kind.plural(), ns, &key.name, operation.as_str()]),
            _ => join(&self.edge_root, &[kind.plural(), &key.name, operation.as_str()]),
        }
    }

    /// Session start request for this node.
    pub fn start(&self) -> String {
        self.request(Kind::Node, &ObjectKey::cluster(&self.node), Operation::Start)
    }

    /// Liveness report for this node.
    pub fn online(&self) -> String {
        self.request(Kind::Node, &ObjectKey::cluster(&self.node), Operation::Online)
    }

    pub fn push(&self, kind: Kind) -> String {
        join(&self.cloud_root, &[kind.plural(), &self.node])
    }

    pub fn ack(&self) -> String {
        join(&self.ack_root, &[&self.node])
    }

    /// Classify an inbound or outbound topic. `None` for anything not ours.
    pub fn parse(&self, topic: &str) -> Option<Route> {
        if topic == self.ack() {
            return Some(Route::Ack);
        }
        if let Some(kind) = Kind::ALL.into_iter().find(|k| topic == self.push(*k)) {
            return Some(Route::Push(kind));
        }
        let rest = topic.strip_prefix(self.edge_root.trim_end_matches('/'))?.strip_prefix('/')?;
        let segs: Vec<&str> = rest.split('/').collect();
        let kind = Kind::ALL.into_iter().find(|k| Some(&k.plural()) == segs.first())?;
        let (key, op) = match (kind.namespaced(), segs.as_slice()) {
            (true, [_, ns, name, op]) => (ObjectKey::namespaced(*ns, *name), op),
            (false, [_, name, op]) => (ObjectKey::cluster(*name), op),
            _ => return None,
        };
        if key.name.is_empty() || key.namespace.as_deref() == Some("") {
            return None;
        }
        let operation = op.parse().ok()?;
        Some(Route::Request { kind, key, operation })
    }
}
