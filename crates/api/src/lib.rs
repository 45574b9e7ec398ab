//! Edgehub resource clients.
//!
//! Controllers on the edge node use [`EdgeClient`] the way they would use an
//! ordinary Kubernetes client. Reads prefer the local mirror; writes travel as
//! request envelopes over the bus and wait a bounded time for the matching ack.
//! [`EdgeHub`] assembles the mirrors, router, sweeper, heartbeat and reconnect
//! handshake from an [`EdgeConfig`].

#![forbid(unsafe_code)]

mod client;
mod config;
mod error;
mod heartbeat;
mod reconcile;
mod runtime;

pub use client::{EdgeClient, Events, GetOptions, LocalResource, Mirror, Resource};
pub use config::{ClientConfig, ConfigError, EdgeConfig};
pub use error::{ClientError, ClientResult, StartError};
pub use heartbeat::spawn_heartbeat;
pub use reconcile::{spawn_reconnect_handshake, ReconcileReport};
pub use runtime::{EdgeHub, MIRRORED_KINDS};

pub use edgehub_codec::{PatchKind, RequestOptions};
