//! Edgehub bus: the transport seam, an in-process loopback transport, topic
//! naming and the router tying inbound messages to the correlation cache and
//! the object stores.

#![forbid(unsafe_code)]

mod router;
mod topics;
mod transport;

pub use router::{DispatchError, Dispatched, Router, RouterError};
pub use topics::{Route, Topics, DEFAULT_ACK_ROOT, DEFAULT_CLOUD_ROOT, DEFAULT_EDGE_ROOT};
pub use transport::{topic_matches, LoopbackTransport, MessageHandler, Published, Qos, Responder, Transport, TransportError};
