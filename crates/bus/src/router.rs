//! Inbound dispatch and outbound publish over one transport.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use edgehub_codec::{CodecError, Compression, RequestEnvelope};
use edgehub_core::{Kind, ObjectKey};
use edgehub_correlate::CorrelationCache;
use edgehub_persist::{ObjectFileStore, PutOutcome, StoreError};
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, warn};

use crate::topics::{Route, Topics};
use crate::transport::{MessageHandler, Qos, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("handler already registered for topic {0}")]
    Duplicate(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no route for topic {0}")]
    Unrouted(String),
    #[error("no store for pushed {0} objects")]
    NoStore(Kind),
    #[error("decompress: {0}")]
    Decompress(#[source] CodecError),
    #[error("decode: {0}")]
    Decode(#[source] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a dispatched message turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Ack { identity: String },
    Pushed { kind: Kind, key: ObjectKey, outcome: PutOutcome },
}

/// Owns the gateway's subscriptions and the encode/compress/publish path.
pub struct Router {
    transport: Arc<dyn Transport>,
    topics: Topics,
    compression: Compression,
    cache: Arc<CorrelationCache>,
    stores: FxHashMap<Kind, ObjectFileStore>,
    registered: Mutex<FxHashSet<String>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("topics", &self.topics).field("compression", &self.compression).finish()
    }
}

impl Router {
    pub fn new(transport: Arc<dyn Transport>, topics: Topics, compression: Compression, cache: Arc<CorrelationCache>) -> Self {
        Self { transport, topics, compression, cache, stores: FxHashMap::default(), registered: Mutex::new(FxHashSet::default()) }
    }

    /// Accept pushes of `store`'s kind and persist them there.
    pub fn with_push_store(mut self, store: ObjectFileStore) -> Self {
        self.stores.insert(store.kind(), store);
        self
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn cache(&self) -> &Arc<CorrelationCache> {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Subscribe `handler` to `topic`. A second registration of the same topic is refused.
    pub async fn register_handler(&self, topic: &str, handler: MessageHandler) -> Result<(), RouterError> {
        {
            let mut reg = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
            if !reg.insert(topic.to_string()) {
                return Err(RouterError::Duplicate(topic.to_string()));
            }
        }
        self.transport.subscribe(topic, handler).await?;
        info!(topic = %topic, "subscribed");
        Ok(())
    }

    /// Subscribe the ack topic and one push topic per configured store.
    pub async fn subscribe_all(self: &Arc<Self>) -> Result<(), RouterError> {
        let mut topics = vec![self.topics.ack()];
        let mut kinds: Vec<Kind> = self.stores.keys().copied().collect();
        kinds.sort();
        topics.extend(kinds.into_iter().map(|k| self.topics.push(k)));
        for topic in topics {
            let weak: Weak<Router> = Arc::downgrade(self);
            let handler: MessageHandler = Arc::new(move |topic: &str, payload: &[u8]| {
                if let Some(router) = weak.upgrade() {
                    router.handle(topic, payload);
                }
            });
            self.register_handler(&topic, handler).await?;
        }
        Ok(())
    }

    fn handle(&self, topic: &str, payload: &[u8]) {
        match self.dispatch(topic, payload) {
            Ok(d) => debug!(topic = %topic, result = ?d, "dispatched"),
            Err(e) => {
                counter!("bus_dropped_total", 1u64);
                warn!(topic = %topic, error = %e, "message dropped");
            }
        }
    }

    /// Route one inbound message by the shape of its topic.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<Dispatched, DispatchError> {
        let route = self.topics.parse(topic).ok_or_else(|| DispatchError::Unrouted(topic.to_string()))?;
        let bytes = self.compression.decompress(payload).map_err(DispatchError::Decompress)?;
        match route {
            Route::Ack => {
                let ack = edgehub_codec::decode_ack(&bytes).map_err(DispatchError::Decode)?;
                let identity = ack.identity.clone();
                counter!("bus_acks_total", 1u64);
                self.cache.set(ack);
                Ok(Dispatched::Ack { identity })
            }
            Route::Push(kind) => {
                let store = self.stores.get(&kind).ok_or(DispatchError::NoStore(kind))?;
                let obj = edgehub_codec::decode_object(kind, &bytes).map_err(DispatchError::Decode)?;
                let key = obj.key();
                let outcome = store.put_or_tombstone(&obj)?;
                counter!("bus_pushes_total", 1u64);
                debug!(kind = %kind, key = %key, "push persisted");
                Ok(Dispatched::Pushed { kind, key, outcome })
            }
            Route::Request { .. } => Err(DispatchError::Unrouted(topic.to_string())),
        }
    }

    /// Encode, compress and publish `req` on its request topic.
    pub async fn publish(&self, req: &RequestEnvelope, timeout: Duration) -> Result<(), TransportError> {
        let started = std::time::Instant::now();
        let topic = self.topics.request(req.kind, &req.key(), req.operation);
        let bytes = edgehub_codec::encode(req)
            .and_then(|b| self.compression.compress(&b))
            .map_err(|e| TransportError::Other(format!("encoding {}: {}", req, e)))?;
        let res = self.transport.publish(&topic, Qos::AtLeastOnce, false, Bytes::from(bytes), timeout).await;
        histogram!("bus_publish_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(()) => {
                counter!("bus_publish_total", 1u64);
                debug!(topic = %topic, request = %req, "published");
            }
            Err(e) => {
                counter!("bus_publish_errors_total", 1u64);
                error!(topic = %topic, request = %req, error = %e, "publish failed");
            }
        }
        res
    }
}
