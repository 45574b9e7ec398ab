//! Transport seam and an in-process loopback implementation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("publish to {topic} timed out after {after:?}")]
    Timeout { topic: String, after: Duration },
    #[error("transport disconnected")]
    Disconnected,
    #[error("subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("{0}")]
    Other(String),
}

/// Inbound message callback: `(topic, payload)`.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Broker connection as seen by the gateway.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Bytes, timeout: Duration) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError>;

    /// Connection state. Receivers are notified only when the state actually flips.
    fn connected(&self) -> watch::Receiver<bool>;
}

/// MQTT-style filter match: `+` matches one level, a trailing `#` the rest.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// One recorded publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub qos: Qos,
    pub retain: bool,
    pub payload: Bytes,
}

/// Computes the replies a simulated remote side sends for one publish.
pub type Responder = Arc<dyn Fn(&Published) -> Vec<(String, Bytes)> + Send + Sync>;

struct LoopbackInner {
    subs: RwLock<Vec<(String, MessageHandler)>>,
    published: Mutex<Vec<Published>>,
    responder: RwLock<Option<Responder>>,
    online: watch::Sender<bool>,
}

impl Default for LoopbackInner {
    fn default() -> Self {
        Self {
            subs: RwLock::default(),
            published: Mutex::default(),
            responder: RwLock::default(),
            online: watch::channel(true).0,
        }
    }
}

/// In-memory transport. Records publishes, delivers injected messages to
/// matching subscribers, and can play the remote side through a responder.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport").field("online", &self.is_online()).finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every publish fails with `Disconnected`.
    pub fn set_online(&self, online: bool) {
        let flipped = self.inner.online.send_if_modified(|state| std::mem::replace(state, online) != online);
        if flipped {
            info!(online, "loopback connection state changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    pub fn respond_with(&self, responder: impl Fn(&Published) -> Vec<(String, Bytes)> + Send + Sync + 'static) {
        *self.inner.responder.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(responder));
    }

    pub fn clear_responder(&self) {
        *self.inner.responder.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.inner.published).clone()
    }

    pub fn take_published(&self) -> Vec<Published> {
        std::mem::take(&mut *lock(&self.inner.published))
    }

    /// Deliver `payload` to every subscriber whose filter matches `topic`. Returns how many received it.
    pub fn inject(&self, topic: &str, payload: &[u8]) -> usize {
        let handlers: Vec<MessageHandler> = self
            .inner
            .subs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for h in &handlers {
            h(topic, payload);
        }
        handlers.len()
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Bytes, _timeout: Duration) -> Result<(), TransportError> {
        if !self.is_online() {
            return Err(TransportError::Disconnected);
        }
        let msg = Published { topic: topic.to_string(), qos, retain, payload };
        lock(&self.inner.published).push(msg.clone());
        debug!(topic = %topic, bytes = msg.payload.len(), "loopback publish");
        let responder = self.inner.responder.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(responder) = responder {
            for (reply_topic, reply) in responder(&msg) {
                self.inject(&reply_topic, &reply);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError> {
        self.inner.subs.write().unwrap_or_else(PoisonError::into_inner).push((topic.to_string(), handler));
        Ok(())
    }

    fn connected(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }
}
