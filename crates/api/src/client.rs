//! Resource clients over the bus: local mirror first, then a correlated round trip.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use edgehub_bus::Router;
use edgehub_codec::{Operation, PatchKind, RequestEnvelope, RequestOptions};
use edgehub_core::{Kind, KindObject, ManagedObject, ObjectKey};
use edgehub_persist::ObjectFileStore;
use edgehub_store::IndexHandle;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Node, Pod, Secret};
use k8s_openapi::api::coordination::v1::Lease;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Local copy of one kind: the file store and, when running, its index.
#[derive(Clone)]
pub struct Mirror {
    pub store: ObjectFileStore,
    pub index: Option<IndexHandle>,
}

impl Mirror {
    pub fn new(store: ObjectFileStore, index: Option<IndexHandle>) -> Self {
        Self { store, index }
    }

    fn lookup(&self, key: &ObjectKey) -> Option<ManagedObject> {
        match &self.index {
            Some(index) => index.get_by_key(key),
            None => match self.store.load(key) {
                Ok(obj) => obj,
                Err(e) => {
                    warn!(kind = %self.store.kind(), key = %key, error = %e, "local copy unreadable");
                    None
                }
            },
        }
    }

    fn evict(&self, key: &ObjectKey) {
        match self.store.delete(key) {
            Ok(true) => info!(kind = %self.store.kind(), key = %key, "local copy evicted"),
            Ok(false) => {}
            Err(e) => warn!(kind = %self.store.kind(), key = %key, error = %e, "evicting local copy"),
        }
    }
}

/// Options for `get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Skip the local mirror and ask the cloud side.
    pub refresh: bool,
    pub resource_version: Option<String>,
}

/// Shared handle to the gateway's request path. Cheap to clone.
#[derive(Clone)]
pub struct EdgeClient {
    pub(crate) router: Arc<Router>,
    pub(crate) cfg: ClientConfig,
    pub(crate) mirrors: Arc<FxHashMap<Kind, Mirror>>,
}

impl std::fmt::Debug for EdgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<Kind> = self.mirrors.keys().copied().collect();
        kinds.sort();
        f.debug_struct("EdgeClient").field("node", &self.node_name()).field("mirrors", &kinds).finish()
    }
}

impl EdgeClient {
    pub fn new(router: Arc<Router>, cfg: ClientConfig) -> Self {
        Self { router, cfg, mirrors: Arc::new(FxHashMap::default()) }
    }

    pub fn with_mirror(mut self, mirror: Mirror) -> Self {
        Arc::make_mut(&mut self.mirrors).insert(mirror.store.kind(), mirror);
        self
    }

    pub fn node_name(&self) -> &str {
        self.router.topics().node()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn mirror(&self, kind: Kind) -> Option<&Mirror> {
        self.mirrors.get(&kind)
    }

    pub fn nodes(&self) -> Resource<Node> {
        Resource::new(self.clone(), None)
    }

    pub fn pods(&self, namespace: &str) -> Resource<Pod> {
        Resource::new(self.clone(), Some(namespace))
    }

    pub fn leases(&self, namespace: &str) -> Resource<Lease> {
        Resource::new(self.clone(), Some(namespace))
    }

    pub fn events(&self, namespace: &str) -> Events {
        Events { client: self.clone(), namespace: namespace.to_string() }
    }

    pub fn secrets(&self, namespace: &str) -> LocalResource<Secret> {
        LocalResource::new(self.clone(), Some(namespace))
    }

    pub fn config_maps(&self, namespace: &str) -> LocalResource<ConfigMap> {
        LocalResource::new(self.clone(), Some(namespace))
    }

    /// Publish `req` and wait for its acknowledgement under one identity.
    /// `fallback` is what a timeout hands back to the caller.
    pub(crate) async fn round_trip(
        &self,
        req: RequestEnvelope,
        fallback: Option<ManagedObject>,
    ) -> ClientResult<Option<edgehub_core::Payload>> {
        let started = Instant::now();
        let op = req.operation.as_str();
        counter!("client_requests_total", 1u64, "op" => op);
        let timeout = |cause| ClientError::Timeout {
            kind: req.kind,
            operation: req.operation,
            key: req.key(),
            after: self.cfg.ack_wait,
            submitted: fallback.clone().map(Box::new),
            cause,
        };
        if let Err(e) = self.router.publish(&req, self.cfg.publish_timeout).await {
            return Err(timeout(Some(e)));
        }
        let Some(ack) = self.router.cache().pop_wait(&req.identity, self.cfg.ack_wait).await else {
            counter!("client_timeouts_total", 1u64, "op" => op);
            warn!(request = %req, "no ack within wait window");
            return Err(timeout(None));
        };
        histogram!("client_request_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        debug!(request = %req, ack = %ack, "ack received");
        Ok(ack.outcome()?)
    }
}

/// Decode a single-object ack payload as `T`.
fn expect_object<T: KindObject>(payload: Option<edgehub_core::Payload>) -> ClientResult<Option<T>> {
    let Some(obj) = payload.and_then(edgehub_core::Payload::into_object) else {
        return Ok(None);
    };
    let found = obj.kind();
    obj.downcast::<T>().map(Some).ok_or_else(|| ClientError::Internal(format!("ack carried a {} where a {} was expected", found, T::KIND)))
}

/// Get/Create/Update/Patch/Delete for one kind, scoped to a namespace when the kind has one.
pub struct Resource<T> {
    client: EdgeClient,
    namespace: Option<String>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: KindObject> Resource<T> {
    fn new(client: EdgeClient, namespace: Option<&str>) -> Self {
        Self { client, namespace: namespace.map(str::to_string), _kind: PhantomData }
    }

    pub fn key(&self, name: &str) -> ObjectKey {
        ObjectKey::for_kind(T::KIND, self.namespace.as_deref(), name)
    }

    fn mirror(&self) -> Option<&Mirror> {
        self.client.mirror(T::KIND)
    }

    fn local(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.mirror().and_then(|m| m.lookup(key))
    }

    fn check_scope(&self, obj: &T) -> ClientResult<ObjectKey> {
        let key = obj.key();
        if key.name.is_empty() {
            return Err(ClientError::Internal(format!("{} has no name", T::KIND)));
        }
        if T::KIND.namespaced() && key.namespace != self.namespace {
            return Err(ClientError::Internal(format!(
                "{} {} does not belong to namespace {}",
                T::KIND,
                key,
                self.namespace.as_deref().unwrap_or("")
            )));
        }
        Ok(key)
    }

    /// Local mirror first; a miss or `refresh` goes to the cloud side.
    /// A not-found answer evicts any local copy. When the cloud side cannot be
    /// reached the local copy, if any, is returned instead of the timeout.
    pub async fn get(&self, name: &str, opts: GetOptions) -> ClientResult<T> {
        let key = self.key(name);
        let cached = self.local(&key).and_then(ManagedObject::downcast::<T>);
        if let (false, Some(obj)) = (opts.refresh, &cached) {
            counter!("client_local_hits_total", 1u64);
            return Ok(obj.clone());
        }
        let req = RequestEnvelope::new(T::KIND, Operation::Get, &key, self.client.node_name(), true)
            .options(RequestOptions { resource_version: opts.resource_version, ..Default::default() });
        match self.client.round_trip(req, None).await {
            Ok(payload) => expect_object::<T>(payload)?.ok_or(ClientError::NotFound { kind: T::KIND, key }),
            Err(ClientError::Remote(e)) if e.is_not_found() => {
                if let Some(m) = self.mirror() {
                    m.evict(&key);
                }
                Err(ClientError::NotFound { kind: T::KIND, key })
            }
            Err(e) if e.is_timeout() => match cached {
                Some(obj) => {
                    counter!("client_stale_reads_total", 1u64);
                    warn!(kind = %T::KIND, key = %key, error = %e, "cloud unreachable; serving local copy");
                    Ok(obj)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// On timeout the error carries `obj` unchanged.
    pub async fn create(&self, obj: T, opts: RequestOptions) -> ClientResult<T> {
        self.write(Operation::Create, obj, opts).await
    }

    /// On timeout the error carries `obj` unchanged.
    pub async fn update(&self, obj: T, opts: RequestOptions) -> ClientResult<T> {
        self.write(Operation::Update, obj, opts).await
    }

    async fn write(&self, op: Operation, mut obj: T, opts: RequestOptions) -> ClientResult<T> {
        if T::KIND.namespaced() && obj.meta().namespace.as_deref().map_or(true, str::is_empty) {
            obj.meta_mut().namespace = self.namespace.clone();
        }
        self.check_scope(&obj)?;
        let submitted = obj.clone();
        let req = RequestEnvelope::with_object(op, obj, self.client.node_name(), true).options(opts);
        let payload = self.client.round_trip(req, Some(submitted.clone().into_managed())).await?;
        Ok(expect_object::<T>(payload)?.unwrap_or(submitted))
    }

    /// `body` is forwarded verbatim. On timeout the error carries the local copy, if any.
    pub async fn patch(
        &self,
        name: &str,
        patch_kind: PatchKind,
        body: impl Into<String>,
        opts: RequestOptions,
        subresources: &[&str],
    ) -> ClientResult<T> {
        let key = self.key(name);
        let subresources = subresources.iter().map(|s| s.to_string()).collect();
        let req = RequestEnvelope::patch(T::KIND, &key, self.client.node_name(), patch_kind, body.into(), subresources).options(opts);
        let payload = self.client.round_trip(req, self.local(&key)).await?;
        expect_object::<T>(payload)?
            .ok_or_else(|| ClientError::Internal(format!("patch {} {} acknowledged without an object", T::KIND, key)))
    }

    /// Evicts the local copy before anything goes on the wire.
    pub async fn delete(&self, name: &str, opts: RequestOptions) -> ClientResult<()> {
        let key = self.key(name);
        if let Some(m) = self.mirror() {
            m.evict(&key);
        }
        let req = RequestEnvelope::new(T::KIND, Operation::Delete, &key, self.client.node_name(), true).options(opts);
        match self.client.round_trip(req, None).await {
            Ok(_) => Ok(()),
            Err(ClientError::Remote(e)) if e.is_not_found() => Err(ClientError::NotFound { kind: T::KIND, key }),
            Err(e) => Err(e),
        }
    }
}

/// Read-only view of a mirrored kind.
pub struct LocalResource<T> {
    client: EdgeClient,
    namespace: Option<String>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: KindObject> LocalResource<T> {
    fn new(client: EdgeClient, namespace: Option<&str>) -> Self {
        Self { client, namespace: namespace.map(str::to_string), _kind: PhantomData }
    }

    pub fn get(&self, name: &str) -> ClientResult<T> {
        let key = ObjectKey::for_kind(T::KIND, self.namespace.as_deref(), name);
        self.client
            .mirror(T::KIND)
            .and_then(|m| m.lookup(&key))
            .and_then(ManagedObject::downcast::<T>)
            .ok_or(ClientError::NotFound { kind: T::KIND, key })
    }

    /// Everything mirrored in this namespace, sorted by key.
    pub fn list(&self) -> Vec<T> {
        let Some(mirror) = self.client.mirror(T::KIND) else {
            return Vec::new();
        };
        let objects: Vec<ManagedObject> = match &mirror.index {
            Some(index) => index.list(),
            None => mirror.store.keys().unwrap_or_default().iter().filter_map(|k| mirror.lookup(k)).collect(),
        };
        objects
            .into_iter()
            .filter(|o| self.namespace.is_none() || o.meta().namespace == self.namespace)
            .filter_map(ManagedObject::downcast::<T>)
            .collect()
    }
}

/// Events are reported without waiting for an acknowledgement.
pub struct Events {
    client: EdgeClient,
    namespace: String,
}

impl Events {
    pub async fn create(&self, event: Event) -> ClientResult<Event> {
        self.send(Operation::Create, event, None).await
    }

    pub async fn update(&self, event: Event) -> ClientResult<Event> {
        self.send(Operation::Update, event, None).await
    }

    /// Strategic-merge patch of `event` with `data`.
    pub async fn patch(&self, event: Event, data: impl Into<String>) -> ClientResult<Event> {
        self.send(Operation::Patch, event, Some(data.into())).await
    }

    async fn send(&self, op: Operation, mut event: Event, patch: Option<String>) -> ClientResult<Event> {
        if event.metadata.namespace.as_deref().map_or(true, str::is_empty) {
            event.metadata.namespace = Some(self.namespace.clone());
        }
        let node = self.client.node_name();
        let mut req = RequestEnvelope::with_object(op, event.clone(), node, false);
        if let Some(body) = patch {
            req.patch_kind = Some(PatchKind::StrategicMerge);
            req.patch_body = Some(body);
        }
        self.client.router.publish(&req, self.client.cfg.publish_timeout).await?;
        counter!("client_events_total", 1u64);
        debug!(request = %req, "event reported");
        Ok(event)
    }
}
