//! Multi-kind caches and the by-kind dispatcher.
use std::sync::Arc;

use async_trait::async_trait;
use converge_core::{ListOptions, NamespacedName, Object, ResourceKind};
use futures::{stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    event::Event,
    informer::{self, IndexExtractor, Informer},
    source::RemoteSource,
};

/// Failure of a cache-level operation.
#[derive(Debug, Error)]
pub enum Error {
    /// A read failed at the backing store
    #[error(transparent)]
    Store(#[from] informer::Error),
    /// The kind was never registered and implicit informer start is disabled
    ///
    /// This is a caller configuration error: either register the kind up
    /// front or enable implicit informers.
    #[error("kind {kind} is not cached and implicit informer start is disabled")]
    ResourceNotCached {
        /// The unregistered kind
        kind: ResourceKind,
    },
}

/// The uniform store capability implemented by every cache variant
///
/// Reads resolve against local mirrors only and fail explicitly
/// ([`informer::Error::CacheNotStarted`]) when the mirror has not finished
/// its initial sync; they never block and never fabricate partial answers.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Retrieve a deep copy of one object by kind and identity
    fn get(&self, kind: &ResourceKind, key: &NamespacedName) -> Result<Object, Error>;

    /// List objects of a kind, restricted by `opts`
    fn list(&self, kind: &ResourceKind, opts: &ListOptions) -> Result<Vec<Object>, Error>;

    /// The informer backing `kind`, for index registration and subscriptions
    fn informer(&self, kind: &ResourceKind) -> Result<Informer, Error>;

    /// Subscribe to the typed lifecycle events of `kind`
    fn watch(&self, kind: &ResourceKind) -> Result<BoxStream<'static, Event>, Error> {
        Ok(self.informer(kind)?.events().boxed())
    }

    /// Register a named derived index on `kind`'s mirror
    ///
    /// Applied retroactively to current contents; see
    /// [`Store::add_index`](crate::informer::Store::add_index).
    fn add_index(
        &self,
        kind: &ResourceKind,
        field: &str,
        extract: IndexExtractor,
    ) -> Result<(), Error> {
        Ok(self.informer(kind)?.add_index(field, extract)?)
    }

    /// Block until every backing mirror has completed its initial sync
    ///
    /// Returns `false` if `token` fires first; partial sync is not-ready.
    async fn wait_for_sync(&self, token: &CancellationToken) -> bool;

    /// Run every backing synchronization loop until `token` fires, then wait
    /// for their graceful shutdown
    async fn start(&self, token: CancellationToken) -> Result<(), Error>;
}

/// Parameters of an [`InformerCache`]
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Shared parameters for every informer this cache creates
    pub informer: informer::Config,
    /// Refuse lazily creating informers for unseen kinds
    ///
    /// When set, a lookup for an unregistered kind fails with
    /// [`Error::ResourceNotCached`] instead of creating (and, once started,
    /// running) an informer on first access.
    pub disable_implicit_informers: bool,
}

#[derive(Default)]
struct CacheTasks {
    informers: ahash::AHashMap<ResourceKind, Informer>,
    // Set once started; informers created later start immediately
    run_token: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

/// A lazily-populated set of informers over one remote source
///
/// Each kind gets its own [`Informer`], created on first access (unless
/// implicit informers are disabled) and reused idempotently on every later
/// lookup. Informers created before [`Cache::start`] are started together;
/// informers created afterwards start immediately.
pub struct InformerCache {
    source: Arc<dyn RemoteSource>,
    config: CacheConfig,
    state: Mutex<CacheTasks>,
}

impl InformerCache {
    /// Create a cache over `source`
    #[must_use]
    pub fn new(source: Arc<dyn RemoteSource>, config: CacheConfig) -> Self {
        Self {
            source,
            config,
            state: Mutex::new(CacheTasks::default()),
        }
    }

    /// Register `kind` explicitly, creating its informer if needed
    ///
    /// This is how kinds are introduced when implicit informers are
    /// disabled.
    pub fn register(&self, kind: &ResourceKind) -> Informer {
        self.informer_for(kind, true)
            .expect("informer_for cannot refuse an explicit registration")
    }

    fn informer_for(&self, kind: &ResourceKind, register: bool) -> Result<Informer, Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(existing) = state.informers.get(kind) {
            return Ok(existing.clone());
        }
        if !register && self.config.disable_implicit_informers {
            return Err(Error::ResourceNotCached { kind: kind.clone() });
        }
        tracing::debug!(%kind, "creating informer");
        let informer = Informer::new(self.source.clone(), kind.clone(), self.config.informer.clone());
        if let Some(token) = &state.run_token {
            let run = informer.clone();
            let token = token.clone();
            state
                .tasks
                .push(tokio::spawn(async move { run.run(token).await }));
        }
        state.informers.insert(kind.clone(), informer.clone());
        Ok(informer)
    }
}

#[async_trait]
impl Cache for InformerCache {
    fn get(&self, kind: &ResourceKind, key: &NamespacedName) -> Result<Object, Error> {
        Ok(self.informer(kind)?.store().get(key)?)
    }

    fn list(&self, kind: &ResourceKind, opts: &ListOptions) -> Result<Vec<Object>, Error> {
        Ok(self.informer(kind)?.store().list(opts)?)
    }

    fn informer(&self, kind: &ResourceKind) -> Result<Informer, Error> {
        self.informer_for(kind, false)
    }

    async fn wait_for_sync(&self, token: &CancellationToken) -> bool {
        // Kinds registered after this snapshot are covered by their own
        // start-time sync gates, not this call
        let informers: Vec<Informer> = self.state.lock().informers.values().cloned().collect();
        for informer in informers {
            if !informer.wait_for_sync(token).await {
                return false;
            }
        }
        true
    }

    async fn start(&self, token: CancellationToken) -> Result<(), Error> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.run_token.is_some() {
                tracing::warn!("cache already started, ignoring duplicate start");
            } else {
                state.run_token = Some(token.clone());
                for informer in state.informers.values() {
                    let run = informer.clone();
                    let token = token.clone();
                    state
                        .tasks
                        .push(tokio::spawn(async move { run.run(token).await }));
                }
            }
        }
        token.cancelled().await;
        let tasks = std::mem::take(&mut self.state.lock().tasks);
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Routes cache operations to the right backing cache by kind identity
///
/// Lookups resolve through an exact-match table from [`ResourceKind`] to a
/// backing [`Cache`], falling back to one default cache when no specific
/// entry exists. The dispatcher implements [`Cache`] itself, so dispatchers
/// and plain caches compose behind the same capability.
pub struct Dispatcher {
    routes: ahash::AHashMap<ResourceKind, Arc<dyn Cache>>,
    fallback: Arc<dyn Cache>,
}

impl Dispatcher {
    /// Create a dispatcher with only a default cache
    #[must_use]
    pub fn new(fallback: Arc<dyn Cache>) -> Self {
        Self {
            routes: ahash::AHashMap::new(),
            fallback,
        }
    }

    /// Route `kind` to a dedicated backing cache
    #[must_use]
    pub fn route(mut self, kind: ResourceKind, cache: Arc<dyn Cache>) -> Self {
        self.routes.insert(kind, cache);
        self
    }

    fn backing(&self, kind: &ResourceKind) -> &Arc<dyn Cache> {
        self.routes.get(kind).unwrap_or(&self.fallback)
    }

    /// Every distinct backing cache, including the default
    fn distinct(&self) -> Vec<Arc<dyn Cache>> {
        let mut distinct: Vec<Arc<dyn Cache>> = vec![self.fallback.clone()];
        for cache in self.routes.values() {
            if !distinct.iter().any(|seen| Arc::ptr_eq(seen, cache)) {
                distinct.push(cache.clone());
            }
        }
        distinct
    }
}

#[async_trait]
impl Cache for Dispatcher {
    fn get(&self, kind: &ResourceKind, key: &NamespacedName) -> Result<Object, Error> {
        self.backing(kind).get(kind, key)
    }

    fn list(&self, kind: &ResourceKind, opts: &ListOptions) -> Result<Vec<Object>, Error> {
        self.backing(kind).list(kind, opts)
    }

    fn informer(&self, kind: &ResourceKind) -> Result<Informer, Error> {
        self.backing(kind).informer(kind)
    }

    /// True only when **every** distinct backing cache reports synced
    async fn wait_for_sync(&self, token: &CancellationToken) -> bool {
        for cache in self.distinct() {
            if !cache.wait_for_sync(token).await {
                return false;
            }
        }
        true
    }

    /// Start every distinct backing cache concurrently
    ///
    /// Returns on the first cache error, or blocks until `token` fires and
    /// every cache has shut down gracefully.
    async fn start(&self, token: CancellationToken) -> Result<(), Error> {
        let starts = self
            .distinct()
            .into_iter()
            .map(|cache| {
                let token = token.clone();
                async move { cache.start(token).await }
            })
            .collect::<Vec<_>>();
        futures::future::try_join_all(starts).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, CacheConfig, Dispatcher, Error, InformerCache};
    use crate::source::{DeltaStream, ObjectList, RemoteSource, SourceError};
    use async_trait::async_trait;
    use converge_core::{ListOptions, NamespacedName, Object, ResourceKind};
    use futures::{stream, StreamExt};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn widget_kind() -> ResourceKind {
        ResourceKind::new("factory.example.dev", "v1", "Widget")
    }

    fn gadget_kind() -> ResourceKind {
        ResourceKind::new("factory.example.dev", "v1", "Gadget")
    }

    /// A static source: every list returns the same objects of that kind,
    /// watches stay silent.
    struct StaticSource {
        objects: Vec<Object>,
    }

    #[async_trait]
    impl RemoteSource for StaticSource {
        async fn list(&self, kind: &ResourceKind) -> Result<ObjectList, SourceError> {
            Ok(ObjectList {
                items: self
                    .objects
                    .iter()
                    .filter(|obj| &obj.kind == kind)
                    .cloned()
                    .collect(),
                resource_version: "1".into(),
            })
        }

        async fn watch(
            &self,
            _kind: &ResourceKind,
            _resource_version: &str,
        ) -> Result<DeltaStream, SourceError> {
            Ok(stream::pending().boxed())
        }
    }

    fn cache_of(objects: Vec<Object>) -> Arc<InformerCache> {
        Arc::new(InformerCache::new(
            Arc::new(StaticSource { objects }),
            CacheConfig::default(),
        ))
    }

    #[tokio::test]
    async fn informer_lookups_are_idempotent() {
        let cache = cache_of(vec![]);
        let first = cache.informer(&widget_kind()).unwrap();
        let second = cache.informer(&widget_kind()).unwrap();
        // Registering the same index twice can only conflict if both handles
        // share one backing store
        first.add_index("f", |_| vec![]).unwrap();
        assert!(matches!(
            second.add_index("f", |_| vec![]),
            Err(crate::informer::Error::IndexConflict { .. })
        ));
    }

    #[tokio::test]
    async fn disabled_implicit_informers_fail_unregistered_kinds() {
        let cache = Arc::new(InformerCache::new(
            Arc::new(StaticSource { objects: vec![] }),
            CacheConfig {
                disable_implicit_informers: true,
                ..CacheConfig::default()
            },
        ));
        assert!(matches!(
            cache.informer(&widget_kind()),
            Err(Error::ResourceNotCached { .. })
        ));
        // Explicit registration unlocks the kind
        cache.register(&widget_kind());
        assert!(cache.informer(&widget_kind()).is_ok());
    }

    #[tokio::test]
    async fn dispatcher_routes_by_kind_with_default_fallback() {
        let widget = Object::new("w1", &widget_kind());
        let gadget = Object::new("g1", &gadget_kind());
        let specific = cache_of(vec![widget]);
        let fallback = cache_of(vec![gadget]);
        // Pre-register so start and sync-wait cover both kinds
        specific.register(&widget_kind());
        fallback.register(&gadget_kind());

        let dispatcher = Dispatcher::new(fallback).route(widget_kind(), specific);
        let token = CancellationToken::new();
        let dispatcher = Arc::new(dispatcher);
        let starter = dispatcher.clone();
        let start_token = token.clone();
        let task = tokio::spawn(async move { starter.start(start_token).await });

        assert!(dispatcher.wait_for_sync(&token).await);
        assert!(dispatcher
            .get(&widget_kind(), &NamespacedName::new("w1"))
            .is_ok());
        assert!(dispatcher
            .get(&gadget_kind(), &NamespacedName::new("g1"))
            .is_ok());
        assert_eq!(
            dispatcher
                .list(&gadget_kind(), &ListOptions::default())
                .unwrap()
                .len(),
            1
        );
        assert!(dispatcher.watch(&widget_kind()).is_ok());

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_for_sync_is_false_when_any_backing_cache_is_unsynced() {
        let cache = cache_of(vec![]);
        // Registered but never started: sync cannot complete
        cache.register(&widget_kind());
        let dispatcher = Dispatcher::new(cache);
        let token = CancellationToken::new();
        token.cancel();
        assert!(!dispatcher.wait_for_sync(&token).await);
    }

    #[tokio::test]
    async fn reads_before_sync_fail_explicitly() {
        let cache = cache_of(vec![Object::new("w1", &widget_kind())]);
        // Informer exists but its loop has not run
        cache.register(&widget_kind());
        assert!(matches!(
            cache.get(&widget_kind(), &NamespacedName::new("w1")),
            Err(Error::Store(crate::informer::Error::CacheNotStarted { .. }))
        ));
    }
}
