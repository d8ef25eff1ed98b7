//! The indexed local mirror of one resource kind.
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use converge_core::{ListOptions, NamespacedName, Object, ResourceKind};
use parking_lot::RwLock;
use thiserror::Error;

use super::Notification;
use crate::{utils::ReadyToken, watcher};

/// Failure of a cached read.
///
/// This is the entire error surface of the store: transient synchronization
/// problems are retried internally and never appear here, so a reader either
/// gets a current answer or one of these explicit refusals.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The initial list+watch synchronization has not completed yet
    #[error("cache for {kind} has not completed its initial sync")]
    CacheNotStarted {
        /// The kind whose cache is still syncing
        kind: ResourceKind,
    },
    /// No object is stored under the requested identity
    #[error("no cached object {key} of kind {kind}")]
    NotFound {
        /// The kind that was queried
        kind: ResourceKind,
        /// The identity that missed
        key: NamespacedName,
    },
    /// A field selector referenced a field with no registered index
    #[error("field {field:?} of kind {kind} has no registered index")]
    FieldNotIndexed {
        /// The kind that was queried
        kind: ResourceKind,
        /// The unindexed field
        field: String,
    },
    /// An index was registered twice under one name
    #[error("index {field:?} is already registered for kind {kind}")]
    IndexConflict {
        /// The kind the index was registered on
        kind: ResourceKind,
        /// The conflicting index name
        field: String,
    },
}

/// Extracts the index keys of an object for one named index.
pub type IndexExtractor = Box<dyn Fn(&Object) -> Vec<String> + Send + Sync>;

/// One named derived index over the store contents.
///
/// Entries are kept under both the bare key (cross-namespace lookups) and a
/// `namespace/key` form, so both scopes resolve with a single exact-match
/// table hit.
struct Index {
    extract: IndexExtractor,
    entries: AHashMap<String, AHashSet<NamespacedName>>,
}

impl Index {
    fn new(extract: IndexExtractor) -> Self {
        Self {
            extract,
            entries: AHashMap::new(),
        }
    }

    fn scoped_keys(&self, obj: &Object) -> Vec<String> {
        let mut keys = Vec::new();
        for key in (self.extract)(obj) {
            if let Some(ns) = &obj.metadata.namespace {
                keys.push(format!("{ns}/{key}"));
            }
            keys.push(key);
        }
        keys
    }

    fn insert(&mut self, id: &NamespacedName, obj: &Object) {
        for key in self.scoped_keys(obj) {
            self.entries.entry(key).or_default().insert(id.clone());
        }
    }

    fn remove(&mut self, id: &NamespacedName, obj: &Object) {
        for key in self.scoped_keys(obj) {
            if let Some(ids) = self.entries.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    fn rehydrate(&mut self, objects: &AHashMap<NamespacedName, Arc<Object>>) {
        self.entries.clear();
        for (id, obj) in objects {
            self.insert(id, obj);
        }
    }
}

#[derive(Default)]
struct CacheState {
    objects: AHashMap<NamespacedName, Arc<Object>>,
    indexes: AHashMap<String, Index>,
}

struct Inner {
    kind: ResourceKind,
    state: RwLock<CacheState>,
    ready: ReadyToken,
}

/// A writable store handle
///
/// This is exclusive since it is not safe to feed a single store from
/// multiple synchronization loops: `Restarted` events clobber each other's
/// state. The owning informer holds the writer; everyone else reads through
/// [`Store`] handles.
pub struct Writer {
    inner: Arc<Inner>,
}

impl Writer {
    /// Create a writer (and with it, the backing store) for one kind
    #[must_use]
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                state: RwLock::new(CacheState::default()),
                ready: ReadyToken::new(),
            }),
        }
    }

    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader`
    /// multiple times, or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store {
        Store {
            inner: self.inner.clone(),
        }
    }

    /// Applies a single watcher event to the store, returning the raw
    /// notifications the event produced.
    ///
    /// A relist ([`watcher::Event::Restarted`]) is the one place a removal is
    /// inferred rather than observed: objects that vanish across a relist are
    /// reported with `tombstone: true` since their true final state was never
    /// seen. The first applied relist also marks the store as synced.
    pub fn apply_watcher_event(&mut self, event: &watcher::Event) -> Vec<Notification> {
        let notifications = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            match event {
                watcher::Event::Applied(obj) => {
                    let Some(id) = obj.to_ref() else {
                        tracing::warn!(kind = %self.inner.kind, "discarding applied object without a name");
                        return Vec::new();
                    };
                    let new = Arc::new(obj.clone());
                    let old = state.objects.insert(id.clone(), new.clone());
                    for index in state.indexes.values_mut() {
                        if let Some(old) = &old {
                            index.remove(&id, old);
                        }
                        index.insert(&id, &new);
                    }
                    match old {
                        Some(old) => vec![Notification::Replaced { old, new }],
                        None => vec![Notification::Added(new)],
                    }
                }
                watcher::Event::Removed(obj) => {
                    let Some(id) = obj.to_ref() else {
                        tracing::warn!(kind = %self.inner.kind, "discarding removed object without a name");
                        return Vec::new();
                    };
                    match state.objects.remove(&id) {
                        Some(old) => {
                            for index in state.indexes.values_mut() {
                                index.remove(&id, &old);
                            }
                            // The delta carries the directly observed final state
                            vec![Notification::Removed {
                                object: Arc::new(obj.clone()),
                                tombstone: false,
                            }]
                        }
                        None => {
                            tracing::debug!(kind = %self.inner.kind, %id, "removal for object not in store");
                            Vec::new()
                        }
                    }
                }
                watcher::Event::Restarted(objs) => {
                    let mut new_objects = AHashMap::with_capacity(objs.len());
                    for obj in objs {
                        let Some(id) = obj.to_ref() else {
                            tracing::warn!(kind = %self.inner.kind, "discarding listed object without a name");
                            continue;
                        };
                        new_objects.insert(id, Arc::new(obj.clone()));
                    }
                    let mut notifications = Vec::new();
                    for (id, new) in &new_objects {
                        match state.objects.get(id) {
                            Some(old) => notifications.push(Notification::Replaced {
                                old: old.clone(),
                                new: new.clone(),
                            }),
                            None => notifications.push(Notification::Added(new.clone())),
                        }
                    }
                    for (id, old) in &state.objects {
                        if !new_objects.contains_key(id) {
                            // The real delete was missed, so the last state we
                            // mirrored is only an inference
                            notifications.push(Notification::Removed {
                                object: old.clone(),
                                tombstone: true,
                            });
                        }
                    }
                    state.objects = new_objects;
                    for index in state.indexes.values_mut() {
                        index.rehydrate(&state.objects);
                    }
                    notifications
                }
            }
        };
        if matches!(event, watcher::Event::Restarted(_)) {
            self.inner.ready.make_ready();
        }
        notifications
    }
}

/// A readable cache of the objects of one kind
///
/// Cloning produces a new handle to the same backing store. Reads fail with
/// [`Error::CacheNotStarted`] until the initial synchronization completes;
/// after that they only ever return current contents or [`Error::NotFound`],
/// never a partial answer.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// The kind this store mirrors
    #[must_use]
    pub fn kind(&self) -> &ResourceKind {
        &self.inner.kind
    }

    /// Whether the initial synchronization has completed
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.is_ready()
    }

    /// Wait until the initial synchronization has completed
    pub async fn ready(&self) {
        self.inner.ready.ready().await;
    }

    fn ensure_ready(&self) -> Result<(), Error> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::CacheNotStarted {
                kind: self.inner.kind.clone(),
            })
        }
    }

    /// Retrieve an independent deep copy of the entry at `key`
    ///
    /// `key.namespace` is ignored for cluster-scoped kinds. Note that this is
    /// a cache and may be stale: deleted objects may still appear and new
    /// objects may be missing. Reconcilers that cannot tolerate this should
    /// return an error and rely on the requeue policy.
    pub fn get(&self, key: &NamespacedName) -> Result<Object, Error> {
        self.get_shared(key).map(|obj| (*obj).clone())
    }

    /// Retrieve the entry at `key` without copying it
    ///
    /// This is the hot-path opt-out of the deep-copy default; the entry stays
    /// shared with the store, which is safe precisely because `Arc<Object>`
    /// grants no mutable access.
    pub fn get_shared(&self, key: &NamespacedName) -> Result<Arc<Object>, Error> {
        self.ensure_ready()?;
        let state = self.inner.state.read();
        state
            .objects
            .get(key)
            // Try to erase the namespace and look again, in case the object
            // is cluster-scoped
            .or_else(|| {
                if key.namespace.is_some() {
                    state.objects.get(&NamespacedName {
                        name: key.name.clone(),
                        namespace: None,
                    })
                } else {
                    None
                }
            })
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: self.inner.kind.clone(),
                key: key.clone(),
            })
    }

    /// Return independent deep copies of the entries selected by `opts`
    pub fn list(&self, opts: &ListOptions) -> Result<Vec<Object>, Error> {
        Ok(self
            .list_shared(opts)?
            .into_iter()
            .map(|obj| (*obj).clone())
            .collect())
    }

    /// Return shared handles to the entries selected by `opts`
    ///
    /// The same no-mutation-by-construction contract as
    /// [`Store::get_shared`] applies.
    pub fn list_shared(&self, opts: &ListOptions) -> Result<Vec<Arc<Object>>, Error> {
        self.ensure_ready()?;
        let state = self.inner.state.read();

        let mut selected: Vec<(NamespacedName, Arc<Object>)> = match &opts.field_selector {
            Some(fields) if !fields.0.is_empty() => {
                // Every requirement must resolve through a registered index;
                // the candidate set is the intersection of the per-field hits
                let mut candidates: Option<AHashSet<NamespacedName>> = None;
                for requirement in &fields.0 {
                    let index = state.indexes.get(&requirement.key).ok_or_else(|| {
                        Error::FieldNotIndexed {
                            kind: self.inner.kind.clone(),
                            field: requirement.key.clone(),
                        }
                    })?;
                    let lookup = match &opts.namespace {
                        Some(ns) => format!("{ns}/{}", requirement.value),
                        None => requirement.value.clone(),
                    };
                    let hits = index.entries.get(&lookup).cloned().unwrap_or_default();
                    candidates = Some(match candidates {
                        None => hits,
                        Some(prev) => prev.intersection(&hits).cloned().collect(),
                    });
                    if candidates.as_ref().is_some_and(|c| c.is_empty()) {
                        break;
                    }
                }
                candidates
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|id| state.objects.get(&id).map(|obj| (id.clone(), obj.clone())))
                    .collect()
            }
            _ => state
                .objects
                .iter()
                .filter(|(id, _)| match &opts.namespace {
                    Some(ns) => id.namespace.as_deref() == Some(ns),
                    None => true,
                })
                .map(|(id, obj)| (id.clone(), obj.clone()))
                .collect(),
        };

        if let Some(selector) = &opts.label_selector {
            selected.retain(|(_, obj)| selector.matches(&obj.metadata.labels));
        }
        selected.sort_by(|(a, _), (b, _)| a.cmp(b));
        if let Some(limit) = opts.limit {
            selected.truncate(limit);
        }
        Ok(selected.into_iter().map(|(_, obj)| obj).collect())
    }

    /// Register a named derived index
    ///
    /// The index is applied retroactively to all currently stored objects and
    /// maintained on every future apply/remove. Registration takes the store's
    /// write lock, so it is serialized against a concurrently starting
    /// synchronization loop.
    pub fn add_index(
        &self,
        field: &str,
        extract: impl Fn(&Object) -> Vec<String> + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let mut state = self.inner.state.write();
        if state.indexes.contains_key(field) {
            return Err(Error::IndexConflict {
                kind: self.inner.kind.clone(),
                field: field.to_string(),
            });
        }
        let mut index = Index::new(Box::new(extract));
        index.rehydrate(&state.objects);
        state.indexes.insert(field.to_string(), index);
        Ok(())
    }
}
