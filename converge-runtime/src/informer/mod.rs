//! One kind's eventually-consistent local mirror and its synchronization loop.
mod store;

use std::{sync::Arc, time::Duration};

use backoff::ExponentialBackoff;
use converge_core::{Object, ResourceKind};
use futures::{pin_mut, Stream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub use self::store::{Error, IndexExtractor, Store, Writer};
use crate::{
    event::Event,
    source::RemoteSource,
    utils::StreamBackoff,
    watcher::{self, watcher},
};

/// A raw store notification, as fanned out to event adapters
///
/// Notifications describe mirror changes; [`Event`](crate::event::Event)
/// is the typed lifecycle view derived from them at exactly one boundary.
#[derive(Debug, Clone)]
pub enum Notification {
    /// An object appeared that was not mirrored before
    Added(Arc<Object>),
    /// A mirrored object was replaced
    Replaced {
        /// The previously mirrored state
        old: Arc<Object>,
        /// The new state
        new: Arc<Object>,
    },
    /// A mirrored object was removed
    Removed {
        /// The last known state of the object
        object: Arc<Object>,
        /// True when the removal was inferred from a relist diff because the
        /// real delete was missed by the watch
        tombstone: bool,
    },
}

/// Parameters of one informer
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval between unconditional full relists; `None` disables them
    pub resync_period: Option<Duration>,
    /// Capacity of the notification fan-out buffer; a subscriber that falls
    /// further behind than this loses its oldest notifications (the periodic
    /// relist is the safety net for anything lost this way)
    pub buffer: usize,
    /// Retry policy for transient list/watch errors
    ///
    /// The default never gives up: readers only ever see explicit
    /// not-synced/not-found answers, so the loop's only useful move on a
    /// failing source is to keep retrying.
    pub backoff: ExponentialBackoff,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resync_period: Some(Duration::from_secs(600)),
            buffer: 1024,
            backoff: ExponentialBackoff {
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            },
        }
    }
}

struct Inner {
    config: Config,
    source: Arc<dyn RemoteSource>,
    store: Store,
    // Taken by the first run; repeated runs are no-ops
    writer: Mutex<Option<Writer>>,
    notify_tx: async_broadcast::Sender<Notification>,
    notify_rx: async_broadcast::InactiveReceiver<Notification>,
}

/// The indexed local store of one resource kind
///
/// An informer owns the synchronization loop keeping one kind's mirror
/// eventually consistent via list+watch, serves reads from the mirror, and
/// fans raw notifications out to any number of subscribers. Handles are
/// cheap clones of one shared instance: an informer's loop runs at most
/// once no matter how many handles exist.
#[derive(Clone)]
pub struct Informer {
    inner: Arc<Inner>,
}

impl Informer {
    /// Create an informer for `kind` over the given source
    ///
    /// The synchronization loop does not start until [`Informer::run`] is
    /// called; reads fail with [`Error::CacheNotStarted`] until the initial
    /// list completes.
    #[must_use]
    pub fn new(source: Arc<dyn RemoteSource>, kind: ResourceKind, config: Config) -> Self {
        let writer = Writer::new(kind);
        let store = writer.as_reader();
        let (mut notify_tx, notify_rx) = async_broadcast::broadcast(config.buffer);
        notify_tx.set_overflow(true);
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                store,
                writer: Mutex::new(Some(writer)),
                notify_tx,
                notify_rx: notify_rx.deactivate(),
            }),
        }
    }

    /// The kind this informer mirrors
    #[must_use]
    pub fn kind(&self) -> &ResourceKind {
        self.inner.store.kind()
    }

    /// A read handle to the mirror
    #[must_use]
    pub fn store(&self) -> Store {
        self.inner.store.clone()
    }

    /// Register a named derived index on the mirror
    ///
    /// Applied retroactively to everything currently mirrored and maintained
    /// for every future change; see [`Store::add_index`].
    pub fn add_index(
        &self,
        field: &str,
        extract: impl Fn(&Object) -> Vec<String> + Send + Sync + 'static,
    ) -> Result<(), Error> {
        self.inner.store.add_index(field, extract)
    }

    /// Subscribe to raw store notifications
    #[must_use]
    pub fn subscribe(&self) -> async_broadcast::Receiver<Notification> {
        self.inner.notify_rx.activate_cloned()
    }

    /// Subscribe to typed lifecycle events
    #[must_use]
    pub fn events(&self) -> impl Stream<Item = Event> + Send {
        self.subscribe().map(Event::from_notification)
    }

    /// Whether the initial synchronization has completed
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.inner.store.is_ready()
    }

    /// Block until the initial synchronization completes or `token` fires
    ///
    /// Returns `false` if the token fired first.
    pub async fn wait_for_sync(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            () = self.inner.store.ready() => true,
            () = token.cancelled() => false,
        }
    }

    /// Run the synchronization loop until `token` fires
    ///
    /// Transient source errors are logged and retried with the configured
    /// backoff; they never reach readers. Calling `run` a second time is a
    /// no-op, preserving the start-at-most-once invariant for callers that
    /// share handles.
    pub async fn run(&self, token: CancellationToken) {
        let Some(mut writer) = self.inner.writer.lock().take() else {
            tracing::debug!(kind = %self.kind(), "informer already started, ignoring duplicate run");
            return;
        };
        let kind = self.kind().clone();
        let watch = watcher(self.inner.source.clone(), kind.clone(), watcher::Config {
            resync_period: self.inner.config.resync_period,
        });
        let stream = StreamBackoff::new(watch, self.inner.config.backoff.clone());
        pin_mut!(stream);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        for notification in writer.apply_watcher_event(&event) {
                            // Overflow mode: a full buffer drops the oldest
                            // notification instead of stalling the sync loop
                            let _ = self.inner.notify_tx.try_broadcast(notification);
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(kind = %kind, %error, "transient sync error, backing off");
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(kind = %kind, "informer sync loop exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Informer, Notification};
    use crate::source::{Delta, DeltaStream, ObjectList, RemoteSource, SourceError};
    use async_trait::async_trait;
    use converge_core::{NamespacedName, Object, ResourceKind};
    use futures::{stream, StreamExt};
    use parking_lot::Mutex;
    use std::{collections::VecDeque, sync::Arc};
    use tokio_util::sync::CancellationToken;

    fn widget_kind() -> ResourceKind {
        ResourceKind::new("factory.example.dev", "v1", "Widget")
    }

    fn widget(name: &str) -> Object {
        Object::new(name, &widget_kind()).within("plant")
    }

    /// A source scripted with successive list answers and watch scripts.
    struct ScriptedSource {
        lists: Mutex<VecDeque<ObjectList>>,
        watches: Mutex<VecDeque<Vec<Result<Delta, SourceError>>>>,
    }

    impl ScriptedSource {
        fn new(
            lists: Vec<Vec<Object>>,
            watches: Vec<Vec<Result<Delta, SourceError>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                lists: Mutex::new(
                    lists
                        .into_iter()
                        .enumerate()
                        .map(|(i, items)| ObjectList {
                            items,
                            resource_version: i.to_string(),
                        })
                        .collect(),
                ),
                watches: Mutex::new(watches.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl RemoteSource for ScriptedSource {
        async fn list(&self, _kind: &ResourceKind) -> Result<ObjectList, SourceError> {
            Ok(self.lists.lock().pop_front().unwrap_or_default())
        }

        async fn watch(
            &self,
            _kind: &ResourceKind,
            _resource_version: &str,
        ) -> Result<DeltaStream, SourceError> {
            let script = self.watches.lock().pop_front().unwrap_or_default();
            Ok(stream::iter(script).chain(stream::pending()).boxed())
        }
    }

    /// Default config with a near-zero error backoff to keep tests fast
    fn fast_config() -> Config {
        Config {
            backoff: backoff::ExponentialBackoff {
                initial_interval: std::time::Duration::from_millis(1),
                randomization_factor: 0.0,
                max_elapsed_time: None,
                ..backoff::ExponentialBackoff::default()
            },
            ..Config::default()
        }
    }

    fn name_of(n: &Notification) -> String {
        let obj = match n {
            Notification::Added(obj) => obj,
            Notification::Replaced { new, .. } => new,
            Notification::Removed { object, .. } => object,
        };
        obj.metadata.name.clone().unwrap_or_default()
    }

    #[tokio::test]
    async fn relist_diff_tombstones_vanished_objects() {
        // First list holds a and b; the watch expires immediately, and the
        // recovery relist only holds a. The missed delete of b must surface
        // as a tombstoned removal; a subsequent observed delete of a must not
        // be tombstoned.
        let source = ScriptedSource::new(
            vec![vec![widget("a"), widget("b")], vec![widget("a")]],
            vec![vec![Err(SourceError::Expired)], vec![Ok(Delta::Removed(widget("a")))]],
        );
        let informer = Informer::new(source, widget_kind(), fast_config());
        let mut notifications = informer.subscribe();

        let token = CancellationToken::new();
        let runner = informer.clone();
        let run_token = token.clone();
        let task = tokio::spawn(async move { runner.run(run_token).await });

        // Initial list: a and b in unspecified order
        let mut first = vec![
            notifications.recv().await.unwrap(),
            notifications.recv().await.unwrap(),
        ];
        first.sort_by_key(name_of);
        assert!(matches!(&first[0], Notification::Added(o) if o.metadata.name.as_deref() == Some("a")));
        assert!(matches!(&first[1], Notification::Added(o) if o.metadata.name.as_deref() == Some("b")));

        // Recovery relist: a replaced, b tombstoned
        let mut second = vec![
            notifications.recv().await.unwrap(),
            notifications.recv().await.unwrap(),
        ];
        second.sort_by_key(name_of);
        assert!(matches!(&second[0], Notification::Replaced { .. }));
        assert!(
            matches!(&second[1], Notification::Removed { object, tombstone: true } if object.metadata.name.as_deref() == Some("b"))
        );

        // Observed delete: not a tombstone
        assert!(matches!(
            notifications.recv().await.unwrap(),
            Notification::Removed {
                tombstone: false,
                ..
            }
        ));

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_sync_gates_reads() {
        let source = ScriptedSource::new(vec![vec![widget("a")]], vec![vec![]]);
        let informer = Informer::new(source, widget_kind(), Config::default());
        assert!(!informer.is_synced());
        let key = NamespacedName::new("a").within("plant");
        assert!(informer.store().get(&key).is_err());

        let token = CancellationToken::new();
        let runner = informer.clone();
        let run_token = token.clone();
        let task = tokio::spawn(async move { runner.run(run_token).await });

        assert!(informer.wait_for_sync(&token).await);
        assert!(informer.is_synced());
        assert!(informer.store().get(&key).is_ok());

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_sync_unblocks_on_cancellation() {
        let source = ScriptedSource::new(vec![], vec![]);
        // Never run; sync can only be interrupted by the token
        let informer = Informer::new(source, widget_kind(), Config::default());
        let token = CancellationToken::new();
        token.cancel();
        assert!(!informer.wait_for_sync(&token).await);
    }

    #[tokio::test]
    async fn duplicate_run_is_a_noop() {
        let source = ScriptedSource::new(vec![vec![widget("a")]], vec![vec![]]);
        let informer = Informer::new(source, widget_kind(), Config::default());
        let token = CancellationToken::new();
        let runner = informer.clone();
        let run_token = token.clone();
        let task = tokio::spawn(async move { runner.run(run_token).await });
        informer.wait_for_sync(&token).await;

        // The writer is already taken; this returns immediately
        informer.run(token.clone()).await;

        token.cancel();
        task.await.unwrap();
    }
}
