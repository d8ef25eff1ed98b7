//! The consumed boundary to the remote, authoritative store.
use async_trait::async_trait;
use converge_core::{Object, ResourceKind};
use futures::stream::BoxStream;
use thiserror::Error;

/// Transport-level failure reported by a [`RemoteSource`].
///
/// The runtime retries every variant internally with backoff; none of them is
/// ever surfaced to cache readers.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The watch fell behind the remote's retention window and can no longer
    /// be resumed from the given resource version; a full relist is required.
    #[error("watch expired: resource version no longer retained by the source")]
    Expired,
    /// Any other failure of the underlying transport.
    #[error(transparent)]
    Transport(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl SourceError {
    /// Wrap an arbitrary transport error
    pub fn transport<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Transport(Box::new(err))
    }
}

/// One incremental change reported by a watch.
#[derive(Debug, Clone)]
pub enum Delta {
    /// An object was added or modified
    Applied(Object),
    /// An object was deleted; carries the directly observed final state
    Removed(Object),
    /// A resource-version checkpoint with no object payload
    Bookmark(String),
}

/// The result of listing one kind in full.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    /// Every object of the kind currently known to the source
    pub items: Vec<Object>,
    /// The resource version the list was taken at; watches resume from here
    pub resource_version: String,
}

/// A stream of watch deltas for one kind.
pub type DeltaStream = BoxStream<'static, Result<Delta, SourceError>>;

/// The capability the runtime consumes to observe the authoritative store.
///
/// Implementations own the concrete transport (an HTTP list+watch API, a
/// message bus, an in-memory fixture in tests); the runtime only requires the
/// list-then-watch shape. One `RemoteSource` serves every kind, so a single
/// client can back all informers of a cache.
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
    /// List every object of `kind`, with the resource version of the snapshot
    async fn list(&self, kind: &ResourceKind) -> Result<ObjectList, SourceError>;

    /// Open a long-lived watch for `kind`, resuming after `resource_version`
    ///
    /// The stream may end at any time; the runtime re-establishes it from the
    /// last seen resource version. A [`SourceError::Expired`] item tells the
    /// runtime to fall back to a full relist.
    async fn watch(&self, kind: &ResourceKind, resource_version: &str) -> Result<DeltaStream, SourceError>;
}
