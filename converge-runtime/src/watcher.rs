//! Watches one resource kind for changes, with resume and relist recovery.
use std::{sync::Arc, time::Duration};

use converge_core::{Object, ResourceKind};
use futures::{stream, Stream, StreamExt};
use thiserror::Error;
use tokio::time::{sleep_until, Instant};

use crate::source::{Delta, DeltaStream, RemoteSource, SourceError};

/// Failure of one synchronization step.
///
/// These are emitted as stream items so the consumer can apply a backoff
/// policy; the watcher itself always recovers on the next poll.
#[derive(Debug, Error)]
pub enum Error {
    /// The initial (or recovery) full list failed
    #[error("failed to perform initial object list: {source}")]
    InitialListFailed {
        /// Underlying source failure
        source: SourceError,
    },
    /// The watch could not be established
    #[error("failed to start watching: {source}")]
    WatchStartFailed {
        /// Underlying source failure
        source: SourceError,
    },
    /// The established watch stream failed
    #[error("watch stream failed: {source}")]
    WatchFailed {
        /// Underlying source failure
        source: SourceError,
    },
}

/// Convenience alias for watcher results
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Watch events returned from a [`watcher`]
#[derive(Debug, Clone)]
pub enum Event {
    /// An object was added or modified
    Applied(Object),
    /// An object was deleted with directly observed final state
    ///
    /// Deletes may be lost across stream restarts; consumers must treat a
    /// [`Event::Restarted`] as the authoritative replacement of everything
    /// seen so far.
    Removed(Object),
    /// A full relist; objects previously applied but absent from the list
    /// must be assumed removed
    Restarted(Vec<Object>),
}

/// Parameters of the synchronization loop
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval between unconditional full relists, a defense against missed
    /// or compacted watch events. `None` disables periodic relisting.
    pub resync_period: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resync_period: Some(Duration::from_secs(600)),
        }
    }
}

/// The internal finite state machine driving the [`watcher`]
enum State {
    /// The next poll will start a full LIST to get all existing objects
    Empty,
    /// The LIST succeeded; the next poll starts the actual watch
    InitListed {
        resource_version: String,
        resync_at: Option<Instant>,
    },
    /// The watch is in progress; events stream through until the connection
    /// drops (resume from the last resource version), the source reports
    /// expiry (fall back to a relist), or the resync deadline fires.
    Watching {
        resource_version: String,
        resync_at: Option<Instant>,
        stream: DeltaStream,
    },
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None` then the function
/// should be called again until it returns a `Some`.
async fn step_trampolined(
    source: &Arc<dyn RemoteSource>,
    kind: &ResourceKind,
    config: &Config,
    state: State,
) -> (Option<Result<Event>>, State) {
    match state {
        State::Empty => match source.list(kind).await {
            Ok(list) => {
                let resync_at = config.resync_period.map(|period| Instant::now() + period);
                (Some(Ok(Event::Restarted(list.items))), State::InitListed {
                    resource_version: list.resource_version,
                    resync_at,
                })
            }
            Err(source) => (
                Some(Err(Error::InitialListFailed { source })),
                State::Empty,
            ),
        },
        State::InitListed {
            resource_version,
            resync_at,
        } => match source.watch(kind, &resource_version).await {
            Ok(stream) => (None, State::Watching {
                resource_version,
                resync_at,
                stream,
            }),
            Err(SourceError::Expired) => (
                Some(Err(Error::WatchStartFailed {
                    source: SourceError::Expired,
                })),
                State::Empty,
            ),
            Err(source) => (
                Some(Err(Error::WatchStartFailed { source })),
                State::InitListed {
                    resource_version,
                    resync_at,
                },
            ),
        },
        State::Watching {
            resource_version,
            resync_at,
            mut stream,
        } => {
            let next = match resync_at {
                Some(at) => tokio::select! {
                    () = sleep_until(at) => None,
                    delta = stream.next() => Some(delta),
                },
                None => Some(stream.next().await),
            };
            let Some(delta) = next else {
                // Resync deadline fired; drop the watch and relist from scratch
                tracing::debug!(%kind, "periodic resync due, relisting");
                return (None, State::Empty);
            };
            match delta {
                Some(Ok(Delta::Applied(obj))) => {
                    let resource_version = obj
                        .metadata
                        .resource_version
                        .clone()
                        .unwrap_or(resource_version);
                    (Some(Ok(Event::Applied(obj))), State::Watching {
                        resource_version,
                        resync_at,
                        stream,
                    })
                }
                Some(Ok(Delta::Removed(obj))) => {
                    let resource_version = obj
                        .metadata
                        .resource_version
                        .clone()
                        .unwrap_or(resource_version);
                    (Some(Ok(Event::Removed(obj))), State::Watching {
                        resource_version,
                        resync_at,
                        stream,
                    })
                }
                Some(Ok(Delta::Bookmark(rv))) => (None, State::Watching {
                    resource_version: rv,
                    resync_at,
                    stream,
                }),
                Some(Err(SourceError::Expired)) => {
                    // We have desynced beyond the source's retention window
                    // and need to start over with a full relist
                    (
                        Some(Err(Error::WatchFailed {
                            source: SourceError::Expired,
                        })),
                        State::Empty,
                    )
                }
                Some(Err(source)) => (Some(Err(Error::WatchFailed { source })), State::Watching {
                    resource_version,
                    resync_at,
                    stream,
                }),
                None => (None, State::InitListed {
                    resource_version,
                    resync_at,
                }),
            }
        }
    }
}

/// Trampoline helper for [`step_trampolined`]
async fn step(
    source: &Arc<dyn RemoteSource>,
    kind: &ResourceKind,
    config: &Config,
    mut state: State,
) -> (Result<Event>, State) {
    loop {
        match step_trampolined(source, kind, config, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a resource kind continuously, recovering the stream upon errors
///
/// The watcher lists the source, remembers the resource version, opens a
/// long-lived watch, and applies resume/relist recovery: a dropped connection
/// resumes from the last seen resource version, an expired watch falls back
/// to a fresh list (emitted as [`Event::Restarted`]), and an optional resync
/// period forces a full relist as a defense against missed watch events.
///
/// Errors from the underlying source are propagated as stream items, after
/// which the stream goes into recovery mode on the next poll. Consumers
/// normally wrap the watcher in a
/// [`StreamBackoff`](crate::utils::StreamBackoff) so each error pauses the
/// loop instead of hot-looping against an unavailable source.
pub fn watcher(
    source: Arc<dyn RemoteSource>,
    kind: ResourceKind,
    config: Config,
) -> impl Stream<Item = Result<Event>> + Send {
    stream::unfold(
        (source, kind, config, State::Empty),
        |(source, kind, config, state)| async {
            let (event, state) = step(&source, &kind, &config, state).await;
            Some((event, (source, kind, config, state)))
        },
    )
}
