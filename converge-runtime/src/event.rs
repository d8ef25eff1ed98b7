//! Typed lifecycle events derived from raw store notifications.
use std::sync::Arc;

use converge_core::Object;

use crate::informer::Notification;

/// One typed lifecycle event, carrying full object snapshots
///
/// Events carry snapshots rather than diffs so predicates and request mappers
/// can be pure functions over the event alone.
#[derive(Debug, Clone)]
pub enum Event {
    /// An object appeared that was not in the mirror before
    Created {
        /// The new object
        object: Arc<Object>,
    },
    /// An object in the mirror was replaced
    Updated {
        /// The previously mirrored state
        old: Arc<Object>,
        /// The new state
        new: Arc<Object>,
    },
    /// An object disappeared from the mirror
    Deleted {
        /// The last known state of the object
        object: Arc<Object>,
        /// True when the delete was inferred from a relist rather than
        /// directly observed, so `object` is the final *mirrored* state, not
        /// necessarily the final remote state. Downstream logic must treat
        /// both forms identically.
        state_unknown: bool,
    },
    /// An out-of-band event injected by an external feed
    Generic {
        /// The object the event concerns
        object: Arc<Object>,
    },
}

impl Event {
    /// Reconstruct the typed event for a raw store notification
    ///
    /// This is the single boundary between the raw notification model and the
    /// typed event model; tombstoned removals are unwrapped here and nowhere
    /// else.
    #[must_use]
    pub fn from_notification(notification: Notification) -> Self {
        match notification {
            Notification::Added(object) => Event::Created { object },
            Notification::Replaced { old, new } => Event::Updated { old, new },
            Notification::Removed { object, tombstone } => Event::Deleted {
                object,
                state_unknown: tombstone,
            },
        }
    }

    /// The primary object snapshot of the event (the new state for updates)
    #[must_use]
    pub fn object(&self) -> &Arc<Object> {
        match self {
            Event::Created { object }
            | Event::Deleted { object, .. }
            | Event::Generic { object } => object,
            Event::Updated { new, .. } => new,
        }
    }

    /// All object snapshots carried by the event
    ///
    /// Updates yield both the old and the new state, which is what request
    /// mapping iterates so an identity change enqueues both sides.
    pub fn objects(&self) -> impl Iterator<Item = &Arc<Object>> {
        let (first, second) = match self {
            Event::Created { object }
            | Event::Deleted { object, .. }
            | Event::Generic { object } => (object, None),
            Event::Updated { old, new } => (old, Some(new)),
        };
        std::iter::once(first).chain(second)
    }
}
