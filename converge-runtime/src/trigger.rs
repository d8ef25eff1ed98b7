//! Turns typed lifecycle events into deduplicated reconcile requests.
//!
//! The adapter between a store's event feed and a controller's queue is
//! stateless: a chain of [`Predicate`]s decides keep/drop, and a mapping
//! function derives the request identities to enqueue. Everything else
//! (scheduling, deduplication across time, backoff) lives in the queue.
use std::{collections::HashSet, hash::Hash};

use converge_core::NamespacedName;
use futures::{future, stream, Stream, StreamExt};

use crate::event::Event;

/// A pure keep/drop decision over one event
///
/// Predicates form an ANDed chain: the first one returning `false`
/// short-circuits the rest and drops the event before any request is
/// derived. Any `Fn(&Event) -> bool` is a predicate.
pub trait Predicate: Send + Sync {
    /// Keep (`true`) or drop (`false`) the event
    fn accept(&self, event: &Event) -> bool;
}

impl<F: Fn(&Event) -> bool + Send + Sync> Predicate for F {
    fn accept(&self, event: &Event) -> bool {
        (self)(event)
    }
}

/// An ANDed chain of predicates
pub type PredicateChain = Vec<Box<dyn Predicate>>;

/// Derive a request stream from an event stream with a custom mapper
///
/// Every kept event is mapped to zero or more request identities. The
/// identities of one event are deduplicated before they are emitted, so an
/// update whose old and new object map to the same request enqueues it once
/// per notification, not twice.
pub fn trigger_with<S, R, F>(
    events: S,
    predicates: PredicateChain,
    mapper: F,
) -> impl Stream<Item = R>
where
    S: Stream<Item = Event>,
    R: Eq + Hash + Clone,
    F: Fn(&Event) -> Vec<R>,
{
    events
        .filter(move |event| future::ready(predicates.iter().all(|p| p.accept(event))))
        .flat_map(move |event| {
            let mut requests = mapper(&event);
            let mut seen = HashSet::with_capacity(requests.len());
            requests.retain(|request| seen.insert(request.clone()));
            stream::iter(requests)
        })
}

/// Derive a request stream that reconciles the event's own object
///
/// Updates map both the old and the new snapshot, so an object whose
/// identity changes triggers reconciliation of both identities; the
/// ordinary same-identity update collapses to one request.
pub fn trigger_self<S>(
    events: S,
    predicates: PredicateChain,
) -> impl Stream<Item = NamespacedName>
where
    S: Stream<Item = Event>,
{
    trigger_with(events, predicates, |event| {
        event.objects().filter_map(|obj| obj.to_ref()).collect()
    })
}

/// Ready-made predicates for common noise filters
pub mod predicates {
    use crate::event::Event;

    /// Drop updates whose spec generation did not change
    ///
    /// Status-only writes leave the generation untouched, which makes this
    /// the standard filter for controllers that only care about spec edits.
    /// Non-update events always pass.
    #[must_use]
    pub fn generation_changed(event: &Event) -> bool {
        match event {
            Event::Updated { old, new } => old.metadata.generation != new.metadata.generation,
            _ => true,
        }
    }

    /// Drop updates whose resource version did not change
    ///
    /// Useful to suppress the no-op replacements produced by periodic
    /// relists. Non-update events always pass.
    #[must_use]
    pub fn resource_version_changed(event: &Event) -> bool {
        match event {
            Event::Updated { old, new } => {
                old.metadata.resource_version != new.metadata.resource_version
            }
            _ => true,
        }
    }

    /// Drop updates whose labels did not change; non-update events pass
    #[must_use]
    pub fn labels_changed(event: &Event) -> bool {
        match event {
            Event::Updated { old, new } => old.metadata.labels != new.metadata.labels,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{predicates, trigger_self, trigger_with, Predicate};
    use crate::event::Event;
    use converge_core::{NamespacedName, Object, ResourceKind};
    use futures::{stream, StreamExt};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn widget_kind() -> ResourceKind {
        ResourceKind::new("factory.example.dev", "v1", "Widget")
    }

    fn obj(name: &str, rv: &str) -> Arc<Object> {
        Arc::new(Object::new(name, &widget_kind()).within("plant").at_version(rv))
    }

    #[tokio::test]
    async fn update_mapping_old_and_new_to_one_identity_enqueues_once() {
        let events = stream::iter(vec![Event::Updated {
            old: obj("a", "1"),
            new: obj("a", "2"),
        }]);
        let requests: Vec<_> = trigger_self(events, Vec::new()).collect().await;
        assert_eq!(requests, vec![NamespacedName::new("a").within("plant")]);
    }

    #[tokio::test]
    async fn update_changing_identity_enqueues_both_sides() {
        let events = stream::iter(vec![Event::Updated {
            old: obj("a", "1"),
            new: obj("b", "2"),
        }]);
        let requests: Vec<_> = trigger_self(events, Vec::new()).collect().await;
        assert_eq!(requests, vec![
            NamespacedName::new("a").within("plant"),
            NamespacedName::new("b").within("plant"),
        ]);
    }

    #[tokio::test]
    async fn tombstoned_and_confirmed_deletes_trigger_identically() {
        for state_unknown in [false, true] {
            let events = stream::iter(vec![Event::Deleted {
                object: obj("a", "1"),
                state_unknown,
            }]);
            let requests: Vec<_> = trigger_self(events, Vec::new()).collect().await;
            assert_eq!(requests, vec![NamespacedName::new("a").within("plant")]);
        }
    }

    #[tokio::test]
    async fn predicate_chain_is_anded_and_short_circuits() {
        let later_calls = Arc::new(AtomicUsize::new(0));
        let counter = later_calls.clone();
        let drop_all: Box<dyn Predicate> = Box::new(|_: &Event| false);
        let count_calls: Box<dyn Predicate> = Box::new(move |_: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        let events = stream::iter(vec![Event::Created { object: obj("a", "1") }]);
        let requests: Vec<NamespacedName> =
            trigger_self(events, vec![drop_all, count_calls]).collect().await;
        assert!(requests.is_empty());
        // The second predicate never ran: the first drop short-circuited
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generation_predicate_drops_status_only_updates() {
        let mut old = (*obj("a", "1")).clone();
        old.metadata.generation = Some(1);
        let mut spec_change = old.clone();
        spec_change.metadata.generation = Some(2);

        let unchanged = Event::Updated {
            old: Arc::new(old.clone()),
            new: Arc::new(old.clone()),
        };
        let changed = Event::Updated {
            old: Arc::new(old),
            new: Arc::new(spec_change),
        };
        assert!(!predicates::generation_changed(&unchanged));
        assert!(predicates::generation_changed(&changed));
        assert!(predicates::generation_changed(&Event::Created {
            object: obj("a", "1")
        }));
    }

    #[tokio::test]
    async fn custom_mapper_routes_to_arbitrary_identities() {
        // Requests are parametric: here a composite (identity, shard) key
        let events = stream::iter(vec![Event::Created { object: obj("a", "1") }]);
        let requests: Vec<(String, u8)> = trigger_with(events, Vec::new(), |event| {
            let name = event.object().metadata.name.clone().unwrap_or_default();
            vec![(name.clone(), 0), (name, 1)]
        })
        .collect()
        .await;
        assert_eq!(requests, vec![("a".to_string(), 0), ("a".to_string(), 1)]);
    }
}
