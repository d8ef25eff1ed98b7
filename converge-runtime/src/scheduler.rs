//! A deduplicating delay queue of reconcile requests.
use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    stream::{Fuse, FusedStream},
    Stream, StreamExt,
};
use pin_project::pin_project;
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// A request to emit `message` once `run_at` is reached.
#[derive(Debug)]
pub struct ScheduleRequest<T> {
    /// The message to emit; requests carrying an equal message collapse
    pub message: T,
    /// The instant the message becomes due
    pub run_at: Instant,
}

/// Internal metadata for a scheduled message.
struct ScheduledEntry {
    run_at: Instant,
    queue_key: delay_queue::Key,
}

/// The queue component of a controller: a stream transformer that emits each
/// submitted message at its requested instant, deduplicating along the way.
///
/// A message that is submitted again while still queued keeps the earlier of
/// the two instants. A message that is due but held back (see
/// [`Scheduler::hold_unless`]) parks as pending, where further submissions
/// collapse into it entirely.
#[pin_project(project = SchedulerProj)]
pub struct Scheduler<T, R> {
    /// Queue of already-scheduled messages.
    ///
    /// To keep the metadata in sync, use `schedule_message` and
    /// `poll_pop_queue_message` rather than manipulating this directly.
    queue: DelayQueue<T>,
    /// Metadata for all currently scheduled messages. Used to detect
    /// duplicate messages.
    scheduled: HashMap<T, ScheduledEntry>,
    /// Messages that are due, but have been held back by `hold_unless`.
    pending: HashSet<T>,
    /// Incoming queue of scheduling requests.
    #[pin]
    requests: Fuse<R>,
}

impl<T, R: Stream> Scheduler<T, R> {
    fn new(requests: R) -> Self {
        Self {
            queue: DelayQueue::new(),
            scheduled: HashMap::new(),
            pending: HashSet::new(),
            requests: requests.fuse(),
        }
    }
}

impl<T: Hash + Eq + Clone, R> SchedulerProj<'_, T, R> {
    /// Attempt to schedule a message into the queue.
    ///
    /// If the message is already in the queue then the earlier `run_at` takes
    /// precedence.
    fn schedule_message(&mut self, request: ScheduleRequest<T>) {
        if self.pending.contains(&request.message) {
            // Message is already pending, so we can't even expedite it
            return;
        }
        match self.scheduled.entry(request.message) {
            Entry::Occupied(mut old_entry) if old_entry.get().run_at >= request.run_at => {
                // Old entry will run after the new request, so replace it..
                let entry = old_entry.get_mut();
                self.queue.reset_at(&entry.queue_key, request.run_at);
                entry.run_at = request.run_at;
            }
            Entry::Occupied(_old_entry) => {
                // Old entry will run before the new request, so ignore the
                // new request..
            }
            Entry::Vacant(entry) => {
                // No old entry, we're free to go!
                let message = entry.key().clone();
                entry.insert(ScheduledEntry {
                    run_at: request.run_at,
                    queue_key: self.queue.insert_at(message, request.run_at),
                });
            }
        }
    }

    /// Attempt to retrieve a message from the queue.
    fn poll_pop_queue_message(
        &mut self,
        cx: &mut Context<'_>,
        can_take_message: impl Fn(&T) -> bool,
    ) -> Poll<Option<T>> {
        if let Some(msg) = self.pending.iter().find(|msg| can_take_message(*msg)).cloned() {
            return Poll::Ready(self.pending.take(&msg));
        }

        loop {
            match self.queue.poll_expired(cx) {
                Poll::Ready(Some(msg)) => {
                    let msg = msg.into_inner();
                    self.scheduled.remove(&msg).expect(
                        "Expired message was popped from the Scheduler queue, but was not in the metadata map",
                    );
                    if can_take_message(&msg) {
                        break Poll::Ready(Some(msg));
                    }
                    self.pending.insert(msg);
                }
                Poll::Ready(None) => {
                    break if self.pending.is_empty() {
                        Poll::Ready(None)
                    } else {
                        // There are still remaining pending messages, so we're
                        // not done quite yet..
                        Poll::Pending
                    };
                }
                Poll::Pending => break Poll::Pending,
            }
        }
    }
}

/// See [`Scheduler::hold_unless`]
pub struct HoldUnless<'a, T, R, C> {
    scheduler: Pin<&'a mut Scheduler<T, R>>,
    can_take_message: C,
}

impl<T, R, C> Stream for HoldUnless<'_, T, R, C>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = ScheduleRequest<T>>,
    C: Fn(&T) -> bool + Unpin,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let can_take_message = &this.can_take_message;
        let mut scheduler = this.scheduler.as_mut().project();

        while let Poll::Ready(Some(request)) = scheduler.requests.as_mut().poll_next(cx) {
            scheduler.schedule_message(request);
        }

        match scheduler.poll_pop_queue_message(cx, can_take_message) {
            Poll::Ready(Some(expired)) => Poll::Ready(Some(expired)),
            Poll::Ready(None) => {
                if scheduler.requests.is_terminated() {
                    // The source queue has terminated, and all outstanding
                    // requests are done, so terminate
                    Poll::Ready(None)
                } else {
                    // The delay queue is empty, but we may get more requests
                    // in the future...
                    Poll::Pending
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, R> Scheduler<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = ScheduleRequest<T>>,
{
    /// A filtered view of the [`Scheduler`], which will keep items "pending"
    /// if `can_take_message` returns `false`, allowing them to be handled as
    /// soon as they are ready.
    ///
    /// The returned [`HoldUnless`] is designed to be short-lived: it has no
    /// allocations, and no messages will be lost, even if it is reconstructed
    /// on each call to `poll_next`. In fact, this is often desirable, to
    /// avoid long-lived borrows in `can_take_message`'s closure.
    ///
    /// NOTE: `can_take_message` should be considered fairly
    /// performance-sensitive, since it will generally be executed for each
    /// pending message, for each poll.
    pub fn hold_unless<C: Fn(&T) -> bool>(self: Pin<&mut Self>, can_take_message: C) -> HoldUnless<'_, T, R, C> {
        HoldUnless {
            scheduler: self,
            can_take_message,
        }
    }

    /// Number of messages queued or parked, used as the queue depth gauge
    #[must_use]
    pub fn len(&self) -> usize {
        self.scheduled.len() + self.pending.len()
    }

    /// Whether nothing is queued or parked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty() && self.pending.is_empty()
    }

    /// Checks whether `msg` is currently a pending message (held by `hold_unless`)
    #[cfg(test)]
    pub fn contains_pending(&self, msg: &T) -> bool {
        self.pending.contains(msg)
    }
}

impl<T, R> Stream for Scheduler<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = ScheduleRequest<T>>,
{
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.as_mut().hold_unless(|_| true)).poll_next(cx)
    }
}

/// Stream transformer that takes a message and [`Instant`] (in the form of a
/// [`ScheduleRequest`]), and emits the message at the specified instant.
///
/// Messages are deduplicated: if a message is submitted twice before being
/// emitted then it will only be emitted at the earlier of the two instants.
pub fn scheduler<T: Eq + Hash + Clone, S: Stream<Item = ScheduleRequest<T>>>(requests: S) -> Scheduler<T, S> {
    Scheduler::new(requests)
}
