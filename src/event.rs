//! Event queue and retention.
//!
//! Events live in an arena with stable indices; operator trees and blocked
//! records refer to them by [`EventId`]. The daemon retains an event for as
//! long as its blocker count is non-zero and poll-frees it as soon as the
//! count returns to zero after handling.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Stable index of an event within the [`EventPool`].
pub type EventId = usize;

/// Identity of a job instance: class name plus expanded instance name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    /// Name of the job class.
    pub class: String,
    /// Expanded instance name ("" for singletons).
    pub name: String,
}

impl JobKey {
    /// Builds a key from its parts.
    pub fn new(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.class)
        } else {
            write!(f, "{} ({})", self.class, self.name)
        }
    }
}

/// Something waiting for an event to finish, or for a job instance to
/// finish transitioning.
///
/// Each record holds exactly one blocker reference on the event it names;
/// whoever removes the record must route it back through
/// [`EventPool::release`] so the count stays exact.
#[derive(Debug)]
pub enum Blocked {
    /// An event held back from poll-free.
    Event(EventId),
    /// A job instance waiting to be poked.
    Job(JobKey),
    /// A control client awaiting its deferred reply.
    Control {
        /// Serial for log correlation.
        serial: u64,
        /// The connected client; the reply is written on release.
        stream: UnixStream,
    },
}

/// Where an event is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventProgress {
    /// Queued, not yet matched against anything.
    Pending,
    /// Matched against all expressions; waiting for blockers to drain.
    Handling,
}

/// A named notification with KEY=VALUE arguments.
#[derive(Debug)]
pub struct Event {
    /// Event name.
    pub name: String,
    /// Ordered KEY=VALUE bindings.
    pub env: Vec<String>,
    /// Optional externally-produced descriptor carried by the event.
    pub fd: Option<RawFd>,
    /// Number of live references that must drain before poll-free.
    pub blockers: usize,
    /// Queue position.
    pub progress: EventProgress,
    /// Records released when this event finishes.
    pub blocking: Vec<Blocked>,
}

/// Arena of live events plus the pending FIFO.
#[derive(Debug, Default)]
pub struct EventPool {
    slots: Vec<Option<Event>>,
    pending: VecDeque<EventId>,
}

impl EventPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a new event and returns its id.
    pub fn emit(&mut self, name: impl Into<String>, env: Vec<String>) -> EventId {
        self.emit_with_fd(name, env, None)
    }

    /// Queues a new event carrying an external descriptor.
    pub fn emit_with_fd(
        &mut self,
        name: impl Into<String>,
        env: Vec<String>,
        fd: Option<RawFd>,
    ) -> EventId {
        let event = Event {
            name: name.into(),
            env,
            fd,
            blockers: 0,
            progress: EventProgress::Pending,
            blocking: Vec::new(),
        };
        let id = self.insert(event);
        self.pending.push_back(id);
        trace!(event = %self.slots[id].as_ref().map(|e| e.name.as_str()).unwrap_or(""),
               id, "event queued");
        id
    }

    /// Restores an event at a fixed slot during deserialisation.
    pub fn restore(&mut self, event: Event) -> EventId {
        let queued = event.progress == EventProgress::Pending;
        let id = self.insert(event);
        if queued {
            self.pending.push_back(id);
        }
        id
    }

    fn insert(&mut self, event: Event) -> EventId {
        if let Some(id) = self.slots.iter().position(|slot| slot.is_none()) {
            self.slots[id] = Some(event);
            id
        } else {
            self.slots.push(Some(event));
            self.slots.len() - 1
        }
    }

    /// Borrows an event.
    pub fn get(&self, id: EventId) -> Option<&Event> {
        self.slots.get(id).and_then(|slot| slot.as_ref())
    }

    /// Mutably borrows an event.
    pub fn get_mut(&mut self, id: EventId) -> Option<&mut Event> {
        self.slots.get_mut(id).and_then(|slot| slot.as_mut())
    }

    /// Takes one blocker reference on an event.
    pub fn block(&mut self, id: EventId) {
        if let Some(event) = self.get_mut(id) {
            event.blockers += 1;
        }
    }

    /// Drops one blocker reference.
    ///
    /// Underflow means a reference was released twice; that breaks the
    /// retention invariant, so it is fatal.
    pub fn unblock(&mut self, id: EventId) {
        let event = self
            .slots
            .get_mut(id)
            .and_then(|slot| slot.as_mut())
            .unwrap_or_else(|| panic!("unblock of freed event {id}"));
        assert!(event.blockers > 0, "event {id} blocker underflow");
        event.blockers -= 1;
    }

    /// Pops the next event awaiting matching, marking it handling.
    pub fn next_pending(&mut self) -> Option<EventId> {
        while let Some(id) = self.pending.pop_front() {
            if let Some(event) = self.get_mut(id) {
                event.progress = EventProgress::Handling;
                return Some(id);
            }
        }
        None
    }

    /// Whether any events are queued for matching.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Poll-frees every handled event whose blocker count has reached
    /// zero, returning the freed events (with their waiter records still
    /// inside) for the caller to act on. The carried descriptor, if any,
    /// is closed here.
    pub fn reap_finished(&mut self) -> Vec<Event> {
        let mut released = Vec::new();
        for slot in self.slots.iter_mut() {
            let done = matches!(
                slot,
                Some(event)
                    if event.progress == EventProgress::Handling && event.blockers == 0
            );
            if !done {
                continue;
            }
            let event = slot.take().expect("slot checked above");
            if let Some(fd) = event.fd {
                unsafe { libc::close(fd) };
            }
            trace!(event = %event.name, "event finished");
            released.push(event);
        }
        released
    }

    /// Releases one waiter record. Event records give their blocker back
    /// here; job and control records are handed to the caller untouched.
    pub fn release(&mut self, blocked: Blocked) -> Option<Blocked> {
        match blocked {
            Blocked::Event(id) => {
                self.unblock(id);
                None
            }
            other => Some(other),
        }
    }

    /// Removes every parked control client from every waiter list;
    /// used before a re-exec, which they cannot survive.
    pub fn drain_control_waiters(&mut self) -> Vec<Blocked> {
        let mut drained = Vec::new();
        for slot in self.slots.iter_mut().flatten() {
            let (control, rest): (Vec<Blocked>, Vec<Blocked>) = slot
                .blocking
                .drain(..)
                .partition(|record| matches!(record, Blocked::Control { .. }));
            slot.blocking = rest;
            drained.extend(control);
        }
        drained
    }

    /// Iterates live events with their slot index.
    pub fn iter(&self) -> impl Iterator<Item = (EventId, &Event)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|event| (id, event)))
    }

    /// Number of live events.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether the pool holds no live events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitted_events_are_drained_in_fifo_order() {
        let mut pool = EventPool::new();
        let a = pool.emit("startup", vec![]);
        let b = pool.emit("runlevel", vec!["RUNLEVEL=2".into()]);

        assert_eq!(pool.next_pending(), Some(a));
        assert_eq!(pool.next_pending(), Some(b));
        assert_eq!(pool.next_pending(), None);
    }

    #[test]
    fn unblocked_handled_events_are_poll_freed() {
        let mut pool = EventPool::new();
        let id = pool.emit("startup", vec![]);
        assert!(pool.reap_finished().is_empty(), "pending events are kept");

        pool.next_pending();
        pool.block(id);
        assert!(pool.reap_finished().is_empty(), "blocked events are kept");

        pool.unblock(id);
        let finished = pool.reap_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].name, "startup");
        assert!(pool.get(id).is_none());
    }

    #[test]
    fn release_returns_non_event_records() {
        let mut pool = EventPool::new();
        let id = pool.emit("startup", vec![]);
        pool.block(id);

        assert!(pool.release(Blocked::Event(id)).is_none());
        assert_eq!(pool.get(id).expect("event live").blockers, 0);

        let job = pool.release(Blocked::Job(JobKey::new("tty", "")));
        assert!(matches!(job, Some(Blocked::Job(_))));
    }

    #[test]
    #[should_panic(expected = "blocker underflow")]
    fn blocker_underflow_is_fatal() {
        let mut pool = EventPool::new();
        let id = pool.emit("startup", vec![]);
        pool.unblock(id);
    }

    #[test]
    fn slots_are_reused_after_free() {
        let mut pool = EventPool::new();
        let a = pool.emit("one", vec![]);
        pool.next_pending();
        pool.reap_finished();

        let b = pool.emit("two", vec![]);
        assert_eq!(a, b, "freed slot is reused");
        assert_eq!(pool.len(), 1);
    }
}
