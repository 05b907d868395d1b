//! The priority-ordered event scheduler.
//!
//! Each event id owns a list of [`Routine`]s kept sorted by descending
//! [`Priority`]; routines of equal priority stay in registration order. A
//! dispatch runs every routine on the list exactly once, on the caller's
//! thread, threading a cancellation flag through them:
//!
//! ```text
//! cancelled = false
//! for routine in routines[event]:        // highest priority first
//!     cancelled = routine(event, cancelled)?.fold(cancelled)
//! return cancelled
//! ```
//!
//! A routine's `Err` stops the dispatch and is handed straight back to the
//! caller; the scheduler neither isolates nor retries.

use crate::common::{EventId, Priority, Verdict};
use crate::error::Fault;
use crate::events::Event;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use tracing::{debug, trace};

/// The closure type behind every routine.
pub type RoutineFn = Box<dyn FnMut(&Event<'_>) -> Result<Verdict, Fault> + Send>;

/// An event-subscribed routine paired with its priority.
///
/// `Routine::new` stores the handler at [`Priority::NORMAL`]; attach an explicit
/// rank with [`Routine::with_priority`] or build one with
/// [`Routine::prioritized`].
pub struct Routine {
    priority: Priority,
    explicit: bool,
    handler: RoutineFn,
}

impl Routine {
    /// Wraps a handler at the default priority.
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&Event<'_>) -> Result<Verdict, Fault> + Send + 'static,
    {
        Self {
            priority: Priority::NORMAL,
            explicit: false,
            handler: Box::new(handler),
        }
    }

    /// Wraps a handler at an explicit priority.
    pub fn prioritized<F>(priority: impl Into<Priority>, handler: F) -> Self
    where
        F: FnMut(&Event<'_>) -> Result<Verdict, Fault> + Send + 'static,
    {
        Self::new(handler).with_priority(priority)
    }

    /// Sets an explicit priority.
    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self.explicit = true;
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether the priority was set explicitly rather than defaulted.
    pub fn is_prioritized(&self) -> bool {
        self.explicit
    }

    fn invoke(&mut self, event: &Event<'_>) -> Result<Verdict, Fault> {
        (self.handler)(event)
    }
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("priority", &self.priority)
            .field("explicit", &self.explicit)
            .finish_non_exhaustive()
    }
}

/// One event's routines. `ranks` mirrors the routines' priorities so it can
/// be read while the list itself is locked by a running dispatch.
#[derive(Default)]
struct Channel {
    routines: Mutex<Vec<Routine>>,
    ranks: RwLock<Vec<Priority>>,
}

impl Channel {
    fn lock_idle(&self, event: &EventId) -> Result<MutexGuard<'_, Vec<Routine>>, Fault> {
        match self.routines.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(Fault::Reentrant {
                event: event.clone(),
            }),
        }
    }

    fn ranks(&self) -> Vec<Priority> {
        self.ranks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

type RoutineList = Arc<Channel>;

/// Dispatches named events to their registered routines.
///
/// The scheduler is a handle: clones share the same routine table, so
/// collaborators can keep one and dispatch their own domain events. Each
/// channel's list is locked separately, which lets a routine dispatch a
/// *different* event while its own dispatch is in progress. Registering on
/// an event from inside its own dispatch fails with [`Fault::Reentrant`].
#[derive(Clone, Default)]
pub struct EventScheduler {
    routines: Arc<RwLock<HashMap<EventId, RoutineList>>>,
    sealed: Arc<AtomicBool>,
}

impl EventScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a routine to an event's list and restores priority order.
    ///
    /// Registering the same handler twice makes it run twice per dispatch.
    /// Fails with [`Fault::Sealed`] once the owning router has started.
    pub fn register(&self, event: impl Into<EventId>, routine: Routine) -> Result<(), Fault> {
        let event = event.into();
        if self.is_sealed() {
            return Err(Fault::Sealed { event });
        }
        let list = self.list_for(&event);
        let mut routines = list.lock_idle(&event)?;
        debug!(
            "Registering routine on '{}' at priority {}.",
            event,
            routine.priority.rank()
        );
        routines.push(routine);
        // `sort_by` is stable, so equal ranks keep registration order.
        routines.sort_by(|a, b| b.priority.cmp(&a.priority));
        *list.ranks.write().unwrap_or_else(PoisonError::into_inner) =
            routines.iter().map(Routine::priority).collect();
        Ok(())
    }

    /// Registers a bare handler at the default priority.
    pub fn on<F>(&self, event: impl Into<EventId>, handler: F) -> Result<(), Fault>
    where
        F: FnMut(&Event<'_>) -> Result<Verdict, Fault> + Send + 'static,
    {
        self.register(event, Routine::new(handler))
    }

    /// Runs every routine registered for `event` and returns the folded
    /// cancellation value.
    ///
    /// An event nobody registered for is an empty channel and yields `false`.
    pub fn dispatch(&self, event: &EventId, payload: &dyn Any) -> Result<bool, Fault> {
        let Some(list) = self.existing_list(event) else {
            trace!("Dispatch of '{}' found no routines.", event);
            return Ok(false);
        };
        let mut routines = list.lock_idle(event)?;

        let mut cancelled = false;
        for routine in routines.iter_mut() {
            let view = Event::new(event, payload, cancelled);
            cancelled = routine.invoke(&view)?.fold(cancelled);
        }
        trace!(
            "Dispatched '{}' to {} routine(s), cancelled={}.",
            event,
            routines.len(),
            cancelled
        );
        Ok(cancelled)
    }

    /// Dispatches an event that carries no payload.
    pub fn dispatch_empty(&self, event: &EventId) -> Result<bool, Fault> {
        self.dispatch(event, &())
    }

    /// The number of routines registered for `event`. Safe to call from a
    /// routine running on `event`.
    pub fn handler_count(&self, event: &EventId) -> usize {
        self.priorities(event).len()
    }

    /// The priorities of `event`'s routines, in dispatch order.
    pub fn priorities(&self, event: &EventId) -> Vec<Priority> {
        self.existing_list(event)
            .map_or_else(Vec::new, |list| list.ranks())
    }

    /// Every event id that has had a routine registered.
    pub fn event_ids(&self) -> Vec<EventId> {
        let routines = self.routines.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<EventId> = routines.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Refuses all further registrations.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    fn existing_list(&self, event: &EventId) -> Option<RoutineList> {
        self.routines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event.as_str())
            .cloned()
    }

    fn list_for(&self, event: &EventId) -> RoutineList {
        if let Some(list) = self.existing_list(event) {
            return list;
        }
        self.routines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.clone())
            .or_default()
            .clone()
    }
}

impl fmt::Debug for EventScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventScheduler")
            .field("events", &self.event_ids())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
