//! Contains common, primitive types shared by the scheduler and the router.
//!
//! This module defines the identifier for dispatch channels, the priority rank
//! attached to every routine, and the verdict a routine hands back to the
//! scheduler's cancellation fold. Using distinct types keeps the dispatch API
//! honest about what is an event name and what is an ordinary string.

use serde::Deserialize;
use std::borrow::{Borrow, Cow};
use std::fmt;

/// A prelude module for convenient importing of the most common Cadence types.
///
/// # Example
/// ```
/// use cadence::common::prelude::*;
/// ```
pub mod prelude {
    pub use super::{EventId, Priority, Verdict};
    pub use crate::router::Router;
    pub use crate::scheduler::{EventScheduler, Routine};
}

/// Names a dispatch channel, either a lifecycle phase or a domain event.
///
/// Two ids are the same channel when their strings are equal. Lifecycle ids
/// are available as associated constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct EventId(Cow<'static, str>);

impl EventId {
    /// Dispatched once before the first tick.
    pub const STARTUP: EventId = EventId::from_static("startup");
    /// Dispatched on every cycle of the running loop.
    pub const TICK: EventId = EventId::from_static("tick");
    /// Dispatched when a tick fails, carrying the fault.
    pub const EXCEPTION: EventId = EventId::from_static("exception");
    /// Dispatched exactly once when the loop leaves its running phase.
    pub const SHUTDOWN: EventId = EventId::from_static("shutdown");

    /// Builds an id from a string literal, usable in `const` position.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for EventId {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for EventId {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EventId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The rank a routine runs at within one dispatch. Higher runs first.
///
/// The five named levels cover the usual cases, but any `i32` rank is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const ULTRA_HIGH: Priority = Priority(10);
    pub const HIGH: Priority = Priority(5);
    pub const NORMAL: Priority = Priority(0);
    pub const LOW: Priority = Priority(-5);
    pub const ULTRA_LOW: Priority = Priority(-10);

    pub fn rank(self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i32> for Priority {
    fn from(rank: i32) -> Self {
        Self(rank)
    }
}

/// What a routine contributes to the cancellation fold of a dispatch.
///
/// `Pass` leaves the running value as it is; `Cancel` and `Proceed` overwrite
/// it with `true` and `false` respectively. The last overwrite wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Pass,
    Cancel,
    Proceed,
}

impl Verdict {
    /// Applies this verdict to the running fold value.
    pub fn fold(self, cancelled: bool) -> bool {
        match self {
            Verdict::Pass => cancelled,
            Verdict::Cancel => true,
            Verdict::Proceed => false,
        }
    }
}

impl From<bool> for Verdict {
    fn from(cancel: bool) -> Self {
        if cancel {
            Verdict::Cancel
        } else {
            Verdict::Proceed
        }
    }
}

impl From<Option<bool>> for Verdict {
    fn from(cancel: Option<bool>) -> Self {
        cancel.map_or(Verdict::Pass, Verdict::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_event_id_equality_by_value() {
        let owned = EventId::from(String::from("tick"));
        assert_eq!(owned, EventId::TICK);
        assert_eq!(owned.to_string(), "tick");
    }

    #[test]
    fn test_event_id_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(EventId::from("ag_reg_register"), 1);
        assert_eq!(map.get("ag_reg_register"), Some(&1));
    }

    #[test]
    fn test_priority_levels_are_ordered() {
        assert!(Priority::ULTRA_HIGH > Priority::HIGH);
        assert!(Priority::HIGH > Priority::NORMAL);
        assert!(Priority::NORMAL > Priority::LOW);
        assert!(Priority::LOW > Priority::ULTRA_LOW);
        assert_eq!(Priority::default().rank(), 0);
    }

    #[test]
    fn test_verdict_fold() {
        assert!(!Verdict::Pass.fold(false));
        assert!(Verdict::Pass.fold(true));
        assert!(Verdict::Cancel.fold(false));
        assert!(!Verdict::Proceed.fold(true));
    }

    #[test]
    fn test_verdict_conversions() {
        assert_eq!(Verdict::from(true), Verdict::Cancel);
        assert_eq!(Verdict::from(false), Verdict::Proceed);
        assert_eq!(Verdict::from(None), Verdict::Pass);
        assert_eq!(Verdict::from(Some(true)), Verdict::Cancel);
    }
}
