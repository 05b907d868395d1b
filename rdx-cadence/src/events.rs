//! Defines what a routine sees when it is invoked, and the well-known event ids.
//!
//! Every dispatch hands each routine an [`Event`]: the channel it fired on, a
//! type-erased payload borrowed from the dispatcher, and the cancellation value
//! folded so far. Routines downcast the payload to the concrete type the
//! channel is documented to carry.

use crate::common::EventId;
use crate::error::Fault;
use crate::router::LoopHandle;
use std::any::Any;
use std::fmt;

/// One routine invocation's view of a dispatch.
#[derive(Clone, Copy)]
pub struct Event<'a> {
    id: &'a EventId,
    payload: &'a dyn Any,
    cancelled: bool,
}

impl<'a> Event<'a> {
    pub(crate) fn new(id: &'a EventId, payload: &'a dyn Any, cancelled: bool) -> Self {
        Self {
            id,
            payload,
            cancelled,
        }
    }

    /// The channel this dispatch is running on.
    pub fn id(&self) -> &EventId {
        self.id
    }

    /// The cancellation value folded by the routines that ran before this one.
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Downcasts the payload. Returns `None` if the dispatcher sent another type.
    pub fn payload<T: Any>(&self) -> Option<&'a T> {
        self.payload.downcast_ref::<T>()
    }

    /// Shorthand for lifecycle routines: the loop handle carried by
    /// STARTUP, TICK and SHUTDOWN, or by the [`Exception`] of an EXCEPTION.
    pub fn loop_handle(&self) -> Option<&'a LoopHandle> {
        self.payload::<LoopHandle>()
            .or_else(|| self.payload::<Exception>().map(|e| &e.handle))
    }
}

impl fmt::Debug for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", self.id)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

/// The payload of an EXCEPTION dispatch: the failed tick's fault plus the loop
/// handle, so routines can stop the loop while marking the fault handled.
#[derive(Debug)]
pub struct Exception {
    pub handle: LoopHandle,
    pub fault: Fault,
}

impl Exception {
    pub fn new(handle: LoopHandle, fault: Fault) -> Self {
        Self { handle, fault }
    }

    /// Gives the fault back to the loop once no routine handled it.
    pub fn into_fault(self) -> Fault {
        self.fault
    }
}

/// Events dispatched by the agent registry.
pub struct RegistryEvents;

impl RegistryEvents {
    /// Carries the candidate `AgentDescriptor`; a cancelled fold rejects it.
    pub const AGENT_REGISTERED: EventId = EventId::from_static("ag_reg_register");
}

/// Events dispatched by the agent operator.
pub struct OperatorEvents;

impl OperatorEvents {
    /// Carries the `AgentOperator`; a cancelled fold skips the operator startup.
    pub const STARTUP: EventId = EventId::from_static("ag_start");
    /// Carries the `AgentOperator`; a cancelled fold leaves the acceptor running.
    pub const SHUTDOWN: EventId = EventId::from_static("ag_stop");
    /// Carries the `AgentOperator`; fired when the acceptor outlives its stop request.
    pub const SHUTDOWN_ERROR: EventId = EventId::from_static("ag_stop_error");
}
