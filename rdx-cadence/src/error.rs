//! The fault type raised by routines, the scheduler and the router.
//!
//! Every failure that can cross a dispatch boundary is a [`Fault`]. Routines
//! usually raise [`Fault::Handler`] by returning an `anyhow::Error`; the router
//! produces [`Fault::Interrupted`] and [`Fault::Panicked`] itself so that OS
//! signals and panicking routines travel through the EXCEPTION channel like any
//! other tick failure.

use crate::common::EventId;
use crate::signals::Signal;
use std::any::Any;
use thiserror::Error;

/// # Faults raised while dispatching or driving the loop.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Fault {
    /// A routine failed.
    #[error("handler failed: {0:#}")]
    Handler(#[from] anyhow::Error),

    /// The process received an interrupt or termination signal.
    #[error("interrupted by {0}")]
    Interrupted(Signal),

    /// A routine panicked while the loop was ticking.
    #[error("handler panicked: {message}")]
    Panicked {
        /// The panic payload, when it was a string.
        message: String,
    },

    /// A routine dispatched the same event it is being run for.
    #[error("re-entrant dispatch of '{event}'")]
    Reentrant {
        /// The channel that was already dispatching.
        event: EventId,
    },

    /// A routine was registered after the router started running.
    #[error("cannot register on '{event}': scheduler is sealed")]
    Sealed {
        /// The channel the registration targeted.
        event: EventId,
    },

    /// `Router::run` was called on a router that already ran.
    #[error("router has already been started")]
    AlreadyStarted,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// SHUTDOWN failed while another fault was already on its way out.
    #[error("{fault} (while unwinding: {pending})")]
    Chained {
        /// The fault raised by the SHUTDOWN dispatch.
        #[source]
        fault: Box<Fault>,
        /// The fault that was pending when SHUTDOWN ran.
        pending: Box<Fault>,
    },
}

impl Fault {
    /// Builds a handler fault from any displayable message.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Fault::Handler(anyhow::anyhow!("{message}"))
    }

    /// Converts a caught panic payload into a fault.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Fault::Panicked { message }
    }

    /// Whether this fault is an interrupt or termination request.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Fault::Interrupted(_))
    }

    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use cadence::error::Fault;
    ///
    /// assert_eq!(Fault::AlreadyStarted.as_label(), "router_already_started");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            Fault::Handler(_) => "handler_failed",
            Fault::Interrupted(_) => "interrupted",
            Fault::Panicked { .. } => "handler_panicked",
            Fault::Reentrant { .. } => "dispatch_reentrant",
            Fault::Sealed { .. } => "scheduler_sealed",
            Fault::AlreadyStarted => "router_already_started",
            Fault::Io(_) => "io",
            Fault::Config(_) => "config",
            Fault::Chained { .. } => "shutdown_chained",
        }
    }
}
