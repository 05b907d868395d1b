//! # Cadence
//!
//! A cooperative, priority-ordered event dispatch kernel and the control loop
//! built on top of it.
//!
//! Cadence is a library an application embeds to drive a long-running loop
//! through named lifecycle phases, while independently written routines hook
//! into any named event with an explicit priority.
//!
//! ## Core Concepts
//!
//! - **EventScheduler**: per event id, a list of routines sorted by descending
//!   priority (stable on ties). A dispatch runs all of them in order and folds
//!   their verdicts into a single "cancelled" flag.
//! - **Router**: owns a scheduler and drives STARTUP once, TICK repeatedly,
//!   routes tick faults through EXCEPTION, and runs SHUTDOWN exactly once on
//!   the way out.
//! - **Verdicts**: a routine returns `Pass` to leave the fold alone, or
//!   `Cancel`/`Proceed` to overwrite it. Every routine runs regardless.
//! - **Collaborators**: the agent operator and registry in [`components`]
//!   hook in purely through registration and their own domain events.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use cadence::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     // 1. Create a router from a default configuration.
//!     let mut router = Router::new(RouterConfig::default())?;
//!
//!     // 2. Register routines before the loop starts.
//!     router.scheduler().register(
//!         EventId::TICK,
//!         Routine::prioritized(Priority::HIGH, |event| {
//!             if let Some(handle) = event.loop_handle() {
//!                 if handle.cycles() == 10 {
//!                     handle.stop();
//!                 }
//!             }
//!             Ok(Verdict::Pass)
//!         }),
//!     )?;
//!
//!     // 3. Run the loop. It also stops gracefully on Ctrl+C.
//!     router.run()?;
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "Cadence Router";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Declare all the modules in the crate.
pub mod common;
pub mod components;
pub mod config;
pub mod error;
pub mod events;
pub mod router;
pub mod scheduler;
pub mod signals;

/// A prelude module for easy importing of the most common Cadence types.
pub mod prelude {
    pub use crate::common::{EventId, Priority, Verdict};
    pub use crate::components::operator::AgentOperator;
    pub use crate::components::registry::{AgentDescriptor, AgentRegistry, DescriptorSet};
    pub use crate::config::{OperatorConfig, RouterConfig};
    pub use crate::error::Fault;
    pub use crate::events::{Event, Exception, OperatorEvents, RegistryEvents};
    pub use crate::router::{LoopHandle, LoopState, Router};
    pub use crate::scheduler::{EventScheduler, Routine};
    pub use crate::signals::{Signal, SignalTrap};
}
