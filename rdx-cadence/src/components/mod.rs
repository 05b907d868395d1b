//! Collaborators that plug into a router through ordinary registration.
//!
//! Nothing in here is special-cased by the router: the operator subscribes to
//! STARTUP and SHUTDOWN like any other routine, and the registry only ever
//! talks to the scheduler by dispatching its own domain event.

pub mod operator;
pub mod registry;
