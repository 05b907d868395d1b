//! The control loop that drives the scheduler through its lifecycle phases.

use crate::common::{EventId, Priority, Verdict};
use crate::config::RouterConfig;
use crate::error::Fault;
use crate::events::Exception;
use crate::scheduler::{EventScheduler, Routine};
use crate::signals::SignalTrap;
use chrono::{DateTime, Utc};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Where a router is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Default)]
struct LoopShared {
    running: AtomicBool,
    cycles: AtomicU64,
    tick_interval_ms: AtomicU64,
    started_at: OnceLock<DateTime<Utc>>,
}

/// A shared view of a router's loop state.
///
/// This is the payload of the STARTUP, TICK and SHUTDOWN dispatches, so any
/// routine can read the cycle counter, adjust the pacing, or stop the loop.
#[derive(Debug, Clone, Default)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    fn with_interval(interval: Duration) -> Self {
        let handle = Self::default();
        handle.set_tick_interval(interval);
        handle
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Asks the loop to leave its running phase after the current tick.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    /// Completed pacing cycles since the loop started.
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Acquire)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.shared.tick_interval_ms.load(Ordering::Acquire))
    }

    /// Changes the pacing delay; takes effect on the next tick.
    pub fn set_tick_interval(&self, interval: Duration) {
        let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.shared.tick_interval_ms.store(millis, Ordering::Release);
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.shared.started_at.get().copied()
    }

    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.started_at().map(|started| Utc::now() - started)
    }

    fn start(&self) {
        self.shared.started_at.get_or_init(Utc::now);
        self.shared.running.store(true, Ordering::Release);
    }

    fn advance(&self) -> u64 {
        self.shared.cycles.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// The control loop.
///
/// A `Router` owns an [`EventScheduler`] and drives it through four lifecycle
/// events:
///
/// ```text
/// STARTUP ──► loop { TICK } ──► SHUTDOWN
///                  │    ▲
///        tick fault│    │handled
///                  ▼    │
///               EXCEPTION ──► not handled: fault leaves the loop
/// ```
///
/// SHUTDOWN runs exactly once on every way out of the running phase.
/// Collaborators hook in by registering routines on the scheduler before
/// [`Router::run`] is called.
pub struct Router {
    config: Arc<RouterConfig>,
    scheduler: EventScheduler,
    handle: LoopHandle,
    trap: SignalTrap,
    state: LoopState,
}

impl Router {
    /// Creates a router with its default routines registered.
    ///
    /// Joins the process-wide OS signal trap when `config.trap_signals` is set.
    pub fn new(config: RouterConfig) -> Result<Self, Fault> {
        let trap = if config.trap_signals {
            SignalTrap::install()?
        } else {
            SignalTrap::new()
        };
        let router = Self {
            handle: LoopHandle::with_interval(config.tick_interval()),
            config: Arc::new(config),
            scheduler: EventScheduler::new(),
            trap,
            state: LoopState::NotStarted,
        };
        router.register_default_routines()?;
        Ok(router)
    }

    fn register_default_routines(&self) -> Result<(), Fault> {
        let handle = self.handle.clone();
        let trap = self.trap.clone();
        let heartbeat_every = self.config.heartbeat_every;
        self.scheduler.register(
            EventId::TICK,
            Routine::prioritized(Priority::ULTRA_LOW, move |_| {
                let cycles = handle.cycles();
                if heartbeat_every > 0 && cycles > 0 && cycles % heartbeat_every == 0 {
                    let uptime = handle.uptime().map_or(0, |d| d.num_seconds());
                    info!("Heartbeat: router ran for {} cycles ({}s up).", cycles, uptime);
                }
                if let Some(signal) = trap.sleep(handle.tick_interval()) {
                    return Err(Fault::Interrupted(signal));
                }
                trace!("Cycle #{} complete.", handle.advance());
                Ok(Verdict::Pass)
            }),
        )?;

        self.scheduler.register(
            EventId::EXCEPTION,
            Routine::new(|event| {
                let Some(exception) = event.payload::<Exception>() else {
                    return Ok(Verdict::Pass);
                };
                if exception.fault.is_interrupt() {
                    info!("Gracefully stopping router ({}).", exception.fault);
                    exception.handle.stop();
                    return Ok(Verdict::Cancel);
                }
                Ok(Verdict::Pass)
            }),
        )?;

        self.scheduler.register(
            EventId::SHUTDOWN,
            Routine::new(|_| {
                info!("Shutting down.");
                Ok(Verdict::Pass)
            }),
        )?;

        self.scheduler.register(
            EventId::STARTUP,
            Routine::prioritized(Priority::ULTRA_LOW, |_| {
                info!("Router started successfully.");
                Ok(Verdict::Pass)
            }),
        )?;
        Ok(())
    }

    /// Runs the loop until a routine stops it or a tick fault goes unhandled.
    ///
    /// - A STARTUP fault is returned as-is and SHUTDOWN does not run.
    /// - A tick fault (including a panicking routine or an OS signal) is
    ///   dispatched through EXCEPTION; if no routine cancels it, it is returned
    ///   after SHUTDOWN.
    /// - A SHUTDOWN fault is returned as-is, or as [`Fault::Chained`] when a
    ///   fault was already pending.
    pub fn run(&mut self) -> Result<(), Fault> {
        if self.state != LoopState::NotStarted {
            return Err(Fault::AlreadyStarted);
        }
        info!("{} starting up...", crate::ENGINE_NAME);
        self.scheduler.seal();
        self.handle.start();

        if let Err(fault) = self.scheduler.dispatch(&EventId::STARTUP, &self.handle) {
            error!(label = fault.as_label(), "Startup failed: {}", fault);
            self.handle.stop();
            self.state = LoopState::Stopped;
            return Err(fault);
        }
        self.state = LoopState::Running;
        info!(
            "Router running at {:?} per cycle.",
            self.handle.tick_interval()
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.drive()));

        self.state = LoopState::Stopping;
        self.handle.stop();
        let shutdown = self.scheduler.dispatch(&EventId::SHUTDOWN, &self.handle);
        self.state = LoopState::Stopped;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => {
                if let Err(fault) = shutdown {
                    error!("Shutdown failed while unwinding a panic: {}", fault);
                }
                panic::resume_unwind(panic);
            }
        };

        match (outcome, shutdown) {
            (Ok(()), Ok(_)) => {
                info!("Router stopped after {} cycles.", self.handle.cycles());
                Ok(())
            }
            (Err(pending), Ok(_)) => Err(pending),
            (Ok(()), Err(fault)) => Err(fault),
            (Err(pending), Err(fault)) => Err(Fault::Chained {
                fault: Box::new(fault),
                pending: Box::new(pending),
            }),
        }
    }

    fn drive(&self) -> Result<(), Fault> {
        while self.handle.is_running() {
            let tick = panic::catch_unwind(AssertUnwindSafe(|| {
                self.scheduler.dispatch(&EventId::TICK, &self.handle)
            }))
            .unwrap_or_else(|payload| Err(Fault::from_panic(payload)));

            let Err(fault) = tick else {
                continue;
            };
            warn!(label = fault.as_label(), "Tick failed: {}", fault);

            let exception = Exception::new(self.handle.clone(), fault);
            if !self.scheduler.dispatch(&EventId::EXCEPTION, &exception)? {
                return Err(exception.into_fault());
            }
            debug!("Tick fault handled, loop continues.");
        }
        Ok(())
    }

    /// The scheduler this router drives. Register routines here before `run`.
    pub fn scheduler(&self) -> &EventScheduler {
        &self.scheduler
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn cycles(&self) -> u64 {
        self.handle.cycles()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The trap the pacing routine sleeps on. Raising a signal here has the
    /// same effect as the process receiving it.
    pub fn signal_trap(&self) -> &SignalTrap {
        &self.trap
    }
}
