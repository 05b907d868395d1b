//! Turns OS termination signals into faults on the loop thread.
//!
//! The loop is synchronous, so signals are awaited on a dedicated thread that
//! owns a current-thread tokio runtime. When one arrives it is parked in the
//! [`SignalTrap`], which wakes any routine sleeping on it. The router's pacing
//! routine sleeps on the trap, so a signal cuts the pacing delay short and is
//! raised as [`Fault::Interrupted`](crate::error::Fault::Interrupted).
//!
//! ## Unix
//! `SIGINT`, `SIGTERM` and `SIGQUIT` are trapped.
//!
//! ## Other platforms
//! Only Ctrl-C is trapped.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// An interrupt or termination request delivered to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Quit,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

static INSTALLED: Mutex<Option<SignalTrap>> = Mutex::new(None);

#[derive(Default)]
struct TrapState {
    pending: Mutex<Option<Signal>>,
    wake: Condvar,
}

/// A mailbox for at most one pending signal, shared between the signal thread
/// and the loop thread.
#[derive(Clone, Default)]
pub struct SignalTrap {
    state: Arc<TrapState>,
}

impl SignalTrap {
    /// Creates a trap that is not connected to the OS. Signals only arrive
    /// through [`SignalTrap::raise`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide trap fed by OS signals, spawning its feeder
    /// thread on first use.
    ///
    /// Every caller gets a clone of the same trap, so a signal is delivered
    /// once, to whichever sleeper takes it first.
    pub fn install() -> std::io::Result<Self> {
        let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(trap) = installed.as_ref() {
            return Ok(trap.clone());
        }
        let trap = Self::spawn_feeder()?;
        *installed = Some(trap.clone());
        Ok(trap)
    }

    fn spawn_feeder() -> std::io::Result<Self> {
        let trap = Self::new();
        let feeder = trap.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        thread::Builder::new()
            .name("cadence-signals".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut listeners = match Listeners::arm() {
                        Ok(listeners) => {
                            ready_tx.send(Ok(())).ok();
                            listeners
                        }
                        Err(e) => {
                            ready_tx.send(Err(e)).ok();
                            return;
                        }
                    };
                    loop {
                        match listeners.recv().await {
                            Ok(signal) => feeder.raise(signal),
                            Err(e) => {
                                warn!("Signal listener failed: {}", e);
                                break;
                            }
                        }
                    }
                })
            })?;
        // Listeners must be armed before `install` returns, or an early signal
        // would take the default action and kill the process.
        ready_rx
            .recv()
            .map_err(|_| std::io::Error::other("signal thread exited before arming"))??;
        info!("OS signal trap installed.");
        Ok(trap)
    }

    /// Parks a signal in the trap and wakes any sleeper.
    pub fn raise(&self, signal: Signal) {
        debug!("Signal {} trapped.", signal);
        let mut pending = self
            .state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *pending = Some(signal);
        self.state.wake.notify_all();
    }

    /// Removes and returns the pending signal, if any.
    pub fn take(&self) -> Option<Signal> {
        self.state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Sleeps for `duration`, returning early with the signal if one arrives.
    ///
    /// A signal that was already pending is returned immediately.
    pub fn sleep(&self, duration: Duration) -> Option<Signal> {
        let deadline = Instant::now() + duration;
        let mut pending = self
            .state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(signal) = pending.take() {
                return Some(signal);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            pending = self
                .state
                .wake
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl fmt::Debug for SignalTrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalTrap").finish_non_exhaustive()
    }
}

#[cfg(unix)]
struct Listeners {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sigquit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Listeners {
    fn arm() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> std::io::Result<Signal> {
        tokio::select! {
            _ = self.sigint.recv()  => Ok(Signal::Interrupt),
            _ = self.sigterm.recv() => Ok(Signal::Terminate),
            _ = self.sigquit.recv() => Ok(Signal::Quit),
        }
    }
}

#[cfg(not(unix))]
struct Listeners;

#[cfg(not(unix))]
impl Listeners {
    fn arm() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> std::io::Result<Signal> {
        tokio::signal::ctrl_c().await?;
        Ok(Signal::Interrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_times_out_without_signal() {
        let trap = SignalTrap::new();
        let started = Instant::now();
        assert_eq!(trap.sleep(Duration::from_millis(20)), None);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_pending_signal_returns_immediately() {
        let trap = SignalTrap::new();
        trap.raise(Signal::Quit);
        assert_eq!(trap.sleep(Duration::from_secs(30)), Some(Signal::Quit));
        // Consumed by the first sleeper.
        assert_eq!(trap.take(), None);
    }

    #[test]
    fn test_raise_wakes_sleeper() {
        let trap = SignalTrap::new();
        let raiser = trap.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            raiser.raise(Signal::Interrupt);
        });
        let started = Instant::now();
        assert_eq!(trap.sleep(Duration::from_secs(30)), Some(Signal::Interrupt));
        assert!(started.elapsed() < Duration::from_secs(30));
        handle.join().unwrap();
    }

    #[test]
    fn test_install_shares_one_trap() {
        let first = SignalTrap::install().unwrap();
        let second = SignalTrap::install().unwrap();
        assert!(Arc::ptr_eq(&first.state, &second.state));
        assert!(!Arc::ptr_eq(&first.state, &SignalTrap::new().state));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::Interrupt.to_string(), "SIGINT");
        assert_eq!(Signal::Quit.to_string(), "SIGQUIT");
    }
}
