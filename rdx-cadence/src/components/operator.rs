//! The agent operator: loads descriptors at STARTUP and runs the acceptor.
//!
//! The acceptor lives on its own thread with a current-thread tokio runtime.
//! It accepts connections and voids them; there is no protocol yet. STARTUP
//! returns once the listener is bound and handed to the thread, and SHUTDOWN
//! returns once the stop request is sent and the thread has either finished
//! or outlived the configured grace period.

use crate::common::{EventId, Verdict};
use crate::components::registry::{AgentRegistry, DescriptorSet};
use crate::config::OperatorConfig;
use crate::error::Fault;
use crate::events::OperatorEvents;
use crate::router::Router;
use crate::scheduler::{EventScheduler, Routine};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

struct Acceptor {
    shutdown_tx: broadcast::Sender<()>,
    thread: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl Acceptor {
    fn spawn(address: &str) -> Result<Self, Fault> {
        let listener = std::net::TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        // Subscribe before spawning so a stop sent right away is not lost.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let thread = thread::Builder::new()
            .name("cadence-acceptor".into())
            .spawn(move || runtime.block_on(accept_loop(listener, shutdown_rx)))?;
        Ok(Self {
            shutdown_tx,
            thread,
            local_addr,
        })
    }

    /// Sends the stop request and waits up to `grace` for the thread to end.
    /// Returns `false` if it is still running.
    fn shutdown(self, grace: Duration) -> bool {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Acceptor already gone before the stop request.");
        }
        let deadline = Instant::now() + grace;
        while !self.thread.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if self.thread.join().is_err() {
            error!("Acceptor thread panicked.");
        }
        true
    }
}

async fn accept_loop(listener: std::net::TcpListener, mut shutdown_rx: broadcast::Receiver<()>) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Acceptor could not adopt its listener: {}", e);
            return;
        }
    };
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Voiding received connection from {}.", peer);
                    drop(stream);
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }
    debug!("Acceptor stopped.");
}

struct OperatorInner {
    config: OperatorConfig,
    scheduler: EventScheduler,
    registry: AgentRegistry,
    acceptor: Mutex<Option<Acceptor>>,
}

/// Loads agent descriptors and runs the acceptor alongside a router.
///
/// The operator is a handle and is the payload of its own
/// [`OperatorEvents`], so routines on those events can inspect it.
#[derive(Clone)]
pub struct AgentOperator {
    inner: Arc<OperatorInner>,
}

impl AgentOperator {
    /// Creates an operator and registers its STARTUP and SHUTDOWN routines on
    /// the router's scheduler.
    pub fn attach(router: &Router, config: OperatorConfig) -> Result<Self, Fault> {
        let scheduler = router.scheduler().clone();
        let operator = Self {
            inner: Arc::new(OperatorInner {
                registry: AgentRegistry::new(scheduler.clone()),
                scheduler,
                config,
                acceptor: Mutex::new(None),
            }),
        };
        operator.register_lifecycle(EventId::STARTUP, AgentOperator::on_startup)?;
        operator.register_lifecycle(EventId::SHUTDOWN, AgentOperator::on_shutdown)?;
        Ok(operator)
    }

    // The scheduler owns the routines, so they hold the operator weakly.
    fn register_lifecycle(
        &self,
        event: EventId,
        step: fn(&AgentOperator) -> Result<Verdict, Fault>,
    ) -> Result<(), Fault> {
        let weak: Weak<OperatorInner> = Arc::downgrade(&self.inner);
        self.inner.scheduler.register(
            event,
            Routine::new(move |_| match weak.upgrade() {
                Some(inner) => step(&AgentOperator { inner }),
                None => Ok(Verdict::Pass),
            }),
        )
    }

    fn on_startup(&self) -> Result<Verdict, Fault> {
        let scheduler = &self.inner.scheduler;
        if scheduler.dispatch(&OperatorEvents::STARTUP, self)? {
            info!("Operator startup was vetoed.");
            return Ok(Verdict::Pass);
        }

        let config = &self.inner.config;
        if let Some(path) = &config.descriptors {
            info!("Loading agent descriptors from {}.", path.display());
            let descriptors = DescriptorSet::load(path)?;
            let registered = self.inner.registry.register_all(descriptors)?;
            info!("Loaded {} agents from configuration.", registered.len());
        }

        let acceptor = Acceptor::spawn(&config.listen_address())?;
        info!("Starting up master agent operator on {}.", acceptor.local_addr);
        *self.lock_acceptor() = Some(acceptor);
        Ok(Verdict::Pass)
    }

    fn on_shutdown(&self) -> Result<Verdict, Fault> {
        let scheduler = &self.inner.scheduler;
        if scheduler.dispatch(&OperatorEvents::SHUTDOWN, self)? {
            info!("Operator shutdown was vetoed.");
            return Ok(Verdict::Pass);
        }

        let Some(acceptor) = self.lock_acceptor().take() else {
            return Ok(Verdict::Pass);
        };
        info!("Shutting down master operator server.");
        if !acceptor.shutdown(self.inner.config.shutdown_grace()) {
            scheduler.dispatch(&OperatorEvents::SHUTDOWN_ERROR, self)?;
            warn!("Operator server shut down but its acceptor thread is still running!");
        }
        Ok(Verdict::Pass)
    }

    fn lock_acceptor(&self) -> std::sync::MutexGuard<'_, Option<Acceptor>> {
        self.inner
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The registry descriptors are fed into.
    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.inner.config
    }

    /// Whether the acceptor is currently running.
    pub fn is_started(&self) -> bool {
        self.lock_acceptor().is_some()
    }

    /// The bound listen address, while the acceptor is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_acceptor().as_ref().map(|a| a.local_addr)
    }
}

impl fmt::Debug for AgentOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentOperator")
            .field("config", &self.inner.config)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;

    fn quick_router() -> Router {
        Router::new(RouterConfig {
            tick_interval_ms: 0,
            trap_signals: false,
            ..Default::default()
        })
        .unwrap()
    }

    fn loopback() -> OperatorConfig {
        OperatorConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_attach_registers_lifecycle_routines() {
        let router = quick_router();
        let operator = AgentOperator::attach(&router, loopback()).unwrap();
        assert_eq!(router.scheduler().handler_count(&EventId::STARTUP), 2);
        assert_eq!(router.scheduler().handler_count(&EventId::SHUTDOWN), 2);
        assert!(!operator.is_started());
        assert!(operator.local_addr().is_none());
    }

    #[test]
    fn test_acceptor_stops_within_grace() {
        let acceptor = Acceptor::spawn("127.0.0.1:0").unwrap();
        assert_ne!(acceptor.local_addr.port(), 0);
        assert!(acceptor.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn test_startup_veto_skips_acceptor() {
        let router = quick_router();
        let operator = AgentOperator::attach(&router, loopback()).unwrap();
        router
            .scheduler()
            .on(OperatorEvents::STARTUP, |event| {
                assert!(event.payload::<AgentOperator>().is_some());
                Ok(Verdict::Cancel)
            })
            .unwrap();

        assert_eq!(operator.on_startup().unwrap(), Verdict::Pass);
        assert!(!operator.is_started());
    }

    #[test]
    fn test_missing_descriptor_file_fails_startup() {
        let router = quick_router();
        let operator = AgentOperator::attach(
            &router,
            OperatorConfig {
                descriptors: Some("/definitely/not/agents.toml".into()),
                ..loopback()
            },
        )
        .unwrap();

        let err = operator.on_startup().unwrap_err();
        assert_eq!(err.as_label(), "config");
        assert!(!operator.is_started());
    }
}
