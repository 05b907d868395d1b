use anyhow::{Context, Result};
use cadence::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // 1. Initialize structured logging. RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // 2. Load the configuration from the given file, or from the environment.
    let config = match std::env::args_os().nth(1) {
        Some(path) => RouterConfig::load(&path)
            .with_context(|| format!("failed to load {}", path.to_string_lossy()))?,
        None => RouterConfig::from_env()?,
    };
    info!("{} v{}", cadence::ENGINE_NAME, cadence::VERSION);

    // 3. Create the router and attach the agent operator to it.
    let operator_config = config.operator.clone().unwrap_or_default();
    let mut router = Router::new(config)?;
    let operator = AgentOperator::attach(&router, operator_config)?;

    // 4. Register a few routines to show the lifecycle at work.
    register_demo_routines(&router)?;

    // 5. Run the loop. This blocks until Ctrl+C or an unhandled fault.
    router.run()?;

    info!(
        "Done. {} agents were registered over {} cycles.",
        operator.registry().len(),
        router.cycles()
    );
    Ok(())
}

fn register_demo_routines(router: &Router) -> Result<(), Fault> {
    let scheduler = router.scheduler();

    scheduler.on(RegistryEvents::AGENT_REGISTERED, |event| {
        if let Some(descriptor) = event.payload::<AgentDescriptor>() {
            info!("[REGISTRY] => Offered {}", descriptor);
        }
        Ok(Verdict::Pass)
    })?;

    scheduler.on(OperatorEvents::STARTUP, |event| {
        if let Some(operator) = event.payload::<AgentOperator>() {
            info!("[OPERATOR] => Starting on {}", operator.config().listen_address());
        }
        Ok(Verdict::Pass)
    })?;

    // Logs every 10th tick to avoid spam.
    let ticks = Arc::new(AtomicU64::new(0));
    scheduler.register(
        EventId::TICK,
        Routine::prioritized(Priority::HIGH, move |_| {
            let seen = ticks.fetch_add(1, Ordering::Relaxed) + 1;
            if seen % 10 == 0 {
                info!("[TICK] => Tick #{}", seen);
            }
            Ok(Verdict::Pass)
        }),
    )?;

    scheduler.on(EventId::SHUTDOWN, |event| {
        if let Some(handle) = event.loop_handle() {
            info!("[SHUTDOWN] => Ran {} cycles.", handle.cycles());
        }
        Ok(Verdict::Pass)
    })?;
    Ok(())
}
