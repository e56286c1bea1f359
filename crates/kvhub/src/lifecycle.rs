//! Termination-signal hooks.
//!
//! On SIGINT or SIGTERM every registered connection is closed through
//! [`ConnectionRegistry::shutdown`]:
//!
//! - [`register_shutdown_hooks`] runs the shutdown and then exits the process
//! - [`ShutdownHooks`] is the same machinery without the exit, for embedding
//!   the shutdown into a larger teardown

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::ConnectionRegistry;

/// Signal that triggered the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// SIGINT (Ctrl-C).
    Interrupt,
    /// SIGTERM.
    Terminate,
}

/// Installed SIGINT and SIGTERM listeners.
///
/// Listeners are registered on [`ShutdownHooks::install`], so a signal that
/// arrives before [`ShutdownHooks::wait`] is polled is not lost.
pub struct ShutdownHooks {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownHooks {
    /// Register the listeners. Must be called inside a tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the first termination signal.
    pub async fn wait(&mut self) -> TerminationSignal {
        tokio::select! {
            _ = self.interrupt.recv() => {
                info!("Received SIGINT, closing connections");
                TerminationSignal::Interrupt
            }
            _ = self.terminate.recv() => {
                info!("Received SIGTERM, closing connections");
                TerminationSignal::Terminate
            }
        }
    }

    /// Wait for a signal, then shut `registry` down.
    pub async fn run(mut self, registry: ConnectionRegistry) -> TerminationSignal {
        let signal = self.wait().await;
        registry.shutdown().await;
        info!(?signal, "Shutdown complete");
        signal
    }
}

/// Close all connections and exit with status 0 on SIGINT or SIGTERM.
///
/// Returns `None` without installing anything if `registry` is not
/// initialized. Each call installs another hook.
pub fn register_shutdown_hooks(
    registry: &ConnectionRegistry,
) -> io::Result<Option<JoinHandle<()>>> {
    if !registry.is_initialized() {
        warn!("Registry not initialized, shutdown hooks not registered");
        return Ok(None);
    }

    let hooks = ShutdownHooks::install()?;
    let registry = registry.clone();
    let handle = tokio::spawn(async move {
        hooks.run(registry).await;
        std::process::exit(0);
    });

    info!("Shutdown hooks registered");
    Ok(Some(handle))
}
