//! Bridge from process termination signals to the event loop.
//!
//! Signal handlers run outside the cooperative scheduler; the only
//! signal-safe action is writing to an already-open descriptor. tokio's
//! signal driver performs exactly that rendezvous (handler writes to a pipe
//! the runtime polls), so the bridge composes per-signal streams instead of
//! installing raw handlers itself.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

use crate::error::{Error, Result};

/// Which termination signal was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGINT (Ctrl-C).
    Interrupt,
    /// SIGTERM.
    Terminate,
}

/// Awaitable view of SIGINT and SIGTERM.
///
/// Constructing the bridge installs the listeners; dropping it releases the
/// per-instance streams. Processes that own a server create one bridge at
/// startup and drive shutdown from [`wait_terminate`](Self::wait_terminate).
pub struct SignalBridge {
    interrupt: Signal,
    terminate: Signal,
}

impl SignalBridge {
    pub fn new() -> Result<Self> {
        let interrupt = signal(SignalKind::interrupt()).map_err(|e| Error::Config {
            message: format!("cannot install SIGINT handler: {e}"),
        })?;
        let terminate = signal(SignalKind::terminate()).map_err(|e| Error::Config {
            message: format!("cannot install SIGTERM handler: {e}"),
        })?;
        Ok(Self {
            interrupt,
            terminate,
        })
    }

    /// Suspend until SIGINT or SIGTERM arrives and report which one fired.
    pub async fn wait_terminate(&mut self) -> Termination {
        tokio::select! {
            _ = self.interrupt.recv() => {
                info!("caught SIGINT, terminating");
                Termination::Interrupt
            }
            _ = self.terminate.recv() => {
                info!("caught SIGTERM, terminating");
                Termination::Terminate
            }
        }
    }
}
