//! OS signal handling for the worker.

use std::future;
use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::debug;

/// The external events that signals map to while a worker is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignalEvent {
    /// Begin a graceful stop (SIGTERM).
    Stop,
    /// Push a stats snapshot to the parent (SIGUSR1).
    Stats,
}

/// The worker's signal streams.
///
/// Signals surface as values from [`Signals::recv`] and are handled inside
/// the event loop; the OS-level handlers themselves do no work. This keeps
/// all state single-threaded and means a signal can only take effect at a
/// suspension point.
pub(crate) struct Signals {
    /// SIGTERM: graceful stop.
    terminate: Signal,
    /// SIGUSR1: stats snapshot request.
    stats: Signal,
    /// SIGINT: ignored. The supervisor owns user interrupts.
    interrupt: Signal,
    /// Once disarmed, the streams never produce events again.
    armed: bool,
}

impl Signals {
    /// Installs the worker's signal streams. Must be called from within the
    /// runtime.
    pub(crate) fn install() -> io::Result<Self> {
        let signals = Self {
            terminate: signal(SignalKind::terminate())?,
            stats: signal(SignalKind::user_defined1())?,
            interrupt: signal(SignalKind::interrupt())?,
            armed: true,
        };
        debug!("Signal handlers installed");
        Ok(signals)
    }

    /// Resolves to the next mapped signal event.
    ///
    /// Interrupts are swallowed with a debug log. After [`Signals::disarm`]
    /// this pends forever, so late signals cannot re-enter the shutdown
    /// path.
    pub(crate) async fn recv(&mut self) -> SignalEvent {
        if !self.armed {
            return future::pending().await;
        }
        loop {
            tokio::select! {
                _ = self.terminate.recv() => return SignalEvent::Stop,
                _ = self.stats.recv() => return SignalEvent::Stats,
                _ = self.interrupt.recv() => {
                    debug!("Ignoring interrupt, the supervisor handles it");
                }
            }
        }
    }

    /// Replaces the handlers with no-ops for the remainder of the process.
    pub(crate) fn disarm(&mut self) {
        debug!("Disarming signal handlers");
        self.armed = false;
    }
}
