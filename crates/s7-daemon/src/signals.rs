//! Signal handling for graceful shutdown.
//!
//! SIGTERM and SIGINT request shutdown. SIGHUP asks the daemon to log a
//! link status report without stopping.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind as UnixSignalKind};

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM.
    Terminate,
    /// SIGINT (Ctrl-C).
    Interrupt,
    /// SIGHUP.
    Hangup,
}

impl SignalKind {
    /// Whether this signal stops the daemon.
    pub fn is_shutdown(self) -> bool {
        matches!(self, Self::Terminate | Self::Interrupt)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Flags recorded from received signals.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    report_requested: AtomicBool,
    signal_count: AtomicU64,
}

impl SignalState {
    /// Create a state with no signals recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received signal and raise the matching flag.
    pub fn record(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        if kind.is_shutdown() {
            self.shutdown_requested.store(true, Ordering::Release);
        } else {
            self.report_requested.store(true, Ordering::Release);
        }
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Request shutdown without a signal.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    /// Check and clear the status report flag.
    pub fn take_report_request(&self) -> bool {
        self.report_requested.swap(false, Ordering::AcqRel)
    }

    /// Number of signals received so far.
    pub fn signal_count(&self) -> u64 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

/// Async signal listener.
///
/// Must be created inside a tokio runtime.
pub struct SignalHandler {
    state: SignalState,
    #[cfg(unix)]
    terminate: Signal,
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    hangup: Signal,
}

impl SignalHandler {
    /// Register the signal listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot be installed.
    #[cfg(unix)]
    pub fn new() -> std::io::Result<Self> {
        let handler = Self {
            state: SignalState::new(),
            terminate: signal(UnixSignalKind::terminate())?,
            interrupt: signal(UnixSignalKind::interrupt())?,
            hangup: signal(UnixSignalKind::hangup())?,
        };
        debug!("Unix signal handlers registered");
        Ok(handler)
    }

    /// Register the signal listeners.
    ///
    /// # Errors
    ///
    /// Never fails on this platform; Ctrl-C is awaited lazily.
    #[cfg(not(unix))]
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            state: SignalState::new(),
        })
    }

    /// Wait for the next signal and record it.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> SignalKind {
        let kind = tokio::select! {
            _ = self.terminate.recv() => SignalKind::Terminate,
            _ = self.interrupt.recv() => SignalKind::Interrupt,
            _ = self.hangup.recv() => SignalKind::Hangup,
        };
        self.note(kind);
        kind
    }

    /// Wait for the next signal and record it.
    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> SignalKind {
        // Listener failure is treated as an interrupt so the daemon still stops.
        let _ = tokio::signal::ctrl_c().await;
        self.note(SignalKind::Interrupt);
        SignalKind::Interrupt
    }

    fn note(&self, kind: SignalKind) {
        if kind.is_shutdown() {
            info!(signal = %kind, "Shutdown signal received");
        } else {
            info!(signal = %kind, "Status report requested");
        }
        self.state.record(kind);
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Get the signal state for inspection.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}
