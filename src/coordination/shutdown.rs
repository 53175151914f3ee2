//! Stop signalling for the periodic loops
//!
//! One `Shutdown` per control plane; every loop holds a `ShutdownToken` and
//! selects on `cancelled()` next to its tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// How the control plane was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM or SIGINT: deliver what is queued, then stop
    Graceful,
    /// SIGQUIT: stop the bus with messages still queued
    Urgent,
}

impl ShutdownSignal {
    /// Whether queued bus messages are delivered before the bus stops
    pub fn drains_bus(self) -> bool {
        matches!(self, ShutdownSignal::Graceful)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownSignal::Graceful => "drain_then_stop",
            ShutdownSignal::Urgent => "stop_without_drain",
        }
    }
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the control plane is in its stop sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Monitoring and supervisor loops are being joined
    StoppingLoops,
    /// Bridge and subscriptions are gone, queued messages are delivered
    DrainingBus,
    Complete,
}

impl ShutdownPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownPhase::Running => "supervising",
            ShutdownPhase::StoppingLoops => "joining_loops",
            ShutdownPhase::DrainingBus => "flushing_bus",
            ShutdownPhase::Complete => "stopped",
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner side of the stop signal
#[derive(Clone)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    stop_tx: Arc<watch::Sender<bool>>,
    phase_tx: Arc<watch::Sender<ShutdownPhase>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            stop_tx: Arc::new(stop_tx),
            phase_tx: Arc::new(phase_tx),
        }
    }

    /// Create a token for a loop
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            stop_rx: self.stop_tx.subscribe(),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Signal every token. Returns false if already requested.
    pub fn request(&self) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            warn!("Control plane is already stopping");
            return false;
        }
        info!("Stopping supervision loops");
        self.stop_tx.send_replace(true);
        true
    }

    pub fn set_phase(&self, phase: ShutdownPhase) {
        let previous = self.phase_tx.send_replace(phase);
        info!(from = %previous, to = %phase, "Control plane stop sequence advanced");
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Loop side of the stop signal
#[derive(Clone)]
pub struct ShutdownToken {
    stop_rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Resolves once shutdown has been requested (or the owner is gone)
    pub async fn cancelled(&mut self) {
        while !*self.stop_rx.borrow_and_update() {
            if self.stop_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Wait for an OS termination signal
pub async fn wait_for_signal() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut term, mut quit) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::quit()),
        ) {
            (Ok(term), Ok(quit)) => (term, quit),
            _ => {
                warn!("Unix signal handlers unavailable, only Ctrl-C will stop hivectl");
                let _ = tokio::signal::ctrl_c().await;
                return ShutdownSignal::Graceful;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(signal = "SIGINT", "Stop requested, queued bus messages will be delivered");
                ShutdownSignal::Graceful
            }
            _ = term.recv() => {
                info!(signal = "SIGTERM", "Stop requested, queued bus messages will be delivered");
                ShutdownSignal::Graceful
            }
            _ = quit.recv() => {
                warn!(signal = "SIGQUIT", "Stop requested, queued bus messages will be abandoned");
                ShutdownSignal::Urgent
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!(signal = "ctrl_c", "Stop requested, queued bus messages will be delivered");
        ShutdownSignal::Graceful
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_only_sigquit_abandons_the_bus_queue() {
        assert!(ShutdownSignal::Graceful.drains_bus());
        assert!(!ShutdownSignal::Urgent.drains_bus());
        assert_eq!(ShutdownSignal::Urgent.to_string(), "stop_without_drain");
    }

    #[test]
    fn test_phase_follows_the_stop_sequence() {
        let shutdown = Shutdown::new();
        assert_eq!(shutdown.phase(), ShutdownPhase::Running);

        shutdown.set_phase(ShutdownPhase::DrainingBus);
        assert_eq!(shutdown.phase().as_str(), "flushing_bus");
        // Clones share the phase
        let observer = shutdown.clone();
        shutdown.set_phase(ShutdownPhase::Complete);
        assert_eq!(observer.phase(), ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_second_stop_request_is_ignored() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();

        assert!(!shutdown.is_requested());
        assert!(!token.is_cancelled());

        assert!(shutdown.request());
        assert!(token.is_cancelled());

        // A second signal changes nothing
        assert!(!shutdown.request());
    }

    #[tokio::test]
    async fn test_token_wakes_waiting_loop() {
        let shutdown = Shutdown::new();
        let mut token = shutdown.token();

        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });

        shutdown.request();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("token should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_token_created_after_request_is_cancelled() {
        let shutdown = Shutdown::new();
        shutdown.request();

        let mut token = shutdown.token();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled");
    }
}
