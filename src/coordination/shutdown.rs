//! Graceful Shutdown Handler
//!
//! Cancellation fan-out for every long-running task plus an ordered shutdown
//! sequence: stop the workers first, then close every feed session.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Why shutdown was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM / SIGINT
    Signal,
    /// Requested from inside the process
    Requested,
    /// A critical task exited on its own
    TaskExited,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Signal => write!(f, "signal"),
            ShutdownReason::Requested => write!(f, "requested"),
            ShutdownReason::TaskExited => write!(f, "task_exited"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for workers to finish their current message (default: 10s)
    pub worker_drain_timeout_secs: u64,
    /// Time allowed for closing every feed session (default: 15s)
    pub session_close_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            worker_drain_timeout_secs: 10,
            session_close_timeout_secs: 15,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    StoppingWorkers,
    ClosingSessions,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingWorkers => write!(f, "stopping_workers"),
            ShutdownPhase::ClosingSessions => write!(f, "closing_sessions"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Cancellation handle held by a task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested (immediately if it already was).
    pub async fn cancelled(&mut self) {
        // A closed channel means the controller is gone, which is also a stop.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Shutdown coordinator
pub struct ShutdownController {
    config: ShutdownConfig,
    requested: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    phase_tx: Arc<watch::Sender<ShutdownPhase>>,
}

impl ShutdownController {
    pub fn new(config: ShutdownConfig) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            requested: AtomicBool::new(false),
            cancel_tx,
            phase_tx: Arc::new(phase_tx),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.cancel_tx.subscribe(),
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    /// Cancel every outstanding [`ShutdownSignal`]
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        if self.requested.swap(true, Ordering::SeqCst) {
            warn!(%reason, "shutdown already requested, ignoring duplicate");
            return;
        }
        info!(%reason, "shutdown requested");
        self.cancel_tx.send_replace(true);
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase_tx.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Run the shutdown sequence. `drain_workers` resolves when every worker
    /// task has returned; `close_sessions` disposes the feed session pool.
    /// Each phase is bounded by its configured timeout.
    pub async fn execute<W, S>(&self, drain_workers: W, close_sessions: S)
    where
        W: Future<Output = ()>,
        S: Future<Output = ()>,
    {
        if !self.is_shutdown_requested() {
            self.request_shutdown(ShutdownReason::Requested);
        }

        self.set_phase(ShutdownPhase::StoppingWorkers);
        let drain = Duration::from_secs(self.config.worker_drain_timeout_secs);
        if tokio::time::timeout(drain, drain_workers).await.is_err() {
            warn!(
                timeout_secs = self.config.worker_drain_timeout_secs,
                "workers did not stop in time, continuing shutdown"
            );
        }

        self.set_phase(ShutdownPhase::ClosingSessions);
        let close = Duration::from_secs(self.config.session_close_timeout_secs);
        if tokio::time::timeout(close, close_sessions).await.is_err() {
            warn!(
                timeout_secs = self.config.session_close_timeout_secs,
                "feed sessions did not close in time"
            );
        }

        self.set_phase(ShutdownPhase::Complete);
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Wait for SIGINT or (on unix) SIGTERM.
pub async fn wait_for_os_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_signal_resolves_after_request() {
        let controller = ShutdownController::with_defaults();
        let mut signal = controller.signal();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
        });
        controller.request_shutdown(ShutdownReason::Signal);
        waiter.await.unwrap();
        assert!(controller.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_cancellation() {
        let controller = ShutdownController::with_defaults();
        controller.request_shutdown(ShutdownReason::Requested);
        let mut late = controller.signal();
        assert!(late.is_cancelled());
        late.cancelled().await;
    }

    #[tokio::test]
    async fn test_execute_runs_phases_in_order() {
        let controller = ShutdownController::with_defaults();
        let order = Arc::new(AtomicUsize::new(0));

        let o1 = order.clone();
        let o2 = order.clone();
        controller
            .execute(
                async move {
                    assert_eq!(o1.fetch_add(1, Ordering::SeqCst), 0);
                },
                async move {
                    assert_eq!(o2.fetch_add(1, Ordering::SeqCst), 1);
                },
            )
            .await;

        assert_eq!(order.load(Ordering::SeqCst), 2);
        assert_eq!(controller.current_phase(), ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_execute_bounds_slow_phase() {
        let controller = ShutdownController::new(ShutdownConfig {
            worker_drain_timeout_secs: 0,
            session_close_timeout_secs: 0,
        });
        controller
            .execute(std::future::pending::<()>(), async {})
            .await;
        assert_eq!(controller.current_phase(), ShutdownPhase::Complete);
    }
}
