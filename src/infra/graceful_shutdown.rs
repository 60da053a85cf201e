//! Graceful shutdown handling
//!
//! One coordinator owns the shutdown flag. The HTTP server, the task runner
//! and the retention sweeper each watch it; background tasks register their
//! join handles so shutdown can wait for them, bounded by a drain timeout.
//! Jobs still running when the timeout expires stay `PROCESSING` and are
//! recovered on the next start.

use std::time::Duration;

use tokio::signal;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long to wait for background tasks after the signal
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl ShutdownConfig {
    /// Load configuration from environment (`SHUTDOWN_DRAIN_SECS`)
    pub fn from_env() -> Self {
        let drain_timeout = std::env::var("SHUTDOWN_DRAIN_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));
        Self { drain_timeout }
    }
}

/// Cloneable view of the shutdown flag
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been initiated
    pub async fn wait(mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Coordinator gone; nothing left to wait for
                return;
            }
        }
    }
}

/// Owns the shutdown flag and the background tasks to drain
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Receiver for workers that `select!` on shutdown
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Register a background task to wait for during shutdown
    pub async fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().await.push((name, handle));
    }

    /// Flip the flag. Idempotent.
    pub fn initiate(&self) {
        let changed = self.tx.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        });
        if changed {
            info!("Initiating graceful shutdown...");
        }
    }

    /// Initiate shutdown and wait for tracked tasks. Returns whether all stopped in time.
    pub async fn shutdown(&self, config: &ShutdownConfig) -> bool {
        self.initiate();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let deadline = tokio::time::Instant::now() + config.drain_timeout;
        let mut all_stopped = true;

        for (name, handle) in tasks {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => info!(task = name, "background task stopped"),
                Ok(Err(e)) => {
                    error!(task = name, error = %e, "background task ended abnormally");
                }
                Err(_) => {
                    warn!(task = name, "background task did not stop before drain timeout");
                    all_stopped = false;
                }
            }
        }

        info!("Graceful shutdown complete");
        all_stopped
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
