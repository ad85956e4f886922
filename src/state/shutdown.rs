//! Graceful shutdown on SIGINT / SIGTERM with a reentrancy guard and an
//! emergency snapshot save.
//!
//! The handler is installed once per process. Repeated signals while the
//! handler is executing are ignored via an atomic compare-and-set on a
//! `handling` flag. The snapshot is injected after construction so the
//! signal handler can exist before the pipeline state does.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::state::snapshot::PipelineSnapshot;

struct Inner {
    should_stop: AtomicBool,
    handling: AtomicBool,
    state: Mutex<Option<(Arc<Mutex<PipelineSnapshot>>, PathBuf)>>,
}

/// Process-wide shutdown signal.
///
/// Cloning shares the underlying flag, so phase executors and builder
/// tasks can poll `should_stop` cheaply.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                should_stop: AtomicBool::new(false),
                handling: AtomicBool::new(false),
                state: Mutex::new(None),
            }),
        }
    }

    /// Whether a shutdown signal has been received.
    pub fn should_stop(&self) -> bool {
        self.inner.should_stop.load(Ordering::SeqCst)
    }

    /// Inject the snapshot and state directory used for emergency saves.
    pub fn set_state(&self, snapshot: Arc<Mutex<PipelineSnapshot>>, state_dir: PathBuf) {
        *self.inner.state.lock().expect("shutdown state lock poisoned") =
            Some((snapshot, state_dir));
    }

    /// Register SIGINT/SIGTERM handlers on the running tokio runtime.
    pub fn install(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{SignalKind, signal};
                let mut sigint = match signal(SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Failed to register SIGINT handler: {e}");
                        return;
                    }
                };
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {e}");
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = sigint.recv() => Self::handle(&inner),
                        _ = sigterm.recv() => Self::handle(&inner),
                    }
                }
            }
            #[cfg(not(unix))]
            {
                loop {
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                    Self::handle(&inner);
                }
            }
        });
    }

    /// Run the handler body directly. Used by the installed signal task
    /// and by tests simulating a signal.
    pub fn trigger(&self) {
        Self::handle(&self.inner);
    }

    fn handle(inner: &Inner) {
        // Reentrancy guard: a signal arriving while the handler runs is
        // dropped.
        if inner
            .handling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        warn!("Received shutdown signal, initiating graceful shutdown");
        inner.should_stop.store(true, Ordering::SeqCst);
        Self::emergency_save(inner);

        inner.handling.store(false, Ordering::SeqCst);
    }

    fn emergency_save(inner: &Inner) {
        let guard = inner.state.lock().expect("shutdown state lock poisoned");
        let Some((snapshot, state_dir)) = guard.as_ref() else {
            warn!("No pipeline state to save during emergency shutdown");
            return;
        };
        match snapshot.lock() {
            Ok(mut snap) => {
                snap.interrupted = true;
                snap.interrupt_reason = "Signal received".to_string();
                match snap.save(state_dir) {
                    Ok(()) => info!("Emergency state save completed"),
                    Err(e) => warn!("Failed to save state during emergency shutdown: {e:#}"),
                }
            }
            Err(_) => warn!("Snapshot lock poisoned during emergency shutdown"),
        }
    }
}
