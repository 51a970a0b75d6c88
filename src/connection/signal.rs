//! Single-fire close signal shared by a connection's tasks

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Fires once; every clone observes it, including clones that start waiting late
#[derive(Debug, Clone, Default)]
pub struct CloseSignal {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `true` only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has fired
    pub async fn fired(&self) {
        self.token.cancelled().await
    }

    /// Guard that fires the signal when dropped, whatever the exit path
    pub fn guard(&self) -> CloseGuard {
        CloseGuard {
            signal: self.clone(),
        }
    }
}

/// Fires its [`CloseSignal`] on drop
#[derive(Debug)]
pub struct CloseGuard {
    signal: CloseSignal,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if self.signal.fire() {
            tracing::debug!("Close signal fired");
        }
    }
}
