//! One-shot readiness signal
use tokio::sync::watch;

/// Gate that opens once and stays open.
///
/// Opening it a second time means two code paths both believe they performed the
/// first assignment, which is a bug and panics.
#[derive(Debug)]
pub struct ReadinessGate {
    tx: watch::Sender<bool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        ReadinessGate { tx }
    }

    pub fn open(&self) {
        let was_open = self.tx.send_replace(true);
        assert!(!was_open, "readiness gate opened twice");
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the gate is open, immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}
