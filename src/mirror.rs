//! In-memory copy of recently consumed envelopes
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::envelope::Envelope;

/// Append-only buffer shared by all claims of a consumer.
///
/// Not linked to the relational store: an envelope lands here as soon as it decodes,
/// whether or not the write that follows succeeds. Lives as long as the process.
#[derive(Debug, Clone, Default)]
pub struct MirrorStore {
    entries: Arc<Mutex<Vec<Envelope>>>,
}

impl MirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, envelope: Envelope) {
        self.lock().push(envelope);
    }

    /// Point-in-time copy; later appends are not visible through it.
    pub fn snapshot(&self) -> Vec<Envelope> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panicking appender cannot leave a half-pushed entry behind.
    fn lock(&self) -> MutexGuard<'_, Vec<Envelope>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
