//! Single-slot holder for the last start/stop failure of a run

use crate::error::ServiceError;
use std::sync::{Mutex, MutexGuard};

/// Written by the control loop, read by `run` once the loop has returned.
/// The lock is only held for the read or write itself.
#[derive(Debug, Default)]
pub struct ErrorBox {
    slot: Mutex<Option<ServiceError>>,
}

impl ErrorBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, error: ServiceError) {
        *self.lock() = Some(error);
    }

    /// Take the stored error, leaving the box empty
    pub fn take(&self) -> Option<ServiceError> {
        self.lock().take()
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ServiceError>> {
        // A panicking writer cannot leave the Option half-written
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
