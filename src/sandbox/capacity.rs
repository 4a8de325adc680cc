use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::PatchvalError;

/// Bounds how many sandboxes a provider keeps alive at once.
#[derive(Clone)]
pub struct SandboxSlots {
    semaphore: Arc<Semaphore>,
    total: usize,
}

impl SandboxSlots {
    pub fn new(total: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(total)),
            total,
        }
    }

    /// Claim a slot without waiting. The slot is freed when the permit drops.
    pub fn try_claim(&self) -> Result<OwnedSemaphorePermit, PatchvalError> {
        self.semaphore.clone().try_acquire_owned().map_err(|_| {
            PatchvalError::NoCapacity(format!("all {} sandbox slots in use", self.total))
        })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
