//! Byte-credit flow-control window for one stream direction.
//!
//! The sender acquires credit before a data frame goes out and the receiver
//! returns it once the frame has been consumed. When the window is exhausted
//! `acquire` suspends; this is the only point where a sender blocks.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::TransportError;

/// Default per-stream window, in bytes.
pub const DEFAULT_WINDOW_SIZE: usize = 64 * 1024;

/// Shared credit window. Clones refer to the same window.
#[derive(Debug, Clone)]
pub struct FlowWindow {
    credit: Arc<Semaphore>,
    size: usize,
}

impl FlowWindow {
    /// Creates a window holding `size` bytes of credit.
    pub fn new(size: usize) -> Self {
        let size = size.clamp(1, u32::MAX as usize);
        Self {
            credit: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Waits for credit to send `bytes`, returning the credit taken.
    ///
    /// Requests larger than the window take the whole window, so an oversized
    /// frame is admitted once every earlier frame has been consumed.
    pub async fn acquire(&self, bytes: usize) -> Result<usize, TransportError> {
        let credit = bytes.min(self.size);
        if credit == 0 {
            return Ok(0);
        }
        let permit = self
            .credit
            .acquire_many(credit as u32)
            .await
            .map_err(|_| TransportError::Closed)?;
        permit.forget();
        Ok(credit)
    }

    /// Takes credit without waiting. Returns `None` if not enough is available.
    pub fn try_acquire(&self, bytes: usize) -> Option<usize> {
        let credit = bytes.min(self.size);
        if credit == 0 {
            return Some(0);
        }
        let permit = self.credit.try_acquire_many(credit as u32).ok()?;
        permit.forget();
        Some(credit)
    }

    /// Returns credit taken by [`acquire`](Self::acquire).
    pub fn release(&self, credit: usize) {
        if credit > 0 && !self.credit.is_closed() {
            self.credit.add_permits(credit);
        }
    }

    /// Credit currently available.
    pub fn available(&self) -> usize {
        self.credit.available_permits()
    }

    /// Configured window size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Fails all current and future waiters.
    pub fn close(&self) {
        self.credit.close();
    }

    /// Whether the window has been closed.
    pub fn is_closed(&self) -> bool {
        self.credit.is_closed()
    }
}
