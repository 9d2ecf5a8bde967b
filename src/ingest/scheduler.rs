//! Concurrency control for chunk ingestion.
//!
//! Caps the number of ingestions in flight so the destination is not
//! flooded. One scheduler may be shared by several uploads; clones share
//! the same slots.
//!
//! ```ignore
//! let scheduler = IngestScheduler::new(4)?;
//! let permit = scheduler.acquire().await?;
//! // ingest while holding the permit; the slot frees on drop
//! ```

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::PipelineError;

// ─────────────────────────────────────────────────────────────────────────────
// IngestScheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Semaphore-backed limit on concurrent ingestions.
#[derive(Debug, Clone)]
pub struct IngestScheduler {
    sem: Arc<Semaphore>,
    max: usize,
}

impl IngestScheduler {
    /// Creates a scheduler with `max_concurrent` slots.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `max_concurrent` is 0.
    pub fn new(max_concurrent: usize) -> Result<Self, PipelineError> {
        if max_concurrent == 0 {
            return Err(PipelineError::Config(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            sem: Arc::new(Semaphore::new(max_concurrent)),
            max: max_concurrent,
        })
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the semaphore was closed.
    pub async fn acquire(&self) -> Result<IngestPermit, PipelineError> {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Internal(format!("Ingest scheduler closed: {}", e)))?;

        Ok(IngestPermit { _permit: permit })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// IngestPermit
// ─────────────────────────────────────────────────────────────────────────────

/// An occupied ingestion slot, released on drop.
pub struct IngestPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn zero_slots_is_a_config_error() {
        assert!(matches!(IngestScheduler::new(0), Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn acquire_waits_for_a_free_slot() {
        let scheduler = IngestScheduler::new(1).unwrap();
        let held = scheduler.acquire().await.unwrap();

        let waiter = scheduler.clone();
        let handle = tokio::spawn(async move { waiter.acquire().await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished(), "acquire should block while full");

        drop(held);
        timeout(Duration::from_millis(200), handle)
            .await
            .expect("acquire should complete after release")
            .expect("task should not panic")
            .unwrap();
    }

    #[tokio::test]
    async fn clones_share_slots() {
        let a = IngestScheduler::new(2).unwrap();
        let b = a.clone();

        let _p1 = a.acquire().await.unwrap();
        let _p2 = b.acquire().await.unwrap();
        assert!(timeout(Duration::from_millis(20), a.acquire()).await.is_err());
        assert_eq!(b.max_concurrent(), 2);
    }
}
