//! Per-tenant concurrency limiting.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result, Stage};

/// Per-tenant concurrency limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkheadConfig {
    /// Calls allowed in flight at once.
    pub max_concurrent: usize,
    /// Callers allowed to wait for a slot; beyond this calls are rejected.
    pub max_queued: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queued: 20,
        }
    }
}

/// Bounds in-flight calls for one tenant, with a bounded wait queue.
#[derive(Debug)]
pub struct Bulkhead {
    tenant_id: String,
    config: BulkheadConfig,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
}

/// Slot held for the duration of one call.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bulkhead {
    pub fn new(tenant_id: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            queued: AtomicUsize::new(0),
            config,
        }
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn rejected(&self) -> Error {
        Error::BulkheadRejected {
            tenant: self.tenant_id.clone(),
            max_concurrent: self.config.max_concurrent,
            max_queued: self.config.max_queued,
        }
    }

    fn try_enqueue(&self) -> Option<QueueSlot<'_>> {
        loop {
            let current = self.queued.load(Ordering::Acquire);
            if current >= self.config.max_queued {
                return None;
            }
            if self
                .queued
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(QueueSlot(&self.queued));
            }
        }
    }

    /// Takes a free slot, waits in the queue for one, or rejects at once
    /// when the queue is full.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<BulkheadPermit> {
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(BulkheadPermit { _permit: permit });
        }

        let Some(_slot) = self.try_enqueue() else {
            tracing::warn!(
                tenant = %self.tenant_id,
                max_concurrent = self.config.max_concurrent,
                max_queued = self.config.max_queued,
                "Bulkhead full; rejecting call"
            );
            return Err(self.rejected());
        };

        tracing::debug!(
            tenant = %self.tenant_id,
            queued = self.queued(),
            "Waiting for bulkhead slot"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled {
                tenant: self.tenant_id.clone(),
                stage: Stage::Bulkhead,
            }),
            permit = Arc::clone(&self.permits).acquire_owned() => permit
                .map(|permit| BulkheadPermit { _permit: permit })
                .map_err(|_| self.rejected()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulkhead(max_concurrent: usize, max_queued: usize) -> Arc<Bulkhead> {
        Arc::new(Bulkhead::new(
            "t",
            BulkheadConfig {
                max_concurrent,
                max_queued,
            },
        ))
    }

    async fn wait_for_queue(bulkhead: &Bulkhead, len: usize) {
        while bulkhead.queued() < len {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_admits_up_to_max_concurrent() {
        let bh = bulkhead(2, 0);
        let cancel = CancellationToken::new();
        let _a = bh.acquire(&cancel).await.unwrap();
        let _b = bh.acquire(&cancel).await.unwrap();
        assert_eq!(bh.in_flight(), 2);

        let err = bh.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::BulkheadRejected { max_concurrent: 2, .. }));
    }

    #[tokio::test]
    async fn test_queued_caller_gets_released_slot() {
        let bh = bulkhead(1, 1);
        let cancel = CancellationToken::new();
        let held = bh.acquire(&cancel).await.unwrap();

        let mut waiter = tokio_test::task::spawn(bh.acquire(&cancel));
        tokio_test::assert_pending!(waiter.poll());
        assert_eq!(bh.queued(), 1);

        // Queue is full: the third caller is rejected without waiting.
        let err = bh.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::BulkheadRejected { .. }));

        drop(held);
        assert!(waiter.is_woken());
        let permit = tokio_test::assert_ready_ok!(waiter.poll());
        assert_eq!(bh.in_flight(), 1);
        drop(permit);
        drop(waiter);
        assert_eq!(bh.queued(), 0);
        assert_eq!(bh.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_while_queued() {
        let bh = bulkhead(1, 4);
        let _held = bh.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let bh = Arc::clone(&bh);
            let cancel = cancel.clone();
            tokio::spawn(async move { bh.acquire(&cancel).await.map(|_| ()) })
        };
        wait_for_queue(&bh, 1).await;

        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Cancelled {
                stage: Stage::Bulkhead,
                ..
            }
        ));
        assert_eq!(bh.queued(), 0);
    }
}
