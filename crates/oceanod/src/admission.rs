//! Request-time gate in front of the shared model.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting gate bounding concurrent model use on the search path.
#[derive(Clone)]
pub struct SearchAdmission {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// Held while a request may use the model. Releases its slot when dropped,
/// so every exit path gives it back exactly once.
#[derive(Debug)]
pub struct AdmissionToken {
    _permit: OwnedSemaphorePermit,
}

impl SearchAdmission {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait up to `timeout` for a slot. `None` means the server is busy.
    pub async fn try_acquire(&self, timeout: Duration) -> Option<AdmissionToken> {
        match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Some(AdmissionToken { _permit: permit }),
            Ok(Err(_)) | Err(_) => None,
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_busy_within_timeout() {
        let gate = SearchAdmission::new(1);
        let held = gate.try_acquire(Duration::from_millis(10)).await;
        assert!(held.is_some());

        let start = Instant::now();
        let denied = gate.try_acquire(Duration::from_millis(50)).await;
        let waited = start.elapsed();
        assert!(denied.is_none());
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_drop_releases_slot() {
        let gate = SearchAdmission::new(1);
        {
            let _token = gate.try_acquire(Duration::from_millis(10)).await.unwrap();
            assert_eq!(gate.available(), 0);
        }
        assert_eq!(gate.available(), 1);
        assert!(gate.try_acquire(Duration::from_millis(10)).await.is_some());
    }

    #[tokio::test]
    async fn test_waiter_admitted_when_slot_frees() {
        let gate = SearchAdmission::new(1);
        let token = gate.try_acquire(Duration::from_millis(10)).await.unwrap();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.try_acquire(Duration::from_secs(5)).await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(token);
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        assert_eq!(SearchAdmission::new(0).capacity(), 1);
    }
}
