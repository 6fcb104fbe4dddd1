//! Per-resource-class concurrency control
//!
//! Each resource class owns a semaphore sized from [`ResourceLimits`]. A step
//! holds one permit of its class for the duration of its tool invocation, so
//! e.g. a single memory-heavy step can run alongside several I/O-bound ones.

use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::options::ResourceLimits;
use crate::tool::ResourceClass;

/// Semaphores keyed by resource class
#[derive(Debug, Clone)]
pub struct ResourcePool {
    /// In `ResourceClass::ALL` order
    semaphores: [Arc<Semaphore>; 3],
}

impl ResourcePool {
    /// Zero limits are raised to one so every class can make progress
    pub fn new(limits: ResourceLimits) -> Self {
        let semaphores =
            ResourceClass::ALL.map(|class| Arc::new(Semaphore::new(limits.limit(class).max(1))));
        Self { semaphores }
    }

    /// Wait for a slot of the given class.
    ///
    /// The permit is released when dropped.
    pub async fn acquire(&self, class: ResourceClass) -> Result<OwnedSemaphorePermit, AcquireError> {
        let semaphore = self.semaphore(class);
        semaphore.acquire_owned().await
    }

    fn semaphore(&self, class: ResourceClass) -> Arc<Semaphore> {
        let slot = match class {
            ResourceClass::CpuIntensive => 0,
            ResourceClass::IoIntensive => 1,
            ResourceClass::MemoryIntensive => 2,
        };
        Arc::clone(&self.semaphores[slot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_millis(20);

    #[test]
    fn test_limits_are_per_class() {
        tokio_test::block_on(async {
            let pool = ResourcePool::new(
                ResourceLimits::uniform(2).with_limit(ResourceClass::MemoryIntensive, 1),
            );
            let first = pool
                .acquire(ResourceClass::MemoryIntensive)
                .await
                .expect("permit");
            assert!(timeout(WAIT, pool.acquire(ResourceClass::MemoryIntensive))
                .await
                .is_err());

            let _io = (
                pool.acquire(ResourceClass::IoIntensive).await.expect("io"),
                pool.acquire(ResourceClass::IoIntensive).await.expect("io"),
            );
            assert!(timeout(WAIT, pool.acquire(ResourceClass::IoIntensive))
                .await
                .is_err());

            drop(first);
            assert!(timeout(WAIT, pool.acquire(ResourceClass::MemoryIntensive))
                .await
                .is_ok());
        });
    }

    #[test]
    fn test_zero_limit_still_admits_one() {
        tokio_test::block_on(async {
            let pool = ResourcePool::new(ResourceLimits::uniform(0));
            let permit = timeout(WAIT, pool.acquire(ResourceClass::CpuIntensive)).await;
            assert!(matches!(permit, Ok(Ok(_))));
        });
    }
}
