use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

/// Per-class fan-out bounds. Filter probes are cheap DOM reads and run
/// wide; detail fetches are fragile authenticated navigations and run
/// narrow.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimits {
    pub pages: usize,
    pub probes: usize,
    pub details: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            pages: 5,
            probes: 20,
            details: 2,
        }
    }
}

pub const POOL_PAGES: &str = "pages";
pub const POOL_PROBES: &str = "probes";
pub const POOL_DETAILS: &str = "details";

/// Bounded concurrent fan-out keyed by task class. Futures sharing a pool
/// key never exceed that class's limit in flight; results come back in
/// submission order regardless of completion order.
pub struct Scheduler {
    pools: HashMap<&'static str, Arc<Semaphore>>,
}

impl Scheduler {
    pub fn new(limits: ConcurrencyLimits) -> Self {
        let mut pools = HashMap::new();
        pools.insert(POOL_PAGES, Arc::new(Semaphore::new(limits.pages.max(1))));
        pools.insert(POOL_PROBES, Arc::new(Semaphore::new(limits.probes.max(1))));
        pools.insert(
            POOL_DETAILS,
            Arc::new(Semaphore::new(limits.details.max(1))),
        );
        Self { pools }
    }

    pub async fn bounded<T, Fut>(&self, pool: &'static str, tasks: Vec<Fut>) -> Vec<T>
    where
        Fut: Future<Output = T>,
    {
        let semaphore = self.pool(pool);
        join_all(tasks.into_iter().map(|task| {
            let semaphore = semaphore.clone();
            async move {
                // Closing never happens while the scheduler is alive.
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                task.await
            }
        }))
        .await
    }

    /// Run one task under a pool's limit; concurrent callers sharing the
    /// pool key still respect the bound.
    pub async fn run<T, Fut>(&self, pool: &'static str, task: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let semaphore = self.pool(pool);
        let _permit = semaphore.acquire().await.expect("semaphore closed");
        task.await
    }

    fn pool(&self, pool: &'static str) -> Arc<Semaphore> {
        self.pools
            .get(pool)
            .cloned()
            .unwrap_or_else(|| Arc::new(Semaphore::new(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_pool_limit() {
        let limits = ConcurrencyLimits {
            pages: 5,
            probes: 20,
            details: 2,
        };
        let scheduler = Scheduler::new(limits);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    i
                }
            })
            .collect();

        let results = scheduler.bounded(POOL_PAGES, tasks).await;

        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(results.len(), 50);
    }

    #[tokio::test]
    async fn results_preserve_submission_order() {
        let scheduler = Scheduler::new(ConcurrencyLimits::default());

        // Later tasks finish sooner; order must still follow submission.
        let tasks: Vec<_> = (0u64..10)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis(20u64.saturating_sub(i * 2))).await;
                i
            })
            .collect();

        let results = scheduler.bounded(POOL_PROBES, tasks).await;
        assert_eq!(results, (0..10).collect::<Vec<_>>());
    }
}
