//! Bounded worker pool for fanning out independent comparisons.
//!
//! A handler that must compare several items against one cached input (for
//! example every recognized text block against a wanted label) can hand the
//! comparisons to a [`MatchPool`]. Workers check a shared stop mark before
//! each unit; a match lowers it to the matching index, and units past the
//! mark are skipped. A unit that has already started always runs to
//! completion, so none leaves partial state behind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const MIN_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 32;

/// Worker count for a machine with `cores` logical cores.
///
/// Matches the core count on small machines and adds half again on
/// machines with eight or more cores, since units are short and often wait
/// on memory rather than compute.
pub fn pool_size_for(cores: usize) -> usize {
    let biased = if cores >= 8 { cores + cores / 2 } else { cores };
    biased.clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Worker count for the current machine.
pub fn detected_pool_size() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS);
    pool_size_for(cores)
}

/// A match reported by [`MatchPool::first_match`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMatch<R> {
    /// Position of the matching item in the input.
    pub index: usize,
    pub value: R,
}

pub struct MatchPool {
    size: usize,
    permits: Arc<Semaphore>,
}

impl MatchPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    /// Pool sized for the current machine.
    pub fn detected() -> Self {
        Self::new(detected_pool_size())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `compare` over `items` on at most `size` blocking workers and
    /// return the first acceptable match.
    ///
    /// The lowest matching index always wins: a match only skips units with
    /// a higher index, so a lower unit still waiting for a worker runs anyway.
    /// Cancelling `cancel` stops units that have not started yet.
    pub async fn first_match<T, R, F>(
        &self,
        items: Vec<T>,
        cancel: &CancellationToken,
        compare: F,
    ) -> Option<PoolMatch<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(&T) -> Option<R> + Send + Sync + 'static,
    {
        if items.is_empty() {
            return None;
        }

        let stop = Arc::new(AtomicUsize::new(usize::MAX));
        let compare = Arc::new(compare);
        let mut units = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let permits = self.permits.clone();
            let stop = stop.clone();
            let cancel = cancel.clone();
            let compare = compare.clone();
            units.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                if cancel.is_cancelled() || index > stop.load(Ordering::Acquire) {
                    return None;
                }
                let value = tokio::task::spawn_blocking(move || compare(&item))
                    .await
                    .ok()??;
                stop.fetch_min(index, Ordering::AcqRel);
                Some(PoolMatch { index, value })
            });
        }

        let mut best: Option<PoolMatch<R>> = None;
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(Some(found)) => {
                    if best.as_ref().map_or(true, |b| found.index < b.index) {
                        best = Some(found);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Match unit failed"),
            }
        }
        best
    }
}

impl Default for MatchPool {
    fn default() -> Self {
        Self::detected()
    }
}
