//! Concurrency limiting for file transfers
//!
//! This crate provides the transfer-slot limiter used by the backup orchestrator to bound the
//! number of file transfers that are in flight at the same time.
//!
//! # Overview
//!
//! A [`TransferSlots`] instance is created per backup run. Every file task acquires a slot before
//! it reads the source file and keeps it until the destination has been written (or the file was
//! found to be unchanged). The slot is returned when the [`SlotGuard`] is dropped, so it is
//! released on every exit path, including errors.
//!
//! A limit of `0` means "unlimited": acquiring a slot never waits, but the in-flight gauge is
//! still maintained so progress reporting can show how many transfers are running.
//!
//! # Usage
//!
//! ```rust,no_run
//! use throttle::TransferSlots;
//!
//! # async fn example() {
//! let slots = TransferSlots::new(8);
//! let _slot = slots.acquire().await;
//! // read source, write destination...
//! // slot is released here when `_slot` goes out of scope
//! # }
//! ```
//!
//! # Fairness
//!
//! Waiting tasks are woken in the order the underlying tokio semaphore hands out permits, which
//! is FIFO for single-permit acquires. Tasks are spawned concurrently however, so the order in
//! which files *start* waiting is itself not deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};

mod semaphore;

pub use semaphore::Semaphore;

/// Per-run limiter of concurrently running file transfers.
pub struct TransferSlots {
    sem: Semaphore,
    limit: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// A held transfer slot, released on drop.
pub struct SlotGuard<'a> {
    slots: &'a TransferSlots,
    _permit: Option<tokio::sync::SemaphorePermit<'a>>,
}

impl TransferSlots {
    /// Create a limiter allowing at most `limit` concurrent transfers, `0` means no limit.
    pub fn new(limit: usize) -> Self {
        let sem = Semaphore::new();
        sem.setup(limit);
        Self {
            sem,
            limit,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Configured limit, `None` when unlimited.
    pub fn limit(&self) -> Option<usize> {
        if self.sem.is_enabled() {
            Some(self.limit)
        } else {
            None
        }
    }

    /// Wait until a slot is available and take it.
    pub async fn acquire(&self) -> SlotGuard<'_> {
        let permit = self.sem.acquire().await;
        let current = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(current, Ordering::AcqRel);
        tracing::trace!("transfer slot acquired, in flight: {}", current);
        SlotGuard {
            slots: self,
            _permit: permit,
        }
    }

    /// Number of transfers currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously held slots observed so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

impl Default for TransferSlots {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let remaining = self.slots.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::trace!("transfer slot released, in flight: {}", remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn unlimited_never_waits() {
        let slots = TransferSlots::unlimited();
        assert_eq!(slots.limit(), None);
        let guards = acquire_many(&slots, 64).await;
        assert_eq!(slots.in_flight(), 64);
        drop(guards);
        assert_eq!(slots.in_flight(), 0);
        assert_eq!(slots.peak(), 64);
    }

    async fn acquire_many(slots: &TransferSlots, count: usize) -> Vec<SlotGuard<'_>> {
        let mut guards = Vec::with_capacity(count);
        for _ in 0..count {
            guards.push(slots.acquire().await);
        }
        guards
    }

    #[tokio::test]
    async fn limited_blocks_until_release() {
        let slots = TransferSlots::new(2);
        assert_eq!(slots.limit(), Some(2));
        let first = slots.acquire().await;
        let _second = slots.acquire().await;
        let third = tokio::time::timeout(std::time::Duration::from_millis(50), slots.acquire()).await;
        assert!(third.is_err(), "third slot must not be granted while two are held");
        drop(first);
        let third = tokio::time::timeout(std::time::Duration::from_millis(500), slots.acquire()).await;
        assert!(third.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn peak_never_exceeds_limit() {
        let slots = Arc::new(TransferSlots::new(3));
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let slots = slots.clone();
            join_set.spawn(async move {
                let _slot = slots.acquire().await;
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            });
        }
        while let Some(res) = join_set.join_next().await {
            res.unwrap();
        }
        assert!(slots.peak() <= 3);
        assert_eq!(slots.in_flight(), 0);
    }
}
