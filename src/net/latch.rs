//! Admission latch: a counting semaphore with a movable limit.
//!
//! # Responsibilities
//! - Gate how many connections may be admitted concurrently
//! - Allow the limit to shrink or grow at runtime
//! - Open unconditionally at shutdown (`release_all`) and close again on `reset`
//!
//! # Design Decisions
//! - Waiters queue in arrival order and are granted oldest first
//! - A release hands the freed slot to the next waiter inside the same
//!   critical section, so the holder count never dips below the limit while
//!   somebody is waiting
//! - Shrinking the limit never evicts holders; admissions stop until enough
//!   holders have left
//! - A cancelled waiter that had already been granted gives its slot back

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::oneshot;

/// Error returned when a wait for admission is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("admission wait interrupted")]
    Interrupted,
}

#[derive(Debug)]
struct LatchState {
    count: usize,
    limit: usize,
    released: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl LatchState {
    fn has_room(&self) -> bool {
        self.released || self.count < self.limit
    }

    /// Hand free slots to queued waiters, oldest first.
    fn grant_waiters(&mut self) {
        while self.has_room() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            // A closed receiver belongs to a waiter that gave up; skip it.
            if waiter.send(()).is_ok() {
                self.count += 1;
            }
        }
    }
}

/// Shared admission counter with a runtime-adjustable limit.
#[derive(Debug)]
pub struct AdmissionLatch {
    state: Mutex<LatchState>,
}

impl AdmissionLatch {
    /// Create a latch admitting at most `limit` concurrent holders.
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(LatchState {
                count: 0,
                limit,
                released: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LatchState> {
        self.state.lock().expect("admission latch mutex poisoned")
    }

    /// Wait until a slot is free, then take it.
    pub async fn acquire(&self) -> Result<(), AdmissionError> {
        let rx = {
            let mut state = self.lock();
            if state.released || (state.waiters.is_empty() && state.count < state.limit) {
                state.count += 1;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        PendingAdmission {
            latch: self,
            rx,
            settled: false,
        }
        .wait()
        .await
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        if state.released || (state.waiters.is_empty() && state.count < state.limit) {
            state.count += 1;
            true
        } else {
            false
        }
    }

    /// Wait for a slot and wrap it in a permit that releases on drop.
    pub async fn acquire_owned(self: &Arc<Self>) -> Result<AdmissionPermit, AdmissionError> {
        self.acquire().await?;
        Ok(AdmissionPermit {
            latch: Arc::clone(self),
        })
    }

    /// Non-waiting variant of [`AdmissionLatch::acquire_owned`].
    pub fn try_acquire_owned(self: &Arc<Self>) -> Option<AdmissionPermit> {
        self.try_acquire().then(|| AdmissionPermit {
            latch: Arc::clone(self),
        })
    }

    /// Give a slot back.
    ///
    /// Returns the holder count once the release has settled, i.e. after the
    /// freed slot was handed to the oldest waiter, if any.
    pub fn release(&self) -> usize {
        let mut state = self.lock();
        state.count = state.count.saturating_sub(1);
        state.grant_waiters();
        state.count
    }

    /// Change the limit seen by subsequent admissions.
    pub fn set_limit(&self, limit: usize) {
        let mut state = self.lock();
        let previous = state.limit;
        state.limit = limit;
        state.grant_waiters();
        tracing::debug!(previous, limit, holders = state.count, "Admission limit changed");
    }

    /// Open the latch: every pending and future acquire succeeds until `reset`.
    pub fn release_all(&self) {
        let mut state = self.lock();
        state.released = true;
        state.grant_waiters();
    }

    /// Restore normal admission and zero the holder count.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.released = false;
        state.count = 0;
        state.grant_waiters();
    }

    /// Current number of holders.
    pub fn count(&self) -> usize {
        self.lock().count
    }

    /// Current limit.
    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    /// Number of queued waiters (may include waiters that already gave up).
    pub fn queued(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Whether `release_all` is in effect.
    pub fn is_released(&self) -> bool {
        self.lock().released
    }
}

/// A queued acquire. Dropping it before it settles returns any slot that was
/// granted in the meantime.
struct PendingAdmission<'a> {
    latch: &'a AdmissionLatch,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl PendingAdmission<'_> {
    async fn wait(mut self) -> Result<(), AdmissionError> {
        let result = (&mut self.rx).await;
        self.settled = true;
        result.map_err(|_| AdmissionError::Interrupted)
    }
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.latch.release();
        }
    }
}

/// A held admission slot.
///
/// When dropped, the slot is released back to the latch. This keeps the
/// count honest even if a connection handler panics.
#[derive(Debug)]
pub struct AdmissionPermit {
    latch: Arc<AdmissionLatch>,
}

impl AdmissionPermit {
    /// The latch this permit belongs to.
    pub fn latch(&self) -> &Arc<AdmissionLatch> {
        &self.latch
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.latch.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn third_acquirer_waits_for_release() {
        let latch = Arc::new(AdmissionLatch::new(2));
        latch.acquire().await.unwrap();
        latch.acquire().await.unwrap();
        assert_eq!(latch.count(), 2);

        let third = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished());
        assert_eq!(latch.queued(), 1);

        // The slot goes straight to the waiter: the count never reads 1.
        assert_eq!(latch.release(), 2);
        tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(latch.count(), 2);
    }

    #[tokio::test]
    async fn holders_never_exceed_limit() {
        let latch = Arc::new(AdmissionLatch::new(3));
        let holders = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let (latch, holders, peak) = (latch.clone(), holders.clone(), peak.clone());
            tasks.push(tokio::spawn(async move {
                let permit = latch.acquire_owned().await.unwrap();
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(latch.count(), 0);
    }

    #[tokio::test]
    async fn release_all_never_blocks_until_reset() {
        let latch = AdmissionLatch::new(1);
        latch.acquire().await.unwrap();
        latch.release_all();

        for _ in 0..10 {
            tokio::time::timeout(Duration::from_millis(50), latch.acquire())
                .await
                .expect("acquire must not block while released")
                .unwrap();
        }
        assert!(latch.is_released());

        latch.reset();
        assert_eq!(latch.count(), 0);
        assert!(!latch.is_released());
        assert!(latch.try_acquire());
        assert!(!latch.try_acquire());
    }

    #[tokio::test]
    async fn release_all_wakes_pending_waiters() {
        let latch = Arc::new(AdmissionLatch::new(1));
        latch.acquire().await.unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let latch = latch.clone();
                tokio::spawn(async move { latch.acquire().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        latch.release_all();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn shrinking_limit_converges() {
        let latch = AdmissionLatch::new(4);
        for _ in 0..4 {
            latch.acquire().await.unwrap();
        }

        latch.set_limit(2);
        assert!(!latch.try_acquire());
        assert_eq!(latch.release(), 3);
        assert!(!latch.try_acquire());
        assert_eq!(latch.release(), 2);
        assert!(!latch.try_acquire());
        assert_eq!(latch.release(), 1);
        assert!(latch.try_acquire());
        assert_eq!(latch.count(), 2);
    }

    #[tokio::test]
    async fn growing_limit_admits_waiters() {
        let latch = Arc::new(AdmissionLatch::new(1));
        latch.acquire().await.unwrap();

        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        latch.set_limit(2);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(latch.count(), 2);
    }

    #[tokio::test]
    async fn waiters_granted_in_arrival_order() {
        let latch = Arc::new(AdmissionLatch::new(1));
        latch.acquire().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..4 {
            let (latch, order) = (latch.clone(), order.clone());
            tasks.push(tokio::spawn(async move {
                latch.acquire().await.unwrap();
                order.lock().unwrap().push(i);
                latch.release();
            }));
            // Make arrival order deterministic.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        latch.release();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak() {
        let latch = Arc::new(AdmissionLatch::new(1));
        let permit = latch.acquire_owned().await.unwrap();

        let cancelled = tokio::time::timeout(Duration::from_millis(20), latch.acquire()).await;
        assert!(cancelled.is_err());

        drop(permit);
        assert_eq!(latch.count(), 0);
        assert!(latch.try_acquire());
    }

    #[test]
    fn permit_releases_on_drop() {
        let latch = Arc::new(AdmissionLatch::new(1));
        let permit = latch.try_acquire_owned().unwrap();
        assert!(latch.try_acquire_owned().is_none());
        drop(permit);
        assert_eq!(latch.count(), 0);
    }
}
