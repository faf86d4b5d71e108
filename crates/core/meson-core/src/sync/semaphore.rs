//! Counting semaphore.
//!
//! [`Semaphore`] limits concurrent access to a resource. Tasks acquire
//! permits before proceeding and release them when done. A single acquire
//! may take several permits at once, which is how the syscall admission
//! budget charges a per-call cost.

use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::task::{Context, Poll};

use super::waitqueue::{WaitQueue, Waiter};

/// A counting semaphore.
///
/// # Example
///
/// ```ignore
/// static SEM: Semaphore = Semaphore::new(3); // 3 concurrent permits
///
/// async fn access_resource() {
///     let _permit = SEM.acquire().await;
///     // ... use the resource ...
///     // permit is released on drop
/// }
/// ```
pub struct Semaphore {
    permits: AtomicUsize,
    waiters: WaitQueue,
}

impl Semaphore {
    /// Creates a new semaphore with the given number of permits.
    pub const fn new(permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits),
            waiters: WaitQueue::new(),
        }
    }

    /// Asynchronously acquires one permit.
    pub fn acquire(&self) -> SemaphoreAcquireFuture<'_> {
        self.acquire_many(1)
    }

    /// Asynchronously acquires `n` permits at once.
    ///
    /// The task yields until `n` permits are available together.
    pub fn acquire_many(&self, n: usize) -> SemaphoreAcquireFuture<'_> {
        SemaphoreAcquireFuture {
            sem: self,
            n,
            waiter: self.waiters.waiter(),
        }
    }

    /// Tries to acquire one permit without blocking.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        self.try_acquire_many(1)
    }

    /// Tries to acquire `n` permits without blocking.
    ///
    /// Returns `None` and takes nothing if fewer than `n` are available.
    pub fn try_acquire_many(&self, n: usize) -> Option<SemaphorePermit<'_>> {
        let mut current = self.permits.load(Ordering::Relaxed);
        loop {
            if current < n {
                return None;
            }
            match self.permits.compare_exchange_weak(
                current,
                current - n,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(SemaphorePermit { sem: self, n }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the number of currently available permits.
    pub fn available_permits(&self) -> usize {
        self.permits.load(Ordering::Relaxed)
    }

    /// Adds `n` permits and wakes waiters.
    pub fn add_permits(&self, n: usize) {
        self.permits.fetch_add(n, Ordering::Release);
        // Waiters may want different amounts, so all of them re-check.
        self.waiters.wake_all();
    }
}

/// Future returned by [`Semaphore::acquire`] and [`Semaphore::acquire_many`].
pub struct SemaphoreAcquireFuture<'a> {
    sem: &'a Semaphore,
    n: usize,
    waiter: Waiter<'a>,
}

impl<'a> Future for SemaphoreAcquireFuture<'a> {
    type Output = SemaphorePermit<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // Fast path: try to acquire directly.
        if let Some(permit) = this.sem.try_acquire_many(this.n) {
            this.waiter.cancel();
            return Poll::Ready(permit);
        }

        // Register waker before retry.
        this.waiter.register(cx.waker());

        if let Some(permit) = this.sem.try_acquire_many(this.n) {
            this.waiter.cancel();
            return Poll::Ready(permit);
        }

        Poll::Pending
    }
}

/// RAII permit that releases back to the [`Semaphore`] on drop.
#[must_use = "dropping a permit releases it immediately"]
pub struct SemaphorePermit<'a> {
    sem: &'a Semaphore,
    n: usize,
}

impl SemaphorePermit<'_> {
    /// Returns how many permits this guard holds.
    pub fn count(&self) -> usize {
        self.n
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.sem.add_permits(self.n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_waker::{counting_waker, noop_waker};

    #[test]
    fn try_acquire_succeeds() {
        let sem = Semaphore::new(2);
        let p1 = sem.try_acquire();
        assert!(p1.is_some());
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn try_acquire_exhausts_permits() {
        let sem = Semaphore::new(2);
        let _p1 = sem.try_acquire().unwrap();
        let _p2 = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn permit_drop_releases() {
        let sem = Semaphore::new(1);
        {
            let _p = sem.try_acquire().unwrap();
            assert_eq!(sem.available_permits(), 0);
        }
        // Permit dropped, so it is available again.
        assert_eq!(sem.available_permits(), 1);
        assert!(sem.try_acquire().is_some());
    }

    #[test]
    fn try_acquire_many_is_all_or_nothing() {
        let sem = Semaphore::new(10);
        let p = sem.try_acquire_many(7).unwrap();
        assert_eq!(p.count(), 7);
        assert!(sem.try_acquire_many(4).is_none());
        assert_eq!(sem.available_permits(), 3);
        drop(p);
        assert_eq!(sem.available_permits(), 10);
    }

    #[test]
    fn zero_permits() {
        let sem = Semaphore::new(0);
        assert!(sem.try_acquire().is_none());
    }

    #[test]
    fn acquire_future_ready_when_available() {
        let sem = Semaphore::new(1);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = sem.acquire();
        let result = Pin::new(&mut fut).poll(&mut cx);
        assert!(matches!(result, Poll::Ready(_)));
    }

    #[test]
    fn acquire_many_wakes_on_release() {
        let sem = Semaphore::new(4);
        let held = sem.try_acquire_many(3).unwrap();
        let (waker, count) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = sem.acquire_many(2);
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());

        drop(held);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        match Pin::new(&mut fut).poll(&mut cx) {
            Poll::Ready(p) => assert_eq!(p.count(), 2),
            Poll::Pending => panic!("permits were released"),
        }
    }
}
