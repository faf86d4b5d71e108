//! Process kill signal.
//!
//! A process is doomed at most once. Dooming wakes everything parked on the
//! kill queue, and every blocking wait in the kernel races its own condition
//! against that queue through [`KillSignal::killable`], returning `EINTR`
//! when the kill wins.

use core::future::{Future, poll_fn};
use core::pin::pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Poll;

use meson_core::sync::WaitQueue;

use crate::errno::{Errno, KResult};

/// The doomed flag and kill wait queue of one process.
pub struct KillSignal {
    doomed: AtomicBool,
    wq: WaitQueue,
}

impl KillSignal {
    /// Creates a live signal.
    pub const fn new() -> Self {
        Self {
            doomed: AtomicBool::new(false),
            wq: WaitQueue::new(),
        }
    }

    /// Dooms the process and wakes every killable wait. Returns `false` if
    /// it was already doomed.
    pub fn doom(&self) -> bool {
        let first = !self.doomed.swap(true, Ordering::AcqRel);
        self.wq.wake_all();
        first
    }

    /// Returns `true` once the process has been doomed.
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }

    /// Fails with `EINTR` if the process has been doomed.
    ///
    /// # Errors
    ///
    /// [`Errno::EINTR`] when doomed.
    pub fn check(&self) -> KResult<()> {
        if self.is_doomed() {
            Err(Errno::EINTR)
        } else {
            Ok(())
        }
    }

    /// Runs `fut` until it completes or the process is doomed.
    ///
    /// # Errors
    ///
    /// [`Errno::EINTR`] if the kill arrives first. `fut` is dropped then,
    /// which releases any wait-queue registration it held.
    pub async fn killable<F: Future>(&self, fut: F) -> KResult<F::Output> {
        let mut fut = pin!(fut);
        let mut waiter = self.wq.waiter();
        poll_fn(|cx| {
            if self.is_doomed() {
                return Poll::Ready(Err(Errno::EINTR));
            }
            if let Poll::Ready(v) = fut.as_mut().poll(cx) {
                return Poll::Ready(Ok(v));
            }
            waiter.register(cx.waker());
            if self.is_doomed() {
                return Poll::Ready(Err(Errno::EINTR));
            }
            Poll::Pending
        })
        .await
    }

    /// Waits on `wq` until `check` yields a value, or the process is doomed.
    ///
    /// # Errors
    ///
    /// [`Errno::EINTR`] if the kill arrives first.
    pub async fn wait_until<T, F>(&self, wq: &WaitQueue, check: F) -> KResult<T>
    where
        F: FnMut() -> Option<T>,
    {
        self.killable(wq.wait_until(check)).await
    }

    /// Waits on the kill queue alone. Completes only once doomed.
    pub async fn doomed(&self) {
        self.wq
            .wait_until(|| self.is_doomed().then_some(()))
            .await;
    }
}

impl Default for KillSignal {
    fn default() -> Self {
        Self::new()
    }
}
