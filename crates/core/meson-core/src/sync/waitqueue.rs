//! Token-based async wait queue.
//!
//! Every registration owns a token. A [`Waiter`] that is dropped before it
//! completes removes its entry, so a queue never holds wakers for futures
//! that no longer exist and [`WaitQueue::wake_one`] always reaches a task
//! that is still waiting. A waiter that was woken but then abandoned (for
//! example because a kill won the race) passes its wakeup on to the next
//! entry.

use alloc::collections::VecDeque;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use super::SpinLock;

struct Waiters {
    next_token: u64,
    list: VecDeque<(u64, Waker)>,
}

/// A FIFO queue of task wakers.
pub struct WaitQueue {
    inner: SpinLock<Waiters>,
}

impl WaitQueue {
    /// Creates an empty wait queue.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::named(
                "wait_queue",
                Waiters {
                    next_token: 0,
                    list: VecDeque::new(),
                },
            ),
        }
    }

    /// Returns an unregistered waiter bound to this queue.
    pub fn waiter(&self) -> Waiter<'_> {
        Waiter {
            queue: self,
            token: None,
        }
    }

    /// Wakes the oldest waiter. Returns `false` if the queue was empty.
    pub fn wake_one(&self) -> bool {
        let entry = self.inner.lock().list.pop_front();
        match entry {
            Some((_, waker)) => {
                waker.wake();
                true
            }
            None => false,
        }
    }

    /// Wakes every waiter and returns how many were woken.
    pub fn wake_all(&self) -> usize {
        let drained: VecDeque<_> = core::mem::take(&mut self.inner.lock().list);
        let count = drained.len();
        for (_, waker) in drained {
            waker.wake();
        }
        count
    }

    /// Returns the number of registered waiters.
    pub fn len(&self) -> usize {
        self.inner.lock().list.len()
    }

    /// Returns `true` if no waiter is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a future that resolves once `check` yields `Some`.
    ///
    /// The waker is registered before each re-check, so a wakeup that races
    /// with the check is never lost.
    pub fn wait_until<T, F>(&self, check: F) -> WaitUntil<'_, F>
    where
        F: FnMut() -> Option<T>,
    {
        WaitUntil {
            waiter: self.waiter(),
            check,
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A single registration slot in a [`WaitQueue`].
pub struct Waiter<'a> {
    queue: &'a WaitQueue,
    token: Option<u64>,
}

impl Waiter<'_> {
    /// Registers (or refreshes) this waiter's waker.
    ///
    /// If the waiter was already woken and its entry consumed, a new entry
    /// is appended at the tail.
    pub fn register(&mut self, waker: &Waker) {
        let mut inner = self.queue.inner.lock();
        if let Some(token) = self.token {
            if let Some((_, slot)) = inner.list.iter_mut().find(|(t, _)| *t == token) {
                if !slot.will_wake(waker) {
                    slot.clone_from(waker);
                }
                return;
            }
        }
        let token = inner.next_token;
        inner.next_token += 1;
        inner.list.push_back((token, waker.clone()));
        self.token = Some(token);
    }

    /// Removes this waiter's entry, if any, without forwarding a wakeup.
    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            self.queue.inner.lock().list.retain(|(t, _)| *t != token);
        }
    }

    /// Removes this waiter's entry. Returns `true` if the entry was still
    /// queued, `false` if it had already been woken.
    fn unregister(&mut self) -> bool {
        let Some(token) = self.token.take() else {
            return true;
        };
        let mut inner = self.queue.inner.lock();
        match inner.list.iter().position(|(t, _)| *t == token) {
            Some(idx) => {
                inner.list.remove(idx);
                true
            }
            None => false,
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.unregister() {
            // Woken but never saw the condition: hand the wakeup on.
            self.queue.wake_one();
        }
    }
}

/// Future returned by [`WaitQueue::wait_until`].
pub struct WaitUntil<'a, F> {
    waiter: Waiter<'a>,
    check: F,
}

// `check` is only ever used through `&mut`, never pinned.
impl<F> Unpin for WaitUntil<'_, F> {}

impl<T, F> Future for WaitUntil<'_, F>
where
    F: FnMut() -> Option<T>,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if let Some(value) = (this.check)() {
            this.waiter.cancel();
            return Poll::Ready(value);
        }
        this.waiter.register(cx.waker());
        if let Some(value) = (this.check)() {
            this.waiter.cancel();
            return Poll::Ready(value);
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_waker::{counting_waker, noop_waker};
    use core::cell::Cell;
    use core::sync::atomic::Ordering;

    #[test]
    fn wake_one_on_empty_queue() {
        let wq = WaitQueue::new();
        assert!(!wq.wake_one());
        assert_eq!(wq.wake_all(), 0);
    }

    #[test]
    fn register_is_idempotent() {
        let wq = WaitQueue::new();
        let waker = noop_waker();
        let mut w = wq.waiter();
        w.register(&waker);
        w.register(&waker);
        assert_eq!(wq.len(), 1);
    }

    #[test]
    fn dropped_waiter_leaves_no_entry() {
        let wq = WaitQueue::new();
        let waker = noop_waker();
        {
            let mut w = wq.waiter();
            w.register(&waker);
            assert_eq!(wq.len(), 1);
        }
        assert!(wq.is_empty());
    }

    #[test]
    fn wake_one_is_fifo() {
        let wq = WaitQueue::new();
        let (first, first_count) = counting_waker();
        let (second, second_count) = counting_waker();
        let mut a = wq.waiter();
        let mut b = wq.waiter();
        a.register(&first);
        b.register(&second);

        assert!(wq.wake_one());
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 0);
        a.cancel();
        b.cancel();
    }

    #[test]
    fn abandoned_wakeup_is_forwarded() {
        let wq = WaitQueue::new();
        let (first, _) = counting_waker();
        let (second, second_count) = counting_waker();
        let mut a = wq.waiter();
        let mut b = wq.waiter();
        a.register(&first);
        b.register(&second);

        wq.wake_one();
        drop(a);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
        b.cancel();
    }

    #[test]
    fn wake_all_counts() {
        let wq = WaitQueue::new();
        let waker = noop_waker();
        let mut a = wq.waiter();
        let mut b = wq.waiter();
        a.register(&waker);
        b.register(&waker);
        assert_eq!(wq.wake_all(), 2);
        a.cancel();
        b.cancel();
    }

    #[test]
    fn wait_until_ready_immediately() {
        let wq = WaitQueue::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = wq.wait_until(|| Some(7));
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(7));
        assert!(wq.is_empty());
    }

    #[test]
    fn wait_until_pends_then_completes() {
        let wq = WaitQueue::new();
        let flag = Cell::new(false);
        let (waker, count) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = wq.wait_until(|| flag.get().then_some(()));

        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert_eq!(wq.len(), 1);

        flag.set(true);
        wq.wake_one();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(()));
        drop(fut);
        assert!(wq.is_empty());
    }
}
