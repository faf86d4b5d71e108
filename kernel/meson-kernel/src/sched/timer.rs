//! Clock and sleep queue.
//!
//! The platform tick advances [`Timer::now_ns`] and calls
//! [`Timer::wake_expired`]. Sleeping tasks register their waker and
//! deadline; expired entries are drained into a fixed batch and woken after
//! the queue lock is dropped.

use alloc::collections::BinaryHeap;
use core::cmp::{Ordering, Reverse};
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{self, AtomicU64};
use core::task::{Context, Poll, Waker};

use meson_core::sync::SpinLock;
use planck_noalloc::vec::ArrayVec;

/// Nanoseconds per second.
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Maximum wakers drained per call. Further expired entries wait for the
/// next tick.
const WAKE_BATCH_SIZE: usize = 32;

struct SleepEntry {
    deadline: u64,
    waker: Waker,
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for SleepEntry {}

impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SleepEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// The kernel clock plus its sleep queue.
pub struct Timer {
    now: AtomicU64,
    queue: SpinLock<BinaryHeap<Reverse<SleepEntry>>>,
}

impl Timer {
    /// Creates a clock reading `start_ns`.
    pub const fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
            queue: SpinLock::named("sleep_queue", BinaryHeap::new()),
        }
    }

    /// Current time in nanoseconds.
    pub fn now_ns(&self) -> u64 {
        self.now.load(atomic::Ordering::Acquire)
    }

    /// Registers `waker` to be woken once the clock reaches `deadline`.
    pub fn register_sleep_waker(&self, deadline: u64, waker: Waker) {
        self.queue.lock().push(Reverse(SleepEntry { deadline, waker }));
    }

    /// Wakes up to one batch of sleepers whose deadline is at or before
    /// `now`. Returns how many were woken.
    pub fn wake_expired(&self, now: u64) -> usize {
        let mut batch = ArrayVec::<Waker, WAKE_BATCH_SIZE>::new();
        {
            let mut queue = self.queue.lock();
            while batch.len() < WAKE_BATCH_SIZE {
                match queue.peek() {
                    Some(entry) if entry.0.deadline <= now => {
                        if let Some(Reverse(entry)) = queue.pop() {
                            batch.push(entry.waker);
                        }
                    }
                    _ => break,
                }
            }
        }
        let woken = batch.len();
        while let Some(waker) = batch.pop() {
            waker.wake();
        }
        woken
    }

    /// Moves the clock forward by `delta_ns` and wakes every sleeper that
    /// is now due, one batch at a time.
    pub fn advance(&self, delta_ns: u64) -> usize {
        let now = self.now.fetch_add(delta_ns, atomic::Ordering::AcqRel) + delta_ns;
        let mut total = 0;
        loop {
            let n = self.wake_expired(now);
            total += n;
            if n < WAKE_BATCH_SIZE {
                return total;
            }
        }
    }

    /// Returns a future that completes once the clock reaches `deadline`.
    pub fn sleep_until(&self, deadline: u64) -> Sleep<'_> {
        Sleep {
            timer: self,
            deadline,
        }
    }

    /// Number of registered sleep entries, stale ones included.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Future returned by [`Timer::sleep_until`].
pub struct Sleep<'a> {
    timer: &'a Timer,
    deadline: u64,
}

impl Future for Sleep<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.timer.now_ns() >= self.deadline {
            return Poll::Ready(());
        }
        self.timer
            .register_sleep_waker(self.deadline, cx.waker().clone());
        // The tick may have passed the deadline between the check and the
        // registration.
        if self.timer.now_ns() >= self.deadline {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}
