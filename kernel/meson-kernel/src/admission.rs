//! Resource admission.
//!
//! Every syscall charges its worst-case heap cost against one kernel-wide
//! budget before its body runs, so a call that has started can always finish
//! its allocations. [`Quota`] counts the smaller object limits (pipes,
//! sockets) the same way but without waiting.

use core::sync::atomic::{AtomicUsize, Ordering};

use meson_core::sync::{Semaphore, SemaphorePermit};

use crate::errno::{Errno, KResult};

/// The kernel heap budget.
pub struct Admission {
    budget: Semaphore,
    capacity: usize,
}

/// Bytes of budget held by one admitted operation. Returned on drop.
pub struct Reservation<'a> {
    _permit: SemaphorePermit<'a>,
}

impl Admission {
    /// Creates a budget of `capacity` bytes.
    pub const fn new(capacity: usize) -> Self {
        Self {
            budget: Semaphore::new(capacity),
            capacity,
        }
    }

    /// Total budget in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Budget not currently reserved.
    pub fn available(&self) -> usize {
        self.budget.available_permits()
    }

    /// Reserves `cost` bytes without waiting.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOHEAP`] if the budget cannot cover `cost` right now.
    pub fn try_reserve(&self, cost: usize) -> KResult<Reservation<'_>> {
        self.budget
            .try_acquire_many(cost.min(self.capacity))
            .map(|permit| Reservation { _permit: permit })
            .ok_or(Errno::ENOHEAP)
    }

    /// Waits until `cost` bytes are free and reserves them.
    ///
    /// A cost larger than the whole budget is clamped to it, so the wait
    /// always ends once every other reservation is gone.
    pub async fn reserve(&self, cost: usize) -> Reservation<'_> {
        let permit = self.budget.acquire_many(cost.min(self.capacity)).await;
        Reservation { _permit: permit }
    }
}

/// A counted limit on live kernel objects.
pub struct Quota {
    used: AtomicUsize,
    max: usize,
}

impl Quota {
    /// Creates a quota allowing `max` live objects.
    pub const fn new(max: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            max,
        }
    }

    /// Takes one slot.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOMEM`] when every slot is in use.
    pub fn take(&self) -> KResult<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| Errno::ENOMEM)
    }

    /// Returns one slot.
    pub fn give(&self) {
        let prev = self.used.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            meson_core::kfatal!("quota released more often than taken");
            panic!("quota underflow");
        }
    }

    /// Slots in use.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_reserve_fails_fast() {
        let adm = Admission::new(100);
        let held = adm.try_reserve(80).unwrap();
        assert_eq!(adm.try_reserve(30).err(), Some(Errno::ENOHEAP));
        drop(held);
        assert_eq!(adm.available(), 100);
        assert!(adm.try_reserve(30).is_ok());
    }

    #[test]
    fn oversized_cost_is_clamped() {
        let adm = Admission::new(10);
        let r = adm.try_reserve(1_000).unwrap();
        assert_eq!(adm.available(), 0);
        drop(r);
        assert_eq!(adm.available(), 10);
    }

    #[test]
    fn quota_counts() {
        let q = Quota::new(2);
        q.take().unwrap();
        q.take().unwrap();
        assert_eq!(q.take(), Err(Errno::ENOMEM));
        q.give();
        assert_eq!(q.used(), 1);
        q.take().unwrap();
    }

    // The budget and the quota sit on `core` atomics, which shuttle does not
    // instrument: these two are smoke tests that only interleave at the
    // explicit yields.

    #[test]
    fn reservation_smoke_across_threads() {
        use std::sync::Arc;

        shuttle::check_random(
            || {
                let adm = Arc::new(Admission::new(10));
                let handles: Vec<_> = (0..3)
                    .map(|_| {
                        let adm = Arc::clone(&adm);
                        shuttle::thread::spawn(move || {
                            for _ in 0..3 {
                                if let Ok(held) = adm.try_reserve(4) {
                                    assert!(adm.available() <= 6);
                                    shuttle::thread::yield_now();
                                    drop(held);
                                }
                                shuttle::thread::yield_now();
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
                assert_eq!(adm.available(), 10);
            },
            50,
        );
    }

    #[test]
    fn quota_smoke_across_threads() {
        use std::sync::Arc;

        shuttle::check_random(
            || {
                let q = Arc::new(Quota::new(2));
                let handles: Vec<_> = (0..3)
                    .map(|_| {
                        let q = Arc::clone(&q);
                        shuttle::thread::spawn(move || {
                            if q.take().is_ok() {
                                shuttle::thread::yield_now();
                                assert!(q.used() <= 2);
                                q.give();
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
                assert_eq!(q.used(), 0);
            },
            50,
        );
    }
}
