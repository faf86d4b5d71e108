//! Synchronization primitives.
//!
//! - [`SpinLock`]: short critical sections, never held across `.await`.
//! - [`WaitQueue`]: token-based async wait queue with `wait_until`.
//! - [`Semaphore`]: counting semaphore with multi-permit acquisition.
//! - [`channel`]: bounded mpsc channel.
//! - [`oneshot`]: single-value reply.

pub mod channel;
pub mod oneshot;
mod semaphore;
mod spinlock;
mod waitqueue;

#[cfg(test)]
pub mod test_waker;

pub use channel::{Receiver, Sender, TryRecvError, TrySendError, channel};
pub use oneshot::{Canceled, oneshot};
pub use semaphore::{Semaphore, SemaphoreAcquireFuture, SemaphorePermit};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use waitqueue::{WaitQueue, WaitUntil, Waiter};
