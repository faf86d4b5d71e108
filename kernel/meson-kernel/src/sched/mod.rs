//! Task scheduling seams.
//!
//! The syscall core never switches contexts itself. User threads and
//! kernel tasks (futex arbiters) are handed to a [`Scheduler`]; the
//! cooperative [`Executor`] is the hosted implementation. Blocking is done
//! by awaiting, and every await that may sleep goes through
//! [`KillSignal::killable`] so a doomed process never stays asleep.

pub mod executor;
pub mod kill;
pub mod timer;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::future::{Future, poll_fn};
use core::pin::{Pin, pin};
use core::task::Poll;

pub use executor::{Executor, JoinHandle, TaskId};
pub use kill::KillSignal;
pub use timer::{Sleep, Timer};

use crate::proc::Thread;

/// A kernel task: a boxed future with no result.
pub type KernelTask = Pin<Box<dyn Future<Output = ()>>>;

/// What the core needs from the thread scheduler.
pub trait Scheduler {
    /// Runs a kernel task (for example a futex arbiter) until it completes.
    fn spawn(&self, task: KernelTask);

    /// Makes a freshly forked user thread runnable.
    fn start_thread(&self, thread: Arc<Thread>);
}

/// Result of [`select`].
#[derive(Debug, PartialEq, Eq)]
pub enum Either<A, B> {
    /// The first future finished first.
    Left(A),
    /// The second future finished first.
    Right(B),
}

/// Polls both futures and returns whichever finishes first, dropping the
/// other. `a` is polled first on every wakeup.
pub async fn select<A, B>(a: A, b: B) -> Either<A::Output, B::Output>
where
    A: Future,
    B: Future,
{
    let mut a = pin!(a);
    let mut b = pin!(b);
    poll_fn(|cx| {
        if let Poll::Ready(v) = a.as_mut().poll(cx) {
            return Poll::Ready(Either::Left(v));
        }
        if let Poll::Ready(v) = b.as_mut().poll(cx) {
            return Poll::Ready(Either::Right(v));
        }
        Poll::Pending
    })
    .await
}
