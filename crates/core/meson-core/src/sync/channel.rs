//! Bounded multi-producer, single-consumer channel.
//!
//! Senders wait for space, the receiver waits for items. When every
//! [`Sender`] is gone, [`Receiver::recv`] drains what is left and then
//! returns `None`. When the [`Receiver`] is gone, sends hand their value
//! back.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;

use super::{SpinLock, WaitQueue};

struct State<T> {
    queue: VecDeque<T>,
    senders: usize,
    receiver_alive: bool,
}

struct Chan<T> {
    state: SpinLock<State<T>>,
    cap: usize,
    items: WaitQueue,
    space: WaitQueue,
}

/// Creates a bounded channel holding at most `cap` messages.
///
/// # Panics
///
/// Panics if `cap` is zero.
pub fn channel<T>(cap: usize) -> (Sender<T>, Receiver<T>) {
    assert!(cap > 0, "channel capacity must be non-zero");
    let chan = Arc::new(Chan {
        state: SpinLock::named(
            "channel",
            State {
                queue: VecDeque::with_capacity(cap),
                senders: 1,
                receiver_alive: true,
            },
        ),
        cap,
        items: WaitQueue::new(),
        space: WaitQueue::new(),
    });
    (
        Sender {
            chan: Arc::clone(&chan),
        },
        Receiver { chan },
    )
}

/// Error returned by [`Sender::try_send`].
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The channel is at capacity.
    Full(T),
    /// The receiver has been dropped.
    Closed(T),
}

/// Error returned by [`Receiver::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// No message is queued.
    Empty,
    /// No message is queued and every sender has been dropped.
    Closed,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("channel empty"),
            Self::Closed => f.write_str("channel closed"),
        }
    }
}

/// Sending half of a bounded channel.
pub struct Sender<T> {
    chan: Arc<Chan<T>>,
}

impl<T> Sender<T> {
    /// Sends `value` without waiting.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut st = self.chan.state.lock();
        if !st.receiver_alive {
            return Err(TrySendError::Closed(value));
        }
        if st.queue.len() >= self.chan.cap {
            return Err(TrySendError::Full(value));
        }
        st.queue.push_back(value);
        drop(st);
        self.chan.items.wake_one();
        Ok(())
    }

    /// Sends `value`, waiting for space. Returns the value if the receiver
    /// is gone.
    pub async fn send(&self, value: T) -> Result<(), T> {
        let mut slot = Some(value);
        let chan = &*self.chan;
        chan.space
            .wait_until(|| {
                let mut st = chan.state.lock();
                if !st.receiver_alive {
                    return slot.take().map(Err);
                }
                if st.queue.len() >= chan.cap {
                    return None;
                }
                st.queue.push_back(slot.take()?);
                drop(st);
                chan.items.wake_one();
                Some(Ok(()))
            })
            .await
    }

    /// Returns `true` once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        !self.chan.state.lock().receiver_alive
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan.state.lock().senders += 1;
        Self {
            chan: Arc::clone(&self.chan),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let last = {
            let mut st = self.chan.state.lock();
            st.senders -= 1;
            st.senders == 0
        };
        if last {
            self.chan.items.wake_all();
        }
    }
}

/// Receiving half of a bounded channel.
pub struct Receiver<T> {
    chan: Arc<Chan<T>>,
}

impl<T> Receiver<T> {
    /// Takes a queued message without waiting.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        let mut st = self.chan.state.lock();
        match st.queue.pop_front() {
            Some(value) => {
                drop(st);
                self.chan.space.wake_one();
                Ok(value)
            }
            None if st.senders == 0 => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Waits for the next message. Returns `None` once the channel is empty
    /// and every sender has been dropped.
    pub async fn recv(&mut self) -> Option<T> {
        let chan = &*self.chan;
        chan.items
            .wait_until(|| {
                let mut st = chan.state.lock();
                match st.queue.pop_front() {
                    Some(value) => {
                        drop(st);
                        chan.space.wake_one();
                        Some(Some(value))
                    }
                    None if st.senders == 0 => Some(None),
                    None => None,
                }
            })
            .await
    }

    /// Returns the number of queued messages.
    pub fn len(&self) -> usize {
        self.chan.state.lock().queue.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.chan.state.lock().receiver_alive = false;
        self.chan.space.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_waker::{counting_waker, noop_waker};
    use core::future::Future;
    use core::pin::pin;
    use core::sync::atomic::Ordering;
    use core::task::{Context, Poll};

    #[test]
    fn try_send_until_full() {
        let (tx, mut rx) = channel(2);
        assert_eq!(tx.try_send(1), Ok(()));
        assert_eq!(tx.try_send(2), Ok(()));
        assert_eq!(tx.try_send(3), Err(TrySendError::Full(3)));
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn closed_after_last_sender() {
        let (tx, mut rx) = channel::<u8>(1);
        let tx2 = tx.clone();
        drop(tx);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        drop(tx2);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn send_returns_value_when_receiver_gone() {
        let (tx, rx) = channel(1);
        drop(rx);
        assert!(tx.is_closed());
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = pin!(tx.send(5));
        assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Err(5)));
    }

    #[test]
    fn blocked_send_wakes_after_recv() {
        let (tx, mut rx) = channel(1);
        tx.try_send(1).unwrap();
        let (waker, count) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = pin!(tx.send(2));
        assert!(fut.as_mut().poll(&mut cx).is_pending());

        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Ok(())));
        assert_eq!(rx.try_recv(), Ok(2));
    }

    #[test]
    fn recv_pends_until_send() {
        let (tx, mut rx) = channel(4);
        let (waker, count) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        {
            let mut fut = pin!(rx.recv());
            assert!(fut.as_mut().poll(&mut cx).is_pending());
            tx.try_send(9).unwrap();
            assert_eq!(count.load(Ordering::SeqCst), 1);
            assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Some(9)));
        }
        assert!(rx.is_empty());
    }
}
