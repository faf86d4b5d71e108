//! Single-value reply channel.
//!
//! Used for request/reply protocols where a task sends a command and parks
//! until exactly one answer arrives. If the [`Sender`] is dropped without
//! sending, the [`Receiver`] resolves to [`Canceled`]. If the receiver is
//! dropped first, [`Sender::is_closed`] turns true so the replying side can
//! skip it.

use alloc::sync::Arc;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use super::SpinLock;

struct State<T> {
    value: Option<T>,
    sender_alive: bool,
    receiver_alive: bool,
    rx_waker: Option<Waker>,
}

/// Creates a connected sender/receiver pair.
pub fn oneshot<T>() -> (Sender<T>, Receiver<T>) {
    let state = Arc::new(SpinLock::named(
        "oneshot",
        State {
            value: None,
            sender_alive: true,
            receiver_alive: true,
            rx_waker: None,
        },
    ));
    (
        Sender {
            state: Some(Arc::clone(&state)),
        },
        Receiver { state },
    )
}

/// The sender was dropped without sending a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("oneshot canceled")
    }
}

/// Sending half. Consumed by [`Sender::send`].
pub struct Sender<T> {
    state: Option<Arc<SpinLock<State<T>>>>,
}

impl<T> Sender<T> {
    /// Delivers `value`. Returns it back if the receiver is gone.
    pub fn send(mut self, value: T) -> Result<(), T> {
        let Some(state) = self.state.take() else {
            return Err(value);
        };
        let waker = {
            let mut st = state.lock();
            st.sender_alive = false;
            if !st.receiver_alive {
                return Err(value);
            }
            st.value = Some(value);
            st.rx_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Returns `true` once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.state
            .as_ref()
            .is_none_or(|state| !state.lock().receiver_alive)
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            let waker = {
                let mut st = state.lock();
                st.sender_alive = false;
                st.rx_waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

/// Receiving half. Awaiting it yields the sent value.
pub struct Receiver<T> {
    state: Arc<SpinLock<State<T>>>,
}

impl<T> Receiver<T> {
    /// Polls for the value without consuming the receiver.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Result<T, Canceled>> {
        let mut st = self.state.lock();
        if let Some(value) = st.value.take() {
            return Poll::Ready(Ok(value));
        }
        if !st.sender_alive {
            return Poll::Ready(Err(Canceled));
        }
        let stale = st
            .rx_waker
            .as_ref()
            .is_none_or(|w| !w.will_wake(cx.waker()));
        if stale {
            st.rx_waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }

    /// Takes the value if it has already arrived.
    pub fn try_recv(&mut self) -> Option<T> {
        self.state.lock().value.take()
    }
}

impl<T> Future for Receiver<T> {
    type Output = Result<T, Canceled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_recv(cx)
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        st.receiver_alive = false;
        st.rx_waker = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_waker::{counting_waker, noop_waker};
    use core::sync::atomic::Ordering;

    #[test]
    fn send_then_receive() {
        let (tx, mut rx) = oneshot();
        assert_eq!(tx.send(3), Ok(()));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(rx.poll_recv(&mut cx), Poll::Ready(Ok(3)));
    }

    #[test]
    fn receive_wakes_on_send() {
        let (tx, mut rx) = oneshot();
        let (waker, count) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(rx.poll_recv(&mut cx).is_pending());
        tx.send("hi").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(Pin::new(&mut rx).poll(&mut cx), Poll::Ready(Ok("hi")));
    }

    #[test]
    fn dropped_sender_cancels() {
        let (tx, mut rx) = oneshot::<u8>();
        drop(tx);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(rx.poll_recv(&mut cx), Poll::Ready(Err(Canceled)));
    }

    #[test]
    fn closed_receiver_rejects_send() {
        let (tx, rx) = oneshot();
        assert!(!tx.is_closed());
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.send(1), Err(1));
    }
}
