//! Readiness notification.
//!
//! A `poll` call owns one [`PollNotifier`] and hands a [`PollMsg`] to every
//! descriptor it checks. A descriptor that is not ready yet records the
//! notifier in its [`Pollers`] list and fires it once the requested
//! condition appears; the poll call then re-checks everything.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use meson_core::sync::WaitQueue;

use crate::config::POLLERS_MAX;
use crate::errno::{Errno, KResult};

bitflags::bitflags! {
    /// Readiness classes a descriptor can report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ready: u8 {
        /// Data can be read without blocking.
        const READ = 1 << 0;
        /// Data can be written without blocking.
        const WRITE = 1 << 1;
        /// An error is pending.
        const ERROR = 1 << 2;
        /// The peer hung up.
        const HUP = 1 << 3;
    }
}

/// Wakeup flag shared between one poll call and the descriptors it waits on.
pub struct PollNotifier {
    fired: AtomicBool,
    wq: WaitQueue,
}

impl PollNotifier {
    /// Creates an unfired notifier.
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            wq: WaitQueue::new(),
        }
    }

    /// Marks the notifier fired and wakes the poll call.
    pub fn notify(&self) {
        self.fired.store(true, Ordering::Release);
        self.wq.wake_all();
    }

    /// Clears the fired flag before a new round of checks.
    pub fn reset(&self) {
        self.fired.store(false, Ordering::Release);
    }

    /// Returns `true` if a descriptor has fired since the last reset.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Waits until the notifier fires.
    pub async fn wait(&self) {
        self.wq.wait_until(|| self.is_fired().then_some(())).await;
    }
}

impl Default for PollNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// A readiness query handed to [`FdOps::poll`](crate::fd::FdOps::poll).
#[derive(Clone)]
pub struct PollMsg {
    /// Classes the caller is interested in.
    pub events: Ready,
    /// Register for a wakeup if nothing is ready.
    pub dowait: bool,
    /// Where the wakeup goes.
    pub notifier: Arc<PollNotifier>,
}

impl PollMsg {
    /// A query that never registers.
    pub fn check(events: Ready) -> Self {
        Self {
            events,
            dowait: false,
            notifier: Arc::new(PollNotifier::new()),
        }
    }
}

struct PollEntry {
    events: Ready,
    notifier: Arc<PollNotifier>,
}

/// The bounded list of poll calls waiting on one object.
pub struct Pollers {
    entries: Vec<PollEntry>,
}

impl Pollers {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers `pm`'s notifier for `pm.events`.
    ///
    /// Entries whose poll call has already returned are dropped first. A
    /// notifier that is already registered has its events widened.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOMEM`] if [`POLLERS_MAX`] live calls are already waiting.
    pub fn add(&mut self, pm: &PollMsg) -> KResult<()> {
        self.entries
            .retain(|e| Arc::strong_count(&e.notifier) > 1 && !e.notifier.is_fired());
        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.notifier, &pm.notifier))
        {
            e.events |= pm.events;
            return Ok(());
        }
        if self.entries.len() >= POLLERS_MAX {
            return Err(Errno::ENOMEM);
        }
        self.entries.push(PollEntry {
            events: pm.events,
            notifier: pm.notifier.clone(),
        });
        Ok(())
    }

    /// Fires and removes every waiter interested in any of `ready`.
    /// Returns how many were fired.
    pub fn wake_ready(&mut self, ready: Ready) -> usize {
        let mut fired = 0;
        self.entries.retain(|e| {
            if e.events.intersects(ready) {
                e.notifier.notify();
                fired += 1;
                false
            } else {
                true
            }
        });
        fired
    }

    /// Number of registered waiters, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nobody is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Pollers {
    fn default() -> Self {
        Self::new()
    }
}
