//! Exit records and the waits that collect them.
//!
//! Every process owns one [`WaitObject`]. It remembers which children and
//! which of its own threads may still be waited for, and queues an
//! [`ExitRecord`] for each one that has terminated until a `wait4` takes it.

use alloc::collections::{BTreeSet, VecDeque};
use alloc::vec::Vec;

use meson_core::sync::{SpinLock, WaitQueue};

use super::CpuTime;
use crate::errno::{Errno, KResult};
use crate::sched::KillSignal;

/// What a terminated process or thread leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    /// Pid or tid.
    pub id: u32,
    /// Wait status word.
    pub status: usize,
    /// CPU time it consumed.
    pub usage: CpuTime,
}

/// Which records a wait collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Child processes.
    Process,
    /// Threads of the waiting process.
    Thread,
}

#[derive(Default)]
struct Pending {
    /// Ids that have not been collected yet, live or dead.
    known: BTreeSet<u32>,
    /// Records of the dead ones, oldest first.
    exited: VecDeque<ExitRecord>,
}

impl Pending {
    /// Takes the oldest record matching `id` (any if `None`).
    fn take(&mut self, id: Option<u32>) -> Option<ExitRecord> {
        let idx = self
            .exited
            .iter()
            .position(|r| id.is_none_or(|id| r.id == id))?;
        let rec = self.exited.remove(idx)?;
        self.known.remove(&rec.id);
        Some(rec)
    }

    fn waitable(&self, id: Option<u32>) -> bool {
        match id {
            None => !self.known.is_empty(),
            Some(id) => self.known.contains(&id),
        }
    }
}

struct WaitState {
    children: Pending,
    threads: Pending,
}

impl WaitState {
    fn pending(&mut self, kind: WaitKind) -> &mut Pending {
        match kind {
            WaitKind::Process => &mut self.children,
            WaitKind::Thread => &mut self.threads,
        }
    }
}

/// Child and thread exit bookkeeping for one process.
pub struct WaitObject {
    state: SpinLock<WaitState>,
    wq: WaitQueue,
}

impl WaitObject {
    /// Creates an object with nothing to wait for.
    pub fn new() -> Self {
        Self {
            state: SpinLock::named(
                "wait_object",
                WaitState {
                    children: Pending::default(),
                    threads: Pending::default(),
                },
            ),
            wq: WaitQueue::new(),
        }
    }

    /// Makes `id` waitable.
    pub fn register(&self, kind: WaitKind, id: u32) {
        self.state.lock().pending(kind).known.insert(id);
    }

    /// Queues `rec` and wakes every waiter.
    pub fn publish(&self, kind: WaitKind, rec: ExitRecord) {
        self.state.lock().pending(kind).exited.push_back(rec);
        self.wq.wake_all();
    }

    /// Moves every child of `orphaned` (live or already exited) here and
    /// returns the pids that moved.
    pub fn adopt(&self, orphaned: &WaitObject) -> Vec<u32> {
        let moved = {
            let mut from = orphaned.state.lock();
            core::mem::take(&mut from.children)
        };
        let pids = moved.known.iter().copied().collect();
        let mut st = self.state.lock();
        st.children.known.extend(moved.known);
        st.children.exited.extend(moved.exited);
        drop(st);
        self.wq.wake_all();
        pids
    }

    /// Returns `true` if some child has not been collected.
    pub fn has_children(&self) -> bool {
        !self.state.lock().children.known.is_empty()
    }

    /// Collects the exit record of `id` (any if `None`), waiting for one
    /// unless `noblock`. `Ok(None)` means `noblock` and nothing has exited.
    ///
    /// # Errors
    ///
    /// [`Errno::ECHILD`] if there is nothing to wait for,
    /// [`Errno::EINTR`] if killed while waiting.
    pub async fn wait(
        &self,
        kill: &KillSignal,
        kind: WaitKind,
        id: Option<u32>,
        noblock: bool,
    ) -> KResult<Option<ExitRecord>> {
        kill.wait_until(&self.wq, || {
            let mut st = self.state.lock();
            let pending = st.pending(kind);
            if let Some(rec) = pending.take(id) {
                return Some(Ok(Some(rec)));
            }
            if !pending.waitable(id) {
                return Some(Err(Errno::ECHILD));
            }
            if noblock {
                return Some(Ok(None));
            }
            None
        })
        .await?
    }
}

impl Default for WaitObject {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Executor;
    use alloc::sync::Arc;

    fn rec(id: u32, status: usize) -> ExitRecord {
        ExitRecord {
            id,
            status,
            usage: CpuTime::default(),
        }
    }

    #[test]
    fn wait_blocks_until_a_child_exits() {
        let exec = Executor::new();
        let w = Arc::new(WaitObject::new());
        let kill = Arc::new(KillSignal::new());
        w.register(WaitKind::Process, 7);
        let mut h = {
            let (w, kill) = (w.clone(), kill.clone());
            exec.spawn_with_handle(async move {
                w.wait(&kill, WaitKind::Process, None, false).await
            })
        };
        exec.run_until_stalled();
        assert!(!h.is_finished());

        w.publish(WaitKind::Process, rec(7, 0x100));
        exec.run_until_stalled();
        assert_eq!(h.try_take(), Some(Ok(Some(rec(7, 0x100)))));
        assert!(!w.has_children());
    }

    #[test]
    fn nothing_to_wait_for() {
        let exec = Executor::new();
        let w = Arc::new(WaitObject::new());
        let kill = Arc::new(KillSignal::new());
        w.register(WaitKind::Thread, 3);
        let mut h = {
            let (w, kill) = (w.clone(), kill.clone());
            exec.spawn_with_handle(async move {
                let any = w.wait(&kill, WaitKind::Process, None, false).await;
                let other = w.wait(&kill, WaitKind::Thread, Some(4), false).await;
                let nohang = w.wait(&kill, WaitKind::Thread, Some(3), true).await;
                (any, other, nohang)
            })
        };
        exec.run_until_stalled();
        assert_eq!(
            h.try_take(),
            Some((Err(Errno::ECHILD), Err(Errno::ECHILD), Ok(None)))
        );
    }

    #[test]
    fn specific_wait_skips_other_records() {
        let exec = Executor::new();
        let w = Arc::new(WaitObject::new());
        let kill = Arc::new(KillSignal::new());
        for pid in [5, 6] {
            w.register(WaitKind::Process, pid);
        }
        w.publish(WaitKind::Process, rec(5, 1));
        w.publish(WaitKind::Process, rec(6, 2));
        let mut h = {
            let (w, kill) = (w.clone(), kill.clone());
            exec.spawn_with_handle(async move {
                w.wait(&kill, WaitKind::Process, Some(6), false).await
            })
        };
        exec.run_until_stalled();
        assert_eq!(h.try_take(), Some(Ok(Some(rec(6, 2)))));
        assert!(w.has_children());
    }

    #[test]
    fn adoption_moves_children_and_records() {
        let init = WaitObject::new();
        let dying = WaitObject::new();
        dying.register(WaitKind::Process, 10);
        dying.register(WaitKind::Process, 11);
        dying.publish(WaitKind::Process, rec(11, 0));
        assert_eq!(init.adopt(&dying), alloc::vec![10, 11]);
        assert!(!dying.has_children());
        assert!(init.has_children());
        assert_eq!(
            init.state.lock().children.take(None),
            Some(rec(11, 0))
        );
    }
}
