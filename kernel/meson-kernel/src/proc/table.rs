//! The process table.
//!
//! Owned by the [`Kernel`](crate::Kernel). Besides lookup it serializes the
//! last step of process teardown: removing the dead process, handing its
//! children to init and publishing its exit record all happen under the
//! table lock, so a child exiting at the same moment always finds a live
//! parent (the old one or init) to report to.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use meson_core::id::{IdAllocator, Pid, Tid};
use meson_core::sync::SpinLock;
use meson_core::{kdebug, kwarn};

use super::wait::{ExitRecord, WaitKind};
use super::{Process, ProcessInit, Thread, ThreadState, TrapFrame};
use crate::admission::Quota;
use crate::errno::{Errno, KResult};

/// Parent id reported by init.
const NO_PARENT: Pid = Pid::new(0);

/// All live processes, keyed by pid.
pub struct ProcTable {
    procs: SpinLock<BTreeMap<Pid, Arc<Process>>>,
    ids: IdAllocator,
    limit: Quota,
}

impl ProcTable {
    /// Creates an empty table admitting at most `max` processes.
    pub fn new(max: usize) -> Self {
        Self {
            procs: SpinLock::named("proc_table", BTreeMap::new()),
            ids: IdAllocator::starting_at(Pid::INIT.as_u32()),
            limit: Quota::new(max),
        }
    }

    /// Allocates a thread id for a new thread of an existing process.
    pub fn next_tid(&self) -> Tid {
        Tid::new(self.ids.next())
    }

    /// Registers a new process whose first thread starts from `frame`.
    /// The child becomes waitable by `parent`; a process without parent is
    /// init.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOMEM`] if the process limit is reached. The descriptors
    /// and cwd handle in `init` are closed on failure.
    pub fn create(
        &self,
        parent: Option<&Arc<Process>>,
        init: ProcessInit,
        frame: TrapFrame,
    ) -> KResult<Arc<Thread>> {
        if let Err(e) = self.limit.take() {
            init.release();
            return Err(e);
        }
        let pid = Pid::new(self.ids.next());
        let parent_pid = parent.map_or(NO_PARENT, |p| p.pid());
        let proc = Process::new(pid, parent_pid, init);
        let thread = proc.add_thread(Tid::from(pid), frame);
        if let Some(p) = parent {
            p.wait_object().register(WaitKind::Process, pid.as_u32());
        }
        self.procs.lock().insert(pid, proc);
        kdebug!("proc {}: created, parent {}", pid, parent_pid);
        Ok(thread)
    }

    /// Looks up a live process.
    pub fn get(&self, pid: Pid) -> Option<Arc<Process>> {
        self.procs.lock().get(&pid).cloned()
    }

    /// Number of live processes.
    pub fn len(&self) -> usize {
        self.procs.lock().len()
    }

    /// Returns `true` if no process is alive.
    pub fn is_empty(&self) -> bool {
        self.procs.lock().is_empty()
    }

    /// Pids of every live process.
    pub fn pids(&self) -> Vec<Pid> {
        self.procs.lock().keys().copied().collect()
    }

    /// Dooms every thread of `pid`.
    ///
    /// # Errors
    ///
    /// [`Errno::ESRCH`] if there is no such process.
    pub fn kill(&self, pid: Pid) -> KResult<()> {
        let proc = self.get(pid).ok_or(Errno::ESRCH)?;
        if proc.doom() {
            kdebug!("proc {}: killed", pid);
        }
        Ok(())
    }

    /// Terminates `thread` with `status`.
    ///
    /// The thread's time moves to its process. If other threads remain, a
    /// thread exit record is queued for them. The last thread tears the
    /// process down: descriptors, cwd and mappings are released, children
    /// go to init, and `(pid, status, usage)` is published to the parent.
    /// A status recorded by `exit` takes precedence over `status`.
    pub fn terminate(&self, thread: &Arc<Thread>, status: usize) {
        if thread.state() != ThreadState::Runnable {
            return;
        }
        thread.set_state(ThreadState::Exiting);
        let proc = thread.process().clone();
        let remaining = proc.reap_thread(thread);
        thread.set_state(ThreadState::Reaped);
        if remaining > 0 {
            proc.wait_object().publish(
                WaitKind::Thread,
                ExitRecord {
                    id: thread.tid().as_u32(),
                    status,
                    usage: thread.cpu_time(),
                },
            );
            return;
        }

        let status = proc.exit_status().unwrap_or(status);
        proc.release_resources();
        let pid = proc.pid();
        let rec = ExitRecord {
            id: pid.as_u32(),
            status,
            usage: proc.self_usage(),
        };

        let mut procs = self.procs.lock();
        if procs.remove(&pid).is_some() {
            self.limit.give();
        }
        match procs.get(&Pid::INIT) {
            Some(init) => {
                for kid in init.wait_object().adopt(proc.wait_object()) {
                    if let Some(k) = procs.get(&Pid::new(kid)) {
                        k.set_parent(Pid::INIT);
                    }
                }
            }
            None if proc.wait_object().has_children() => {
                kwarn!("proc {}: exiting with children and no init", pid);
            }
            None => {}
        }
        match procs.get(&proc.parent()) {
            Some(parent) => parent.wait_object().publish(WaitKind::Process, rec),
            None => kdebug!("proc {}: no parent to report to", pid),
        }
        drop(procs);
        kdebug!("proc {}: exited, status {:#x}", pid, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Rig;
    use meson_syscall::{SIGKILL, exit_status, signaled_status};

    #[test]
    fn pids_are_first_tids() {
        let rig = Rig::new();
        let init = rig.spawn_init();
        assert_eq!(init.tid(), Tid::from(Pid::INIT));
        assert_eq!(init.process().parent(), NO_PARENT);
        let child = rig.spawn_child(init.process());
        assert_eq!(child.tid().as_u32(), child.process().pid().as_u32());
        assert_eq!(child.process().parent(), Pid::INIT);
        assert_eq!(rig.kernel.procs().len(), 2);
    }

    #[test]
    fn process_limit_is_enforced() {
        let rig = Rig::with_config(|c| c.max_procs = 1);
        let init = rig.spawn_init();
        let err = rig.kernel.procs().create(
            Some(init.process()),
            rig.process_init("second"),
            TrapFrame::new(),
        );
        assert_eq!(err.err(), Some(Errno::ENOMEM));
    }

    #[test]
    fn last_thread_publishes_to_parent() {
        let rig = Rig::new();
        let init = rig.spawn_init();
        let child = rig.spawn_child(init.process());
        let pid = child.process().pid();
        child.charge(10, 20);
        rig.kernel.procs().terminate(&child, exit_status(3));
        assert!(rig.kernel.procs().get(pid).is_none());
        let rec = rig.block_on(init.process().wait_object().wait(
            init.process().kill_signal(),
            WaitKind::Process,
            Some(pid.as_u32()),
            true,
        ));
        let rec = rec.unwrap().unwrap();
        assert_eq!(rec.status, exit_status(3));
        assert_eq!(rec.usage.sys_ns, 20);
    }

    #[test]
    fn exit_status_wins_over_kill_status() {
        let rig = Rig::new();
        let init = rig.spawn_init();
        let child = rig.spawn_child(init.process());
        child.process().set_exit_status(exit_status(7));
        child.process().doom();
        rig.kernel
            .procs()
            .terminate(&child, signaled_status(SIGKILL));
        let rec = init.process().wait_object();
        let got = rig
            .block_on(rec.wait(init.process().kill_signal(), WaitKind::Process, None, true))
            .unwrap()
            .unwrap();
        assert_eq!(got.status, exit_status(7));
    }

    #[test]
    fn orphans_go_to_init() {
        let rig = Rig::new();
        let init = rig.spawn_init();
        let mid = rig.spawn_child(init.process());
        let leaf = rig.spawn_child(mid.process());
        rig.kernel.procs().terminate(&mid, exit_status(0));
        assert_eq!(leaf.process().parent(), Pid::INIT);

        rig.kernel.procs().terminate(&leaf, exit_status(1));
        let w = init.process().wait_object();
        let kill = init.process().kill_signal();
        let first = rig
            .block_on(w.wait(kill, WaitKind::Process, None, true))
            .unwrap()
            .unwrap();
        let second = rig
            .block_on(w.wait(kill, WaitKind::Process, None, true))
            .unwrap()
            .unwrap();
        assert_eq!(first.id, mid.process().pid().as_u32());
        assert_eq!(second.id, leaf.process().pid().as_u32());
        assert!(!w.has_children());
    }

    #[test]
    fn non_last_thread_leaves_a_thread_record() {
        let rig = Rig::new();
        let init = rig.spawn_init();
        let tid = rig.kernel.procs().next_tid();
        let second = init.process().add_thread(tid, TrapFrame::new());
        rig.kernel.procs().terminate(&second, 0x42);
        assert_eq!(second.state(), ThreadState::Reaped);
        assert_eq!(init.process().thread_count(), 1);
        assert!(rig.kernel.procs().get(Pid::INIT).is_some());
        let rec = rig
            .block_on(init.process().wait_object().wait(
                init.process().kill_signal(),
                WaitKind::Thread,
                Some(tid.as_u32()),
                true,
            ))
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, 0x42);
    }

    #[test]
    fn kill_unknown_pid() {
        let rig = Rig::new();
        assert_eq!(rig.kernel.procs().kill(Pid::new(99)), Err(Errno::ESRCH));
    }
}
