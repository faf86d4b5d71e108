//! Processes and threads.
//!
//! A [`Process`] owns the shared state: address space, descriptor table,
//! cwd, limits, kill signal and wait bookkeeping. A [`Thread`] owns its
//! saved registers and CPU time. The pid of a process is the tid of its
//! first thread. Threads run as scheduler tasks; the process is torn down
//! by whichever thread terminates last (see [`ProcTable::terminate`]).

pub mod fork;
pub mod frame;
pub mod table;
pub mod wait;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use meson_core::id::{Pid, Tid};
use meson_core::sync::SpinLock;
use meson_mm::{AddressSpace, USERMIN, VmLimits};
use meson_syscall::{Rusage, Timeval};

use crate::admission::Admission;
use crate::config::Ulimit;
use crate::fd::{FdOps, FdTable, IoCtx};
use crate::fs::Cwd;
use crate::sched::KillSignal;
use crate::sched::timer::NSEC_PER_SEC;

pub use fork::{fork_process, fork_thread};
pub use frame::{Reg, TrapFrame};
pub use table::ProcTable;
pub use wait::{ExitRecord, WaitKind, WaitObject};

// ── CPU time ────────────────────────────────────────────────────────

/// User and kernel time, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTime {
    /// Time in user mode.
    pub user_ns: u64,
    /// Time in the kernel.
    pub sys_ns: u64,
}

impl CpuTime {
    /// Adds `other` into `self`.
    pub fn add(&mut self, other: CpuTime) {
        self.user_ns = self.user_ns.saturating_add(other.user_ns);
        self.sys_ns = self.sys_ns.saturating_add(other.sys_ns);
    }

    /// The ABI form.
    pub fn to_rusage(self) -> Rusage {
        Rusage {
            ru_utime: timeval(self.user_ns),
            ru_stime: timeval(self.sys_ns),
        }
    }
}

#[expect(
    clippy::cast_possible_wrap,
    reason = "u64 nanoseconds / 1e9 fits i64 seconds"
)]
fn timeval(ns: u64) -> Timeval {
    Timeval {
        tv_sec: (ns / NSEC_PER_SEC) as i64,
        tv_usec: ((ns % NSEC_PER_SEC) / 1000) as i64,
    }
}

// ── Thread ──────────────────────────────────────────────────────────

/// Where a thread is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Runs or may run.
    Runnable,
    /// Termination has started.
    Exiting,
    /// Accounted and removed from its process.
    Reaped,
}

/// A user thread.
pub struct Thread {
    tid: Tid,
    process: Arc<Process>,
    frame: SpinLock<TrapFrame>,
    time: SpinLock<CpuTime>,
    state: SpinLock<ThreadState>,
}

impl Thread {
    /// Thread id.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The owning process.
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// A copy of the saved registers.
    pub fn frame(&self) -> TrapFrame {
        *self.frame.lock()
    }

    /// Edits the saved registers.
    pub fn update_frame(&self, f: impl FnOnce(&mut TrapFrame)) {
        f(&mut self.frame.lock());
    }

    /// The TLS base the thread resumes with.
    pub fn fsbase(&self) -> usize {
        self.frame.lock()[Reg::FsBase]
    }

    /// Accounts time spent running.
    pub fn charge(&self, user_ns: u64, sys_ns: u64) {
        self.time.lock().add(CpuTime { user_ns, sys_ns });
    }

    /// Time accounted so far.
    pub fn cpu_time(&self) -> CpuTime {
        *self.time.lock()
    }

    /// Current life stage.
    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }
}

// ── Process ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Usage {
    /// Terminated threads of this process.
    dead: CpuTime,
    /// Collected children.
    children: CpuTime,
}

/// A process.
pub struct Process {
    pid: Pid,
    parent: AtomicU32,
    name: SpinLock<String>,
    aspace: SpinLock<Arc<AddressSpace>>,
    fds: Arc<FdTable>,
    cwd: SpinLock<Cwd>,
    ulimit: SpinLock<Ulimit>,
    kill: Arc<KillSignal>,
    threads: SpinLock<BTreeMap<Tid, Arc<Thread>>>,
    usage: SpinLock<Usage>,
    wait: WaitObject,
    mmap_cursor: AtomicUsize,
    exit_status: SpinLock<Option<usize>>,
}

/// The pieces a new process starts with.
pub struct ProcessInit {
    /// Display name.
    pub name: String,
    /// Address space.
    pub aspace: Arc<AddressSpace>,
    /// Descriptor table.
    pub fds: Arc<FdTable>,
    /// Working directory.
    pub cwd: Cwd,
    /// Limits.
    pub ulimit: Ulimit,
}

impl ProcessInit {
    /// Closes the descriptors and cwd handle of a process that never
    /// started.
    pub fn release(self) {
        crate::fd::close_all(self.fds.drain_all());
        if let Some(h) = self.cwd.handle {
            if let Err(e) = h.close() {
                meson_core::kwarn!("proc: releasing cwd failed: {}", e);
            }
        }
    }
}

impl Process {
    pub(crate) fn new(pid: Pid, parent: Pid, init: ProcessInit) -> Arc<Self> {
        Arc::new(Self {
            pid,
            parent: AtomicU32::new(parent.as_u32()),
            name: SpinLock::named("proc_name", init.name),
            aspace: SpinLock::named("proc_aspace", init.aspace),
            fds: init.fds,
            cwd: SpinLock::named("proc_cwd", init.cwd),
            ulimit: SpinLock::named("proc_ulimit", init.ulimit),
            kill: Arc::new(KillSignal::new()),
            threads: SpinLock::named("proc_threads", BTreeMap::new()),
            usage: SpinLock::named("proc_usage", Usage::default()),
            wait: WaitObject::new(),
            mmap_cursor: AtomicUsize::new(USERMIN),
            exit_status: SpinLock::named("proc_exit", None),
        })
    }

    /// Adds a thread running from `frame`.
    pub(crate) fn add_thread(self: &Arc<Self>, tid: Tid, frame: TrapFrame) -> Arc<Thread> {
        let thread = Arc::new(Thread {
            tid,
            process: self.clone(),
            frame: SpinLock::named("thread_frame", frame),
            time: SpinLock::named("thread_time", CpuTime::default()),
            state: SpinLock::named("thread_state", ThreadState::Runnable),
        });
        self.threads.lock().insert(tid, thread.clone());
        self.wait.register(WaitKind::Thread, tid.as_u32());
        thread
    }

    /// Process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Parent process id.
    pub fn parent(&self) -> Pid {
        Pid::new(self.parent.load(Ordering::Acquire))
    }

    pub(crate) fn set_parent(&self, parent: Pid) {
        self.parent.store(parent.as_u32(), Ordering::Release);
    }

    /// Display name (the path last exec'd).
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.lock() = name;
    }

    /// The current address space.
    pub fn aspace(&self) -> Arc<AddressSpace> {
        self.aspace.lock().clone()
    }

    /// Installs a new address space and returns the old one.
    pub(crate) fn replace_aspace(&self, aspace: Arc<AddressSpace>) -> Arc<AddressSpace> {
        core::mem::replace(&mut *self.aspace.lock(), aspace)
    }

    /// The descriptor table.
    pub fn fds(&self) -> &Arc<FdTable> {
        &self.fds
    }

    /// Canonical cwd path.
    pub fn cwd(&self) -> String {
        self.cwd.lock().path.clone()
    }

    /// Installs a new cwd and returns the old one.
    pub(crate) fn replace_cwd(&self, cwd: Cwd) -> Cwd {
        core::mem::replace(&mut *self.cwd.lock(), cwd)
    }

    /// A copy of the cwd for a child: same path, handle reopened.
    pub(crate) fn cwd_for_child(&self) -> crate::errno::KResult<Cwd> {
        let cwd = self.cwd.lock();
        if let Some(h) = &cwd.handle {
            h.reopen()?;
        }
        Ok(Cwd {
            path: cwd.path.clone(),
            handle: cwd.handle.clone(),
        })
    }

    /// Current limits.
    pub fn ulimit(&self) -> Ulimit {
        *self.ulimit.lock()
    }

    /// Edits the limits.
    pub fn update_ulimit(&self, f: impl FnOnce(&mut Ulimit)) {
        f(&mut self.ulimit.lock());
    }

    /// Address space quotas derived from the limits.
    pub fn vm_limits(&self) -> VmLimits {
        let ulimit = self.ulimit();
        VmLimits {
            max_pages: ulimit.pages,
            max_regions: ulimit.regions,
        }
    }

    /// The kill signal shared by every thread.
    pub fn kill_signal(&self) -> &Arc<KillSignal> {
        &self.kill
    }

    /// Returns `true` once the process has been killed or has exited.
    pub fn is_doomed(&self) -> bool {
        self.kill.is_doomed()
    }

    /// Kills every thread: each one is reaped at its next syscall or wait.
    pub fn doom(&self) -> bool {
        self.kill.doom()
    }

    /// Records the status `exit` asked for. The first caller wins.
    pub(crate) fn set_exit_status(&self, status: usize) {
        self.exit_status.lock().get_or_insert(status);
    }

    pub(crate) fn exit_status(&self) -> Option<usize> {
        *self.exit_status.lock()
    }

    /// Live threads.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().values().cloned().collect()
    }

    /// Number of live threads.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Wait bookkeeping for children and threads.
    pub fn wait_object(&self) -> &WaitObject {
        &self.wait
    }

    /// CPU time of terminated threads plus the live threads' current time.
    pub fn self_usage(&self) -> CpuTime {
        let mut total = self.usage.lock().dead;
        for t in self.threads.lock().values() {
            total.add(t.cpu_time());
        }
        total
    }

    /// CPU time of collected children.
    pub fn children_usage(&self) -> CpuTime {
        self.usage.lock().children
    }

    pub(crate) fn add_children_usage(&self, time: CpuTime) {
        self.usage.lock().children.add(time);
    }

    /// Where the next `mmap` starts looking.
    pub fn mmap_cursor(&self) -> usize {
        self.mmap_cursor.load(Ordering::Acquire)
    }

    pub(crate) fn set_mmap_cursor(&self, va: usize) {
        self.mmap_cursor.store(va, Ordering::Release);
    }

    /// The context descriptor operations run in.
    pub fn io_ctx(&self, admission: &Arc<Admission>) -> IoCtx {
        IoCtx {
            kill: self.kill.clone(),
            admission: admission.clone(),
            fds: self.fds.clone(),
            nofile: self.ulimit().nofile,
            cwd: self.cwd(),
        }
    }

    /// Removes a terminated thread and returns the threads still alive.
    fn reap_thread(&self, thread: &Thread) -> usize {
        let mut threads = self.threads.lock();
        threads.remove(&thread.tid);
        self.usage.lock().dead.add(thread.cpu_time());
        threads.len()
    }

    /// Drops what the process holds once its last thread is gone: the
    /// descriptors, the cwd handle and every mapping.
    fn release_resources(&self) {
        crate::fd::close_all(self.fds.drain_all());
        let handle: Option<Arc<dyn FdOps>> = self.cwd.lock().handle.take();
        if let Some(h) = handle {
            if let Err(e) = h.close() {
                meson_core::kwarn!("proc {}: closing cwd failed: {}", self.pid, e);
            }
        }
        let empty = Arc::new(self.aspace().new_sibling());
        drop(self.replace_aspace(empty));
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        meson_core::ktrace!("proc {}: freed", self.pid);
    }
}
