//! Process and thread creation.

use alloc::sync::Arc;

use meson_core::id::{Pid, Tid};
use meson_core::{kdebug, kwarn};
use meson_syscall::TFork;

use super::{ProcTable, ProcessInit, Reg, Thread};
use crate::errno::KResult;
use crate::fd::{FdTable, close_all};
use crate::fs::Cwd;
use crate::sched::Scheduler;
use crate::uio::read_struct;

/// Releases what a failed fork had already duplicated.
fn unwind(fds: &FdTable, cwd: Cwd) {
    close_all(fds.drain_all());
    if let Some(h) = cwd.handle {
        if let Err(e) = h.close() {
            kwarn!("fork: releasing cwd failed: {}", e);
        }
    }
}

/// Duplicates the calling thread's process.
///
/// The child gets reopened copies of every descriptor, a copy-on-write
/// view of the address space and the caller's registers with RAX set to 0.
/// It becomes waitable by the parent and is handed to the scheduler.
///
/// # Errors
///
/// [`Errno::ENOMEM`](crate::errno::Errno::ENOMEM) if the process limit or
/// the child's memory quota is exceeded, or any error reopening a
/// descriptor. Nothing of the child survives a failure.
pub fn fork_process(
    procs: &ProcTable,
    sched: &dyn Scheduler,
    caller: &Arc<Thread>,
) -> KResult<Pid> {
    let parent = caller.process();
    let fds = Arc::new(parent.fds().fork_copy()?);
    let cwd = match parent.cwd_for_child() {
        Ok(cwd) => cwd,
        Err(e) => {
            close_all(fds.drain_all());
            return Err(e);
        }
    };

    let aspace = parent.aspace();
    let child_aspace = Arc::new(aspace.new_sibling());
    if let Err(e) = aspace.fork_into(&child_aspace) {
        unwind(&fds, cwd);
        return Err(e.into());
    }

    let mut frame = caller.frame();
    frame[Reg::Rax] = 0;
    let init = ProcessInit {
        name: parent.name(),
        aspace: child_aspace,
        fds,
        cwd,
        ulimit: parent.ulimit(),
    };
    let child = procs.create(Some(parent), init, frame)?;
    child.process().set_mmap_cursor(parent.mmap_cursor());
    let pid = child.process().pid();
    kdebug!("proc {}: forked from {}", pid, parent.pid());
    sched.start_thread(child);
    Ok(pid)
}

/// Starts a new thread in the calling thread's process.
///
/// `tfork_ptr` points at a [`TFork`]: the new thread's TLS base (kept from
/// the caller when 0), where to store its tid (nowhere when 0) and its
/// initial stack pointer.
///
/// # Errors
///
/// [`Errno::EFAULT`](crate::errno::Errno::EFAULT) if the `TFork` cannot be
/// read.
pub fn fork_thread(
    procs: &ProcTable,
    sched: &dyn Scheduler,
    caller: &Arc<Thread>,
    tfork_ptr: usize,
) -> KResult<Tid> {
    let proc = caller.process();
    let aspace = proc.aspace();
    let tf: TFork = read_struct(&aspace, tfork_ptr)?;

    let mut frame = caller.frame();
    frame[Reg::Rax] = 0;
    frame[Reg::Rsp] = tf.stack as usize;
    if tf.tcb != 0 {
        frame[Reg::FsBase] = tf.tcb as usize;
    }
    let tid = procs.next_tid();
    let thread = proc.add_thread(tid, frame);
    if tf.tidaddr != 0 {
        if let Err(e) = aspace.write_u64(tf.tidaddr as usize, u64::from(tid.as_u32())) {
            kdebug!("proc {}: tid {} not stored: {:?}", proc.pid(), tid, e);
        }
    }
    sched.start_thread(thread);
    Ok(tid)
}
