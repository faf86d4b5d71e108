//! Process and thread lifecycle calls.

use meson_core::id::Pid;
use meson_core::kdebug;
use meson_syscall::{
    FORK_PROCESS, FORK_THREAD, SIGKILL, WAIT_ANY, WAIT_THREAD, WNOHANG, exit_status,
};

use super::CallCtx;
use crate::errno::{Errno, KResult};
use crate::exec;
use crate::proc::{WaitKind, fork_process, fork_thread};
use crate::uio::write_struct;

pub(super) fn getpid(cx: &CallCtx<'_>) -> usize {
    cx.process().pid().as_u32() as usize
}

pub(super) fn getppid(cx: &CallCtx<'_>) -> usize {
    cx.process().parent().as_u32() as usize
}

pub(super) fn gettid(cx: &CallCtx<'_>) -> usize {
    cx.thread.tid().as_u32() as usize
}

/// Forks a process (`FORK_PROCESS`) or starts a thread (`FORK_THREAD`) and
/// returns the new id. The child sees 0.
pub(super) fn fork(cx: &CallCtx<'_>, flags: usize, tfork: usize) -> KResult<usize> {
    let k = cx.kernel;
    match flags {
        FORK_PROCESS => {
            let pid = fork_process(&k.procs, k.sched.as_ref(), cx.thread)?;
            Ok(pid.as_u32() as usize)
        }
        FORK_THREAD => {
            let tid = fork_thread(&k.procs, k.sched.as_ref(), cx.thread, tfork)?;
            Ok(tid.as_u32() as usize)
        }
        _ => Err(Errno::EINVAL),
    }
}

/// On success the caller's frame already holds the new image; the 0
/// returned here lands in its cleared RAX.
pub(super) fn execv(cx: &CallCtx<'_>, path: usize, argv: usize) -> KResult<usize> {
    let aspace = cx.aspace();
    let args = exec::read_argv(&aspace, argv)?;
    drop(aspace);
    let path = cx.path(path)?;
    exec::exec(
        cx.kernel.fs.as_ref(),
        cx.thread,
        path,
        &args,
        cx.kernel.config.ps_per_cycle,
    )?;
    Ok(0)
}

/// Ends the whole process. Its other threads are doomed and reaped at their
/// next kernel entry.
pub(super) fn exit(cx: &CallCtx<'_>, status: usize) {
    let status = exit_status(status);
    let proc = cx.process();
    proc.set_exit_status(status);
    proc.doom();
    kdebug!("proc {}: exit {:#x}", proc.pid(), status);
    cx.exit.set(Some(status));
}

/// Ends the calling thread only.
pub(super) fn threxit(cx: &CallCtx<'_>, status: usize) {
    cx.exit.set(Some(status));
}

pub(super) async fn wait4(
    cx: &CallCtx<'_>,
    pid: usize,
    status: usize,
    options: usize,
    rusage: usize,
) -> KResult<usize> {
    if pid == cx.thread.tid().as_u32() as usize {
        return Err(Errno::ECHILD);
    }
    let kind = if options & WAIT_THREAD != 0 {
        WaitKind::Thread
    } else {
        WaitKind::Process
    };
    let id = if pid == WAIT_ANY {
        if kind == WaitKind::Thread {
            return Err(Errno::EINVAL);
        }
        None
    } else {
        Some(u32::try_from(pid).map_err(|_| Errno::ECHILD)?)
    };

    let proc = cx.process();
    let found = proc
        .wait_object()
        .wait(proc.kill_signal(), kind, id, options & WNOHANG != 0)
        .await?;
    let Some(rec) = found else {
        return Ok(0);
    };

    let aspace = cx.aspace();
    if kind == WaitKind::Process {
        proc.add_children_usage(rec.usage);
    }
    if status != 0 {
        if kind == WaitKind::Process {
            #[expect(clippy::cast_possible_truncation, reason = "process statuses are 16 bits")]
            let word = rec.status as u32;
            aspace.write_u32(status, word)?;
        } else {
            aspace.write_u64(status, rec.status as u64)?;
        }
    }
    if rusage != 0 {
        write_struct(&aspace, rusage, &rec.usage.to_rusage())?;
    }
    Ok(rec.id as usize)
}

pub(super) fn kill(cx: &CallCtx<'_>, pid: usize, sig: usize) -> KResult<usize> {
    if sig != SIGKILL {
        return Err(Errno::EINVAL);
    }
    let pid = u32::try_from(pid).map_err(|_| Errno::ESRCH)?;
    cx.kernel.procs.kill(Pid::new(pid))?;
    Ok(0)
}

/// Sleeps until the process is killed.
pub(super) async fn pause(cx: &CallCtx<'_>) -> KResult<usize> {
    cx.process().kill_signal().doomed().await;
    Err(Errno::EINTR)
}
