//! Descriptor table, cwd and namespace calls.
//!
//! Paths are read from user memory and canonicalized against the caller's
//! cwd before they reach the [`FileService`](crate::fs::FileService).

use meson_core::kdebug;
use meson_syscall::{F_GETFD, F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, unmkdev};

use super::CallCtx;
use crate::errno::{Errno, KResult};
use crate::fd::{Fd, FdPerms};
use crate::fs::{Cwd, OpenFlags};
use crate::uio::{check_range, write_struct};

fn length(len: usize) -> KResult<usize> {
    isize::try_from(len).map_err(|_| Errno::EINVAL)?;
    Ok(len)
}

pub(super) fn open(cx: &CallCtx<'_>, path: usize, flags: usize, mode: usize) -> KResult<usize> {
    let path = cx.path(path)?;
    let flags = OpenFlags::from_bits_truncate(flags);
    let ops = cx
        .kernel
        .fs
        .open(&path, flags, mode, &cx.process().cwd(), 0, 0)?;
    let mut perms = FdPerms::empty();
    perms.set(FdPerms::READ, flags.readable());
    perms.set(FdPerms::WRITE, flags.writable());
    perms.set(FdPerms::CLOEXEC, flags.contains(OpenFlags::CLOEXEC));
    cx.process().fds().insert(Fd::new(ops, perms), cx.nofile())
}

pub(super) fn close(cx: &CallCtx<'_>, fd: usize) -> KResult<usize> {
    cx.process().fds().take(fd)?.close()?;
    Ok(0)
}

pub(super) fn stat(cx: &CallCtx<'_>, path: usize, st: usize) -> KResult<usize> {
    let path = cx.path(path)?;
    let meta = cx.kernel.fs.stat(&path, &cx.process().cwd())?;
    write_struct(&cx.aspace(), st, &meta)?;
    Ok(0)
}

pub(super) fn fstat(cx: &CallCtx<'_>, fd: usize, st: usize) -> KResult<usize> {
    let meta = cx.fd(fd)?.ops.fstat()?;
    write_struct(&cx.aspace(), st, &meta)?;
    Ok(0)
}

/// Succeeds if `path` exists. There are no permission bits to check.
pub(super) fn access(cx: &CallCtx<'_>, path: usize, _mode: usize) -> KResult<usize> {
    let path = cx.path(path)?;
    cx.kernel.fs.stat(&path, &cx.process().cwd())?;
    Ok(0)
}

/// Makes `new` a second open of `old`. The copy is never close-on-exec.
pub(super) fn dup2(cx: &CallCtx<'_>, old: usize, new: usize) -> KResult<usize> {
    let fd = cx.fd(old)?;
    if old == new {
        return Ok(new);
    }
    let mut copy = fd.copy()?;
    copy.perms.remove(FdPerms::CLOEXEC);
    match cx.process().fds().replace(new, copy.clone(), cx.nofile()) {
        Ok(prev) => {
            if let Some(prev) = prev {
                if let Err(e) = prev.close() {
                    kdebug!("dup2: closing fd {} failed: {}", new, e);
                }
            }
            Ok(new)
        }
        Err(e) => {
            copy.close()?;
            Err(e)
        }
    }
}

pub(super) fn fcntl(cx: &CallCtx<'_>, fd: usize, cmd: usize, arg: usize) -> KResult<usize> {
    match cmd {
        F_GETFD => {
            let cloexec = cx.fd(fd)?.perms.contains(FdPerms::CLOEXEC);
            Ok(if cloexec { FD_CLOEXEC } else { 0 })
        }
        F_SETFD => {
            cx.process().fds().update_perms(fd, |p| {
                p.set(FdPerms::CLOEXEC, arg & FD_CLOEXEC != 0);
            })?;
            Ok(0)
        }
        F_GETFL | F_SETFL => cx.fd(fd)?.ops.fcntl(cmd, arg),
        _ => Err(Errno::EINVAL),
    }
}

pub(super) fn truncate(cx: &CallCtx<'_>, path: usize, len: usize) -> KResult<usize> {
    let len = length(len)?;
    let path = cx.path(path)?;
    let file = cx
        .kernel
        .fs
        .open(&path, OpenFlags::WRONLY, 0, &cx.process().cwd(), 0, 0)?;
    let res = file.truncate(len);
    file.close()?;
    res.map(|()| 0)
}

pub(super) fn ftruncate(cx: &CallCtx<'_>, fd: usize, len: usize) -> KResult<usize> {
    let len = length(len)?;
    let fd = cx.fd(fd)?;
    if !fd.perms.contains(FdPerms::WRITE) {
        return Err(Errno::EBADF);
    }
    fd.ops.truncate(len)?;
    Ok(0)
}

/// Copies the cwd path and its NUL to `buf`. Returns the bytes written.
pub(super) fn getcwd(cx: &CallCtx<'_>, buf: usize, len: usize) -> KResult<usize> {
    let path = cx.process().cwd();
    let need = path.len() + 1;
    if len < need {
        return Err(Errno::ERANGE);
    }
    check_range(buf, need)?;
    let aspace = cx.aspace();
    aspace.copy_out(buf, path.as_bytes())?;
    aspace.copy_out(buf + path.len(), &[0])?;
    Ok(need)
}

pub(super) fn chdir(cx: &CallCtx<'_>, path: usize) -> KResult<usize> {
    let path = cx.path(path)?;
    let proc = cx.process();
    let dir = cx
        .kernel
        .fs
        .open(&path, OpenFlags::DIRECTORY, 0, &proc.cwd(), 0, 0)?;
    let old = proc.replace_cwd(Cwd {
        path,
        handle: Some(dir),
    });
    if let Some(handle) = old.handle {
        if let Err(e) = handle.close() {
            kdebug!("proc {}: closing old cwd failed: {}", proc.pid(), e);
        }
    }
    Ok(0)
}

pub(super) fn rename(cx: &CallCtx<'_>, old: usize, new: usize) -> KResult<usize> {
    let old = cx.path(old)?;
    let new = cx.path(new)?;
    cx.kernel.fs.rename(&old, &new, &cx.process().cwd())?;
    Ok(0)
}

pub(super) fn mkdir(cx: &CallCtx<'_>, path: usize, mode: usize) -> KResult<usize> {
    let path = cx.path(path)?;
    cx.kernel.fs.mkdir(&path, mode, &cx.process().cwd())?;
    Ok(0)
}

pub(super) fn link(cx: &CallCtx<'_>, old: usize, new: usize) -> KResult<usize> {
    let old = cx.path(old)?;
    let new = cx.path(new)?;
    cx.kernel.fs.link(&old, &new, &cx.process().cwd())?;
    Ok(0)
}

pub(super) fn unlink(cx: &CallCtx<'_>, path: usize, is_dir: usize) -> KResult<usize> {
    let path = cx.path(path)?;
    cx.kernel
        .fs
        .unlink(&path, &cx.process().cwd(), is_dir != 0)?;
    Ok(0)
}

/// Creates a device node. `dev` is in the `mkdev` encoding and must name
/// a non-zero major.
pub(super) fn mknod(cx: &CallCtx<'_>, path: usize, mode: usize, dev: usize) -> KResult<usize> {
    let (major, minor) = unmkdev(dev as u64);
    if major == 0 {
        return Err(Errno::EINVAL);
    }
    let path = cx.path(path)?;
    let node = cx.kernel.fs.open(
        &path,
        OpenFlags::CREAT | OpenFlags::EXCL,
        mode,
        &cx.process().cwd(),
        major,
        minor,
    )?;
    node.close()?;
    Ok(0)
}

pub(super) fn sync(cx: &CallCtx<'_>) -> KResult<usize> {
    cx.kernel.fs.sync()?;
    Ok(0)
}
