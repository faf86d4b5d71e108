//! Resource limits and usage.

use meson_syscall::{RLIM_INFINITY, RLIMIT_NOFILE, RUSAGE_CHILDREN, RUSAGE_SELF, Rlimit};

use super::CallCtx;
use crate::errno::{Errno, KResult};
use crate::uio::{read_struct, write_struct};

pub(super) fn getrlimit(cx: &CallCtx<'_>, resource: usize, rlim: usize) -> KResult<usize> {
    if resource != RLIMIT_NOFILE {
        return Err(Errno::EINVAL);
    }
    let lim = Rlimit {
        rlim_cur: cx.nofile() as u64,
        rlim_max: RLIM_INFINITY,
    };
    write_struct(&cx.aspace(), rlim, &lim)?;
    Ok(0)
}

/// Only the soft descriptor limit can change. Lowering it leaves open
/// descriptors above the new limit in place.
pub(super) fn setrlimit(cx: &CallCtx<'_>, resource: usize, rlim: usize) -> KResult<usize> {
    if resource != RLIMIT_NOFILE {
        return Err(Errno::EINVAL);
    }
    let lim: Rlimit = read_struct(&cx.aspace(), rlim)?;
    if lim.rlim_cur > lim.rlim_max {
        return Err(Errno::EINVAL);
    }
    let nofile = usize::try_from(lim.rlim_cur).unwrap_or(usize::MAX);
    cx.process().update_ulimit(|u| u.nofile = nofile);
    Ok(0)
}

pub(super) fn getrusage(cx: &CallCtx<'_>, who: usize, rusage: usize) -> KResult<usize> {
    let usage = match who {
        RUSAGE_SELF => cx.process().self_usage(),
        RUSAGE_CHILDREN => cx.process().children_usage(),
        _ => return Err(Errno::EINVAL),
    };
    write_struct(&cx.aspace(), rusage, &usage.to_rusage())?;
    Ok(0)
}
