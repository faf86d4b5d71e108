//! Clock, sleep and futex calls.

use meson_syscall::{Timespec, Timeval};

use super::CallCtx;
use crate::errno::{Errno, KResult};
use crate::sched::timer::NSEC_PER_SEC;
use crate::uio::{read_struct, write_struct};

/// Converts a timespec to nanoseconds, rejecting negative fields and
/// `tv_nsec` outside `0..1e9`.
fn timespec_ns(ts: &Timespec) -> KResult<u64> {
    let sec = u64::try_from(ts.tv_sec).map_err(|_| Errno::EINVAL)?;
    let nsec = u64::try_from(ts.tv_nsec).map_err(|_| Errno::EINVAL)?;
    if nsec >= NSEC_PER_SEC {
        return Err(Errno::EINVAL);
    }
    sec.checked_mul(NSEC_PER_SEC)
        .and_then(|s| s.checked_add(nsec))
        .ok_or(Errno::EINVAL)
}

pub(super) fn gettimeofday(cx: &CallCtx<'_>, tv: usize) -> KResult<usize> {
    let now = cx.kernel.timer.now_ns();
    let val = Timeval {
        tv_sec: i64::try_from(now / NSEC_PER_SEC).unwrap_or(i64::MAX),
        tv_usec: i64::try_from(now % NSEC_PER_SEC / 1000).unwrap_or(0),
    };
    write_struct(&cx.aspace(), tv, &val)?;
    Ok(0)
}

pub(super) async fn nanosleep(cx: &CallCtx<'_>, req: usize, rem: usize) -> KResult<usize> {
    let aspace = cx.aspace();
    let ts: Timespec = read_struct(&aspace, req)?;
    let dur = timespec_ns(&ts)?;
    let timer = &cx.kernel.timer;
    let deadline = timer.now_ns().saturating_add(dur);
    cx.process()
        .kill_signal()
        .killable(timer.sleep_until(deadline))
        .await?;
    if rem != 0 {
        write_struct(&aspace, rem, &Timespec::default())?;
    }
    Ok(0)
}

/// `timeout` points at an absolute deadline, or is 0 for none.
pub(super) async fn futex(
    cx: &CallCtx<'_>,
    op: usize,
    uaddr: usize,
    uaddr2: usize,
    val: usize,
    timeout: usize,
) -> KResult<usize> {
    let aspace = cx.aspace();
    let deadline = if timeout == 0 {
        None
    } else {
        let ts: Timespec = read_struct(&aspace, timeout)?;
        Some(timespec_ns(&ts)?)
    };
    cx.kernel
        .futexes
        .futex(
            cx.kernel.sched.as_ref(),
            &aspace,
            cx.process().kill_signal(),
            op,
            uaddr,
            uaddr2,
            val,
            deadline,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_bounds() {
        let ts = |tv_sec, tv_nsec| Timespec { tv_sec, tv_nsec };
        assert_eq!(timespec_ns(&ts(2, 5)), Ok(2 * NSEC_PER_SEC + 5));
        assert_eq!(timespec_ns(&ts(-1, 0)), Err(Errno::EINVAL));
        assert_eq!(timespec_ns(&ts(0, -1)), Err(Errno::EINVAL));
        assert_eq!(timespec_ns(&ts(0, 1_000_000_000)), Err(Errno::EINVAL));
    }
}
