//! The poll call.
//!
//! Each user record is one little-endian word: the fd in bits 0..32, the
//! requested events in bits 32..48 and the returned events in bits 48..64.

use alloc::sync::Arc;
use alloc::vec;

use meson_syscall::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI, POLLWRBAND};

use super::CallCtx;
use crate::errno::{Errno, KResult};
use crate::poll::{PollMsg, PollNotifier, Ready};
use crate::sched::{Either, select};
use crate::uio::check_range;

const READ_EVENTS: u16 = POLLIN | POLLPRI;
const WRITE_EVENTS: u16 = POLLOUT | POLLWRBAND;
const NSEC_PER_MSEC: u64 = 1_000_000;

/// Readiness classes for a request. Errors and hangups are always asked
/// for.
fn classes(events: u16) -> Ready {
    let mut want = Ready::ERROR | Ready::HUP;
    want.set(Ready::READ, events & READ_EVENTS != 0);
    want.set(Ready::WRITE, events & WRITE_EVENTS != 0);
    want
}

fn revents(ready: Ready, events: u16) -> u16 {
    let mut out = 0;
    if ready.contains(Ready::READ) {
        out |= events & READ_EVENTS;
    }
    if ready.contains(Ready::WRITE) {
        out |= events & WRITE_EVENTS;
    }
    if ready.contains(Ready::ERROR) {
        out |= POLLERR;
    }
    if ready.contains(Ready::HUP) {
        out |= POLLHUP;
    }
    out
}

/// Splits a record into `(fd, events)`.
#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    reason = "fields are packed"
)]
fn unpack(word: u64) -> (i32, u16) {
    (word as u32 as i32, (word >> 32) as u16)
}

fn pack(word: u64, revents: u16) -> u64 {
    (word & 0xffff_ffff_ffff) | (u64::from(revents) << 48)
}

pub(super) async fn poll(
    cx: &CallCtx<'_>,
    fds: usize,
    nfds: usize,
    timeout_ms: usize,
) -> KResult<usize> {
    #[expect(clippy::cast_possible_wrap, reason = "both are signed in the ABI")]
    let (signed_nfds, timeout) = (nfds as isize, timeout_ms as isize);
    if signed_nfds < 0
        || timeout < -1
        || nfds.saturating_mul(8) > cx.kernel.config.poll_buf_size
    {
        return Err(Errno::EINVAL);
    }
    check_range(fds, nfds * 8)?;

    let aspace = cx.aspace();
    let mut recs = vec![0u64; nfds];
    for (i, rec) in recs.iter_mut().enumerate() {
        *rec = aspace.read_u64(fds + i * 8)?;
    }

    let timer = &cx.kernel.timer;
    let deadline = u64::try_from(timeout)
        .ok()
        .map(|ms| timer.now_ns().saturating_add(ms.saturating_mul(NSEC_PER_MSEC)));
    let notifier = Arc::new(PollNotifier::new());
    let kill = cx.process().kill_signal();

    loop {
        notifier.reset();
        let mut ready = 0;
        for rec in &mut recs {
            let (fd, events) = unpack(*rec);
            let out = match usize::try_from(fd) {
                Err(_) => 0,
                Ok(fd) => match cx.fd(fd) {
                    Err(_) => POLLNVAL,
                    Ok(fd) => {
                        let pm = PollMsg {
                            events: classes(events),
                            dowait: ready == 0 && timeout != 0,
                            notifier: notifier.clone(),
                        };
                        revents(fd.ops.poll(&pm)?, events)
                    }
                },
            };
            if out != 0 {
                ready += 1;
            }
            *rec = pack(*rec, out);
        }

        if ready > 0 || timeout == 0 {
            store(cx, fds, &recs)?;
            return Ok(ready);
        }

        let woken = kill
            .killable(async {
                match deadline {
                    None => {
                        notifier.wait().await;
                        true
                    }
                    Some(at) => matches!(
                        select(notifier.wait(), timer.sleep_until(at)).await,
                        Either::Left(())
                    ),
                }
            })
            .await?;
        if !woken {
            store(cx, fds, &recs)?;
            return Ok(0);
        }
    }
}

fn store(cx: &CallCtx<'_>, fds: usize, recs: &[u64]) -> KResult<()> {
    let aspace = cx.aspace();
    for (i, rec) in recs.iter().enumerate() {
        aspace.write_u64(fds + i * 8, *rec)?;
    }
    Ok(())
}
