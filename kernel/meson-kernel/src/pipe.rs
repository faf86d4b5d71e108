//! Byte pipes.
//!
//! A [`Pipe`] is a one-page circular buffer with reader and writer counts.
//! Pipes back `pipe2` descriptors directly and serve as the half-duplex
//! channels of stream sockets. A pipe also carries a small mailbox of
//! descriptors passed with `SCM_RIGHTS`.
//!
//! The buffer is released exactly once, when both counts reach zero.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use meson_core::kfatal;
use meson_core::sync::{SpinLock, WaitQueue};
use meson_syscall::{F_GETFL, F_SETFL, I_DEV, O_NONBLOCK, PIPE_BUF, Stat, Syscall};

use crate::admission::Quota;
use crate::config::{PIPE_CAPACITY, PIPE_MAILBOX};
use crate::errno::{Errno, KResult};
use crate::fd::{Fd, FdFuture, FdOps, IoCtx, ShutdownHow, close_all};
use crate::poll::{PollMsg, Pollers, Ready};
use crate::sched::KillSignal;
use crate::uio::UserIo;

/// Fixed-size circular buffer.
struct CircularBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    count: usize,
}

impl CircularBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: alloc::vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    fn left(&self) -> usize {
        self.capacity() - self.count
    }

    /// Fills free space from `src`. Returns bytes copied.
    fn copy_in(&mut self, src: &mut dyn UserIo) -> KResult<usize> {
        let cap = self.capacity();
        let mut done = 0;
        while self.left() > 0 && src.remain() > 0 {
            let write_pos = (self.read_pos + self.count) % cap;
            let run = (cap - write_pos).min(self.left());
            let n = src.read_into(&mut self.data[write_pos..write_pos + run])?;
            if n == 0 {
                break;
            }
            self.count += n;
            done += n;
        }
        Ok(done)
    }

    /// Drains buffered bytes into `dst`. Returns bytes copied.
    fn copy_out(&mut self, dst: &mut dyn UserIo) -> KResult<usize> {
        let cap = self.capacity();
        let mut done = 0;
        while self.count > 0 && dst.remain() > 0 {
            let run = (cap - self.read_pos).min(self.count);
            let n = dst.write_from(&self.data[self.read_pos..self.read_pos + run])?;
            if n == 0 {
                break;
            }
            self.read_pos = (self.read_pos + n) % cap;
            self.count -= n;
            done += n;
        }
        Ok(done)
    }

    fn release(&mut self) {
        self.data = Box::default();
        self.read_pos = 0;
        self.count = 0;
    }
}

struct PipeState {
    buf: CircularBuffer,
    readers: usize,
    writers: usize,
    closed: bool,
    mailbox: VecDeque<Fd>,
    pollers: Pollers,
}

/// A pipe shared by its reading and writing ends.
pub struct Pipe {
    state: SpinLock<PipeState>,
    /// Readers wait here for data.
    rcond: WaitQueue,
    /// Writers wait here for space (and mailbox room).
    wcond: WaitQueue,
    /// The pipe limit slot this pipe holds, returned on release.
    limit: Option<Arc<Quota>>,
}

impl Pipe {
    /// Creates a pipe with one reader and one writer.
    pub fn new(limit: Option<Arc<Quota>>) -> Arc<Self> {
        Arc::new(Self {
            state: SpinLock::named(
                "pipe",
                PipeState {
                    buf: CircularBuffer::new(PIPE_CAPACITY),
                    readers: 1,
                    writers: 1,
                    closed: false,
                    mailbox: VecDeque::new(),
                    pollers: Pollers::new(),
                },
            ),
            rcond: WaitQueue::new(),
            wcond: WaitQueue::new(),
            limit,
        })
    }

    /// Writes from `src`.
    ///
    /// A blocking write waits until `min(remain, PIPE_BUF)` bytes fit; a
    /// non-blocking write of more than `PIPE_BUF` bytes only needs one.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] once released, [`Errno::EPIPE`] with no readers,
    /// [`Errno::EWOULDBLOCK`] if non-blocking and full, [`Errno::EINTR`] if
    /// killed while waiting, [`Errno::EFAULT`] on a bad user buffer.
    pub async fn write(
        &self,
        kill: &KillSignal,
        src: &mut dyn UserIo,
        noblock: bool,
    ) -> KResult<usize> {
        let need = match src.remain() {
            n if n > PIPE_BUF && noblock => 1,
            n if n > PIPE_BUF => PIPE_BUF,
            n => n,
        };
        kill.wait_until(&self.wcond, || {
            let mut st = self.state.lock();
            if st.closed {
                return Some(Err(Errno::EBADF));
            }
            if st.readers == 0 {
                return Some(Err(Errno::EPIPE));
            }
            if st.buf.left() >= need {
                let res = st.buf.copy_in(&mut *src);
                self.rcond.wake_one();
                st.pollers.wake_ready(Ready::READ);
                return Some(res);
            }
            if noblock {
                return Some(Err(Errno::EWOULDBLOCK));
            }
            None
        })
        .await?
    }

    /// Writes all of `src`, one [`Pipe::write`] per round. Rounds after the
    /// first are admitted again against the heap budget. A non-blocking
    /// write returns after one round.
    ///
    /// # Errors
    ///
    /// As [`Pipe::write`].
    pub async fn write_all(
        &self,
        cx: &IoCtx,
        src: &mut dyn UserIo,
        noblock: bool,
    ) -> KResult<usize> {
        let mut done = 0;
        let mut round = 0usize;
        while src.remain() > 0 {
            // The first round runs under the dispatcher's reservation.
            let _budget = if round > 0 {
                Some(
                    cx.kill
                        .killable(cx.admission.reserve(Syscall::Write.cost()))
                        .await?,
                )
            } else {
                None
            };
            round += 1;
            let n = self.write(&cx.kill, &mut *src, noblock).await?;
            if noblock {
                return Ok(n);
            }
            done += n;
        }
        Ok(done)
    }

    /// Reads into `dst`. Returns 0 at end of file.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] once released, [`Errno::EWOULDBLOCK`] if
    /// non-blocking and empty, [`Errno::EINTR`] if killed while waiting,
    /// [`Errno::EFAULT`] on a bad user buffer.
    pub async fn read(
        &self,
        kill: &KillSignal,
        dst: &mut dyn UserIo,
        noblock: bool,
    ) -> KResult<usize> {
        kill.wait_until(&self.rcond, || {
            let mut st = self.state.lock();
            if st.closed {
                return Some(Err(Errno::EBADF));
            }
            if st.writers == 0 || !st.buf.is_empty() {
                let res = st.buf.copy_out(&mut *dst);
                self.wcond.wake_one();
                st.pollers.wake_ready(Ready::WRITE);
                return Some(res);
            }
            if noblock {
                return Some(Err(Errno::EWOULDBLOCK));
            }
            None
        })
        .await?
    }

    /// Reports readiness.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOMEM`] if the poller list is full.
    pub fn poll(&self, pm: &PollMsg) -> KResult<Ready> {
        let mut st = self.state.lock();
        if st.closed {
            return Ok(Ready::empty());
        }
        let readable = !st.buf.is_empty() || st.writers == 0;
        let writable = !st.buf.is_full() || st.readers == 0;
        let mut r = Ready::empty();
        if pm.events.contains(Ready::READ) && readable {
            r |= Ready::READ;
        }
        if pm.events.contains(Ready::HUP) && st.writers == 0 {
            r |= Ready::HUP;
        } else if pm.events.contains(Ready::WRITE) && writable {
            r |= Ready::WRITE;
        }
        if !r.is_empty() || !pm.dowait {
            return Ok(r);
        }
        st.pollers.add(pm)?;
        Ok(Ready::empty())
    }

    /// Adjusts the reader and writer counts.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] once the pipe has been released.
    pub fn reopen(&self, rd: isize, wd: isize) -> KResult<()> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(Errno::EBADF);
        }
        let (Some(readers), Some(writers)) = (
            st.readers.checked_add_signed(rd),
            st.writers.checked_add_signed(wd),
        ) else {
            kfatal!(
                "pipe: open count underflow (readers {} {:+}, writers {} {:+})",
                st.readers,
                rd,
                st.writers,
                wd
            );
            panic!("pipe open count underflow");
        };
        st.readers = readers;
        st.writers = writers;
        if writers == 0 {
            st.pollers.wake_ready(Ready::READ | Ready::HUP);
        }
        if readers == 0 {
            st.pollers.wake_ready(Ready::WRITE);
        }
        let mut passed = Vec::new();
        let released = readers == 0 && writers == 0;
        if released {
            st.closed = true;
            st.buf.release();
            passed.extend(st.mailbox.drain(..));
        }
        drop(st);
        self.rcond.wake_all();
        self.wcond.wake_all();
        if released {
            close_all(passed);
            if let Some(limit) = &self.limit {
                limit.give();
            }
        }
        Ok(())
    }

    /// Queues a passed descriptor, waiting while the mailbox is full. On
    /// any error the descriptor is closed.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] once released, [`Errno::EINTR`] if killed while
    /// waiting.
    pub async fn fd_add(&self, kill: &KillSignal, fd: Fd) -> KResult<()> {
        let mut pending = Some(fd);
        let slot = &mut pending;
        let res = kill
            .wait_until(&self.wcond, || {
                let mut st = self.state.lock();
                if st.closed {
                    return Some(Err(Errno::EBADF));
                }
                if st.mailbox.len() >= PIPE_MAILBOX {
                    return None;
                }
                st.mailbox.extend(slot.take());
                Some(Ok(()))
            })
            .await
            .and_then(|r| r);
        close_all(pending.into_iter().collect());
        res
    }

    /// Takes the oldest passed descriptor, if any.
    pub fn fd_take(&self) -> Option<Fd> {
        let fd = self.state.lock().mailbox.pop_front();
        if fd.is_some() {
            self.wcond.wake_all();
        }
        fd
    }

    /// Bytes buffered.
    pub fn buffered(&self) -> usize {
        self.state.lock().buf.count
    }

    /// Returns `true` once both counts have reached zero.
    pub fn is_released(&self) -> bool {
        self.state.lock().closed
    }
}

/// One end of a `pipe2` pipe.
pub struct PipeEnd {
    pipe: Arc<Pipe>,
    writer: bool,
    options: AtomicUsize,
}

impl PipeEnd {
    /// Wraps one end of `pipe` with `O_*` options.
    pub fn new(pipe: Arc<Pipe>, writer: bool, options: usize) -> Self {
        Self {
            pipe,
            writer,
            options: AtomicUsize::new(options & O_NONBLOCK),
        }
    }

    fn nonblocking(&self) -> bool {
        self.options.load(Ordering::Acquire) & O_NONBLOCK != 0
    }

    fn delta(&self, d: isize) -> (isize, isize) {
        if self.writer { (0, d) } else { (d, 0) }
    }
}

impl FdOps for PipeEnd {
    fn close(&self) -> KResult<()> {
        let (rd, wd) = self.delta(-1);
        self.pipe.reopen(rd, wd)
    }

    fn reopen(&self) -> KResult<()> {
        let (rd, wd) = self.delta(1);
        self.pipe.reopen(rd, wd)
    }

    fn fstat(&self) -> KResult<Stat> {
        Ok(Stat {
            mode: I_DEV << 16,
            ..Stat::default()
        })
    }

    fn read<'a>(&'a self, cx: &'a IoCtx, dst: &'a mut dyn UserIo) -> FdFuture<'a, usize> {
        Box::pin(async move { self.pipe.read(&cx.kill, dst, self.nonblocking()).await })
    }

    fn write<'a>(&'a self, cx: &'a IoCtx, src: &'a mut dyn UserIo) -> FdFuture<'a, usize> {
        Box::pin(async move { self.pipe.write_all(cx, src, self.nonblocking()).await })
    }

    fn poll(&self, pm: &PollMsg) -> KResult<Ready> {
        let strip = if self.writer { Ready::READ } else { Ready::WRITE };
        let pm = PollMsg {
            events: pm.events - strip,
            ..pm.clone()
        };
        self.pipe.poll(&pm)
    }

    fn fcntl(&self, cmd: usize, arg: usize) -> KResult<usize> {
        match cmd {
            F_GETFL => Ok(self.options.load(Ordering::Acquire)),
            F_SETFL => {
                self.options.store(arg & O_NONBLOCK, Ordering::Release);
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn shutdown(&self, _how: ShutdownHow) -> KResult<()> {
        Err(Errno::ENOTCONN)
    }
}
