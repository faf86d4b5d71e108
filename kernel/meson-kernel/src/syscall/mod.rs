//! Syscall entry and dispatch.
//!
//! [`Kernel::syscall`] runs the call saved in a thread's trap frame. A
//! doomed thread is reaped before anything else happens; every other call
//! is admitted against the heap budget, routed through the generated
//! [`dispatch`] and its result written back to RAX. The handlers live in
//! the submodules and return [`KResult`]; [`CallCtx`] adapts them to the
//! generated [`SyscallHandler`] trait.

mod io;
mod memory;
mod net;
mod poll;
mod process;
mod resource;
mod time;
mod vfs;


use alloc::string::String;
use alloc::sync::Arc;
use core::cell::Cell;

use meson_core::{ktrace, kwarn};
use meson_mm::AddressSpace;
use meson_syscall::{SIGKILL, Syscall, SyscallHandler, dispatch, signaled_status};

use crate::Kernel;
use crate::errno::{Errno, KResult, into_return};
use crate::fd::{Fd, IoCtx};
use crate::fs::user_path;
use crate::proc::{Process, Reg, Thread};

/// Signal number reported for a thread that issued an unknown syscall.
const SIGSYS: usize = 31;

/// What became of the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// The call finished; the value is also in RAX.
    Returned(isize),
    /// The thread is gone and must not be resumed.
    ThreadExited,
}

impl Kernel {
    /// Runs the syscall saved in `thread`'s trap frame.
    pub async fn syscall(&self, thread: &Arc<Thread>) -> SyscallOutcome {
        let proc = thread.process();
        if proc.is_doomed() {
            self.procs.terminate(thread, signaled_status(SIGKILL));
            return SyscallOutcome::ThreadExited;
        }

        let (nr, args) = thread.frame().syscall();
        let Some(call) = Syscall::from_nr(nr) else {
            kwarn!("proc {}: unknown syscall {}", proc.pid(), nr);
            self.procs.terminate(thread, signaled_status(SIGSYS));
            return SyscallOutcome::ThreadExited;
        };

        let start = self.timer.now_ns();
        let cx = CallCtx::new(self, thread);
        let ret = match self.admission.try_reserve(call.cost()) {
            Ok(reservation) => {
                let [a0, a1, a2, a3, a4] = args;
                let ret = dispatch(&cx, nr, a0, a1, a2, a3, a4)
                    .await
                    .unwrap_or(Errno::ENOSYS.as_return());
                drop(reservation);
                ret
            }
            Err(e) => {
                ktrace!("proc {}: {} not admitted", proc.pid(), call.name());
                e.as_return()
            }
        };
        thread.charge(0, self.timer.now_ns().saturating_sub(start));

        if let Some(status) = cx.exit.get() {
            self.procs.terminate(thread, status);
            return SyscallOutcome::ThreadExited;
        }
        #[expect(clippy::cast_sign_loss, reason = "RAX holds the raw two's complement")]
        let rax = ret as usize;
        thread.update_frame(|tf| tf[Reg::Rax] = rax);
        SyscallOutcome::Returned(ret)
    }
}

/// The state one syscall runs with.
struct CallCtx<'k> {
    kernel: &'k Kernel,
    thread: &'k Arc<Thread>,
    /// Set by `exit` and `threxit`: the status the caller terminates with.
    exit: Cell<Option<usize>>,
}

impl<'k> CallCtx<'k> {
    fn new(kernel: &'k Kernel, thread: &'k Arc<Thread>) -> Self {
        Self {
            kernel,
            thread,
            exit: Cell::new(None),
        }
    }

    fn process(&self) -> &Arc<Process> {
        self.thread.process()
    }

    fn aspace(&self) -> Arc<AddressSpace> {
        self.process().aspace()
    }

    fn io(&self) -> IoCtx {
        self.process().io_ctx(&self.kernel.admission)
    }

    fn fd(&self, n: usize) -> KResult<Fd> {
        self.process().fds().get(n)
    }

    fn nofile(&self) -> usize {
        self.process().ulimit().nofile
    }

    /// Reads a user path and resolves it against the cwd.
    fn path(&self, va: usize) -> KResult<String> {
        user_path(&self.aspace(), va, &self.process().cwd())
    }
}

impl SyscallHandler for CallCtx<'_> {
    // ── vfs ─────────────────────────────────────────────────────────

    async fn sys_read(&self, fd: usize, buf: usize, len: usize) -> isize {
        into_return(io::read(self, fd, buf, len).await)
    }

    async fn sys_write(&self, fd: usize, buf: usize, len: usize) -> isize {
        into_return(io::write(self, fd, buf, len).await)
    }

    async fn sys_open(&self, path: usize, flags: usize, mode: usize) -> isize {
        into_return(vfs::open(self, path, flags, mode))
    }

    async fn sys_close(&self, fd: usize) -> isize {
        into_return(vfs::close(self, fd))
    }

    async fn sys_stat(&self, path: usize, st: usize) -> isize {
        into_return(vfs::stat(self, path, st))
    }

    async fn sys_fstat(&self, fd: usize, st: usize) -> isize {
        into_return(vfs::fstat(self, fd, st))
    }

    async fn sys_poll(&self, fds: usize, nfds: usize, timeout_ms: usize) -> isize {
        into_return(poll::poll(self, fds, nfds, timeout_ms).await)
    }

    async fn sys_lseek(&self, fd: usize, off: usize, whence: usize) -> isize {
        into_return(io::lseek(self, fd, off, whence))
    }

    // ── memory ──────────────────────────────────────────────────────

    async fn sys_mmap(
        &self,
        addr: usize,
        len: usize,
        prot_flags: usize,
        fd: usize,
        offset: usize,
    ) -> isize {
        into_return(memory::mmap(self, addr, len, prot_flags, fd, offset))
    }

    async fn sys_munmap(&self, addr: usize, len: usize) -> isize {
        into_return(memory::munmap(self, addr, len))
    }

    // ── vio ─────────────────────────────────────────────────────────

    async fn sys_pread(&self, fd: usize, buf: usize, len: usize, off: usize) -> isize {
        into_return(io::pread(self, fd, buf, len, off))
    }

    async fn sys_pwrite(&self, fd: usize, buf: usize, len: usize, off: usize) -> isize {
        into_return(io::pwrite(self, fd, buf, len, off))
    }

    async fn sys_readv(&self, fd: usize, iov: usize, iovcnt: usize) -> isize {
        into_return(io::readv(self, fd, iov, iovcnt).await)
    }

    async fn sys_writev(&self, fd: usize, iov: usize, iovcnt: usize) -> isize {
        into_return(io::writev(self, fd, iov, iovcnt).await)
    }

    async fn sys_access(&self, path: usize, mode: usize) -> isize {
        into_return(vfs::access(self, path, mode))
    }

    // ── fd ──────────────────────────────────────────────────────────

    async fn sys_dup2(&self, old: usize, new: usize) -> isize {
        into_return(vfs::dup2(self, old, new))
    }

    async fn sys_pause(&self) -> isize {
        into_return(process::pause(self).await)
    }

    // ── identity ────────────────────────────────────────────────────

    async fn sys_getpid(&self) -> isize {
        into_return(Ok(process::getpid(self)))
    }

    async fn sys_getppid(&self) -> isize {
        into_return(Ok(process::getppid(self)))
    }

    async fn sys_gettid(&self) -> isize {
        into_return(Ok(process::gettid(self)))
    }

    // ── net ─────────────────────────────────────────────────────────

    async fn sys_socket(&self, domain: usize, ty: usize, proto: usize) -> isize {
        into_return(net::socket(self, domain, ty, proto))
    }

    async fn sys_connect(&self, fd: usize, addr: usize, addrlen: usize) -> isize {
        into_return(net::connect(self, fd, addr, addrlen).await)
    }

    async fn sys_accept(&self, fd: usize, addr: usize, addrlen_ptr: usize) -> isize {
        into_return(net::accept(self, fd, addr, addrlen_ptr).await)
    }

    async fn sys_sendto(
        &self,
        fd: usize,
        buf: usize,
        flags_len: usize,
        addr: usize,
        addrlen: usize,
    ) -> isize {
        into_return(net::sendto(self, fd, buf, flags_len, addr, addrlen).await)
    }

    async fn sys_recvfrom(
        &self,
        fd: usize,
        buf: usize,
        flags_len: usize,
        addr: usize,
        addrlen_ptr: usize,
    ) -> isize {
        into_return(net::recvfrom(self, fd, buf, flags_len, addr, addrlen_ptr).await)
    }

    async fn sys_sendmsg(&self, fd: usize, msg: usize, flags: usize) -> isize {
        into_return(net::sendmsg(self, fd, msg, flags).await)
    }

    async fn sys_recvmsg(&self, fd: usize, msg: usize, flags: usize) -> isize {
        into_return(net::recvmsg(self, fd, msg, flags).await)
    }

    async fn sys_shutdown(&self, fd: usize, how: usize) -> isize {
        into_return(net::shutdown(self, fd, how))
    }

    async fn sys_bind(&self, fd: usize, addr: usize, addrlen: usize) -> isize {
        into_return(net::bind(self, fd, addr, addrlen))
    }

    async fn sys_listen(&self, fd: usize, backlog: usize) -> isize {
        into_return(net::listen(self, fd, backlog))
    }

    async fn sys_socketpair(&self, domain: usize, ty: usize, proto: usize, fds: usize) -> isize {
        into_return(net::socketpair(self, domain, ty, proto, fds))
    }

    async fn sys_setsockopt(
        &self,
        fd: usize,
        level: usize,
        opt: usize,
        val: usize,
        len: usize,
    ) -> isize {
        into_return(net::setsockopt(self, fd, level, opt, val, len))
    }

    async fn sys_getsockopt(
        &self,
        fd: usize,
        level: usize,
        opt: usize,
        val: usize,
        len: usize,
    ) -> isize {
        into_return(net::getsockopt(self, fd, level, opt, val, len))
    }

    // ── process ─────────────────────────────────────────────────────

    async fn sys_fork(&self, flags: usize, tfork: usize) -> isize {
        into_return(process::fork(self, flags, tfork))
    }

    async fn sys_execv(&self, path: usize, argv: usize) -> isize {
        into_return(process::execv(self, path, argv))
    }

    async fn sys_exit(&self, status: usize) -> isize {
        process::exit(self, status);
        0
    }

    async fn sys_wait4(&self, pid: usize, status: usize, options: usize, rusage: usize) -> isize {
        into_return(process::wait4(self, pid, status, options, rusage).await)
    }

    async fn sys_kill(&self, pid: usize, sig: usize) -> isize {
        into_return(process::kill(self, pid, sig))
    }

    async fn sys_threxit(&self, status: usize) -> isize {
        process::threxit(self, status);
        0
    }

    // ── fs ──────────────────────────────────────────────────────────

    async fn sys_fcntl(&self, fd: usize, cmd: usize, arg: usize) -> isize {
        into_return(vfs::fcntl(self, fd, cmd, arg))
    }

    async fn sys_truncate(&self, path: usize, len: usize) -> isize {
        into_return(vfs::truncate(self, path, len))
    }

    async fn sys_ftruncate(&self, fd: usize, len: usize) -> isize {
        into_return(vfs::ftruncate(self, fd, len))
    }

    async fn sys_getcwd(&self, buf: usize, len: usize) -> isize {
        into_return(vfs::getcwd(self, buf, len))
    }

    async fn sys_chdir(&self, path: usize) -> isize {
        into_return(vfs::chdir(self, path))
    }

    async fn sys_rename(&self, old: usize, new: usize) -> isize {
        into_return(vfs::rename(self, old, new))
    }

    async fn sys_mkdir(&self, path: usize, mode: usize) -> isize {
        into_return(vfs::mkdir(self, path, mode))
    }

    async fn sys_link(&self, old: usize, new: usize) -> isize {
        into_return(vfs::link(self, old, new))
    }

    async fn sys_unlink(&self, path: usize, is_dir: usize) -> isize {
        into_return(vfs::unlink(self, path, is_dir))
    }

    async fn sys_mknod(&self, path: usize, mode: usize, dev: usize) -> isize {
        into_return(vfs::mknod(self, path, mode, dev))
    }

    async fn sys_sync(&self) -> isize {
        into_return(vfs::sync(self))
    }

    // ── resource ────────────────────────────────────────────────────

    async fn sys_gettimeofday(&self, tv: usize) -> isize {
        into_return(time::gettimeofday(self, tv))
    }

    async fn sys_getrlimit(&self, resource: usize, rlim: usize) -> isize {
        into_return(resource::getrlimit(self, resource, rlim))
    }

    async fn sys_setrlimit(&self, resource: usize, rlim: usize) -> isize {
        into_return(resource::setrlimit(self, resource, rlim))
    }

    async fn sys_getrusage(&self, who: usize, rusage: usize) -> isize {
        into_return(resource::getrusage(self, who, rusage))
    }

    // ── threads and time ────────────────────────────────────────────

    async fn sys_futex(
        &self,
        op: usize,
        uaddr: usize,
        uaddr2: usize,
        val: usize,
        timeout: usize,
    ) -> isize {
        into_return(time::futex(self, op, uaddr, uaddr2, val, timeout).await)
    }

    async fn sys_nanosleep(&self, req: usize, rem: usize) -> isize {
        into_return(time::nanosleep(self, req, rem).await)
    }

    // ── pipe ────────────────────────────────────────────────────────

    async fn sys_pipe2(&self, fds: usize, flags: usize) -> isize {
        into_return(io::pipe2(self, fds, flags))
    }
}
