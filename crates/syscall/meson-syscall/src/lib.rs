//! Single source of truth for Meson syscall definitions.
//!
//! This crate uses the `define_syscalls!` proc macro to generate:
//! - Syscall number constants (`SYS_*`)
//! - Error code constants (`E*`) and `errno_name`
//! - `#[repr(C)]` data structures shared between kernel and user space
//! - Flag and option constants
//! - `Syscall` and `SyscallGroup` enums, including the admission cost of
//!   every call
//! - (feature `kernel`) the async `SyscallHandler` trait and `dispatch()`
//!
//! Arguments arrive in RDI, RSI, RDX, RCX, R8. The number sits in RAX, and
//! the result is written back to RAX with errors encoded as `-errno`.

#![cfg_attr(not(test), no_std)]

mod status;

pub use status::{exit_status, exitsig, mkdev, signaled_status, unmkdev};

meson_syscall_macros::define_syscalls! {
    errors {
        /// `EPERM`: operation not permitted.
        EPERM = 1;
        /// `ENOENT`: no such file or directory.
        ENOENT = 2;
        /// `ESRCH`: no such process.
        ESRCH = 3;
        /// `EINTR`: the calling process was killed while the call was blocked.
        EINTR = 4;
        /// `EIO`: I/O error.
        EIO = 5;
        /// `ENOEXEC`: malformed executable.
        ENOEXEC = 8;
        /// `EBADF`: bad file descriptor.
        EBADF = 9;
        /// `ECHILD`: no child to wait for.
        ECHILD = 10;
        /// `EWOULDBLOCK`: a non-blocking operation would have to wait.
        EWOULDBLOCK = 11;
        /// `ENOMEM`: a quota or pool limit was reached.
        ENOMEM = 12;
        /// `EACCES`: permission denied.
        EACCES = 13;
        /// `EFAULT`: bad user address.
        EFAULT = 14;
        /// `EBUSY`: resource busy.
        EBUSY = 16;
        /// `EEXIST`: file exists.
        EEXIST = 17;
        /// `ENODEV`: no such device.
        ENODEV = 19;
        /// `ENOTDIR`: not a directory.
        ENOTDIR = 20;
        /// `EISDIR`: is a directory.
        EISDIR = 21;
        /// `EINVAL`: invalid argument.
        EINVAL = 22;
        /// `EMFILE`: descriptor table full.
        EMFILE = 24;
        /// `ENOSPC`: no space left.
        ENOSPC = 28;
        /// `ESPIPE`: illegal seek.
        ESPIPE = 29;
        /// `EPIPE`: broken pipe.
        EPIPE = 32;
        /// `ERANGE`: result does not fit the buffer.
        ERANGE = 34;
        /// `ENAMETOOLONG`: path too long.
        ENAMETOOLONG = 36;
        /// `ENOSYS`: function not implemented.
        ENOSYS = 38;
        /// `ENOTEMPTY`: directory not empty.
        ENOTEMPTY = 39;
        /// `ENOTSOCK`: not a socket.
        ENOTSOCK = 88;
        /// `EPROTONOSUPPORT`: protocol not supported.
        EPROTONOSUPPORT = 93;
        /// `EOPNOTSUPP`: operation not supported on this descriptor.
        EOPNOTSUPP = 95;
        /// `ECONNRESET`: connection reset by peer.
        ECONNRESET = 104;
        /// `EISCONN`: already connected.
        EISCONN = 106;
        /// `ENOTCONN`: not connected.
        ENOTCONN = 107;
        /// `ETIMEDOUT`: timed out.
        ETIMEDOUT = 110;
        /// `ECONNREFUSED`: connection refused.
        ECONNREFUSED = 111;
        /// `ENOHEAP`: the kernel heap budget could not admit this call.
        ENOHEAP = 511;
    }

    types {
        /// Seconds and nanoseconds, for `nanosleep` and futex deadlines.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        struct Timespec {
            /// Whole seconds.
            tv_sec: i64,
            /// Nanoseconds (`0..1_000_000_000`).
            tv_nsec: i64,
        }

        /// Seconds and microseconds, for `gettimeofday` and `Rusage`.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        struct Timeval {
            /// Whole seconds.
            tv_sec: i64,
            /// Microseconds (`0..1_000_000`).
            tv_usec: i64,
        }

        /// CPU time consumed, as returned by `getrusage` and `wait4`.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        struct Rusage {
            /// Time spent in user mode.
            ru_utime: Timeval,
            /// Time spent in the kernel.
            ru_stime: Timeval,
        }

        /// A resource limit pair.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        struct Rlimit {
            /// Current (soft) limit.
            rlim_cur: u64,
            /// Maximum (hard) limit.
            rlim_max: u64,
        }

        /// Arguments of a thread fork.
        #[derive(Debug, Clone, Copy, Default)]
        struct TFork {
            /// New thread's TLS base (FSBASE), 0 to inherit.
            tcb: u64,
            /// Where to store the new tid, 0 for nowhere.
            tidaddr: u64,
            /// Initial stack pointer.
            stack: u64,
        }

        /// File metadata.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        struct Stat {
            /// Device holding the file.
            dev: u64,
            /// Inode number.
            ino: u64,
            /// Type in bits 16.., permissions below.
            mode: u64,
            /// Size in bytes.
            size: u64,
            /// Device number for device nodes, see [`mkdev`].
            rdev: u64,
            /// Owner.
            uid: u64,
            /// Allocated 512-byte blocks.
            blocks: u64,
            /// Modification time, seconds.
            m_sec: u64,
            /// Modification time, nanoseconds.
            m_nsec: u64,
        }

        /// One scatter/gather element.
        #[derive(Debug, Clone, Copy, Default)]
        struct Iovec {
            /// User address.
            iov_base: u64,
            /// Length in bytes.
            iov_len: u64,
        }

        /// Message header for `sendmsg`/`recvmsg`.
        #[derive(Debug, Clone, Copy, Default)]
        struct MsgHdr {
            /// Socket address buffer.
            msg_name: u64,
            /// Socket address length.
            msg_namelen: u64,
            /// Iovec array.
            msg_iov: u64,
            /// Number of iovecs.
            msg_iovlen: u64,
            /// Ancillary data buffer.
            msg_control: u64,
            /// Ancillary data length.
            msg_controllen: u64,
            /// Flags set on receive.
            msg_flags: u64,
        }
    }

    constants {
        /// Page size of the user address space.
        PAGE_SIZE: usize = 4096;
        /// Atomic write granularity of pipes.
        PIPE_BUF: usize = 4096;
        /// Longest accepted path, in bytes.
        PATH_MAX: usize = 1024;

        /// `open` access mode: read only.
        O_RDONLY: usize = 0x0;
        /// `open` access mode: write only.
        O_WRONLY: usize = 0x1;
        /// `open` access mode: read and write.
        O_RDWR: usize = 0x2;
        /// Create the file if missing.
        O_CREAT: usize = 0x40;
        /// With `O_CREAT`, fail if the file exists.
        O_EXCL: usize = 0x80;
        /// Truncate on open.
        O_TRUNC: usize = 0x200;
        /// Append on every write.
        O_APPEND: usize = 0x400;
        /// Non-blocking I/O.
        O_NONBLOCK: usize = 0x800;
        /// Fail unless the path is a directory.
        O_DIRECTORY: usize = 0x1_0000;
        /// Close on exec.
        O_CLOEXEC: usize = 0x8_0000;

        /// `lseek` whence: absolute.
        SEEK_SET: usize = 0;
        /// `lseek` whence: relative to the current offset.
        SEEK_CUR: usize = 1;
        /// `lseek` whence: relative to the end.
        SEEK_END: usize = 2;

        /// `fcntl`: read the descriptor flags.
        F_GETFD: usize = 1;
        /// `fcntl`: write the descriptor flags.
        F_SETFD: usize = 2;
        /// `fcntl`: read the status flags.
        F_GETFL: usize = 3;
        /// `fcntl`: write the status flags.
        F_SETFL: usize = 4;
        /// Descriptor flag: close on exec.
        FD_CLOEXEC: usize = 1;

        /// Pages may be read.
        PROT_READ: usize = 0x1;
        /// Pages may be written.
        PROT_WRITE: usize = 0x2;
        /// Pages may be executed.
        PROT_EXEC: usize = 0x4;
        /// Share the mapping with other mappers.
        MAP_SHARED: usize = 0x1;
        /// Private copy-on-write mapping.
        MAP_PRIVATE: usize = 0x2;
        /// Place the mapping exactly at the hint (unsupported).
        MAP_FIXED: usize = 0x10;
        /// Mapping is not backed by a file.
        MAP_ANON: usize = 0x20;

        /// `fork` flag: new process.
        FORK_PROCESS: usize = 0x1;
        /// `fork` flag: new thread in this process.
        FORK_THREAD: usize = 0x2;

        /// `wait4` pid: any child.
        WAIT_ANY: usize = usize::MAX;
        /// `wait4` option: do not block.
        WNOHANG: usize = 0x1;
        /// `wait4` option: wait for a thread rather than a process.
        WAIT_THREAD: usize = 0x2;
        /// Status bit: terminated through `exit`. Low byte is the code.
        EXITED: usize = 0x100;
        /// Status bit: terminated by a signal, see [`exitsig`].
        SIGNALED: usize = 0x200;
        /// The only signal `kill` accepts.
        SIGKILL: usize = 9;

        /// `getrusage` who: the caller.
        RUSAGE_SELF: usize = 0;
        /// `getrusage` who: reaped children.
        RUSAGE_CHILDREN: usize = usize::MAX;
        /// Resource: open descriptors.
        RLIMIT_NOFILE: usize = 7;
        /// Unlimited resource value.
        RLIM_INFINITY: u64 = u64::MAX;

        /// Poll: data to read.
        POLLIN: u16 = 0x1;
        /// Poll: urgent data to read.
        POLLPRI: u16 = 0x2;
        /// Poll: writing will not block.
        POLLOUT: u16 = 0x4;
        /// Poll: error condition (always reported).
        POLLERR: u16 = 0x8;
        /// Poll: hang up (always reported).
        POLLHUP: u16 = 0x10;
        /// Poll: invalid descriptor (always reported).
        POLLNVAL: u16 = 0x20;
        /// Poll: priority data may be written.
        POLLWRBAND: u16 = 0x200;

        /// `futex` op: sleep while the word equals `val`.
        FUTEX_SLEEP: usize = 0;
        /// `futex` op: wake one (`val == 1`) or all (`val == u32::MAX`).
        FUTEX_WAKE: usize = 1;
        /// `futex` op: move every waiter to the futex at `uaddr2`.
        FUTEX_CNDGIVE: usize = 2;

        /// Socket domain: local.
        AF_UNIX: usize = 1;
        /// Socket type: connected byte stream.
        SOCK_STREAM: usize = 1;
        /// Socket type: datagrams.
        SOCK_DGRAM: usize = 2;
        /// Socket type flag: non-blocking.
        SOCK_NONBLOCK: usize = 0x800;
        /// Socket type flag: close on exec.
        SOCK_CLOEXEC: usize = 0x8_0000;
        /// `shutdown` how: stop reading.
        SHUT_RD: usize = 0x1;
        /// `shutdown` how: stop writing.
        SHUT_WR: usize = 0x2;
        /// `shutdown` how: both directions.
        SHUT_RDWR: usize = 0x3;
        /// Socket option level.
        SOL_SOCKET: usize = 1;
        /// Socket option: pending error.
        SO_ERROR: usize = 4;
        /// Control message: pass a descriptor.
        SCM_RIGHTS: usize = 1;

        /// Device major: console.
        D_CONSOLE: usize = 1;
        /// Device major: null device.
        D_DEVNULL: usize = 2;
        /// Device major: UNIX datagram socket node.
        D_SUD: usize = 6;
        /// Device major: UNIX stream socket node.
        D_SUS: usize = 7;

        /// Inode type: regular file (mode bits 16..).
        I_FILE: u64 = 1;
        /// Inode type: directory.
        I_DIR: u64 = 2;
        /// Inode type: device or pipe.
        I_DEV: u64 = 3;
    }

    /// File I/O and metadata.
    group vfs(0..9) {
        /// Read from a descriptor.
        #[cost(8192)]
        fn read(fd: usize, buf: usize, len: usize) = 0;

        /// Write to a descriptor.
        #[cost(8192)]
        fn write(fd: usize, buf: usize, len: usize) = 1;

        /// Open a path relative to the cwd.
        #[cost(8192)]
        fn open(path: usize, flags: usize, mode: usize) = 2;

        /// Close a descriptor.
        #[cost(512)]
        fn close(fd: usize) = 3;

        /// Stat a path.
        #[cost(4096)]
        fn stat(path: usize, st: usize) = 4;

        /// Stat a descriptor.
        #[cost(512)]
        fn fstat(fd: usize, st: usize) = 5;

        /// Wait for readiness on a set of descriptors.
        #[cost(16384)]
        fn poll(fds: usize, nfds: usize, timeout_ms: usize) = 7;

        /// Move a descriptor's offset.
        #[cost(256)]
        fn lseek(fd: usize, off: usize, whence: usize) = 8;
    }

    /// Address space management.
    group memory(9..12) {
        /// Map pages; `prot_flags` packs prot in the high 32 bits.
        #[cost(16384)]
        fn mmap(addr: usize, len: usize, prot_flags: usize, fd: usize, offset: usize) = 0;

        /// Unmap pages.
        #[cost(4096)]
        fn munmap(addr: usize, len: usize) = 2;
    }

    /// Signals (unsupported beyond SIGKILL).
    group signal(13..14) {
        /// Install a signal handler.
        #[reserved(reason = "signal delivery is not supported")]
        #[cost(128)]
        fn sigaction(sig: usize, act: usize, oact: usize) = 0;
    }

    /// Vectored and positional I/O.
    group vio(17..22) {
        /// Read at an offset.
        #[cost(8192)]
        fn pread(fd: usize, buf: usize, len: usize, off: usize) = 0;

        /// Write at an offset.
        #[cost(8192)]
        fn pwrite(fd: usize, buf: usize, len: usize, off: usize) = 1;

        /// Scatter read.
        #[cost(8192)]
        fn readv(fd: usize, iov: usize, iovcnt: usize) = 2;

        /// Gather write.
        #[cost(8192)]
        fn writev(fd: usize, iov: usize, iovcnt: usize) = 3;

        /// Check that a path exists.
        #[cost(4096)]
        fn access(path: usize, mode: usize) = 4;
    }

    /// Descriptor table manipulation.
    group fd(33..35) {
        /// Duplicate `old` onto `new`.
        #[cost(512)]
        fn dup2(old: usize, new: usize) = 0;

        /// Block until killed.
        #[cost(256)]
        fn pause() = 1;
    }

    /// Process identity.
    group ident(39..40) {
        /// Return the caller's pid.
        #[cost(128)]
        fn getpid() = 0;
    }

    /// UNIX-domain sockets.
    group net(41..56) {
        /// Create a socket.
        #[cost(4096)]
        fn socket(domain: usize, ty: usize, proto: usize) = 0;

        /// Connect to a bound path.
        #[cost(16384)]
        fn connect(fd: usize, addr: usize, addrlen: usize) = 1;

        /// Accept a connection.
        #[cost(16384)]
        fn accept(fd: usize, addr: usize, addrlen_ptr: usize) = 2;

        /// Send a datagram; `flags_len` packs the length in the high 32 bits.
        #[cost(8192)]
        fn sendto(fd: usize, buf: usize, flags_len: usize, addr: usize, addrlen: usize) = 3;

        /// Receive a datagram; `flags_len` packs the length in the high 32 bits.
        #[cost(8192)]
        fn recvfrom(fd: usize, buf: usize, flags_len: usize, addr: usize, addrlen_ptr: usize) = 4;

        /// Send with ancillary data.
        #[cost(8192)]
        fn sendmsg(fd: usize, msg: usize, flags: usize) = 5;

        /// Receive with ancillary data.
        #[cost(8192)]
        fn recvmsg(fd: usize, msg: usize, flags: usize) = 6;

        /// Shut down one or both directions.
        #[cost(512)]
        fn shutdown(fd: usize, how: usize) = 7;

        /// Bind a socket to a path.
        #[cost(8192)]
        fn bind(fd: usize, addr: usize, addrlen: usize) = 8;

        /// Start accepting connections.
        #[cost(8192)]
        fn listen(fd: usize, backlog: usize) = 9;

        /// Create a connected pair.
        #[cost(16384)]
        fn socketpair(domain: usize, ty: usize, proto: usize, fds: usize) = 12;

        /// Set a socket option.
        #[cost(512)]
        fn setsockopt(fd: usize, level: usize, opt: usize, val: usize, len: usize) = 13;

        /// Read a socket option.
        #[cost(512)]
        fn getsockopt(fd: usize, level: usize, opt: usize, val: usize, len: usize) = 14;
    }

    /// Process lifecycle.
    group process(57..63) {
        /// Create a process or a thread.
        #[cost(65536)]
        fn fork(flags: usize, tfork: usize) = 0;

        /// Replace the process image.
        #[cost(131_072)]
        fn execv(path: usize, argv: usize) = 2;

        /// Terminate the process.
        #[cost(4096)]
        fn exit(status: usize) = 3;

        /// Reap a child process or thread.
        #[cost(1024)]
        fn wait4(pid: usize, status: usize, options: usize, rusage: usize) = 4;

        /// Kill a process.
        #[cost(512)]
        fn kill(pid: usize, sig: usize) = 5;
    }

    /// Namespace operations.
    group fs(72..89) {
        /// Descriptor control.
        #[cost(512)]
        fn fcntl(fd: usize, cmd: usize, arg: usize) = 0;

        /// Truncate a path.
        #[cost(8192)]
        fn truncate(path: usize, len: usize) = 4;

        /// Truncate a descriptor.
        #[cost(8192)]
        fn ftruncate(fd: usize, len: usize) = 5;

        /// Copy the cwd path out.
        #[cost(2048)]
        fn getcwd(buf: usize, len: usize) = 7;

        /// Change the cwd.
        #[cost(8192)]
        fn chdir(path: usize) = 8;

        /// Rename a path.
        #[cost(8192)]
        fn rename(old: usize, new: usize) = 10;

        /// Create a directory.
        #[cost(8192)]
        fn mkdir(path: usize, mode: usize) = 11;

        /// Create a hard link.
        #[cost(8192)]
        fn link(old: usize, new: usize) = 14;

        /// Remove a path; `is_dir` selects directory removal.
        #[cost(8192)]
        fn unlink(path: usize, is_dir: usize) = 15;
    }

    /// Time and resource accounting.
    group resource(96..99) {
        /// Wall-clock time.
        #[cost(256)]
        fn gettimeofday(tv: usize) = 0;

        /// Read a resource limit.
        #[cost(256)]
        fn getrlimit(resource: usize, rlim: usize) = 1;

        /// Read CPU usage.
        #[cost(256)]
        fn getrusage(who: usize, rusage: usize) = 2;
    }

    /// Parent identity.
    group parent(110..111) {
        /// Return the parent's pid.
        #[cost(128)]
        fn getppid() = 0;
    }

    /// Device nodes.
    group node(133..134) {
        /// Create a device node.
        #[cost(8192)]
        fn mknod(path: usize, mode: usize, dev: usize) = 0;
    }

    /// System control.
    group sys(160..170) {
        /// Set a resource limit.
        #[cost(256)]
        fn setrlimit(resource: usize, rlim: usize) = 0;

        /// Flush the file service.
        #[cost(4096)]
        fn sync() = 2;

        /// Restart the machine.
        #[reserved(reason = "platform reset belongs to the boot layer")]
        #[cost(128)]
        fn reboot() = 9;
    }

    /// Threads and futexes.
    group thread(186..203) {
        /// Return the caller's tid.
        #[cost(128)]
        fn gettid() = 0;

        /// Futex sleep/wake/requeue.
        #[cost(4096)]
        fn futex(op: usize, uaddr: usize, uaddr2: usize, val: usize, timeout: usize) = 16;
    }

    /// Sleeping.
    group time(230..231) {
        /// Sleep for a relative duration.
        #[cost(1024)]
        fn nanosleep(req: usize, rem: usize) = 0;
    }

    /// Pipes.
    group pipe(293..294) {
        /// Create a pipe; writes two 4-byte fds.
        #[cost(8192)]
        fn pipe2(fds: usize, flags: usize) = 0;
    }

    /// Meson extensions.
    group ext(31337..31340) {
        /// Profiling control.
        #[reserved(reason = "profiling hooks live outside the syscall core")]
        #[cost(128)]
        fn prof(kind: usize, events: usize, flags: usize, period: usize) = 0;

        /// Terminate only the calling thread.
        #[cost(4096)]
        fn threxit(status: usize) = 1;

        /// Kernel statistics.
        #[reserved(reason = "statistics counters live outside the syscall core")]
        #[cost(128)]
        fn info(which: usize) = 2;
    }
}
