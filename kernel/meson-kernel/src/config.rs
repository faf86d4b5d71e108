//! Kernel configuration.
//!
//! Fixed ABI sizes are constants. Everything a deployment may want to tune
//! lives in [`KernelConfig`], which is handed to
//! [`Kernel::new`](crate::Kernel::new).

use meson_core::log::LogLevel;

/// Most verbose level emitted by default.
pub const MAX_LOG_LEVEL: LogLevel = LogLevel::Debug;

/// Capacity of a pipe's byte ring.
pub const PIPE_CAPACITY: usize = 4096;

/// Descriptors that may wait in one pipe's mailbox.
pub const PIPE_MAILBOX: usize = 10;

/// Capacity of a datagram socket's payload ring.
pub const BUD_RING_SIZE: usize = 512;

/// Datagram records per ring.
pub const BUD_RECORDS: usize = BUD_RING_SIZE / 10;

/// Room a datagram socket needs before it polls writable.
pub const BUD_POLL_WRITE: usize = 32;

/// Largest stream listener backlog.
pub const LISTEN_BACKLOG_MAX: usize = 64;

/// Longest socket address accepted, exclusive.
pub const SOCKADDR_MAX: usize = 256;

/// Longest `sendmsg` address.
pub const MSG_NAME_MAX: usize = 64;

/// Longest `sendmsg` control buffer.
pub const MSG_CONTROL_MAX: usize = 256;

/// Poll waiters an object remembers at once.
pub const POLLERS_MAX: usize = 10;

/// Most iovecs accepted by `readv`/`writev`.
pub const IOV_MAX: usize = 10;

/// Most `argv` entries accepted by `execv`.
pub const ARGV_MAX: usize = 64;

/// Header bytes `execv` reads before parsing.
pub const EXEC_HEADER_SIZE: usize = 512;

/// Usable exec stack pages (a guard page sits below them).
pub const EXEC_STACK_PAGES: usize = 6;

/// Exec stack pages mapped before the image runs.
pub const EXEC_STACK_EAGER: usize = 2;

/// Where `execv` starts looking for the stack.
pub const EXEC_STACK_HINT: usize = 0xff << 39;

/// Per-process resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ulimit {
    /// Pages the address space may cover.
    pub pages: usize,
    /// Regions the address space may hold.
    pub regions: usize,
    /// Open descriptors (`RLIMIT_NOFILE`).
    pub nofile: usize,
}

impl Default for Ulimit {
    fn default() -> Self {
        Self {
            pages: 1 << 18,
            regions: 1024,
            nofile: 256,
        }
    }
}

/// Tunable kernel limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Admission budget in bytes of kernel heap.
    pub heap_budget: usize,
    /// Physical pages the hosted page provider hands out.
    pub page_limit: usize,
    /// Live pipes system-wide.
    pub max_pipes: usize,
    /// Live sockets system-wide.
    pub max_sockets: usize,
    /// Live futex arbiters system-wide.
    pub max_futexes: usize,
    /// Sleepers (and timeouts) one futex holds.
    pub futex_waiters: usize,
    /// Depth of a futex arbiter's command channel.
    pub futex_channel: usize,
    /// Live processes system-wide.
    pub max_procs: usize,
    /// Limits given to the first process.
    pub ulimit: Ulimit,
    /// Largest `poll` record array, in bytes.
    pub poll_buf_size: usize,
    /// Picoseconds per TSC cycle, published in the exec trailer.
    pub ps_per_cycle: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            heap_budget: 64 << 20,
            page_limit: 1 << 16,
            max_pipes: 1024,
            max_sockets: 1024,
            max_futexes: 1024,
            futex_waiters: 10,
            futex_channel: 16,
            max_procs: 1024,
            ulimit: Ulimit::default(),
            poll_buf_size: 4096,
            ps_per_cycle: 500,
        }
    }
}
