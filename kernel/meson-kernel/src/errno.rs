//! Kernel error numbers.
//!
//! Handlers work in `Result<T, Errno>` and only turn the error into the
//! negative return value at the dispatch boundary. Subsystem errors
//! ([`VmError`], [`ElfError`], [`FsError`](crate::fs::FsError)) convert
//! through `From`, so `?` is enough to cross a layer.

use core::fmt;

use meson_elf::ElfError;
use meson_mm::VmError;

/// A positive errno value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(isize);

/// Result type used throughout the kernel.
pub type KResult<T> = Result<T, Errno>;

macro_rules! errnos {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(
                #[doc = concat!("`", stringify!($name), "`.")]
                pub const $name: Self = Self(meson_syscall::$name);
            )*
        }
    };
}

errnos!(
    EPERM,
    ENOENT,
    ESRCH,
    EINTR,
    EIO,
    ENOEXEC,
    EBADF,
    ECHILD,
    EWOULDBLOCK,
    ENOMEM,
    EACCES,
    EFAULT,
    EBUSY,
    EEXIST,
    ENODEV,
    ENOTDIR,
    EISDIR,
    EINVAL,
    EMFILE,
    ENOSPC,
    ESPIPE,
    EPIPE,
    ERANGE,
    ENAMETOOLONG,
    ENOSYS,
    ENOTEMPTY,
    ENOTSOCK,
    EPROTONOSUPPORT,
    EOPNOTSUPP,
    ECONNRESET,
    EISCONN,
    ENOTCONN,
    ETIMEDOUT,
    ECONNREFUSED,
    ENOHEAP,
);

impl Errno {
    /// Wraps a raw positive errno value.
    pub const fn new(raw: isize) -> Self {
        Self(raw)
    }

    /// The positive errno value.
    pub const fn raw(self) -> isize {
        self.0
    }

    /// The value written into RAX: `-errno`.
    pub const fn as_return(self) -> isize {
        -self.0
    }

    /// Symbolic name, if the value is a known errno.
    pub const fn name(self) -> Option<&'static str> {
        meson_syscall::errno_name(self.0)
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "Errno({})", self.0),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<VmError> for Errno {
    fn from(err: VmError) -> Self {
        match err {
            VmError::NoMemory => Self::ENOMEM,
            VmError::Fault | VmError::Segv => Self::EFAULT,
            VmError::Invalid => Self::EINVAL,
            VmError::NameTooLong => Self::ENAMETOOLONG,
        }
    }
}

impl From<ElfError> for Errno {
    fn from(_: ElfError) -> Self {
        Self::ENOEXEC
    }
}

/// Collapses a handler result into the syscall return value.
#[expect(
    clippy::cast_possible_wrap,
    reason = "successful results are counts, ids and addresses below isize::MAX"
)]
pub fn into_return(res: KResult<usize>) -> isize {
    match res {
        Ok(v) => v as isize,
        Err(e) => e.as_return(),
    }
}
