//! The file service seam.
//!
//! The syscall core has no filesystem of its own. Namespace operations go
//! to a [`FileService`], and an opened file comes back as an
//! `Arc<dyn FdOps>` that may expose a page cache for `mmap` and exec. Paths
//! are canonicalized against the caller's cwd before they reach the
//! service.

pub mod path;

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use meson_mm::AddressSpace;
use meson_syscall::{
    O_APPEND, O_CLOEXEC, O_CREAT, O_DIRECTORY, O_EXCL, O_NONBLOCK, O_RDWR, O_TRUNC, O_WRONLY,
    PATH_MAX, Stat,
};

use crate::errno::{Errno, KResult};
use crate::fd::FdOps;

/// Errors reported by a [`FileService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No such file or directory.
    NotFound,
    /// The path already exists.
    AlreadyExists,
    /// A path component is not a directory.
    NotADirectory,
    /// The operation needs a non-directory.
    IsADirectory,
    /// The directory still has entries.
    NotEmpty,
    /// A path or name is too long.
    NameTooLong,
    /// The filesystem is full.
    NoSpace,
    /// The backing store failed.
    IoError,
    /// A malformed request.
    InvalidArgument,
    /// The caller may not do this.
    PermissionDenied,
    /// The file has no backing device.
    NoDevice,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("no such file or directory"),
            Self::AlreadyExists => f.write_str("file exists"),
            Self::NotADirectory => f.write_str("not a directory"),
            Self::IsADirectory => f.write_str("is a directory"),
            Self::NotEmpty => f.write_str("directory not empty"),
            Self::NameTooLong => f.write_str("name too long"),
            Self::NoSpace => f.write_str("no space left"),
            Self::IoError => f.write_str("I/O error"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::PermissionDenied => f.write_str("permission denied"),
            Self::NoDevice => f.write_str("no such device"),
        }
    }
}

impl From<FsError> for Errno {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound => Errno::ENOENT,
            FsError::AlreadyExists => Errno::EEXIST,
            FsError::NotADirectory => Errno::ENOTDIR,
            FsError::IsADirectory => Errno::EISDIR,
            FsError::NotEmpty => Errno::ENOTEMPTY,
            FsError::NameTooLong => Errno::ENAMETOOLONG,
            FsError::NoSpace => Errno::ENOSPC,
            FsError::IoError => Errno::EIO,
            FsError::InvalidArgument => Errno::EINVAL,
            FsError::PermissionDenied => Errno::EPERM,
            FsError::NoDevice => Errno::ENODEV,
        }
    }
}

bitflags::bitflags! {
    /// `open` flags. Read-only is the empty set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: usize {
        /// Write only.
        const WRONLY = O_WRONLY;
        /// Read and write.
        const RDWR = O_RDWR;
        /// Create the file if missing.
        const CREAT = O_CREAT;
        /// With `CREAT`, fail if it exists.
        const EXCL = O_EXCL;
        /// Truncate on open.
        const TRUNC = O_TRUNC;
        /// Writes go to the end.
        const APPEND = O_APPEND;
        /// Non-blocking descriptor.
        const NONBLOCK = O_NONBLOCK;
        /// Fail unless the path is a directory.
        const DIRECTORY = O_DIRECTORY;
        /// Close on exec.
        const CLOEXEC = O_CLOEXEC;
    }
}

impl OpenFlags {
    /// Whether the descriptor may be read.
    pub fn readable(self) -> bool {
        !self.contains(Self::WRONLY)
    }

    /// Whether the descriptor may be written.
    pub fn writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

/// The filesystem, as the syscall core sees it.
///
/// Every path handed in is canonical and absolute; `cwd` is passed along
/// for services that keep per-directory state.
pub trait FileService: Send + Sync {
    /// Opens (or with `CREAT`, creates) `path`. A non-zero `major` creates
    /// a device node `(major, minor)`.
    ///
    /// # Errors
    ///
    /// Any [`FsError`] the service reports.
    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: usize,
        cwd: &str,
        major: usize,
        minor: usize,
    ) -> Result<Arc<dyn FdOps>, FsError>;

    /// Returns the metadata of `path`.
    ///
    /// # Errors
    ///
    /// Any [`FsError`] the service reports.
    fn stat(&self, path: &str, cwd: &str) -> Result<Stat, FsError>;

    /// Renames `old` to `new`.
    ///
    /// # Errors
    ///
    /// Any [`FsError`] the service reports.
    fn rename(&self, old: &str, new: &str, cwd: &str) -> Result<(), FsError>;

    /// Creates a hard link `new` to `old`.
    ///
    /// # Errors
    ///
    /// Any [`FsError`] the service reports.
    fn link(&self, old: &str, new: &str, cwd: &str) -> Result<(), FsError>;

    /// Removes `path`; `dir` selects directory removal.
    ///
    /// # Errors
    ///
    /// Any [`FsError`] the service reports.
    fn unlink(&self, path: &str, cwd: &str, dir: bool) -> Result<(), FsError>;

    /// Creates the directory `path`.
    ///
    /// # Errors
    ///
    /// Any [`FsError`] the service reports.
    fn mkdir(&self, path: &str, mode: usize, cwd: &str) -> Result<(), FsError>;

    /// Flushes everything to the backing store.
    ///
    /// # Errors
    ///
    /// Any [`FsError`] the service reports.
    fn sync(&self) -> Result<(), FsError>;
}

/// A process working directory: the canonical path plus the open handle
/// that keeps it alive.
pub struct Cwd {
    /// Canonical absolute path.
    pub path: String,
    /// The open directory, if one was opened.
    pub handle: Option<Arc<dyn FdOps>>,
}

impl Cwd {
    /// The root directory, with no handle.
    pub fn root() -> Self {
        Self {
            path: String::from("/"),
            handle: None,
        }
    }
}

/// Reads a user path and canonicalizes it against `cwd`.
///
/// # Errors
///
/// [`Errno::EFAULT`] for a bad pointer, [`Errno::ENAMETOOLONG`] past
/// [`PATH_MAX`] bytes, [`Errno::ENOENT`] for an empty path,
/// [`Errno::EINVAL`] if it is not UTF-8.
pub fn user_path(aspace: &AddressSpace, va: usize, cwd: &str) -> KResult<String> {
    let raw = aspace.read_cstr(va, PATH_MAX)?;
    if raw.is_empty() {
        return Err(Errno::ENOENT);
    }
    let s = core::str::from_utf8(&raw).map_err(|_| Errno::EINVAL)?;
    Ok(path::resolve(cwd, s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn errors_map_to_errno() {
        assert_eq!(Errno::from(FsError::NotFound), Errno::ENOENT);
        assert_eq!(Errno::from(FsError::AlreadyExists), Errno::EEXIST);
        assert_eq!(Errno::from(FsError::NoDevice), Errno::ENODEV);
        assert_eq!(format!("{}", FsError::NotEmpty), "directory not empty");
    }

    #[test]
    fn access_modes() {
        assert!(OpenFlags::empty().readable());
        assert!(!OpenFlags::empty().writable());
        assert!(!OpenFlags::WRONLY.readable());
        assert!(OpenFlags::RDWR.readable() && OpenFlags::RDWR.writable());
    }
}
