//! User I/O cursors.
//!
//! Descriptor operations never see raw user pointers. They move bytes
//! through a [`UserIo`] cursor: a [`UserBuf`] over one user range, a
//! [`UserIovec`] over a scatter/gather list, or a [`KernelBuf`] when the
//! kernel itself is the reader (exec header reads, tests). Every cursor
//! remembers how far it got, so a short copy can resume where it stopped.
//!
//! ABI structs cross the boundary through [`AbiStruct`], which encodes them
//! field by field in little-endian order.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use meson_mm::{AddressSpace, USEREND};
use meson_syscall::{Iovec, MsgHdr, Rlimit, Rusage, Stat, TFork, Timespec, Timeval};

use crate::config::IOV_MAX;
use crate::errno::{Errno, KResult};

/// Checks that `[addr, addr + len)` lies in the user half.
///
/// # Errors
///
/// [`Errno::EFAULT`] on overflow or a range reaching kernel space.
pub fn check_range(addr: usize, len: usize) -> KResult<()> {
    match addr.checked_add(len) {
        Some(end) if end <= USEREND => Ok(()),
        _ => Err(Errno::EFAULT),
    }
}

/// A resumable byte cursor over user (or kernel) memory.
pub trait UserIo: Send {
    /// Bytes not yet transferred.
    fn remain(&self) -> usize;

    /// Total bytes the cursor covers.
    fn total(&self) -> usize;

    /// Copies from the cursor into `dst` (user to kernel). Returns the
    /// number of bytes copied.
    ///
    /// # Errors
    ///
    /// [`Errno::EFAULT`] if the user memory is not readable.
    fn read_into(&mut self, dst: &mut [u8]) -> KResult<usize>;

    /// Copies `src` into the cursor (kernel to user). Returns the number of
    /// bytes copied.
    ///
    /// # Errors
    ///
    /// [`Errno::EFAULT`] if the user memory is not writable.
    fn write_from(&mut self, src: &[u8]) -> KResult<usize>;
}

/// One contiguous user range.
pub struct UserBuf {
    aspace: Arc<AddressSpace>,
    base: usize,
    len: usize,
    off: usize,
}

impl UserBuf {
    /// Creates a cursor over `[base, base + len)`.
    ///
    /// # Errors
    ///
    /// [`Errno::EFAULT`] if the range leaves the user half.
    pub fn new(aspace: Arc<AddressSpace>, base: usize, len: usize) -> KResult<Self> {
        check_range(base, len)?;
        Ok(Self {
            aspace,
            base,
            len,
            off: 0,
        })
    }

    /// A cursor that covers nothing.
    pub fn empty(aspace: Arc<AddressSpace>) -> Self {
        Self {
            aspace,
            base: 0,
            len: 0,
            off: 0,
        }
    }
}

impl UserIo for UserBuf {
    fn remain(&self) -> usize {
        self.len - self.off
    }

    fn total(&self) -> usize {
        self.len
    }

    fn read_into(&mut self, dst: &mut [u8]) -> KResult<usize> {
        let n = dst.len().min(self.remain());
        self.aspace.copy_in(self.base + self.off, &mut dst[..n])?;
        self.off += n;
        Ok(n)
    }

    fn write_from(&mut self, src: &[u8]) -> KResult<usize> {
        let n = src.len().min(self.remain());
        self.aspace.copy_out(self.base + self.off, &src[..n])?;
        self.off += n;
        Ok(n)
    }
}

/// A scatter/gather list of user ranges.
pub struct UserIovec {
    aspace: Arc<AddressSpace>,
    iovs: Vec<(usize, usize)>,
    idx: usize,
    off: usize,
    total: usize,
    done: usize,
}

impl UserIovec {
    /// Reads `count` [`Iovec`] records from `iov_ptr`.
    ///
    /// # Errors
    ///
    /// [`Errno::EINVAL`] for more than [`IOV_MAX`] records,
    /// [`Errno::EFAULT`] for unreadable records or ranges leaving the user
    /// half.
    pub fn new(aspace: Arc<AddressSpace>, iov_ptr: usize, count: usize) -> KResult<Self> {
        if count > IOV_MAX {
            return Err(Errno::EINVAL);
        }
        let mut iovs = Vec::with_capacity(count);
        let mut total = 0usize;
        for i in 0..count {
            let iov: Iovec = read_struct(&aspace, iov_ptr + i * Iovec::SIZE)?;
            let base = usize::try_from(iov.iov_base).map_err(|_| Errno::EFAULT)?;
            let len = usize::try_from(iov.iov_len).map_err(|_| Errno::EINVAL)?;
            check_range(base, len)?;
            total = total.checked_add(len).ok_or(Errno::EINVAL)?;
            iovs.push((base, len));
        }
        Ok(Self {
            aspace,
            iovs,
            idx: 0,
            off: 0,
            total,
            done: 0,
        })
    }

    fn transfer(
        &mut self,
        want: usize,
        mut op: impl FnMut(&AddressSpace, usize, usize, usize) -> KResult<()>,
    ) -> KResult<usize> {
        let mut moved = 0;
        while moved < want && self.idx < self.iovs.len() {
            let (base, len) = self.iovs[self.idx];
            let n = (len - self.off).min(want - moved);
            op(&self.aspace, base + self.off, moved, n)?;
            moved += n;
            self.off += n;
            self.done += n;
            if self.off == len {
                self.idx += 1;
                self.off = 0;
            }
        }
        Ok(moved)
    }
}

impl UserIo for UserIovec {
    fn remain(&self) -> usize {
        self.total - self.done
    }

    fn total(&self) -> usize {
        self.total
    }

    fn read_into(&mut self, dst: &mut [u8]) -> KResult<usize> {
        let want = dst.len().min(self.remain());
        self.transfer(want, |aspace, va, at, n| {
            Ok(aspace.copy_in(va, &mut dst[at..at + n])?)
        })
    }

    fn write_from(&mut self, src: &[u8]) -> KResult<usize> {
        let want = src.len().min(self.remain());
        self.transfer(want, |aspace, va, at, n| {
            Ok(aspace.copy_out(va, &src[at..at + n])?)
        })
    }
}

/// A kernel-owned buffer behind the [`UserIo`] interface.
#[derive(Debug, Clone, Default)]
pub struct KernelBuf {
    data: Vec<u8>,
    off: usize,
}

impl KernelBuf {
    /// A zeroed buffer of `len` bytes, for receiving.
    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![0; len],
            off: 0,
        }
    }

    /// A buffer holding `bytes`, for sending.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            off: 0,
        }
    }

    /// The bytes transferred so far.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.off]
    }
}

impl UserIo for KernelBuf {
    fn remain(&self) -> usize {
        self.data.len() - self.off
    }

    fn total(&self) -> usize {
        self.data.len()
    }

    fn read_into(&mut self, dst: &mut [u8]) -> KResult<usize> {
        let n = dst.len().min(self.remain());
        dst[..n].copy_from_slice(&self.data[self.off..self.off + n]);
        self.off += n;
        Ok(n)
    }

    fn write_from(&mut self, src: &[u8]) -> KResult<usize> {
        let n = src.len().min(self.remain());
        self.data[self.off..self.off + n].copy_from_slice(&src[..n]);
        self.off += n;
        Ok(n)
    }
}

// ── ABI structs ─────────────────────────────────────────────────────

/// A `#[repr(C)]` ABI struct made only of 8-byte integer fields.
pub trait AbiStruct: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decodes from exactly [`SIZE`](Self::SIZE) bytes.
    fn decode(words: &[u64]) -> Self;

    /// Encodes into [`SIZE`](Self::SIZE) / 8 words.
    fn encode(&self) -> Vec<u64>;
}

/// Reads an ABI struct from user memory.
///
/// # Errors
///
/// [`Errno::EFAULT`] if the memory is not readable.
pub fn read_struct<T: AbiStruct>(aspace: &AddressSpace, va: usize) -> KResult<T> {
    check_range(va, T::SIZE)?;
    let mut bytes = vec![0u8; T::SIZE];
    aspace.copy_in(va, &mut bytes)?;
    let words: Vec<u64> = bytes
        .chunks_exact(8)
        .map(|c| {
            let mut w = [0u8; 8];
            w.copy_from_slice(c);
            u64::from_le_bytes(w)
        })
        .collect();
    Ok(T::decode(&words))
}

/// Writes an ABI struct to user memory.
///
/// # Errors
///
/// [`Errno::EFAULT`] if the memory is not writable.
pub fn write_struct<T: AbiStruct>(aspace: &AddressSpace, va: usize, value: &T) -> KResult<()> {
    check_range(va, T::SIZE)?;
    let bytes: Vec<u8> = value
        .encode()
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
    aspace.copy_out(va, &bytes)?;
    Ok(())
}

#[expect(
    clippy::cast_possible_wrap,
    reason = "signed ABI fields are stored as raw 64-bit words"
)]
const fn signed(word: u64) -> i64 {
    word as i64
}

#[expect(
    clippy::cast_sign_loss,
    reason = "signed ABI fields are stored as raw 64-bit words"
)]
const fn raw(v: i64) -> u64 {
    v as u64
}

impl AbiStruct for Timespec {
    const SIZE: usize = 16;

    fn decode(w: &[u64]) -> Self {
        Self {
            tv_sec: signed(w[0]),
            tv_nsec: signed(w[1]),
        }
    }

    fn encode(&self) -> Vec<u64> {
        vec![raw(self.tv_sec), raw(self.tv_nsec)]
    }
}

impl AbiStruct for Timeval {
    const SIZE: usize = 16;

    fn decode(w: &[u64]) -> Self {
        Self {
            tv_sec: signed(w[0]),
            tv_usec: signed(w[1]),
        }
    }

    fn encode(&self) -> Vec<u64> {
        vec![raw(self.tv_sec), raw(self.tv_usec)]
    }
}

impl AbiStruct for Rusage {
    const SIZE: usize = 32;

    fn decode(w: &[u64]) -> Self {
        Self {
            ru_utime: Timeval::decode(&w[0..2]),
            ru_stime: Timeval::decode(&w[2..4]),
        }
    }

    fn encode(&self) -> Vec<u64> {
        let mut out = self.ru_utime.encode();
        out.extend(self.ru_stime.encode());
        out
    }
}

impl AbiStruct for Rlimit {
    const SIZE: usize = 16;

    fn decode(w: &[u64]) -> Self {
        Self {
            rlim_cur: w[0],
            rlim_max: w[1],
        }
    }

    fn encode(&self) -> Vec<u64> {
        vec![self.rlim_cur, self.rlim_max]
    }
}

impl AbiStruct for TFork {
    const SIZE: usize = 24;

    fn decode(w: &[u64]) -> Self {
        Self {
            tcb: w[0],
            tidaddr: w[1],
            stack: w[2],
        }
    }

    fn encode(&self) -> Vec<u64> {
        vec![self.tcb, self.tidaddr, self.stack]
    }
}

impl AbiStruct for Stat {
    const SIZE: usize = 72;

    fn decode(w: &[u64]) -> Self {
        Self {
            dev: w[0],
            ino: w[1],
            mode: w[2],
            size: w[3],
            rdev: w[4],
            uid: w[5],
            blocks: w[6],
            m_sec: w[7],
            m_nsec: w[8],
        }
    }

    fn encode(&self) -> Vec<u64> {
        vec![
            self.dev,
            self.ino,
            self.mode,
            self.size,
            self.rdev,
            self.uid,
            self.blocks,
            self.m_sec,
            self.m_nsec,
        ]
    }
}

impl AbiStruct for Iovec {
    const SIZE: usize = 16;

    fn decode(w: &[u64]) -> Self {
        Self {
            iov_base: w[0],
            iov_len: w[1],
        }
    }

    fn encode(&self) -> Vec<u64> {
        vec![self.iov_base, self.iov_len]
    }
}

impl AbiStruct for MsgHdr {
    const SIZE: usize = 56;

    fn decode(w: &[u64]) -> Self {
        Self {
            msg_name: w[0],
            msg_namelen: w[1],
            msg_iov: w[2],
            msg_iovlen: w[3],
            msg_control: w[4],
            msg_controllen: w[5],
            msg_flags: w[6],
        }
    }

    fn encode(&self) -> Vec<u64> {
        vec![
            self.msg_name,
            self.msg_namelen,
            self.msg_iov,
            self.msg_iovlen,
            self.msg_control,
            self.msg_controllen,
            self.msg_flags,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meson_mm::{HeapPageProvider, NoShootdown, RegionPerms, USERMIN, VmLimits};

    fn aspace() -> Arc<AddressSpace> {
        let a = AddressSpace::new(
            Arc::new(HeapPageProvider::new(16)),
            Arc::new(NoShootdown),
            VmLimits::UNLIMITED,
        );
        a.map_anon(
            USERMIN,
            0x4000,
            RegionPerms::USER | RegionPerms::WRITE,
            false,
            false,
        )
        .unwrap();
        Arc::new(a)
    }

    #[test]
    fn userbuf_resumes_after_partial_copy() {
        let a = aspace();
        let mut buf = UserBuf::new(a.clone(), USERMIN + 10, 6).unwrap();
        assert_eq!(buf.write_from(b"abcd").unwrap(), 4);
        assert_eq!(buf.write_from(b"efgh").unwrap(), 2);
        assert_eq!(buf.remain(), 0);
        let mut out = [0u8; 6];
        a.copy_in(USERMIN + 10, &mut out).unwrap();
        assert_eq!(&out, b"abcdef");
    }

    #[test]
    fn userbuf_rejects_kernel_range() {
        assert!(UserBuf::new(aspace(), USEREND - 4, 8).is_err());
    }

    #[test]
    fn iovec_gathers_in_order() {
        let a = aspace();
        a.copy_out(USERMIN, b"hello").unwrap();
        a.copy_out(USERMIN + 0x1000, b" world").unwrap();
        let table = USERMIN + 0x2000;
        for (i, (base, len)) in [(USERMIN, 5u64), (USERMIN + 0x1000, 6u64)].iter().enumerate() {
            let iov = Iovec {
                iov_base: *base as u64,
                iov_len: *len,
            };
            write_struct(&a, table + i * Iovec::SIZE, &iov).unwrap();
        }
        let mut iov = UserIovec::new(a, table, 2).unwrap();
        assert_eq!(iov.total(), 11);
        let mut out = [0u8; 11];
        assert_eq!(iov.read_into(&mut out).unwrap(), 11);
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn iovec_count_is_bounded() {
        assert_eq!(
            UserIovec::new(aspace(), USERMIN, IOV_MAX + 1).err(),
            Some(Errno::EINVAL)
        );
    }

    #[test]
    fn structs_use_abi_layout() {
        let a = aspace();
        let ts = Timespec {
            tv_sec: 3,
            tv_nsec: -1,
        };
        write_struct(&a, USERMIN, &ts).unwrap();
        assert_eq!(a.read_u64(USERMIN).unwrap(), 3);
        assert_eq!(a.read_u64(USERMIN + 8).unwrap(), u64::MAX);
        assert_eq!(read_struct::<Timespec>(&a, USERMIN).unwrap(), ts);
    }
}
