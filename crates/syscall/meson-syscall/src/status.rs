//! Encodings shared by kernel and user space: wait status words and device
//! numbers.

use crate::{EXITED, SIGNALED};

/// Encode a signal number into the signal field of a wait status.
#[must_use]
pub const fn exitsig(sig: usize) -> usize {
    sig << 10
}

/// Status word for a thread that called `exit(code)`.
#[must_use]
pub const fn exit_status(code: usize) -> usize {
    (code & 0xff) | EXITED
}

/// Status word for a thread terminated by `sig`.
#[must_use]
pub const fn signaled_status(sig: usize) -> usize {
    SIGNALED | exitsig(sig)
}

/// Build a device number: `((major << 8) | minor) << 32`.
///
/// Returns `None` if `minor` does not fit in 8 bits.
#[must_use]
pub const fn mkdev(major: usize, minor: usize) -> Option<u64> {
    if minor > 0xff {
        return None;
    }
    Some((((major << 8) | minor) as u64) << 32)
}

/// Split a device number into `(major, minor)`.
#[must_use]
#[expect(
    clippy::cast_possible_truncation,
    reason = "device numbers are built from usize halves"
)]
pub const fn unmkdev(dev: u64) -> (usize, usize) {
    let packed = (dev >> 32) as usize;
    (packed >> 8, packed & 0xff)
}
