//! Core types and synchronization primitives for the Meson kernel.
//!
//! Everything here is host-testable: identifiers for kernel objects, the
//! leveled `klog!` logging front end, and the async-aware sync primitives
//! (spin locks, token wait queues, counting semaphores, bounded channels and
//! oneshot replies) that the memory manager and the syscall core build on.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod id;
pub mod log;
pub mod sync;
