//! Minimal ELF64 parser for the Meson exec path.
//!
//! Parses the ELF64 file header and program headers from a raw byte prefix
//! of an executable using safe field extraction (`from_le_bytes`). Only the
//! program-header view is exposed: `PT_LOAD` segments as file offset and
//! size pairs (the loader maps them from the page cache) and the optional
//! `PT_TLS` template. No unsafe code, no allocations.
//!
//! # Usage
//!
//! ```ignore
//! use meson_elf::ElfFile;
//!
//! let elf = ElfFile::parse(&first_512_bytes)?;
//! for seg in elf.load_segments() {
//!     // map [seg.offset, seg.offset + seg.filesz) at seg.vaddr
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod header;
pub mod segment;

pub use header::{Elf64Header, ElfError};
pub use segment::{ElfFile, LoadSegment, PF_R, PF_W, PF_X, TlsSegment};
