//! ELF64 segment (program header) iteration.
//!
//! Provides [`ElfFile`] as the main entry point for parsing an ELF64 binary,
//! [`LoadSegment`] for `PT_LOAD` entries and [`TlsSegment`] for the
//! `PT_TLS` template.

use crate::header::{ELF64_PHDR_SIZE, Elf64Header, Elf64ProgramHeader, ElfError, PT_LOAD, PT_TLS};

/// Segment flag: executable.
pub const PF_X: u32 = 1;
/// Segment flag: writable.
pub const PF_W: u32 = 2;
/// Segment flag: readable.
pub const PF_R: u32 = 4;

/// A parsed ELF64 file, holding a reference to the raw data and the parsed header.
#[derive(Debug, Clone, Copy)]
pub struct ElfFile<'a> {
    data: &'a [u8],
    header: Elf64Header,
}

/// A loadable segment.
///
/// The file bytes are not part of the prefix handed to the parser, so the
/// segment is described by its file offset and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    /// Virtual address where this segment should be mapped.
    pub vaddr: u64,
    /// Offset of the segment's bytes in the file.
    pub offset: u64,
    /// Number of bytes backed by the file.
    pub filesz: u64,
    /// Total size in memory; bytes past `filesz` are zero (BSS).
    pub memsz: u64,
    /// Segment permission flags ([`PF_R`], [`PF_W`], [`PF_X`]).
    pub flags: u32,
}

impl LoadSegment {
    /// Returns `true` if the segment is mapped writable.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }
}

/// The thread-local storage template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsSegment {
    /// Virtual address of the initialization image.
    pub vaddr: u64,
    /// Bytes of initialized data (`.tdata`).
    pub filesz: u64,
    /// Total size including zero-initialized data (`.tbss`).
    pub memsz: u64,
}

impl<'a> ElfFile<'a> {
    /// Parse an ELF64 file from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ElfError`] if the header is invalid or the data is too short.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let header = Elf64Header::parse(data)?;
        Ok(Self { data, header })
    }

    /// Returns the virtual address of the entry point.
    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.header.e_entry
    }

    /// Returns the parsed ELF64 file header.
    #[must_use]
    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "the program header table was bounds-checked against data"
    )]
    fn program_headers(&self) -> impl Iterator<Item = Elf64ProgramHeader> + 'a {
        let data = self.data;
        let phoff = self.header.e_phoff as usize;
        let phentsize = usize::from(self.header.e_phentsize);
        let phnum = usize::from(self.header.e_phnum);

        (0..phnum).filter_map(move |i| {
            let offset = phoff + i * phentsize;
            if offset + ELF64_PHDR_SIZE > data.len() {
                return None;
            }
            Some(Elf64ProgramHeader::parse(data, offset))
        })
    }

    /// Returns an iterator over `PT_LOAD` segments, in table order.
    pub fn load_segments(&self) -> impl Iterator<Item = LoadSegment> + 'a {
        self.program_headers()
            .filter(|ph| ph.seg_type == PT_LOAD)
            .map(|ph| LoadSegment {
                vaddr: ph.vaddr,
                offset: ph.offset,
                filesz: ph.filesz,
                memsz: ph.memsz,
                flags: ph.flags,
            })
    }

    /// Returns the `PT_TLS` segment, if the image has one.
    #[must_use]
    pub fn tls_segment(&self) -> Option<TlsSegment> {
        self.program_headers()
            .find(|ph| ph.seg_type == PT_TLS)
            .map(|ph| TlsSegment {
                vaddr: ph.vaddr,
                filesz: ph.filesz,
                memsz: ph.memsz,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::tests::{append_phdr, make_elf_header};

    #[test]
    fn parse_valid_elf_file() {
        let buf = make_elf_header();
        let elf = ElfFile::parse(&buf).expect("valid ELF");
        assert_eq!(elf.entry_point(), 0x0040_1000);
        assert_eq!(elf.header().e_machine, 62);
    }

    #[test]
    fn no_segments_yields_empty_iterator() {
        let buf = make_elf_header();
        let elf = ElfFile::parse(&buf).expect("valid ELF");
        assert_eq!(elf.load_segments().count(), 0);
        assert!(elf.tls_segment().is_none());
    }

    #[test]
    fn one_load_segment() {
        let mut buf = make_elf_header();
        append_phdr(&mut buf, PT_LOAD, PF_R | PF_X, 0x1000, 0x40_1000, 0x80, 0x180);

        let elf = ElfFile::parse(&buf).expect("valid ELF");
        let segments: Vec<_> = elf.load_segments().collect();
        assert_eq!(
            segments,
            vec![LoadSegment {
                vaddr: 0x40_1000,
                offset: 0x1000,
                filesz: 0x80,
                memsz: 0x180,
                flags: PF_R | PF_X,
            }]
        );
        assert!(!segments[0].is_writable());
    }

    #[test]
    fn filters_non_load_and_finds_tls() {
        let mut buf = make_elf_header();
        let pt_note: u32 = 4;
        append_phdr(&mut buf, PT_LOAD, PF_R, 0, 0x40_0000, 0x200, 0x200);
        append_phdr(&mut buf, pt_note, 0, 0, 0, 0, 0);
        append_phdr(&mut buf, PT_TLS, PF_R, 0x2000, 0x60_2000, 0x10, 0x30);
        append_phdr(&mut buf, PT_LOAD, PF_R | PF_W, 0x2000, 0x60_2000, 0x40, 0x1000);

        let elf = ElfFile::parse(&buf).expect("valid ELF");
        let segments: Vec<_> = elf.load_segments().collect();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].vaddr, 0x40_0000);
        assert!(segments[1].is_writable());
        assert_eq!(segments[1].memsz, 0x1000);

        let tls = elf.tls_segment().expect("PT_TLS present");
        assert_eq!(tls.vaddr, 0x60_2000);
        assert_eq!(tls.filesz, 0x10);
        assert_eq!(tls.memsz, 0x30);
    }

    #[test]
    fn parse_rejects_invalid_data() {
        assert!(ElfFile::parse(&[]).is_err());
        assert!(ElfFile::parse(&[0u8; 32]).is_err());
    }
}
