//! Saved user register state.

use core::ops::{Index, IndexMut};

/// `RFLAGS.IF`: interrupts enabled.
pub const RFLAGS_IF: usize = 0x200;

/// User code segment selector (GDT slot 5, RPL 3).
pub const USER_CS: usize = (5 << 3) | 3;

/// User data segment selector (GDT slot 6, RPL 3).
pub const USER_SS: usize = (6 << 3) | 3;

/// The registers the syscall core reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Reg {
    /// Syscall number in, return value out.
    Rax,
    /// First argument.
    Rdi,
    /// Second argument.
    Rsi,
    /// Third argument.
    Rdx,
    /// Fourth argument.
    Rcx,
    /// Fifth argument.
    R8,
    /// Sixth argument (unused by the ABI).
    R9,
    /// Instruction pointer.
    Rip,
    /// Code segment.
    Cs,
    /// Flags.
    Rflags,
    /// Stack pointer.
    Rsp,
    /// Stack segment.
    Ss,
    /// TLS base.
    FsBase,
}

/// Number of saved registers.
pub const TF_REGS: usize = 13;

/// A thread's saved registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame([usize; TF_REGS]);

impl TrapFrame {
    /// A zeroed frame.
    pub const fn new() -> Self {
        Self([0; TF_REGS])
    }

    /// The syscall number and its five arguments.
    pub fn syscall(&self) -> (usize, [usize; 5]) {
        (
            self[Reg::Rax],
            [
                self[Reg::Rdi],
                self[Reg::Rsi],
                self[Reg::Rdx],
                self[Reg::Rcx],
                self[Reg::R8],
            ],
        )
    }

    /// Loads a syscall request, as the trap entry would.
    pub fn set_syscall(&mut self, nr: usize, args: [usize; 5]) {
        self[Reg::Rax] = nr;
        self[Reg::Rdi] = args[0];
        self[Reg::Rsi] = args[1];
        self[Reg::Rdx] = args[2];
        self[Reg::Rcx] = args[3];
        self[Reg::R8] = args[4];
    }
}

impl Index<Reg> for TrapFrame {
    type Output = usize;

    fn index(&self, reg: Reg) -> &usize {
        &self.0[reg as usize]
    }
}

impl IndexMut<Reg> for TrapFrame {
    fn index_mut(&mut self, reg: Reg) -> &mut usize {
        &mut self.0[reg as usize]
    }
}
