//! Intermediate representation for the syscall DSL.

use proc_macro2::Span;
use syn::{Attribute, Ident, LitInt, LitStr, Type};

/// Admission cost charged for calls without a `#[cost(N)]` attribute.
pub(crate) const DEFAULT_COST: usize = 1024;

/// Top-level definition from the DSL.
pub(crate) struct SyscallDefs {
    pub errors: Vec<ErrorDef>,
    pub types: Vec<TypeDef>,
    pub constants: Vec<ConstDef>,
    pub groups: Vec<GroupDef>,
}

/// An error code definition: `ENOENT = 2;`
pub(crate) struct ErrorDef {
    pub attrs: Vec<Attribute>,
    pub name: Ident,
    pub value: LitInt,
}

/// A `#[repr(C)]` struct definition.
pub(crate) struct TypeDef {
    pub attrs: Vec<Attribute>,
    pub name: Ident,
    pub fields: Vec<FieldDef>,
}

/// A struct field.
pub(crate) struct FieldDef {
    pub attrs: Vec<Attribute>,
    pub name: Ident,
    pub ty: Type,
}

/// A named constant: `FORK_PROCESS: usize = 0x1;`
pub(crate) struct ConstDef {
    pub attrs: Vec<Attribute>,
    pub name: Ident,
    pub ty: Type,
    pub value: syn::Expr,
}

/// A syscall group: `group vfs(0..9) { ... }`
pub(crate) struct GroupDef {
    pub attrs: Vec<Attribute>,
    pub name: Ident,
    pub range_start: usize,
    pub range_end: usize,
    pub syscalls: Vec<SyscallDef>,
}

/// A single syscall: `#[cost(4096)] fn read(fd: usize, buf: usize, len: usize) = 0;`
pub(crate) struct SyscallDef {
    pub attrs: Vec<Attribute>,
    pub name: Ident,
    pub args: Vec<ArgDef>,
    pub offset: usize,
    pub cost: Option<usize>,
    pub reserved: Option<ReservedInfo>,
    pub span: Span,
}

/// Argument to a syscall.
pub(crate) struct ArgDef {
    pub name: Ident,
    pub ty: Type,
}

/// Metadata for `#[reserved(reason = "...")]`.
pub(crate) struct ReservedInfo {
    pub reason: LitStr,
}

impl SyscallDef {
    /// Compute the absolute syscall number given the group's start.
    pub fn number(&self, group_start: usize) -> usize {
        group_start + self.offset
    }

    /// The admission cost, falling back to [`DEFAULT_COST`].
    pub fn cost(&self) -> usize {
        self.cost.unwrap_or(DEFAULT_COST)
    }
}
