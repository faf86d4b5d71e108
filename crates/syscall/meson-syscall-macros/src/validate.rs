//! Compile-time validation of the syscall DSL.
//!
//! Checks for duplicate numbers, offset range violations, error positivity,
//! and admission costs.

use std::collections::{HashMap, HashSet};

use crate::model::SyscallDefs;

/// Validate the parsed definitions and return compile errors if any.
pub(crate) fn validate(defs: &SyscallDefs) -> Result<(), Vec<syn::Error>> {
    let mut errors = Vec::new();

    // Error values: integer, positive, unique; names unique.
    let mut error_names = HashSet::new();
    let mut error_values: HashMap<isize, &syn::Ident> = HashMap::new();
    for err in &defs.errors {
        if !error_names.insert(err.name.to_string()) {
            errors.push(syn::Error::new(
                err.name.span(),
                format!("duplicate error name `{}`", err.name),
            ));
        }

        let val: isize = match err.value.base10_parse() {
            Ok(val) => val,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        if val <= 0 {
            errors.push(syn::Error::new(
                err.name.span(),
                format!("error code `{}` must be positive, got {val}", err.name),
            ));
        }
        if let Some(prev) = error_values.insert(val, &err.name) {
            errors.push(syn::Error::new(
                err.name.span(),
                format!("error code value {val} already used by `{prev}`"),
            ));
        }
    }

    // Validate groups and syscalls.
    let mut all_numbers: HashMap<usize, String> = HashMap::new();

    for group in &defs.groups {
        if group.range_start >= group.range_end {
            errors.push(syn::Error::new(
                group.name.span(),
                format!(
                    "group `{}`: range start ({}) must be less than end ({})",
                    group.name, group.range_start, group.range_end
                ),
            ));
            continue;
        }

        let group_size = group.range_end - group.range_start;

        for syscall in &group.syscalls {
            if syscall.offset >= group_size {
                errors.push(syn::Error::new(
                    syscall.span,
                    format!(
                        "syscall `{}`: offset {} exceeds group `{}` size ({})",
                        syscall.name, syscall.offset, group.name, group_size
                    ),
                ));
            }

            let number = syscall.number(group.range_start);
            if let Some(prev_name) = all_numbers.insert(number, syscall.name.to_string()) {
                errors.push(syn::Error::new(
                    syscall.span,
                    format!(
                        "syscall `{}` number {number} collides with `{prev_name}`",
                        syscall.name
                    ),
                ));
            }

            // Max 5 for the RDI, RSI, RDX, RCX, R8 register convention.
            if syscall.args.len() > 5 {
                errors.push(syn::Error::new(
                    syscall.span,
                    format!(
                        "syscall `{}` has {} arguments, max is 5",
                        syscall.name,
                        syscall.args.len()
                    ),
                ));
            }

            if syscall.cost == Some(0) {
                errors.push(syn::Error::new(
                    syscall.span,
                    format!("syscall `{}` has a zero admission cost", syscall.name),
                ));
            }
        }
    }

    // Group ranges must not overlap.
    let mut group_ranges: Vec<(usize, usize, String)> = defs
        .groups
        .iter()
        .map(|g| (g.range_start, g.range_end, g.name.to_string()))
        .collect();
    group_ranges.sort_by_key(|&(start, _, _)| start);

    for pair in group_ranges.windows(2) {
        let (_, end_a, ref name_a) = pair[0];
        let (start_b, _, ref name_b) = pair[1];
        if end_a > start_b {
            errors.push(syn::Error::new(
                proc_macro2::Span::call_site(),
                format!("group `{name_a}` range overlaps with group `{name_b}`"),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
