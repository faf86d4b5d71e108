//! Path resolution against a working directory.

use alloc::string::String;
use alloc::vec::Vec;

/// Split a path into its components, filtering empty segments.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Returns `true` if the path starts with `/`.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Resolves `path` against `cwd` into a canonical absolute path.
///
/// `.` components are dropped and `..` pops one component; `..` at the
/// root stays at the root.
#[must_use]
pub fn resolve(cwd: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let rel = if is_absolute(path) {
        None
    } else {
        Some(cwd)
    };
    for comp in rel.into_iter().flat_map(components).chain(components(path)) {
        match comp {
            "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(comp),
        }
    }
    if parts.is_empty() {
        return String::from("/");
    }
    let mut out = String::new();
    for comp in parts {
        out.push('/');
        out.push_str(comp);
    }
    out
}

/// Splits a canonical path into its parent and final component.
///
/// Returns `None` for the root.
#[must_use]
pub fn split_last(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let name = &trimmed[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Some((parent, name))
}
