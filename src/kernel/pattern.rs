//! Glob pattern compilation shared by the capability matcher and audit queries.
//!
//! Semantics: `*` matches any single segment (no separator crossing),
//! `**` matches any remainder including separators. Operation patterns are
//! segmented by `.` (`tab.*` matches `tab.navigate`, not `tab.extract.links`);
//! resource patterns by `:` (`tab:*` matches `tab:42`).

use regex::Regex;

/// Compile a glob pattern into an anchored regex.
///
/// `sep` is the segment separator the single-star wildcard must not cross.
pub fn compile_glob(pattern: &str, sep: char) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str(&format!("[^{}]*", regex::escape(&sep.to_string())));
                }
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

/// Glob matcher for operation names (`.`-separated segments).
pub fn op_glob(pattern: &str) -> Result<Regex, regex::Error> {
    compile_glob(pattern, '.')
}

/// Glob matcher for resource ids (`:`-separated segments).
pub fn resource_glob(pattern: &str) -> Result<Regex, regex::Error> {
    compile_glob(pattern, ':')
}

/// Glob matcher for URLs (`/`-separated segments).
pub fn url_glob(pattern: &str) -> Result<Regex, regex::Error> {
    compile_glob(pattern, '/')
}
