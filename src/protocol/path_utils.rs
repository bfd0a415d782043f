// Path normalization utilities
// Relative paths inside a capsule always use '/' and never start with "./" or "/"

use std::path::{Component, Path, PathBuf};

/// Render a path relative to `root` in capsule form (`dir/file.txt`)
///
/// Returns `None` when the path is outside `root`, is not valid UTF-8, or
/// contains a newline (which the line-oriented artifact cannot carry).
pub fn relative_key(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str()?),
            Component::CurDir => continue,
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    let key = parts.join("/");
    if key.contains('\n') || key.contains('\r') {
        return None;
    }
    Some(key)
}

/// Strip leading "./" and "/" runs and trailing "/" from a pattern or key
pub fn normalize_key(raw: &str) -> String {
    let mut s = raw.trim();
    loop {
        if let Some(rest) = s.strip_prefix("./") {
            s = rest;
        } else if let Some(rest) = s.strip_prefix('/') {
            s = rest;
        } else {
            break;
        }
    }
    s.trim_end_matches('/').to_string()
}

/// Join a capsule key onto a directory using platform separators
pub fn key_to_path(root: &Path, key: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in key.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

/// Reject keys that would escape the target directory
pub fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('/')
        && key.split('/').all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Uppercase alphanumeric rendering of a key, usable inside a delimiter token
pub fn sanitize_for_token(key: &str) -> String {
    let mut out: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .take(48)
        .collect();
    if out.is_empty() {
        out.push_str("FILE");
    } else if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, 'F');
    }
    out
}

/// Format permission bits as 3 or 4 octal digits (`644`, `4755`)
pub fn format_mode(mode: u32) -> String {
    format!("{:03o}", mode & 0o7777)
}

/// Parse 3-4 octal digits back into permission bits
pub fn parse_mode(text: &str) -> Option<u32> {
    let text = text.trim();
    if !(3..=4).contains(&text.len()) {
        return None;
    }
    u32::from_str_radix(text, 8).ok()
}
