//! POSIX path helpers for overlay paths.
//!
//! Overlay paths are always absolute, normalized and free of trailing slashes.

/// Normalize a path by resolving `.` and `..` and removing redundant slashes.
///
/// `..` at the root stays at the root, and relative input is anchored at `/`.
pub fn normalize(path: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }
    if components.is_empty() {
        return String::from("/");
    }
    let mut result = String::with_capacity(path.len());
    for component in components {
        result.push('/');
        result.push_str(component);
    }
    result
}

/// Parent directory of a normalized path. The parent of `/` is `/`.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

/// Last component of a normalized path, empty for `/`.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

pub fn join(base: &str, name: &str) -> String {
    if name.starts_with('/') {
        return normalize(name);
    }
    if base == "/" || base.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Every ancestor of `path` from its parent up to and including `/`.
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = path;
    while current != "/" {
        current = dirname(current);
        out.push(current);
    }
    out
}

/// Whether `path` is `base` or lies beneath it.
pub fn is_under(path: &str, base: &str) -> bool {
    if base == "/" {
        return true;
    }
    path == base || (path.starts_with(base) && path.as_bytes().get(base.len()) == Some(&b'/'))
}
