use super::{Error, Result};

/// normalize cleans a virtual path: collapses `.` segments, resolves `..`,
/// deduplicates interior slashes and strips the trailing slash (except for
/// the root itself). The result always starts with `/`.
pub fn normalize(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(Error::invalid_argument("normalize", path, "path is empty"));
    }

    if !path.starts_with('/') {
        return Err(Error::invalid_argument(
            "normalize",
            path,
            "path must be absolute",
        ));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }

    if parts.is_empty() {
        return Ok("/".into());
    }

    Ok(format!("/{}", parts.join("/")))
}

/// parent of a normalized path. The parent of the root is the root.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        None | Some(0) => "/",
        Some(idx) => &path[..idx],
    }
}

/// base returns the final segment of a normalized path, or "/" for the root.
pub fn base(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) if path.len() > 1 => &path[idx + 1..],
        _ => "/",
    }
}

/// first_segment returns the leading segment of a normalized non-root path.
pub fn first_segment(path: &str) -> &str {
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    }
}
