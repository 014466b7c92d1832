//! Logical-path and backend-path helpers.
//!
//! Logical paths are relative, slash-separated segment sequences addressed
//! from a scope root. Backend paths are absolute, rooted at the configured
//! namespace prefix, and derived deterministically from logical paths.

use crate::Result;
use crate::TreeError;

/// Splits a relative path into validated segments. The empty path addresses
/// the node itself and yields no segments.
pub(crate) fn split_relative(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(TreeError::InvalidPath(path.to_string()).into());
    }
    let mut segments = Vec::new();
    for segment in path.split('/') {
        validate_segment(segment)?;
        segments.push(segment.to_string());
    }
    Ok(segments)
}

/// A segment names one tree level: non-empty, no separator, no dot aliases.
pub(crate) fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') {
        return Err(TreeError::InvalidPath(segment.to_string()).into());
    }
    Ok(())
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(TreeError::InvalidKey(key.to_string()).into());
    }
    Ok(())
}

/// Appends one segment to an absolute backend path.
pub(crate) fn join_backend(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Appends one segment to a logical path (`/` denotes the scope root).
pub(crate) fn join_logical(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Proper ancestors of an absolute backend path, shallowest first and
/// excluding the virtual root `/`. `"/a/b/c"` yields `["/a", "/a/b"]`.
pub(crate) fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            break;
        }
        current.push('/');
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

/// Splits an absolute backend path into `(parent, name)`. The namespace root's
/// parent is the virtual root `/`.
pub(crate) fn split_backend(path: &str) -> Option<(&str, &str)> {
    let (parent, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((if parent.is_empty() { "/" } else { parent }, name))
}
