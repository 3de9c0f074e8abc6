use super::protocol::ProtocolError;

/// Accepts only clean relative paths: no leading `/`, no empty, `.` or `..`
/// segments, no NUL or backslash, and nothing that percent-decodes into
/// something else.
///
/// # Errors
/// Returns `InvalidPath` naming the rejected input.
pub fn validate_relative_path(raw: &str) -> Result<&str, ProtocolError> {
    let reject = || ProtocolError::InvalidPath(raw.to_string());

    if raw.is_empty() || raw.starts_with('/') || raw.contains(['\0', '\\']) {
        return Err(reject());
    }
    if raw.contains('%') {
        let decoded = urlencoding::decode(raw).map_err(|_| reject())?;
        if decoded != raw {
            return Err(reject());
        }
    }
    if raw.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(reject());
    }
    if raw.split('/').next().is_some_and(|first| first.len() == 2 && first.ends_with(':')) {
        return Err(reject());
    }
    Ok(raw)
}

/// Joins a validated relative path under the staging root.
///
/// # Errors
/// Returns `InvalidPath` when `relative` is not a clean relative path.
pub fn resolve(staging_root: &str, relative: &str) -> Result<String, ProtocolError> {
    let relative = validate_relative_path(relative)?;
    Ok(format!("{}/{relative}", staging_root.trim_end_matches('/')))
}
