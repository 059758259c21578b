//! Input validation for identifiers that end up as path components.
//!
//! All validation is pure (no side effects). Every function returns Ok(()) or
//! Err(String) with a human-readable message.

/// Maximum length of a single path segment we create.
pub const SEGMENT_MAX_LEN: usize = 128;

/// Maximum length of an entry file path inside a repository.
pub const ENTRY_FILE_MAX_LEN: usize = 1024;

/// Validate a single path segment (directory or file name).
///
/// Rules:
/// - Not empty, at most 128 characters
/// - Only ascii alphanumerics, `.`, `_`, `-`
/// - Must not start with `.` (rejects `.`, `..` and hidden names)
pub fn validate_path_segment(segment: &str, what: &str) -> Result<(), String> {
    if segment.is_empty() {
        return Err(format!("{what} is empty"));
    }
    if segment.len() > SEGMENT_MAX_LEN {
        return Err(format!(
            "{what} too long ({} > {SEGMENT_MAX_LEN})",
            segment.len()
        ));
    }
    if segment.starts_with('.') {
        return Err(format!("{what} '{segment}' must not start with '.'"));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(format!(
            "{what} '{segment}' contains invalid characters (allowed: A-Z, a-z, 0-9, ., _, -)"
        ));
    }
    Ok(())
}

/// Validate an artifact identifier.
pub fn validate_artifact_id(id: &str) -> Result<(), String> {
    validate_path_segment(id, "artifact id")
}

/// Validate a hub-escaped user name.
///
/// Escaped names are already filesystem safe; this guards against a
/// front-end that forgot to escape.
pub fn validate_escaped_name(name: &str) -> Result<(), String> {
    validate_path_segment(name, "escaped user name")
}

/// Validate a repository-relative entry file such as `notebooks/index.ipynb`.
///
/// Rules:
/// - Relative, at most 1024 characters
/// - No empty, `.` or `..` components
/// - No control characters or backslashes
pub fn validate_entry_file(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("entry file is empty".into());
    }
    if path.len() > ENTRY_FILE_MAX_LEN {
        return Err(format!(
            "entry file too long ({} > {ENTRY_FILE_MAX_LEN})",
            path.len()
        ));
    }
    if path.starts_with('/') {
        return Err(format!("entry file '{path}' must be relative"));
    }
    if path.chars().any(|c| c.is_control() || c == '\\') {
        return Err("entry file contains control characters or backslashes".into());
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(format!(
                "entry file '{path}' contains an empty, '.' or '..' component"
            ));
        }
    }
    Ok(())
}
