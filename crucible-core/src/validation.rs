use crate::error::BrokerError;

/// Validate a client-supplied workspace path.
///
/// Accepted paths are absolute, live strictly under `/workspace/`, contain
/// no `.` / `..` components, and no characters that would survive into a
/// shell word (quotes, backslashes, control bytes). The path is used
/// verbatim in exec'd commands inside the worker, so this is the single
/// choke point for path hygiene.
pub fn validate_workspace_path(path: &str) -> Result<(), BrokerError> {
    let invalid = |detail: &str| {
        Err(BrokerError::InvalidArgument(format!(
            "invalid workspace path {path:?}: {detail}"
        )))
    };

    let Some(rest) = path.strip_prefix("/workspace/") else {
        return invalid("must start with /workspace/");
    };
    if rest.is_empty() || rest.ends_with('/') {
        return invalid("must name a file");
    }
    if rest.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return invalid("must not contain empty, `.` or `..` segments");
    }
    if path
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\'' || b == b'"' || b == b'\\')
    {
        return invalid("contains control or quoting characters");
    }
    Ok(())
}
