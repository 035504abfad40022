//! The file I/O protocol spoken to a worker: plain shell commands over the
//! orchestrator's exec channel. Binary safety comes from streaming bytes on
//! stdin/stdout rather than through argument or heredoc encoding.

use std::collections::BTreeMap;

use tracing::warn;

use crucible_core::ContentHash;

use crate::error::WorkspaceError;

/// Hash every regular file under `/workspace`, one `<hash>  <path>` line
/// per file.
#[must_use]
pub fn list_command() -> Vec<String> {
    vec![
        "sh".to_owned(),
        "-c".to_owned(),
        "find /workspace -type f -print0 | xargs -0 -r sha256sum".to_owned(),
    ]
}

/// Write stdin to `path`, creating parent directories.
#[must_use]
pub fn upload_command(path: &str) -> Vec<String> {
    let parent = match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent,
        _ => "/workspace",
    };
    vec![
        "sh".to_owned(),
        "-c".to_owned(),
        format!(
            "mkdir -p -- {} && cat > {}",
            shell_quote(parent),
            shell_quote(path)
        ),
    ]
}

/// Stream a file's bytes to stdout. Plain argv, no shell: safe for any
/// path a listing can produce.
#[must_use]
pub fn download_command(path: &str) -> Vec<String> {
    vec!["cat".to_owned(), path.to_owned()]
}

/// Remove a file, tolerating absence.
#[must_use]
pub fn remove_command(path: &str) -> Vec<String> {
    vec![
        "rm".to_owned(),
        "-f".to_owned(),
        "--".to_owned(),
        path.to_owned(),
    ]
}

/// Single-quote a string for `sh -c`.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Parse `sha256sum` output into a path → hash map.
///
/// Lines for names `sha256sum` had to escape (embedded newlines or
/// backslashes) start with `\`; such files cannot be addressed reliably
/// and are skipped with a warning.
pub fn parse_listing(stdout: &[u8]) -> Result<BTreeMap<String, ContentHash>, WorkspaceError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|e| WorkspaceError::Listing(format!("non-utf8 listing: {e}")))?;

    let mut files = BTreeMap::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with('\\') {
            warn!(line, "skipping unaddressable file name in listing");
            continue;
        }
        let (digest, rest) = line
            .split_at_checked(64)
            .ok_or_else(|| WorkspaceError::Listing(format!("short listing line: {line:?}")))?;
        let hash = ContentHash::parse(digest)
            .map_err(|_| WorkspaceError::Listing(format!("bad digest in line: {line:?}")))?;
        // `sha256sum` separates with two spaces (or ` *` in binary mode).
        let path = rest
            .strip_prefix("  ")
            .or_else(|| rest.strip_prefix(" *"))
            .ok_or_else(|| WorkspaceError::Listing(format!("malformed listing line: {line:?}")))?;
        if !path.starts_with('/') {
            return Err(WorkspaceError::Listing(format!(
                "relative path in listing: {path:?}"
            )));
        }
        files.insert(path.to_owned(), hash);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_survives_embedded_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn upload_command_creates_parents() {
        let argv = upload_command("/workspace/data/raw/x.csv");
        assert_eq!(argv[0], "sh");
        assert_eq!(argv[1], "-c");
        assert_eq!(
            argv[2],
            "mkdir -p -- '/workspace/data/raw' && cat > '/workspace/data/raw/x.csv'"
        );
    }

    #[test]
    fn parse_listing_reads_sha256sum_output() {
        let digest = ContentHash::of(b"x");
        let out = format!("{digest}  /workspace/a.txt\n{digest}  /workspace/b/c.txt\n");
        let files = parse_listing(out.as_bytes()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files["/workspace/a.txt"], digest);
        assert_eq!(files["/workspace/b/c.txt"], digest);
    }

    #[test]
    fn parse_listing_accepts_binary_mode_marker() {
        let digest = ContentHash::of(b"x");
        let out = format!("{digest} */workspace/a.bin\n");
        let files = parse_listing(out.as_bytes()).unwrap();
        assert_eq!(files["/workspace/a.bin"], digest);
    }

    #[test]
    fn parse_listing_skips_escaped_names() {
        let digest = ContentHash::of(b"x");
        let out = format!("\\{digest}  /workspace/a\\nb.txt\n{digest}  /workspace/ok.txt\n");
        let files = parse_listing(out.as_bytes()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key("/workspace/ok.txt"));
    }

    #[test]
    fn parse_listing_rejects_garbage() {
        assert!(parse_listing(b"nonsense\n").is_err());
        assert!(parse_listing(b"").unwrap().is_empty());
    }
}
