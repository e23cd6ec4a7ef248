//! Version derivation from source URLs.
//!
//! Covers the URL shapes release archives usually take:
//! `.../archive/v0.3.tar.gz`, `.../name-1.2.0.tgz`, `.../download/v2.1/name.tar.xz`.

const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar.gz", ".tar.xz", ".tar.bz2", ".tar.zst", ".tgz", ".txz", ".tbz2", ".tar", ".zip", ".gz",
];

/// Derive a version from `url`, using `name` to strip a `<name>-` prefix.
///
/// Returns `None` if no path segment yields a version-looking token.
pub fn derive_version(url: &str, name: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let mut segments = path.trim_end_matches('/').rsplit('/');

    let last = segments.next()?;
    if let Some(v) = version_from_segment(strip_archive_extension(last), name) {
        return Some(v);
    }
    segments
        .next()
        .and_then(|parent| version_from_segment(parent, name))
}

fn strip_archive_extension(segment: &str) -> &str {
    let lower = segment.to_ascii_lowercase();
    for ext in ARCHIVE_EXTENSIONS {
        if lower.ends_with(ext) {
            return &segment[..segment.len() - ext.len()];
        }
    }
    segment
}

fn version_from_segment(segment: &str, name: &str) -> Option<String> {
    let mut rest = segment;
    if !name.is_empty() {
        if let Some(stripped) = rest.strip_prefix(name) {
            if stripped.is_empty() || stripped.starts_with(['-', '_']) {
                rest = stripped.trim_start_matches(['-', '_']);
            }
        }
    }

    let bytes = rest.as_bytes();
    let start = (0..bytes.len()).find(|&i| {
        if !bytes[i].is_ascii_digit() {
            return false;
        }
        match i {
            0 => true,
            1 => bytes[0] == b'v' || is_separator(bytes[0]),
            _ => {
                is_separator(bytes[i - 1]) || (bytes[i - 1] == b'v' && is_separator(bytes[i - 2]))
            }
        }
    })?;

    let candidate = &rest[start..];
    let valid = candidate
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b'+'));
    if valid && !candidate.is_empty() {
        Some(candidate.to_owned())
    } else {
        None
    }
}

fn is_separator(b: u8) -> bool {
    b == b'-' || b == b'_'
}
