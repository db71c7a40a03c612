//! URI path utilities.
//!
//! Everything here is lexical: no filesystem access, no configuration.
//! The normalizer implements the decoded-dot-segment semantics (an
//! encoded `%2e%2e` resolves like a literal `..`), so a path that
//! survives [`normalize_path`] contains no dot segment in any spelling.

use crate::options::{NormalizeFlags, UnescapeFlags};

/// RFC 3986 unreserved characters.
fn is_unreserved(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'-' | b'.' | b'_' | b'~')
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Normalize a URI path: remove `.` segments, resolve `..` against the
/// preceding segment, optionally collapse duplicate slashes and decode
/// percent-escapes of unreserved characters.
///
/// Returns `None` when the path is invalid under `flags`: a relative path
/// without [`NormalizeFlags::ALLOW_RELATIVE`], a `..` that would climb
/// past the root with [`NormalizeFlags::NOT_ABOVE_ROOT`], or a malformed
/// escape while [`NormalizeFlags::DECODE_UNRESERVED`] is in effect.
#[must_use]
pub fn normalize_path(path: &str, flags: NormalizeFlags) -> Option<String> {
    let decoded;
    let path = if flags.contains(NormalizeFlags::DECODE_UNRESERVED) {
        decoded = decode_unreserved(path)?;
        decoded.as_str()
    } else {
        path
    };

    let bytes = path.as_bytes();
    let rooted = bytes.first() == Some(&b'/');
    if !rooted && !flags.contains(NormalizeFlags::ALLOW_RELATIVE) {
        return None;
    }

    let merge = flags.contains(NormalizeFlags::MERGE_SLASHES);
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    if rooted {
        out.push(b'/');
        i = 1;
    }

    while i < bytes.len() {
        if out.is_empty() || out.ends_with(b"/") {
            // At a segment boundary.
            if bytes[i] == b'/' {
                if merge {
                    i += 1;
                    continue;
                }
            } else if bytes[i] == b'.' {
                let next = bytes.get(i + 1).copied();
                if next.is_none() || next == Some(b'/') {
                    // "." segment
                    i += if next.is_some() { 2 } else { 1 };
                    continue;
                }
                if next == Some(b'.') {
                    let after = bytes.get(i + 2).copied();
                    if after.is_none() || after == Some(b'/') {
                        // ".." segment
                        if !pop_segment(&mut out, rooted)
                            && flags.contains(NormalizeFlags::NOT_ABOVE_ROOT)
                        {
                            return None;
                        }
                        i += if after.is_some() { 3 } else { 2 };
                        continue;
                    }
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8(out).ok()
}

/// Decode `%XX` escapes of unreserved characters, leaving all other
/// escapes in place. `None` on a `%` not followed by two hex digits.
fn decode_unreserved(path: &str) -> Option<String> {
    let bytes = path.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let high = bytes.get(i + 1).copied().and_then(hex_value)?;
            let low = bytes.get(i + 2).copied().and_then(hex_value)?;
            let c = high * 16 + low;
            if is_unreserved(c) {
                out.push(c);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).ok()
}

/// Drop the trailing segment of `out` (which ends at a segment boundary).
/// Returns false when there is nothing left to pop.
fn pop_segment(out: &mut Vec<u8>, rooted: bool) -> bool {
    let floor = usize::from(rooted);
    if out.len() <= floor {
        return false;
    }
    out.pop();
    while out.len() > floor && !out.ends_with(b"/") {
        out.pop();
    }
    true
}

/// Why [`unescape_url`] rejected a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnescapeFailure {
    /// `%` not followed by two hex digits.
    BadEscape,
    /// Encoded `/` under [`UnescapeFlags::FORBID_SLASHES`].
    EncodedSlash,
    /// Encoded NUL byte.
    EncodedNul,
}

/// Decode the percent-escapes of a URI path.
///
/// Escapes of unreserved characters are left alone under
/// [`UnescapeFlags::KEEP_UNRESERVED`] (the normalizer already decoded
/// them); encoded slashes follow the flags.
///
/// # Errors
///
/// See [`UnescapeFailure`].
pub fn unescape_url(path: &str, flags: UnescapeFlags) -> Result<String, UnescapeFailure> {
    let bytes = path.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let high = bytes.get(i + 1).copied().and_then(hex_value);
        let low = bytes.get(i + 2).copied().and_then(hex_value);
        let (Some(high), Some(low)) = (high, low) else {
            return Err(UnescapeFailure::BadEscape);
        };
        let c = high * 16 + low;
        if c == 0 {
            return Err(UnescapeFailure::EncodedNul);
        }
        if c == b'/' {
            if flags.contains(UnescapeFlags::FORBID_SLASHES) {
                return Err(UnescapeFailure::EncodedSlash);
            }
            if flags.contains(UnescapeFlags::KEEP_SLASHES) {
                out.extend_from_slice(&bytes[i..i + 3]);
                i += 3;
                continue;
            }
        } else if flags.contains(UnescapeFlags::KEEP_UNRESERVED) && is_unreserved(c) {
            out.extend_from_slice(&bytes[i..i + 3]);
            i += 3;
            continue;
        }
        out.push(c);
        i += 3;
    }
    String::from_utf8(out).map_err(|_| UnescapeFailure::BadEscape)
}

/// Characters that survive [`escape_uri`] unescaped, besides alphanumerics.
const ESCAPE_PATH_SAFE: &[u8] = b"$-_.+!*'(),:@&=/~";

/// Percent-encode a filesystem-ish path for use as a URI path.
#[must_use]
pub fn escape_uri(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for &b in path.as_bytes() {
        if b.is_ascii_alphanumeric() || ESCAPE_PATH_SAFE.contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Split a request-target into path and query.
pub(crate) fn split_uri(uri: &str) -> (String, Option<String>) {
    match uri.split_once('?') {
        Some((path, "")) => (path.to_string(), None),
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (uri.to_string(), None),
    }
}

/// Number of `/` separators in `path`.
pub(crate) fn count_dirs(path: &str) -> usize {
    path.bytes().filter(|&b| b == b'/').count()
}

/// The prefix of `path` up to and including its final `/`.
pub(crate) fn dirstr_parent(path: &str) -> String {
    match path.rfind('/') {
        Some(i) => path[..=i].to_string(),
        None => String::new(),
    }
}

/// The component after the final `/` of `path`.
pub(crate) fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Join two path halves with exactly one `/` between them.
pub(crate) fn full_path(head: &str, tail: &str) -> String {
    if head.is_empty() {
        return format!("/{tail}");
    }
    if head.ends_with('/') {
        format!("{head}{tail}")
    } else {
        format!("{head}/{tail}")
    }
}

/// Collapse runs of `/` into a single one.
pub(crate) fn no2slash(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

/// Offset in `uri` at which the trailing `path_info` begins.
pub(crate) fn find_path_info(uri: &str, path_info: &str) -> usize {
    uri.len().saturating_sub(path_info.len())
}

/// Lexically canonicalize an absolute filesystem path. `None` when the
/// path is relative or resolves above the root.
pub(crate) fn absolute_path(path: &str) -> Option<String> {
    normalize_path(path, NormalizeFlags::NOT_ABOVE_ROOT | NormalizeFlags::MERGE_SLASHES)
}

/// Merge `add` onto `base`, requiring the result to stay at or below
/// `base` (the jail used when re-rooting `path_info`).
pub(crate) fn merge_paths(base: &str, add: &str) -> Option<String> {
    let merged = merge_file_path(base, add)?;
    let anchor = base.trim_end_matches('/');
    if merged == anchor || merged.trim_end_matches('/') == anchor {
        return Some(merged);
    }
    merged.starts_with(&format!("{anchor}/")).then_some(merged)
}

/// Merge `add` onto `base`; an absolute `add` replaces `base` entirely.
pub(crate) fn merge_file_path(base: &str, add: &str) -> Option<String> {
    if add.starts_with('/') {
        absolute_path(add)
    } else {
        absolute_path(&full_path(base, add))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{NormalizeFlags, UnescapeFlags};

    const STRICT: NormalizeFlags = NormalizeFlags::NOT_ABOVE_ROOT
        .union(NormalizeFlags::MERGE_SLASHES)
        .union(NormalizeFlags::DECODE_UNRESERVED);

    #[test]
    fn normalize() {
        assert_eq!(normalize_path("/a/./b", STRICT).as_deref(), Some("/a/b"));
        assert_eq!(normalize_path("/a/b/../c", STRICT).as_deref(), Some("/a/c"));
        assert_eq!(normalize_path("/a//b///c", STRICT).as_deref(), Some("/a/b/c"));
        assert_eq!(normalize_path("/a/b/..", STRICT).as_deref(), Some("/a/"));
        assert_eq!(normalize_path("/a/b/../", STRICT).as_deref(), Some("/a/"));
        assert_eq!(normalize_path("/a/.", STRICT).as_deref(), Some("/a/"));
        assert_eq!(normalize_path("/", STRICT).as_deref(), Some("/"));
    }

    #[test]
    fn normalize_rejects_escapes_above_root() {
        assert_eq!(normalize_path("/..", STRICT), None);
        assert_eq!(normalize_path("/../x", STRICT), None);
        assert_eq!(normalize_path("/a/../../etc/passwd", STRICT), None);
        // Encoded dots count the same as literal ones.
        assert_eq!(normalize_path("/a/%2e%2e/%2e%2e/etc", STRICT), None);
        assert_eq!(normalize_path("/a/.%2e/b", STRICT).as_deref(), Some("/b"));
    }

    #[test]
    fn normalize_relative() {
        assert_eq!(normalize_path("a/b", STRICT), None);
        let relaxed = STRICT | NormalizeFlags::ALLOW_RELATIVE;
        assert_eq!(normalize_path("a/../b", relaxed).as_deref(), Some("b"));
        assert_eq!(normalize_path("../b", relaxed), None);
    }

    #[test]
    fn normalize_keeps_slashes_unless_merging() {
        let no_merge = NormalizeFlags::NOT_ABOVE_ROOT;
        assert_eq!(normalize_path("/a//b", no_merge).as_deref(), Some("/a//b"));
    }

    #[test]
    fn normalize_decodes_unreserved_once() {
        assert_eq!(normalize_path("/%61bc", STRICT).as_deref(), Some("/abc"));
        // Reserved escapes stay for the unescape pass.
        assert_eq!(normalize_path("/a%2Fb", STRICT).as_deref(), Some("/a%2Fb"));
        // Bad escapes fail the request.
        assert_eq!(normalize_path("/a%zzb", STRICT), None);
        assert_eq!(normalize_path("/a%2", STRICT), None);
    }

    #[test]
    fn normalize_is_idempotent() {
        for path in ["/a/./b/../c//d", "/x/%2e/y", "/a/b/c/", "//"] {
            let once = normalize_path(path, STRICT).unwrap();
            // The second pass must not decode again.
            let flags = STRICT - NormalizeFlags::DECODE_UNRESERVED;
            assert_eq!(normalize_path(&once, flags).as_deref(), Some(once.as_str()), "{path}");
        }
    }

    #[test]
    fn unescape() {
        let keep = UnescapeFlags::KEEP_UNRESERVED;
        assert_eq!(unescape_url("/a%20b", keep).as_deref(), Ok("/a b"));
        assert_eq!(unescape_url("/a%2eb", keep).as_deref(), Ok("/a%2eb"));
        assert_eq!(unescape_url("/x%2Fy", keep).as_deref(), Ok("/x/y"));
        assert_eq!(
            unescape_url("/x%2Fy", keep | UnescapeFlags::FORBID_SLASHES),
            Err(UnescapeFailure::EncodedSlash)
        );
        assert_eq!(
            unescape_url("/x%2fy", keep | UnescapeFlags::KEEP_SLASHES).as_deref(),
            Ok("/x%2fy")
        );
        assert_eq!(unescape_url("/x%00y", keep), Err(UnescapeFailure::EncodedNul));
        assert_eq!(unescape_url("/x%q", keep), Err(UnescapeFailure::BadEscape));
    }

    #[test]
    fn escape_round_trip() {
        assert_eq!(escape_uri("/a b/c"), "/a%20b/c");
        assert_eq!(escape_uri("/a?b"), "/a%3Fb");
        assert_eq!(escape_uri("/plain-path_1.html"), "/plain-path_1.html");
    }

    #[test]
    fn path_helpers() {
        assert_eq!(count_dirs("/a/b/c"), 3);
        assert_eq!(dirstr_parent("/a/b/c.html"), "/a/b/");
        assert_eq!(dirstr_parent("/a/b/"), "/a/b/");
        assert_eq!(basename("/a/b/c.html"), "c.html");
        assert_eq!(full_path("/a/b", "c"), "/a/b/c");
        assert_eq!(full_path("/a/b/", "c"), "/a/b/c");
        assert_eq!(full_path("", "c"), "/c");
        assert_eq!(no2slash("//a///b/"), "/a/b/");
        assert_eq!(find_path_info("/a/b/extra", "/extra"), 4);
    }

    #[test]
    fn merges() {
        assert_eq!(absolute_path("/a/b/../c").as_deref(), Some("/a/c"));
        assert_eq!(absolute_path("a/b"), None);
        assert_eq!(merge_file_path("/a/b/", "c.html").as_deref(), Some("/a/b/c.html"));
        assert_eq!(merge_file_path("/a/b/", "/x/y").as_deref(), Some("/x/y"));
        assert_eq!(merge_paths("/a/b", "c/d").as_deref(), Some("/a/b/c/d"));
        assert_eq!(merge_paths("/a/b", "../z"), None);
        assert_eq!(merge_paths("/a/b", "/x/y"), None);
    }
}
