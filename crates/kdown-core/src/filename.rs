//! Filename derivation and output-path collision avoidance (spec §4.4.1
//! step 3, §4.4.3 step 4). Carried forward almost verbatim from the donor's
//! `url_model` module (`content_disposition`, `path`, `sanitize`), which
//! already implements RFC 5987 `filename*` parsing, quoted/unquoted
//! `filename` parsing, last-path-segment extraction, and Linux filename
//! sanitization — all of which the spec requires unchanged.

use std::path::{Path, PathBuf};

const DEFAULT_FILENAME: &str = "download";

/// Extracts the filename from a raw `Content-Disposition` header value
/// (spec §4.4.1 step 3): `filename*=UTF-8''<pct-encoded>` takes precedence
/// over `filename="..."` / `filename=...`.
pub fn parse_content_disposition_filename(header_value: &str) -> Option<String> {
    let value = header_value.trim();
    let mut filename_from_token: Option<String> = None;

    for param in value.split(';') {
        let param = param.trim();
        let Some((name, v)) = param.split_once('=') else {
            continue;
        };
        let name = ascii_lowercase(name.trim());
        let v = v.trim();

        if name == "filename*" {
            if let Some(rest) = v.strip_prefix("utf-8''").or_else(|| v.strip_prefix("UTF-8''")) {
                let decoded = percent_decode(rest);
                let decoded = decode_quoted_filename(&decoded);
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
        }

        if name == "filename" {
            let unquoted = if v.starts_with('"') && v.ends_with('"') && v.len() >= 2 {
                decode_quoted_filename(&v[1..v.len() - 1])
            } else {
                v.to_string()
            };
            if !unquoted.is_empty() {
                filename_from_token = Some(unquoted);
            }
        }
    }

    filename_from_token
}

fn decode_quoted_filename(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == '"' || next == '\\' {
                    out.push(chars.next().unwrap());
                    continue;
                }
            }
            out.push(c);
        } else {
            out.push(c);
        }
    }
    out
}

fn percent_decode(input: &str) -> String {
    let mut out = Vec::new();
    let mut bytes = input.as_bytes().iter().cloned();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let h = bytes.next().and_then(hex_digit);
            let l = bytes.next().and_then(hex_digit);
            match (h, l) {
                (Some(high), Some(low)) => out.push(high << 4 | low),
                _ => {
                    out.push(b'%');
                    if let Some(x) = h {
                        out.push(x);
                    }
                    if let Some(x) = l {
                        out.push(x);
                    }
                }
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn ascii_lowercase(s: &str) -> String {
    s.chars()
        .map(|c| {
            if ('A'..='Z').contains(&c) {
                ((c as u8) - b'A' + b'a') as char
            } else {
                c
            }
        })
        .collect()
}

/// Last path segment of a URL, query/fragment stripped, percent-decoded
/// (spec §4.4.1 step 3 fallback).
pub fn filename_from_url_path(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let path = parsed.path();
    let segment = path.split('/').filter(|s| !s.is_empty()).last()?;
    if segment.is_empty() || segment == "." || segment == ".." {
        return None;
    }
    let decoded = percent_decode(segment);
    Some(decoded)
}

/// Sanitizes a candidate filename for safe use on Linux (spec §4.4.1): no
/// `/`, NUL, or control chars; no leading/trailing dots or spaces; reserved
/// names replaced.
pub fn sanitize_filename_for_linux(name: &str) -> String {
    const NAME_MAX: usize = 255;

    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;

    for c in name.chars() {
        let replacement = if c == '\0' || c == '/' || c == '\\' || c.is_control() {
            '_'
        } else if c == ' ' || c == '\t' {
            '_'
        } else {
            c
        };

        if replacement == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(replacement);
            prev_underscore = false;
        }
    }

    let trimmed = out.trim_matches(|c| c == ' ' || c == '\t' || c == '.' || c == '_');

    if trimmed.len() > NAME_MAX {
        let mut take = NAME_MAX;
        while take > 0 && !trimmed.is_char_boundary(take) {
            take -= 1;
        }
        trimmed[..take].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Derives a safe local filename (spec §4.4.1 step 3): `Content-Disposition`
/// (if present and parseable) wins over the URL's last path segment;
/// `"download"` is the final fallback.
pub fn derive_filename(url: &str, content_disposition: Option<&str>) -> String {
    let candidate = content_disposition
        .and_then(parse_content_disposition_filename)
        .filter(|s| !s.is_empty())
        .or_else(|| filename_from_url_path(url));

    let raw = match candidate {
        Some(c) => c,
        None => return DEFAULT_FILENAME.to_string(),
    };

    let sanitized = sanitize_filename_for_linux(&raw);
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        DEFAULT_FILENAME.to_string()
    } else {
        sanitized
    }
}

/// Finds the smallest `n >= 1` such that `dir/name (n).ext` (or `dir/name
/// (n)` if `name` has no extension) does not exist, appending ` (n)` before
/// the extension (spec §4.4.3 step 4). Only applies to local filesystem
/// paths; callers must not invoke this for `scheme://` destinations.
pub fn unique_path_among_existing(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1u64;
    loop {
        let candidate_name = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = parent.join(candidate_name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_filename_from_url_path() {
        assert_eq!(
            derive_filename("https://example.com/archive.zip", None),
            "archive.zip"
        );
    }

    #[test]
    fn derive_filename_content_disposition_overrides_url() {
        assert_eq!(
            derive_filename(
                "https://example.com/archive.zip",
                Some("attachment; filename=\"real-name.tar.gz\"")
            ),
            "real-name.tar.gz"
        );
    }

    #[test]
    fn derive_filename_filename_star_precedence() {
        assert_eq!(
            derive_filename(
                "https://example.com/x",
                Some("attachment; filename=\"fallback.bin\"; filename*=UTF-8''real%20name.dat")
            ),
            "real name.dat"
        );
    }

    #[test]
    fn derive_filename_fallback_to_default() {
        assert_eq!(derive_filename("https://example.com/", None), "download");
        assert_eq!(derive_filename("https://example.com/..", None), "download");
    }

    #[test]
    fn sanitize_removes_slashes_and_trims() {
        assert_eq!(sanitize_filename_for_linux("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(
            sanitize_filename_for_linux("  ..  file.txt  ..  "),
            "file.txt"
        );
    }

    #[test]
    fn unique_path_picks_smallest_free_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("file.iso");
        std::fs::write(&base, b"x").unwrap();
        std::fs::write(dir.path().join("file (1).iso"), b"x").unwrap();

        let unique = unique_path_among_existing(&base);
        assert_eq!(unique, dir.path().join("file (2).iso"));
    }

    #[test]
    fn unique_path_no_collision_returns_original() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("fresh.bin");
        assert_eq!(unique_path_among_existing(&base), base);
    }

    #[test]
    fn unique_path_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("noext");
        std::fs::write(&base, b"x").unwrap();
        assert_eq!(unique_path_among_existing(&base), dir.path().join("noext (1)"));
    }
}
