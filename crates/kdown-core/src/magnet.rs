//! Magnet URI parsing (spec §4.9): `xt=urn:btih:<hex|base32>`, `dn`, `tr=*`.
//!
//! Hand-rolled rather than pulled from a crate, matching the donor's stance
//! on small domain-specific parsers (`url_model::content_disposition`'s
//! RFC 5987 decoder is the closest precedent: a narrow grammar not worth a
//! new dependency for).

/// A parsed `magnet:?...` link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// Lowercase hex-encoded 40-character BitTorrent info hash.
    pub info_hash: String,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

/// Parses a magnet URI. Returns `None` if the input isn't a `magnet:` URI or
/// carries no recognizable `xt=urn:btih:` parameter.
pub fn parse_magnet(uri: &str) -> Option<MagnetLink> {
    let rest = uri.strip_prefix("magnet:")?;
    let query = rest.strip_prefix('?').unwrap_or(rest);

    let mut info_hash = None;
    let mut display_name = None;
    let mut trackers = Vec::new();

    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = percent_decode(value);
        match key {
            "xt" => {
                if let Some(btih) = value.strip_prefix("urn:btih:") {
                    info_hash = Some(normalize_info_hash(btih));
                }
            }
            "dn" => display_name = Some(value),
            "tr" => trackers.push(value),
            "tr.0" | "tr.1" | "tr.2" | "tr.3" | "tr.4" => trackers.push(value),
            _ => {}
        }
    }

    let info_hash = info_hash?;
    Some(MagnetLink {
        info_hash,
        display_name,
        trackers,
    })
}

/// Normalizes a raw `btih` value: 40-char hex is lowercased as-is; a 32-char
/// base32 value is decoded to its 20-byte hash and re-encoded as lowercase
/// hex, matching what `TorrentEngine` implementations and `TaskRecord`
/// persistence expect (hex throughout).
fn normalize_info_hash(raw: &str) -> String {
    if raw.len() == 40 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return raw.to_ascii_lowercase();
    }
    if raw.len() == 32 {
        if let Some(bytes) = base32_decode(raw) {
            return bytes.iter().map(|b| format!("{b:02x}")).collect();
        }
    }
    raw.to_ascii_lowercase()
}

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::new();

    for c in input.to_ascii_uppercase().chars() {
        let idx = BASE32_ALPHABET.iter().position(|&b| b as char == c)? as u64;
        bits = (bits << 5) | idx;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push(((bits >> bit_count) & 0xFF) as u8);
        }
    }
    Some(out)
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
                _ => out.push(b'%'),
            }
        } else if b == b'+' {
            out.push(b' ');
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_info_hash_with_name_and_trackers() {
        let uri = "magnet:?xt=urn:btih:0123456789ABCDEF0123456789ABCDEF01234567&dn=Ubuntu+ISO&tr=udp%3A%2F%2Ftracker.example%3A80";
        let link = parse_magnet(uri).unwrap();
        assert_eq!(link.info_hash, "0123456789abcdef0123456789abcdef01234567");
        assert_eq!(link.display_name.as_deref(), Some("Ubuntu ISO"));
        assert_eq!(link.trackers, vec!["udp://tracker.example:80"]);
    }

    #[test]
    fn rejects_non_magnet_uri() {
        assert!(parse_magnet("https://example.com/file.torrent").is_none());
    }

    #[test]
    fn rejects_magnet_without_xt() {
        assert!(parse_magnet("magnet:?dn=no-hash-here").is_none());
    }

    #[test]
    fn decodes_base32_info_hash() {
        // 32-char base32 encoding of a 20-byte hash.
        let uri = "magnet:?xt=urn:btih:CI5VOT5BXJC5SCMQABODN4KGRJNPVUHA";
        let link = parse_magnet(uri).unwrap();
        assert_eq!(link.info_hash.len(), 40);
        assert!(link.info_hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
