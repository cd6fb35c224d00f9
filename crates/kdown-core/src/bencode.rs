//! A minimal bencode decoder, just enough to read a `.torrent` file's
//! `info` dictionary (spec §4.9: "decode bencoded `.torrent` payload").
//!
//! Hand-rolled for the same reason as [`crate::magnet`]: bencode is a tiny,
//! fully-specified grammar (dict/list/int/byte-string) and the donor's
//! style favors a narrow hand-written parser over a new dependency for
//! something this small (`url_model::content_disposition` precedent).

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

/// A decoded bencode value. Dictionary keys in bencode are themselves byte
/// strings; `BTreeMap<Vec<u8>, Value>` preserves the sorted-key order
/// bencode requires when an `info` dict must be re-encoded for hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    Eof,
    #[error("invalid integer")]
    InvalidInt,
    #[error("invalid byte-string length")]
    InvalidLength,
    #[error("unexpected token at offset {0}")]
    UnexpectedToken(usize),
    #[error("trailing data after top-level value")]
    TrailingData,
}

/// Decodes a single top-level bencode value, requiring the entire input to
/// be consumed.
pub fn decode(input: &[u8]) -> Result<Value, BencodeError> {
    let mut cursor = Cursor { data: input, pos: 0 };
    let value = cursor.parse_value()?;
    if cursor.pos != input.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data.get(self.pos).copied().ok_or(BencodeError::Eof)
    }

    fn parse_value(&mut self) -> Result<Value, BencodeError> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => self.parse_bytes().map(Value::Bytes),
            _ => Err(BencodeError::UnexpectedToken(self.pos)),
        }
    }

    fn parse_int(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1; // 'i'
        let end = self.find(b'e')?;
        let s = std::str::from_utf8(&self.data[self.pos..end]).map_err(|_| BencodeError::InvalidInt)?;
        let n: i64 = s.parse().map_err(|_| BencodeError::InvalidInt)?;
        self.pos = end + 1;
        Ok(Value::Int(n))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let colon = self.find(b':')?;
        let len_str = std::str::from_utf8(&self.data[self.pos..colon]).map_err(|_| BencodeError::InvalidLength)?;
        let len: usize = len_str.parse().map_err(|_| BencodeError::InvalidLength)?;
        let start = colon + 1;
        let end = start.checked_add(len).ok_or(BencodeError::InvalidLength)?;
        if end > self.data.len() {
            return Err(BencodeError::Eof);
        }
        self.pos = end;
        Ok(self.data[start..end].to_vec())
    }

    fn parse_list(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.pos += 1; // 'e'
        Ok(Value::List(items))
    }

    fn parse_dict(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1; // 'd'
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.parse_bytes()?;
            let value = self.parse_value()?;
            map.insert(key, value);
        }
        self.pos += 1; // 'e'
        Ok(Value::Dict(map))
    }

    fn find(&self, needle: u8) -> Result<usize, BencodeError> {
        self.data[self.pos..]
            .iter()
            .position(|&b| b == needle)
            .map(|i| self.pos + i)
            .ok_or(BencodeError::Eof)
    }
}

/// Re-encodes a `Value` back to its canonical bencode byte representation
/// (dict keys sorted, as `BTreeMap` already guarantees). Needed to compute
/// `info_hash = SHA1(bencode(info_dict))` per the BitTorrent spec.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (k, v) in map {
                encode_into(&Value::Bytes(k.clone()), out);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

/// SHA-1 info hash of a decoded `info` dictionary, lowercase hex.
pub fn info_hash_hex(info_dict: &Value) -> String {
    let encoded = encode(info_dict);
    let digest = Sha1::digest(&encoded);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_int_bytes_list_dict() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"4:spam").unwrap(), Value::Bytes(b"spam".to_vec()));
        assert_eq!(
            decode(b"l4:spam4:eggse").unwrap(),
            Value::List(vec![Value::Bytes(b"spam".to_vec()), Value::Bytes(b"eggs".to_vec())])
        );
        let mut expected = BTreeMap::new();
        expected.insert(b"cow".to_vec(), Value::Bytes(b"moo".to_vec()));
        expected.insert(b"spam".to_vec(), Value::Bytes(b"eggs".to_vec()));
        assert_eq!(decode(b"d3:cow3:moo4:spam4:eggse").unwrap(), Value::Dict(expected));
    }

    #[test]
    fn negative_and_zero_ints() {
        assert_eq!(decode(b"i-3e").unwrap(), Value::Int(-3));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
    }

    #[test]
    fn rejects_trailing_data() {
        assert!(matches!(decode(b"i1ei2e"), Err(BencodeError::TrailingData)));
    }

    #[test]
    fn round_trip_encode_matches_canonical_form() {
        let value = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(encode(&value), b"d3:cow3:moo4:spam4:eggse".to_vec());
    }

    #[test]
    fn info_hash_is_stable_sha1_of_canonical_encoding() {
        let info = decode(b"d6:lengthi10e4:name5:a.isoe").unwrap();
        let hash1 = info_hash_hex(&info);
        let hash2 = info_hash_hex(&info);
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 40);
    }
}
