//! Bencode decoder
//!
//! Minimal bencode parsing for metainfo files and tracker responses.
//! The decoder preserves access to raw byte ranges so the info
//! dictionary can be hashed exactly as it appears on disk.

use std::collections::BTreeMap;

use crate::error::{ClientError, ProtocolErrorKind, Result};

/// Maximum accepted bencode string length (32 MiB).
/// Caps allocation from hostile metainfo files and tracker responses.
const MAX_STRING_LEN: usize = 32 * 1024 * 1024;

fn parse_error(message: impl Into<String>) -> ClientError {
    ClientError::protocol(ProtocolErrorKind::BencodeParse, message)
}

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer (may be negative)
    Integer(i64),
    /// Byte string (not necessarily valid UTF-8)
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary with byte-string keys in sorted order
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    /// Parse one value, returning it along with the unconsumed tail.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8])> {
        match data.first().copied() {
            None => Err(parse_error("empty input")),
            Some(b'i') => parse_integer(data),
            Some(b'l') => parse_list(data),
            Some(b'd') => parse_dict(data),
            Some(b'0'..=b'9') => parse_string(data),
            Some(c) => Err(parse_error(format!(
                "invalid type marker: {:?}",
                c as char
            ))),
        }
    }

    /// Parse a complete value, rejecting trailing bytes.
    pub fn parse_exact(data: &[u8]) -> Result<Self> {
        let (value, rest) = Self::parse(data)?;
        if !rest.is_empty() {
            return Err(parse_error(format!("trailing data: {} bytes", rest.len())));
        }
        Ok(value)
    }

    /// Get as UTF-8 string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as unsigned integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as raw bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dictionary
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }
}

fn parse_integer(data: &[u8]) -> Result<(BencodeValue, &[u8])> {
    let end = 1 + data[1..]
        .iter()
        .position(|&c| c == b'e')
        .ok_or_else(|| parse_error("unterminated integer"))?;

    let digits = std::str::from_utf8(&data[1..end])
        .map_err(|_| parse_error("invalid integer encoding"))?;

    // Canonical form only: no leading zeros, no negative zero.
    if (digits.len() > 1 && digits.starts_with('0'))
        || digits == "-0"
        || (digits.starts_with("-0") && digits.len() > 2)
    {
        return Err(parse_error(format!("non-canonical integer: {}", digits)));
    }

    let value = digits
        .parse::<i64>()
        .map_err(|_| parse_error(format!("integer out of range: {}", digits)))?;

    Ok((BencodeValue::Integer(value), &data[end + 1..]))
}

fn parse_string(data: &[u8]) -> Result<(BencodeValue, &[u8])> {
    let colon = data
        .iter()
        .position(|&c| c == b':')
        .ok_or_else(|| parse_error("missing colon in string"))?;

    let len = std::str::from_utf8(&data[..colon])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| parse_error("invalid string length"))?;

    if len > MAX_STRING_LEN {
        return Err(parse_error(format!("string of {} bytes exceeds cap", len)));
    }

    let start = colon + 1;
    let end = start
        .checked_add(len)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| parse_error("string length exceeds available data"))?;

    Ok((BencodeValue::Bytes(data[start..end].to_vec()), &data[end..]))
}

fn parse_list(data: &[u8]) -> Result<(BencodeValue, &[u8])> {
    let mut items = Vec::new();
    let mut rest = &data[1..];

    while !rest.is_empty() && rest[0] != b'e' {
        let (item, tail) = BencodeValue::parse(rest)?;
        items.push(item);
        rest = tail;
    }

    if rest.is_empty() {
        return Err(parse_error("unterminated list"));
    }
    Ok((BencodeValue::List(items), &rest[1..]))
}

fn parse_dict(data: &[u8]) -> Result<(BencodeValue, &[u8])> {
    let mut entries = BTreeMap::new();
    let mut rest = &data[1..];
    let mut last_key: Option<Vec<u8>> = None;

    while !rest.is_empty() && rest[0] != b'e' {
        let (key_value, tail) = parse_string(rest)?;
        let BencodeValue::Bytes(key) = key_value else {
            unreachable!("parse_string only yields Bytes");
        };

        if let Some(ref prev) = last_key {
            if key <= *prev {
                return Err(parse_error("dict keys not in sorted order"));
            }
        }
        last_key = Some(key.clone());

        let (value, tail) = BencodeValue::parse(tail)?;
        entries.insert(key, value);
        rest = tail;
    }

    if rest.is_empty() {
        return Err(parse_error("unterminated dict"));
    }
    Ok((BencodeValue::Dict(entries), &rest[1..]))
}

/// Locate the raw byte range of the top-level "info" dictionary.
///
/// The info_hash is the SHA-1 of these exact bytes, so they must be
/// sliced out of the original input rather than re-encoded.
pub fn info_dict_bytes(data: &[u8]) -> Result<&[u8]> {
    let root = BencodeValue::parse_exact(data)?;
    let dict = root
        .as_dict()
        .ok_or_else(|| parse_error("root is not a dict"))?;
    if !dict.contains_key(b"info".as_slice()) {
        return Err(ClientError::protocol(
            ProtocolErrorKind::InvalidTorrent,
            "missing 'info' key",
        ));
    }

    // Scan for the "4:info" key token followed by a dict; the parse
    // above guarantees the document is well-formed, so the first such
    // occurrence at a key position is the real one.
    let needle = b"4:info";
    let mut pos = 0;
    while pos + needle.len() < data.len() {
        if data[pos..].starts_with(needle) {
            let start = pos + needle.len();
            if data[start] == b'd' {
                let (_, rest) = BencodeValue::parse(&data[start..])?;
                let len = data.len() - start - rest.len();
                return Ok(&data[start..start + len]);
            }
        }
        pos += 1;
    }

    Err(ClientError::protocol(
        ProtocolErrorKind::InvalidTorrent,
        "could not locate info dict bytes",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer() {
        let (value, rest) = BencodeValue::parse(b"i42e").unwrap();
        assert_eq!(value, BencodeValue::Integer(42));
        assert!(rest.is_empty());

        let (value, _) = BencodeValue::parse(b"i-42e").unwrap();
        assert_eq!(value, BencodeValue::Integer(-42));

        let (value, _) = BencodeValue::parse(b"i0e").unwrap();
        assert_eq!(value, BencodeValue::Integer(0));

        assert!(BencodeValue::parse(b"i03e").is_err());
        assert!(BencodeValue::parse(b"i-0e").is_err());
        assert!(BencodeValue::parse(b"i12").is_err());
    }

    #[test]
    fn test_parse_string() {
        let (value, rest) = BencodeValue::parse(b"4:spam").unwrap();
        assert_eq!(value, BencodeValue::Bytes(b"spam".to_vec()));
        assert!(rest.is_empty());

        let (value, _) = BencodeValue::parse(b"0:").unwrap();
        assert_eq!(value, BencodeValue::Bytes(vec![]));

        // Binary content is preserved byte for byte
        let (value, _) = BencodeValue::parse(b"3:\x00\x01\x02").unwrap();
        assert_eq!(value, BencodeValue::Bytes(vec![0, 1, 2]));

        // Length past end of input
        assert!(BencodeValue::parse(b"9:abc").is_err());
    }

    #[test]
    fn test_parse_list() {
        let (value, _) = BencodeValue::parse(b"l4:spami42ee").unwrap();
        let items = value.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_str(), Some("spam"));
        assert_eq!(items[1], BencodeValue::Integer(42));

        assert!(BencodeValue::parse(b"l4:spam").is_err());
    }

    #[test]
    fn test_parse_dict() {
        let (value, _) = BencodeValue::parse(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(
            dict.get(b"cow".as_slice()).and_then(|v| v.as_str()),
            Some("moo")
        );

        // Unsorted keys are rejected
        assert!(BencodeValue::parse(b"d4:spam4:eggs3:cow3:mooe").is_err());
    }

    #[test]
    fn test_parse_exact_rejects_trailing() {
        assert!(BencodeValue::parse_exact(b"i1eX").is_err());
        assert!(BencodeValue::parse_exact(b"i1e").is_ok());
    }

    #[test]
    fn test_info_dict_bytes() {
        let data = b"d8:announce3:url4:infod6:lengthi5e4:name1:fee";
        let info = info_dict_bytes(data).unwrap();
        assert_eq!(info, b"d6:lengthi5e4:name1:fe");

        assert!(info_dict_bytes(b"d8:announce3:urle").is_err());
    }
}
