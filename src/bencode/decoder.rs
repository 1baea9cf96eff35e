//! Bencode decoding.
//!
//! The decoder works directly on a byte slice rather than a `Read` stream:
//! every caller in this crate (loading a `.torrent` file, parsing a tracker
//! response body) already has the whole input in memory, and slice-based
//! decoding makes it straightforward to report how many bytes a value
//! consumed — which the metainfo layer needs to slice out the original
//! `info` dictionary's bytes for hashing (see `torrent::file`).
use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;
use std::collections::BTreeMap;
use tracing::instrument;

/// Decodes a single Bencode value from `bytes`, requiring the entire input
/// to be consumed (no trailing junk).
#[instrument(skip(bytes), level = "debug")]
pub fn decode(bytes: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, consumed) = decode_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes a single Bencode value from the start of `bytes`, returning the
/// value along with the number of bytes it consumed. Unlike `decode`, this
/// permits trailing data — callers recurse with it to walk lists and
/// dictionaries, and the metainfo loader uses it to find exactly where the
/// `info` dictionary's encoding ends.
#[instrument(skip(bytes), level = "trace")]
pub fn decode_prefix(bytes: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    match bytes.first() {
        None => Err(BencodeError::UnexpectedEOI),
        Some(b'i') => {
            let (value, consumed) = decode_integer(bytes)?;
            Ok((BencodeValue::Integer(value), consumed))
        }
        Some(b'l') => {
            let (value, consumed) = decode_list(bytes)?;
            Ok((BencodeValue::List(value), consumed))
        }
        Some(b'd') => {
            let (value, consumed) = decode_dict(bytes)?;
            Ok((BencodeValue::Dict(value), consumed))
        }
        Some(b'0'..=b'9') => {
            let (value, consumed) = decode_string(bytes)?;
            Ok((BencodeValue::String(value), consumed))
        }
        Some(&c) => Err(BencodeError::InvalidFormat(format!(
            "unexpected character: {}",
            c as char
        ))),
    }
}

/// Decodes a Bencode string `<len>:<bytes>` from the start of `bytes`.
///
/// `len` must be ASCII digits with no leading zero (except the literal
/// `0`), and the declared length must not exceed what remains in `bytes`.
#[instrument(skip(bytes), level = "trace")]
fn decode_string(bytes: &[u8]) -> BencodeResult<(Vec<u8>, usize)> {
    let colon = bytes
        .iter()
        .position(|&b| b == b':')
        .ok_or(BencodeError::UnexpectedEOI)?;
    let len_str =
        std::str::from_utf8(&bytes[..colon]).map_err(|_| BencodeError::InvalidStringLength)?;

    if len_str.is_empty() || (len_str.len() > 1 && len_str.starts_with('0')) {
        return Err(BencodeError::InvalidStringLength);
    }
    if !len_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BencodeError::InvalidStringLength);
    }

    let len: usize = len_str
        .parse()
        .map_err(|_| BencodeError::InvalidStringLength)?;

    let start = colon + 1;
    let end = start.checked_add(len).ok_or(BencodeError::StringTooLong)?;
    if end > bytes.len() {
        return Err(BencodeError::StringTooLong);
    }

    Ok((bytes[start..end].to_vec(), end))
}

/// Decodes a Bencode integer `i<digits>e` from the start of `bytes`.
///
/// Rejects a leading zero in the magnitude (`i03e`), negative zero
/// (`i-0e`), and an empty integer (`ie`, `i-e`).
#[instrument(skip(bytes), level = "trace")]
fn decode_integer(bytes: &[u8]) -> BencodeResult<(i64, usize)> {
    debug_assert_eq!(bytes.first(), Some(&b'i'));

    let end = bytes
        .iter()
        .position(|&b| b == b'e')
        .ok_or(BencodeError::UnexpectedEOI)?;
    let num_str = std::str::from_utf8(&bytes[1..end]).map_err(|_| BencodeError::InvalidInteger)?;

    if num_str.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }
    if num_str == "-0" {
        return Err(BencodeError::InvalidInteger);
    }
    let magnitude = num_str.strip_prefix('-').unwrap_or(num_str);
    if magnitude.is_empty() || !magnitude.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BencodeError::InvalidInteger);
    }
    if magnitude.len() > 1 && magnitude.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }

    let value: i64 = num_str.parse().map_err(|_| BencodeError::InvalidInteger)?;
    Ok((value, end + 1))
}

/// Decodes a Bencode list `l<value>*e` from the start of `bytes`.
#[instrument(skip(bytes), level = "trace")]
fn decode_list(bytes: &[u8]) -> BencodeResult<(Vec<BencodeValue>, usize)> {
    debug_assert_eq!(bytes.first(), Some(&b'l'));

    let mut pos = 1;
    let mut items = Vec::new();
    loop {
        match bytes.get(pos) {
            None => return Err(BencodeError::UnexpectedEOI),
            Some(b'e') => {
                pos += 1;
                break;
            }
            Some(_) => {
                let (item, consumed) = decode_prefix(&bytes[pos..])?;
                items.push(item);
                pos += consumed;
            }
        }
    }
    Ok((items, pos))
}

/// Decodes a Bencode dictionary `d(<string><value>)*e` from the start of
/// `bytes`. Keys must be strings and must not repeat.
#[instrument(skip(bytes), level = "trace")]
fn decode_dict(bytes: &[u8]) -> BencodeResult<(BTreeMap<Vec<u8>, BencodeValue>, usize)> {
    debug_assert_eq!(bytes.first(), Some(&b'd'));

    let mut pos = 1;
    let mut dict = BTreeMap::new();
    loop {
        match bytes.get(pos) {
            None => return Err(BencodeError::UnexpectedEOI),
            Some(b'e') => {
                pos += 1;
                break;
            }
            Some(_) => {
                let (key, key_len) = decode_string(&bytes[pos..])?;
                pos += key_len;
                let (value, value_len) = decode_prefix(&bytes[pos..])?;
                pos += value_len;
                if dict.insert(key.clone(), value).is_some() {
                    return Err(BencodeError::DuplicateKey(key));
                }
            }
        }
    }
    Ok((dict, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string() {
        assert_eq!(
            decode(b"5:hello").unwrap(),
            BencodeValue::String(b"hello".to_vec())
        );
    }

    #[test]
    fn decodes_zero_length_string() {
        assert_eq!(decode(b"0:").unwrap(), BencodeValue::String(Vec::new()));
    }

    #[test]
    fn decodes_integer() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-42e").unwrap(), BencodeValue::Integer(-42));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
    }

    #[test]
    fn rejects_leading_zero_integer() {
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-03e").is_err());
    }

    #[test]
    fn rejects_negative_zero() {
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn rejects_empty_integer() {
        assert!(decode(b"ie").is_err());
        assert!(decode(b"i-e").is_err());
    }

    #[test]
    fn rejects_string_length_exceeding_input() {
        assert!(decode(b"11:hello").is_err());
    }

    #[test]
    fn decodes_list() {
        let value = decode(b"li42ei-1ee").unwrap();
        assert_eq!(
            value,
            BencodeValue::List(vec![BencodeValue::Integer(42), BencodeValue::Integer(-1)])
        );
    }

    #[test]
    fn decodes_dict() {
        let value = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(
            dict.get(b"cow".as_slice()),
            Some(&BencodeValue::String(b"moo".to_vec()))
        );
        assert_eq!(
            dict.get(b"spam".as_slice()),
            Some(&BencodeValue::String(b"eggs".to_vec()))
        );
    }

    #[test]
    fn rejects_dict_missing_value() {
        assert!(decode(b"d3:cowe").is_err());
    }

    #[test]
    fn rejects_duplicate_key() {
        assert!(decode(b"d3:cowi1e3:cow4:spame").is_err());
    }

    #[test]
    fn rejects_trailing_junk_in_strict_mode() {
        assert!(decode(b"i1ejunk").is_err());
    }

    #[test]
    fn decode_prefix_reports_consumed_length() {
        let (value, consumed) = decode_prefix(b"i1eTRAILING").unwrap();
        assert_eq!(value, BencodeValue::Integer(1));
        assert_eq!(consumed, 3);
    }
}
