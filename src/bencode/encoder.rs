//! Bencode encoding.
//!
//! Always produces the canonical form: shortest decimal integers,
//! length-prefixed strings, and dictionary keys in ascending byte order
//! (free here since `BencodeValue::Dict` is a `BTreeMap`). The metainfo
//! layer deliberately does NOT round-trip a parsed `info` dictionary
//! through this encoder to derive `info_hash` — it hashes the original
//! byte span instead, since a source torrent with unsorted or otherwise
//! non-canonical `info` keys would hash to something different after a
//! decode/re-encode round trip. See `torrent::file` and `torrent::info_hash`.
use super::BencodeResult;
use super::BencodeValue;
use std::collections::BTreeMap;
use std::io::Write;
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(
    writer: &mut W,
    dict: &BTreeMap<Vec<u8>, BencodeValue>,
) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer, value), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes `value` in canonical form, writing to `writer`.
#[instrument(skip(writer, value), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Encodes `value` in canonical form, returning the bytes.
pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode(&mut buf, value)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decoder::decode;

    #[test]
    fn encodes_string() {
        assert_eq!(
            encode_to_vec(&BencodeValue::String(b"hello".to_vec())).unwrap(),
            b"5:hello"
        );
    }

    #[test]
    fn encodes_integer() {
        assert_eq!(encode_to_vec(&BencodeValue::Integer(42)).unwrap(), b"i42e");
        assert_eq!(
            encode_to_vec(&BencodeValue::Integer(-42)).unwrap(),
            b"i-42e"
        );
    }

    #[test]
    fn encodes_dict_with_sorted_keys() {
        let mut dict = BTreeMap::new();
        dict.insert(b"spam".to_vec(), BencodeValue::String(b"eggs".to_vec()));
        dict.insert(b"cow".to_vec(), BencodeValue::String(b"moo".to_vec()));
        let encoded = encode_to_vec(&BencodeValue::Dict(dict)).unwrap();
        assert_eq!(encoded, b"d3:cow3:moo4:spam4:eggse");
    }

    #[test]
    fn round_trips_canonical_input() {
        let original: &[u8] = b"d3:cow3:moo4:spam4:eggse";
        let decoded = decode(original).unwrap();
        let reencoded = encode_to_vec(&decoded).unwrap();
        assert_eq!(reencoded, original);
    }

    #[test]
    fn round_trips_nested_list_in_dict() {
        let original: &[u8] = b"d4:listl1:a1:bee";
        let decoded = decode(original).unwrap();
        let reencoded = encode_to_vec(&decoded).unwrap();
        assert_eq!(reencoded, original);
    }
}
