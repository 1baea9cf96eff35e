//! Bencode codec: parsing and byte-exact re-encoding of the format used by
//! `.torrent` files and tracker responses.
//!
//! Bencode has four value kinds: byte strings, integers, ordered lists, and
//! string-keyed dictionaries. Dictionaries are modeled with `BTreeMap`
//! rather than `HashMap` so the canonical encoder can walk keys in
//! ascending byte order without a separate sort step, and so a decoded
//! dictionary's iteration order matches the canonical form whenever the
//! source was already canonical.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// A decoded Bencode value.
///
/// `String` holds raw bytes rather than `String`: Bencode strings are byte
/// strings, and torrent metadata (paths, piece hashes) is not guaranteed to
/// be valid UTF-8.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Errors produced by the Bencode codec.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer format")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("declared string length exceeds remaining input")]
    StringTooLong,

    #[error("unexpected end of input")]
    UnexpectedEOI,

    #[error("duplicate key in dictionary: {0:?}")]
    DuplicateKey(Vec<u8>),

    #[error("trailing data after root value")]
    TrailingData,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
