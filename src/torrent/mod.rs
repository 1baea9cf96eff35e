//! Metainfo (`.torrent` file) parsing and error handling.
//!
//! This module decodes a `.torrent` file into a `Metainfo` view: announce
//! URL(s), piece layout, file layout, and the derived `info_hash`. See
//! `torrent::file` for the model and parser, `torrent::info_hash` for the
//! hashing helper.
use thiserror::Error;

pub mod file;
pub mod info_hash;

pub use file::{FileEntry, InfoDict, Metainfo};

/// Errors that can occur while loading or validating a metainfo file.
///
/// Both malformed bencode and structurally valid but semantically invalid
/// metainfo are fatal to the load and reported upward — there is no
/// partial/recoverable metainfo state.
#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("invalid data type for field: {0}")]
    InvalidFieldType(String),

    #[error("pieces length is not a multiple of 20")]
    InvalidPiecesHashLength,

    #[error("creation date is not a valid timestamp")]
    DateParseError,
}

pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
