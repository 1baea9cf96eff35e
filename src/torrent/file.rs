//! Metainfo structure and parsing logic.
//!
//! Defines `Metainfo`/`InfoDict`/`FileEntry` and the parser that turns a raw
//! `.torrent` file into them. Single-file and multi-file torrents are
//! normalized into the same `files: Vec<FileEntry>` shape (a single-file
//! torrent gets a synthetic one-element list whose path is `name`).
use crate::bencode::decoder;
use crate::bencode::BencodeValue;
use crate::torrent::info_hash;

use super::TorrentError;
use super::TorrentResult;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// One file inside the torrent's file set, in metainfo order.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileEntry {
    /// Path components relative to the torrent's `name`, e.g.
    /// `["subdir", "file.bin"]`. For single-file torrents this is `[name]`.
    pub path: Vec<String>,
    pub length: u64,
    pub md5sum: Option<String>,
}

/// The `info` dictionary, normalized.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct InfoDict {
    pub piece_length: u64,
    /// Concatenation of 20-byte SHA-1 digests, one per piece.
    pub pieces: Vec<u8>,
    pub private: bool,
    pub name: String,
    pub files: Vec<FileEntry>,
}

/// A parsed `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    /// Ordered tiers of tracker URLs, each tier an ordered list of URLs.
    /// Empty when the source had no `announce-list`.
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<SystemTime>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,
    pub info: InfoDict,
    info_hash: [u8; 20],
    pieces_hash: Vec<[u8; 20]>,
}

fn dict_get<'a>(dict: &'a BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> Option<&'a BencodeValue> {
    dict.get(key.as_bytes())
}

fn require_string(dict: &BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> TorrentResult<String> {
    match dict_get(dict, key) {
        Some(BencodeValue::String(s)) => String::from_utf8(s.clone())
            .map_err(|e| TorrentError::InvalidFormat(format!("{key} is not UTF-8: {e}"))),
        Some(_) => Err(TorrentError::InvalidFieldType(key.to_string())),
        None => Err(TorrentError::MissingField(key.to_string())),
    }
}

fn optional_string(dict: &BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> Option<String> {
    match dict_get(dict, key) {
        Some(BencodeValue::String(s)) => String::from_utf8(s.clone()).ok(),
        _ => None,
    }
}

fn require_integer(dict: &BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> TorrentResult<i64> {
    match dict_get(dict, key) {
        Some(BencodeValue::Integer(i)) => Ok(*i),
        Some(_) => Err(TorrentError::InvalidFieldType(key.to_string())),
        None => Err(TorrentError::MissingField(key.to_string())),
    }
}

/// Breaks the concatenated `pieces` byte string into 20-byte SHA-1 hashes,
/// one per piece, in piece-index order.
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    Ok(pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

fn parse_path(value: &BencodeValue) -> TorrentResult<Vec<String>> {
    let components = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFieldType("path".to_string()))?;
    components
        .iter()
        .map(|c| match c {
            BencodeValue::String(s) => String::from_utf8(s.clone())
                .map_err(|e| TorrentError::InvalidFormat(format!("path component not UTF-8: {e}"))),
            _ => Err(TorrentError::InvalidFieldType("path component".to_string())),
        })
        .collect()
}

fn parse_files(value: &BencodeValue) -> TorrentResult<Vec<FileEntry>> {
    let list = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFieldType("files".to_string()))?;
    list.iter()
        .map(|entry| {
            let dict = entry
                .as_dict()
                .ok_or_else(|| TorrentError::InvalidFormat("file entry not a dict".to_string()))?;
            let length = require_integer(dict, "length")?;
            if length < 0 {
                return Err(TorrentError::InvalidFormat("negative file length".to_string()));
            }
            let path = parse_path(
                dict_get(dict, "path")
                    .ok_or_else(|| TorrentError::MissingField("path".to_string()))?,
            )?;
            let md5sum = optional_string(dict, "md5sum");
            Ok(FileEntry {
                path,
                length: length as u64,
                md5sum,
            })
        })
        .collect()
}

fn parse_info_dict(dict: &BTreeMap<Vec<u8>, BencodeValue>) -> TorrentResult<InfoDict> {
    let piece_length = require_integer(dict, "piece length")?;
    if piece_length <= 0 {
        return Err(TorrentError::InvalidFormat(
            "piece length must be positive".to_string(),
        ));
    }
    let pieces = match dict_get(dict, "pieces") {
        Some(BencodeValue::String(s)) => s.clone(),
        Some(_) => return Err(TorrentError::InvalidFieldType("pieces".to_string())),
        None => return Err(TorrentError::MissingField("pieces".to_string())),
    };
    let private = matches!(dict_get(dict, "private"), Some(BencodeValue::Integer(1)));
    let name = require_string(dict, "name")?;

    let files = match (dict_get(dict, "length"), dict_get(dict, "files")) {
        (Some(BencodeValue::Integer(length)), None) => {
            if *length < 0 {
                return Err(TorrentError::InvalidFormat("negative length".to_string()));
            }
            vec![FileEntry {
                path: vec![name.clone()],
                length: *length as u64,
                md5sum: optional_string(dict, "md5sum"),
            }]
        }
        (None, Some(files_value)) => parse_files(files_value)?,
        (Some(_), Some(_)) => {
            return Err(TorrentError::InvalidFormat(
                "info has both length and files".to_string(),
            ))
        }
        (None, None) => {
            return Err(TorrentError::MissingField(
                "length or files".to_string(),
            ))
        }
    };
    if files.is_empty() {
        return Err(TorrentError::InvalidFormat(
            "files list must be non-empty".to_string(),
        ));
    }

    Ok(InfoDict {
        piece_length: piece_length as u64,
        pieces,
        private,
        name,
        files,
    })
}

fn parse_announce_list(value: &BencodeValue) -> TorrentResult<Vec<Vec<String>>> {
    let tiers = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFieldType("announce-list".to_string()))?;
    tiers
        .iter()
        .map(|tier| {
            let trackers = tier
                .as_list()
                .ok_or_else(|| TorrentError::InvalidFieldType("announce-list tier".to_string()))?;
            trackers
                .iter()
                .map(|tracker| match tracker {
                    BencodeValue::String(s) => String::from_utf8(s.clone()).map_err(|e| {
                        TorrentError::InvalidFormat(format!("tracker URL not UTF-8: {e}"))
                    }),
                    _ => Err(TorrentError::InvalidFieldType("tracker URL".to_string())),
                })
                .collect()
        })
        .collect()
}

/// Locates the byte span of the `info` dictionary's value within the root
/// dictionary's encoding, without re-validating structure already checked
/// by the full decode. Used to slice out the exact bytes to hash — see
/// `torrent::info_hash`.
fn locate_info_span(data: &[u8]) -> TorrentResult<std::ops::Range<usize>> {
    if data.first() != Some(&b'd') {
        return Err(TorrentError::InvalidFormat(
            "root value is not a dictionary".to_string(),
        ));
    }
    let mut pos = 1;
    loop {
        match data.get(pos) {
            None => {
                return Err(TorrentError::InvalidFormat(
                    "unexpected end of input scanning for info".to_string(),
                ))
            }
            Some(b'e') => break,
            Some(_) => {
                let (key, key_len) = decoder::decode_prefix(&data[pos..])?;
                pos += key_len;
                let key_bytes = match key {
                    BencodeValue::String(s) => s,
                    _ => {
                        return Err(TorrentError::InvalidFormat(
                            "dictionary key is not a string".to_string(),
                        ))
                    }
                };
                let value_start = pos;
                let (_, value_len) = decoder::decode_prefix(&data[pos..])?;
                pos += value_len;
                if key_bytes == b"info" {
                    return Ok(value_start..pos);
                }
            }
        }
    }
    Err(TorrentError::MissingField("info".to_string()))
}

impl Metainfo {
    /// Parses a raw `.torrent` file.
    #[tracing::instrument(skip(data), level = "debug")]
    pub fn parse(data: &[u8]) -> TorrentResult<Metainfo> {
        let root = decoder::decode(data)?;
        let dict = match root {
            BencodeValue::Dict(d) => d,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "root value is not a dictionary".to_string(),
                ))
            }
        };

        let announce = require_string(&dict, "announce")?;

        let announce_list = match dict_get(&dict, "announce-list") {
            Some(value) => parse_announce_list(value)?,
            None => Vec::new(),
        };

        let info_value = dict_get(&dict, "info")
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info_dict = info_value
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidFormat("info is not a dict".to_string()))?;
        let info = parse_info_dict(info_dict)?;

        let info_span = locate_info_span(data)?;
        let info_hash = info_hash::calculate_info_hash(&data[info_span]);

        let pieces_hash = parse_pieces(&info.pieces)?;

        let creation_date = match dict_get(&dict, "creation date") {
            Some(BencodeValue::Integer(timestamp)) => {
                let secs: u64 = (*timestamp)
                    .try_into()
                    .map_err(|_| TorrentError::DateParseError)?;
                Some(UNIX_EPOCH + std::time::Duration::from_secs(secs))
            }
            Some(_) => return Err(TorrentError::InvalidFieldType("creation date".to_string())),
            None => None,
        };

        let comment = optional_string(&dict, "comment");
        let created_by = optional_string(&dict, "created by");
        let encoding = optional_string(&dict, "encoding");

        Ok(Metainfo {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            encoding,
            info,
            info_hash,
            pieces_hash,
        })
    }

    /// Flattened tracker URL list preserving tier order: the `announce-list`
    /// tiers in order if present, else the single `announce` URL.
    pub fn announce_urls(&self) -> Vec<String> {
        if self.announce_list.is_empty() {
            vec![self.announce.clone()]
        } else {
            self.announce_list.iter().flatten().cloned().collect()
        }
    }

    pub fn piece_length(&self) -> u64 {
        self.info.piece_length
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces_hash.len()
    }

    pub fn total_length(&self) -> u64 {
        self.info.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8; 20]> {
        self.pieces_hash.get(index)
    }

    /// Length of piece `index`: `piece_length` for every piece except
    /// possibly the last, which is `total_length - (num_pieces-1) *
    /// piece_length`.
    pub fn piece_size(&self, index: usize) -> u64 {
        if index + 1 < self.num_pieces() {
            self.piece_length()
        } else if index + 1 == self.num_pieces() {
            self.total_length() - (self.num_pieces() as u64 - 1) * self.piece_length()
        } else {
            0
        }
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.info.files
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder::encode_to_vec;
    use std::collections::BTreeMap;

    fn single_file_torrent(pieces: &[u8]) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(pieces.to_vec()));
        info.insert(b"name".to_vec(), BencodeValue::String(b"file.bin".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(20000));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://tracker.example/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        encode_to_vec(&BencodeValue::Dict(root)).unwrap()
    }

    #[test]
    fn parses_single_file_torrent() {
        let pieces = vec![0u8; 40]; // 2 pieces' worth of placeholder hashes
        let data = single_file_torrent(&pieces);
        let meta = Metainfo::parse(&data).unwrap();
        assert_eq!(meta.announce, "http://tracker.example/announce");
        assert_eq!(meta.total_length(), 20000);
        assert_eq!(meta.num_pieces(), 2);
        assert_eq!(meta.files().len(), 1);
        assert_eq!(meta.files()[0].path, vec!["file.bin".to_string()]);
    }

    #[test]
    fn piece_size_accounts_for_last_piece() {
        let pieces = vec![0u8; 40];
        let data = single_file_torrent(&pieces);
        let meta = Metainfo::parse(&data).unwrap();
        assert_eq!(meta.piece_size(0), 16384);
        assert_eq!(meta.piece_size(1), 20000 - 16384);
    }

    #[test]
    fn info_hash_is_stable_regardless_of_surrounding_key_order() {
        // Two files whose info bytes are identical but whose surrounding
        // top-level dict has extra unknown keys must hash the same.
        let pieces = vec![1u8; 20];
        let mut info = BTreeMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(pieces.clone()));
        info.insert(b"name".to_vec(), BencodeValue::String(b"f".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(1));
        let info_value = BencodeValue::Dict(info);
        let info_bytes = encode_to_vec(&info_value).unwrap();

        let mut root_a = BTreeMap::new();
        root_a.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://a".to_vec()),
        );
        root_a.insert(b"info".to_vec(), info_value.clone());
        let data_a = encode_to_vec(&BencodeValue::Dict(root_a)).unwrap();

        let mut root_b = BTreeMap::new();
        root_b.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://b-different-length".to_vec()),
        );
        root_b.insert(b"comment".to_vec(), BencodeValue::String(b"hi".to_vec()));
        root_b.insert(b"info".to_vec(), info_value);
        let data_b = encode_to_vec(&BencodeValue::Dict(root_b)).unwrap();

        let meta_a = Metainfo::parse(&data_a).unwrap();
        let meta_b = Metainfo::parse(&data_b).unwrap();
        assert_eq!(meta_a.info_hash(), meta_b.info_hash());
        assert_eq!(
            meta_a.info_hash(),
            info_hash::calculate_info_hash(&info_bytes)
        );
    }

    #[test]
    fn rejects_pieces_length_not_multiple_of_20() {
        let data = single_file_torrent(&[0u8; 19]);
        assert!(Metainfo::parse(&data).is_err());
    }
}
