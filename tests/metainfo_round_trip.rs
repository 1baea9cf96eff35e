//! Full decode -> re-encode -> hash round trip against a synthesized
//! `.torrent`, exercising the bencode, torrent, and info-hash layers
//! together rather than each in isolation.
use rstc::bencode::decoder::decode;
use rstc::bencode::encoder::encode_to_vec;
use rstc::bencode::BencodeValue;
use rstc::torrent::Metainfo;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn build_multi_file_torrent() -> (Vec<u8>, [u8; 20]) {
    let piece_a = vec![0xAAu8; 16];
    let piece_b = vec![0xBBu8; 8];
    let pieces: Vec<u8> = [sha1_of(&piece_a), sha1_of(&piece_b)].concat();

    let mut file_a = BTreeMap::new();
    file_a.insert(b"length".to_vec(), BencodeValue::Integer(10));
    file_a.insert(
        b"path".to_vec(),
        BencodeValue::List(vec![BencodeValue::String(b"a.txt".to_vec())]),
    );

    let mut file_b = BTreeMap::new();
    file_b.insert(b"length".to_vec(), BencodeValue::Integer(14));
    file_b.insert(
        b"path".to_vec(),
        BencodeValue::List(vec![
            BencodeValue::String(b"sub".to_vec()),
            BencodeValue::String(b"b.txt".to_vec()),
        ]),
    );

    let mut info = BTreeMap::new();
    info.insert(b"piece length".to_vec(), BencodeValue::Integer(16));
    info.insert(b"pieces".to_vec(), BencodeValue::String(pieces));
    info.insert(b"name".to_vec(), BencodeValue::String(b"bundle".to_vec()));
    info.insert(
        b"files".to_vec(),
        BencodeValue::List(vec![
            BencodeValue::Dict(file_a),
            BencodeValue::Dict(file_b),
        ]),
    );
    let info_value = BencodeValue::Dict(info);
    let info_bytes = encode_to_vec(&info_value).unwrap();
    let expected_hash = sha1_of(&info_bytes);

    let mut root = BTreeMap::new();
    root.insert(
        b"announce".to_vec(),
        BencodeValue::String(b"http://tracker.example/announce".to_vec()),
    );
    root.insert(
        b"announce-list".to_vec(),
        BencodeValue::List(vec![BencodeValue::List(vec![BencodeValue::String(
            b"http://tracker.example/announce".to_vec(),
        )])]),
    );
    root.insert(b"comment".to_vec(), BencodeValue::String(b"hi".to_vec()));
    root.insert(b"info".to_vec(), info_value);

    (encode_to_vec(&BencodeValue::Dict(root)).unwrap(), expected_hash)
}

#[test]
fn canonical_bytes_decode_and_reencode_identically() {
    let (data, _) = build_multi_file_torrent();
    let decoded = decode(&data).unwrap();
    let reencoded = encode_to_vec(&decoded).unwrap();
    assert_eq!(reencoded, data);
}

#[test]
fn metainfo_exposes_normalized_multi_file_layout_and_matching_info_hash() {
    let (data, expected_hash) = build_multi_file_torrent();
    let metainfo = Metainfo::parse(&data).unwrap();

    assert_eq!(metainfo.info_hash(), expected_hash);
    assert_eq!(metainfo.total_length(), 24);
    assert_eq!(metainfo.num_pieces(), 2);
    assert_eq!(metainfo.piece_size(0), 16);
    assert_eq!(metainfo.piece_size(1), 24 - 16);

    let files = metainfo.files();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].path, vec!["a.txt".to_string()]);
    assert_eq!(files[0].length, 10);
    assert_eq!(files[1].path, vec!["sub".to_string(), "b.txt".to_string()]);
    assert_eq!(files[1].length, 14);

    assert_eq!(
        metainfo.announce_urls(),
        vec!["http://tracker.example/announce".to_string()]
    );
}

#[test]
fn rejects_a_torrent_whose_info_dict_is_missing() {
    let mut root = BTreeMap::new();
    root.insert(
        b"announce".to_vec(),
        BencodeValue::String(b"http://tracker.example/announce".to_vec()),
    );
    let data = encode_to_vec(&BencodeValue::Dict(root)).unwrap();
    assert!(Metainfo::parse(&data).is_err());
}
