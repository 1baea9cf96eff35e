//! Info-hash derivation.
//!
//! The info-hash is the SHA-1 digest of the byte-exact bencoded `info`
//! dictionary as it appeared in the source file — NOT a re-encoding
//! of the parsed structure. A source file whose `info` dictionary has keys
//! in a non-canonical order would hash differently after a decode/re-encode
//! round trip, which is the single most common source of cross-client
//! info-hash mismatches. `torrent::file::Metainfo::parse` locates and keeps
//! the original byte span; this module only hashes whatever span it is given.
use sha1::{Digest, Sha1};

/// Computes the SHA-1 digest of `info_bytes`, the original encoded bytes of
/// the `info` dictionary.
pub fn calculate_info_hash(info_bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(info_bytes);
    let result = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&result[..]);
    info_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_known_vector() {
        // SHA1("") per RFC 3174 test vectors.
        let hash = calculate_info_hash(b"");
        assert_eq!(
            hex::encode(hash),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }
}
