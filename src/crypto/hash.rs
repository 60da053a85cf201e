//! Content fingerprints
//!
//! A model's identity is the SHA-256 of its file bytes, computed by streaming
//! the file in fixed-size blocks so multi-gigabyte models never sit in memory.
//! Submitted inputs are fingerprinted over their RFC 8785 canonical JSON so
//! that key order does not change the digest.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// 32-byte SHA-256 hash
pub type Hash256 = [u8; 32];

/// Read size used when streaming a file through the hasher
pub const FINGERPRINT_BLOCK_SIZE: usize = 8 * 1024;

/// Compute SHA-256 hash of arbitrary data
pub fn sha256(data: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of arbitrary data
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Stream a reader through SHA-256 in `FINGERPRINT_BLOCK_SIZE` blocks
pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; FINGERPRINT_BLOCK_SIZE];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint of a file on disk
pub fn fingerprint(path: impl AsRef<Path>) -> io::Result<String> {
    fingerprint_reader(File::open(path)?)
}

/// RFC 8785 canonical form of a JSON value
pub fn canonicalize_json(value: &serde_json::Value) -> serde_json::Result<String> {
    serde_json_canonicalizer::to_string(value)
}

/// Hex SHA-256 of a value's canonical JSON
pub fn canonical_json_hash(value: &serde_json::Value) -> serde_json::Result<String> {
    let canonical = canonicalize_json(value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// True for a 64-character lowercase hex string, the only shape a fingerprint takes
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    // sha256("") and sha256("abc")
    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_known_vectors() {
        assert_eq!(sha256_hex(b""), EMPTY);
        assert_eq!(sha256_hex(b"abc"), ABC);
    }

    #[test]
    fn test_fingerprint_matches_one_shot_hash_across_blocks() {
        let data: Vec<u8> = (0..(FINGERPRINT_BLOCK_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();

        let streamed = fingerprint_reader(&data[..]).unwrap();
        assert_eq!(streamed, sha256_hex(&data));
    }

    #[test]
    fn test_fingerprint_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        file.flush().unwrap();

        assert_eq!(fingerprint(file.path()).unwrap(), ABC);
    }

    #[test]
    fn test_canonical_hash_ignores_key_order() {
        let a = json!({"input_data": [[1, 2]], "output_data": [[3]]});
        let b = json!({"output_data": [[3]], "input_data": [[1, 2]]});
        assert_eq!(
            canonical_json_hash(&a).unwrap(),
            canonical_json_hash(&b).unwrap()
        );
    }

    #[test]
    fn test_is_hex_digest() {
        assert!(is_hex_digest(EMPTY));
        assert!(!is_hex_digest(&EMPTY.to_uppercase()));
        assert!(!is_hex_digest("../../etc/passwd"));
        assert!(!is_hex_digest(&EMPTY[..63]));
    }
}
