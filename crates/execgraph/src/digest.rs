//! SHA-256 helpers shared by connectors and operations.

use sha2::{Digest, Sha256};
use std::io::{self, Read};

/// Hex-encoded SHA-256 of an in-memory buffer.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hex-encoded SHA-256 of everything readable from `reader`.
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_sha256_of_empty_input() {
        assert_eq!(sha256_hex(b""), EMPTY);
    }

    #[test]
    fn test_reader_matches_buffer() {
        let data = b"etcd-v3.5.9-linux-amd64";
        let from_reader = sha256_reader(&data[..]).unwrap();
        assert_eq!(from_reader, sha256_hex(data));
        assert_eq!(from_reader.len(), 64);
    }
}
