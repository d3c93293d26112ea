use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use sha2::{Sha256, Digest};
use thiserror::Error;

/// Length of the short chunk hash carried in labels and chunk records.
pub const SHORT_HASH_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// First 16 hex chars of the SHA-256 of `data`.
pub fn short_hash(data: &[u8]) -> String {
    let mut full = sha256_hex(data);
    full.truncate(SHORT_HASH_LEN);
    full
}

/// Compute SHA256 hash of a file asynchronously.
pub async fn sha256_sum(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 8];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 { break; }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hash_is_prefix_of_full_digest() {
        let full = sha256_hex(b"hello world");
        assert_eq!(full.len(), 64);
        assert_eq!(short_hash(b"hello world"), full[..16]);
        // Known SHA-256 of "hello world".
        assert_eq!(short_hash(b"hello world"), "b94d27b9934d3e08");
    }

    #[tokio::test]
    async fn file_sum_matches_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let data = vec![7u8; 20_000];
        tokio::fs::write(&path, &data).await.unwrap();

        assert_eq!(sha256_sum(&path).await.unwrap(), sha256_hex(&data));
    }
}
