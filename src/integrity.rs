use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compute the hex SHA-256 of a file.
pub async fn sha256_file(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut digest = StreamDigest::new();
    let mut buffer = [0u8; 1024 * 8];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        digest.update(&buffer[..n]);
    }
    Ok(digest.finalize_hex())
}

/// Incremental SHA-256 over bytes fed in final order.
#[derive(Debug, Clone, Default)]
pub struct StreamDigest {
    hasher: Sha256,
}

impl StreamDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize_hex(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}
