//! Digest computation and checksum verification for fetched archives.

use crate::StoreError;
use pallet_schema::{Checksum, DigestAlgorithm};
use sha2::{Digest, Sha256};

/// Incremental hasher over either supported algorithm.
pub enum StreamingDigest {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl StreamingDigest {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => StreamingDigest::Sha256(Sha256::new()),
            DigestAlgorithm::Blake3 => StreamingDigest::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamingDigest::Sha256(h) => h.update(data),
            StreamingDigest::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        match self {
            StreamingDigest::Sha256(h) => format!("{:x}", h.finalize()),
            StreamingDigest::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

pub fn digest_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    let mut d = StreamingDigest::new(algorithm);
    d.update(data);
    d.finalize_hex()
}

/// Verify `data` against `expected`. Any difference is a [`StoreError::ChecksumMismatch`].
pub fn verify_bytes(data: &[u8], expected: &Checksum) -> Result<(), StoreError> {
    let algorithm = expected.algorithm();
    let actual = digest_bytes(algorithm, data);
    if expected.matches(algorithm, &actual) {
        Ok(())
    } else {
        Err(StoreError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: format!("{algorithm}:{actual}"),
        })
    }
}
