use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("checksum must be written as '<algorithm>:<hex digest>', got '{0}'")]
    MissingTag(String),
    #[error("unsupported checksum algorithm '{0}' (expected sha256 or blake3)")]
    UnsupportedAlgorithm(String),
    #[error("{algorithm} digest must be {expected} hex characters, got {actual}")]
    BadLength {
        algorithm: DigestAlgorithm,
        expected: usize,
        actual: usize,
    },
    #[error("digest contains non-hex characters: '{0}'")]
    NotHex(String),
}

/// Hash function named by a manifest checksum tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    Sha256,
    Blake3,
}

impl DigestAlgorithm {
    pub fn tag(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Blake3 => "blake3",
        }
    }

    /// Length of the digest in lowercase hex characters.
    pub fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 | DigestAlgorithm::Blake3 => 64,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            "blake3" => Ok(DigestAlgorithm::Blake3),
            other => Err(ChecksumError::UnsupportedAlgorithm(other.to_owned())),
        }
    }
}

/// Expected digest of an archive, tagged with the algorithm that produced it.
///
/// Written in manifests as `"sha256:<64 hex chars>"`. The hex digest is
/// normalized to lowercase on parse so that equality is exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Checksum {
    pub fn new(algorithm: DigestAlgorithm, hex: &str) -> Result<Self, ChecksumError> {
        let hex = hex.trim().to_ascii_lowercase();
        if hex.len() != algorithm.hex_len() {
            return Err(ChecksumError::BadLength {
                algorithm,
                expected: algorithm.hex_len(),
                actual: hex.len(),
            });
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ChecksumError::NotHex(hex));
        }
        Ok(Self { algorithm, hex })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Exact, full-length comparison against a computed hex digest.
    pub fn matches(&self, algorithm: DigestAlgorithm, actual_hex: &str) -> bool {
        self.algorithm == algorithm
            && actual_hex.len() == self.hex.len()
            && actual_hex.eq_ignore_ascii_case(&self.hex)
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        format!("{}:{}", self.algorithm, &self.hex[..12])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((tag, hex)) = s.trim().split_once(':') else {
            return Err(ChecksumError::MissingTag(s.to_owned()));
        };
        let algorithm: DigestAlgorithm = tag.parse()?;
        Checksum::new(algorithm, hex)
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
