//! Incremental hashing over the supported algorithms

use crate::config::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A finished digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    /// Algorithm that produced it
    pub algorithm: HashAlgorithm,
    /// Raw digest bytes
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
}

impl Digest {
    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// Unified hasher that supports all algorithms
pub enum Hasher {
    /// XXHash3 128-bit
    XXHash3(Box<xxhash_rust::xxh3::Xxh3>),
    /// XXHash64
    XXHash64(xxhash_rust::xxh64::Xxh64),
    /// BLAKE3
    Blake3(Box<blake3::Hasher>),
    /// SHA-256
    Sha256(sha2::Sha256),
}

impl Hasher {
    /// Create a hasher for `algorithm`
    pub fn new(algorithm: HashAlgorithm) -> Self {
        use sha2::Digest as _;
        match algorithm {
            HashAlgorithm::XXHash3 => Self::XXHash3(Box::default()),
            HashAlgorithm::XXHash64 => Self::XXHash64(xxhash_rust::xxh64::Xxh64::new(0)),
            HashAlgorithm::Blake3 => Self::Blake3(Box::default()),
            HashAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
        }
    }

    /// Algorithm in use
    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::XXHash3(_) => HashAlgorithm::XXHash3,
            Self::XXHash64(_) => HashAlgorithm::XXHash64,
            Self::Blake3(_) => HashAlgorithm::Blake3,
            Self::Sha256(_) => HashAlgorithm::Sha256,
        }
    }

    /// Feed more data
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::XXHash3(h) => h.update(data),
            Self::XXHash64(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
            Self::Sha256(h) => sha2::Digest::update(h, data),
        }
    }

    /// Finish and return the digest
    pub fn finalize(self) -> Digest {
        let algorithm = self.algorithm();
        let bytes = match self {
            Self::XXHash3(h) => h.digest128().to_be_bytes().to_vec(),
            Self::XXHash64(h) => h.digest().to_be_bytes().to_vec(),
            Self::Blake3(h) => h.finalize().as_bytes().to_vec(),
            Self::Sha256(h) => sha2::Digest::finalize(h).to_vec(),
        };
        debug_assert_eq!(bytes.len(), algorithm.output_size());
        Digest { algorithm, bytes }
    }
}

/// Digest of an in-memory buffer
pub fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> Digest {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::XXHash3,
        HashAlgorithm::XXHash64,
        HashAlgorithm::Blake3,
        HashAlgorithm::Sha256,
    ];

    #[test]
    fn test_digest_sizes_and_determinism() {
        for algorithm in ALL {
            let a = hash_bytes(b"cluster payload", algorithm);
            assert_eq!(a.bytes.len(), algorithm.output_size());
            assert_eq!(a, hash_bytes(b"cluster payload", algorithm));
            assert_ne!(a, hash_bytes(b"cluster payloaD", algorithm));
        }
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        for algorithm in ALL {
            let mut hasher = Hasher::new(algorithm);
            hasher.update(b"Hello, ");
            hasher.update(b"World!");
            assert_eq!(hasher.finalize(), hash_bytes(b"Hello, World!", algorithm));
        }
    }

    #[test]
    fn test_known_sha256() {
        let digest = hash_bytes(b"abc", HashAlgorithm::Sha256);
        assert_eq!(
            digest.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_serde_uses_hex() {
        let digest = hash_bytes(b"abc", HashAlgorithm::XXHash64);
        let json = serde_json::to_string(&digest).unwrap();
        assert!(json.contains(&digest.to_hex()));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
