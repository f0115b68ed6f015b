use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::xxh3_128;

pub fn calculate_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// XXH3-128 in the same fixed-width hex form clients send it
pub fn calculate_xxh3(data: &[u8]) -> String {
    format!("{:032x}", xxh3_128(data))
}

pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A declared whole-file hash, detected from its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileHash {
    Sha256(String),
    Xxh3(String),
}

impl FileHash {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        if !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        match value.len() {
            64 => Some(FileHash::Sha256(value)),
            32 => Some(FileHash::Xxh3(value)),
            _ => None,
        }
    }

    pub fn expected(&self) -> &str {
        match self {
            FileHash::Sha256(v) | FileHash::Xxh3(v) => v,
        }
    }

    /// Hash of `data` with the same algorithm
    pub fn compute(&self, data: &[u8]) -> String {
        match self {
            FileHash::Sha256(_) => calculate_hash(data),
            FileHash::Xxh3(_) => calculate_xxh3(data),
        }
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        self.compute(data) == self.expected()
    }
}
