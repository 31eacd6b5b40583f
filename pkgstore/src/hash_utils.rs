//! Cryptographic hashing utilities for tarball integrity

use base64::{engine::general_purpose, Engine as _};
use sha1::{Digest, Sha1};
use sha2::Sha512;

/// Calculate SHA1 hash of data (npm `shasum`).
///
/// # Examples
///
/// ```
/// # use pkgstore::hash_utils::sha1_hash;
/// let hash = sha1_hash(b"hello world");
/// assert_eq!(hash.len(), 40); // SHA1 produces 40 hex characters
/// ```
pub fn sha1_hash(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Calculate the Subresource Integrity string (`sha512-<base64>`) of data.
pub fn sha512_integrity(data: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(data);
    format!("sha512-{}", general_purpose::STANDARD.encode(hasher.finalize()))
}

/// Digest of a finished tarball stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballDigest {
    pub shasum: String,
    pub integrity: String,
    pub length: u64,
}

/// Incremental hasher fed chunk by chunk while a tarball streams to disk.
#[derive(Default)]
pub struct StreamingDigest {
    sha1: Sha1,
    sha512: Sha512,
    length: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.sha1.update(chunk);
        self.sha512.update(chunk);
        self.length += chunk.len() as u64;
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn finish(self) -> TarballDigest {
        TarballDigest {
            shasum: format!("{:x}", self.sha1.finalize()),
            integrity: format!(
                "sha512-{}",
                general_purpose::STANDARD.encode(self.sha512.finalize())
            ),
            length: self.length,
        }
    }
}
