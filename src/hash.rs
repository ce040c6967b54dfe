//! Digest helpers: hex encoding, ordering, and MD5 class digests.

use std::cmp::Ordering;
use std::fmt;

use md5::{Digest, Md5};
use serde::Serialize;

use crate::error::{AnalysisError, Result};

/// Lowercase hex encoding of `hash`.
pub fn hash_to_string(hash: &[u8]) -> String {
    hex::encode(hash)
}

/// Decodes a hex digest produced by [`hash_to_string`].
pub fn string_to_hash(digest: &str) -> Result<Vec<u8>> {
    hex::decode(digest).map_err(|err| AnalysisError::InvalidDigest {
        digest: digest.to_string(),
        message: err.to_string(),
    })
}

/// Orders digests byte-wise as unsigned values; a strict prefix orders first.
pub fn compare_hashes(left: &[u8], right: &[u8]) -> Ordering {
    for (a, b) in left.iter().zip(right) {
        match a.cmp(b) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
    }
    left.len().cmp(&right.len())
}

/// MD5 digest of a class file's bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ClassHash {
    digest: Vec<u8>,
}

impl ClassHash {
    pub fn compute(bytes: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(bytes);
        Self {
            digest: hasher.finalize().to_vec(),
        }
    }

    pub fn from_hex(digest: &str) -> Result<Self> {
        Ok(Self {
            digest: string_to_hash(digest)?,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.digest
    }
}

impl PartialOrd for ClassHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClassHash {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_hashes(&self.digest, &other.digest)
    }
}

impl fmt::Display for ClassHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hash_to_string(&self.digest))
    }
}
