use sha2::{Digest, Sha256};

/// SHA-256 of `text`, as 64 lowercase hex characters.
pub fn checksum(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Hashing rule that reproduced a stored ledger checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Hash of the script after transaction-control stripping.
    Stripped,
    /// Hash of the raw script. Only ledgers written before stripping was
    /// introduced carry these.
    Original,
}

/// Check a stored checksum against both the stripped and the raw text.
pub fn verify(original: &str, stripped: &str, stored: &str) -> Option<ChecksumPolicy> {
    if checksum(stripped) == stored {
        Some(ChecksumPolicy::Stripped)
    } else if checksum(original) == stored {
        Some(ChecksumPolicy::Original)
    } else {
        None
    }
}
