use sha2::{Digest, Sha256};

/// Returns the first `len` hex characters of the SHA-256 of `input`.
pub(crate) fn short_hex(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex.truncate(len);
    hex
}
