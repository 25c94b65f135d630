use sha2::{Digest, Sha256};

/// Stable 16-hex-character id derived from the SHA-256 of the URL bytes.
///
/// This is the file name stem used on disk for both the sparse data file
/// and its companion meta file, so it must be a pure function of the URL
/// alone (no timestamps, no randomness).
pub fn resource_id(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(digest)[..16].to_string()
}
