//! Content hashes used to verify reassembled chunked messages.

use md5::Md5;
use sha2::{Digest, Sha256};

/// Hash algorithm for chunked message checksums.
///
/// The algorithm isn't carried on the wire; sender and receiver must agree on it out of band.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumAlgorithm {
    Md5,
    #[default]
    Sha256,
}

/// Calculate the lowercase hex digest of `data`.
pub fn calculate(data: &[u8], algorithm: ChecksumAlgorithm) -> String {
    calculate_segments([data], algorithm)
}

/// Calculate the lowercase hex digest of the concatenation of `segments`,
/// without concatenating them first.
pub fn calculate_segments<'a>(
    segments: impl IntoIterator<Item = &'a [u8]>,
    algorithm: ChecksumAlgorithm,
) -> String {
    match algorithm {
        ChecksumAlgorithm::Md5 => digest_segments::<Md5>(segments),
        ChecksumAlgorithm::Sha256 => digest_segments::<Sha256>(segments),
    }
}

/// Compare the digest of `data` against `expected_hex`, ignoring ASCII case.
pub fn verify(data: &[u8], expected_hex: &str, algorithm: ChecksumAlgorithm) -> bool {
    verify_segments([data], expected_hex, algorithm)
}

pub fn verify_segments<'a>(
    segments: impl IntoIterator<Item = &'a [u8]>,
    expected_hex: &str,
    algorithm: ChecksumAlgorithm,
) -> bool {
    calculate_segments(segments, algorithm).eq_ignore_ascii_case(expected_hex)
}

fn digest_segments<'a, D: Digest>(segments: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = D::new();

    for segment in segments {
        hasher.update(segment);
    }

    hex::encode(hasher.finalize())
}
