//! Shared types for the ClickHouse gateway: the configuration model, the
//! duration/byte-size primitives it is built from, and the request
//! fingerprint used as the response cache key.

pub mod config;
pub mod units;

pub use config::Config;
pub use units::{ByteSize, Duration};

use std::io::Read;

/// Decodes a gzip-compressed buffer. Used for computing cache fingerprints
/// over the decoded query text; the wire bytes are always forwarded as-is.
pub fn decode_gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Everything that distinguishes one cacheable request from another.
///
/// Two requests with equal fingerprints must produce byte-identical
/// responses: the same query text, run by the same gateway user (which pins
/// the backend user and param group), with the same response encoding and
/// output format.
#[derive(Debug)]
pub struct CacheKey<'a> {
    /// Full query text after gzip decoding and param merging.
    pub query: &'a [u8],
    /// Gateway-side user name.
    pub user: &'a str,
    /// Merged URL params sent upstream, minus credentials and query id.
    pub params: &'a [(String, String)],
    /// Whether the client accepts a gzip-compressed response.
    pub accept_gzip: bool,
    /// Requested output format, if any.
    pub format: Option<&'a str>,
}

impl CacheKey<'_> {
    /// Stable hex fingerprint of the key. Each component is length-prefixed
    /// so concatenations cannot collide, and params are hashed in sorted
    /// order so client-supplied ordering does not matter.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hash_part(&mut hasher, self.query);
        hash_part(&mut hasher, self.user.as_bytes());

        let mut params: Vec<&(String, String)> = self.params.iter().collect();
        params.sort();
        for (k, v) in params {
            hash_part(&mut hasher, k.as_bytes());
            hash_part(&mut hasher, v.as_bytes());
        }

        hash_part(&mut hasher, &[self.accept_gzip as u8]);
        hash_part(&mut hasher, self.format.unwrap_or_default().as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

fn hash_part(hasher: &mut blake3::Hasher, part: &[u8]) {
    hasher.update(&(part.len() as u64).to_le_bytes());
    hasher.update(part);
}
