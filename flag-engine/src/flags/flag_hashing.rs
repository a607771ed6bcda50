use sha1::{Digest, Sha1};

/// Number of buckets an identifier can fall into.
pub const BUCKET_COUNT: u64 = 100;

/// Deterministic bucket in `[0, 100)` for an identifier on a given flag.
///
/// SHA1 over `"{flag_key}.{identifier}{salt}"`; the first 8 bytes are read as a
/// big-endian integer and shifted right by 4 bits (the first 15 hex digits),
/// then reduced modulo 100. Identical inputs give identical buckets in every
/// process, and the per-flag salt keeps buckets uncorrelated across flags.
pub fn bucket(salt: &str, flag_key: &str, identifier: &str) -> u8 {
    let hash_key = format!("{flag_key}.{identifier}{salt}");
    let digest = Sha1::digest(hash_key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let hash_val = u64::from_be_bytes(head) >> 4;
    // always < 100, so the narrowing is lossless
    (hash_val % BUCKET_COUNT) as u8
}
