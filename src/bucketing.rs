//! Deterministic assignment of subjects to rollout buckets.
use murmur3::murmur3_x64_128;

use crate::Subject;

/// Maps an arbitrary byte string to a bucket value in `[0, 1]`.
pub trait Bucketer {
    #[allow(missing_docs)]
    fn bucket(&self, input: impl AsRef<[u8]>) -> f64;
}

/// The default (and only) bucketer.
///
/// Hashes the input with 128-bit MurmurHash3 (x64 variant, seed 0). The digest is laid out as
/// `h1` then `h2`, each little-endian; the first 15 hex digits of that layout are divided by
/// `0xFFFFFFFFFFFFFFF`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Bucketer;

const BUCKET_SCALE: f64 = 0xFFF_FFFF_FFFF_FFFFu64 as f64;

impl Bucketer for Murmur3Bucketer {
    fn bucket(&self, input: impl AsRef<[u8]>) -> f64 {
        let hash = murmur3_x64_128(&mut input.as_ref(), 0)
            .expect("reading from a byte slice should not fail");
        // low half is h1; its little-endian bytes lead the digest
        let h1 = hash as u64;
        (h1.swap_bytes() >> 4) as f64 / BUCKET_SCALE
    }
}

/// Compute the bucket of `subject` for the flag or segment identified by `key` and `salt`.
///
/// `bucket_by` names the attribute to hash, `key` by default. Subjects without a bucketable value
/// for that attribute land in bucket 0.
pub(crate) fn bucket_subject(
    bucketer: &impl Bucketer,
    subject: &Subject,
    key: &str,
    salt: &str,
    bucket_by: Option<&str>,
) -> f64 {
    let attribute = bucket_by.unwrap_or("key");
    let Some(mut id) = subject
        .value_of(attribute)
        .and_then(|value| value.as_bucketable())
    else {
        return 0.0;
    };

    if let Some(secondary) = subject.secondary() {
        id.push('.');
        id.push_str(secondary);
    }

    bucketer.bucket(format!("{}.{}.{}", key, salt, id))
}
