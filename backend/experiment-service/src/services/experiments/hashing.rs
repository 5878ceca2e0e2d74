/// Stable bucket hashing for variant selection and enrolment sampling
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Number of buckets; allocations and targeting percentages share this domain
pub const BUCKET_COUNT: u32 = 100;

/// Salt for picking a variant
pub const VARIANT_SALT: &str = "variant";

/// Salt for the targeting percentage cap; must stay distinct from `VARIANT_SALT`
/// so enrolment and variant choice are uncorrelated
pub const ELIGIBILITY_SALT: &str = "eligibility";

/// Deterministic bucket in `[0, BUCKET_COUNT)`.
///
/// SHA-256 keeps the value identical across processes, restarts and
/// compiler versions, which `std::hash` does not guarantee.
pub fn bucket(salt: &str, experiment_id: Uuid, subject_id: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(experiment_id.as_bytes());
    hasher.update(b":");
    hasher.update(subject_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % BUCKET_COUNT as u64) as u32
}
