use rand::{rngs::SmallRng, RngCore, SeedableRng};

/// Produce exactly `len` bytes of pseudo-random content.
///
/// The content is not reproducible across calls; callers hash the returned
/// bytes and ship both together.
pub fn generate(len: usize) -> Vec<u8> {
    let mut rng = SmallRng::from_entropy();
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}
