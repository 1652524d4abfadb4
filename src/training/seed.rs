use burn::tensor::backend::Backend;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

/// Seed the backend's tensor RNG, which drives weight initialisation and
/// dropout.
pub fn seed_everything<B: Backend>(seed: u64) {
    B::seed(seed);
    debug!(seed, "seeded backend");
}

/// Host RNG for shuffling and weighted sampling.
pub fn host_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Host RNG for one epoch. Each epoch gets its own stream, so a fit resumed
/// at epoch `e` draws the same batches as an uninterrupted one.
pub fn epoch_rng(seed: u64, epoch: usize) -> StdRng {
    host_rng(seed ^ (epoch as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}
