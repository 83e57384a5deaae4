use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const DEFAULT_SEED: u64 = 3819201;

/// Source of randomness used by rollouts and action sampling.
///
/// Injected explicitly so that tests can reproduce exact rollout sequences.
pub trait RandomGenerator: Default + Send + 'static {
    /// Returns a number in `[0, 1)`.
    fn next_f64(&mut self) -> f64;

    /// Shuffles the slice in place.
    fn shuffle<T>(&mut self, items: &mut [T]);
}

/// Uses the thread-local generator of `rand`. Not reproducible.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardRandomGenerator;

impl RandomGenerator for StandardRandomGenerator {
    fn next_f64(&mut self) -> f64 {
        rand::rng().random()
    }

    fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut rand::rng());
    }
}

/// A seeded generator producing the same sequence for the same seed.
#[derive(Debug, Clone)]
pub struct SeededRandomGenerator {
    rng: StdRng,
}

impl Default for SeededRandomGenerator {
    fn default() -> Self {
        SeededRandomGenerator::new(DEFAULT_SEED)
    }
}

impl SeededRandomGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomGenerator for SeededRandomGenerator {
    fn next_f64(&mut self) -> f64 {
        self.rng.random()
    }

    fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }
}
