//! Per-packet Bernoulli loss, grounded on the teacher's `UniformDropScheduler`.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Draws an independent Bernoulli(`rate`) trial per call. Used for both the initial
/// send and every retransmission attempt, in event order, per spec.md §5.
#[derive(Debug)]
pub struct BernoulliLoss {
    rng: SmallRng,
    rate: f64,
}

impl BernoulliLoss {
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            rate,
        }
    }

    pub fn should_drop(&mut self) -> bool {
        self.rng.gen_bool(self.rate)
    }
}
