use rand::Rng;
use tracing::warn;

const MIN_SAMPLE_RATE: i64 = 1;
const MAX_SAMPLE_RATE: i64 = 100;

/// Probabilistic admission for metric samples.
///
/// The sample rate is a percentage. Each call is an independent coin flip: no state is carried between calls.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sampler;

impl Sampler {
    /// Creates a new `Sampler`.
    pub const fn new() -> Self {
        Sampler
    }

    /// Decides whether a sample with the given rate should be sent, using the thread-local RNG.
    pub fn should_admit(&self, sample_rate: Option<i64>) -> bool {
        self.should_admit_with(&mut rand::rng(), sample_rate)
    }

    /// Decides whether a sample with the given rate should be sent, drawing from `rng`.
    ///
    /// A rate of `None` is never admitted. Rates below 1 are raised to 1, and rates above 100 are lowered to 100.
    pub fn should_admit_with<R>(&self, rng: &mut R, sample_rate: Option<i64>) -> bool
    where
        R: Rng,
    {
        let Some(sample_rate) = sample_rate else {
            return false;
        };

        let sample_rate = if sample_rate < MIN_SAMPLE_RATE {
            warn!(sample_rate, "Sample rate below minimum, clamping to {}.", MIN_SAMPLE_RATE);
            MIN_SAMPLE_RATE
        } else {
            sample_rate.min(MAX_SAMPLE_RATE)
        };

        let draw: f64 = rng.random();
        draw <= sample_rate as f64 / 100.0
    }
}
