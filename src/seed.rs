use rand::rngs::StdRng;
use rand::SeedableRng;

/// One run seed, handed to every random consumer at construction.
///
/// Nothing in the crate touches a global RNG. Each consumer gets its own
/// stream derived from the run seed, so the sampling draws do not shift
/// when the noise path is switched off (warmup, fast path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedContext {
    seed: u64,
}

// Stream tags. Changing them changes every logged run.
const SAMPLING_STREAM: u64 = 0x5A4D_504C_0000_0001;
const NOISE_STREAM: u64 = 0x4E4F_4953_0000_0002;

impl SeedContext {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// RNG for next-token sampling in the driver.
    pub fn sampling_rng(&self) -> StdRng {
        StdRng::seed_from_u64(mix(self.seed, SAMPLING_STREAM))
    }

    /// RNG for injected activation noise.
    pub fn noise_rng(&self) -> StdRng {
        StdRng::seed_from_u64(mix(self.seed, NOISE_STREAM))
    }
}

// splitmix64 finaliser
fn mix(seed: u64, stream: u64) -> u64 {
    let mut z = seed ^ stream;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
