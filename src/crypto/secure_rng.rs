// Seed material for random passes and verification sample plans
//
// Seeds come from ring's SystemRandom (the OS CSPRNG). Every draw goes through a
// continuous repetition test so a stuck generator can never hand two jobs the
// same seed.

use crate::algorithms::PatternSeed;
use crate::{EngineError, EngineResult};
use lazy_static::lazy_static;
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Mutex;

/// Number of leading bytes compared by the continuous test
const CONTINUOUS_TEST_BLOCK: usize = 16;

/// Repetition test over consecutive outputs (FIPS 140-2 style).
pub(crate) struct ContinuousTest {
    last_block: Option<[u8; CONTINUOUS_TEST_BLOCK]>,
    failure_count: u64,
}

impl ContinuousTest {
    pub(crate) fn new() -> Self {
        Self {
            last_block: None,
            failure_count: 0,
        }
    }

    /// Returns false if `data` starts with the same block as the previous draw.
    pub(crate) fn test(&mut self, data: &[u8]) -> bool {
        if data.len() < CONTINUOUS_TEST_BLOCK {
            return true;
        }

        let mut block = [0u8; CONTINUOUS_TEST_BLOCK];
        block.copy_from_slice(&data[..CONTINUOUS_TEST_BLOCK]);

        if self.last_block == Some(block) {
            self.failure_count += 1;
            tracing::error!(
                failures = self.failure_count,
                "Continuous RNG test failed: identical consecutive blocks"
            );
            return false;
        }

        self.last_block = Some(block);
        true
    }

    pub(crate) fn failure_count(&self) -> u64 {
        self.failure_count
    }
}

pub struct SeedGenerator {
    rng: SystemRandom,
    continuous_test: Mutex<ContinuousTest>,
}

impl Default for SeedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedGenerator {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
            continuous_test: Mutex::new(ContinuousTest::new()),
        }
    }

    /// Fill `dest` from the system CSPRNG, rejecting repeated output.
    pub fn fill_bytes(&self, dest: &mut [u8]) -> EngineResult<()> {
        self.rng.fill(dest).map_err(|_| {
            EngineError::HardwareCommandFailed("system random source unavailable".to_string())
        })?;

        let mut test = self
            .continuous_test
            .lock()
            .map_err(|_| EngineError::HardwareCommandFailed("RNG state poisoned".to_string()))?;
        if !test.test(dest) {
            return Err(EngineError::HardwareCommandFailed(
                "random source produced repeated output".to_string(),
            ));
        }
        Ok(())
    }

    pub fn seed(&self) -> EngineResult<PatternSeed> {
        let mut bytes = [0u8; 32];
        self.fill_bytes(&mut bytes)?;
        Ok(PatternSeed(bytes))
    }
}

lazy_static! {
    static ref GLOBAL_SEEDS: SeedGenerator = SeedGenerator::new();
}

/// Draw a fresh 256-bit seed from the process-wide generator.
pub fn generate_seed() -> EngineResult<PatternSeed> {
    GLOBAL_SEEDS.seed()
}

/// Shannon entropy of `data` in bits per byte (0.0 ..= 8.0)
pub fn calculate_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut counts = [0u64; 256];
    for &byte in data {
        counts[byte as usize] += 1;
    }

    let length = data.len() as f64;
    let mut entropy = 0.0;

    for &count in &counts {
        if count > 0 {
            let probability = count as f64 / length;
            entropy -= probability * probability.log2();
        }
    }

    entropy
}
